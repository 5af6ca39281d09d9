use crate::config::{ServerConfig, TlsFiles};
use crate::service::ShellService;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remsh_transport::{Body, Credentials, Endpoint, Message};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "remsh-server")]
#[command(about = "remsh remote shell endpoint", long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Accept authenticated sessions until interrupted.
    Serve {
        #[arg(short, long, default_value = "/etc/remsh/server.toml")]
        config: PathBuf,
        /// Overrides the configured listen URI.
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Log in to a server and send one ping.
    Ping {
        #[arg(short, long)]
        connect: String,
        #[arg(short, long)]
        user: String,
        #[arg(short, long, env = "REMSH_PASSWORD")]
        password: String,
        /// CA bundle for `tls://` and `ssl://` servers.
        #[arg(long)]
        ca: Option<PathBuf>,
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,
    },
}

impl Cli {
    /// Whether JSON logs were requested on the command line or in the config.
    pub fn wants_json_logs(&self) -> bool {
        if self.json_logs {
            return true;
        }
        match &self.command {
            Command::Serve { config, .. } => ServerConfig::from_file(config)
                .map(|c| c.json_logs)
                .unwrap_or(false),
            Command::Ping { .. } => false,
        }
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve { config, listen } => serve(config, listen).await,
            Command::Ping {
                connect,
                user,
                password,
                ca,
                timeout_ms,
            } => ping(&connect, user, password, ca, Duration::from_millis(timeout_ms)).await,
        }
    }
}

async fn serve(config_path: PathBuf, listen: Option<String>) -> Result<()> {
    let config = if config_path.exists() {
        ServerConfig::from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", config_path.display());
        ServerConfig::default()
    };
    let listen = listen.unwrap_or_else(|| config.listen.clone());
    if config.users.is_empty() {
        tracing::warn!("no users configured, every login will be rejected");
    }

    let mut builder = Endpoint::builder()
        .session_config(config.session.clone())
        .scheduler_config(config.scheduler.clone());
    if let Some(tls) = config.tls_config()? {
        builder = builder.tls(tls);
    }
    let endpoint = builder.build().context("building endpoint")?;

    let service = Arc::new(ShellService::new());
    let server = endpoint
        .bind(&listen, Arc::new(config.authenticator()), Some(service.clone()))
        .await
        .with_context(|| format!("binding {}", listen))?;
    tracing::info!(location = %server.location(), "remsh server ready");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!(sessions = server.session_count(), "shutting down");
    server.close().await;

    let metrics = serde_json::to_string(&endpoint.metrics().snapshot())?;
    tracing::info!(served = service.served(), metrics = %metrics, "server stopped");
    Ok(())
}

async fn ping(uri: &str, user: String, password: String, ca: Option<PathBuf>, timeout: Duration) -> Result<()> {
    let mut builder = Endpoint::builder();
    if let Some(ca) = ca {
        let files = TlsFiles {
            ca,
            cert: None,
            key: None,
            require_client_auth: false,
        };
        builder = builder.tls(files.load()?);
    }
    let endpoint = builder.build()?;

    let transport = endpoint
        .connect(uri, None)
        .await
        .with_context(|| format!("connecting to {}", uri))?;
    transport
        .login(&Credentials::new(user, password.into_bytes()))
        .await
        .context("login failed")?;

    let started = std::time::Instant::now();
    let reply = transport
        .request(Message::request("ping", None), Some(timeout))
        .await
        .context("ping failed")?;
    let elapsed = started.elapsed();

    match reply.message().body() {
        Body::Response { body: Some(body), .. } => {
            println!("{} from {} in {:?}", String::from_utf8_lossy(body), uri, elapsed)
        }
        Body::Fault { reason } => anyhow::bail!("server fault: {}", reason),
        other => println!("{:?} from {} in {:?}", other.message_type(), uri, elapsed),
    }
    transport.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from(["remsh-server", "serve", "--config", "/tmp/s.toml", "--listen", "vm://x"]);
        match cli.command {
            Command::Serve { config, listen } => {
                assert_eq!(config, PathBuf::from("/tmp/s.toml"));
                assert_eq!(listen.as_deref(), Some("vm://x"));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_ping() {
        let cli = Cli::parse_from([
            "remsh-server",
            "--json-logs",
            "ping",
            "--connect",
            "tcp://127.0.0.1:7022",
            "--user",
            "alice",
            "--password",
            "secret",
        ]);
        assert!(cli.wants_json_logs());
        match cli.command {
            Command::Ping {
                connect,
                user,
                timeout_ms,
                ca,
                ..
            } => {
                assert_eq!(connect, "tcp://127.0.0.1:7022");
                assert_eq!(user, "alice");
                assert_eq!(timeout_ms, 10_000);
                assert!(ca.is_none());
            }
            _ => panic!("expected ping"),
        }
    }

    #[tokio::test]
    async fn test_ping_against_tcp_server() {
        let endpoint = Endpoint::builder().build().unwrap();
        let users = Arc::new(remsh_transport::StaticAuthenticator::new().with_user("alice", "secret"));
        let server = endpoint
            .bind("tcp://127.0.0.1:0", users, Some(Arc::new(ShellService::new())))
            .await
            .unwrap();
        let uri = format!("tcp://127.0.0.1:{}", server.location().port().unwrap());

        ping(&uri, "alice".into(), "secret".into(), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(ping(&uri, "alice".into(), "wrong".into(), None, Duration::from_secs(5))
            .await
            .is_err());
        server.close().await;
    }
}
