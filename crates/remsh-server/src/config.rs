use anyhow::Context;
use remsh_transport::{SchedulerConfig, SessionConfig, StaticAuthenticator, TlsConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One account accepted by the static authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
}

/// PEM files for the `tls` and `ssl` schemes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub require_client_auth: bool,
}

impl TlsFiles {
    pub fn load(&self) -> anyhow::Result<TlsConfig> {
        TlsConfig::from_files(
            &self.ca,
            self.cert.as_deref(),
            self.key.as_deref(),
            self.require_client_auth,
        )
        .with_context(|| format!("loading TLS material from {}", self.ca.display()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub json_logs: bool,
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub users: Vec<UserEntry>,
    pub tls: Option<TlsFiles>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: String::from("tcp://0.0.0.0:7022"),
            json_logs: false,
            session: SessionConfig::default(),
            scheduler: SchedulerConfig::default(),
            users: Vec::new(),
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ServerConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ServerConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn authenticator(&self) -> StaticAuthenticator {
        self.users
            .iter()
            .fold(StaticAuthenticator::new(), |auth, user| {
                auth.with_user(user.username.clone(), user.password.clone().into_bytes())
            })
    }

    pub fn tls_config(&self) -> anyhow::Result<Option<TlsConfig>> {
        self.tls.as_ref().map(TlsFiles::load).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "tcp://0.0.0.0:7022");
        assert!(!config.json_logs);
        assert_eq!(config.session, SessionConfig::default());
        assert!(config.users.is_empty());
        assert!(config.tls.is_none());
        assert!(config.tls_config().unwrap().is_none());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
listen = "vm://shell"
json_logs = true

[session]
handshake_timeout_ms = 2500
request_timeout_ms = 1000

[scheduler]
workers = 2

[[users]]
username = "alice"
password = "secret"

[[users]]
username = "bob"
password = "hunter2"
            "#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen, "vm://shell");
        assert!(config.json_logs);
        assert_eq!(config.session.handshake_timeout_ms, 2500);
        assert_eq!(config.session.login_timeout_ms, 5000);
        assert_eq!(config.session.request_timeout_ms, 1000);
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.purge_interval_ms, 60_000);
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.authenticator().len(), 2);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "listen": "tls://127.0.0.1:7443",
                "users": [{{ "username": "alice", "password": "secret" }}],
                "tls": {{ "ca": "/etc/remsh/ca.pem", "cert": "/etc/remsh/cert.pem", "key": "/etc/remsh/key.pem" }}
            }}"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen, "tls://127.0.0.1:7443");
        let tls = config.tls.as_ref().unwrap();
        assert_eq!(tls.ca, PathBuf::from("/etc/remsh/ca.pem"));
        assert!(!tls.require_client_auth);
        // the files do not exist
        assert!(config.tls_config().is_err());
    }

    #[test]
    fn test_tls_files_load() {
        let dir = tempfile::tempdir().unwrap();
        let (ca, ca_key) = remsh_transport::tls::generate_self_signed_ca().unwrap();
        let (cert, key) = remsh_transport::tls::generate_signed_cert(&ca, &ca_key, "localhost").unwrap();
        std::fs::write(dir.path().join("ca.pem"), &ca).unwrap();
        std::fs::write(dir.path().join("cert.pem"), &cert).unwrap();
        std::fs::write(dir.path().join("key.pem"), &key).unwrap();

        let files = TlsFiles {
            ca: dir.path().join("ca.pem"),
            cert: Some(dir.path().join("cert.pem")),
            key: Some(dir.path().join("key.pem")),
            require_client_auth: true,
        };
        let tls = files.load().unwrap();
        assert_eq!(tls.ca_cert_pem, ca);
        assert!(tls.require_client_auth);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ServerConfig::from_file(file.path()).is_err());
    }
}
