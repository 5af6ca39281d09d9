#![warn(missing_docs)]

//! remsh transport subsystem: framed sessions over TCP, TLS and in-process
//! pipes, with a handshake/login gate and request/response correlation.

pub mod attributes;
pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod rpc;
pub mod scheduler;
pub mod security;
pub mod session;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod tls_tcp;
pub mod transport;
pub mod vm;

pub use attributes::{AttributeKey, AttributeStore};
pub use config::SessionConfig;
pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{FrameError, Result, TransportError};
pub use handler::{Action, MessageVisitor, ProtocolHandler, Stage};
pub use message::{Body, Message, MessageId, MessageType, ResponseKind, StreamKind};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use rpc::{RequestHandle, Requestor, ResponseHandle};
pub use scheduler::{SchedulerConfig, TimeoutHandle, TimeoutScheduler};
pub use security::{Credentials, LoginToken, SecurityGate, StaticAuthenticator, UserAuthenticator};
pub use session::{CloseReason, Role, SecurityState, Session, SessionId};
pub use stream::SessionStream;
pub use tls::TlsConfig;
pub use transport::{parse_uri, Transport, TransportFactory, TransportFactoryLocator, TransportServer};
