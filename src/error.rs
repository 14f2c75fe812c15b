use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while configuring or running a [`Server`](crate::Server).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no sites have been added to the server")]
    NoSites,

    #[error("sites on port {port} mix HTTPS ({secure:?}) and plain HTTP ({plain:?})")]
    MixedTls {
        port: u16,
        secure: Vec<String>,
        plain: Vec<String>,
    },

    #[error("domain {0:?} is already registered")]
    DuplicateDomain(String),

    #[error("failed to load certificate for site {site} from {}", path.display())]
    Certificate {
        site: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TLS material for site {site}")]
    Tls {
        site: String,
        #[source]
        source: rustls::Error,
    },

    #[error("failed to bind to {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("listener on port {port} failed")]
    Listener {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("listener task failed: {0}")]
    TaskFailed(String),
}

impl ServerError {
    /// Whether the error was detected while setting up, before any request was served.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, ServerError::Listener { .. } | ServerError::TaskFailed(_))
    }
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
