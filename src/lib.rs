pub mod compression;
pub mod config;
pub mod error;
pub mod handler;
pub mod headers;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod site;
pub mod ssl_cert_gen;

// Re-export commonly used types
pub use config::Config;
pub use error::ServerError;
pub use handler::{Handler, SharedHandler};
pub use proxy::ReverseProxy;
pub use server::{BoundServer, Server};
pub use site::Site;
