pub mod connection;
pub mod http_server;
pub mod listener_group;
pub mod request_handler;
pub mod response;
pub mod shutdown;
pub mod static_files;
pub mod tls;

pub use connection::ConnectionOptions;
pub use http_server::{BoundServer, Server};
pub use listener_group::{group_by_port, ListenerGroup, ListenerMode, PreparedGroup};
pub use request_handler::RequestHandler;
pub use response::{ErrorResponse, ResponseBuilder};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use static_files::StaticFiles;
pub use tls::SniResolver;
