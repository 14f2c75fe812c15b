use crate::error::ServerError;
use crate::handler::ResponseBody;
use crate::server::listener_group::ListenerMode;
use crate::server::request_handler::RequestHandler;
use crate::server::shutdown::ShutdownSignal;
use crate::server::tls::ALPN_HTTP2;
use anyhow::Result;
use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Per-connection settings shared by every listener of a server.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub tcp_nodelay: bool,
    pub keep_alive: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keep_alive: true,
        }
    }
}

/// Everything a listener task needs besides its socket.
#[derive(Clone)]
pub struct ListenerContext {
    pub port: u16,
    pub mode: ListenerMode,
    pub acceptor: Option<TlsAcceptor>,
    pub handler: Arc<RequestHandler>,
    pub options: ConnectionOptions,
}

/// hyper service handing each request of one connection to the listener's handler.
#[derive(Clone)]
struct ConnectionService {
    handler: Arc<RequestHandler>,
    client_addr: SocketAddr,
}

impl Service<Request<Incoming>> for ConnectionService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let handler = self.handler.clone();
        let client_addr = self.client_addr;
        Box::pin(async move { Ok(handler.handle_request(req, client_addr).await) })
    }
}

/// Source of incoming connections for one listener task.
pub(crate) trait Accept: Send + 'static {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(TcpStream, SocketAddr)>>;
}

impl Accept for TcpListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(TcpStream, SocketAddr)>> {
        Box::pin(TcpListener::accept(self))
    }
}

/// Accepts connections until shutdown is signalled or accepting fails for
/// good, then waits for the open connections to finish.
pub(crate) async fn serve_listener<L: Accept>(
    mut listener: L,
    context: ListenerContext,
    mut shutdown: ShutdownSignal,
) -> Result<(), ServerError> {
    let mut connections = JoinSet::new();
    let mut backoff: Option<Duration> = None;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(port = context.port, "Listener stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    backoff = None;
                    let context = context.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, context, shutdown).await {
                            debug!(peer_addr = %addr, "Connection error: {:#}", e);
                        }
                    });
                }
                Err(e) if is_transient(&e) => {
                    let delay = backoff
                        .map(|d| (d * 2).min(MAX_ACCEPT_BACKOFF))
                        .unwrap_or(MIN_ACCEPT_BACKOFF);
                    backoff = Some(delay);
                    warn!(port = context.port, retry_in_ms = delay.as_millis() as u64, "Failed to accept connection: {}", e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(port = context.port, "Listener failed: {}", e);
                    return Err(ServerError::Listener { port: context.port, source: e });
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    debug!(port = context.port, "All connections closed");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: ListenerContext,
    shutdown: ShutdownSignal,
) -> Result<()> {
    stream.set_nodelay(context.options.tcp_nodelay)?;

    let service = ConnectionService {
        handler: context.handler.clone(),
        client_addr: addr,
    };

    let Some(acceptor) = context.acceptor.as_ref().filter(|_| context.mode.is_tls()) else {
        debug!(peer_addr = %addr, "Serving HTTP/1.1");
        return serve_http1(TokioIo::new(stream), service, context.options, shutdown).await;
    };

    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| anyhow::anyhow!("TLS handshake failed: {}", e))?;

    let (_, session) = tls_stream.get_ref();
    let server_name = session.server_name().map(str::to_string);

    if session.alpn_protocol() == Some(ALPN_HTTP2) {
        debug!(peer_addr = %addr, server_name = ?server_name, "Negotiated HTTP/2");
        serve_http2(TokioIo::new(tls_stream), service, shutdown).await
    } else {
        debug!(peer_addr = %addr, server_name = ?server_name, "Using HTTP/1.1 over TLS");
        serve_http1(TokioIo::new(tls_stream), service, context.options, shutdown).await
    }
}

async fn serve_http1<I>(
    io: I,
    service: ConnectionService,
    options: ConnectionOptions,
    mut shutdown: ShutdownSignal,
) -> Result<()>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let conn = http1::Builder::new()
        .keep_alive(options.keep_alive)
        .serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.recv() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    result.map_err(|e| anyhow::anyhow!("HTTP/1.1 connection error: {}", e))
}

async fn serve_http2<I>(io: I, service: ConnectionService, mut shutdown: ShutdownSignal) -> Result<()>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let conn = http2::Builder::new(TokioExecutor::new()).serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.recv() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    result.map_err(|e| anyhow::anyhow!("HTTP/2 connection error: {}", e))
}

/// Accept errors that concern a single connection or a temporary shortage of
/// descriptors rather than the listening socket itself.
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)) {
        return true;
    }

    false
}
