use crate::error::{Result, ServerError};
use crate::logging::AccessLogger;
use crate::server::connection::{serve_listener, Accept, ConnectionOptions, ListenerContext};
use crate::server::listener_group::{group_by_port, ListenerGroup, PreparedGroup};
use crate::server::request_handler::RequestHandler;
use crate::server::shutdown::Shutdown;
use crate::site::Site;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Serves every added site, sharing one listener between the sites of each port.
///
/// ```no_run
/// use sitemux::{handler::Respond, headers::RedirectToHttps, Server, Site};
///
/// # async fn run() -> Result<(), sitemux::ServerError> {
/// let mut redirector = Site::new("example.com", 80);
/// redirector.always(RedirectToHttps);
///
/// let mut site = Site::secure("example.com", 443, "cert.pem", "key.pem");
/// site.equals(Respond::text("home"), ["/", "/index.html"]);
///
/// Server::new().add(redirector).add(site).serve().await
/// # }
/// ```
pub struct Server {
    sites: Vec<Arc<Site>>,
    bind_address: IpAddr,
    drain_timeout: Duration,
    options: ConnectionOptions,
    access_logger: Option<Arc<AccessLogger>>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            sites: Vec::new(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            drain_timeout: Duration::from_secs(10),
            options: ConnectionOptions::default(),
            access_logger: None,
        }
    }

    pub fn from_sites<I: IntoIterator<Item = Site>>(sites: I) -> Self {
        sites.into_iter().fold(Self::new(), Self::add)
    }

    /// Adds a site. Its routes can no longer change afterwards.
    pub fn add(mut self, site: Site) -> Self {
        self.sites.push(Arc::new(site));
        self
    }

    /// Address every listener binds to; all interfaces by default.
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// How long open connections may take to finish once shutdown starts.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_access_logger(mut self, logger: AccessLogger) -> Self {
        self.access_logger = Some(Arc::new(logger));
        self
    }

    pub fn sites(&self) -> &[Arc<Site>] {
        &self.sites
    }

    pub fn listener_groups(&self) -> Vec<ListenerGroup> {
        group_by_port(&self.sites)
    }

    /// Validates every port group and loads every certificate without
    /// binding anything.
    pub fn check(&self) -> Result<Vec<PreparedGroup>> {
        if self.sites.is_empty() {
            return Err(ServerError::NoSites);
        }

        self.listener_groups()
            .iter()
            .map(ListenerGroup::prepare)
            .collect()
    }

    /// Validates every group, then binds one socket per port.
    ///
    /// Nothing is bound unless every group is valid, and nothing is served
    /// until [`BoundServer::run`]. Sockets bound before a failing bind are
    /// closed again.
    pub async fn bind(self) -> Result<BoundServer> {
        let groups = self.check()?;

        let mut listeners = Vec::with_capacity(groups.len());
        for group in groups {
            let addr = SocketAddr::new(self.bind_address, group.port());
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ServerError::Bind { addr, source })?;
            let local_addr = listener
                .local_addr()
                .map_err(|source| ServerError::Bind { addr, source })?;

            info!(
                address = %local_addr,
                mode = %group.mode(),
                sites = ?group.site_names(),
                "Listener bound"
            );

            listeners.push(BoundListener {
                listener,
                local_addr,
                group,
            });
        }

        Ok(BoundServer {
            listeners,
            drain_timeout: self.drain_timeout,
            options: self.options,
            access_logger: self.access_logger,
        })
    }

    /// Serves until a listener fails, returning that failure.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serves until `signal` completes or a listener fails.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.bind().await?.run(signal).await
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

struct BoundListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    group: PreparedGroup,
}

/// A server whose sockets are bound but not yet accepting.
pub struct BoundServer {
    listeners: Vec<BoundListener>,
    drain_timeout: Duration,
    options: ConnectionOptions,
    access_logger: Option<Arc<AccessLogger>>,
}

impl BoundServer {
    /// Configured port and actual address of every listener, in startup order.
    pub fn local_addrs(&self) -> Vec<(u16, SocketAddr)> {
        self.listeners
            .iter()
            .map(|bound| (bound.group.port(), bound.local_addr))
            .collect()
    }

    /// The actual address of the listener for a configured port.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|bound| bound.group.port() == port)
            .map(|bound| bound.local_addr)
    }

    /// Starts one task per listener and waits for `signal` or the first
    /// listener failure. Either way every listener is then told to stop and
    /// open connections get the drain timeout to finish.
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listeners: Vec<(TcpListener, PreparedGroup)> = self
            .listeners
            .into_iter()
            .map(|bound| (bound.listener, bound.group))
            .collect();
        let settings = RunSettings {
            drain_timeout: self.drain_timeout,
            options: self.options,
            access_logger: self.access_logger,
        };
        run_listeners(listeners, settings, signal).await
    }
}

struct RunSettings {
    drain_timeout: Duration,
    options: ConnectionOptions,
    access_logger: Option<Arc<AccessLogger>>,
}

async fn run_listeners<L, F>(
    listeners: Vec<(L, PreparedGroup)>,
    settings: RunSettings,
    signal: F,
) -> Result<()>
where
    L: Accept,
    F: Future<Output = ()>,
{
    let shutdown = Shutdown::new();
    let mut tasks = JoinSet::new();

    for (listener, group) in listeners {
        let context = ListenerContext {
            port: group.port(),
            mode: group.mode(),
            acceptor: group.acceptor().cloned(),
            handler: Arc::new(RequestHandler::new(
                group.port(),
                group.handler().clone(),
                settings.access_logger.clone(),
            )),
            options: settings.options,
        };
        tasks.spawn(serve_listener(listener, context, shutdown.subscribe()));
    }

    info!(listeners = tasks.len(), "Server started");

    tokio::pin!(signal);
    let outcome = loop {
        tokio::select! {
            _ = &mut signal => {
                info!("Shutdown requested");
                break Ok(());
            }
            joined = tasks.join_next() => match joined {
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => {
                    error!("Listener failed, stopping server: {}", e);
                    break Err(e);
                }
                Some(Err(e)) => {
                    error!("Listener task failed, stopping server: {}", e);
                    break Err(ServerError::TaskFailed(e.to_string()));
                }
                None => break Ok(()),
            },
        }
    };

    shutdown.trigger();
    let drained = tokio::time::timeout(settings.drain_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            timeout_secs = settings.drain_timeout.as_secs(),
            remaining = tasks.len(),
            "Connections still open after drain timeout, aborting"
        );
        tasks.shutdown().await;
    }

    info!("Server stopped");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Respond;
    use futures::future::BoxFuture;
    use std::io;
    use tokio::net::TcpStream;

    enum TestListener {
        Real(TcpListener),
        Failing(io::ErrorKind),
        Panicking,
    }

    impl Accept for TestListener {
        fn accept(&mut self) -> BoxFuture<'_, io::Result<(TcpStream, SocketAddr)>> {
            match self {
                TestListener::Real(listener) => Box::pin(TcpListener::accept(listener)),
                TestListener::Failing(kind) => {
                    let kind = *kind;
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(io::Error::from(kind))
                    })
                }
                TestListener::Panicking => Box::pin(explode()),
            }
        }
    }

    async fn explode() -> io::Result<(TcpStream, SocketAddr)> {
        panic!("accept exploded")
    }

    fn groups(ports: &[u16]) -> Vec<PreparedGroup> {
        let sites: Vec<Arc<Site>> = ports
            .iter()
            .map(|&port| {
                let mut site = Site::new(format!("site{port}.test"), port);
                site.always(Respond::text("ok"));
                Arc::new(site)
            })
            .collect();
        group_by_port(&sites)
            .iter()
            .map(|group| group.prepare().unwrap())
            .collect()
    }

    fn settings() -> RunSettings {
        RunSettings {
            drain_timeout: Duration::from_secs(1),
            options: ConnectionOptions::default(),
            access_logger: None,
        }
    }

    #[tokio::test]
    async fn test_failing_listener_stops_the_others() {
        let real = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = real.local_addr().unwrap();
        let groups = groups(&[8001, 8002]);

        let listeners = vec![
            (TestListener::Real(real), groups[0].clone()),
            (TestListener::Failing(io::ErrorKind::InvalidInput), groups[1].clone()),
        ];
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_listeners(listeners, settings(), std::future::pending()),
        )
        .await
        .unwrap();

        match result {
            Err(ServerError::Listener { port, source }) => {
                assert_eq!(port, 8002);
                assert_eq!(source.kind(), io::ErrorKind::InvalidInput);
            }
            other => panic!("expected Listener error, got {:?}", other),
        }

        // The healthy listener was shut down and its socket closed.
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_transient_accept_errors_do_not_stop_serving() {
        let groups = groups(&[8003]);
        let listeners = vec![(
            TestListener::Failing(io::ErrorKind::ConnectionAborted),
            groups[0].clone(),
        )];

        let result = run_listeners(
            listeners,
            settings(),
            tokio::time::sleep(Duration::from_millis(300)),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_listener_is_reported() {
        let groups = groups(&[8004]);
        let listeners = vec![(TestListener::Panicking, groups[0].clone())];

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_listeners(listeners, settings(), std::future::pending()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ServerError::TaskFailed(_))));
    }
}
