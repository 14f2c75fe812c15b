//! Decides how each port is served.
//!
//! A port used by one site gets a listener dedicated to that site. A port
//! shared by several sites gets one listener fronted by a [`ReverseProxy`],
//! with a certificate per site selected through SNI when the sites use TLS.

use crate::error::{Result, ServerError};
use crate::handler::SharedHandler;
use crate::proxy::ReverseProxy;
use crate::server::tls;
use crate::site::Site;
use std::fmt;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// How a listener speaks to its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    Plain,
    Tls,
    /// TLS offering HTTP/2 alongside HTTP/1.1 through ALPN.
    TlsHttp2,
}

impl ListenerMode {
    pub fn is_tls(self) -> bool {
        !matches!(self, ListenerMode::Plain)
    }
}

impl fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerMode::Plain => f.write_str("http"),
            ListenerMode::Tls => f.write_str("https"),
            ListenerMode::TlsHttp2 => f.write_str("https+h2"),
        }
    }
}

/// The sites sharing one port.
#[derive(Debug, Clone)]
pub struct ListenerGroup {
    port: u16,
    sites: Vec<Arc<Site>>,
}

/// Splits `sites` by port, keeping the order in which each port first appears.
pub fn group_by_port(sites: &[Arc<Site>]) -> Vec<ListenerGroup> {
    let mut groups: Vec<ListenerGroup> = Vec::new();
    for site in sites {
        match groups.iter_mut().find(|group| group.port == site.port()) {
            Some(group) => group.sites.push(site.clone()),
            None => groups.push(ListenerGroup {
                port: site.port(),
                sites: vec![site.clone()],
            }),
        }
    }
    groups
}

impl ListenerGroup {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn sites(&self) -> &[Arc<Site>] {
        &self.sites
    }

    /// The listener mode for this group.
    ///
    /// Fails with [`ServerError::MixedTls`] when only some sites have
    /// credentials.
    pub fn mode(&self) -> Result<ListenerMode> {
        let (secure, plain): (Vec<_>, Vec<_>) =
            self.sites.iter().partition(|site| site.is_secure());

        if !secure.is_empty() && !plain.is_empty() {
            return Err(ServerError::MixedTls {
                port: self.port,
                secure: secure.iter().map(|site| site.name().to_string()).collect(),
                plain: plain.iter().map(|site| site.name().to_string()).collect(),
            });
        }

        Ok(if plain.len() == self.sites.len() {
            ListenerMode::Plain
        } else if self.sites.iter().any(|site| site.http2()) {
            ListenerMode::TlsHttp2
        } else {
            ListenerMode::Tls
        })
    }

    /// Validates the group and builds everything its listener needs, short of
    /// binding the socket.
    pub fn prepare(&self) -> Result<PreparedGroup> {
        let mode = self.mode()?;

        let handler: SharedHandler = match self.sites.as_slice() {
            [site] => site.clone() as SharedHandler,
            sites => {
                let mut proxy = ReverseProxy::new();
                for site in sites {
                    proxy.register_site(site.clone())?;
                }
                Arc::new(proxy)
            }
        };

        let acceptor = if mode.is_tls() {
            Some(tls::build_acceptor(
                &self.sites,
                mode == ListenerMode::TlsHttp2,
            )?)
        } else {
            None
        };

        let prepared = PreparedGroup {
            port: self.port,
            mode,
            site_names: self.sites.iter().map(|site| site.name().to_string()).collect(),
            handler,
            acceptor,
        };

        info!(
            port = prepared.port,
            mode = %prepared.mode,
            sites = ?prepared.site_names,
            "Listener group prepared"
        );

        Ok(prepared)
    }
}

/// A validated group, ready to be bound and served.
#[derive(Clone)]
pub struct PreparedGroup {
    port: u16,
    mode: ListenerMode,
    site_names: Vec<String>,
    handler: SharedHandler,
    acceptor: Option<TlsAcceptor>,
}

impl PreparedGroup {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mode(&self) -> ListenerMode {
        self.mode
    }

    pub fn site_names(&self) -> &[String] {
        &self.site_names
    }

    /// Whether requests go through a reverse proxy rather than straight to a site.
    pub fn is_multiplexed(&self) -> bool {
        self.site_names.len() > 1
    }

    pub fn handler(&self) -> &SharedHandler {
        &self.handler
    }

    pub fn acceptor(&self) -> Option<&TlsAcceptor> {
        self.acceptor.as_ref()
    }
}

impl fmt::Debug for PreparedGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedGroup")
            .field("port", &self.port)
            .field("mode", &self.mode)
            .field("site_names", &self.site_names)
            .finish_non_exhaustive()
    }
}
