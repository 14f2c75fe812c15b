//! Host-based routing between the sites that share one listener.
//!
//! Routing is a textual suffix match of the request host against the
//! registered domains: `api.example.com` and `evilexample.com` both match
//! `example.com`. When several domains are suffixes of the host, the longest
//! one wins.

use crate::error::{Result, ServerError};
use crate::handler::{Handler, NotFound, RequestBody, ResponseBody, SharedHandler};
use crate::site::Site;
use futures::future::BoxFuture;
use hyper::header::HOST;
use hyper::{Request, Response};
use std::sync::Arc;

/// Routes requests to handlers by the domain suffix of their host.
///
/// Registrations happen before serving starts; afterwards the proxy is only
/// read, so it can be shared between connections without locking.
pub struct ReverseProxy {
    // Longest domain first, so the first suffix hit is the longest one.
    routes: Vec<(String, SharedHandler)>,
    not_found: SharedHandler,
}

impl ReverseProxy {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            not_found: Arc::new(NotFound),
        }
    }

    pub fn with_not_found<H: Handler>(mut self, handler: H) -> Self {
        self.not_found = Arc::new(handler);
        self
    }

    /// Routes hosts ending in `domain` to `handler`.
    ///
    /// Registering the same domain twice fails with
    /// [`ServerError::DuplicateDomain`].
    pub fn register<H: Handler>(&mut self, domain: impl Into<String>, handler: H) -> Result<()> {
        self.insert(domain.into(), Arc::new(handler))
    }

    /// Routes hosts ending in the site's name to the site.
    pub fn register_site(&mut self, site: Arc<Site>) -> Result<()> {
        let domain = site.name().to_string();
        self.insert(domain, site)
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(domain, _)| domain.as_str())
    }

    /// The handler selected for a raw host value, port included.
    pub fn route(&self, host: Option<&str>) -> &SharedHandler {
        let Some(host) = host.and_then(split_host) else {
            return &self.not_found;
        };

        self.routes
            .iter()
            .find(|(domain, _)| host.ends_with(domain.as_str()))
            .map(|(_, handler)| handler)
            .unwrap_or(&self.not_found)
    }

    fn insert(&mut self, domain: String, handler: SharedHandler) -> Result<()> {
        if self.routes.iter().any(|(existing, _)| *existing == domain) {
            return Err(ServerError::DuplicateDomain(domain));
        }

        let position = self
            .routes
            .iter()
            .position(|(existing, _)| existing.len() < domain.len())
            .unwrap_or(self.routes.len());
        self.routes.insert(position, (domain, handler));
        Ok(())
    }
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for ReverseProxy {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        let handler = self.route(request_host(&req));
        handler.serve(req)
    }
}

/// The target host of a request: the Host header, or the URI authority for
/// HTTP/2 requests that carry none.
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    match req.headers().get(HOST) {
        Some(value) => value.to_str().ok(),
        None => req.uri().authority().map(|authority| authority.as_str()),
    }
}

/// Strips the port from `host:port`. Returns `None` when the value cannot be
/// split.
pub fn split_host(host: &str) -> Option<&str> {
    if !host.contains(':') {
        return Some(host);
    }

    let (name, port) = if let Some(rest) = host.strip_prefix('[') {
        let (name, after) = rest.split_once(']')?;
        (name, after.strip_prefix(':')?)
    } else {
        let (name, port) = host.split_once(':')?;
        if name.contains('[') || name.contains(']') {
            return None;
        }
        (name, port)
    };

    // The port itself is not validated; named ports such as `:http` split fine.
    if port.contains(':') || port.contains('[') || port.contains(']') {
        return None;
    }

    Some(name)
}
