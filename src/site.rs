//! Virtual hosts and their ordered path-matching chain.

use crate::handler::{Handler, NotFound, RequestBody, ResponseBody, SharedHandler};
use futures::future::BoxFuture;
use hyper::{Request, Response};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Predicate over a request path.
pub type MatchFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// One entry of a site's routing chain.
#[derive(Clone)]
pub struct Matcher {
    predicate: MatchFn,
    handler: SharedHandler,
}

impl Matcher {
    pub fn new(predicate: MatchFn, handler: SharedHandler) -> Self {
        Self { predicate, handler }
    }

    pub fn matches(&self, path: &str) -> bool {
        (self.predicate)(path)
    }

    pub fn handler(&self) -> &SharedHandler {
        &self.handler
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher").finish_non_exhaustive()
    }
}

/// Certificate and private key files for a secured site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// A named virtual host bound to a port.
///
/// Handlers are tried in the order they were registered; the first whose
/// pattern matches the request path serves the request. Requests that match
/// nothing go to the not-found handler.
///
/// ```
/// use sitemux::{handler::Respond, Site};
///
/// let mut site = Site::new("example.com", 8080);
/// site.has_prefix(Respond::text("image"), ["/img/"])
///     .always(Respond::text("page"));
/// assert_eq!(site.matchers().len(), 2);
/// ```
pub struct Site {
    name: String,
    port: u16,
    credentials: Option<Credentials>,
    http2: bool,
    matchers: Vec<Matcher>,
    not_found: SharedHandler,
}

impl Site {
    /// Builds a plain HTTP site.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            credentials: None,
            http2: false,
            matchers: Vec::new(),
            not_found: Arc::new(NotFound),
        }
    }

    /// Builds an HTTPS site served with the given certificate and key files.
    pub fn secure(
        name: impl Into<String>,
        port: u16,
        certificate: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
    ) -> Self {
        let mut site = Self::new(name, port);
        site.credentials = Some(Credentials {
            certificate: certificate.into(),
            private_key: private_key.into(),
        });
        site
    }

    /// Replaces the handler used when no matcher accepts the path.
    pub fn with_not_found<H: Handler>(mut self, handler: H) -> Self {
        self.not_found = Arc::new(handler);
        self
    }

    /// Offers HTTP/2 through ALPN on this site's TLS listener.
    pub fn with_http2(mut self, enabled: bool) -> Self {
        self.http2 = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn http2(&self) -> bool {
        self.http2
    }

    pub fn matchers(&self) -> &[Matcher] {
        &self.matchers
    }

    /// Uses `handler` for every request.
    pub fn always<H: Handler>(&mut self, handler: H) -> &mut Self {
        self.matching(handler, |_| true)
    }

    /// Uses `handler` when the path is exactly one of `patterns`.
    pub fn equals<H, I, P>(&mut self, handler: H, patterns: I) -> &mut Self
    where
        H: Handler,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.push_patterns(handler, patterns, |pattern, path| path == pattern)
    }

    /// Uses `handler` when the path equals one of `patterns`, ignoring case.
    pub fn equal_fold<H, I, P>(&mut self, handler: H, patterns: I) -> &mut Self
    where
        H: Handler,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.push_patterns(handler, patterns, |pattern, path| {
            pattern
                .chars()
                .flat_map(char::to_lowercase)
                .eq(path.chars().flat_map(char::to_lowercase))
        })
    }

    /// Uses `handler` when the path contains one of `patterns`.
    pub fn contains<H, I, P>(&mut self, handler: H, patterns: I) -> &mut Self
    where
        H: Handler,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.push_patterns(handler, patterns, |pattern, path| path.contains(pattern))
    }

    /// Uses `handler` when the path starts with one of `patterns`.
    pub fn has_prefix<H, I, P>(&mut self, handler: H, patterns: I) -> &mut Self
    where
        H: Handler,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.push_patterns(handler, patterns, |pattern, path| path.starts_with(pattern))
    }

    /// Uses `handler` when the path ends with one of `patterns`.
    pub fn has_suffix<H, I, P>(&mut self, handler: H, patterns: I) -> &mut Self
    where
        H: Handler,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.push_patterns(handler, patterns, |pattern, path| path.ends_with(pattern))
    }

    /// Uses `handler` when `predicate` accepts the path.
    pub fn matching<H, F>(&mut self, handler: H, predicate: F) -> &mut Self
    where
        H: Handler,
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.matchers
            .push(Matcher::new(Arc::new(predicate), Arc::new(handler)));
        self
    }

    /// The handler the chain selects for `path`.
    pub fn route(&self, path: &str) -> &SharedHandler {
        self.matchers
            .iter()
            .find(|matcher| matcher.matches(path))
            .map(Matcher::handler)
            .unwrap_or(&self.not_found)
    }

    fn push_patterns<H, I, P>(
        &mut self,
        handler: H,
        patterns: I,
        compare: fn(&str, &str) -> bool,
    ) -> &mut Self
    where
        H: Handler,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let handler: SharedHandler = Arc::new(handler);
        for pattern in patterns {
            let pattern: String = pattern.into();
            let predicate: MatchFn = Arc::new(move |path: &str| compare(&pattern, path));
            self.matchers.push(Matcher::new(predicate, handler.clone()));
        }
        self
    }
}

impl Handler for Site {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        let handler = self.route(req.uri().path());
        tracing::debug!(site = %self.name, path = %req.uri().path(), "Routing request");
        handler.serve(req)
    }
}

impl fmt::Debug for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Site")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .field("http2", &self.http2)
            .field("matchers", &self.matchers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{empty_body, Respond};
    use http_body_util::BodyExt;
    use hyper::StatusCode;

    async fn get(site: &Site, path: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(path).body(empty_body()).unwrap();
        let response = site.serve(req).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let mut site = Site::new("example.com", 80);
        site.has_prefix(Respond::text("B"), ["/img/"])
            .always(Respond::text("C"));

        assert_eq!(get(&site, "/img/logo.png").await.1, "B");
        assert_eq!(get(&site, "/about").await.1, "C");
    }

    #[tokio::test]
    async fn test_registration_order_is_kept() {
        let mut site = Site::new("example.com", 80);
        site.always(Respond::text("first"))
            .has_prefix(Respond::text("second"), ["/img/"]);

        assert_eq!(get(&site, "/img/logo.png").await.1, "first");
    }

    #[tokio::test]
    async fn test_unmatched_path_gets_standard_not_found() {
        let mut site = Site::new("example.com", 80);
        site.equals(Respond::text("home"), ["/", "/index.html"]);

        let (status, _) = get(&site, "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(get(&site, "/index.html").await.1, "home");
    }

    #[tokio::test]
    async fn test_custom_not_found() {
        let site = Site::new("example.com", 80)
            .with_not_found(Respond::new(StatusCode::GONE, "text/plain", "gone"));

        assert_eq!(get(&site, "/anything").await, (StatusCode::GONE, "gone".to_string()));
    }

    #[test]
    fn test_one_matcher_per_pattern() {
        let mut site = Site::new("example.com", 80);
        site.has_suffix(Respond::text("style"), [".css", ".scss"]);
        site.contains(Respond::text("none"), Vec::<String>::new());

        assert_eq!(site.matchers().len(), 2);
    }

    #[test]
    fn test_predicates() {
        let mut site = Site::new("example.com", 80);
        site.equals(Respond::text("eq"), ["/a"])
            .equal_fold(Respond::text("fold"), ["/ReadMe"])
            .contains(Respond::text("has"), ["admin"])
            .has_prefix(Respond::text("pre"), ["/static/"])
            .has_suffix(Respond::text("suf"), [".png"])
            .matching(Respond::text("custom"), |path| path.len() > 20);

        let matched: Vec<usize> = ["/a", "/readme", "/x/admin/y", "/static/x", "/x.png", "/aaaaaaaaaaaaaaaaaaaaaa"]
            .iter()
            .map(|path| {
                site.matchers()
                    .iter()
                    .position(|m| m.matches(path))
                    .unwrap()
            })
            .collect();

        assert_eq!(matched, vec![0, 1, 2, 3, 4, 5]);
        assert!(!site.matchers()[0].matches("/a/"));
        assert!(!site.matchers()[3].matches("/stat"));
    }

    #[test]
    fn test_secure_site() {
        let site = Site::secure("example.com", 443, "cert.pem", "key.pem").with_http2(true);
        assert!(site.is_secure());
        assert!(site.http2());
        assert_eq!(
            site.credentials().unwrap().certificate,
            PathBuf::from("cert.pem")
        );
        assert!(!Site::new("example.com", 80).is_secure());
    }
}
