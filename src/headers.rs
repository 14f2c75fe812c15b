//! Caching headers and scheme redirects.

use crate::handler::{Handler, RequestBody, ResponseBody};
use crate::proxy::request_host;
use crate::server::response::{ErrorResponse, ResponseBuilder};
use futures::future::BoxFuture;
use http::header::{CACHE_CONTROL, EXPIRES, LAST_MODIFIED, PRAGMA, VARY};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use std::time::{Duration, SystemTime};

/// 366 days, long enough to cover a leap year.
pub const ONE_YEAR: Duration = Duration::from_secs(60 * 60 * 24 * 366);

/// Tells clients not to cache the response.
pub fn do_not_cache(headers: &mut HeaderMap) {
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
}

/// Tells clients they may cache the response for `duration`.
pub fn cache(headers: &mut HeaderMap, modified: Option<SystemTime>, duration: Duration) {
    if let Some(modified) = modified {
        set_date(headers, LAST_MODIFIED, modified);
    }
    set_date(headers, EXPIRES, SystemTime::now() + duration);
    headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
}

fn set_date(headers: &mut HeaderMap, name: http::header::HeaderName, time: SystemTime) {
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(time)) {
        headers.insert(name, value);
    }
}

/// Adds [`do_not_cache`] headers to every response of the inner handler.
pub struct NoCache<H> {
    inner: H,
}

impl<H: Handler> NoCache<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H: Handler> Handler for NoCache<H> {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        let response = self.inner.serve(req);
        Box::pin(async move {
            let mut response = response.await;
            do_not_cache(response.headers_mut());
            response
        })
    }
}

/// Adds [`cache`] headers for a fixed duration to successful responses of the
/// inner handler, keeping any Last-Modified it set.
pub struct CacheFor<H> {
    inner: H,
    duration: Duration,
}

impl<H: Handler> CacheFor<H> {
    pub fn new(inner: H, duration: Duration) -> Self {
        Self { inner, duration }
    }
}

impl<H: Handler> Handler for CacheFor<H> {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        let response = self.inner.serve(req);
        let duration = self.duration;
        Box::pin(async move {
            let mut response = response.await;
            if response.status().is_success() {
                cache(response.headers_mut(), None, duration);
            }
            response
        })
    }
}

/// Redirects to the same host and path over HTTPS.
///
/// Serving this on an HTTPS site redirects forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedirectToHttps;

/// Redirects to the same host and path over plain HTTP.
///
/// Serving this on a plain HTTP site redirects forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedirectToHttp;

impl Handler for RedirectToHttps {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        let response = redirect(&req, "https");
        Box::pin(async move { response })
    }
}

impl Handler for RedirectToHttp {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        let response = redirect(&req, "http");
        Box::pin(async move { response })
    }
}

fn redirect<B>(req: &Request<B>, scheme: &str) -> Response<ResponseBody> {
    let Some(host) = request_host(req) else {
        return ErrorResponse::bad_request().build();
    };
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    ResponseBuilder::new(StatusCode::MOVED_PERMANENTLY)
        .header_string("location", format!("{scheme}://{host}{path}"))
        .header("content-length", "0")
        .build()
}
