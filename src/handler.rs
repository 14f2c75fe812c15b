//! The handler capability every routing decision ends in.
//!
//! Sites, reverse proxies and leaf handlers all implement [`Handler`], so a
//! proxy can hold sites and a site can hold anything else.

use crate::server::response::{ErrorResponse, ResponseBuilder};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::sync::Arc;

/// Body of an inbound request, independent of the connection it arrived on.
pub type RequestBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Body of every response produced by a handler.
pub type ResponseBody = Full<Bytes>;

/// A handler shared between routes, sites and listeners.
pub type SharedHandler = Arc<dyn Handler>;

/// Serves one HTTP exchange.
pub trait Handler: Send + Sync + 'static {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        (**self).serve(req)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        (**self).serve(req)
    }
}

/// Adapts an async closure into a [`Handler`]. See [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps `f` so it can be registered anywhere a [`Handler`] is expected.
///
/// ```
/// use sitemux::handler::{handler_fn, ResponseBody};
/// use hyper::Response;
///
/// let hello = handler_fn(|_req| async { Response::new(ResponseBody::from("hello")) });
/// # let _ = hello;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<RequestBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<ResponseBody>> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request<RequestBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<ResponseBody>> + Send + 'static,
{
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        Box::pin((self.f)(req))
    }
}

/// Answers every request with the standard 404 page.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFound;

impl Handler for NotFound {
    fn serve(&self, _req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        Box::pin(async { ErrorResponse::not_found().build() })
    }
}

/// Answers every request with a fixed status, content type and body.
#[derive(Debug, Clone)]
pub struct Respond {
    status: StatusCode,
    content_type: String,
    body: Bytes,
}

impl Respond {
    pub fn new(status: StatusCode, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn text(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, "text/plain; charset=utf-8", body)
    }

    /// Serves the contents of `body` with `status`, used for custom not-found pages.
    pub fn html(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self::new(status, "text/html; charset=utf-8", body)
    }
}

impl Handler for Respond {
    fn serve(&self, _req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        let response = ResponseBuilder::new(self.status)
            .header("content-type", &self.content_type)
            .header_string("content-length", self.body.len().to_string())
            .body(self.body.clone())
            .build();
        Box::pin(async move { response })
    }
}

/// An empty request body, handy when building requests by hand.
pub fn empty_body() -> RequestBody {
    full_body(Bytes::new())
}

/// A request body holding `data`.
pub fn full_body(data: impl Into<Bytes>) -> RequestBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}
