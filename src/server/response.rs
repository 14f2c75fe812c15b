use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header_string(mut self, name: &str, value: String) -> Self {
        self.headers.push((name.to_string(), value));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;

        for (name, value) in self.headers {
            match (
                hyper::header::HeaderName::from_bytes(name.as_bytes()),
                hyper::header::HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => tracing::warn!(header = %name, "Dropping invalid response header"),
            }
        }

        response
    }
}

pub struct ErrorResponse;

impl ErrorResponse {
    pub fn bad_request() -> ResponseBuilder {
        Self::page(StatusCode::BAD_REQUEST, "The request could not be understood.")
    }

    pub fn forbidden() -> ResponseBuilder {
        Self::page(StatusCode::FORBIDDEN, "Access denied.")
    }

    pub fn not_found() -> ResponseBuilder {
        Self::page(
            StatusCode::NOT_FOUND,
            "The requested resource was not found on this server.",
        )
    }

    pub fn method_not_allowed() -> ResponseBuilder {
        Self::page(
            StatusCode::METHOD_NOT_ALLOWED,
            "The method is not allowed for this resource.",
        )
        .header("allow", "GET, HEAD")
    }

    pub fn internal_server_error() -> ResponseBuilder {
        Self::page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "The server encountered an internal error.",
        )
    }

    fn page(status: StatusCode, message: &str) -> ResponseBuilder {
        let reason = status.canonical_reason().unwrap_or("Error");
        let html = format!(
            "<!DOCTYPE html><html><head><title>{code} {reason}</title></head>\
             <body><h1>{reason}</h1><p>{message}</p><hr><small>sitemux</small></body></html>",
            code = status.as_u16(),
        );

        ResponseBuilder::new(status)
            .header("content-type", "text/html; charset=utf-8")
            .header_string("content-length", html.len().to_string())
            .body(Bytes::from(html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_page() {
        let response = ErrorResponse::not_found().build();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()["content-type"],
            "text/html; charset=utf-8"
        );
    }

    #[test]
    fn test_builder_keeps_repeated_headers() {
        let response = ResponseBuilder::new(StatusCode::OK)
            .header("vary", "Accept-Encoding")
            .header("vary", "Origin")
            .build();
        assert_eq!(response.headers().get_all("vary").iter().count(), 2);
    }

    #[test]
    fn test_builder_skips_invalid_header() {
        let response = ResponseBuilder::new(StatusCode::OK)
            .header("bad header", "value")
            .build();
        assert!(response.headers().is_empty());
    }
}
