use crate::handler::{ResponseBody, SharedHandler};
use crate::logging::{AccessLogger, LogEntry};
use crate::proxy::request_host;
use http_body_util::BodyExt;
use hyper::{body::Incoming, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Entry point of every exchange on one listener: hands the request to the
/// listener's handler and records the outcome.
pub struct RequestHandler {
    port: u16,
    handler: SharedHandler,
    access_logger: Option<Arc<AccessLogger>>,
}

impl RequestHandler {
    pub fn new(port: u16, handler: SharedHandler, access_logger: Option<Arc<AccessLogger>>) -> Self {
        Self {
            port,
            handler,
            access_logger,
        }
    }

    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<ResponseBody> {
        let request_id = Uuid::new_v4();
        let start_time = std::time::Instant::now();

        let method = req.method().clone();
        let uri = req.uri().clone();
        let host = request_host(&req).map(str::to_string);

        let user_agent = req
            .headers()
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        let referer = req
            .headers()
            .get("referer")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        let mut req = req.map(|body| body.boxed_unsync());
        req.extensions_mut().insert(client_addr);

        let response = self.handler.serve(req).await;
        let duration = start_time.elapsed();

        tracing::info!(
            request_id = %request_id,
            port = self.port,
            host = host.as_deref().unwrap_or("-"),
            method = %method,
            path = %uri.path(),
            status = %response.status(),
            duration_ms = duration.as_millis() as u64,
            "Request completed"
        );

        if let Some(ref access_logger) = self.access_logger {
            let content_length = response
                .headers()
                .get("content-length")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);

            let log_entry = LogEntry {
                request_id,
                remote_addr: client_addr.ip().to_string(),
                host,
                method: method.to_string(),
                uri: uri.to_string(),
                status: response.status().as_u16(),
                response_size: content_length,
                duration_ms: duration.as_secs_f64() * 1000.0,
                user_agent,
                referer,
                timestamp: chrono::Utc::now(),
            };

            access_logger.log(log_entry).await;
        }

        response
    }
}
