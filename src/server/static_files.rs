use crate::handler::{Handler, RequestBody, ResponseBody};
use crate::server::response::{ErrorResponse, ResponseBuilder};
use anyhow::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use mime_guess::MimeGuess;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// Serves files below a root directory, using the request path as the
/// location relative to the root.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    index_files: Vec<String>,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_index_files(root, vec!["index.html".to_string()])
    }

    pub fn with_index_files(root: impl Into<PathBuf>, index_files: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                index_files,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

impl Handler for StaticFiles {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        let inner = self.inner.clone();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let headers = req.headers().clone();

        Box::pin(async move {
            match inner.serve_file(&method, &path, &headers).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(path = %path, "Rejected static file request: {}", e);
                    ErrorResponse::bad_request().build()
                }
            }
        })
    }
}

impl Inner {
    async fn serve_file(
        &self,
        method: &Method,
        request_path: &str,
        headers: &HeaderMap,
    ) -> Result<Response<ResponseBody>> {
        if method != Method::GET && method != Method::HEAD {
            return Ok(ErrorResponse::method_not_allowed().build());
        }

        let sanitized_path = sanitize_path(request_path)?;
        let full_path = self.root.join(&sanitized_path);

        debug!("Serving static file: {}", full_path.display());

        if !is_safe_path(&full_path, &self.root) {
            warn!("Attempted path traversal attack: {}", request_path);
            return Ok(ErrorResponse::forbidden().build());
        }

        let metadata = match fs::metadata(&full_path).await {
            Ok(meta) => meta,
            Err(_) => return Ok(ErrorResponse::not_found().build()),
        };

        let file_path = if metadata.is_dir() {
            match self.find_index_file(&full_path).await {
                Some(index_path) => index_path,
                None => return Ok(ErrorResponse::forbidden().build()),
            }
        } else {
            full_path
        };

        self.serve_single_file(method, headers, &file_path).await
    }

    async fn serve_single_file(
        &self,
        method: &Method,
        headers: &HeaderMap,
        file_path: &Path,
    ) -> Result<Response<ResponseBody>> {
        let metadata = match fs::metadata(file_path).await {
            Ok(meta) => meta,
            Err(_) => return Ok(ErrorResponse::not_found().build()),
        };

        if metadata.is_dir() {
            return Ok(ErrorResponse::forbidden().build());
        }

        let mime_type = MimeGuess::from_path(file_path)
            .first()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM);
        let etag = generate_etag(&metadata);

        if let Some(if_none_match) = headers.get("if-none-match") {
            if if_none_match.to_str().unwrap_or("") == etag {
                return Ok(ResponseBuilder::new(StatusCode::NOT_MODIFIED).build());
            }
        }

        if let Some(if_modified_since) = headers.get("if-modified-since") {
            if let Ok(since_time) =
                httpdate::parse_http_date(if_modified_since.to_str().unwrap_or(""))
            {
                if let Ok(modified_time) = metadata.modified() {
                    if modified_time <= since_time {
                        return Ok(ResponseBuilder::new(StatusCode::NOT_MODIFIED).build());
                    }
                }
            }
        }

        let content_length = metadata.len();
        let content = if method == Method::HEAD {
            Bytes::new()
        } else {
            match fs::read(file_path).await {
                Ok(content) => Bytes::from(content),
                Err(_) => return Ok(ErrorResponse::internal_server_error().build()),
            }
        };

        let response = ResponseBuilder::new(StatusCode::OK)
            .header_string("content-type", mime_type.to_string())
            .header_string("content-length", content_length.to_string())
            .header_string("etag", etag)
            .header_string("last-modified", format_last_modified(&metadata))
            .header("accept-ranges", "bytes")
            .body(content)
            .build();

        Ok(response)
    }

    async fn find_index_file(&self, dir_path: &Path) -> Option<PathBuf> {
        for index_file in &self.index_files {
            let index_path = dir_path.join(index_file);
            if let Ok(metadata) = fs::metadata(&index_path).await {
                if metadata.is_file() {
                    return Some(index_path);
                }
            }
        }
        None
    }
}

fn sanitize_path(path: &str) -> Result<String> {
    let decoded =
        urlencoding::decode(path).map_err(|_| anyhow::anyhow!("Invalid URL encoding"))?;

    let path = decoded.trim_start_matches('/');

    if path.split('/').any(|segment| segment == "..") || path.contains('\0') {
        return Err(anyhow::anyhow!("Invalid path"));
    }

    Ok(path.to_string())
}

fn is_safe_path(requested_path: &Path, root: &Path) -> bool {
    let canonical_requested = requested_path
        .canonicalize()
        .unwrap_or_else(|_| requested_path.to_path_buf());

    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

    canonical_requested.starts_with(canonical_root)
}

fn generate_etag(metadata: &std::fs::Metadata) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    metadata.len().hash(&mut hasher);
    if let Ok(modified) = metadata.modified() {
        if let Ok(duration) = modified.duration_since(std::time::UNIX_EPOCH) {
            duration.as_secs().hash(&mut hasher);
        }
    }
    format!("\"{}\"", hasher.finish())
}

fn format_last_modified(metadata: &std::fs::Metadata) -> String {
    match metadata.modified() {
        Ok(time) => httpdate::fmt_http_date(time),
        Err(_) => httpdate::fmt_http_date(std::time::SystemTime::now()),
    }
}
