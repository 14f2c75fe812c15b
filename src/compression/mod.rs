use crate::config::CompressionConfig;
use crate::handler::{Handler, RequestBody, ResponseBody};
use anyhow::Result;
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression as GzCompression};
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, VARY};
use hyper::{Request, Response};
use std::io::Write;
use std::sync::Arc;

/// Compresses the inner handler's responses when the client accepts it.
pub struct Compressed<H> {
    inner: H,
    compressor: Arc<Compressor>,
}

impl<H: Handler> Compressed<H> {
    pub fn new(inner: H, config: Arc<CompressionConfig>) -> Self {
        Self {
            inner,
            compressor: Arc::new(Compressor::new(config)),
        }
    }
}

impl<H: Handler> Handler for Compressed<H> {
    fn serve(&self, req: Request<RequestBody>) -> BoxFuture<'static, Response<ResponseBody>> {
        let accept_encoding = req
            .headers()
            .get(ACCEPT_ENCODING)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        let compressor = self.compressor.clone();
        let response = self.inner.serve(req);

        Box::pin(async move {
            let response = response.await;
            compressor.compress_response(response, &accept_encoding).await
        })
    }
}

pub struct Compressor {
    config: Arc<CompressionConfig>,
}

impl Compressor {
    pub fn new(config: Arc<CompressionConfig>) -> Self {
        Self { config }
    }

    pub async fn compress_response(
        &self,
        response: Response<Full<Bytes>>,
        accept_encoding: &str,
    ) -> Response<Full<Bytes>> {
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");

        if !self.should_compress(content_type, &response) {
            return response;
        }

        let body_bytes = match response.body().clone().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };

        if body_bytes.len() < self.config.min_compress_size {
            return response;
        }

        let candidates: [(&'static str, bool, fn(&Self, &[u8]) -> Result<Bytes>); 3] = [
            ("br", self.config.enable_brotli, Self::compress_brotli),
            ("gzip", self.config.enable_gzip, Self::compress_gzip),
            ("zstd", self.config.enable_zstd, Self::compress_zstd),
        ];

        for (encoding, enabled, compress) in candidates {
            if !enabled || !accepts(accept_encoding, encoding) {
                continue;
            }

            match compress(self, &body_bytes) {
                Ok(compressed) => {
                    let compressed_len = compressed.len();
                    let (parts, _) = response.into_parts();
                    let mut response = Response::from_parts(parts, Full::new(compressed));
                    let headers = response.headers_mut();
                    headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(compressed_len));
                    headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));
                    return response;
                }
                Err(e) => {
                    tracing::warn!(encoding, "Compression failed: {}", e);
                }
            }
        }

        response
    }

    fn should_compress(&self, content_type: &str, response: &Response<Full<Bytes>>) -> bool {
        if response.status().is_redirection()
            || response.status().is_client_error()
            || response.status().is_server_error()
            || response.headers().contains_key(CONTENT_ENCODING)
        {
            return false;
        }

        self.config
            .compress_types
            .iter()
            .any(|ct| content_type.starts_with(ct))
    }

    fn compress_gzip(&self, data: &[u8]) -> Result<Bytes> {
        let mut encoder = GzEncoder::new(
            Vec::new(),
            GzCompression::new(self.config.compression_level),
        );
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        Ok(Bytes::from(compressed))
    }

    fn compress_brotli(&self, data: &[u8]) -> Result<Bytes> {
        let mut compressed = Vec::new();
        let mut writer = brotli::CompressorWriter::new(
            &mut compressed,
            4096, // buffer size
            self.config.compression_level,
            22, // window size
        );
        writer.write_all(data)?;
        writer.flush()?;
        drop(writer);
        Ok(Bytes::from(compressed))
    }

    fn compress_zstd(&self, data: &[u8]) -> Result<Bytes> {
        let compressed = zstd::bulk::compress(data, self.config.compression_level as i32)?;
        Ok(Bytes::from(compressed))
    }
}

/// Whether an Accept-Encoding value allows `encoding`, honouring `q=0`.
fn accepts(accept_encoding: &str, encoding: &str) -> bool {
    accept_encoding.split(',').any(|item| {
        let mut params = item.split(';');
        let name = params.next().unwrap_or("").trim();
        let refused = params.any(|p| {
            p.trim()
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .map_or(false, |q| q == 0.0)
        });
        !refused && (name.eq_ignore_ascii_case(encoding) || name == "*")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{empty_body, Respond};
    use flate2::read::GzDecoder;
    use hyper::StatusCode;
    use std::io::Read;

    fn config() -> Arc<CompressionConfig> {
        Arc::new(CompressionConfig {
            enable_brotli: false,
            min_compress_size: 16,
            ..CompressionConfig::default()
        })
    }

    fn request(accept: &str) -> Request<RequestBody> {
        Request::builder()
            .uri("/")
            .header(ACCEPT_ENCODING, accept)
            .body(empty_body())
            .unwrap()
    }

    #[test]
    fn test_accepts() {
        assert!(accepts("gzip, deflate", "gzip"));
        assert!(accepts("br;q=1.0, GZIP;q=0.5", "gzip"));
        assert!(!accepts("gzip;q=0", "gzip"));
        assert!(accepts("*", "zstd"));
        assert!(!accepts("deflate", "gzip"));
    }

    #[tokio::test]
    async fn test_gzip_round_trip() {
        let text = "hello compressed world ".repeat(20);
        let handler = Compressed::new(Respond::new(StatusCode::OK, "text/html", text.clone()), config());

        let response = handler.serve(request("gzip")).await;
        assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(response.headers()[VARY], "Accept-Encoding");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let mut decoded = String::new();
        GzDecoder::new(&body[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, text);
    }

    #[tokio::test]
    async fn test_skips_when_not_accepted_or_small() {
        let handler = Compressed::new(
            Respond::new(StatusCode::OK, "text/html", "a".repeat(100)),
            config(),
        );
        let response = handler.serve(request("identity")).await;
        assert!(response.headers().get(CONTENT_ENCODING).is_none());

        let small = Compressed::new(Respond::new(StatusCode::OK, "text/html", "tiny"), config());
        let response = small.serve(request("gzip")).await;
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_skips_binary_and_errors() {
        let binary = Compressed::new(
            Respond::new(StatusCode::OK, "image/png", vec![0u8; 100]),
            config(),
        );
        assert!(binary
            .serve(request("gzip"))
            .await
            .headers()
            .get(CONTENT_ENCODING)
            .is_none());

        let missing = Compressed::new(
            Respond::new(StatusCode::NOT_FOUND, "text/html", "x".repeat(100)),
            config(),
        );
        assert!(missing
            .serve(request("gzip"))
            .await
            .headers()
            .get(CONTENT_ENCODING)
            .is_none());
    }
}
