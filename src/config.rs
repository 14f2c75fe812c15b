use crate::compression::Compressed;
use crate::handler::{Handler, Respond, SharedHandler};
use crate::headers::{CacheFor, NoCache, RedirectToHttp, RedirectToHttps};
use crate::logging::{AccessLogFormat, AccessLogger, LogFormat};
use crate::server::{ConnectionOptions, Server, StaticFiles};
use crate::site::Site;
use crate::ssl_cert_gen::CertificateGenerator;
use anyhow::{Context, Result};
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;


#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub compression: CompressionConfig,
    #[serde(rename = "site")]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Seconds open connections get to finish during shutdown.
    pub drain_timeout: u64,
    pub tcp_nodelay: bool,
    pub keep_alive: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub format: LogFormat,
    pub access_log: Option<String>,
    pub access_log_format: String,
    /// Write access log lines to stdout when no file is configured.
    pub access_log_stdout: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enable_gzip: bool,
    pub enable_brotli: bool,
    pub enable_zstd: bool,
    pub compression_level: u32,
    pub min_compress_size: usize,
    pub compress_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub http2: bool,
    pub tls: Option<TlsConfig>,
    /// HTML file served with status 404 when no route matches.
    pub not_found_page: Option<String>,
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TlsConfig {
    pub certificate: String,
    pub private_key: String,
    #[serde(default)]
    pub auto_generate_self_signed: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    #[serde(rename = "match")]
    pub match_kind: MatchKind,
    #[serde(default)]
    pub patterns: Vec<String>,
    pub action: RouteAction,
    #[serde(default)]
    pub compress: bool,
    /// Seconds clients may cache successful responses.
    pub cache_for: Option<u64>,
    #[serde(default)]
    pub no_cache: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    EqualFold,
    Contains,
    Prefix,
    Suffix,
    Always,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteAction {
    Static {
        root: String,
        #[serde(default = "default_index_files")]
        index_files: Vec<String>,
    },
    RedirectHttps,
    RedirectHttp,
    Respond {
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        body: String,
        #[serde(default = "default_content_type")]
        content_type: String,
    },
}

fn default_index_files() -> Vec<String> {
    vec!["index.html".to_string()]
}

fn default_status() -> u16 {
    200
}

fn default_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            drain_timeout: 10,
            tcp_nodelay: true,
            keep_alive: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Pretty,
            access_log: None,
            access_log_format: "combined".to_string(),
            access_log_stdout: false,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enable_gzip: true,
            enable_brotli: true,
            enable_zstd: false,
            compression_level: 6,
            min_compress_size: 1024,
            compress_types: vec![
                "text/html".to_string(),
                "text/css".to_string(),
                "text/javascript".to_string(),
                "application/javascript".to_string(),
                "application/json".to_string(),
                "application/xml".to_string(),
                "text/xml".to_string(),
                "text/plain".to_string(),
            ],
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_address()?;

        if self.sites.is_empty() {
            return Err(anyhow::anyhow!("At least one [[site]] must be configured"));
        }

        if self.compression.compression_level > 11 {
            return Err(anyhow::anyhow!(
                "compression_level must be between 0 and 11"
            ));
        }

        let mut seen = HashSet::new();
        for site in &self.sites {
            site.validate()?;
            if !seen.insert((site.name.as_str(), site.port)) {
                return Err(anyhow::anyhow!(
                    "Site '{}' is configured twice on port {}",
                    site.name,
                    site.port
                ));
            }
        }

        Ok(())
    }

    pub fn bind_address(&self) -> Result<IpAddr> {
        self.server
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_address))
    }

    /// Builds every configured site and the server that will host them.
    pub fn into_server(self) -> Result<Server> {
        let compression = Arc::new(self.compression.clone());

        let mut server = Server::new()
            .with_bind_address(self.bind_address()?)
            .with_drain_timeout(Duration::from_secs(self.server.drain_timeout))
            .with_connection_options(ConnectionOptions {
                tcp_nodelay: self.server.tcp_nodelay,
                keep_alive: self.server.keep_alive,
            });

        if self.logging.access_log.is_some() || self.logging.access_log_stdout {
            let format = AccessLogFormat::parse(&self.logging.access_log_format);
            server = server.with_access_logger(AccessLogger::new(
                self.logging.access_log.as_deref(),
                format,
            )?);
        }

        for site in &self.sites {
            server = server.add(site.build(&compression)?);
        }

        Ok(server)
    }
}

impl SiteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow::anyhow!("Site names must not be empty"));
        }

        if let Some(tls) = &self.tls {
            if tls.certificate.is_empty() || tls.private_key.is_empty() {
                return Err(anyhow::anyhow!(
                    "Site '{}' needs both a certificate and a private_key",
                    self.name
                ));
            }
        } else if self.http2 {
            return Err(anyhow::anyhow!(
                "Site '{}' enables http2 without tls",
                self.name
            ));
        }

        for (index, route) in self.routes.iter().enumerate() {
            route
                .validate()
                .with_context(|| format!("Invalid route #{} of site '{}'", index + 1, self.name))?;
        }

        Ok(())
    }

    /// Builds the site, generating a self-signed certificate first when the
    /// configuration asks for one.
    pub fn build(&self, compression: &Arc<CompressionConfig>) -> Result<Site> {
        let mut site = match &self.tls {
            Some(tls) => {
                CertificateGenerator::ensure_certificates_exist(
                    &[self.name.clone()],
                    Path::new(&tls.certificate),
                    Path::new(&tls.private_key),
                    tls.auto_generate_self_signed,
                )?;
                Site::secure(&self.name, self.port, &tls.certificate, &tls.private_key)
            }
            None => Site::new(&self.name, self.port),
        }
        .with_http2(self.http2);

        if let Some(page) = &self.not_found_page {
            let body = std::fs::read(page)
                .with_context(|| format!("Failed to read not_found_page: {}", page))?;
            site = site.with_not_found(Respond::html(StatusCode::NOT_FOUND, body));
        }

        for route in &self.routes {
            let handler = route.handler(compression)?;
            let patterns = route.patterns.iter().cloned();
            match route.match_kind {
                MatchKind::Exact => site.equals(handler, patterns),
                MatchKind::EqualFold => site.equal_fold(handler, patterns),
                MatchKind::Contains => site.contains(handler, patterns),
                MatchKind::Prefix => site.has_prefix(handler, patterns),
                MatchKind::Suffix => site.has_suffix(handler, patterns),
                MatchKind::Always => site.always(handler),
            };
        }

        Ok(site)
    }
}

impl RouteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.match_kind != MatchKind::Always && self.patterns.is_empty() {
            return Err(anyhow::anyhow!("patterns must not be empty"));
        }

        if self.no_cache && self.cache_for.is_some() {
            return Err(anyhow::anyhow!("no_cache and cache_for are mutually exclusive"));
        }

        match &self.action {
            RouteAction::Static { root, .. } if root.is_empty() => {
                Err(anyhow::anyhow!("static root must not be empty"))
            }
            RouteAction::Respond { status, .. } => StatusCode::from_u16(*status)
                .map(|_| ())
                .with_context(|| format!("Invalid status code: {}", status)),
            _ => Ok(()),
        }
    }

    /// The handler for this route with its caching and compression layers.
    pub fn handler(&self, compression: &Arc<CompressionConfig>) -> Result<SharedHandler> {
        let mut handler: SharedHandler = match &self.action {
            RouteAction::Static { root, index_files } => {
                Arc::new(StaticFiles::with_index_files(root, index_files.clone()))
            }
            RouteAction::RedirectHttps => Arc::new(RedirectToHttps),
            RouteAction::RedirectHttp => Arc::new(RedirectToHttp),
            RouteAction::Respond {
                status,
                body,
                content_type,
            } => Arc::new(Respond::new(
                StatusCode::from_u16(*status)?,
                content_type.clone(),
                body.clone(),
            )),
        };

        if self.compress {
            handler = boxed(Compressed::new(handler, compression.clone()));
        }
        if self.no_cache {
            handler = boxed(NoCache::new(handler));
        } else if let Some(seconds) = self.cache_for {
            handler = boxed(CacheFor::new(handler, Duration::from_secs(seconds)));
        }

        Ok(handler)
    }
}

fn boxed<H: Handler>(handler: H) -> SharedHandler {
    Arc::new(handler)
}
