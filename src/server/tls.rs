use crate::error::{Result, ServerError};
use crate::site::Site;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

pub const ALPN_HTTP2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Selects a certificate by the server name the client asked for.
///
/// Lookup uses the same rule as host routing: the site name that is the
/// longest suffix of the requested name. Clients that send no name, or a name
/// no site covers, get the first site's certificate.
///
/// Entries are keyed by site name only; the names inside each certificate
/// (CN and SANs) play no part in the selection.
#[derive(Debug, Default)]
pub struct SniResolver {
    entries: Vec<(String, Arc<CertifiedKey>)>,
}

impl SniResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, key: CertifiedKey) -> Result<()> {
        let name = name.into();
        if self.entries.iter().any(|(existing, _)| *existing == name) {
            return Err(ServerError::DuplicateDomain(name));
        }
        self.entries.push((name, Arc::new(key)));
        Ok(())
    }

    /// The certificate presented for `server_name`.
    pub fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let fallback = self.entries.first().map(|(_, key)| key);

        let Some(server_name) = server_name else {
            return fallback.cloned();
        };

        self.entries
            .iter()
            .filter(|(name, _)| server_name.ends_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, key)| key)
            .or(fallback)
            .cloned()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        debug!(server_name = ?server_name, "Resolving certificate");
        self.lookup(server_name)
    }
}

/// Loads one site's certificate chain and private key.
pub fn load_certified_key(site: &Site) -> Result<CertifiedKey> {
    let credentials = site.credentials().ok_or_else(|| ServerError::Certificate {
        site: site.name().to_string(),
        path: Default::default(),
        source: io::Error::new(io::ErrorKind::NotFound, "site has no credentials"),
    })?;

    let certificate_error = |path: &Path, source: io::Error| ServerError::Certificate {
        site: site.name().to_string(),
        path: path.to_path_buf(),
        source,
    };

    let cert_path = &credentials.certificate;
    let cert_file = File::open(cert_path).map_err(|e| certificate_error(cert_path, e))?;
    let cert_chain = certs(&mut BufReader::new(cert_file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| certificate_error(cert_path, e))?;
    if cert_chain.is_empty() {
        return Err(certificate_error(
            cert_path,
            io::Error::new(io::ErrorKind::InvalidData, "no certificates found"),
        ));
    }

    let key_path = &credentials.private_key;
    let key_file = File::open(key_path).map_err(|e| certificate_error(key_path, e))?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| certificate_error(key_path, e))?
        .ok_or_else(|| {
            certificate_error(
                key_path,
                io::Error::new(io::ErrorKind::InvalidData, "no private key found"),
            )
        })?;

    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&key).map_err(|source| ServerError::Tls {
            site: site.name().to_string(),
            source,
        })?;

    debug!(
        site = %site.name(),
        certificate = %cert_path.display(),
        "Loaded certificate"
    );

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

/// Builds the TLS acceptor for a listener serving `sites`.
///
/// Every site's certificate must load; one failure rejects the whole group.
/// HTTP/2 is offered through ALPN when `http2` is set.
pub fn build_acceptor(sites: &[Arc<Site>], http2: bool) -> Result<TlsAcceptor> {
    let mut resolver = SniResolver::new();
    for site in sites {
        resolver.add(site.name(), load_certified_key(site)?)?;
    }

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));

    config.alpn_protocols = if http2 {
        vec![ALPN_HTTP2.to_vec(), ALPN_HTTP11.to_vec()]
    } else {
        vec![ALPN_HTTP11.to_vec()]
    };

    info!(
        sites = sites.len(),
        http2,
        "TLS configuration ready"
    );

    Ok(TlsAcceptor::from(Arc::new(config)))
}
