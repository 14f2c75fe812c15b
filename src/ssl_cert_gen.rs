use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub struct CertificateGenerator;

impl CertificateGenerator {
    /// Makes sure a certificate/key pair exists at the given paths, generating
    /// a self-signed one for `names` when allowed.
    pub fn ensure_certificates_exist(
        names: &[String],
        cert_path: &Path,
        key_path: &Path,
        auto_generate: bool,
    ) -> Result<()> {
        if cert_path.exists() && key_path.exists() {
            info!(
                certificate = %cert_path.display(),
                private_key = %key_path.display(),
                "TLS certificates found"
            );
            return Ok(());
        }

        if !auto_generate {
            return Err(anyhow::anyhow!(
                "TLS certificates not found at {} and {}, and auto-generation is disabled",
                cert_path.display(),
                key_path.display()
            ));
        }

        warn!("TLS certificates not found, generating self-signed certificates");
        Self::generate_self_signed_cert(names, cert_path, key_path)
    }

    /// Writes a self-signed certificate covering `names` as PEM files.
    pub fn generate_self_signed_cert(
        names: &[String],
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<()> {
        for path in [cert_path, key_path] {
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                fs::create_dir_all(dir).with_context(|| {
                    format!("Failed to create certificate directory: {}", dir.display())
                })?;
            }
        }

        let cert = rcgen::generate_simple_self_signed(names.to_vec())
            .context("Failed to generate self-signed certificate")?;
        let cert_pem = cert
            .serialize_pem()
            .context("Failed to serialize certificate")?;
        let key_pem = cert.serialize_private_key_pem();

        fs::write(cert_path, cert_pem)
            .with_context(|| format!("Failed to write certificate: {}", cert_path.display()))?;
        fs::write(key_path, key_pem)
            .with_context(|| format!("Failed to write private key: {}", key_path.display()))?;

        // Private key readable by the owner only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(key_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(key_path, perms)?;
        }

        info!(names = ?names, "Generated self-signed certificate");
        warn!("Using a self-signed certificate. For production, replace it with one issued by a CA.");

        Ok(())
    }
}
