//! TLS identity for `tls://` relay listeners

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// Certificate and key, reloadable without restarting listeners
#[derive(Clone)]
pub struct TlsIdentity {
    inner: Arc<RwLock<Arc<ServerConfig>>>,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl TlsIdentity {
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref().to_path_buf();
        let key_path = key_path.as_ref().to_path_buf();
        let config = load_config(&cert_path, &key_path)?;

        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            cert_path,
            key_path,
        })
    }

    /// Acceptor for the current certificate
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.inner.read()))
    }

    pub fn reload(&self) -> Result<()> {
        info!(cert = %self.cert_path.display(), "Reloading TLS certificate and key");
        let config = load_config(&self.cert_path, &self.key_path)?;
        *self.inner.write() = Arc::new(config);
        info!("TLS certificate reloaded");
        Ok(())
    }
}

fn load_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let certs = load_cert_chain(cert_path)?;
    let key = load_private_key(key_path)?;

    // ring only: reqwest may also pull in another provider
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS config")
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let content = std::fs::read(path)
        .with_context(|| format!("Failed to read certificate file: {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut content.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", path);
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let content =
        std::fs::read(path).with_context(|| format!("Failed to read key file: {:?}", path))?;
    rustls_pemfile::private_key(&mut content.as_slice())
        .context("Failed to parse private key")?
        .with_context(|| format!("No private key found in {:?}", path))
}

/// Reload the certificate on SIGHUP
pub fn spawn_reload_on_sighup(identity: TlsIdentity) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to register SIGHUP handler");
                return;
            }
        };

        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                if let Err(e) = identity.reload() {
                    error!(error = %e, "Failed to reload TLS certificate on SIGHUP");
                }
            }
        });
    }
    #[cfg(not(unix))]
    let _ = identity;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        assert!(TlsIdentity::load(&cert, &key).is_err());
    }

    #[test]
    fn test_empty_pem_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();

        let error = TlsIdentity::load(&cert, &key).err().unwrap();
        assert!(error.to_string().contains("No certificates found"));
        assert!(load_private_key(&key).is_err());
    }
}
