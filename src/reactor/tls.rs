//! Key and trust material for encrypted links.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::ClientError;

/// Supplies rustls configuration when an encrypted reactor is built.
///
/// Only consulted at construction and per new connection; it never sees
/// application traffic.
pub trait TlsMaterialProvider: Send + Sync {
    fn client_config(&self) -> Result<Arc<ClientConfig>, ClientError>;

    /// Configuration for accepted connections. Reactors without one cannot
    /// host encrypted listeners.
    fn server_config(&self) -> Result<Option<Arc<ServerConfig>>, ClientError> {
        Ok(None)
    }
}

/// Provider backed by configurations built once up front.
#[derive(Clone)]
pub struct StaticTlsMaterial {
    client: Arc<ClientConfig>,
    server: Option<Arc<ServerConfig>>,
}

impl StaticTlsMaterial {
    pub fn new(client: Arc<ClientConfig>, server: Option<Arc<ServerConfig>>) -> Self {
        Self { client, server }
    }

    /// Build configurations from DER material.
    ///
    /// `roots` are the trust anchors for outbound links; `identity` is the
    /// certificate chain and key presented by listeners, if any.
    pub fn from_der(
        roots: Vec<CertificateDer<'static>>,
        identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    ) -> Result<Self, ClientError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut store = RootCertStore::empty();
        for root in roots {
            store
                .add(root)
                .map_err(|e| ClientError::Tls(format!("invalid trust anchor: {}", e)))?;
        }
        let client = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| ClientError::Tls(e.to_string()))?
            .with_root_certificates(store)
            .with_no_client_auth();

        let server = match identity {
            Some((chain, key)) => Some(Arc::new(
                ServerConfig::builder_with_provider(provider)
                    .with_safe_default_protocol_versions()
                    .map_err(|e| ClientError::Tls(e.to_string()))?
                    .with_no_client_auth()
                    .with_single_cert(chain, key)
                    .map_err(|e| ClientError::Tls(format!("invalid identity: {}", e)))?,
            )),
            None => None,
        };

        Ok(Self::new(Arc::new(client), server))
    }
}

impl TlsMaterialProvider for StaticTlsMaterial {
    fn client_config(&self) -> Result<Arc<ClientConfig>, ClientError> {
        Ok(Arc::clone(&self.client))
    }

    fn server_config(&self) -> Result<Option<Arc<ServerConfig>>, ClientError> {
        Ok(self.server.clone())
    }
}
