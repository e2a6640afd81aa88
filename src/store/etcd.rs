//! etcd v3 backend.

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, DeleteOptions, LeaseGrantOptions, PutOptions};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{RegistryError, Result};

use super::{Connect, CoordinationStore, LeaseId};

/// etcd client wrapper.
///
/// `etcd_client::Client` is a cheap handle over a shared channel, so every
/// call works on a clone and the store can be shared behind an `Arc`.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

/// etcd answers a keep-alive for an expired or revoked lease with a
/// non-positive TTL, which the client surfaces as `LeaseKeepAliveError`.
fn is_lease_not_found(err: &etcd_client::Error) -> bool {
    matches!(err, etcd_client::Error::LeaseKeepAliveError(_))
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl_secs, Some(LeaseGrantOptions::new()))
            .await
            .map_err(|e| RegistryError::LeaseGrantFailed(e.to_string()))?;
        Ok(LeaseId::new(resp.id()))
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.get())))
            .await
            .map_err(|e| RegistryError::WriteFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        // Opening the keep-alive stream sends one renewal and waits for its
        // response; the stream is dropped right after.
        match client.lease_keep_alive(lease.get()).await {
            Ok(_) => Ok(()),
            Err(e) if is_lease_not_found(&e) => Err(RegistryError::LeaseNotFound(lease)),
            Err(e) => Err(RegistryError::RenewalFailed {
                lease,
                reason: e.to_string(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(key, Some(DeleteOptions::new()))
            .await
            .map_err(|e| RegistryError::DeleteFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl Connect for EtcdStore {
    async fn connect(config: &StoreConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(RegistryError::StoreUnavailable(
                "no endpoints configured".into(),
            ));
        }

        let options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout)
            .with_timeout(config.operation_timeout);

        let unavailable = |reason: String| {
            RegistryError::StoreUnavailable(format!(
                "Failed to connect to etcd at {}: {}",
                config.endpoints.join(","),
                reason
            ))
        };

        let mut client = Client::connect(config.endpoints.clone(), Some(options))
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        // Channels connect lazily; probe once so an unreachable cluster fails here.
        match tokio::time::timeout(config.connect_timeout, client.status()).await {
            Ok(Ok(status)) => {
                debug!(version = %status.version(), "etcd status probe succeeded");
            }
            Ok(Err(e)) => return Err(unavailable(e.to_string())),
            Err(_) => {
                return Err(unavailable(format!(
                    "timed out after {:?}",
                    config.connect_timeout
                )))
            }
        }

        info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self { client })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lease_not_found_matches_keep_alive_error_variant() {
        let lost = etcd_client::Error::LeaseKeepAliveError("lease expired".to_string());
        assert!(is_lease_not_found(&lost));

        let transport = etcd_client::Error::InvalidArgs("lease not found".to_string());
        assert!(!is_lease_not_found(&transport));
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_store_unavailable() {
        let mut config = StoreConfig::with_endpoints(["http://127.0.0.1:1"]);
        config.connect_timeout = Duration::from_millis(300);

        let err = EtcdStore::connect(&config).await.unwrap_err();
        assert!(matches!(err, RegistryError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_connect_without_endpoints() {
        let config = StoreConfig::with_endpoints(Vec::<String>::new());
        let err = EtcdStore::connect(&config).await.unwrap_err();
        assert_eq!(err.to_string(), "Store unavailable: no endpoints configured");
    }
}
