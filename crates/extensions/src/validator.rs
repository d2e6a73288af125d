//! Fetching and integrity-checking manifests.

use std::{sync::Arc, time::Duration};

use {
    reqwest::Client,
    serde_json::Value,
    tracing::{debug, info},
};

use crate::{
    error::{Context, Error, Result},
    manifest::{self, Manifest},
    registry::ExtensionRegistry,
};

/// Fetches descriptors and registers them only once every check passed.
pub struct ManifestValidator {
    client: Client,
    registry: Arc<ExtensionRegistry>,
}

impl ManifestValidator {
    pub fn new(client: Client, registry: Arc<ExtensionRegistry>) -> Self {
        Self { client, registry }
    }

    pub fn from_config(
        cfg: &palisade_config::ExtensionsConfig,
        registry: Arc<ExtensionRegistry>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.fetch_timeout_secs))
            .build()
            .context("failed to build manifest HTTP client")?;
        Ok(Self::new(client, registry))
    }

    /// Fetch the raw descriptor at `url`. Non-success statuses fail.
    pub async fn fetch(&self, url: &str) -> Result<Value> {
        debug!(url, "fetching manifest");
        let resp = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|source| Error::ManifestRequest {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::ManifestFetch {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(|source| Error::ManifestRequest {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::invalid_manifest(format!("{url}: {e}")))
    }

    /// Integrity check (when a hash is declared), typed decode and
    /// validation of a raw descriptor.
    pub fn verify(descriptor: Value) -> Result<Manifest> {
        manifest::verify_integrity(&descriptor)?;
        Manifest::from_value(descriptor)
    }

    /// Fetch, verify and register. Nothing is registered on failure.
    pub async fn load(&self, url: &str) -> Result<Manifest> {
        let descriptor = self.fetch(url).await?;
        let manifest = Self::verify(descriptor)?;
        self.registry.register(manifest.clone())?;
        info!(
            extension = %manifest.id,
            url,
            integrity = manifest.integrity_hash.is_some(),
            "manifest registered"
        );
        Ok(manifest)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            manifest::{INTEGRITY_FIELD, integrity_digest},
            sandbox::{ChannelHost, MessageChannel},
        },
        serde_json::json,
    };

    fn validator() -> (ManifestValidator, Arc<ExtensionRegistry>) {
        let registry = Arc::new(ExtensionRegistry::new(
            Arc::default(),
            ChannelHost::new(),
            MessageChannel::new(),
        ));
        (ManifestValidator::new(Client::new(), registry.clone()), registry)
    }

    fn demo() -> Value {
        json!({
            "id": "demo",
            "name": "Demo",
            "entrypoint": "https://ext.example/app",
            "permissions": ["data:query"]
        })
    }

    async fn serve(server: &mut mockito::Server, status: usize, body: String) -> mockito::Mock {
        server
            .mock("GET", "/manifest.json")
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn load_registers_manifest_without_hash() {
        let mut server = mockito::Server::new_async().await;
        let mock = serve(&mut server, 200, demo().to_string()).await;
        let (validator, registry) = validator();

        let url = format!("{}/manifest.json", server.url());
        let manifest = validator.load(&url).await.unwrap();
        assert_eq!(manifest.id, "demo");
        assert_eq!(registry.get("demo").unwrap().origin, "https://ext.example");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn load_accepts_matching_hash() {
        let mut raw = demo();
        raw[INTEGRITY_FIELD] = json!(integrity_digest(&raw).unwrap());
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, 200, serde_json::to_string_pretty(&raw).unwrap()).await;
        let (validator, registry) = validator();

        validator
            .load(&format!("{}/manifest.json", server.url()))
            .await
            .unwrap();
        assert!(registry.get("demo").is_some());
    }

    #[tokio::test]
    async fn integrity_mismatch_registers_nothing() {
        let mut raw = demo();
        raw[INTEGRITY_FIELD] = json!(integrity_digest(&raw).unwrap());
        raw["permissions"] = json!(["data:query", "data:publish"]);
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, 200, raw.to_string()).await;
        let (validator, registry) = validator();

        let err = validator
            .load(&format!("{}/manifest.json", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManifestIntegrity { .. }));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn http_error_is_a_fetch_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, 404, "not found".into()).await;
        let (validator, registry) = validator();

        let err = validator
            .load(&format!("{}/manifest.json", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManifestFetch { status: 404, .. }));
        assert!(err.to_string().contains("404"));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn non_json_body_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, 200, "<html>".into()).await;
        let (validator, registry) = validator();

        let err = validator
            .load(&format!("{}/manifest.json", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidManifest { .. }));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn verify_rejects_missing_entrypoint() {
        let mut raw = demo();
        raw.as_object_mut().unwrap().remove("entrypoint");
        assert!(matches!(
            ManifestValidator::verify(raw),
            Err(Error::InvalidManifest { .. })
        ));
    }
}
