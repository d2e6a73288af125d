//! Extension manifest: the declarative descriptor fetched before loading.
//!
//! Integrity hashes are computed over a canonical serialization of the raw
//! descriptor (`integrityHash` removed, object keys sorted, compact JSON) so
//! the check does not depend on how the publisher formatted the file.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
    sha2::{Digest, Sha256},
    url::Url,
};

use crate::error::{Error, Result};

/// Field excluded from the canonical form.
pub const INTEGRITY_FIELD: &str = "integrityHash";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub entrypoint: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ExtensionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<SlotConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    #[default]
    Extension,
    Widget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotConfig {
    #[serde(rename = "type")]
    pub kind: SlotKind,
    pub label: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin_route: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotKind {
    RepoTab,
}

impl Manifest {
    /// Decode a raw descriptor and run [`Manifest::validate`].
    pub fn from_value(descriptor: Value) -> Result<Self> {
        let manifest: Self = serde_json::from_value(descriptor)
            .map_err(|e| Error::invalid_manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn kind(&self) -> ExtensionKind {
        self.kind.unwrap_or_default()
    }

    /// ASCII origin of the entrypoint, e.g. `https://ext.example`.
    ///
    /// Opaque origins (`data:`, `file:`, ...) cannot be pinned and are
    /// rejected.
    pub fn origin(&self) -> Result<String> {
        let origin = self.entrypoint.origin();
        if !origin.is_tuple() {
            return Err(Error::invalid_manifest(format!(
                "entrypoint {} has an opaque origin",
                self.entrypoint
            )));
        }
        Ok(origin.ascii_serialization())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_manifest("id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(Error::invalid_manifest(format!(
                "{}: name must not be empty",
                self.id
            )));
        }
        self.origin()?;
        if let Some(hash) = &self.integrity_hash
            && normalize_digest(hash).is_none()
        {
            return Err(Error::invalid_manifest(format!(
                "{}: integrityHash is not a sha256 hex digest",
                self.id
            )));
        }
        Ok(())
    }
}

// ── Integrity ───────────────────────────────────────────────────────────────

/// Canonical bytes of a descriptor: `integrityHash` stripped, keys sorted
/// recursively, compact JSON.
pub fn canonical_bytes(descriptor: &Value) -> Result<Vec<u8>> {
    let mut canonical = sort_keys(descriptor);
    if let Value::Object(map) = &mut canonical {
        map.remove(INTEGRITY_FIELD);
    }
    Ok(serde_json::to_vec(&canonical)?)
}

/// Lowercase hex SHA-256 over [`canonical_bytes`].
pub fn integrity_digest(descriptor: &Value) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(descriptor)?);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check a raw descriptor against its declared `integrityHash`, if any.
///
/// Returns `Ok(None)` when no hash is declared, `Ok(Some(digest))` when it
/// matches.
pub fn verify_integrity(descriptor: &Value) -> Result<Option<String>> {
    let Some(declared) = descriptor.get(INTEGRITY_FIELD).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let id = descriptor
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_string();
    let declared_raw = declared
        .as_str()
        .ok_or_else(|| Error::invalid_manifest(format!("{id}: integrityHash must be a string")))?;
    let expected = normalize_digest(declared_raw).ok_or_else(|| {
        Error::invalid_manifest(format!("{id}: integrityHash is not a sha256 hex digest"))
    })?;

    let actual = integrity_digest(descriptor)?;
    if actual != expected {
        return Err(Error::ManifestIntegrity {
            id,
            expected,
            actual,
        });
    }
    Ok(Some(actual))
}

/// Strip an optional `sha256:` / `sha256-` prefix and lowercase. `None` when
/// the rest is not 64 hex characters.
fn normalize_digest(raw: &str) -> Option<String> {
    let hex = raw
        .strip_prefix("sha256:")
        .or_else(|| raw.strip_prefix("sha256-"))
        .unwrap_or(raw);
    (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| hex.to_ascii_lowercase())
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        },
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
