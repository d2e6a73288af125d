//! Config schema: extension sources, sandbox launcher, built-in handlers.

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PalisadeConfig {
    pub extensions: ExtensionsConfig,
    pub sandbox: SandboxConfig,
    pub handlers: HandlersConfig,
}

/// Which extensions to load and how to talk to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Manifest URLs loaded at startup.
    pub manifests: Vec<String>,
    /// Timeout for fetching a manifest.
    pub fetch_timeout_secs: u64,
    /// Optional bound for host → extension requests. `None` waits forever.
    pub request_timeout_secs: Option<u64>,
    /// Externally produced approval records, keyed by extension id.
    pub approvals: HashMap<String, ApprovalConfig>,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            manifests: Vec::new(),
            fetch_timeout_secs: 30,
            request_timeout_secs: None,
            approvals: HashMap::new(),
        }
    }
}

/// Permissions a reviewer approved for one extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub permissions: Vec<String>,
    pub approved_by: Option<String>,
}

/// OS-process sandbox settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Program + args used to run an entrypoint; the entrypoint URL is appended.
    pub launcher: Vec<String>,
    /// Root for per-origin storage directories.
    pub storage_dir: Option<PathBuf>,
    /// The only environment variables a sandboxed process sees.
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlersConfig {
    /// Register the built-in `host:*` handlers.
    pub builtin: bool,
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self { builtin: true }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: PalisadeConfig = toml::from_str("").unwrap();
        assert!(cfg.extensions.manifests.is_empty());
        assert_eq!(cfg.extensions.fetch_timeout_secs, 30);
        assert_eq!(cfg.extensions.request_timeout_secs, None);
        assert!(cfg.handlers.builtin);
        assert!(cfg.sandbox.launcher.is_empty());
    }

    #[test]
    fn parses_approvals() {
        let cfg: PalisadeConfig = toml::from_str(
            r#"
            [extensions]
            manifests = ["https://ext.example/manifest.json"]
            request_timeout_secs = 5

            [extensions.approvals.demo]
            permissions = ["data:query"]
            approved_by = "ops"
            "#,
        )
        .unwrap();
        let approval = &cfg.extensions.approvals["demo"];
        assert_eq!(approval.permissions, vec!["data:query"]);
        assert_eq!(approval.approved_by.as_deref(), Some("ops"));
        assert_eq!(cfg.extensions.request_timeout_secs, Some(5));
    }
}
