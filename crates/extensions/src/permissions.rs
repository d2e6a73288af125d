//! Capability gating for bridge actions.
//!
//! Actions under a privileged namespace need a verbatim grant in the
//! extension's permission set; everything else is open.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ── PrivilegedNamespace ─────────────────────────────────────────────────────

/// Reserved action namespaces that require an explicit grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegedNamespace {
    /// Host data access (`data:query`, `data:publish`, ...).
    Data,
    /// Persistent storage (`storage:get`, `storage:set`, ...).
    Storage,
}

impl PrivilegedNamespace {
    pub const ALL: &'static [PrivilegedNamespace] = &[Self::Data, Self::Storage];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Data => "data:",
            Self::Storage => "storage:",
        }
    }

    /// The namespace `action` falls under, or `None` for open actions.
    pub fn classify(action: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|ns| action.starts_with(ns.prefix()))
    }
}

impl fmt::Display for PrivilegedNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix().trim_end_matches(':'))
    }
}

// ── ApprovalRecord ──────────────────────────────────────────────────────────

/// Externally produced record of what a reviewer approved for an extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub approved_by: Option<String>,
}

impl From<&palisade_config::ApprovalConfig> for ApprovalRecord {
    fn from(cfg: &palisade_config::ApprovalConfig) -> Self {
        Self {
            permissions: cfg.permissions.iter().cloned().collect(),
            approved_by: cfg.approved_by.clone(),
        }
    }
}

// ── PermissionSet ───────────────────────────────────────────────────────────

/// Grants held by one bridge, fixed at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    granted: BTreeSet<String>,
}

impl PermissionSet {
    pub fn from_declared<I, S>(declared: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: declared.into_iter().map(Into::into).collect(),
        }
    }

    /// Keep only grants the approval record also lists.
    #[must_use]
    pub fn restricted_by(self, approval: &ApprovalRecord) -> Self {
        Self {
            granted: self
                .granted
                .into_iter()
                .filter(|p| approval.permissions.contains(p))
                .collect(),
        }
    }

    pub fn allows(&self, action: &str) -> bool {
        match PrivilegedNamespace::classify(action) {
            Some(_) => self.granted.contains(action),
            None => true,
        }
    }

    pub fn check(&self, extension: &str, action: &str) -> Result<()> {
        if self.allows(action) {
            Ok(())
        } else {
            Err(Error::permission_denied(extension, action))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.granted.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.granted.iter().cloned().collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("data:query", Some(PrivilegedNamespace::Data))]
    #[case("data:publish", Some(PrivilegedNamespace::Data))]
    #[case("storage:set", Some(PrivilegedNamespace::Storage))]
    #[case("ui:toast", None)]
    #[case("database:query", None)]
    #[case("Data:query", None)]
    #[case("", None)]
    fn classifies_actions(#[case] action: &str, #[case] expected: Option<PrivilegedNamespace>) {
        assert_eq!(PrivilegedNamespace::classify(action), expected);
    }

    #[rstest]
    #[case("data:query", true)]
    #[case("data:publish", false)]
    #[case("storage:get", false)]
    #[case("events:emit", true)]
    fn checks_against_declared(#[case] action: &str, #[case] allowed: bool) {
        let set = PermissionSet::from_declared(["data:query"]);
        assert_eq!(set.allows(action), allowed);
    }

    #[test]
    fn namespace_grant_is_not_a_wildcard() {
        let set = PermissionSet::from_declared(["data:", "data:*"]);
        assert!(!set.allows("data:query"));
    }

    #[test]
    fn denial_names_extension_and_action() {
        let err = PermissionSet::default()
            .check("demo", "storage:set")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "extension demo is not permitted to use storage:set"
        );
    }

    #[test]
    fn approval_only_narrows() {
        let approval = ApprovalRecord {
            permissions: ["data:query", "storage:set"].map(String::from).into(),
            approved_by: Some("ops".into()),
        };
        let set = PermissionSet::from_declared(["data:query", "data:publish"]).restricted_by(&approval);
        assert_eq!(set.to_vec(), vec!["data:query".to_string()]);
        assert!(!set.allows("storage:set"));
    }

    #[test]
    fn display_uses_bare_namespace() {
        assert_eq!(PrivilegedNamespace::Storage.to_string(), "storage");
    }
}
