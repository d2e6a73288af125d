//! Named UI injection points.
//!
//! Host UI code renders a slot by handing every registered contributor the
//! render target, a context bag and, optionally, the extension that
//! triggered the render. Contributors are isolated from each other: an
//! error or panic in one is logged and the rest still run.

use std::{
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::registry::ExtensionInfo;

/// Open context bag passed to slot contributors.
pub type SlotContext = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotId {
    RepoTab,
    RepoToolbar,
    Sidebar,
    SettingsPanel,
    StatusBar,
}

impl SlotId {
    pub const ALL: &'static [SlotId] = &[
        Self::RepoTab,
        Self::RepoToolbar,
        Self::Sidebar,
        Self::SettingsPanel,
        Self::StatusBar,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RepoTab => "repo-tab",
            Self::RepoToolbar => "repo-toolbar",
            Self::Sidebar => "sidebar",
            Self::SettingsPanel => "settings-panel",
            Self::StatusBar => "status-bar",
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type SlotHandler<R> =
    Arc<dyn Fn(&mut R, &SlotContext, Option<&ExtensionInfo>) -> anyhow::Result<()> + Send + Sync>;

/// Outcome of one [`SlotRegistry::render`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotReport {
    pub invoked: usize,
    pub failed: usize,
}

/// Slot contributors, generic over the host's render target type.
pub struct SlotRegistry<R> {
    handlers: HashMap<SlotId, Vec<SlotHandler<R>>>,
}

impl<R> Default for SlotRegistry<R> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<R> SlotRegistry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a contributor; contributors run in registration order.
    pub fn register<F>(&mut self, slot: SlotId, handler: F)
    where
        F: Fn(&mut R, &SlotContext, Option<&ExtensionInfo>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.entry(slot).or_default().push(Arc::new(handler));
        debug!(slot = %slot, "slot handler registered");
    }

    pub fn clear(&mut self, slot: SlotId) {
        self.handlers.remove(&slot);
    }

    pub fn handler_count(&self, slot: SlotId) -> usize {
        self.handlers.get(&slot).map_or(0, Vec::len)
    }

    /// Run every contributor for `slot`. Never fails.
    pub fn render(
        &self,
        slot: SlotId,
        root: &mut R,
        ctx: &SlotContext,
        extension: Option<&ExtensionInfo>,
    ) -> SlotReport {
        let mut report = SlotReport::default();
        let Some(handlers) = self.handlers.get(&slot) else {
            return report;
        };

        for (index, handler) in handlers.iter().enumerate() {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| handler(&mut *root, ctx, extension))) {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(slot = %slot, index, error = %e, "slot handler failed");
                },
                Err(_) => {
                    report.failed += 1;
                    warn!(slot = %slot, index, "slot handler panicked");
                },
            }
        }

        report
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_handler_does_not_stop_the_rest() {
        let mut slots: SlotRegistry<Vec<&'static str>> = SlotRegistry::new();
        slots.register(SlotId::RepoTab, |_, _, _| anyhow::bail!("boom"));
        slots.register(SlotId::RepoTab, |root, _, _| {
            root.push("b");
            Ok(())
        });

        let mut root = Vec::new();
        let report = slots.render(SlotId::RepoTab, &mut root, &SlotContext::new(), None);
        assert_eq!(root, vec!["b"]);
        assert_eq!(report, SlotReport { invoked: 2, failed: 1 });
    }

    #[test]
    fn panicking_handler_is_contained() {
        let mut slots: SlotRegistry<Vec<String>> = SlotRegistry::new();
        slots.register(SlotId::Sidebar, |_, _, _| panic!("contributor bug"));
        slots.register(SlotId::Sidebar, |root, ctx, _| {
            root.push(ctx["repo"].as_str().unwrap_or_default().to_string());
            Ok(())
        });

        let mut ctx = SlotContext::new();
        ctx.insert("repo".into(), "palisade".into());
        let mut root = Vec::new();
        let report = slots.render(SlotId::Sidebar, &mut root, &ctx, None);
        assert_eq!(root, vec!["palisade"]);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn extension_is_forwarded() {
        let mut slots: SlotRegistry<Option<String>> = SlotRegistry::new();
        slots.register(SlotId::StatusBar, |root, _, ext| {
            *root = ext.map(|e| e.id.clone());
            Ok(())
        });
        let info = ExtensionInfo {
            id: "demo".into(),
            name: "Demo".into(),
            origin: "https://ext.example".into(),
            kind: crate::ExtensionKind::Widget,
            loaded: true,
            slot: None,
        };
        let mut root = None;
        slots.render(SlotId::StatusBar, &mut root, &SlotContext::new(), Some(&info));
        assert_eq!(root.as_deref(), Some("demo"));
    }

    #[test]
    fn empty_slot_is_a_noop() {
        let mut slots: SlotRegistry<()> = SlotRegistry::new();
        assert_eq!(
            slots.render(SlotId::SettingsPanel, &mut (), &SlotContext::new(), None),
            SlotReport::default()
        );
        slots.register(SlotId::SettingsPanel, |_, _, _| Ok(()));
        assert_eq!(slots.handler_count(SlotId::SettingsPanel), 1);
        slots.clear(SlotId::SettingsPanel);
        assert_eq!(slots.handler_count(SlotId::SettingsPanel), 0);
    }

    #[test]
    fn slot_ids_are_kebab_case() {
        for slot in SlotId::ALL {
            let v = serde_json::to_value(slot).unwrap();
            assert_eq!(v, slot.as_str());
        }
    }
}
