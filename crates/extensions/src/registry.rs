//! Lifecycle of registered and loaded extensions.
//!
//! Registration records a manifest and pins its origin. Loading creates one
//! isolated context with the minimal sandbox policy, binds one [`Bridge`]
//! to it, and sends the initial lifecycle events. Observers follow the set
//! of extensions through a `watch` channel.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use {
    palisade_protocol::lifecycle,
    serde::Serialize,
    serde_json::{Value, json},
    tokio::sync::{Mutex, watch},
    tracing::{debug, info, warn},
};

use crate::{
    bridge::Bridge,
    error::{Error, Result},
    handlers::HandlerRegistry,
    manifest::{ExtensionKind, Manifest, SlotConfig},
    permissions::{ApprovalRecord, PermissionSet},
    sandbox::{ContextSpec, IsolatedContext, MessageChannel, SandboxHost, SandboxPolicy},
};

// ── Entries ─────────────────────────────────────────────────────────────────

/// One registered extension; `context` and `bridge` are set while loaded.
#[derive(Clone)]
pub struct LoadedExtension {
    pub manifest: Arc<Manifest>,
    /// Derived from the entrypoint at registration; fixed while loaded.
    pub origin: String,
    pub context: Option<Arc<dyn IsolatedContext>>,
    pub bridge: Option<Arc<Bridge>>,
}

impl LoadedExtension {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn is_loaded(&self) -> bool {
        self.context.is_some()
    }

    pub fn info(&self) -> ExtensionInfo {
        ExtensionInfo {
            id: self.manifest.id.clone(),
            name: self.manifest.name.clone(),
            origin: self.origin.clone(),
            kind: self.manifest.kind(),
            loaded: self.is_loaded(),
            slot: self.manifest.slot.clone(),
        }
    }
}

impl fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("id", &self.manifest.id)
            .field("origin", &self.origin)
            .field("context", &self.context.as_ref().map(|c| c.handle()))
            .field("bridge", &self.bridge)
            .finish()
    }
}

/// Read-only projection of an entry for host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionInfo {
    pub id: String,
    pub name: String,
    pub origin: String,
    pub kind: ExtensionKind,
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<SlotConfig>,
}

// ── Registry ────────────────────────────────────────────────────────────────

pub struct ExtensionRegistry {
    handlers: Arc<HandlerRegistry>,
    sandbox: Arc<dyn SandboxHost>,
    channel: Arc<MessageChannel>,
    approvals: HashMap<String, ApprovalRecord>,
    entries: RwLock<HashMap<String, LoadedExtension>>,
    load_lock: Mutex<()>,
    view: watch::Sender<Vec<ExtensionInfo>>,
}

impl ExtensionRegistry {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        sandbox: Arc<dyn SandboxHost>,
        channel: Arc<MessageChannel>,
    ) -> Self {
        let (view, _) = watch::channel(Vec::new());
        Self {
            handlers,
            sandbox,
            channel,
            approvals: HashMap::new(),
            entries: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
            view,
        }
    }

    /// Approval records that narrow each extension's declared permissions.
    #[must_use]
    pub fn with_approvals(
        mut self,
        approvals: impl IntoIterator<Item = (String, ApprovalRecord)>,
    ) -> Self {
        self.approvals.extend(approvals);
        self
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    /// Insert or replace a manifest. A loaded extension keeps its context,
    /// bridge and origin until it is reloaded.
    pub fn register(&self, manifest: Manifest) -> Result<()> {
        manifest.validate()?;
        let origin = manifest.origin()?;
        let id = manifest.id.clone();
        {
            let mut entries = self.write_entries();
            let previous = entries.remove(&id);
            let entry = match previous {
                Some(prev) if prev.is_loaded() => {
                    if prev.origin != origin {
                        warn!(extension = %id, loaded = %prev.origin, new = %origin, "origin change takes effect on reload");
                    }
                    LoadedExtension {
                        manifest: Arc::new(manifest),
                        ..prev
                    }
                },
                _ => LoadedExtension {
                    manifest: Arc::new(manifest),
                    origin,
                    context: None,
                    bridge: None,
                },
            };
            entries.insert(id.clone(), entry);
        }
        debug!(extension = %id, "extension registered");
        self.publish();
        Ok(())
    }

    /// Remove an entry, detaching its bridge if loaded. The context is not
    /// destroyed here; use [`unload_extension`](Self::unload_extension).
    pub fn unregister(&self, id: &str) -> Option<LoadedExtension> {
        let removed = self.write_entries().remove(id);
        if let Some(entry) = &removed {
            if let Some(bridge) = &entry.bridge {
                bridge.detach();
            }
            debug!(extension = %id, "extension unregistered");
            self.publish();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<LoadedExtension> {
        self.read_entries().get(id).cloned()
    }

    /// All entries, sorted by id.
    pub fn list(&self) -> Vec<LoadedExtension> {
        let mut list: Vec<LoadedExtension> = self.read_entries().values().cloned().collect();
        list.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        list
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.read_entries().get(id).is_some_and(LoadedExtension::is_loaded)
    }

    pub fn bridge(&self, id: &str) -> Option<Arc<Bridge>> {
        self.read_entries().get(id).and_then(|e| e.bridge.clone())
    }

    // ── Loading ─────────────────────────────────────────────────────────────

    pub async fn load_extension(&self, manifest: Manifest) -> Result<LoadedExtension> {
        self.load_extension_with(manifest, None).await
    }

    /// Register (if needed) and load `manifest`, passing `context` in the
    /// init event. Returns the existing entry unchanged if already loaded.
    pub async fn load_extension_with(
        &self,
        manifest: Manifest,
        context: Option<Value>,
    ) -> Result<LoadedExtension> {
        let _guard = self.load_lock.lock().await;

        let id = manifest.id.clone();
        if let Some(existing) = self.get(&id)
            && existing.is_loaded()
        {
            debug!(extension = %id, "extension already loaded");
            return Ok(existing);
        }

        self.register(manifest)?;
        let entry = self
            .get(&id)
            .ok_or_else(|| Error::NotRegistered { id: id.clone() })?;

        let spec = ContextSpec {
            extension_id: id.clone(),
            entrypoint: entry.manifest.entrypoint.clone(),
            origin: entry.origin.clone(),
            policy: SandboxPolicy::minimal(),
            channel: Arc::clone(&self.channel),
        };
        let ctx = self.sandbox.create(spec).await?;
        if ctx.origin() != entry.origin {
            ctx.destroy().await;
            return Err(Error::sandbox(format!(
                "context for {id} reports origin {}, expected {}",
                ctx.origin(),
                entry.origin
            )));
        }

        let mut permissions = PermissionSet::from_declared(entry.manifest.permissions.iter().cloned());
        if let Some(approval) = self.approvals.get(&id) {
            permissions = permissions.restricted_by(approval);
        }

        let bridge = Bridge::new(
            id.clone(),
            entry.origin.clone(),
            permissions,
            Arc::clone(&self.handlers),
            Arc::clone(&self.channel),
            Arc::clone(&ctx),
        );
        bridge.attach();

        if let Err(e) = Self::announce(&bridge, context) {
            bridge.detach();
            ctx.destroy().await;
            return Err(e);
        }

        let loaded = LoadedExtension {
            context: Some(Arc::clone(&ctx)),
            bridge: Some(Arc::clone(&bridge)),
            ..entry
        };
        self.write_entries().insert(id.clone(), loaded.clone());
        self.publish();

        info!(
            extension = %id,
            origin = %loaded.origin,
            handle = %ctx.handle(),
            permissions = ?bridge.permissions().to_vec(),
            "extension loaded"
        );
        Ok(loaded)
    }

    fn announce(bridge: &Bridge, context: Option<Value>) -> Result<()> {
        let init = lifecycle::InitPayload {
            extension_id: bridge.extension_id().to_string(),
            capabilities: bridge.permissions().to_vec(),
            context,
        };
        bridge.post(lifecycle::INIT, serde_json::to_value(init)?)?;
        bridge.post(lifecycle::MOUNTED, json!({}))
    }

    /// Tell a loaded extension that host-side context changed.
    pub fn notify_context_change(&self, id: &str, data: Value) -> Result<()> {
        let bridge = self
            .bridge(id)
            .ok_or_else(|| Error::NotRegistered { id: id.to_string() })?;
        bridge.post(lifecycle::CONTEXT_CHANGED, data)
    }

    /// Send the unloading notice, detach the bridge, destroy the context and
    /// unregister. Returns `false` if `id` was not registered.
    pub async fn unload_extension(&self, id: &str) -> bool {
        let _guard = self.load_lock.lock().await;
        let Some(entry) = self.get(id) else {
            return false;
        };

        if let Some(bridge) = &entry.bridge {
            if let Err(e) = bridge.post(lifecycle::UNLOADING, json!({})) {
                debug!(extension = %id, error = %e, "unloading notice not delivered");
            }
            bridge.detach();
        }
        if let Some(ctx) = &entry.context {
            ctx.destroy().await;
        }
        self.unregister(id);
        info!(extension = %id, "extension unloaded");
        true
    }

    /// Unload every registered extension. Returns how many were removed.
    pub async fn unload_all(&self) -> usize {
        let ids: Vec<String> = self.list().into_iter().map(|e| e.manifest.id.clone()).collect();
        let mut count = 0;
        for id in ids {
            if self.unload_extension(&id).await {
                count += 1;
            }
        }
        count
    }

    // ── Reactive view ───────────────────────────────────────────────────────

    pub fn subscribe(&self) -> watch::Receiver<Vec<ExtensionInfo>> {
        self.view.subscribe()
    }

    pub fn snapshot(&self) -> Vec<ExtensionInfo> {
        self.view.borrow().clone()
    }

    fn publish(&self) {
        let infos = self.list().iter().map(LoadedExtension::info).collect();
        self.view.send_replace(infos);
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, LoadedExtension>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, LoadedExtension>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}
