//! Host-side action handlers reachable from extensions.
//!
//! The registry is an explicit object owned by the composition root and
//! shared with every [`Bridge`](crate::Bridge) as an `Arc`. Registering an
//! action that already has a handler replaces it; callers namespace their
//! action names to avoid collisions.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, RwLock},
};

use {async_trait::async_trait, serde_json::Value, tracing::debug};

/// What a handler learns about the extension that called it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionContext {
    pub extension_id: String,
    pub origin: String,
    pub permissions: Vec<String>,
}

/// An async host function bound to one action name.
///
/// The returned value becomes the response payload verbatim; an error is
/// turned into an `{error}` response by the bridge.
#[async_trait]
pub trait BridgeHandler: Send + Sync {
    async fn handle(&self, payload: Value, ctx: &ExtensionContext) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> BridgeHandler for FnHandler<F>
where
    F: Fn(Value, ExtensionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, payload: Value, ctx: &ExtensionContext) -> anyhow::Result<Value> {
        (self.0)(payload, ctx.clone()).await
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn BridgeHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, action: impl Into<String>, handler: Arc<dyn BridgeHandler>) {
        let action = action.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(action.clone(), handler).is_some() {
            debug!(action = %action, "bridge handler replaced");
        } else {
            debug!(action = %action, "bridge handler registered");
        }
    }

    /// Register a closure returning a future.
    pub fn register_fn<F, Fut>(&self, action: impl Into<String>, f: F)
    where
        F: Fn(Value, ExtensionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(action, Arc::new(FnHandler(f)));
    }

    pub fn remove(&self, action: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(action)
            .is_some()
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn BridgeHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(action)
            .cloned()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        actions.sort();
        actions
    }
}
