//! Isolated execution contexts and the shared inbound message channel.
//!
//! A context is reachable only by message passing. Whatever transport a
//! [`SandboxHost`] uses, every message it receives from a context is posted
//! to the [`MessageChannel`] stamped with that context's [`ContextHandle`]
//! and origin, so a listener can tell exactly which context produced it.
//! The channel is shared by all extensions and may carry unrelated
//! traffic; listeners filter, they never trust.

pub mod channel;
pub mod process;

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    palisade_protocol::ExtensionMessage,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::sync::mpsc,
    url::Url,
};

pub use {
    channel::{ChannelEndpoint, ChannelHost},
    process::ProcessHost,
};

use crate::error::Result;

// ── ContextHandle ───────────────────────────────────────────────────────────

/// Process-unique identity of one isolated context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle(u64);

impl ContextHandle {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

// ── SandboxPolicy ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxCapability {
    Scripts,
    SameOrigin,
    Forms,
    Popups,
    TopNavigation,
    Modals,
    Downloads,
}

impl SandboxCapability {
    /// Token used by web-view `sandbox` attributes.
    pub fn attribute_token(self) -> &'static str {
        match self {
            Self::Scripts => "allow-scripts",
            Self::SameOrigin => "allow-same-origin",
            Self::Forms => "allow-forms",
            Self::Popups => "allow-popups",
            Self::TopNavigation => "allow-top-navigation",
            Self::Modals => "allow-modals",
            Self::Downloads => "allow-downloads",
        }
    }
}

/// Privileges granted to an isolated context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxPolicy {
    capabilities: BTreeSet<SandboxCapability>,
}

impl SandboxPolicy {
    /// Script execution with same-origin storage; no navigation, popups or
    /// top-level document access.
    pub fn minimal() -> Self {
        Self::default()
            .with(SandboxCapability::Scripts)
            .with(SandboxCapability::SameOrigin)
    }

    #[must_use]
    pub fn with(mut self, capability: SandboxCapability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn allows(&self, capability: SandboxCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = SandboxCapability> + '_ {
        self.capabilities.iter().copied()
    }

    pub fn to_attribute(&self) -> String {
        self.capabilities
            .iter()
            .map(|c| c.attribute_token())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── MessageChannel ──────────────────────────────────────────────────────────

/// A message as it arrives on the shared channel, before any validation.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// Context the transport received this message from.
    pub source: ContextHandle,
    /// Origin the transport attributes to the sender.
    pub origin: String,
    /// Raw, untrusted message body.
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Host-wide inbound channel fanned out to every subscribed listener.
#[derive(Default)]
pub struct MessageChannel {
    listeners: DashMap<ListenerId, mpsc::UnboundedSender<InboundEnvelope>>,
    next_id: AtomicU64,
}

impl MessageChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self) -> (ListenerId, mpsc::UnboundedReceiver<InboundEnvelope>) {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Deliver to every live listener; listeners whose receiver is gone are
    /// pruned.
    pub fn post(&self, envelope: InboundEnvelope) {
        let closed: Vec<ListenerId> = self
            .listeners
            .iter()
            .filter(|entry| entry.value().send(envelope.clone()).is_err())
            .map(|entry| *entry.key())
            .collect();
        for id in closed {
            self.listeners.remove(&id);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

// ── Contexts and hosts ──────────────────────────────────────────────────────

/// What a [`SandboxHost`] needs to create one context.
#[derive(Clone)]
pub struct ContextSpec {
    pub extension_id: String,
    pub entrypoint: Url,
    pub origin: String,
    pub policy: SandboxPolicy,
    pub channel: Arc<MessageChannel>,
}

/// One running isolated context.
#[async_trait]
pub trait IsolatedContext: Send + Sync {
    fn handle(&self) -> ContextHandle;

    /// Origin this context was created for; fixed for its lifetime.
    fn origin(&self) -> &str;

    /// Push a host → extension message into the context.
    fn deliver(&self, message: &ExtensionMessage) -> Result<()>;

    /// Tear the context down. Idempotent.
    async fn destroy(&self);
}

/// Creates isolated contexts on the host surface.
#[async_trait]
pub trait SandboxHost: Send + Sync {
    async fn create(&self, spec: ContextSpec) -> Result<Arc<dyn IsolatedContext>>;
}
