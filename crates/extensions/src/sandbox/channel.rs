//! In-process sandbox host.
//!
//! Each context is a pair of queues: messages the host delivers land in a
//! [`ChannelEndpoint`] the embedder drives, and the endpoint answers by
//! posting envelopes stamped with its own handle and origin.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    palisade_protocol::ExtensionMessage,
    serde_json::Value,
    tokio::sync::mpsc,
    tracing::debug,
};

use super::{
    ContextHandle, ContextSpec, InboundEnvelope, IsolatedContext, MessageChannel, SandboxHost,
    SandboxPolicy,
};
use crate::error::{Error, Result};

/// Extension-side end of an in-process context.
pub struct ChannelEndpoint {
    handle: ContextHandle,
    origin: String,
    policy: SandboxPolicy,
    inbox: mpsc::UnboundedReceiver<ExtensionMessage>,
    channel: Arc<MessageChannel>,
}

impl ChannelEndpoint {
    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Next message the host delivered; `None` once the context is destroyed.
    pub async fn recv(&mut self) -> Option<ExtensionMessage> {
        self.inbox.recv().await
    }

    /// Next delivered message that is not a lifecycle event.
    pub async fn recv_non_lifecycle(&mut self) -> Option<ExtensionMessage> {
        while let Some(message) = self.inbox.recv().await {
            if !palisade_protocol::lifecycle::is_lifecycle_action(&message.action) {
                return Some(message);
            }
        }
        None
    }

    pub fn try_recv(&mut self) -> Option<ExtensionMessage> {
        self.inbox.try_recv().ok()
    }

    /// Send a message to the host as this context.
    pub fn reply(&self, message: &ExtensionMessage) {
        match serde_json::to_value(message) {
            Ok(data) => self.post_raw(data),
            Err(e) => debug!(error = %e, "failed to encode endpoint message"),
        }
    }

    /// Post an arbitrary body as this context.
    pub fn post_raw(&self, data: Value) {
        self.channel.post(InboundEnvelope {
            source: self.handle,
            origin: self.origin.clone(),
            data,
        });
    }
}

struct ChannelContext {
    handle: ContextHandle,
    origin: String,
    outbox: mpsc::UnboundedSender<ExtensionMessage>,
    destroyed: AtomicBool,
}

#[async_trait]
impl IsolatedContext for ChannelContext {
    fn handle(&self) -> ContextHandle {
        self.handle
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn deliver(&self, message: &ExtensionMessage) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::sandbox(format!("context {} is destroyed", self.handle)));
        }
        self.outbox
            .send(message.clone())
            .map_err(|_| Error::sandbox(format!("context {} endpoint is gone", self.handle)))
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}

/// Creates in-process contexts and keeps their endpoints until taken.
#[derive(Default)]
pub struct ChannelHost {
    endpoints: DashMap<String, ChannelEndpoint>,
    created: AtomicUsize,
}

impl ChannelHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the endpoint of the most recent context created for `extension_id`.
    pub fn take_endpoint(&self, extension_id: &str) -> Option<ChannelEndpoint> {
        self.endpoints.remove(extension_id).map(|(_, ep)| ep)
    }

    /// Total contexts created by this host.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SandboxHost for ChannelHost {
    async fn create(&self, spec: ContextSpec) -> Result<Arc<dyn IsolatedContext>> {
        let handle = ContextHandle::next();
        let (outbox, inbox) = mpsc::unbounded_channel();

        self.endpoints.insert(spec.extension_id.clone(), ChannelEndpoint {
            handle,
            origin: spec.origin.clone(),
            policy: spec.policy,
            inbox,
            channel: spec.channel,
        });
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(extension = %spec.extension_id, handle = %handle, "in-process context created");

        Ok(Arc::new(ChannelContext {
            handle,
            origin: spec.origin,
            outbox,
            destroyed: AtomicBool::new(false),
        }))
    }
}
