//! Per-extension message broker.
//!
//! A [`Bridge`] is bound to exactly one isolated context. It listens on the
//! shared [`MessageChannel`], accepts only envelopes whose source handle and
//! origin both match its context, enforces the extension's permission set
//! in both directions, and correlates request/response pairs by id.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use {
    futures::FutureExt,
    palisade_protocol::{ErrorPayload, ExtensionMessage, MAX_PAYLOAD_BYTES, MessageType},
    serde_json::Value,
    tokio::{sync::oneshot, task::JoinHandle},
    tracing::{debug, trace, warn},
};

use crate::{
    error::{Error, Result},
    handlers::{ExtensionContext, HandlerRegistry},
    permissions::PermissionSet,
    sandbox::{ContextHandle, InboundEnvelope, IsolatedContext, ListenerId, MessageChannel},
};

/// What [`Bridge::handle_message`] did with one envelope.
#[derive(Debug)]
pub enum Dispatch {
    /// Not for this bridge, malformed, oversized, or arrived after detach.
    Dropped,
    /// A pending request was resolved.
    Resolved,
    /// Accepted but nothing to do (unknown response id, inbound event).
    Ignored,
    /// Request refused by the permission check; an error response was sent.
    Denied,
    /// Request handed to a handler; the task sends the single response.
    Request(JoinHandle<()>),
}

struct Listener {
    id: ListenerId,
    task: JoinHandle<()>,
}

pub struct Bridge {
    extension_id: String,
    origin: String,
    permissions: PermissionSet,
    handlers: Arc<HandlerRegistry>,
    channel: Arc<MessageChannel>,
    context: RwLock<Option<Arc<dyn IsolatedContext>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    listener: Mutex<Option<Listener>>,
    detached: AtomicBool,
}

impl Bridge {
    pub fn new(
        extension_id: impl Into<String>,
        origin: impl Into<String>,
        permissions: PermissionSet,
        handlers: Arc<HandlerRegistry>,
        channel: Arc<MessageChannel>,
        context: Arc<dyn IsolatedContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            extension_id: extension_id.into(),
            origin: origin.into(),
            permissions,
            handlers,
            channel,
            context: RwLock::new(Some(context)),
            pending: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            detached: AtomicBool::new(false),
        })
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    /// Handle of the bound context, `None` once detached.
    pub fn context_handle(&self) -> Option<ContextHandle> {
        self.bound_context().map(|ctx| ctx.handle())
    }

    pub fn is_attached(&self) -> bool {
        self.lock_listener().is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    // ── Listener ────────────────────────────────────────────────────────────

    /// Start consuming the shared channel. A second call while attached, or
    /// any call after [`detach`](Self::detach), does nothing.
    pub fn attach(self: &Arc<Self>) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        let mut listener = self.lock_listener();
        // detach() flips the flag before taking this lock.
        if listener.is_some() || self.detached.load(Ordering::Acquire) {
            return;
        }

        let (id, mut rx) = self.channel.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Some(bridge) = weak.upgrade() else {
                    break;
                };
                bridge.handle_message(envelope);
            }
        });
        *listener = Some(Listener { id, task });
        debug!(extension = %self.extension_id, "bridge attached");
    }

    /// Stop dispatching, reject every outstanding request with
    /// [`Error::Unloaded`], and unbind the context. Idempotent.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.lock_listener().take() {
            self.channel.unsubscribe(listener.id);
            listener.task.abort();
        }
        let abandoned = {
            let mut pending = self.lock_pending();
            let n = pending.len();
            pending.clear();
            n
        };
        self.context
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        debug!(extension = %self.extension_id, abandoned, "bridge detached");
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    pub fn handle_message(self: &Arc<Self>, envelope: InboundEnvelope) -> Dispatch {
        let Some(bound) = self.context_handle() else {
            return Dispatch::Dropped;
        };
        if envelope.source != bound || envelope.origin != self.origin {
            trace!(
                extension = %self.extension_id,
                source = %envelope.source,
                origin = %envelope.origin,
                "foreign message dropped"
            );
            return Dispatch::Dropped;
        }
        let size = serde_json::to_vec(&envelope.data).map_or(usize::MAX, |b| b.len());
        if size > MAX_PAYLOAD_BYTES {
            debug!(extension = %self.extension_id, size, "oversized message dropped");
            return Dispatch::Dropped;
        }
        let message: ExtensionMessage = match serde_json::from_value(envelope.data) {
            Ok(message) => message,
            Err(e) => {
                debug!(extension = %self.extension_id, error = %e, "malformed message dropped");
                return Dispatch::Dropped;
            },
        };
        trace!(
            extension = %self.extension_id,
            kind = ?message.kind,
            action = %message.action,
            "inbound message"
        );

        match message.kind {
            MessageType::Response => self.resolve(message),
            MessageType::Request => self.dispatch_request(message),
            MessageType::Event => {
                debug!(extension = %self.extension_id, action = %message.action, "inbound event ignored");
                Dispatch::Ignored
            },
        }
    }

    fn resolve(&self, message: ExtensionMessage) -> Dispatch {
        let Some(id) = message.id.as_deref() else {
            return Dispatch::Ignored;
        };
        let Some(tx) = self.lock_pending().remove(id) else {
            trace!(extension = %self.extension_id, id, "response for unknown id ignored");
            return Dispatch::Ignored;
        };
        // The caller may have dropped its PendingResponse.
        let _ = tx.send(message.payload_or_null());
        Dispatch::Resolved
    }

    fn dispatch_request(self: &Arc<Self>, message: ExtensionMessage) -> Dispatch {
        let Some(id) = message.id.clone() else {
            debug!(extension = %self.extension_id, action = %message.action, "request without id dropped");
            return Dispatch::Dropped;
        };
        let action = message.action.clone();

        if let Err(e) = self.permissions.check(&self.extension_id, &action) {
            debug!(extension = %self.extension_id, action = %action, "inbound request denied");
            self.send_or_log(&ExtensionMessage::error_response(id, action, e.to_string()));
            return Dispatch::Denied;
        }

        let payload = message.payload_or_null();
        let bridge = Arc::clone(self);
        Dispatch::Request(tokio::spawn(async move {
            let reply = bridge.run_handler(&action, payload).await;
            bridge.send_or_log(&ExtensionMessage::response(id, action, reply));
        }))
    }

    /// Run the handler for `action` and turn any outcome into a payload.
    async fn run_handler(&self, action: &str, payload: Value) -> Value {
        let Some(handler) = self.handlers.get(action) else {
            return Value::Null;
        };
        let ctx = self.extension_context();
        let outcome = AssertUnwindSafe(handler.handle(payload, &ctx))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(extension = %self.extension_id, action, error = %e, "bridge handler failed");
                let err = Error::Handler {
                    action: action.to_string(),
                    message: e.to_string(),
                };
                ErrorPayload::new(err.to_string()).into_value()
            },
            Err(_) => {
                warn!(extension = %self.extension_id, action, "bridge handler panicked");
                let err = Error::Handler {
                    action: action.to_string(),
                    message: "handler panicked".into(),
                };
                ErrorPayload::new(err.to_string()).into_value()
            },
        }
    }

    // ── Outbound ────────────────────────────────────────────────────────────

    /// Push an `event` into the context. Permission is checked first.
    pub fn post(&self, action: &str, payload: Value) -> Result<()> {
        self.permissions.check(&self.extension_id, action)?;
        self.send(&ExtensionMessage::event(action, payload))
    }

    /// Send a `request` into the context and return a future for its
    /// response payload. An `{error}` payload is returned as-is.
    pub fn request(&self, action: &str, payload: Value) -> Result<PendingResponse> {
        self.permissions.check(&self.extension_id, action)?;

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id.clone(), tx);

        if let Err(e) = self.send(&ExtensionMessage::request(id.clone(), action, payload)) {
            self.lock_pending().remove(&id);
            return Err(e);
        }
        Ok(PendingResponse {
            id,
            extension_id: self.extension_id.clone(),
            rx,
        })
    }

    /// [`request`](Self::request) bounded by `timeout`. On expiry the
    /// pending entry is removed and a late response is ignored.
    pub async fn request_with_timeout(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let pending = self.request(action, payload)?;
        let id = pending.id().to_string();
        match tokio::time::timeout(timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(Error::Timeout {
                    extension: self.extension_id.clone(),
                    action: action.to_string(),
                })
            },
        }
    }

    fn send(&self, message: &ExtensionMessage) -> Result<()> {
        let ctx = self
            .bound_context()
            .ok_or_else(|| Error::unloaded(&self.extension_id))?;
        trace!(
            extension = %self.extension_id,
            kind = ?message.kind,
            action = %message.action,
            "outbound message"
        );
        ctx.deliver(message)
    }

    fn send_or_log(&self, message: &ExtensionMessage) {
        if let Err(e) = self.send(message) {
            debug!(extension = %self.extension_id, action = %message.action, error = %e, "response not delivered");
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn extension_context(&self) -> ExtensionContext {
        ExtensionContext {
            extension_id: self.extension_id.clone(),
            origin: self.origin.clone(),
            permissions: self.permissions.to_vec(),
        }
    }

    fn bound_context(&self) -> Option<Arc<dyn IsolatedContext>> {
        self.context
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Value>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("extension_id", &self.extension_id)
            .field("origin", &self.origin)
            .field("context", &self.context_handle())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ── PendingResponse ─────────────────────────────────────────────────────────

/// Response payload of one outstanding [`Bridge::request`].
///
/// Resolves to `Err(Error::Unloaded)` if the bridge detaches first.
#[must_use = "a request does nothing useful unless its response is awaited"]
pub struct PendingResponse {
    id: String,
    extension_id: String,
    rx: oneshot::Receiver<Value>,
}

impl PendingResponse {
    /// Wire id of the request.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| Error::unloaded(this.extension_id.as_str())))
    }
}
