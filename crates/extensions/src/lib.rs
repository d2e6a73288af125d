//! Extension sandboxing and the permission-scoped RPC bridge.
//!
//! Third-party extensions run in isolated contexts and reach the host only
//! through a [`Bridge`]: every inbound message is pinned to the context that
//! produced it, every privileged action is checked against the extension's
//! declared permissions, and every request gets exactly one response.
//!
//! Components, leaves first:
//! - [`manifest`], [`validator`]: descriptor shape, integrity and fetching
//! - [`handlers`]: action name to host handler
//! - [`slots`]: named UI injection points
//! - [`sandbox`]: isolated contexts and the shared inbound channel
//! - [`bridge`]: per-extension protocol broker
//! - [`registry`]: lifecycle of loaded extensions

pub mod bridge;
pub mod error;
pub mod handlers;
pub mod manifest;
pub mod permissions;
pub mod registry;
pub mod sandbox;
pub mod slots;
pub mod validator;

pub use {
    bridge::{Bridge, Dispatch, PendingResponse},
    error::{Error, Result},
    handlers::{BridgeHandler, ExtensionContext, HandlerRegistry},
    manifest::{ExtensionKind, Manifest, SlotConfig, SlotKind},
    permissions::{ApprovalRecord, PermissionSet, PrivilegedNamespace},
    registry::{ExtensionInfo, ExtensionRegistry, LoadedExtension},
    sandbox::{
        ContextHandle, ContextSpec, InboundEnvelope, IsolatedContext, MessageChannel,
        SandboxCapability, SandboxHost, SandboxPolicy,
    },
    slots::{SlotContext, SlotId, SlotRegistry, SlotReport},
    validator::ManifestValidator,
};
