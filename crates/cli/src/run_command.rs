//! `run`: load configured extensions into process sandboxes until Ctrl-C.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    anyhow::Result,
    palisade_config::PalisadeConfig,
    palisade_extensions::{
        ApprovalRecord, ExtensionRegistry, HandlerRegistry, ManifestValidator, MessageChannel,
        sandbox::ProcessHost,
    },
    serde_json::{Value, json},
    tracing::{info, warn},
};

/// Built-in `host:*` actions available to every extension.
pub fn register_builtin_handlers(handlers: &HandlerRegistry) {
    handlers.register_fn("host:ping", |payload, ctx| async move {
        Ok(json!({
            "pong": true,
            "extension": ctx.extension_id,
            "echo": payload,
        }))
    });
    handlers.register_fn("host:log", |payload, ctx| async move {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());
        info!(extension = %ctx.extension_id, origin = %ctx.origin, "{message}");
        Ok(Value::Null)
    });
}

pub async fn run(config: PalisadeConfig, probe: Option<String>) -> Result<()> {
    if config.sandbox.launcher.is_empty() {
        anyhow::bail!("no sandbox launcher configured; set [sandbox] launcher in palisade.toml");
    }

    let handlers = Arc::new(HandlerRegistry::new());
    if config.handlers.builtin {
        register_builtin_handlers(&handlers);
    }

    let approvals: HashMap<String, ApprovalRecord> = config
        .extensions
        .approvals
        .iter()
        .map(|(id, cfg)| (id.clone(), ApprovalRecord::from(cfg)))
        .collect();
    let registry = Arc::new(
        ExtensionRegistry::new(
            handlers,
            Arc::new(ProcessHost::from_config(&config.sandbox)),
            MessageChannel::new(),
        )
        .with_approvals(approvals),
    );
    let validator = ManifestValidator::from_config(&config.extensions, registry.clone())?;
    let timeout = config.extensions.request_timeout_secs.map(Duration::from_secs);

    for url in &config.extensions.manifests {
        let manifest = match validator.load(url).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(url = %url, error = %e, "manifest rejected");
                continue;
            },
        };
        let id = manifest.id.clone();
        if let Err(e) = registry.load_extension(manifest).await {
            warn!(extension = %id, error = %e, "extension failed to load");
            continue;
        }
        if let Some(action) = &probe {
            probe_extension(&registry, &id, action, timeout).await;
        }
    }

    let loaded = registry.list().iter().filter(|e| e.is_loaded()).count();
    info!(loaded, "extensions running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let unloaded = registry.unload_all().await;
    info!(unloaded, "shutdown complete");
    Ok(())
}

/// Send `action` to a freshly loaded extension and log its answer.
async fn probe_extension(
    registry: &ExtensionRegistry,
    id: &str,
    action: &str,
    timeout: Option<Duration>,
) {
    let Some(bridge) = registry.bridge(id) else {
        return;
    };
    let outcome = match timeout {
        Some(limit) => bridge.request_with_timeout(action, Value::Null, limit).await,
        None => match bridge.request(action, Value::Null) {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        },
    };
    match outcome {
        Ok(payload) => info!(extension = %id, action, %payload, "probe answered"),
        Err(e) => warn!(extension = %id, action, error = %e, "probe failed"),
    }
}
