//! `check` and `hash`: offline and online manifest inspection.

use std::{path::Path, sync::Arc};

use {
    anyhow::{Context, Result},
    palisade_extensions::{
        ExtensionRegistry, HandlerRegistry, Manifest, ManifestValidator, MessageChannel,
        PrivilegedNamespace,
        manifest::{INTEGRITY_FIELD, integrity_digest},
        sandbox::ChannelHost,
    },
    serde_json::{Value, json},
};

/// Fetch `url`, run every check `load` would run, and print a summary.
/// Nothing is loaded.
pub async fn check(url: &str, fetch_timeout_secs: u64, as_json: bool) -> Result<()> {
    let scratch = Arc::new(ExtensionRegistry::new(
        Arc::new(HandlerRegistry::new()),
        ChannelHost::new(),
        MessageChannel::new(),
    ));
    let cfg = palisade_config::ExtensionsConfig {
        fetch_timeout_secs,
        ..Default::default()
    };
    let validator = ManifestValidator::from_config(&cfg, scratch)?;

    let descriptor = validator.fetch(url).await?;
    let manifest = ManifestValidator::verify(descriptor)?;
    let summary = summarize(&manifest)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

/// Print the canonical digest of a local descriptor and, when it declares
/// one, whether the declared hash matches.
pub fn hash(path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let descriptor: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    let digest = integrity_digest(&descriptor)?;
    println!("{digest}");

    if let Some(declared) = descriptor.get(INTEGRITY_FIELD).and_then(Value::as_str) {
        match ManifestValidator::verify(descriptor.clone()) {
            Ok(_) => eprintln!("declared {INTEGRITY_FIELD} matches"),
            Err(e) => anyhow::bail!("declared {INTEGRITY_FIELD} {declared}: {e}"),
        }
    }
    Ok(())
}

fn summarize(manifest: &Manifest) -> Result<Value> {
    let privileged: Vec<&str> = manifest
        .permissions
        .iter()
        .filter(|p| PrivilegedNamespace::classify(p).is_some())
        .map(String::as_str)
        .collect();
    Ok(json!({
        "id": manifest.id,
        "name": manifest.name,
        "version": manifest.version,
        "kind": manifest.kind(),
        "origin": manifest.origin()?,
        "entrypoint": manifest.entrypoint.as_str(),
        "permissions": manifest.permissions,
        "privileged": privileged,
        "integrity": manifest.integrity_hash.is_some(),
        "slot": manifest.slot,
    }))
}

fn print_summary(summary: &Value) {
    let field = |key: &str| match &summary[key] {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    println!("{:<12} {}", "id", field("id"));
    println!("{:<12} {}", "name", field("name"));
    println!("{:<12} {}", "version", field("version"));
    println!("{:<12} {}", "kind", field("kind"));
    println!("{:<12} {}", "origin", field("origin"));
    println!("{:<12} {}", "permissions", field("permissions"));
    println!("{:<12} {}", "privileged", field("privileged"));
    println!(
        "{:<12} {}",
        "integrity",
        if summary["integrity"] == true {
            "verified"
        } else {
            "none declared"
        }
    );
}
