//! End-to-end behaviour of loaded extensions over the in-process sandbox.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    palisade_extensions::{
        Error, ExtensionRegistry, HandlerRegistry, Manifest, ManifestValidator, MessageChannel,
        sandbox::{ChannelEndpoint, ChannelHost},
    },
    palisade_protocol::{ErrorPayload, ExtensionMessage, MessageType},
    serde_json::{Value, json},
};

struct Harness {
    registry: Arc<ExtensionRegistry>,
    host: Arc<ChannelHost>,
    handlers: Arc<HandlerRegistry>,
}

impl Harness {
    fn new() -> Self {
        let handlers = Arc::new(HandlerRegistry::new());
        let host = ChannelHost::new();
        let registry = Arc::new(ExtensionRegistry::new(
            handlers.clone(),
            host.clone(),
            MessageChannel::new(),
        ));
        Self {
            registry,
            host,
            handlers,
        }
    }

    async fn load(&self, id: &str, entrypoint: &str, permissions: &[&str]) -> ChannelEndpoint {
        let manifest = Manifest::from_value(json!({
            "id": id,
            "name": id,
            "entrypoint": entrypoint,
            "permissions": permissions,
        }))
        .unwrap();
        self.registry.load_extension(manifest).await.unwrap();
        self.host.take_endpoint(id).unwrap()
    }
}

async fn next_response(endpoint: &mut ChannelEndpoint) -> ExtensionMessage {
    let msg = tokio::time::timeout(Duration::from_secs(5), endpoint.recv_non_lifecycle())
        .await
        .expect("no response within 5s")
        .expect("context closed");
    assert_eq!(msg.kind, MessageType::Response);
    msg
}

fn counting_handler(handlers: &HandlerRegistry, action: &str) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    handlers.register_fn(action, move |payload, ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"handledFor": ctx.extension_id, "echo": payload}))
        }
    });
    calls
}

#[tokio::test]
async fn demo_scenario() {
    let h = Harness::new();
    let server_manifest = json!({
        "id": "demo",
        "name": "Demo",
        "entrypoint": "https://ext.example/app",
        "permissions": ["data:query"],
    });
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/demo.json")
        .with_status(200)
        .with_body(server_manifest.to_string())
        .create_async()
        .await;

    let validator = ManifestValidator::new(reqwest::Client::new(), h.registry.clone());
    let manifest = validator
        .load(&format!("{}/demo.json", server.url()))
        .await
        .unwrap();
    assert!(h.registry.get("demo").is_some());

    h.registry.load_extension(manifest).await.unwrap();
    let mut endpoint = h.host.take_endpoint("demo").unwrap();
    let bridge = h.registry.bridge("demo").unwrap();

    let pending = bridge.request("data:query", json!({"sql": "select 1"})).unwrap();
    let request = endpoint.recv_non_lifecycle().await.unwrap();
    assert_eq!(request.kind, MessageType::Request);
    assert_eq!(request.action, "data:query");
    endpoint.reply(&ExtensionMessage::response(
        request.id.unwrap(),
        "data:query",
        json!({"rows": [[1]]}),
    ));
    assert_eq!(pending.await.unwrap(), json!({"rows": [[1]]}));

    let denied = bridge.request("data:publish", json!({}));
    assert!(matches!(denied, Err(Error::PermissionDenied { .. })));
    assert!(endpoint.try_recv().is_none());
}

#[tokio::test]
async fn spoofed_origin_from_another_context_is_never_dispatched() {
    let h = Harness::new();
    let calls = counting_handler(&h.handlers, "ui:notify");
    let mut a = h.load("a", "https://a.example/app", &[]).await;
    let b = h.load("b", "https://b.example/app", &[]).await;

    // b's context claims a's origin.
    h.registry.channel().post(palisade_extensions::InboundEnvelope {
        source: b.handle(),
        origin: a.origin().to_string(),
        data: json!({"type": "request", "id": "x", "action": "ui:notify", "payload": "spoof"}),
    });
    // a's context with a forged origin.
    h.registry.channel().post(palisade_extensions::InboundEnvelope {
        source: a.handle(),
        origin: "https://a.example.evil".into(),
        data: json!({"type": "request", "id": "y", "action": "ui:notify"}),
    });
    // The genuine request.
    a.reply(&ExtensionMessage::request("z", "ui:notify", json!("real")));

    let response = next_response(&mut a).await;
    assert_eq!(response.id.as_deref(), Some("z"));
    assert_eq!(response.payload.unwrap()["echo"], "real");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(a.try_recv().is_none());
}

#[tokio::test]
async fn inbound_privileged_request_is_answered_with_error() {
    let h = Harness::new();
    let calls = counting_handler(&h.handlers, "storage:set");
    let mut ep = h.load("demo", "https://ext.example/app", &["data:query"]).await;

    ep.reply(&ExtensionMessage::request("r1", "storage:set", json!({"k": "v"})));
    let response = next_response(&mut ep).await;
    assert_eq!(response.id.as_deref(), Some("r1"));
    assert_eq!(response.action, "storage:set");
    let err = ErrorPayload::from_value(response.payload.as_ref().unwrap()).unwrap();
    assert!(err.error.contains("not permitted"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn each_request_gets_exactly_one_response() {
    let h = Harness::new();
    h.handlers
        .register_fn("host:ok", |_, _| async { Ok(json!("fine")) });
    h.handlers.register_fn("host:err", |_, _| async {
        Err::<Value, _>(anyhow::anyhow!("backend offline"))
    });
    h.handlers.register_fn("host:panic", |payload: Value, _| async move {
        if payload.is_null() {
            panic!("handler bug");
        }
        Ok(Value::Null)
    });
    let mut ep = h.load("demo", "https://ext.example/app", &[]).await;

    for (id, action) in [("1", "host:ok"), ("2", "host:err"), ("3", "host:panic"), ("4", "host:none")] {
        ep.reply(&ExtensionMessage {
            id: Some(id.into()),
            kind: MessageType::Request,
            action: action.into(),
            payload: None,
        });
    }

    let mut responses = Vec::new();
    for _ in 0..4 {
        responses.push(next_response(&mut ep).await);
    }
    responses.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(responses[0].payload, Some(json!("fine")));
    assert!(ErrorPayload::from_value(responses[1].payload.as_ref().unwrap()).is_some());
    assert!(ErrorPayload::from_value(responses[2].payload.as_ref().unwrap()).is_some());
    assert_eq!(responses[3].payload, Some(Value::Null));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(ep.try_recv().is_none());
}

#[tokio::test]
async fn concurrent_requests_resolve_independently() {
    let h = Harness::new();
    let mut ep = h.load("demo", "https://ext.example/app", &[]).await;
    let bridge = h.registry.bridge("demo").unwrap();

    let first = bridge.request("ui:ask", json!(1)).unwrap();
    let second = bridge.request("ui:ask", json!(2)).unwrap();
    assert_ne!(first.id(), second.id());

    let r1 = ep.recv_non_lifecycle().await.unwrap();
    let r2 = ep.recv_non_lifecycle().await.unwrap();
    // Answer out of order, plus a duplicate.
    ep.reply(&ExtensionMessage::response(r2.id.clone().unwrap(), "ui:ask", json!("two")));
    ep.reply(&ExtensionMessage::response(r1.id.clone().unwrap(), "ui:ask", json!("one")));
    ep.reply(&ExtensionMessage::response(r1.id.unwrap(), "ui:ask", json!("again")));

    assert_eq!(first.await.unwrap(), json!("one"));
    assert_eq!(second.await.unwrap(), json!("two"));
    assert_eq!(bridge.pending_count(), 0);
}

#[tokio::test]
async fn unloading_rejects_pending_and_ignores_late_traffic() {
    let h = Harness::new();
    let calls = counting_handler(&h.handlers, "ui:notify");
    let ep = h.load("demo", "https://ext.example/app", &[]).await;
    let bridge = h.registry.bridge("demo").unwrap();
    let pending = bridge.request("ui:ask", Value::Null).unwrap();

    assert!(h.registry.unload_extension("demo").await);
    assert!(matches!(pending.await, Err(Error::Unloaded { .. })));

    ep.reply(&ExtensionMessage::request("late", "ui:notify", Value::Null));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(h.registry.list().is_empty());
}

#[tokio::test]
async fn reload_after_unload_creates_fresh_context() {
    let h = Harness::new();
    let first = h.load("demo", "https://ext.example/app", &[]).await;
    h.registry.unload_extension("demo").await;
    let second = h.load("demo", "https://ext.example/app", &[]).await;
    assert_ne!(first.handle(), second.handle());
    assert_eq!(h.host.created(), 2);
}
