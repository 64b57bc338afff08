use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use duet::{
    actors::delivery_bus::DeliveryBus,
    blob::LocalBlobStore,
    config::Config,
    duet_route,
    events::DeliveryEvent,
    ledger::VisibilityLedger,
    messages::MessageService,
    models::{MessageId, PageRequest},
    paginator::Paginator,
    registry::ConversationRegistry,
    state::AppStateBuilder,
    store::{ChatStore, MemoryStore},
    unread::UnreadTracker,
};
use serde_json::{Value, json};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

const A: i64 = 1;
const B: i64 = 2;

struct Core {
    store: Arc<MemoryStore>,
    bus: DeliveryBus,
    registry: ConversationRegistry,
    ledger: VisibilityLedger,
    unread: UnreadTracker,
    paginator: Paginator,
    messages: MessageService,
    _storage: TempDir,
}

async fn core() -> Core {
    let storage = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let blobs = Arc::new(LocalBlobStore::new(storage.path()).await.unwrap());
    let bus = DeliveryBus::spawn();
    Core {
        registry: ConversationRegistry::new(store.clone(), bus.clone()),
        ledger: VisibilityLedger::new(store.clone(), blobs.clone(), bus.clone()),
        unread: UnreadTracker::new(store.clone(), bus.clone()),
        paginator: Paginator::new(store.clone(), 30),
        messages: MessageService::new(store.clone(), blobs, bus.clone(), 10),
        store,
        bus,
        _storage: storage,
    }
}

async fn next_event(rx: &mut mpsc::Receiver<String>) -> DeliveryEvent {
    let raw = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no event within a second")
        .expect("connection closed");
    serde_json::from_str(&raw).unwrap()
}

fn ids(page: &duet::models::MessagePage) -> Vec<MessageId> {
    page.items.iter().map(|m| m.id).collect()
}

#[tokio::test]
async fn unread_read_edit_delete_flow() {
    let core = core().await;
    let conversation_id = core.registry.get_or_create_dialog(A, B).await.unwrap();
    let (tx, mut b_rx) = mpsc::channel(16);
    core.bus.register(B, tx);

    let m1 = core
        .messages
        .send_message(conversation_id, A, "hi", Vec::new())
        .await
        .unwrap();
    assert!(matches!(next_event(&mut b_rx).await, DeliveryEvent::NewMessage { .. }));
    assert_eq!(core.unread.unread_count(conversation_id, B).await.unwrap(), 1);

    assert!(core.unread.mark_read(conversation_id, B, None).await.unwrap());
    assert_eq!(core.unread.unread_count(conversation_id, B).await.unwrap(), 0);
    assert_eq!(
        next_event(&mut b_rx).await,
        DeliveryEvent::ConversationUpdated {
            conversation_id,
            unread_count: 0,
        }
    );

    core.messages
        .edit_message(m1.id, A, "hi there")
        .await
        .unwrap();
    match next_event(&mut b_rx).await {
        DeliveryEvent::MessageEdited { message, .. } => {
            assert_eq!(message.id, m1.id);
            assert_eq!(message.content, "hi there");
        }
        other => panic!("expected message_edited, got {:?}", other),
    }

    core.ledger.delete_message(m1.id, A, "all").await.unwrap();
    assert_eq!(
        next_event(&mut b_rx).await,
        DeliveryEvent::MessageDeleted {
            conversation_id,
            message_id: m1.id,
        }
    );

    for viewer in [A, B] {
        let page = core
            .paginator
            .fetch_page(conversation_id, viewer, PageRequest::default())
            .await
            .unwrap();
        assert!(page.items.is_empty());
    }
}

#[tokio::test]
async fn forty_messages_split_into_two_pages() {
    let core = core().await;
    let conversation_id = core.registry.get_or_create_dialog(A, B).await.unwrap();

    let mut sent = Vec::new();
    for i in 0..40 {
        let from = if i % 2 == 0 { A } else { B };
        let view = core
            .messages
            .send_message(conversation_id, from, &format!("message {}", i), Vec::new())
            .await
            .unwrap();
        sent.push(view.id);
    }

    let first = core
        .paginator
        .fetch_page(
            conversation_id,
            A,
            PageRequest {
                limit: Some(30),
                ..PageRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(ids(&first), sent[10..].to_vec());
    assert!(first.has_more);
    assert_eq!(first.next_before_id, Some(sent[10]));

    let second = core
        .paginator
        .fetch_page(
            conversation_id,
            A,
            PageRequest {
                before_id: first.next_before_id,
                limit: Some(30),
                search: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(ids(&second), sent[..10].to_vec());
    assert!(!second.has_more);
}

#[tokio::test]
async fn backward_walk_is_stable_under_new_messages() {
    let core = core().await;
    let conversation_id = core.registry.get_or_create_dialog(A, B).await.unwrap();
    for i in 0..23 {
        core.messages
            .send_message(conversation_id, A, &format!("old {}", i), Vec::new())
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut before_id = None;
    loop {
        let page = core
            .paginator
            .fetch_page(
                conversation_id,
                B,
                PageRequest {
                    before_id,
                    limit: Some(5),
                    search: None,
                },
            )
            .await
            .unwrap();
        // Newer traffic must not shift what the cursor points at.
        core.messages
            .send_message(conversation_id, B, "meanwhile", Vec::new())
            .await
            .unwrap();

        let mut chunk = ids(&page);
        chunk.reverse();
        seen.extend(chunk);
        if !page.has_more {
            break;
        }
        before_id = page.next_before_id;
    }

    assert_eq!(seen.len(), 23);
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), 23);
    assert!(seen.windows(2).all(|w| w[0] > w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dialog_creation_converges() {
    let core = core().await;
    let registry = core.registry.clone();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    registry.get_or_create_dialog(A, B).await
                } else {
                    registry.get_or_create_dialog(B, A).await
                }
            })
        })
        .collect();

    let mut results = HashSet::new();
    for handle in handles {
        results.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(results.len(), 1);
    assert_eq!(core.store.memberships(A).await.unwrap().len(), 1);
    assert_eq!(core.store.memberships(B).await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_for_self_versus_for_all() {
    let core = core().await;
    let conversation_id = core.registry.get_or_create_dialog(A, B).await.unwrap();
    let mine = core
        .messages
        .send_message(conversation_id, A, "only B hides this", Vec::new())
        .await
        .unwrap();
    let gone = core
        .messages
        .send_message(conversation_id, A, "nobody sees this", Vec::new())
        .await
        .unwrap();

    core.ledger.delete_message(mine.id, B, "me").await.unwrap();
    core.ledger.delete_message(gone.id, A, "all").await.unwrap();

    let page_a = core
        .paginator
        .fetch_page(conversation_id, A, PageRequest::default())
        .await
        .unwrap();
    let page_b = core
        .paginator
        .fetch_page(conversation_id, B, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(ids(&page_a), vec![mine.id]);
    assert!(page_b.items.is_empty());
    assert_eq!(core.unread.unread_count(conversation_id, B).await.unwrap(), 0);

    // New messages still arrive after a per-user clear.
    core.registry.clear(conversation_id, B, "me").await.unwrap();
    let later = core
        .messages
        .send_message(conversation_id, A, "after clear", Vec::new())
        .await
        .unwrap();
    let page_b = core
        .paginator
        .fetch_page(conversation_id, B, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(ids(&page_b), vec![later.id]);
}

#[tokio::test]
async fn http_surface_round_trip() {
    let storage = TempDir::new().unwrap();
    let config = Config {
        storage_dir: storage.path().to_path_buf(),
        ..Config::default()
    };
    let state = AppStateBuilder::new()
        .with_config(config)
        .with_store(Arc::new(MemoryStore::new()))
        .build()
        .await
        .unwrap();
    let app = duet_route(Arc::new(state));

    let request = |method: &str, uri: &str, user: Option<i64>, body: Option<Value>| {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user.to_string());
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    };
    let read_json = |response: axum::response::Response| async move {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice::<Value>(&bytes).unwrap()
    };

    let response = app
        .clone()
        .oneshot(request("POST", "/conversations/start", None, Some(json!({"peer_id": B}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(request("POST", "/conversations/start", Some(A), Some(json!({"peer_id": A}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["error"], "SELF_DIALOG");

    let response = app
        .clone()
        .oneshot(request("POST", "/conversations/start", Some(A), Some(json!({"peer_id": B}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let conversation_id = read_json(response).await["conversation_id"].as_i64().unwrap();

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/messages/send",
            Some(A),
            Some(json!({"conversation_id": conversation_id, "content": "hello"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let message_id = read_json(response).await["id"].as_i64().unwrap();

    let response = app
        .clone()
        .oneshot(request("GET", "/conversations", Some(B), None))
        .await
        .unwrap();
    let list = read_json(response).await;
    assert_eq!(list[0]["unread_count"], 1);
    assert_eq!(list[0]["last_message_preview"], "hello");

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/conversations/{}/read", conversation_id),
            Some(B),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(read_json(response).await["unread_count"], 0);

    let response = app
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/messages/{}?scope=everyone", message_id),
            Some(A),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["error"], "INVALID_SCOPE");

    let response = app
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/messages/{}?scope=all", message_id),
            Some(B),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(request(
            "GET",
            &format!("/messages/page?conversation_id={}&limit=5", conversation_id),
            Some(B),
            None,
        ))
        .await
        .unwrap();
    let page = read_json(response).await;
    assert_eq!(page["items"][0]["content"], "hello");
    assert_eq!(page["has_more"], false);
    assert_eq!(page["next_before_id"], message_id);
}
