use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use tempfile::TempDir;

use chatshell::error::ErrorType;
use chatshell::session::{Role, DEFAULT_SYSTEM_PROMPT};
use chatshell::{ClientError, ClientFactory, Dispatcher, ModelConfig, SessionError, SessionManager, SessionStore};

#[test]
fn demo_session_lifecycle() {
    let mut manager = SessionManager::new(SessionStore::new());

    let created = manager.create_session("Demo", "", "hi").unwrap();
    assert!(created.warning.is_none());

    let demo = &created.session;
    assert_eq!(demo.system_prompt, DEFAULT_SYSTEM_PROMPT);
    assert_eq!(demo.messages.len(), 1);
    assert_eq!(demo.messages[0].role, Role::User);
    assert_eq!(demo.messages[0].content, "hi");
    assert!(demo.is_active);

    let before = demo.updated_at;
    thread::sleep(Duration::from_millis(5));
    manager.add_message("Demo", Role::Assistant, "hello").unwrap();

    let demo = manager.get_by_name("Demo").unwrap();
    assert_eq!(demo.messages.len(), 2);
    assert!(demo.updated_at > before);
    assert!(demo.is_active);
    assert_eq!(manager.active().map(|s| s.name.as_str()), Some("Demo"));
}

#[test]
fn names_version_and_prefixes_resolve() {
    let mut manager = SessionManager::new(SessionStore::new());
    manager.create_session("ab", "", "").unwrap();
    manager.create_session("abc", "", "").unwrap();
    let dup = manager.create_session("ab", "", "").unwrap();

    assert_eq!(dup.session.name, "ab:v1");
    assert!(dup.warning.is_some());
    assert_eq!(manager.find_by_prefix("ab").unwrap().name, "ab");
    assert_matches!(
        manager.find_by_prefix("a"),
        Err(SessionError::Ambiguous { matches, .. }) if matches.len() == 3
    );
    assert_matches!(manager.find_by_prefix("zzz"), Err(SessionError::NotFound { .. }));
}

#[test]
fn export_import_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("demo.json");

    let mut source = SessionManager::new(SessionStore::new());
    source.create_session("Demo", "Be terse.", "hi").unwrap();
    source.add_message("Demo", Role::Assistant, "hello").unwrap();
    source.export_to_json("Demo", &path).unwrap();

    let mut target = SessionManager::new(SessionStore::new());
    let original = source.get_by_name("Demo").unwrap();
    let imported = target.import_from_json(&path).unwrap();

    assert_ne!(imported.id, original.id);
    assert_eq!(imported.system_prompt, "Be terse.");
    let contents = |s: &chatshell::ChatSession| {
        s.messages
            .iter()
            .map(|m| (m.role, m.content.clone(), m.timestamp))
            .collect::<Vec<_>>()
    };
    assert_eq!(contents(imported), contents(original));
    assert!(imported.is_active);
}

#[tokio::test]
async fn rate_limit_is_reported_in_the_response() {
    let factory = Arc::new(ClientFactory::new());
    let dispatcher = Dispatcher::with_factory(factory.clone());
    let client = factory.get_client("mock", "offline").unwrap();

    let mut manager = SessionManager::new(SessionStore::new());
    let created = manager.create_session("Faults", "", "please trigger rate limit").unwrap();

    let response = dispatcher
        .send_structured_completion(Some(client.as_ref()), &created.session, &ModelConfig::new("mock", "mock-1"))
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.code, "rate_limit_exceeded");
    assert_eq!(error.kind, ErrorType::ApiError);
    assert!(!response.thinking_blocks.is_empty());
    assert!(!response.text_content.is_empty());
}

#[tokio::test]
async fn chat_round_trip_through_factory() {
    let factory = Arc::new(ClientFactory::new());
    let dispatcher = Dispatcher::with_factory(factory.clone());
    let (id, client) = factory.get_client_with_id("mock", "offline").unwrap();
    let same = factory.get_client_by_id(&id).unwrap();
    assert_eq!(Arc::as_ptr(&client) as *const (), Arc::as_ptr(&same) as *const ());

    let mut manager = SessionManager::new(SessionStore::new());
    manager.create_session("Chat", "", "").unwrap();
    manager.add_message("Chat", Role::User, "how are you").unwrap();

    let session = manager.get_by_name("Chat").unwrap().clone();
    let config = ModelConfig::new("mock", "mock-1");

    let reply = dispatcher
        .send_chat_completion(Some(client.as_ref()), &session, &config)
        .await
        .unwrap();
    manager.add_message("Chat", Role::Assistant, &reply).unwrap();

    let mut stream = dispatcher
        .stream_chat_completion(Some(client.as_ref()), &session, &config)
        .await
        .unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk);
    }

    assert_eq!(manager.get_by_name("Chat").unwrap().messages.len(), 2);
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    assert!(chunks.last().unwrap().done);
    assert_eq!(chunks.iter().map(|c| c.content.as_str()).collect::<String>(), reply);
}

#[tokio::test]
async fn unsupported_provider_lists_alternatives() {
    let factory = ClientFactory::new();
    let err = factory.get_client("acme", "k").err().unwrap();

    assert_matches!(&err, ClientError::UnsupportedProvider { .. });
    assert!(err.to_string().contains("openai-reasoning"));
}
