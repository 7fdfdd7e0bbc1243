use super::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use push_transport::{ConnectOptions, TransportEvent};
use serde_json::json;

struct TestConnection {
    identity: i64,
    joined: StdMutex<Vec<(String, Option<String>)>>,
    left: StdMutex<Vec<String>>,
    published: StdMutex<Vec<(String, String, serde_json::Value)>>,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl TestConnection {
    fn new(identity: i64) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            identity,
            joined: StdMutex::new(Vec::new()),
            left: StdMutex::new(Vec::new()),
            published: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events,
        })
    }
}

#[async_trait]
impl PushConnection for TestConnection {
    async fn join(&self, channel: &str, auth: Option<&str>) -> Result<()> {
        self.joined
            .lock()
            .expect("lock")
            .push((channel.to_string(), auth.map(str::to_string)));
        Ok(())
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        self.left.lock().expect("lock").push(channel.to_string());
        Ok(())
    }

    async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        self.published
            .lock()
            .expect("lock")
            .push((channel.to_string(), event.to_string(), payload));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
struct TestConnector {
    connections: StdMutex<Vec<Arc<TestConnection>>>,
}

impl TestConnector {
    fn connections(&self) -> Vec<Arc<TestConnection>> {
        self.connections.lock().expect("lock").clone()
    }
}

#[async_trait]
impl PushConnector for TestConnector {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn PushConnection>> {
        let connection = TestConnection::new(options.identity);
        self.connections.lock().expect("lock").push(Arc::clone(&connection));
        Ok(connection)
    }
}

struct TestAuthorizer {
    reject: bool,
}

#[async_trait]
impl ChannelAuthorizer for TestAuthorizer {
    async fn authorize(&self, identity: UserId, channel: &str) -> Result<String, SubscribeError> {
        if self.reject {
            return Err(SubscribeError::Rejected {
                channel: channel.to_string(),
                message: "forbidden".to_string(),
            });
        }
        Ok(format!("token-{}-{channel}", identity.0))
    }
}

fn adapter(connector: &Arc<TestConnector>, reject: bool) -> TransportAdapter {
    TransportAdapter::new(
        Arc::clone(connector) as Arc<dyn PushConnector>,
        Arc::new(TestAuthorizer { reject }),
        "ws://test.invalid/socket",
    )
}

#[test]
fn channel_names_embed_the_id() {
    assert_eq!(user_channel(UserId(7)), "private-user.7");
    assert_eq!(
        conversation_channel(shared::domain::ConversationId(42)),
        "private-conversation.42"
    );
}

#[tokio::test]
async fn connect_is_idempotent_per_identity() {
    let connector = Arc::new(TestConnector::default());
    let adapter = adapter(&connector, false);

    adapter.connect(UserId(7)).await.expect("connect");
    adapter.connect(UserId(7)).await.expect("reconnect");

    assert_eq!(connector.connections().len(), 1);
    assert_eq!(adapter.identity().await, Some(UserId(7)));
}

#[tokio::test]
async fn identity_change_replaces_the_connection() {
    let connector = Arc::new(TestConnector::default());
    let adapter = adapter(&connector, false);

    adapter.connect(UserId(7)).await.expect("connect");
    adapter
        .subscribe_private("private-user.7")
        .await
        .expect("subscribe");
    adapter.connect(UserId(8)).await.expect("switch identity");

    let connections = connector.connections();
    assert_eq!(connections.len(), 2);
    assert!(connections[0].closed.load(Ordering::SeqCst));
    assert_eq!(connections[1].identity, 8);
    assert_eq!(adapter.identity().await, Some(UserId(8)));

    // Joined set was cleared with the old connection.
    adapter
        .subscribe_private("private-user.7")
        .await
        .expect("rejoin");
    assert_eq!(connections[1].joined.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn subscribe_passes_the_auth_token_and_joins_once() {
    let connector = Arc::new(TestConnector::default());
    let adapter = adapter(&connector, false);
    adapter.connect(UserId(7)).await.expect("connect");

    adapter
        .subscribe_private("private-conversation.42")
        .await
        .expect("subscribe");
    adapter
        .subscribe_private("private-conversation.42")
        .await
        .expect("idempotent subscribe");

    let joined = connector.connections()[0].joined.lock().expect("lock").clone();
    assert_eq!(
        joined,
        vec![(
            "private-conversation.42".to_string(),
            Some("token-7-private-conversation.42".to_string()),
        )]
    );
}

#[tokio::test]
async fn subscribe_without_connection_fails() {
    let connector = Arc::new(TestConnector::default());
    let adapter = adapter(&connector, false);

    let err = adapter
        .subscribe_private("private-user.7")
        .await
        .expect_err("must fail");
    assert!(matches!(err, SubscribeError::NotConnected));
}

#[tokio::test]
async fn authorization_rejection_leaves_the_connection_intact() {
    let connector = Arc::new(TestConnector::default());
    let adapter = adapter(&connector, true);
    adapter.connect(UserId(7)).await.expect("connect");

    let err = adapter
        .subscribe_private("private-conversation.42")
        .await
        .expect_err("must be rejected");
    assert!(matches!(err, SubscribeError::Rejected { .. }));

    let connection = &connector.connections()[0];
    assert!(!connection.closed.load(Ordering::SeqCst));
    assert!(connection.joined.lock().expect("lock").is_empty());

    // Ephemeral publishing still works on the live connection.
    adapter
        .publish_ephemeral("private-user.8", "typing", json!({"is_typing": true}))
        .await;
    assert_eq!(connection.published.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn leave_is_idempotent() {
    let connector = Arc::new(TestConnector::default());
    let adapter = adapter(&connector, false);
    adapter.connect(UserId(7)).await.expect("connect");
    adapter
        .subscribe_private("private-conversation.42")
        .await
        .expect("subscribe");

    adapter.leave("private-conversation.42").await;
    adapter.leave("private-conversation.42").await;
    adapter.leave("never-joined").await;

    let left = connector.connections()[0].left.lock().expect("lock").clone();
    assert_eq!(left, vec!["private-conversation.42".to_string()]);
}

#[tokio::test]
async fn connection_events_surface_on_the_adapter_stream() {
    let connector = Arc::new(TestConnector::default());
    let adapter = adapter(&connector, false);
    let mut events = adapter.subscribe_events();
    adapter.connect(UserId(7)).await.expect("connect");

    let _ = connector.connections()[0].events.send(TransportEvent::Message {
        channel: "private-user.7".to_string(),
        event: "message_created".to_string(),
        payload: json!({"body": "hi"}),
    });

    match events.recv().await.expect("forwarded event") {
        TransportEvent::Message { channel, event, .. } => {
            assert_eq!(channel, "private-user.7");
            assert_eq!(event, "message_created");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let connector = Arc::new(TestConnector::default());
    let adapter = adapter(&connector, false);
    adapter.connect(UserId(7)).await.expect("connect");

    adapter.disconnect().await;
    adapter.disconnect().await;

    assert!(connector.connections()[0].closed.load(Ordering::SeqCst));
    assert_eq!(adapter.identity().await, None);
    assert_eq!(
        adapter.connection_state().await,
        ConnectionState::Disconnected
    );
}
