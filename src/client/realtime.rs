//! Realtime subscriptions from the client side.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use super::{Client, ClientError};
use crate::entities::Collection;
use crate::realtime::{ClientMessage, ServerMessage};
use crate::world::Action;

/// One change pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub action: Action,
    pub collection: Collection,
    pub revision: u64,
    pub record: Value,
}

impl ChangeEvent {
    pub fn record_id(&self) -> Option<Uuid> {
        self.record.get("id")?.as_str()?.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeUpdate {
    Connected { revision: u64 },
    Change(ChangeEvent),
    /// Events were lost; stores should refetch.
    Resync { revision: u64 },
    Error(String),
}

impl From<ServerMessage> for RealtimeUpdate {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Connected { revision } => RealtimeUpdate::Connected { revision },
            ServerMessage::Event { action, collection, revision, record } => {
                RealtimeUpdate::Change(ChangeEvent { action, collection, revision, record })
            }
            ServerMessage::Resync { revision } => RealtimeUpdate::Resync { revision },
            ServerMessage::Error { message } => RealtimeUpdate::Error(message),
        }
    }
}

/// `http(s)://host` to `ws(s)://host/api/realtime?token=...`.
pub fn realtime_url(base_url: &str, token: &str) -> String {
    let base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };
    format!("{base}/api/realtime?token={token}")
}

/// A live connection. Updates arrive on the receiver returned by
/// [`RealtimeClient::connect`]; dropping the client closes the socket.
#[derive(Debug)]
pub struct RealtimeClient {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    task: JoinHandle<()>,
}

impl RealtimeClient {
    pub async fn connect(client: &Client) -> Result<(Self, mpsc::UnboundedReceiver<RealtimeUpdate>), ClientError> {
        let token = client.auth().token().unwrap_or_default();
        let (socket, _) = connect_async(realtime_url(client.base_url(), &token)).await?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let text = match serde_json::to_string(&msg) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::error!(error = %e, "realtime message encode failed");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    frame = ws_rx.next() => match frame {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => {
                                if updates_tx.send(RealtimeUpdate::from(msg)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "unreadable realtime frame"),
                        },
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                }
            }
            let _ = ws_tx.close().await;
        });

        Ok((RealtimeClient { outgoing, task }, updates_rx))
    }

    fn push(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.outgoing.send(msg).map_err(|_| ClientError::Disconnected)
    }

    /// Topics are `collection`, `collection/*` or `collection/{id}`.
    pub fn subscribe(&self, topics: &[String], expand: Option<&str>, since: Option<u64>) -> Result<(), ClientError> {
        self.push(ClientMessage::Subscribe {
            topics: topics.to_vec(),
            expand: expand.map(str::to_string),
            since,
        })
    }

    pub fn unsubscribe(&self, topics: &[String]) -> Result<(), ClientError> {
        self.push(ClientMessage::Unsubscribe { topics: topics.to_vec() })
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::admin_client;
    use crate::dto::TaskInput;
    use crate::client::store::{ListStore, Placement, SyncMode};
    use crate::entities::Task;
    use crate::query::ListResult;
    use crate::world::{Actor, Command, RecordInput};

    #[test]
    fn url_switches_scheme() {
        assert_eq!(realtime_url("http://localhost:8090", "t"), "ws://localhost:8090/api/realtime?token=t");
        assert_eq!(realtime_url("https://desk.example.com", "t"), "wss://desk.example.com/api/realtime?token=t");
    }

    #[tokio::test]
    async fn receives_changes_for_subscribed_topics() {
        let (client, state, path) = admin_client("client_rt").await;
        let (rt, mut updates) = RealtimeClient::connect(&client).await.unwrap();
        assert!(matches!(updates.recv().await, Some(RealtimeUpdate::Connected { .. })));

        rt.subscribe(&["tasks".into(), "nope".into()], Some("assignees"), None).unwrap();
        // The bad topic's error arrives after the subscribe took effect
        assert!(matches!(updates.recv().await, Some(RealtimeUpdate::Error(_))));

        let input = TaskInput { title: Some("Live".into()), ..Default::default() };
        let event = state
            .commit(Command::Create { input: RecordInput::Task(input) }, Actor::system())
            .unwrap();

        match updates.recv().await {
            Some(RealtimeUpdate::Change(change)) => {
                assert_eq!(change.action, Action::Create);
                assert_eq!(change.collection, Collection::Tasks);
                assert_eq!(change.revision, event.revision());
                assert_eq!(change.record_id(), Some(event.record().id()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!rt.is_closed());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn trimmed_history_surfaces_a_resync() {
        let (client, state, path) = admin_client("client_rt_resync").await;
        {
            let mut world = state.write_world();
            for i in 0..crate::world::LOG_CAPACITY + 5 {
                let input = TaskInput { title: Some(format!("t{i}")), ..Default::default() };
                world.apply(Command::Create { input: RecordInput::Task(input) }, Actor::system()).unwrap();
            }
        }
        let revision = state.read_world().revision;

        let (rt, mut updates) = RealtimeClient::connect(&client).await.unwrap();
        assert!(matches!(updates.recv().await, Some(RealtimeUpdate::Connected { .. })));
        rt.subscribe(&["tasks/*".into()], None, Some(1)).unwrap();
        assert_eq!(updates.recv().await, Some(RealtimeUpdate::Resync { revision }));

        let mut store: ListStore<Task> = ListStore::new(Placement::Front, SyncMode::Patch);
        let ticket = store.begin_fetch();
        store.finish_fetch(ticket, Ok(ListResult { page: 1, per_page: 20, total_items: 0, total_pages: 0, items: vec![], revision: 1 }));
        assert!(!store.needs_refetch());
        store.resync();
        assert!(store.needs_refetch());
        let _ = std::fs::remove_file(path);
    }
}
