use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::protocol::{Envelope, MessageKind, UserEventPayload};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One live transport connection, owned by the hub's room table.
///
/// The outbound queue is bounded; a full queue drops frames for this
/// connection only.  No component other than the hub may touch the queue
/// once the connection is registered.
pub struct Connection {
    pub connection_id: String,
    pub room_id: String,
    pub participant_id: String,
    pub display_name: String,
    pub is_host: bool,
    pub outbound: mpsc::Sender<String>,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

enum Command {
    Register(Connection),
    Unregister {
        room_id: String,
        connection_id: String,
    },
    Broadcast {
        room_id: String,
        frame: String,
        exclude: Option<String>,
    },
    Direct {
        room_id: String,
        target_id: String,
        frame: String,
    },
    Count {
        room_id: String,
        reply: oneshot::Sender<usize>,
    },
}

/// Process-wide registry of live connections, grouped by room.
///
/// All mutations flow through one serialized control loop: the nested
/// `room -> connection` map is owned by that task alone, so no lock guards
/// it.  Within a room this gives a total order over register, unregister,
/// broadcast and direct delivery — a `user-joined` is never observed after
/// a later `user-left` for the same participant.  Nothing is ordered across
/// rooms.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    store: Arc<dyn Store>,
    backlog_len: usize,
    backlog_ttl: Duration,
}

impl Hub {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();

        let mut registry = Registry {
            rooms: HashMap::new(),
            store: store.clone(),
        };
        tokio::spawn(async move {
            registry.run(rx).await;
        });

        Self {
            commands,
            store,
            backlog_len: config.chat_backlog_len,
            backlog_ttl: config.room_ttl,
        }
    }

    /// Register a connection: the room's chat backlog is replayed to it
    /// (oldest first), then the room learns about the join.
    pub fn register(&self, connection: Connection) {
        let _ = self.commands.send(Command::Register(connection));
    }

    /// Remove a connection and announce the departure. Idempotent — the
    /// peer-initiated and timeout-initiated close paths may both land here.
    pub fn unregister(&self, room_id: &str, connection_id: &str) {
        let _ = self.commands.send(Command::Unregister {
            room_id: room_id.to_string(),
            connection_id: connection_id.to_string(),
        });
    }

    /// Enqueue a frame on every connection in the room except `exclude`.
    /// Best-effort: a slow consumer loses this frame rather than stalling
    /// the room.
    pub fn broadcast(&self, room_id: &str, frame: String, exclude: Option<String>) {
        let _ = self.commands.send(Command::Broadcast {
            room_id: room_id.to_string(),
            frame,
            exclude,
        });
    }

    /// Deliver a frame to one participant. Silently a no-op when the target
    /// is not connected — a signaling message for an absent peer is stale.
    pub fn direct(&self, room_id: &str, target_id: &str, frame: String) {
        let _ = self.commands.send(Command::Direct {
            room_id: room_id.to_string(),
            target_id: target_id.to_string(),
            frame,
        });
    }

    /// Persist a chat frame to the room's bounded backlog. Fire-and-forget:
    /// the broadcast path never waits on storage.
    pub fn save_chat(&self, room_id: &str, frame: String) {
        let store = self.store.clone();
        let key = backlog_key(room_id);
        let cap = self.backlog_len;
        let ttl = self.backlog_ttl;
        tokio::spawn(async move {
            if let Err(e) = store.append_log(&key, &frame, cap, ttl).await {
                warn!(error = %e, "failed to persist chat frame");
            }
        });
    }

    /// Number of live connections in a room.
    ///
    /// Because the control loop is serialized, awaiting this also acts as a
    /// barrier: every command submitted before it has been processed.
    pub async fn connection_count(&self, room_id: &str) -> usize {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Count {
            room_id: room_id.to_string(),
            reply,
        });
        rx.await.unwrap_or(0)
    }
}

fn backlog_key(room_id: &str) -> String {
    format!("chat:{room_id}")
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

struct Registry {
    rooms: HashMap<String, HashMap<String, Connection>>,
    store: Arc<dyn Store>,
}

impl Registry {
    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register(connection) => self.register(connection).await,
                Command::Unregister {
                    room_id,
                    connection_id,
                } => self.unregister(&room_id, &connection_id),
                Command::Broadcast {
                    room_id,
                    frame,
                    exclude,
                } => self.broadcast(&room_id, &frame, exclude.as_deref()),
                Command::Direct {
                    room_id,
                    target_id,
                    frame,
                } => self.direct(&room_id, &target_id, &frame),
                Command::Count { room_id, reply } => {
                    let count = self.rooms.get(&room_id).map(|c| c.len()).unwrap_or(0);
                    let _ = reply.send(count);
                }
            }
        }
    }

    async fn register(&mut self, connection: Connection) {
        // Replay history into the new connection only, before anyone can
        // observe its presence.  A joiner never "skips" the backlog.
        match self.store.log_entries(&backlog_key(&connection.room_id)).await {
            Ok(history) => {
                for frame in history {
                    enqueue(&connection, &frame);
                }
            }
            Err(e) => warn!(error = %e, "failed to load chat backlog"),
        }

        info!(
            room_id = %connection.room_id,
            participant_id = %connection.participant_id,
            connection_id = %connection.connection_id,
            "connection registered"
        );

        let joined = presence_frame(MessageKind::UserJoined, &connection);
        let room_id = connection.room_id.clone();
        let connection_id = connection.connection_id.clone();

        self.rooms
            .entry(room_id.clone())
            .or_default()
            .insert(connection_id.clone(), connection);

        if let Some(frame) = joined {
            self.broadcast(&room_id, &frame, Some(connection_id.as_str()));
        }
    }

    fn unregister(&mut self, room_id: &str, connection_id: &str) {
        let Some(connections) = self.rooms.get_mut(room_id) else {
            return;
        };
        let Some(connection) = connections.remove(connection_id) else {
            return;
        };

        // No orphan room tables in memory.
        if connections.is_empty() {
            self.rooms.remove(room_id);
        }

        info!(
            room_id = %room_id,
            participant_id = %connection.participant_id,
            connection_id = %connection_id,
            "connection unregistered"
        );

        if let Some(frame) = presence_frame(MessageKind::UserLeft, &connection) {
            self.broadcast(room_id, &frame, None);
        }
    }

    fn broadcast(&self, room_id: &str, frame: &str, exclude: Option<&str>) {
        let Some(connections) = self.rooms.get(room_id) else {
            return;
        };
        for (connection_id, connection) in connections {
            if exclude == Some(connection_id.as_str()) {
                continue;
            }
            enqueue(connection, frame);
        }
    }

    fn direct(&self, room_id: &str, target_id: &str, frame: &str) {
        let Some(connections) = self.rooms.get(room_id) else {
            return;
        };
        match connections
            .values()
            .find(|c| c.participant_id == target_id)
        {
            Some(connection) => enqueue(connection, frame),
            None => debug!(
                room_id = %room_id,
                target_id = %target_id,
                "direct target not connected, dropping frame"
            ),
        }
    }
}

/// Non-blocking enqueue with a drop-on-full policy.
fn enqueue(connection: &Connection, frame: &str) {
    match connection.outbound.try_send(frame.to_string()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(
                connection_id = %connection.connection_id,
                "outbound queue full, dropping frame"
            );
        }
        // A closing connection loses frames by definition.
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

fn presence_frame(kind: MessageKind, connection: &Connection) -> Option<String> {
    let payload = UserEventPayload {
        participant_id: connection.participant_id.clone(),
        display_name: connection.display_name.clone(),
    };
    Envelope::server_event(kind, &payload, &connection.room_id, &connection.participant_id)
        .and_then(|e| e.to_json())
        .map_err(|e| warn!(error = %e, "failed to build presence frame"))
        .ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::protocol::ChatPayload;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    fn test_hub() -> (Hub, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new(store.clone(), &test_config());
        (hub, store)
    }

    fn connect(hub: &Hub, room: &str, participant: &str, is_host: bool) -> mpsc::Receiver<String> {
        connect_with_capacity(hub, room, participant, is_host, 64)
    }

    fn connect_with_capacity(
        hub: &Hub,
        room: &str,
        participant: &str,
        is_host: bool,
        capacity: usize,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(capacity);
        hub.register(Connection {
            connection_id: format!("conn-{participant}"),
            room_id: room.to_string(),
            participant_id: participant.to_string(),
            display_name: format!("Name-{participant}"),
            is_host,
            outbound: tx,
        });
        rx
    }

    async fn recv(rx: &mut mpsc::Receiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    fn chat_frame(room: &str, sender: &str, text: &str) -> String {
        let payload = ChatPayload {
            display_name: format!("Name-{sender}"),
            text: text.to_string(),
        };
        Envelope::server_event(MessageKind::Chat, &payload, room, sender)
            .unwrap()
            .to_json()
            .unwrap()
    }

    async fn wait_for_backlog(store: &MemoryStore, room: &str, len: usize) {
        for _ in 0..100 {
            if store.log_entries(&backlog_key(room)).await.unwrap().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("backlog never reached {len} entries");
    }

    #[tokio::test]
    async fn backlog_replays_in_order_before_live_traffic() {
        let (hub, store) = test_hub();
        for i in 0..3 {
            store
                .append_log(&backlog_key("room"), &format!("old-{i}"), 50, TTL)
                .await
                .unwrap();
        }

        let mut rx = connect(&hub, "room", "late", false);
        hub.broadcast("room", "live".into(), None);

        assert_eq!(recv(&mut rx).await, "old-0");
        assert_eq!(recv(&mut rx).await, "old-1");
        assert_eq!(recv(&mut rx).await, "old-2");
        assert_eq!(recv(&mut rx).await, "live");
    }

    #[tokio::test]
    async fn broadcast_never_reaches_the_excluded_connection() {
        let (hub, _) = test_hub();
        let mut host = connect(&hub, "room", "host", true);
        let mut viewer = connect(&hub, "room", "viewer", false);

        // Drain the user-joined the host saw for the viewer.
        assert!(recv(&mut host).await.contains("user-joined"));

        hub.broadcast("room", "update".into(), Some("conn-host".into()));
        assert_eq!(recv(&mut viewer).await, "update");

        // The loop has processed the broadcast (viewer saw it), so the
        // host's queue verdict is already final.
        assert!(host.try_recv().is_err());
    }

    #[tokio::test]
    async fn register_announces_join_to_others_only() {
        let (hub, _) = test_hub();
        let mut first = connect(&hub, "room", "first", true);
        let mut second = connect(&hub, "room", "second", false);

        let frame = recv(&mut first).await;
        assert!(frame.contains("user-joined"));
        assert!(frame.contains("second"));

        hub.connection_count("room").await;
        assert!(second.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_announces_leave_and_drops_empty_rooms() {
        let (hub, _) = test_hub();
        let mut host = connect(&hub, "room", "host", true);
        let _viewer = connect(&hub, "room", "viewer", false);
        assert!(recv(&mut host).await.contains("user-joined"));

        hub.unregister("room", "conn-viewer");
        let frame = recv(&mut host).await;
        assert!(frame.contains("user-left"));
        assert!(frame.contains("viewer"));

        hub.unregister("room", "conn-host");
        assert_eq!(hub.connection_count("room").await, 0);

        // Double unregister is a harmless no-op.
        hub.unregister("room", "conn-host");
        assert_eq!(hub.connection_count("room").await, 0);
    }

    #[tokio::test]
    async fn direct_reaches_only_the_target() {
        let (hub, _) = test_hub();
        let mut host = connect(&hub, "room", "host", true);
        let mut viewer = connect(&hub, "room", "viewer", false);
        assert!(recv(&mut host).await.contains("user-joined"));

        hub.direct("room", "viewer", "offer".into());
        assert_eq!(recv(&mut viewer).await, "offer");
        assert!(host.try_recv().is_err());
    }

    #[tokio::test]
    async fn direct_to_absent_target_is_silent() {
        let (hub, _) = test_hub();
        let mut host = connect(&hub, "room", "host", true);

        hub.direct("room", "nobody", "offer".into());
        hub.connection_count("room").await;
        assert!(host.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_connection_only() {
        let (hub, _) = test_hub();
        let mut slow = connect_with_capacity(&hub, "room", "slow", false, 1);
        let mut healthy = connect(&hub, "room", "healthy", false);
        assert!(recv(&mut slow).await.contains("user-joined"));

        hub.broadcast("room", "m1".into(), None);
        hub.broadcast("room", "m2".into(), None);
        hub.broadcast("room", "m3".into(), None);
        hub.connection_count("room").await;

        // The slow consumer kept only what fit; the healthy one got it all.
        assert_eq!(recv(&mut slow).await, "m1");
        assert!(slow.try_recv().is_err());
        assert_eq!(recv(&mut healthy).await, "m1");
        assert_eq!(recv(&mut healthy).await, "m2");
        assert_eq!(recv(&mut healthy).await, "m3");
    }

    #[tokio::test]
    async fn chat_fans_out_and_lands_in_the_backlog() {
        let (hub, store) = test_hub();
        let mut host = connect(&hub, "room", "host", true);
        let mut viewer_1 = connect(&hub, "room", "v1", false);
        let mut viewer_2 = connect(&hub, "room", "v2", false);
        let mut viewer_3 = connect(&hub, "room", "v3", false);

        // Drain the presence frames each earlier connection observed.
        for rx in [&mut host, &mut viewer_1, &mut viewer_2] {
            while let Ok(frame) = rx.try_recv() {
                assert!(frame.contains("user-joined"));
            }
        }
        hub.connection_count("room").await;
        for rx in [&mut host, &mut viewer_1, &mut viewer_2] {
            while rx.try_recv().is_ok() {}
        }

        let frame = chat_frame("room", "host", "hi");
        hub.save_chat("room", frame.clone());
        hub.broadcast("room", frame.clone(), None);

        // Every connection (sender included) receives the identical frame.
        for rx in [&mut host, &mut viewer_1, &mut viewer_2, &mut viewer_3] {
            let received = recv(rx).await;
            let envelope: Envelope = serde_json::from_str(&received).unwrap();
            assert_eq!(envelope.sender_id, "host");
            assert_eq!(received, frame);
        }

        // A later joiner replays it from the backlog.
        wait_for_backlog(&store, "room", 1).await;
        let mut late = connect(&hub, "room", "late", false);
        assert_eq!(recv(&mut late).await, frame);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let (hub, _) = test_hub();
        let mut a = connect(&hub, "room-a", "pa", true);
        let mut b = connect(&hub, "room-b", "pb", true);

        hub.broadcast("room-a", "only-a".into(), None);
        assert_eq!(recv(&mut a).await, "only-a");

        hub.connection_count("room-b").await;
        assert!(b.try_recv().is_err());
    }
}
