// crates/relay/src/state.rs
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use dashmap::DashMap;
use jobpulse_core::{JobScanner, JobUpdatePublisher};
use jobpulse_store::SharedStore;
use tokio::sync::mpsc;

use crate::config::FanoutConfig;

/// Process-local socket id.
pub type ConnId = u64;

/// A connected client's outbound frame queue.
pub struct ClientConnection {
    pub tx: mpsc::UnboundedSender<String>,
    pub connected_at: Instant,
}

/// Per-socket buffer kept while the team snapshot is being fetched.
#[derive(Debug)]
pub struct InitState {
    pub team_id: String,
    pub started: Instant,
    /// Encoded `job_update` frames, oldest first.
    pub pending: VecDeque<String>,
}

impl InitState {
    fn new(team_id: &str) -> Self {
        Self {
            team_id: team_id.to_string(),
            started: Instant::now(),
            pending: VecDeque::new(),
        }
    }
}

/// Where a socket is in its team-subscription lifecycle.
#[derive(Debug, Default)]
pub enum SocketPhase {
    #[default]
    Idle,
    Initializing(InitState),
    Ready { team_id: String },
}

impl SocketPhase {
    pub fn team_id(&self) -> Option<&str> {
        match self {
            SocketPhase::Idle => None,
            SocketPhase::Initializing(init) => Some(&init.team_id),
            SocketPhase::Ready { team_id } => Some(team_id),
        }
    }
}

/// What routing one update to a team's room did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Routing {
    /// Ready sockets that should get the frame now.
    pub deliver_to: Vec<ConnId>,
    /// Initializing sockets that buffered it.
    pub buffered: usize,
    /// Older frames discarded from overflowing buffers.
    pub dropped: usize,
}

/// Team rooms and per-socket phases.
///
/// Everything that decides whether an update is buffered or delivered lives
/// behind one lock, so a socket cannot leave `Initializing` between an
/// update being appended to its buffer and that buffer's final flush.
#[derive(Debug, Default)]
pub struct Rooms {
    members: HashMap<String, HashSet<ConnId>>,
    phases: HashMap<ConnId, SocketPhase>,
}

impl Rooms {
    pub fn phase(&self, conn: ConnId) -> Option<&SocketPhase> {
        self.phases.get(&conn)
    }

    pub fn members(&self, team_id: &str) -> usize {
        self.members.get(team_id).map_or(0, HashSet::len)
    }

    pub fn is_initializing(&self, conn: ConnId, team_id: &str) -> bool {
        matches!(self.phases.get(&conn), Some(SocketPhase::Initializing(init)) if init.team_id == team_id)
    }

    /// Leave the socket's current room (and `also_leave`, if the client named
    /// one), then join `team_id` as Initializing. `None` leaves it Idle.
    pub fn begin_init(&mut self, conn: ConnId, team_id: Option<&str>, also_leave: Option<&str>) {
        if let Some(current) = self.phases.get(&conn).and_then(SocketPhase::team_id) {
            let current = current.to_string();
            self.leave(conn, &current);
        }
        if let Some(previous) = also_leave {
            self.leave(conn, previous);
        }

        match team_id {
            Some(team_id) => {
                self.members
                    .entry(team_id.to_string())
                    .or_default()
                    .insert(conn);
                self.phases
                    .insert(conn, SocketPhase::Initializing(InitState::new(team_id)));
            }
            None => {
                self.phases.insert(conn, SocketPhase::Idle);
            }
        }
    }

    /// Give up on an unfinished init: the socket leaves `team_id`, its buffer
    /// is discarded and it goes back to Idle. Returns false (and changes
    /// nothing) if the socket is not initializing for `team_id`.
    pub fn abandon_init(&mut self, conn: ConnId, team_id: &str) -> bool {
        if !self.is_initializing(conn, team_id) {
            return false;
        }
        self.begin_init(conn, None, None);
        true
    }

    /// Take up to `max` buffered frames. Once the buffer is empty the socket
    /// becomes Ready and `None` is returned. Also `None` if the socket is no
    /// longer initializing for `team_id`.
    pub fn next_flush_batch(&mut self, conn: ConnId, team_id: &str, max: usize) -> Option<Vec<String>> {
        let Some(SocketPhase::Initializing(init)) = self.phases.get_mut(&conn) else {
            return None;
        };
        if init.team_id != team_id {
            return None;
        }
        if init.pending.is_empty() {
            self.phases.insert(
                conn,
                SocketPhase::Ready {
                    team_id: team_id.to_string(),
                },
            );
            return None;
        }
        let take = init.pending.len().min(max.max(1));
        Some(init.pending.drain(..take).collect())
    }

    /// Decide, per socket in the team's room, whether `frame` is delivered now
    /// or buffered. A buffer longer than `max_pending` is cut down to its
    /// newest `keep_pending` frames.
    pub fn route(&mut self, team_id: &str, frame: &str, max_pending: usize, keep_pending: usize) -> Routing {
        let mut routing = Routing::default();
        let Some(members) = self.members.get(team_id) else {
            return routing;
        };

        for conn in members {
            match self.phases.get_mut(conn) {
                Some(SocketPhase::Initializing(init)) if init.team_id == team_id => {
                    init.pending.push_back(frame.to_string());
                    routing.buffered += 1;
                    if init.pending.len() > max_pending {
                        let excess = init.pending.len() - keep_pending.min(init.pending.len());
                        init.pending.drain(..excess);
                        routing.dropped += excess;
                    }
                }
                Some(SocketPhase::Ready { team_id: t }) if t == team_id => {
                    routing.deliver_to.push(*conn);
                }
                _ => {}
            }
        }
        routing.deliver_to.sort_unstable();
        routing
    }

    /// Forget the socket entirely.
    pub fn remove(&mut self, conn: ConnId) {
        if let Some(team_id) = self.phases.remove(&conn).as_ref().and_then(SocketPhase::team_id) {
            let team_id = team_id.to_string();
            self.leave(conn, &team_id);
        }
    }

    fn leave(&mut self, conn: ConnId, team_id: &str) {
        if let Some(members) = self.members.get_mut(team_id) {
            members.remove(&conn);
            if members.is_empty() {
                self.members.remove(team_id);
            }
        }
    }
}

/// Shared relay state.
#[derive(Clone)]
pub struct RelayState {
    /// Outbound queues of connected sockets.
    pub connections: Arc<DashMap<ConnId, ClientConnection>>,
    pub rooms: Arc<Mutex<Rooms>>,
    pub store: SharedStore,
    pub scanner: JobScanner,
    pub publisher: JobUpdatePublisher,
    pub config: Arc<FanoutConfig>,
    next_id: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new(store: SharedStore, config: FanoutConfig) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            rooms: Arc::new(Mutex::new(Rooms::default())),
            scanner: JobScanner::new(store.clone()),
            publisher: JobUpdatePublisher::new(store.clone()),
            store,
            config: Arc::new(config),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Lock the room registry. Never held across an await.
    pub fn rooms(&self) -> MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new socket; frames sent to it arrive on the receiver.
    pub fn register(&self) -> (ConnId, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            id,
            ClientConnection {
                tx,
                connected_at: Instant::now(),
            },
        );
        crate::metrics::set_connected(self.connections.len());
        (id, rx)
    }

    pub fn unregister(&self, conn: ConnId) {
        self.rooms().remove(conn);
        if let Some((_, client)) = self.connections.remove(&conn) {
            tracing::debug!(
                conn_id = conn,
                connected_secs = client.connected_at.elapsed().as_secs(),
                "connection removed"
            );
        }
        crate::metrics::set_connected(self.connections.len());
    }

    /// Queue a frame for one socket. Returns false if it is gone.
    pub fn send_to(&self, conn: ConnId, frame: String) -> bool {
        match self.connections.get(&conn) {
            Some(client) => client.tx.send(frame).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_begin_init_switches_rooms() {
        let mut rooms = Rooms::default();
        rooms.begin_init(1, Some("t1"), None);
        assert_eq!(rooms.members("t1"), 1);
        assert!(rooms.is_initializing(1, "t1"));

        rooms.begin_init(1, Some("t2"), Some("t1"));
        assert_eq!(rooms.members("t1"), 0);
        assert_eq!(rooms.members("t2"), 1);

        rooms.begin_init(1, None, None);
        assert_eq!(rooms.members("t2"), 0);
        assert!(matches!(rooms.phase(1), Some(SocketPhase::Idle)));
    }

    #[test]
    fn test_abandon_init_returns_socket_to_idle() {
        let mut rooms = Rooms::default();
        rooms.begin_init(1, Some("t1"), None);
        rooms.route("t1", "u1", 1000, 50);

        assert!(!rooms.abandon_init(1, "t2"));
        assert!(rooms.is_initializing(1, "t1"));

        assert!(rooms.abandon_init(1, "t1"));
        assert!(matches!(rooms.phase(1), Some(SocketPhase::Idle)));
        assert_eq!(rooms.members("t1"), 0);
        // later updates for the team no longer pile up for this socket
        assert_eq!(rooms.route("t1", "u2", 1000, 50), Routing::default());
    }

    #[test]
    fn test_route_buffers_for_initializing_and_delivers_to_ready() {
        let mut rooms = Rooms::default();
        rooms.begin_init(1, Some("t1"), None);
        rooms.begin_init(2, Some("t1"), None);
        assert_eq!(rooms.next_flush_batch(2, "t1", 10), None);
        assert!(matches!(rooms.phase(2), Some(SocketPhase::Ready { .. })));

        let routing = rooms.route("t1", "frame", 1000, 50);
        assert_eq!(routing.deliver_to, vec![2]);
        assert_eq!(routing.buffered, 1);

        assert_eq!(rooms.route("other-team", "frame", 1000, 50), Routing::default());
    }

    #[test]
    fn test_overflow_keeps_newest_tail() {
        let mut rooms = Rooms::default();
        rooms.begin_init(1, Some("t1"), None);

        let mut dropped = 0;
        for i in 0..=1000 {
            dropped += rooms.route("t1", &format!("u{i}"), 1000, 50).dropped;
        }
        assert_eq!(dropped, 951);

        let Some(SocketPhase::Initializing(init)) = rooms.phase(1) else {
            panic!("socket should still be initializing");
        };
        assert_eq!(init.pending.len(), 50);
        assert_eq!(init.pending.front().map(String::as_str), Some("u951"));
        assert_eq!(init.pending.back().map(String::as_str), Some("u1000"));
    }

    #[test]
    fn test_flush_batches_then_ready() {
        let mut rooms = Rooms::default();
        rooms.begin_init(1, Some("t1"), None);
        for i in 0..25 {
            rooms.route("t1", &format!("u{i}"), 1000, 50);
        }

        let sizes: Vec<usize> = std::iter::from_fn(|| rooms.next_flush_batch(1, "t1", 10))
            .map(|batch| batch.len())
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert!(matches!(rooms.phase(1), Some(SocketPhase::Ready { team_id }) if team_id == "t1"));
    }

    #[test]
    fn test_remove_forgets_socket() {
        let mut rooms = Rooms::default();
        rooms.begin_init(7, Some("t1"), None);
        rooms.remove(7);
        assert_eq!(rooms.members("t1"), 0);
        assert!(rooms.phase(7).is_none());
        assert_eq!(rooms.next_flush_batch(7, "t1", 10), None);
    }
}
