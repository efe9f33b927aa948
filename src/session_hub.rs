//! The duplex channel layer.
//!
//! The hub owns the `conn ↔ player ↔ match` mapping: which connections a
//! player holds (several tabs are fine), which room each connection is
//! attached to, and the per-connection chat/typing token buckets. It fans
//! runtime events out to rooms and survives brief disconnects by keeping
//! the player → match binding alive while the runtime runs the grace
//! window.
//!
//! The hub never mutates match state. Its routing tables are guarded by
//! fine-grained locks; no lock is held across an await point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::{CommandError, ErrorCode};
use crate::player::{ConnId, MatchId, Player, PlayerId};
use crate::protocol::{Envelope, ServerEvent};

/// Which room of a match a player sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    /// Participants.
    Players,
    /// Watchers.
    Spectators,
}

/// Token bucket: `capacity` messages per 10 seconds, refilled linearly.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(per_10s: u32, now: Instant) -> Self {
        let capacity = f64::from(per_10s.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 10.0,
            last: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct ConnEntry {
    player_id: PlayerId,
    tx: mpsc::UnboundedSender<Envelope>,
    bucket: Mutex<TokenBucket>,
}

struct PlayerEntry {
    player: Player,
    conns: HashSet<ConnId>,
    active: Option<(MatchId, RoomKind)>,
}

/// One retained chat line.
#[derive(Debug, Clone)]
pub struct ChatEntry {
    /// Sender.
    pub from: PlayerId,
    /// Body.
    pub text: String,
    /// Milliseconds since the core's epoch.
    pub ts_ms: u64,
}

/// What a new connection resumed, if anything.
#[derive(Debug)]
pub struct ConnectOutcome {
    /// Id of the new connection.
    pub conn_id: ConnId,
    /// Outbound event stream for this connection.
    pub events: mpsc::UnboundedReceiver<Envelope>,
    /// Match the player was still bound to, if any; the caller delivers a
    /// resync for it.
    pub rejoined: Option<MatchId>,
}

/// What tearing a connection down revealed.
#[derive(Debug)]
pub struct DisconnectOutcome {
    /// The player the connection belonged to.
    pub player_id: PlayerId,
    /// No other connection of this player remains.
    pub last_conn: bool,
    /// Match the player is bound to, if any.
    pub active_match: Option<MatchId>,
}

struct HubInner {
    clock: Clock,
    chat_rate_per_10s: u32,
    chat_history_size: usize,
    conns: RwLock<HashMap<ConnId, ConnEntry>>,
    players: RwLock<HashMap<PlayerId, PlayerEntry>>,
    rooms: RwLock<HashMap<(MatchId, RoomKind), HashSet<ConnId>>>,
    chat: Mutex<HashMap<MatchId, VecDeque<ChatEntry>>>,
}

/// Connection registry, room multicast and reconnection layer.
#[derive(Clone)]
pub struct SessionHub {
    inner: Arc<HubInner>,
}

impl SessionHub {
    /// Creates an empty hub.
    pub fn new(clock: Clock, config: &CoreConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                clock,
                chat_rate_per_10s: config.chat_rate_per_10s,
                chat_history_size: config.chat_history_size,
                conns: RwLock::new(HashMap::new()),
                players: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                chat: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a connection for an authenticated player. A returning
    /// player is re-attached to their active match's room.
    pub fn connect(&self, player: Player) -> ConnectOutcome {
        let conn_id = ConnId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let now = self.inner.clock.now();

        let mut conns = self.inner.conns.write();
        conns.insert(
            conn_id,
            ConnEntry {
                player_id: player.player_id,
                tx,
                bucket: Mutex::new(TokenBucket::new(self.inner.chat_rate_per_10s, now)),
            },
        );
        drop(conns);

        let mut players = self.inner.players.write();
        let entry = players
            .entry(player.player_id)
            .or_insert_with(|| PlayerEntry {
                player: player.clone(),
                conns: HashSet::new(),
                active: None,
            });
        entry.player.connected = true;
        entry.player.last_seen_at = Some(now);
        entry.conns.insert(conn_id);
        let rejoined = entry.active;
        drop(players);

        if let Some((match_id, kind)) = rejoined {
            self.inner
                .rooms
                .write()
                .entry((match_id, kind))
                .or_default()
                .insert(conn_id);
        }
        trace!(%conn_id, player = %player.player_id, ?rejoined, "connection registered");

        ConnectOutcome {
            conn_id,
            events: rx,
            rejoined: rejoined.map(|(m, _)| m),
        }
    }

    /// Removes a connection and reports what it left behind.
    pub fn disconnect(&self, conn_id: ConnId) -> Option<DisconnectOutcome> {
        let entry = self.inner.conns.write().remove(&conn_id)?;
        for room in self.inner.rooms.write().values_mut() {
            room.remove(&conn_id);
        }

        let mut players = self.inner.players.write();
        let player_entry = players.get_mut(&entry.player_id)?;
        player_entry.conns.remove(&conn_id);
        let last_conn = player_entry.conns.is_empty();
        if last_conn {
            player_entry.player.connected = false;
            player_entry.player.last_seen_at = Some(self.inner.clock.now());
        }
        let active_match = player_entry.active.map(|(m, _)| m);
        if last_conn && active_match.is_none() {
            players.remove(&entry.player_id);
        }
        debug!(%conn_id, player = %entry.player_id, last_conn, "connection closed");

        Some(DisconnectOutcome {
            player_id: entry.player_id,
            last_conn,
            active_match,
        })
    }

    /// Match a player is currently bound to, if any.
    pub fn active_match_of(&self, player_id: PlayerId) -> Option<MatchId> {
        self.inner
            .players
            .read()
            .get(&player_id)
            .and_then(|e| e.active.map(|(m, _)| m))
    }

    /// Current identity of a connection.
    pub fn player_of(&self, conn_id: ConnId) -> Option<Player> {
        let conns = self.inner.conns.read();
        let player_id = conns.get(&conn_id)?.player_id;
        drop(conns);
        self.inner
            .players
            .read()
            .get(&player_id)
            .map(|e| e.player.clone())
    }

    /// Binds a player to a match room; all current and future connections
    /// of the player are attached to it.
    pub fn bind(&self, player_id: PlayerId, match_id: MatchId, kind: RoomKind) {
        let mut players = self.inner.players.write();
        let Some(entry) = players.get_mut(&player_id) else {
            return;
        };
        entry.active = Some((match_id, kind));
        let conns: Vec<ConnId> = entry.conns.iter().copied().collect();
        drop(players);

        let mut rooms = self.inner.rooms.write();
        let room = rooms.entry((match_id, kind)).or_default();
        for conn in conns {
            room.insert(conn);
        }
    }

    /// Releases a player's binding to a match.
    pub fn unbind(&self, player_id: PlayerId, match_id: MatchId) {
        let mut players = self.inner.players.write();
        let mut conns = Vec::new();
        if let Some(entry) = players.get_mut(&player_id) {
            if matches!(entry.active, Some((m, _)) if m == match_id) {
                entry.active = None;
            }
            conns = entry.conns.iter().copied().collect();
            if entry.conns.is_empty() {
                players.remove(&player_id);
            }
        }
        drop(players);

        let mut rooms = self.inner.rooms.write();
        for kind in [RoomKind::Players, RoomKind::Spectators] {
            if let Some(room) = rooms.get_mut(&(match_id, kind)) {
                for conn in &conns {
                    room.remove(conn);
                }
            }
        }
    }

    /// Tears down both rooms and the chat history of a finished match.
    pub fn drop_room(&self, match_id: MatchId) {
        let mut rooms = self.inner.rooms.write();
        rooms.remove(&(match_id, RoomKind::Players));
        rooms.remove(&(match_id, RoomKind::Spectators));
        drop(rooms);

        self.inner.chat.lock().remove(&match_id);

        let mut players = self.inner.players.write();
        players.retain(|_, entry| {
            if matches!(entry.active, Some((m, _)) if m == match_id) {
                entry.active = None;
            }
            !entry.conns.is_empty() || entry.active.is_some()
        });
    }

    /// Fans a match-scoped event out to participants and spectators.
    pub fn broadcast(&self, match_id: MatchId, version: u64, event: ServerEvent) {
        let envelope = Envelope::scoped(match_id, version, event);
        let rooms = self.inner.rooms.read();
        let conns = self.inner.conns.read();
        for kind in [RoomKind::Players, RoomKind::Spectators] {
            if let Some(room) = rooms.get(&(match_id, kind)) {
                for conn_id in room {
                    if let Some(entry) = conns.get(conn_id) {
                        let _ = entry.tx.send(envelope.clone());
                    }
                }
            }
        }
    }

    /// Delivers an event to every connection of one player.
    pub fn send_to_player(&self, player_id: PlayerId, envelope: Envelope) {
        let players = self.inner.players.read();
        let Some(entry) = players.get(&player_id) else {
            return;
        };
        let conns = self.inner.conns.read();
        for conn_id in &entry.conns {
            if let Some(conn) = conns.get(conn_id) {
                let _ = conn.tx.send(envelope.clone());
            }
        }
    }

    /// Delivers an event to a single connection.
    pub fn send_to_conn(&self, conn_id: ConnId, envelope: Envelope) {
        if let Some(entry) = self.inner.conns.read().get(&conn_id) {
            let _ = entry.tx.send(envelope);
        }
    }

    /// Checks that the connection's player is bound to `match_id` as a
    /// participant or spectator and returns their id.
    pub fn authorize(&self, conn_id: ConnId, match_id: MatchId) -> Result<PlayerId, CommandError> {
        let conns = self.inner.conns.read();
        let player_id = conns
            .get(&conn_id)
            .map(|e| e.player_id)
            .ok_or_else(|| CommandError::unauthorized("unknown connection"))?;
        drop(conns);

        let players = self.inner.players.read();
        match players.get(&player_id).and_then(|e| e.active) {
            Some((m, _)) if m == match_id => Ok(player_id),
            _ => Err(CommandError::unauthorized("not in this match")),
        }
    }

    /// Validates, rate-limits and broadcasts a chat line to the match room.
    pub fn chat(
        &self,
        conn_id: ConnId,
        match_id: MatchId,
        text: &str,
    ) -> Result<(), CommandError> {
        let from = self.authorize(conn_id, match_id)?;
        let text = text.trim();
        if text.is_empty() || text.len() > 512 {
            return Err(CommandError::new(ErrorCode::BadRequest, "bad chat message"));
        }
        self.take_token(conn_id)?;

        let ts_ms = self.inner.clock.millis_since_epoch(self.inner.clock.now());
        let mut chat = self.inner.chat.lock();
        let history = chat.entry(match_id).or_default();
        history.push_back(ChatEntry {
            from,
            text: text.to_string(),
            ts_ms,
        });
        while history.len() > self.inner.chat_history_size {
            history.pop_front();
        }
        drop(chat);

        self.broadcast_unversioned(
            match_id,
            ServerEvent::ChatMessage {
                from,
                text: text.to_string(),
                ts_ms,
            },
        );
        Ok(())
    }

    /// Rate-limits and broadcasts a typing indicator to the match room.
    pub fn typing(
        &self,
        conn_id: ConnId,
        match_id: MatchId,
        is_typing: bool,
    ) -> Result<(), CommandError> {
        let from = self.authorize(conn_id, match_id)?;
        self.take_token(conn_id)?;
        self.broadcast_unversioned(match_id, ServerEvent::UserTyping { from, is_typing });
        Ok(())
    }

    /// Retained chat lines of a match, oldest first.
    pub fn chat_history(&self, match_id: MatchId) -> Vec<ChatEntry> {
        self.inner
            .chat
            .lock()
            .get(&match_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn take_token(&self, conn_id: ConnId) -> Result<(), CommandError> {
        let conns = self.inner.conns.read();
        let entry = conns
            .get(&conn_id)
            .ok_or_else(|| CommandError::unauthorized("unknown connection"))?;
        if entry.bucket.lock().try_take(self.inner.clock.now()) {
            Ok(())
        } else {
            Err(CommandError::new(ErrorCode::RateLimited, "slow down"))
        }
    }

    fn broadcast_unversioned(&self, match_id: MatchId, event: ServerEvent) {
        let envelope = Envelope {
            match_id: Some(match_id),
            version: None,
            event,
        };
        let rooms = self.inner.rooms.read();
        let conns = self.inner.conns.read();
        for kind in [RoomKind::Players, RoomKind::Spectators] {
            if let Some(room) = rooms.get(&(match_id, kind)) {
                for conn_id in room {
                    if let Some(entry) = conns.get(conn_id) {
                        let _ = entry.tx.send(envelope.clone());
                    }
                }
            }
        }
    }
}
