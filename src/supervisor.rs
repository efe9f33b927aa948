//! The top-level object of the core.
//!
//! The supervisor owns the `match_id → mailbox` registry, spawns a match
//! runtime for every pairing or custom lobby, records each match's owning
//! instance in the state store, reaps finished runtimes (panics included),
//! enforces the per-process match cap, and fans `shutdown` out to every
//! runtime on process stop.
//!
//! It is also the seam between transport and core: [`Supervisor::connect`]
//! registers an authenticated player's connection,
//! [`Supervisor::handle_command`] validates and routes one inbound command,
//! and [`Supervisor::disconnect`] tears a connection down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::{CommandError, ErrorCode};
use crate::grader::GraderClient;
use crate::match_runtime::{
    spawn_runtime, MatchCommand, RuntimeExit, RuntimeHandle, RuntimeSeed,
};
use crate::match_state::MatchConfig;
use crate::matchmaker::{spawn_matchmaker, MatchmakerHandle};
use crate::player::{ConnId, MatchId, Player, PlayerId};
use crate::protocol::{ClientCommand, Envelope, ServerEvent};
use crate::session_hub::{ConnectOutcome, SessionHub};
use crate::state_store::{presence_key, StateStore};
use crate::store::{Collaborators, ProblemSource, Store};

const ONLINE_SET_KEY: &str = "presence:online";

/// Work the matchmaker (or any other producer) asks the supervisor to do.
#[derive(Debug)]
pub(crate) enum SpawnRequest {
    /// Create a match and its runtime.
    Create {
        /// Resolved configuration.
        config: MatchConfig,
        /// Lobby owner, for custom matches.
        owner: Option<PlayerId>,
        /// Initial players.
        players: Vec<Player>,
        /// Paired by the matchmaker (confirmation window applies).
        matchmade: bool,
        /// The new match id, or why it was refused.
        reply: oneshot::Sender<Result<MatchId, CommandError>>,
    },
    /// Route a join-by-id into an existing lobby.
    Join {
        /// Who is joining.
        player: Player,
        /// Target lobby.
        match_id: MatchId,
        /// Outcome for the caller.
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
}

struct SupervisorInner {
    clock: Clock,
    config: Arc<CoreConfig>,
    collab: Collaborators,
    hub: SessionHub,
    matchmaker: MatchmakerHandle,
    registry: RwLock<HashMap<MatchId, RuntimeHandle>>,
    exits_tx: mpsc::UnboundedSender<RuntimeExit>,
    instance_id: String,
    shutting_down: AtomicBool,
}

/// Spawns match runtimes, routes commands and owns graceful shutdown.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Boots the core: session hub, matchmaker actor and control loop.
    pub fn new(
        clock: Clock,
        config: CoreConfig,
        state_store: Arc<dyn StateStore>,
        store: Arc<dyn Store>,
        problems: Arc<dyn ProblemSource>,
        grader: Arc<dyn GraderClient>,
    ) -> Self {
        if let Some(dir) = config.log_dir.as_deref() {
            if let Err(e) = crate::logger::init_logger(dir) {
                eprintln!("file logging disabled: {e:#}");
            }
        }
        let config = Arc::new(config);
        let collab = Collaborators {
            state_store,
            store,
            problems,
            grader,
        };
        let hub = SessionHub::new(clock, &config);
        let (spawn_tx, spawn_rx) = mpsc::channel(64);
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let matchmaker = spawn_matchmaker(
            clock,
            config.clone(),
            collab.state_store.clone(),
            hub.clone(),
            spawn_tx,
        );

        let inner = Arc::new(SupervisorInner {
            clock,
            config,
            collab,
            hub,
            matchmaker,
            registry: RwLock::new(HashMap::new()),
            exits_tx,
            instance_id: format!("arena-{}", uuid::Uuid::new_v4()),
            shutting_down: AtomicBool::new(false),
        });
        tokio::spawn(control_loop(inner.clone(), spawn_rx, exits_rx));
        info!(instance = %inner.instance_id, "supervisor started");
        Self { inner }
    }

    /// The session hub, for transports that deliver frames themselves.
    pub fn hub(&self) -> SessionHub {
        self.inner.hub.clone()
    }

    /// Live match count on this instance.
    pub fn live_matches(&self) -> usize {
        self.inner.registry.read().len()
    }

    /// Registers a connection for an authenticated player. A player still
    /// bound to a live match is re-attached and receives a fresh
    /// `resync`.
    pub async fn connect(&self, player: Player) -> ConnectOutcome {
        let player_id = player.player_id;
        let outcome = self.inner.hub.connect(player);
        let _ = self
            .inner
            .collab
            .state_store
            .sadd(ONLINE_SET_KEY, &player_id.to_string())
            .await;
        self.write_presence(player_id, outcome.rejoined).await;

        if let Some(match_id) = outcome.rejoined {
            let handle = self.lookup(match_id);
            if let Some(handle) = handle {
                let _ = handle.send(MatchCommand::Reconnected { player_id }).await;
                if let Ok(snapshot) = handle.snapshot().await {
                    self.inner.hub.send_to_conn(
                        outcome.conn_id,
                        Envelope::scoped(
                            match_id,
                            snapshot.version,
                            ServerEvent::Resync { snapshot },
                        ),
                    );
                }
            }
        }
        outcome
    }

    /// Tears a connection down; the player's ticket is cancelled and any
    /// live match is told to start the grace window.
    pub async fn disconnect(&self, conn_id: ConnId) {
        let Some(outcome) = self.inner.hub.disconnect(conn_id) else {
            return;
        };
        if !outcome.last_conn {
            return;
        }
        let _ = self
            .inner
            .collab
            .state_store
            .srem(ONLINE_SET_KEY, &outcome.player_id.to_string())
            .await;
        self.write_presence(outcome.player_id, outcome.active_match)
            .await;
        self.inner.matchmaker.cancel(outcome.player_id).await;
        if let Some(match_id) = outcome.active_match {
            if let Some(handle) = self.lookup(match_id) {
                let _ = handle
                    .send(MatchCommand::Disconnected {
                        player_id: outcome.player_id,
                    })
                    .await;
            }
        }
    }

    /// Validates one inbound command and delivers it to its target;
    /// rejections go back to the sending connection only.
    pub async fn handle_command(&self, conn_id: ConnId, command: ClientCommand) {
        let Some(player) = self.inner.hub.player_of(conn_id) else {
            debug!(%conn_id, "command from unknown connection dropped");
            return;
        };
        if let Err(e) = self.dispatch(conn_id, player, command).await {
            self.inner
                .hub
                .send_to_conn(conn_id, Envelope::direct(e.into()));
        }
    }

    async fn dispatch(
        &self,
        conn_id: ConnId,
        player: Player,
        command: ClientCommand,
    ) -> Result<(), CommandError> {
        let player_id = player.player_id;
        match command {
            ClientCommand::FindMatch { mode, preferences } => {
                if self.inner.hub.active_match_of(player_id).is_some() {
                    return Err(CommandError::wrong_state("finish your current match first"));
                }
                self.inner
                    .matchmaker
                    .find_match(player, mode, preferences)
                    .await
                    .map(|_| ())
            }
            ClientCommand::CancelMatchmaking {} => {
                self.inner.matchmaker.cancel(player_id).await;
                Ok(())
            }
            ClientCommand::CreateCustom { config } => {
                if self.inner.hub.active_match_of(player_id).is_some() {
                    return Err(CommandError::wrong_state("finish your current match first"));
                }
                let match_id = self
                    .inner
                    .matchmaker
                    .create_custom(player.clone(), config)
                    .await?;
                self.write_presence(player_id, Some(match_id)).await;
                self.inner.hub.send_to_conn(
                    conn_id,
                    Envelope::direct(ServerEvent::MatchFound {
                        match_id,
                        mode: crate::player::MatchMode::Custom,
                        players: vec![player],
                    }),
                );
                Ok(())
            }
            ClientCommand::JoinGame { match_id } => {
                // A player holds a slot in at most one active match.
                if let Some(active) = self.inner.hub.active_match_of(player_id) {
                    if active == match_id {
                        return Err(CommandError::wrong_state("already joined"));
                    }
                    return Err(CommandError::wrong_state("finish your current match first"));
                }
                self.inner
                    .matchmaker
                    .join_custom(player, match_id)
                    .await?;
                self.write_presence(player_id, Some(match_id)).await;
                self.send_resync(conn_id, match_id).await;
                Ok(())
            }
            ClientCommand::LeaveGame { match_id } => {
                self.inner.hub.authorize(conn_id, match_id)?;
                let handle = self.require(match_id)?;
                handle.leave(player_id).await?;
                self.write_presence(player_id, None).await;
                Ok(())
            }
            ClientCommand::Ready { match_id } => {
                self.inner.hub.authorize(conn_id, match_id)?;
                self.require(match_id)?.ready(player_id).await
            }
            ClientCommand::StartGame { match_id } => {
                self.inner.hub.authorize(conn_id, match_id)?;
                self.require(match_id)?.force_start(player_id).await
            }
            ClientCommand::SubmitSolution {
                match_id,
                round_index,
                code,
                language,
            } => {
                self.inner.hub.authorize(conn_id, match_id)?;
                let handle = self.require(match_id)?;
                let submission_id = handle
                    .submit(player_id, round_index, code, language)
                    .await?;
                self.inner.hub.send_to_conn(
                    conn_id,
                    Envelope::direct(ServerEvent::SubmissionAck { submission_id }),
                );
                Ok(())
            }
            ClientCommand::SpectateGame { match_id } => {
                let handle = self.require(match_id)?;
                handle.spectate(player_id).await?;
                self.send_resync(conn_id, match_id).await;
                Ok(())
            }
            ClientCommand::StopSpectating { match_id } => {
                self.inner.hub.authorize(conn_id, match_id)?;
                let handle = self.require(match_id)?;
                let _ = handle
                    .send(MatchCommand::StopSpectating { player_id })
                    .await;
                Ok(())
            }
            ClientCommand::GetGameState { match_id } => {
                self.inner.hub.authorize(conn_id, match_id)?;
                self.send_resync(conn_id, match_id).await;
                Ok(())
            }
            ClientCommand::SendChatMessage { match_id, text } => {
                self.inner.hub.chat(conn_id, match_id, &text)
            }
            ClientCommand::UserTyping {
                match_id,
                is_typing,
            } => self.inner.hub.typing(conn_id, match_id, is_typing),
        }
    }

    /// Sends `shutdown` to every live runtime and waits for them to
    /// persist their terminal records.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.matchmaker.shutdown().await;

        let handles: Vec<RuntimeHandle> =
            self.inner.registry.read().values().cloned().collect();
        for handle in handles {
            let _ = handle.send(MatchCommand::Shutdown).await;
        }

        let drained = self
            .inner
            .clock
            .timeout_at(
                self.inner.clock.now() + Duration::from_secs(5),
                async {
                    while !self.inner.registry.read().is_empty() {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            )
            .await;
        if drained.is_err() {
            warn!(
                remaining = self.inner.registry.read().len(),
                "runtimes still live after shutdown window"
            );
        }
    }

    fn lookup(&self, match_id: MatchId) -> Option<RuntimeHandle> {
        self.inner.registry.read().get(&match_id).cloned()
    }

    fn require(&self, match_id: MatchId) -> Result<RuntimeHandle, CommandError> {
        self.lookup(match_id)
            .ok_or_else(|| CommandError::not_found("no such match"))
    }

    async fn send_resync(&self, conn_id: ConnId, match_id: MatchId) {
        if let Some(handle) = self.lookup(match_id) {
            if let Ok(snapshot) = handle.snapshot().await {
                self.inner.hub.send_to_conn(
                    conn_id,
                    Envelope::scoped(match_id, snapshot.version, ServerEvent::Resync { snapshot }),
                );
            }
        }
    }

    /// Best-effort presence record; versioned write with one retry.
    async fn write_presence(&self, player_id: PlayerId, active_match: Option<MatchId>) {
        let key = presence_key(player_id);
        let now_ms = self.inner.clock.millis_since_epoch(self.inner.clock.now());
        let value = serde_json::json!({
            "last_seen_ms": now_ms,
            "active_match_id": active_match,
        });
        for _ in 0..2 {
            let version = match self.inner.collab.state_store.get(&key).await {
                Ok(Some((_, version))) => version,
                Ok(None) => 0,
                Err(_) => return,
            };
            if self
                .inner
                .collab
                .state_store
                .cas_set(&key, version, value.clone())
                .await
                .is_ok()
            {
                return;
            }
        }
    }
}

fn create_match(inner: &Arc<SupervisorInner>, request: SpawnRequest) {
    let SpawnRequest::Create {
        config,
        owner,
        players,
        matchmade,
        reply,
    } = request
    else {
        unreachable!("join requests are routed elsewhere");
    };
    if inner.shutting_down.load(Ordering::SeqCst) {
        let _ = reply.send(Err(CommandError::new(
            ErrorCode::Busy,
            "instance is shutting down",
        )));
        return;
    }
    {
        let registry = inner.registry.read();
        if registry.len() >= inner.config.max_matches {
            let _ = reply.send(Err(CommandError::new(
                ErrorCode::Busy,
                "match capacity reached",
            )));
            return;
        }
    }
    let match_id = MatchId::new();
    let seed = RuntimeSeed {
        match_id,
        config,
        owner,
        initial_players: players,
        matchmade,
    };
    let handle = spawn_runtime(
        seed,
        inner.clock,
        inner.config.clone(),
        inner.collab.clone(),
        inner.hub.clone(),
        inner.exits_tx.clone(),
        inner.instance_id.clone(),
    );
    inner.registry.write().insert(match_id, handle);
    debug!(%match_id, "match registered");
    let _ = reply.send(Ok(match_id));
}

async fn control_loop(
    inner: Arc<SupervisorInner>,
    mut spawn_rx: mpsc::Receiver<SpawnRequest>,
    mut exits_rx: mpsc::UnboundedReceiver<RuntimeExit>,
) {
    // The spawn channel closes when the matchmaker stops; exits must keep
    // draining past that point so shutdown can reap the last runtimes.
    let mut spawn_open = true;
    loop {
        tokio::select! {
            request = spawn_rx.recv(), if spawn_open => {
                match request {
                    Some(request @ SpawnRequest::Create { .. }) => create_match(&inner, request),
                    Some(SpawnRequest::Join { player, match_id, reply }) => {
                        let handle = inner.registry.read().get(&match_id).cloned();
                        match handle {
                            Some(handle) => {
                                // Forwarded off-loop so a busy runtime cannot
                                // stall match creation.
                                tokio::spawn(async move {
                                    let _ = reply.send(handle.join(player).await);
                                });
                            }
                            None => {
                                let _ = reply.send(Err(CommandError::not_found("no such lobby")));
                            }
                        }
                    }
                    None => spawn_open = false,
                }
            }
            exit = exits_rx.recv() => {
                let Some(exit) = exit else { break };
                inner.registry.write().remove(&exit.match_id);
                debug!(match_id = %exit.match_id, requeue = exit.requeue.len(), "match reaped");
                let matchmaker = inner.matchmaker.clone();
                let requeue: Vec<PlayerId> =
                    exit.requeue.iter().map(|p| p.player_id).collect();
                // Off-loop: the matchmaker may itself be waiting on this
                // loop's spawn channel.
                tokio::spawn(async move {
                    matchmaker.match_closed(exit.match_id, requeue).await;
                });
            }
        }
    }
}
