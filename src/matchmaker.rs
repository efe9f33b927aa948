//! The queueing and pairing engine.
//!
//! One long-running actor per process. Queued modes get one FIFO queue
//! per `(mode, rating bucket)` pair, held as sorted sets in the state
//! store and keyed by enqueue time; custom lobbies are a separate
//! directory keyed by match id.
//!
//! Pairing widens each waiter's rating window over time: starting at
//! ±`bucket_widen_step`, the window grows by two steps per
//! `bucket_widen_interval` of wait, capped at ±`bucket_widen_max`. Two
//! players are compatible once their rating distance falls strictly
//! inside the longer waiter's window; the earliest enqueue wins among
//! candidates. Multi-player modes gather a full group the same way, and
//! at the fill deadline either relax to the largest group of at least
//! two or pad with synthesized opponents.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::{CoreConfig, CustomConfig};
use crate::error::{CommandError, ErrorCode};
use crate::match_state::MatchConfig;
use crate::player::{MatchId, MatchMode, Player, PlayerId, TicketId};
use crate::protocol::{Envelope, MatchPreferences, ServerEvent};
use crate::session_hub::SessionHub;
use crate::state_store::{lobby_key, queue_key, StateStore};
use crate::supervisor::SpawnRequest;

/// A queued wait for a match.
#[derive(Debug, Clone)]
struct QueueTicket {
    ticket_id: TicketId,
    player: Player,
    mode: MatchMode,
    preferences: MatchPreferences,
    enqueued_at: Instant,
    /// Enqueue timestamp in epoch milliseconds; the sorted-set score.
    score: u64,
    bucket: i32,
}

#[derive(Debug)]
enum MmCommand {
    Enqueue {
        player: Player,
        mode: MatchMode,
        preferences: MatchPreferences,
        reply: oneshot::Sender<Result<TicketId, CommandError>>,
    },
    Cancel {
        player_id: PlayerId,
    },
    CreateCustom {
        owner: Player,
        config: CustomConfig,
        reply: oneshot::Sender<Result<MatchId, CommandError>>,
    },
    JoinCustom {
        player: Player,
        match_id: MatchId,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    MatchClosed {
        match_id: MatchId,
        requeue: Vec<PlayerId>,
    },
    Shutdown,
}

/// Cloneable handle to the matchmaker actor.
#[derive(Clone)]
pub struct MatchmakerHandle {
    tx: mpsc::Sender<MmCommand>,
}

impl MatchmakerHandle {
    /// Enqueues a player; resolves to a cancellable ticket.
    pub async fn find_match(
        &self,
        player: Player,
        mode: MatchMode,
        preferences: MatchPreferences,
    ) -> Result<TicketId, CommandError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(MmCommand::Enqueue {
                player,
                mode,
                preferences,
                reply,
            })
            .await
            .is_err()
        {
            return Err(CommandError::new(ErrorCode::Internal, "matchmaker is down"));
        }
        rx.await
            .unwrap_or_else(|_| Err(CommandError::new(ErrorCode::Internal, "matchmaker is down")))
    }

    /// Cancels a player's pending ticket; a no-op if already paired.
    pub async fn cancel(&self, player_id: PlayerId) {
        let _ = self.tx.send(MmCommand::Cancel { player_id }).await;
    }

    /// Allocates a custom lobby and returns its match id.
    pub async fn create_custom(
        &self,
        owner: Player,
        config: CustomConfig,
    ) -> Result<MatchId, CommandError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(MmCommand::CreateCustom {
                owner,
                config,
                reply,
            })
            .await
            .is_err()
        {
            return Err(CommandError::new(ErrorCode::Internal, "matchmaker is down"));
        }
        rx.await
            .unwrap_or_else(|_| Err(CommandError::new(ErrorCode::Internal, "matchmaker is down")))
    }

    /// Joins a custom lobby by id, checking capacity and privacy.
    pub async fn join_custom(
        &self,
        player: Player,
        match_id: MatchId,
    ) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(MmCommand::JoinCustom {
                player,
                match_id,
                reply,
            })
            .await
            .is_err()
        {
            return Err(CommandError::new(ErrorCode::Internal, "matchmaker is down"));
        }
        rx.await
            .unwrap_or_else(|_| Err(CommandError::new(ErrorCode::Internal, "matchmaker is down")))
    }

    /// Reports a finished match; confirmation failures bring their
    /// players back to the head of the queue.
    pub(crate) async fn match_closed(&self, match_id: MatchId, requeue: Vec<PlayerId>) {
        let _ = self
            .tx
            .send(MmCommand::MatchClosed { match_id, requeue })
            .await;
    }

    /// Stops the actor after the current sweep.
    pub(crate) async fn shutdown(&self) {
        let _ = self.tx.send(MmCommand::Shutdown).await;
    }
}

/// Spawns the matchmaker actor and returns its handle.
pub(crate) fn spawn_matchmaker(
    clock: Clock,
    config: Arc<CoreConfig>,
    state_store: Arc<dyn StateStore>,
    hub: SessionHub,
    spawner: mpsc::Sender<SpawnRequest>,
) -> MatchmakerHandle {
    let (tx, rx) = mpsc::channel(256);
    let actor = Matchmaker {
        clock,
        config,
        state_store,
        hub,
        spawner,
        rx,
        tickets: HashMap::new(),
        paired: HashMap::new(),
    };
    tokio::spawn(actor.run());
    MatchmakerHandle { tx }
}

struct Matchmaker {
    clock: Clock,
    config: Arc<CoreConfig>,
    state_store: Arc<dyn StateStore>,
    hub: SessionHub,
    spawner: mpsc::Sender<SpawnRequest>,
    rx: mpsc::Receiver<MmCommand>,
    tickets: HashMap<PlayerId, QueueTicket>,
    /// Tickets of matches in their confirmation window, kept so a
    /// no-confirm cancellation can restore queue positions.
    paired: HashMap<MatchId, Vec<QueueTicket>>,
}

impl Matchmaker {
    #[instrument(skip_all)]
    async fn run(mut self) {
        info!("matchmaker started");
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(MmCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                _ = sweep.tick() => {
                    self.pair_sweep().await;
                }
            }
        }
        info!("matchmaker stopped");
    }

    async fn handle_command(&mut self, command: MmCommand) {
        match command {
            MmCommand::Enqueue {
                player,
                mode,
                preferences,
                reply,
            } => {
                let _ = reply.send(self.enqueue(player, mode, preferences).await);
            }
            MmCommand::Cancel { player_id } => {
                self.remove_ticket(player_id).await;
            }
            MmCommand::CreateCustom {
                owner,
                config,
                reply,
            } => {
                let _ = reply.send(self.create_custom(owner, config).await);
            }
            MmCommand::JoinCustom {
                player,
                match_id,
                reply,
            } => {
                let _ = reply.send(self.join_custom(player, match_id).await);
            }
            MmCommand::MatchClosed { match_id, requeue } => {
                self.match_closed(match_id, requeue).await;
            }
            MmCommand::Shutdown => unreachable!("handled in run"),
        }
    }

    async fn enqueue(
        &mut self,
        player: Player,
        mode: MatchMode,
        preferences: MatchPreferences,
    ) -> Result<TicketId, CommandError> {
        if !mode.is_queued() {
            return Err(CommandError::new(
                ErrorCode::BadRequest,
                "custom matches are join-by-id",
            ));
        }
        if self.tickets.contains_key(&player.player_id) {
            return Err(CommandError::wrong_state("already queued"));
        }
        let now = self.clock.now();
        let score = self.clock.millis_since_epoch(now);
        let bucket = self.bucket_of(player.rating);
        let ticket = QueueTicket {
            ticket_id: TicketId::new(),
            player,
            mode,
            preferences,
            enqueued_at: now,
            score,
            bucket,
        };
        if let Err(e) = self
            .state_store
            .zadd(
                &queue_key(mode.as_str(), bucket),
                score,
                &ticket.player.player_id.to_string(),
            )
            .await
        {
            warn!(error = %e, "could not enqueue ticket");
            return Err(CommandError::new(ErrorCode::Internal, "queue unavailable"));
        }
        debug!(player = %ticket.player.player_id, %mode, bucket, "ticket enqueued");
        let id = ticket.ticket_id;
        self.tickets.insert(ticket.player.player_id, ticket);
        Ok(id)
    }

    async fn remove_ticket(&mut self, player_id: PlayerId) {
        if let Some(ticket) = self.tickets.remove(&player_id) {
            let _ = self
                .state_store
                .zrem(
                    &queue_key(ticket.mode.as_str(), ticket.bucket),
                    &player_id.to_string(),
                )
                .await;
            debug!(player = %player_id, "ticket cancelled");
        }
    }

    async fn create_custom(
        &mut self,
        owner: Player,
        custom: CustomConfig,
    ) -> Result<MatchId, CommandError> {
        let config = MatchConfig::custom(&custom, &self.config);
        let owner_id = owner.player_id;
        let is_private = config.is_private;
        let max_players = config.max_players;
        let match_id = self
            .spawn_match(config, Some(owner_id), vec![owner], false)
            .await?;

        let entry = serde_json::json!({
            "match_id": match_id,
            "owner": owner_id,
            "is_private": is_private,
            "max_players": max_players,
        });
        if let Err(e) = self
            .state_store
            .cas_set(&lobby_key(match_id), 0, entry)
            .await
        {
            warn!(error = %e, "could not record custom lobby");
        }
        info!(%match_id, owner = %owner_id, "custom lobby created");
        Ok(match_id)
    }

    async fn join_custom(
        &mut self,
        player: Player,
        match_id: MatchId,
    ) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        if self
            .spawner
            .send(SpawnRequest::Join {
                player,
                match_id,
                reply,
            })
            .await
            .is_err()
        {
            return Err(CommandError::new(ErrorCode::Internal, "supervisor is down"));
        }
        rx.await
            .unwrap_or_else(|_| Err(CommandError::not_found("no such lobby")))
    }

    async fn match_closed(&mut self, match_id: MatchId, requeue: Vec<PlayerId>) {
        let Some(tickets) = self.paired.remove(&match_id) else {
            return;
        };
        for ticket in tickets {
            if !requeue.contains(&ticket.player.player_id) {
                continue;
            }
            // The original enqueue score is retained: the player returns
            // to the head of their queue.
            if self
                .state_store
                .zadd(
                    &queue_key(ticket.mode.as_str(), ticket.bucket),
                    ticket.score,
                    &ticket.player.player_id.to_string(),
                )
                .await
                .is_ok()
            {
                info!(player = %ticket.player.player_id, "requeued at head after failed pairing");
                self.tickets.insert(ticket.player.player_id, ticket);
            }
        }
    }

    fn bucket_of(&self, rating: i32) -> i32 {
        let width = (self.config.bucket_widen_step * 2).max(1) as i32;
        rating.div_euclid(width)
    }

    /// Rating half-window of a waiter: ±step before the first widening,
    /// then two steps per elapsed interval, capped at the maximum.
    fn window_of(&self, waited: std::time::Duration) -> u32 {
        let step = self.config.bucket_widen_step;
        let intervals =
            (waited.as_millis() / self.config.bucket_widen_interval.as_millis().max(1)) as u32;
        (2 * step * intervals).clamp(step, self.config.bucket_widen_max)
    }

    fn compatible(&self, now: Instant, a: &QueueTicket, b: &QueueTicket) -> bool {
        if a.mode != b.mode {
            return false;
        }
        let longest_wait = now
            .saturating_duration_since(a.enqueued_at)
            .max(now.saturating_duration_since(b.enqueued_at));
        let window = self.window_of(longest_wait);
        a.player.rating.abs_diff(b.player.rating) < window
    }

    async fn pair_sweep(&mut self) {
        let now = self.clock.now();
        let modes: Vec<MatchMode> = {
            let mut seen: Vec<MatchMode> = Vec::new();
            for ticket in self.tickets.values() {
                if !seen.contains(&ticket.mode) {
                    seen.push(ticket.mode);
                }
            }
            seen
        };
        for mode in modes {
            let rules = self.config.mode_rules(mode);
            if rules.max_players <= 2 {
                self.pair_two_player(mode, now).await;
            } else {
                self.pair_group(mode, rules.min_players, rules.max_players, now)
                    .await;
            }
        }
    }

    async fn pair_two_player(&mut self, mode: MatchMode, now: Instant) {
        loop {
            let mut waiting: Vec<QueueTicket> = self
                .tickets
                .values()
                .filter(|t| t.mode == mode)
                .cloned()
                .collect();
            waiting.sort_by_key(|t| (t.score, t.player.player_id));
            let Some(anchor) = waiting.first().cloned() else {
                return;
            };
            let candidate = waiting
                .iter()
                .skip(1)
                .find(|c| self.compatible(now, &anchor, c))
                .cloned();
            let Some(candidate) = candidate else {
                return;
            };
            // The store is the queue of record: a ticket it no longer
            // lists was cancelled elsewhere and is dropped locally.
            if !self.claim(&anchor).await {
                self.tickets.remove(&anchor.player.player_id);
                continue;
            }
            if !self.claim(&candidate).await {
                self.tickets.remove(&candidate.player.player_id);
                self.restore(vec![anchor]).await;
                continue;
            }
            if !self.launch(mode, vec![anchor, candidate]).await {
                return;
            }
        }
    }

    async fn pair_group(
        &mut self,
        mode: MatchMode,
        min_players: u32,
        max_players: u32,
        now: Instant,
    ) {
        let mut waiting: Vec<QueueTicket> = self
            .tickets
            .values()
            .filter(|t| t.mode == mode)
            .cloned()
            .collect();
        waiting.sort_by_key(|t| (t.score, t.player.player_id));
        let Some(anchor) = waiting.first().cloned() else {
            return;
        };

        let mut group: Vec<QueueTicket> = vec![anchor.clone()];
        for other in waiting.iter().skip(1) {
            if group.len() as u32 >= max_players {
                break;
            }
            if self.compatible(now, &anchor, other) {
                group.push(other.clone());
            }
        }

        let anchor_wait = now.saturating_duration_since(anchor.enqueued_at);
        let full = group.len() as u32 >= max_players;
        let deadline_hit = anchor_wait >= self.config.fill_deadline;
        if !full && !deadline_hit {
            return;
        }

        let mut bots = Vec::new();
        if !full && group.len() < 2 {
            // Nobody compatible arrived in time: pad with synthesized
            // opponents around the waiter's rating.
            let mut rng = rand::thread_rng();
            let base = anchor.player.rating;
            while (group.len() + bots.len()) < min_players.max(2) as usize {
                bots.push(Player::bot(base + rng.gen_range(-50..=50)));
            }
        }

        let mut claimed = Vec::new();
        for ticket in group {
            if self.claim(&ticket).await {
                claimed.push(ticket);
            } else {
                self.tickets.remove(&ticket.player.player_id);
            }
        }
        if claimed.is_empty() {
            return;
        }
        self.launch_with_bots(mode, claimed, bots).await;
    }

    /// Atomically pops a ticket's queue entry; `false` when the store no
    /// longer lists it (cancelled elsewhere).
    async fn claim(&self, ticket: &QueueTicket) -> bool {
        let member = ticket.player.player_id.to_string();
        let expect = member.clone();
        matches!(
            self.state_store
                .zpop_min_if(
                    &queue_key(ticket.mode.as_str(), ticket.bucket),
                    Box::new(move |_, m| m == expect),
                )
                .await,
            Ok(Some(_))
        )
    }

    async fn launch(&mut self, mode: MatchMode, tickets: Vec<QueueTicket>) -> bool {
        self.launch_with_bots(mode, tickets, Vec::new()).await
    }

    async fn launch_with_bots(
        &mut self,
        mode: MatchMode,
        tickets: Vec<QueueTicket>,
        bots: Vec<Player>,
    ) -> bool {
        let mut config = MatchConfig::for_mode(mode, &self.config);
        self.narrow_whitelist(&mut config, &tickets);
        let mut players: Vec<Player> = tickets.iter().map(|t| t.player.clone()).collect();
        players.extend(bots);

        let (reply, rx) = oneshot::channel();
        let request = SpawnRequest::Create {
            config,
            owner: None,
            players: players.clone(),
            matchmade: true,
            reply,
        };
        if self.spawner.send(request).await.is_err() {
            self.restore(tickets).await;
            return false;
        }
        match rx.await {
            Ok(Ok(match_id)) => {
                for ticket in &tickets {
                    self.tickets.remove(&ticket.player.player_id);
                }
                info!(%match_id, %mode, players = players.len(), "match found");
                let event = ServerEvent::MatchFound {
                    match_id,
                    mode,
                    players: players.clone(),
                };
                for ticket in &tickets {
                    self.hub.send_to_player(
                        ticket.player.player_id,
                        Envelope::direct(event.clone()),
                    );
                    let _ = self
                        .state_store
                        .publish(
                            &format!("inbox:{}", ticket.player.player_id),
                            serde_json::to_value(&event).unwrap_or_default(),
                        )
                        .await;
                }
                self.paired.insert(match_id, tickets);
                true
            }
            Ok(Err(e)) => {
                // Back-pressure from the supervisor: put everyone back and
                // retry on a later sweep.
                warn!(error = %e, "match spawn rejected");
                self.restore(tickets).await;
                false
            }
            Err(_) => {
                self.restore(tickets).await;
                false
            }
        }
    }

    fn narrow_whitelist(&self, config: &mut MatchConfig, tickets: &[QueueTicket]) {
        let mut narrowed = config.language_whitelist.clone();
        for ticket in tickets {
            if ticket.preferences.languages.is_empty() {
                continue;
            }
            narrowed.retain(|l| {
                ticket
                    .preferences
                    .languages
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(l))
            });
        }
        if !narrowed.is_empty() {
            config.language_whitelist = narrowed;
        }
    }

    async fn restore(&mut self, tickets: Vec<QueueTicket>) {
        for ticket in tickets {
            let _ = self
                .state_store
                .zadd(
                    &queue_key(ticket.mode.as_str(), ticket.bucket),
                    ticket.score,
                    &ticket.player.player_id.to_string(),
                )
                .await;
            self.tickets.insert(ticket.player.player_id, ticket);
        }
    }

    async fn spawn_match(
        &self,
        config: MatchConfig,
        owner: Option<PlayerId>,
        players: Vec<Player>,
        matchmade: bool,
    ) -> Result<MatchId, CommandError> {
        let (reply, rx) = oneshot::channel();
        if self
            .spawner
            .send(SpawnRequest::Create {
                config,
                owner,
                players,
                matchmade,
                reply,
            })
            .await
            .is_err()
        {
            return Err(CommandError::new(ErrorCode::Internal, "supervisor is down"));
        }
        rx.await
            .unwrap_or_else(|_| Err(CommandError::new(ErrorCode::Internal, "supervisor is down")))
    }
}
