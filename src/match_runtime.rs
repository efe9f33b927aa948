//! The per-match single-writer actor.
//!
//! One task exclusively owns one [`MatchState`] and is its only mutator.
//! The task is a `select` over four wake sources: the command mailbox,
//! the earliest armed deadline, in-flight grading calls, and the problem
//! prefetch. Every mutation bumps the state version, is persisted to the
//! state store CAS-guarded by that version, and is broadcast to the match
//! room with the version attached so clients can detect gaps.
//!
//! Losing a CAS means another instance took ownership: the runtime
//! self-cancels rather than fighting for the match.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, DeadlineSet};
use crate::config::CoreConfig;
use crate::error::{retry_with_backoff, CommandError, StateStoreError};
use crate::grader::{fallback_report, GradeError, GradeReport, GradeRequest};
use crate::match_state::{
    Advanced, CancelReason, EndReason, LeaveOutcome, MatchConfig, MatchSnapshot, MatchState,
    MatchStatus, Problem, RoundStatus,
};
use crate::player::{MatchId, Player, PlayerId, SubmissionId};
use crate::protocol::{LeaveReason, ServerEvent};
use crate::session_hub::{RoomKind, SessionHub};
use crate::state_store::{lobby_key, match_key, match_owner_key};
use crate::store::{Collaborators, MatchRecord};

/// Commands delivered to a match runtime's mailbox.
#[derive(Debug)]
pub enum MatchCommand {
    /// Join as a player.
    Join {
        /// Who is joining.
        player: Player,
        /// Outcome for the caller.
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    /// Leave pre-start; forfeit post-start. The lobby owner leaving
    /// pre-start cancels the lobby.
    Leave {
        /// Who is leaving.
        player_id: PlayerId,
        /// Outcome for the caller.
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    /// Confirm readiness.
    Ready {
        /// Who is ready.
        player_id: PlayerId,
        /// Outcome for the caller.
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    /// Owner-only forced start.
    ForceStart {
        /// Who asked.
        player_id: PlayerId,
        /// Outcome for the caller.
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    /// Submit a solution for the current round.
    Submit {
        /// Author.
        player_id: PlayerId,
        /// Round the code answers.
        round_index: u32,
        /// Source code.
        code: String,
        /// Language tag.
        language: String,
        /// Accepted submission id, or the rejection.
        reply: oneshot::Sender<Result<SubmissionId, CommandError>>,
    },
    /// Join the spectator room.
    Spectate {
        /// Who is watching.
        player_id: PlayerId,
        /// Outcome for the caller.
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    /// Leave the spectator room.
    StopSpectating {
        /// Who stopped watching.
        player_id: PlayerId,
    },
    /// Request the current snapshot.
    GetState {
        /// Snapshot for the caller.
        reply: oneshot::Sender<MatchSnapshot>,
    },
    /// A player lost their last connection.
    Disconnected {
        /// Who dropped.
        player_id: PlayerId,
    },
    /// A player came back within the grace window.
    Reconnected {
        /// Who returned.
        player_id: PlayerId,
    },
    /// The process is stopping; cancel and persist a minimal record.
    Shutdown,
}

/// Sent to the supervisor when a runtime finishes, so the registry entry
/// and state-store keys can be reaped.
#[derive(Debug)]
pub struct RuntimeExit {
    /// Which match finished.
    pub match_id: MatchId,
    /// Players to put back at the head of the matchmaking queue (pairing
    /// confirmation failures only).
    pub requeue: Vec<Player>,
}

/// Cloneable mailbox handle to one match runtime.
#[derive(Clone, Debug)]
pub struct RuntimeHandle {
    match_id: MatchId,
    tx: mpsc::Sender<MatchCommand>,
}

impl RuntimeHandle {
    /// The match this handle addresses.
    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    /// Delivers a command; `false` when the runtime is gone.
    pub async fn send(&self, command: MatchCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, CommandError>>) -> MatchCommand,
    ) -> Result<T, CommandError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(build(reply)).await.is_err() {
            return Err(CommandError::not_found("match is gone"));
        }
        rx.await
            .unwrap_or_else(|_| Err(CommandError::not_found("match is gone")))
    }

    /// Joins a player; validated by the runtime.
    pub async fn join(&self, player: Player) -> Result<(), CommandError> {
        self.request(|reply| MatchCommand::Join { player, reply }).await
    }

    /// Leaves or forfeits.
    pub async fn leave(&self, player_id: PlayerId) -> Result<(), CommandError> {
        self.request(|reply| MatchCommand::Leave { player_id, reply })
            .await
    }

    /// Marks a player ready.
    pub async fn ready(&self, player_id: PlayerId) -> Result<(), CommandError> {
        self.request(|reply| MatchCommand::Ready { player_id, reply })
            .await
    }

    /// Owner-only forced start.
    pub async fn force_start(&self, player_id: PlayerId) -> Result<(), CommandError> {
        self.request(|reply| MatchCommand::ForceStart { player_id, reply })
            .await
    }

    /// Submits a solution.
    pub async fn submit(
        &self,
        player_id: PlayerId,
        round_index: u32,
        code: String,
        language: String,
    ) -> Result<SubmissionId, CommandError> {
        self.request(|reply| MatchCommand::Submit {
            player_id,
            round_index,
            code,
            language,
            reply,
        })
        .await
    }

    /// Joins the spectator room.
    pub async fn spectate(&self, player_id: PlayerId) -> Result<(), CommandError> {
        self.request(|reply| MatchCommand::Spectate { player_id, reply })
            .await
    }

    /// Requests the current snapshot.
    pub async fn snapshot(&self) -> Result<MatchSnapshot, CommandError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(MatchCommand::GetState { reply }).await.is_err() {
            return Err(CommandError::not_found("match is gone"));
        }
        rx.await
            .map_err(|_| CommandError::not_found("match is gone"))
    }
}

/// Everything needed to boot one match runtime.
pub(crate) struct RuntimeSeed {
    pub match_id: MatchId,
    pub config: MatchConfig,
    pub owner: Option<PlayerId>,
    pub initial_players: Vec<Player>,
    /// Paired by the matchmaker (confirmation window applies) rather than
    /// joined voluntarily.
    pub matchmade: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    ConfirmWindow,
    AutoStart,
    WaitingExpiry,
    Countdown,
    RoundDeadline,
    GradingDeadline,
    Grace(PlayerId),
    Retention,
}

enum Wake {
    Command(Option<MatchCommand>),
    Timer,
    Graded(SubmissionId, Result<GradeReport, GradeError>),
    Problem(anyhow::Result<Problem>),
}

/// Spawns a match runtime and returns its mailbox handle.
pub(crate) fn spawn_runtime(
    seed: RuntimeSeed,
    clock: Clock,
    config: Arc<CoreConfig>,
    collab: Collaborators,
    hub: SessionHub,
    exits: mpsc::UnboundedSender<RuntimeExit>,
    instance_id: String,
) -> RuntimeHandle {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity);
    let handle = RuntimeHandle {
        match_id: seed.match_id,
        tx,
    };
    let match_id = seed.match_id;
    let exits_on_panic = exits.clone();
    let hub_on_panic = hub.clone();
    let runtime = MatchRuntime::new(seed, clock, config, collab, hub, rx, exits, instance_id);
    tokio::spawn(async move {
        // A panic inside the runtime must not strand clients: report a
        // best-effort cancellation and let the supervisor reap the entry.
        let outcome = std::panic::AssertUnwindSafe(runtime.run()).catch_unwind().await;
        if outcome.is_err() {
            error!(%match_id, "match runtime panicked");
            hub_on_panic.broadcast(
                match_id,
                u64::MAX,
                ServerEvent::MatchEnd {
                    standings: Vec::new(),
                    reason: EndReason::Cancelled,
                },
            );
            hub_on_panic.drop_room(match_id);
            let _ = exits_on_panic.send(RuntimeExit {
                match_id,
                requeue: Vec::new(),
            });
        }
    });
    handle
}

struct MatchRuntime {
    clock: Clock,
    config: Arc<CoreConfig>,
    collab: Collaborators,
    hub: SessionHub,
    state: MatchState,
    rx: mpsc::Receiver<MatchCommand>,
    exits: mpsc::UnboundedSender<RuntimeExit>,
    instance_id: String,
    matchmade: bool,
    deadlines: DeadlineSet<TimerKind>,
    grading: FuturesUnordered<BoxFuture<'static, (SubmissionId, Result<GradeReport, GradeError>)>>,
    grading_queue: VecDeque<GradeRequest>,
    prefetch: Option<BoxFuture<'static, anyhow::Result<Problem>>>,
    problem_attempts: u32,
    pending_problem: Option<Problem>,
    countdown_done: bool,
    persisted_version: u64,
    lost_ownership: bool,
    store_dead: bool,
    pending_cancel: Option<CancelReason>,
    requeue_on_exit: Vec<Player>,
    done: bool,
}

impl MatchRuntime {
    #[allow(clippy::too_many_arguments)]
    fn new(
        seed: RuntimeSeed,
        clock: Clock,
        config: Arc<CoreConfig>,
        collab: Collaborators,
        hub: SessionHub,
        rx: mpsc::Receiver<MatchCommand>,
        exits: mpsc::UnboundedSender<RuntimeExit>,
        instance_id: String,
    ) -> Self {
        let now = clock.now();
        let mut state = MatchState::new(seed.match_id, seed.config, seed.owner, now);
        for player in seed.initial_players {
            let player_id = player.player_id;
            if state.add_player(player).is_ok() {
                hub.bind(player_id, seed.match_id, RoomKind::Players);
            }
        }
        Self {
            clock,
            config,
            collab,
            hub,
            state,
            rx,
            exits,
            instance_id,
            matchmade: seed.matchmade,
            deadlines: DeadlineSet::new(),
            grading: FuturesUnordered::new(),
            grading_queue: VecDeque::new(),
            prefetch: None,
            problem_attempts: 0,
            pending_problem: None,
            countdown_done: false,
            persisted_version: 0,
            lost_ownership: false,
            store_dead: false,
            pending_cancel: None,
            requeue_on_exit: Vec::new(),
            done: false,
        }
    }

    #[instrument(skip_all, fields(match_id = %self.state.match_id()))]
    async fn run(mut self) {
        info!(mode = %self.state.config.mode, matchmade = self.matchmade, "match runtime started");
        self.claim_ownership().await;
        self.persist().await;
        if let Some(reason) = self.pending_cancel.take() {
            self.cancel_match(reason).await;
        }

        let now = self.clock.now();
        if self.matchmade {
            self.deadlines
                .arm(TimerKind::ConfirmWindow, now + self.config.confirm_window);
        } else {
            self.deadlines
                .arm(TimerKind::WaitingExpiry, now + self.config.waiting_expiry);
        }

        while !self.done {
            let wake = self.next_wake().await;
            match wake {
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Command(None) => {
                    // Every handle is gone; treat as a shutdown.
                    self.cancel_match(CancelReason::Shutdown).await;
                }
                Wake::Timer => {
                    if let Some(kind) = self.deadlines.pop_due(self.clock.now()) {
                        self.handle_timer(kind).await;
                    }
                }
                Wake::Graded(submission_id, result) => {
                    self.handle_grade_outcome(submission_id, result).await;
                }
                Wake::Problem(result) => self.handle_problem(result).await,
            }
            if let Some(reason) = self.pending_cancel.take() {
                self.cancel_match(reason).await;
            }
        }
        self.finish().await;
    }

    async fn next_wake(&mut self) -> Wake {
        let clock = self.clock;
        let next_deadline = self.deadlines.next();
        let timer = async move {
            match next_deadline {
                Some((at, _)) => clock.sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        let mut prefetch = self.prefetch.take();

        let wake = tokio::select! {
            command = self.rx.recv() => Wake::Command(command),
            _ = timer => Wake::Timer,
            Some((submission_id, result)) = self.grading.next(), if !self.grading.is_empty() => {
                Wake::Graded(submission_id, result)
            }
            result = async { prefetch.as_mut().expect("guarded").await }, if prefetch.is_some() => {
                Wake::Problem(result)
            }
        };
        if !matches!(wake, Wake::Problem(_)) {
            // The prefetch did not resolve; keep polling it next turn.
            self.prefetch = prefetch;
        }
        wake
    }

    async fn handle_command(&mut self, command: MatchCommand) {
        match command {
            MatchCommand::Join { player, reply } => {
                let player_id = player.player_id;
                let snapshot_player = player.clone();
                let result = self.state.add_player(player);
                if result.is_ok() {
                    self.hub
                        .bind(player_id, self.state.match_id(), RoomKind::Players);
                    self.broadcast(ServerEvent::PlayerJoined {
                        player: snapshot_player,
                    });
                    if !self.matchmade && self.state.has_min_players() {
                        self.deadlines.arm(
                            TimerKind::AutoStart,
                            self.clock.now() + self.config.auto_start_after,
                        );
                    }
                    self.persist().await;
                }
                let _ = reply.send(result);
            }
            MatchCommand::Leave { player_id, reply } => {
                let result = self.state.remove_player(player_id);
                match &result {
                    Ok(LeaveOutcome::Left {
                        was_owner,
                        now_empty,
                    }) => {
                        self.hub.unbind(player_id, self.state.match_id());
                        self.broadcast(ServerEvent::PlayerLeft {
                            player_id,
                            reason: LeaveReason::Left,
                        });
                        if *was_owner {
                            let _ = reply.send(Ok(()));
                            self.cancel_match(CancelReason::OwnerCancel).await;
                            return;
                        }
                        if *now_empty {
                            let _ = reply.send(Ok(()));
                            self.cancel_match(CancelReason::PlayerDrop).await;
                            return;
                        }
                        self.persist().await;
                    }
                    Ok(LeaveOutcome::Forfeited) => {
                        self.deadlines.cancel(TimerKind::Grace(player_id));
                        self.hub.unbind(player_id, self.state.match_id());
                        self.broadcast(ServerEvent::PlayerLeft {
                            player_id,
                            reason: LeaveReason::Forfeited,
                        });
                        let _ = reply.send(Ok(()));
                        self.after_ejection().await;
                        return;
                    }
                    Err(_) => {}
                }
                let _ = reply.send(result.map(|_| ()));
            }
            MatchCommand::Ready { player_id, reply } => {
                let result = self.state.mark_ready(player_id);
                match result {
                    Ok(ready) => {
                        let _ = reply.send(Ok(()));
                        self.persist().await;
                        if ready {
                            self.enter_starting().await;
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            MatchCommand::ForceStart { player_id, reply } => {
                let result = self.force_start_check(player_id);
                let ok = result.is_ok();
                let _ = reply.send(result);
                if ok {
                    self.enter_starting().await;
                }
            }
            MatchCommand::Submit {
                player_id,
                round_index,
                code,
                language,
                reply,
            } => {
                let result = self.state.accept_submission(
                    player_id,
                    round_index,
                    code,
                    language,
                    self.clock.now(),
                );
                let accepted = result.is_ok();
                let _ = reply.send(result);
                if accepted {
                    self.persist().await;
                    if self.state.all_active_submitted() {
                        // No point waiting out the deadline.
                        self.deadlines.cancel(TimerKind::RoundDeadline);
                        self.start_grading().await;
                    }
                }
            }
            MatchCommand::Spectate { player_id, reply } => {
                let result = self.state.add_spectator(player_id);
                if result.is_ok() {
                    self.hub
                        .bind(player_id, self.state.match_id(), RoomKind::Spectators);
                    self.persist().await;
                }
                let _ = reply.send(result);
            }
            MatchCommand::StopSpectating { player_id } => {
                if self.state.remove_spectator(player_id) {
                    self.hub.unbind(player_id, self.state.match_id());
                    self.persist().await;
                }
            }
            MatchCommand::GetState { reply } => {
                let _ = reply.send(self.state.snapshot(&self.clock));
            }
            MatchCommand::Disconnected { player_id } => {
                self.handle_disconnect(player_id).await;
            }
            MatchCommand::Reconnected { player_id } => {
                if self.state.is_ejected(player_id) {
                    // Back as a viewer only; the slot is gone.
                    self.state
                        .set_connected(player_id, true, self.clock.now());
                    self.persist().await;
                    return;
                }
                if self.state.is_player(player_id) && !self.state.status().is_terminal() {
                    self.deadlines.cancel(TimerKind::Grace(player_id));
                    self.state
                        .set_connected(player_id, true, self.clock.now());
                    if let Some(player) =
                        self.state.players().iter().find(|p| p.player_id == player_id)
                    {
                        self.broadcast(ServerEvent::PlayerJoined {
                            player: player.clone(),
                        });
                    }
                    // Everyone else was already ejected: the returning
                    // player wins by forfeit.
                    if self.state.status() == MatchStatus::InProgress
                        && self.state.active_humans().count() == 1
                    {
                        self.state.complete_forfeit(self.clock.now());
                        self.finish_terminal(EndReason::Forfeit).await;
                        return;
                    }
                    self.persist().await;
                }
            }
            MatchCommand::Shutdown => {
                self.cancel_match(CancelReason::Shutdown).await;
            }
        }
    }

    fn force_start_check(&self, player_id: PlayerId) -> Result<(), CommandError> {
        if self.state.owner != Some(player_id) {
            return Err(CommandError::unauthorized("only the owner can start"));
        }
        if self.state.status() != MatchStatus::Waiting {
            return Err(CommandError::wrong_state("match already started"));
        }
        if !self.state.has_min_players() {
            return Err(CommandError::wrong_state("not enough players"));
        }
        Ok(())
    }

    async fn handle_disconnect(&mut self, player_id: PlayerId) {
        if !self.state.is_player(player_id) || self.state.status().is_terminal() {
            return;
        }
        match self.state.status() {
            MatchStatus::Waiting => {
                // No slot retention before start; the seat frees up.
                if let Ok(outcome) = self.state.remove_player(player_id) {
                    self.hub.unbind(player_id, self.state.match_id());
                    self.broadcast(ServerEvent::PlayerLeft {
                        player_id,
                        reason: LeaveReason::Disconnected,
                    });
                    if let LeaveOutcome::Left {
                        was_owner,
                        now_empty,
                    } = outcome
                    {
                        if was_owner {
                            self.cancel_match(CancelReason::OwnerCancel).await;
                            return;
                        }
                        if now_empty {
                            self.cancel_match(CancelReason::PlayerDrop).await;
                            return;
                        }
                    }
                    self.persist().await;
                }
            }
            MatchStatus::Starting | MatchStatus::InProgress => {
                self.state
                    .set_connected(player_id, false, self.clock.now());
                self.broadcast(ServerEvent::PlayerLeft {
                    player_id,
                    reason: LeaveReason::Disconnected,
                });
                self.deadlines.arm(
                    TimerKind::Grace(player_id),
                    self.clock.now() + self.config.grace_disconnect,
                );
                self.persist().await;
            }
            MatchStatus::Completed | MatchStatus::Cancelled => {}
        }
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ConfirmWindow => {
                if self.state.status() == MatchStatus::Waiting {
                    // Confirmed players go back to the head of the queue.
                    self.requeue_on_exit = self
                        .state
                        .confirmed_players()
                        .into_iter()
                        .filter(|p| !p.is_bot)
                        .collect();
                    info!(
                        requeued = self.requeue_on_exit.len(),
                        "pairing not confirmed in time"
                    );
                    self.cancel_match(CancelReason::NoConfirm).await;
                }
            }
            TimerKind::AutoStart => {
                if self.state.status() == MatchStatus::Waiting && self.state.has_min_players() {
                    self.enter_starting().await;
                }
            }
            TimerKind::WaitingExpiry => {
                if self.state.status() == MatchStatus::Waiting {
                    self.cancel_match(CancelReason::WaitingTimeout).await;
                }
            }
            TimerKind::Countdown => {
                self.countdown_done = true;
                if let Some(problem) = self.pending_problem.take() {
                    self.open_round(problem).await;
                }
            }
            TimerKind::RoundDeadline => {
                if self
                    .state
                    .current_round()
                    .is_some_and(|r| r.status == RoundStatus::Open)
                {
                    self.start_grading().await;
                }
            }
            TimerKind::GradingDeadline => {
                self.apply_grading_fallback().await;
            }
            TimerKind::Grace(player_id) => {
                if self.state.status().is_terminal() {
                    return;
                }
                debug!(player = %player_id, "grace window expired");
                // The slot is lost but the room binding stays, so a late
                // reconnect can still fetch the final snapshot.
                self.state.eject(player_id);
                self.broadcast(ServerEvent::PlayerLeft {
                    player_id,
                    reason: LeaveReason::Forfeited,
                });
                self.after_ejection().await;
            }
            TimerKind::Retention => {
                self.done = true;
            }
        }
    }

    async fn enter_starting(&mut self) {
        if self.state.begin_starting().is_err() {
            return;
        }
        self.deadlines.cancel(TimerKind::ConfirmWindow);
        self.deadlines.cancel(TimerKind::AutoStart);
        self.deadlines.cancel(TimerKind::WaitingExpiry);
        self.countdown_done = false;
        self.deadlines
            .arm(TimerKind::Countdown, self.clock.now() + self.config.countdown);
        self.broadcast(ServerEvent::MatchStarting {
            countdown_ms: self.config.countdown.as_millis() as u64,
        });
        self.spawn_prefetch();
        self.persist().await;
    }

    fn spawn_prefetch(&mut self) {
        let problems = self.collab.problems.clone();
        let mode = self.state.config.mode;
        let round_index = self.state.cursor();
        self.prefetch =
            Some(async move { problems.next_problem(mode, round_index).await }.boxed());
    }

    async fn handle_problem(&mut self, result: anyhow::Result<Problem>) {
        match result {
            Ok(problem) => {
                self.problem_attempts = 0;
                match self.state.status() {
                    MatchStatus::Starting if !self.countdown_done => {
                        self.pending_problem = Some(problem);
                    }
                    MatchStatus::Starting | MatchStatus::InProgress => {
                        self.open_round(problem).await;
                    }
                    _ => {}
                }
            }
            Err(e) => {
                self.problem_attempts += 1;
                if self.problem_attempts < 3 {
                    warn!(attempt = self.problem_attempts, error = %e, "problem fetch failed, retrying");
                    self.spawn_prefetch();
                } else {
                    error!(error = %e, "problem source exhausted retries");
                    self.cancel_match(CancelReason::Internal).await;
                }
            }
        }
    }

    async fn open_round(&mut self, problem: Problem) {
        let (round_index, deadline) = self.state.open_round(problem.clone(), self.clock.now());
        self.deadlines.arm(TimerKind::RoundDeadline, deadline);
        let deadline_in_ms = deadline
            .saturating_duration_since(self.clock.now())
            .as_millis() as u64;
        info!(round_index, "round opened");
        self.broadcast(ServerEvent::RoundStart {
            round_index,
            problem,
            deadline_in_ms,
        });
        self.persist().await;
    }

    async fn start_grading(&mut self) {
        let submissions = self.state.begin_grading();
        self.deadlines.cancel(TimerKind::RoundDeadline);
        if submissions.is_empty() {
            // Nothing to grade; everyone scores zero.
            self.close_round().await;
            return;
        }

        let deadline = self.clock.now() + self.config.grading_budget;
        self.deadlines.arm(TimerKind::GradingDeadline, deadline);

        let problem = self
            .state
            .current_round()
            .map(|r| r.problem.clone())
            .expect("grading without a round");
        let cap = self
            .config
            .grading_concurrency
            .unwrap_or(submissions.len())
            .max(1);
        debug!(submissions = submissions.len(), cap, "grading started");
        for submission in submissions {
            let request = GradeRequest {
                submission,
                problem: problem.clone(),
                deadline,
            };
            if self.grading.len() < cap {
                self.spawn_grade(request);
            } else {
                self.grading_queue.push_back(request);
            }
        }
        self.persist().await;
    }

    fn spawn_grade(&mut self, request: GradeRequest) {
        let grader = self.collab.grader.clone();
        let clock = self.clock;
        let submission_id = request.submission.submission_id;
        let deadline = request.deadline;
        self.grading.push(
            async move {
                let result = match clock.timeout_at(deadline, grader.grade(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(GradeError::Timeout { tests: None }),
                };
                (submission_id, result)
            }
            .boxed(),
        );
    }

    async fn handle_grade_outcome(
        &mut self,
        submission_id: SubmissionId,
        result: Result<GradeReport, GradeError>,
    ) {
        if !self
            .state
            .current_round()
            .is_some_and(|r| r.status == RoundStatus::Grading)
        {
            return;
        }
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!(%submission_id, error = %e, "grade failed, using fallback");
                fallback_report(
                    submission_id,
                    &self.state.config.weights,
                    e.tests(),
                    e.verdict(),
                )
            }
        };
        let all_graded = self.state.record_grade(report);
        if let Some(request) = self.grading_queue.pop_front() {
            self.spawn_grade(request);
        }
        if all_graded {
            self.close_round().await;
        } else {
            self.persist().await;
        }
    }

    /// The grading deadline passed: every still-ungraded submission gets
    /// the heuristic fallback so the round can close.
    async fn apply_grading_fallback(&mut self) {
        self.grading = FuturesUnordered::new();
        self.grading_queue.clear();
        for submission_id in self.state.ungraded_submissions() {
            let report = fallback_report(
                submission_id,
                &self.state.config.weights,
                None,
                crate::grader::Verdict::Timeout,
            );
            self.state.record_grade(report);
        }
        self.close_round().await;
    }

    async fn close_round(&mut self) {
        self.deadlines.cancel(TimerKind::GradingDeadline);
        self.grading = FuturesUnordered::new();
        self.grading_queue.clear();

        let close = self.state.close_round();
        info!(round_index = close.round_index, degraded = close.grading_degraded, "round closed");
        self.broadcast(ServerEvent::RoundResult {
            round_index: close.round_index,
            per_player: close.per_player,
            totals: close.totals,
            grading_degraded: close.grading_degraded,
        });

        match self.state.advance(self.clock.now()) {
            Advanced::NextRound => {
                self.spawn_prefetch();
                self.persist().await;
            }
            Advanced::Completed => {
                self.finish_terminal(EndReason::Completed).await;
            }
        }
    }

    async fn after_ejection(&mut self) {
        if self.state.status().is_terminal() {
            return;
        }
        let remaining = self.state.active_humans().count();
        if remaining == 0 {
            self.cancel_match(CancelReason::PlayerDrop).await;
            return;
        }
        if remaining == 1 {
            match self.state.status() {
                // No round was ever played; nothing to win by forfeit.
                MatchStatus::Starting => {
                    self.cancel_match(CancelReason::PlayerDrop).await;
                    return;
                }
                MatchStatus::InProgress => {
                    let last_connected = self
                        .state
                        .active_humans()
                        .next()
                        .is_some_and(|p| p.connected);
                    if last_connected {
                        self.state.complete_forfeit(self.clock.now());
                        self.finish_terminal(EndReason::Forfeit).await;
                    } else {
                        // The survivor is inside their own grace window;
                        // their reconnect wins, their expiry cancels.
                        self.persist().await;
                    }
                    return;
                }
                _ => {}
            }
        }
        // Enough players remain: the missing one scores zero from here on.
        if self
            .state
            .current_round()
            .is_some_and(|r| r.status == RoundStatus::Open)
            && self.state.all_active_submitted()
        {
            self.deadlines.cancel(TimerKind::RoundDeadline);
            self.start_grading().await;
        } else {
            self.persist().await;
        }
    }

    async fn finish_terminal(&mut self, reason: EndReason) {
        self.deadlines.clear();
        self.grading = FuturesUnordered::new();
        self.grading_queue.clear();
        self.prefetch = None;

        let standings = self.state.standings();
        info!(?reason, "match ended");
        self.broadcast(ServerEvent::MatchEnd { standings, reason });
        self.persist().await;

        let record = MatchRecord::from_state(&self.state);
        if let Err(e) = self.collab.store.record_match_result(&record).await {
            error!(error = %e, "failed to persist final match record");
        }

        // Late reconnects can still fetch the final snapshot for a while.
        self.deadlines
            .arm(TimerKind::Retention, self.clock.now() + self.config.retention);
    }

    async fn cancel_match(&mut self, reason: CancelReason) {
        self.pending_cancel = None;
        if self.state.status().is_terminal() {
            self.done = true;
            return;
        }
        warn!(reason = reason.as_str(), "match cancelled");
        self.state.cancel(reason, self.clock.now());
        self.deadlines.clear();
        self.grading = FuturesUnordered::new();
        self.grading_queue.clear();
        self.prefetch = None;

        self.broadcast(ServerEvent::MatchEnd {
            standings: self.state.standings(),
            reason: EndReason::Cancelled,
        });
        self.persist().await;

        let record = MatchRecord::from_state(&self.state);
        if let Err(e) = self.collab.store.record_match_result(&record).await {
            error!(error = %e, "failed to persist cancelled match record");
        }

        match reason {
            CancelReason::PlayerDrop
            | CancelReason::StoreUnavailable
            | CancelReason::OwnershipLost
            | CancelReason::Internal => {
                self.deadlines
                    .arm(TimerKind::Retention, self.clock.now() + self.config.retention);
            }
            CancelReason::WaitingTimeout
            | CancelReason::NoConfirm
            | CancelReason::OwnerCancel
            | CancelReason::Shutdown => {
                self.done = true;
            }
        }
    }

    fn broadcast(&self, event: ServerEvent) {
        self.hub
            .broadcast(self.state.match_id(), self.state.version(), event);
    }

    async fn claim_ownership(&mut self) {
        let key = match_owner_key(self.state.match_id());
        let value = serde_json::json!(self.instance_id);
        let store = self.collab.state_store.clone();
        let result = retry_with_backoff(&self.clock, &self.config.store_retry, "claim_owner", || {
            let store = store.clone();
            let key = key.clone();
            let value = value.clone();
            async move { store.cas_set(&key, 0, value).await }
        })
        .await;
        match result {
            Ok(_) => {}
            Err(StateStoreError::Conflict { .. }) => {
                warn!("match already owned by another instance");
                self.lost_ownership = true;
                self.pending_cancel = Some(CancelReason::OwnershipLost);
            }
            Err(e) => {
                error!(error = %e, "could not record match ownership");
                self.store_dead = true;
                self.pending_cancel = Some(CancelReason::StoreUnavailable);
            }
        }
    }

    /// Writes the current snapshot CAS-guarded by the last persisted
    /// version. A conflict means another instance owns the match now.
    async fn persist(&mut self) {
        if self.lost_ownership || self.store_dead {
            return;
        }
        let snapshot = self.state.snapshot(&self.clock);
        let value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "snapshot serialization failed");
                return;
            }
        };
        let key = match_key(self.state.match_id());
        let expected = self.persisted_version;
        let store = self.collab.state_store.clone();
        let result = retry_with_backoff(&self.clock, &self.config.store_retry, "persist", || {
            let store = store.clone();
            let key = key.clone();
            let value = value.clone();
            async move { store.cas_set(&key, expected, value).await }
        })
        .await;
        match result {
            Ok(version) => {
                self.persisted_version = version;
            }
            Err(StateStoreError::Conflict { found, .. }) => {
                warn!(found, "snapshot version conflict; assuming ownership moved");
                self.lost_ownership = true;
                self.pending_cancel = Some(CancelReason::OwnershipLost);
            }
            Err(e) => {
                error!(error = %e, "state store unreachable past retry budget");
                self.store_dead = true;
                self.pending_cancel = Some(CancelReason::StoreUnavailable);
            }
        }
    }

    async fn finish(&mut self) {
        let match_id = self.state.match_id();
        let store = self.collab.state_store.clone();
        let _ = store.del(&match_owner_key(match_id)).await;
        let _ = store.del(&lobby_key(match_id)).await;
        let _ = store.del(&match_key(match_id)).await;
        self.hub.drop_room(match_id);
        let _ = self.exits.send(RuntimeExit {
            match_id,
            requeue: std::mem::take(&mut self.requeue_on_exit),
        });
        debug!("match runtime finished");
    }
}
