//! The match aggregate and its state machine.
//!
//! Everything in this module is pure state manipulation: transitions are
//! methods returning [`CommandError`] on rejected input, and every
//! successful mutation bumps the aggregate's `version`. Time enters only
//! as caller-supplied instants; scheduling, persistence and event
//! emission live in the match runtime, which exclusively owns one
//! [`MatchState`] per match.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::{CoreConfig, CustomConfig, ScoreWeights};
use crate::error::{CommandError, ErrorCode};
use crate::grader::GradeReport;
use crate::player::{MatchId, MatchMode, Player, PlayerId, SubmissionId};

/// Lifecycle of a match; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Gathering players.
    Waiting,
    /// Fixed countdown before the first round; joins are rejected.
    Starting,
    /// Rounds are being played.
    InProgress,
    /// All rounds closed, or won by forfeit.
    Completed,
    /// Terminated before completion.
    Cancelled,
}

impl MatchStatus {
    /// Whether the match can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStatus::Completed | MatchStatus::Cancelled)
    }
}

/// Lifecycle of one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// Created but not yet announced.
    Pending,
    /// Accepting submissions until the deadline.
    Open,
    /// Submissions dispatched to the grader.
    Grading,
    /// Scores computed; the cursor may advance.
    Closed,
}

/// Why a match reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Every round was played.
    Completed,
    /// Opponent(s) left or timed out of the grace window.
    Forfeit,
    /// Terminated before completion.
    Cancelled,
}

/// Specific cause of a cancellation, kept for the terminal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The lobby never became ready.
    WaitingTimeout,
    /// A matchmade pairing was not confirmed in time.
    NoConfirm,
    /// The lobby owner cancelled before start.
    OwnerCancel,
    /// Every player dropped past the grace window.
    PlayerDrop,
    /// The state store stayed unreachable past the retry budget.
    StoreUnavailable,
    /// Another instance took ownership of the match.
    OwnershipLost,
    /// An invariant was violated; the match was abandoned.
    Internal,
    /// The process is shutting down.
    Shutdown,
}

impl CancelReason {
    /// Stable lowercase name used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::WaitingTimeout => "waiting_timeout",
            CancelReason::NoConfirm => "no_confirm",
            CancelReason::OwnerCancel => "owner_cancel",
            CancelReason::PlayerDrop => "player_drop",
            CancelReason::StoreUnavailable => "store_unavailable",
            CancelReason::OwnershipLost => "ownership_lost",
            CancelReason::Internal => "internal",
            CancelReason::Shutdown => "shutdown",
        }
    }
}

/// A problem served for one round. Opaque to the core beyond its id and
/// time limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    /// Stable identifier.
    pub problem_id: String,
    /// Short title.
    pub title: String,
    /// Full statement shown to players.
    pub prompt: String,
    /// Time limit this problem was authored for.
    pub time_limit: Duration,
}

/// An accepted code submission. Immutable; a later submission from the
/// same player in the same round replaces it wholesale.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Unique id, also the grading idempotency key.
    pub submission_id: SubmissionId,
    /// Match this submission belongs to.
    pub match_id: MatchId,
    /// Round it answers.
    pub round_index: u32,
    /// Author.
    pub player_id: PlayerId,
    /// Source code.
    pub code: String,
    /// Language tag, validated against the whitelist.
    pub language: String,
    /// When the submission was accepted.
    pub submitted_at: Instant,
}

/// Resolved configuration of one match.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Mode tag.
    pub mode: MatchMode,
    /// Rounds played to completion.
    pub round_count: u32,
    /// Per-round time limit.
    pub round_time_limit: Duration,
    /// Minimum players required to start.
    pub min_players: u32,
    /// Maximum players admitted.
    pub max_players: u32,
    /// Hidden, invite-only lobby.
    pub is_private: bool,
    /// Standings feed the rating system.
    pub is_ranked: bool,
    /// Accepted submission languages.
    pub language_whitelist: Vec<String>,
    /// Allow-list for joining or spectating a private lobby.
    pub invited: Vec<PlayerId>,
    /// Scoring curve.
    pub weights: ScoreWeights,
    /// Maximum accepted submission size in bytes.
    pub max_code_len: usize,
}

impl MatchConfig {
    /// Configuration for a matchmade match of the given mode.
    pub fn for_mode(mode: MatchMode, core: &CoreConfig) -> Self {
        let rules = core.mode_rules(mode);
        Self {
            mode,
            round_count: rules.round_count,
            round_time_limit: rules.round_time_limit,
            min_players: rules.min_players,
            max_players: rules.max_players,
            is_private: false,
            is_ranked: rules.is_ranked,
            language_whitelist: core.language_whitelist.clone(),
            invited: Vec::new(),
            weights: rules.weights,
            max_code_len: core.max_code_len,
        }
    }

    /// Configuration for an owner-created custom lobby.
    pub fn custom(custom: &CustomConfig, core: &CoreConfig) -> Self {
        let mut config = Self::for_mode(MatchMode::Custom, core);
        if let Some(rounds) = custom.round_count {
            config.round_count = rounds.max(1);
        }
        if let Some(secs) = custom.round_time_limit_s {
            config.round_time_limit = Duration::from_secs(secs.max(10));
        }
        if let Some(max) = custom.max_players {
            config.max_players = max.clamp(config.min_players, 16);
        }
        config.is_private = custom.is_private;
        config.invited = custom.invited.clone();
        if !custom.language_whitelist.is_empty() {
            config.language_whitelist = custom
                .language_whitelist
                .iter()
                .filter(|l| core.language_whitelist.contains(l))
                .cloned()
                .collect();
            if config.language_whitelist.is_empty() {
                config.language_whitelist = core.language_whitelist.clone();
            }
        }
        config
    }
}

/// One problem within a match, with its own deadline and grading pass.
#[derive(Debug)]
pub struct Round {
    /// Zero-based index.
    pub round_index: u32,
    /// Problem played this round.
    pub problem: Problem,
    /// When the round opened.
    pub started_at: Option<Instant>,
    /// Absolute submission deadline.
    pub deadline_at: Option<Instant>,
    /// Lifecycle state.
    pub status: RoundStatus,
    /// Retained submissions, one per player.
    pub submissions: HashMap<PlayerId, Submission>,
    /// Grade reports keyed by submission.
    pub grades: HashMap<SubmissionId, GradeReport>,
    /// Final per-player scores for this round.
    pub scores: BTreeMap<PlayerId, i64>,
}

/// Final placement of one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    /// 1-based rank; ties share the better rank.
    pub rank: u32,
    /// Player placed here.
    pub player_id: PlayerId,
    /// Display name at match end.
    pub display_name: String,
    /// Sum of round scores.
    pub total: i64,
}

/// Per-player slice of a closed round, carried by `round_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRoundResult {
    /// Points scored this round.
    pub score: i64,
    /// Grade report behind the score; absent when nothing was submitted.
    pub report: Option<GradeReport>,
}

/// Everything `round_result` needs, computed at round close.
#[derive(Debug, Clone)]
pub struct RoundClose {
    /// Which round closed.
    pub round_index: u32,
    /// Per-player scores and reports.
    pub per_player: BTreeMap<PlayerId, PlayerRoundResult>,
    /// Running totals after this round.
    pub totals: BTreeMap<PlayerId, i64>,
    /// Whether any score came from the fallback path.
    pub grading_degraded: bool,
}

/// What advancing the cursor after a closed round yielded.
#[derive(Debug)]
pub enum Advanced {
    /// Another round follows.
    NextRound,
    /// That was the last round; the match completed.
    Completed,
}

/// Outcome of removing a player.
#[derive(Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Removed from a `waiting` lobby.
    Left {
        /// The leaver owned the lobby.
        was_owner: bool,
        /// No players remain.
        now_empty: bool,
    },
    /// The match had started; the slot is forfeited.
    Forfeited,
}

/// Snapshot of one open or grading round for transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSnapshot {
    /// Zero-based index.
    pub round_index: u32,
    /// The problem being played.
    pub problem: Problem,
    /// Round lifecycle state.
    pub status: RoundStatus,
    /// Milliseconds until the submission deadline, when open.
    pub deadline_in_ms: Option<u64>,
    /// Players whose submission is retained.
    pub submitted: Vec<PlayerId>,
}

/// Immutable, versioned copy of match state suitable for transport and
/// recovery; what `resync` and the state store carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSnapshot {
    /// Match identity.
    pub match_id: MatchId,
    /// Mode tag.
    pub mode: MatchMode,
    /// Lifecycle state.
    pub status: MatchStatus,
    /// Index of the round in progress.
    pub cursor: u32,
    /// Total rounds configured.
    pub round_count: u32,
    /// Snapshot version; strictly increasing per match.
    pub version: u64,
    /// Current participants.
    pub players: Vec<Player>,
    /// Current spectators.
    pub spectators: Vec<PlayerId>,
    /// Running totals.
    pub totals: BTreeMap<PlayerId, i64>,
    /// The round in flight, when one is open or grading.
    pub round: Option<RoundSnapshot>,
    /// Final placements, once terminal.
    pub standings: Option<Vec<Standing>>,
    /// Why the match ended, once terminal.
    pub end_reason: Option<EndReason>,
}

/// The central aggregate: one arena session with a fixed set of players
/// and rounds. Exclusively owned by its match runtime.
#[derive(Debug)]
pub struct MatchState {
    pub(crate) match_id: MatchId,
    pub(crate) config: MatchConfig,
    pub(crate) owner: Option<PlayerId>,
    pub(crate) players: Vec<Player>,
    pub(crate) spectators: Vec<PlayerId>,
    pub(crate) ready: HashSet<PlayerId>,
    pub(crate) ejected: HashSet<PlayerId>,
    pub(crate) rounds: Vec<Round>,
    pub(crate) cursor: u32,
    pub(crate) status: MatchStatus,
    pub(crate) version: u64,
    pub(crate) created_at: Instant,
    pub(crate) started_at: Option<Instant>,
    pub(crate) ended_at: Option<Instant>,
    pub(crate) totals: BTreeMap<PlayerId, i64>,
    pub(crate) earliest_submission: BTreeMap<PlayerId, Instant>,
    pub(crate) end_reason: Option<EndReason>,
    pub(crate) cancel_reason: Option<CancelReason>,
}

impl MatchState {
    /// Creates a match in `waiting` with no players.
    pub fn new(match_id: MatchId, config: MatchConfig, owner: Option<PlayerId>, now: Instant) -> Self {
        Self {
            match_id,
            config,
            owner,
            players: Vec::new(),
            spectators: Vec::new(),
            ready: HashSet::new(),
            ejected: HashSet::new(),
            rounds: Vec::new(),
            cursor: 0,
            status: MatchStatus::Waiting,
            version: 1,
            created_at: now,
            started_at: None,
            ended_at: None,
            totals: BTreeMap::new(),
            earliest_submission: BTreeMap::new(),
            end_reason: None,
            cancel_reason: None,
        }
    }

    /// Match identity.
    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    /// Current lifecycle state.
    pub fn status(&self) -> MatchStatus {
        self.status
    }

    /// Current snapshot version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Index of the round in progress.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Current participants.
    pub fn players(&self) -> &[Player] {
        &self.players
    }

    /// Why the match was cancelled, if it was.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    fn player(&self, player_id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.player_id == player_id)
    }

    fn player_mut(&mut self, player_id: PlayerId) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.player_id == player_id)
    }

    /// Whether `player_id` holds a player slot.
    pub fn is_player(&self, player_id: PlayerId) -> bool {
        self.player(player_id).is_some()
    }

    /// Whether `player_id` is in the spectator room.
    pub fn is_spectator(&self, player_id: PlayerId) -> bool {
        self.spectators.contains(&player_id)
    }

    /// Whether `player_id` lost their slot mid-match.
    pub fn is_ejected(&self, player_id: PlayerId) -> bool {
        self.ejected.contains(&player_id)
    }

    /// Players still holding a live slot: not ejected, not synthetic.
    pub fn active_humans(&self) -> impl Iterator<Item = &Player> {
        self.players
            .iter()
            .filter(|p| !p.is_bot && !self.ejected.contains(&p.player_id))
    }

    /// Admits a player into a `waiting` lobby.
    pub fn add_player(&mut self, player: Player) -> Result<(), CommandError> {
        if self.status != MatchStatus::Waiting {
            return Err(CommandError::wrong_state("match is no longer accepting players"));
        }
        if self.is_player(player.player_id) {
            return Err(CommandError::wrong_state("already joined"));
        }
        if self.players.len() as u32 >= self.config.max_players {
            return Err(CommandError::new(ErrorCode::Full, "match is full"));
        }
        if self.config.is_private
            && Some(player.player_id) != self.owner
            && !self.config.invited.contains(&player.player_id)
        {
            return Err(CommandError::new(
                ErrorCode::PrivateDenied,
                "private lobby: invite required",
            ));
        }
        self.players.push(player);
        self.bump();
        Ok(())
    }

    /// Admits a spectator; private lobbies require an invite.
    pub fn add_spectator(&mut self, player_id: PlayerId) -> Result<(), CommandError> {
        if self.is_player(player_id) {
            return Err(CommandError::wrong_state("players cannot spectate their own match"));
        }
        if self.spectators.contains(&player_id) {
            return Ok(());
        }
        if self.config.is_private
            && Some(player_id) != self.owner
            && !self.config.invited.contains(&player_id)
        {
            return Err(CommandError::new(
                ErrorCode::PrivateDenied,
                "private lobby: invite required to spectate",
            ));
        }
        self.spectators.push(player_id);
        self.bump();
        Ok(())
    }

    /// Removes a spectator; `true` if they were present.
    pub fn remove_spectator(&mut self, player_id: PlayerId) -> bool {
        let before = self.spectators.len();
        self.spectators.retain(|p| *p != player_id);
        let removed = self.spectators.len() != before;
        if removed {
            self.bump();
        }
        removed
    }

    /// Removes a player: a plain leave before start, a forfeit after.
    pub fn remove_player(&mut self, player_id: PlayerId) -> Result<LeaveOutcome, CommandError> {
        if !self.is_player(player_id) {
            return Err(CommandError::unauthorized("not a participant"));
        }
        match self.status {
            MatchStatus::Waiting => {
                self.players.retain(|p| p.player_id != player_id);
                self.ready.remove(&player_id);
                self.bump();
                Ok(LeaveOutcome::Left {
                    was_owner: self.owner == Some(player_id),
                    now_empty: self.players.iter().all(|p| p.is_bot),
                })
            }
            MatchStatus::Starting | MatchStatus::InProgress => {
                self.eject(player_id);
                Ok(LeaveOutcome::Forfeited)
            }
            MatchStatus::Completed | MatchStatus::Cancelled => {
                Err(CommandError::wrong_state("match already ended"))
            }
        }
    }

    /// Marks a player ready; returns whether the ready condition now holds.
    pub fn mark_ready(&mut self, player_id: PlayerId) -> Result<bool, CommandError> {
        if self.status != MatchStatus::Waiting {
            return Err(CommandError::wrong_state("match is not waiting for ready"));
        }
        if !self.is_player(player_id) {
            return Err(CommandError::unauthorized("not a participant"));
        }
        if self.ready.insert(player_id) {
            self.bump();
        }
        Ok(self.ready_condition())
    }

    /// Whether enough players are present and everyone human is ready.
    pub fn ready_condition(&self) -> bool {
        self.has_min_players()
            && self
                .players
                .iter()
                .filter(|p| !p.is_bot)
                .all(|p| self.ready.contains(&p.player_id))
    }

    /// Whether the minimum player count is reached.
    pub fn has_min_players(&self) -> bool {
        self.players.len() as u32 >= self.config.min_players
    }

    /// Players who confirmed the pairing so far.
    pub fn confirmed_players(&self) -> Vec<Player> {
        self.players
            .iter()
            .filter(|p| self.ready.contains(&p.player_id))
            .cloned()
            .collect()
    }

    /// Enters the pre-round countdown.
    pub fn begin_starting(&mut self) -> Result<(), CommandError> {
        if self.status != MatchStatus::Waiting {
            return Err(CommandError::wrong_state("match is not waiting"));
        }
        self.status = MatchStatus::Starting;
        self.bump();
        Ok(())
    }

    /// Opens the next round with the given problem. The first open also
    /// moves the match to `in_progress`.
    pub fn open_round(&mut self, problem: Problem, now: Instant) -> (u32, Instant) {
        debug_assert!(matches!(
            self.status,
            MatchStatus::Starting | MatchStatus::InProgress
        ));
        if self.status == MatchStatus::Starting {
            self.status = MatchStatus::InProgress;
            self.started_at = Some(now);
        }
        let deadline = now + self.config.round_time_limit;
        let round_index = self.cursor;
        self.rounds.push(Round {
            round_index,
            problem,
            started_at: Some(now),
            deadline_at: Some(deadline),
            status: RoundStatus::Open,
            submissions: HashMap::new(),
            grades: HashMap::new(),
            scores: BTreeMap::new(),
        });
        self.bump();
        (round_index, deadline)
    }

    /// The round the cursor points at, if it has been opened.
    pub fn current_round(&self) -> Option<&Round> {
        self.rounds.get(self.cursor as usize)
    }

    fn current_round_mut(&mut self) -> Option<&mut Round> {
        self.rounds.get_mut(self.cursor as usize)
    }

    /// Validates and retains a submission for the current round,
    /// replacing any earlier one from the same player.
    pub fn accept_submission(
        &mut self,
        player_id: PlayerId,
        round_index: u32,
        code: String,
        language: String,
        now: Instant,
    ) -> Result<SubmissionId, CommandError> {
        if self.status != MatchStatus::InProgress {
            return Err(CommandError::invalid_submission("match is not in progress"));
        }
        if !self.is_player(player_id) || self.ejected.contains(&player_id) {
            return Err(CommandError::unauthorized("not an active participant"));
        }
        let whitelist_ok = self
            .config
            .language_whitelist
            .iter()
            .any(|l| l.eq_ignore_ascii_case(&language));
        if !whitelist_ok {
            return Err(CommandError::invalid_submission(format!(
                "language {language:?} is not allowed"
            )));
        }
        if code.is_empty() {
            return Err(CommandError::invalid_submission("empty submission"));
        }
        if code.len() > self.config.max_code_len {
            return Err(CommandError::invalid_submission("submission too large"));
        }
        if code
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
        {
            return Err(CommandError::invalid_submission(
                "submission contains control characters",
            ));
        }
        let match_id = self.match_id;
        let round = self
            .current_round_mut()
            .ok_or_else(|| CommandError::invalid_submission("no round open"))?;
        if round.round_index != round_index {
            return Err(CommandError::invalid_submission("round index mismatch"));
        }
        if round.status != RoundStatus::Open {
            return Err(CommandError::invalid_submission("round is not open"));
        }
        if round.deadline_at.is_some_and(|d| now > d) {
            return Err(CommandError::invalid_submission("round deadline passed"));
        }

        let submission = Submission {
            submission_id: SubmissionId::new(),
            match_id,
            round_index,
            player_id,
            code,
            language,
            submitted_at: now,
        };
        let id = submission.submission_id;
        round.submissions.insert(player_id, submission);
        self.earliest_submission.entry(player_id).or_insert(now);
        self.bump();
        Ok(id)
    }

    /// Whether every active human player has a retained submission in the
    /// current round.
    pub fn all_active_submitted(&self) -> bool {
        let Some(round) = self.current_round() else {
            return false;
        };
        let mut any = false;
        for player in self.active_humans() {
            any = true;
            if !round.submissions.contains_key(&player.player_id) {
                return false;
            }
        }
        any
    }

    /// Moves the current round to `grading` and returns the retained
    /// submissions to dispatch.
    pub fn begin_grading(&mut self) -> Vec<Submission> {
        let Some(round) = self.current_round_mut() else {
            return Vec::new();
        };
        if round.status != RoundStatus::Open {
            return Vec::new();
        }
        round.status = RoundStatus::Grading;
        let submissions = round.submissions.values().cloned().collect();
        self.bump();
        submissions
    }

    /// Records a grade; returns `true` once every retained submission of
    /// the current round is graded.
    pub fn record_grade(&mut self, report: GradeReport) -> bool {
        let Some(round) = self.current_round_mut() else {
            return false;
        };
        let known = round
            .submissions
            .values()
            .any(|s| s.submission_id == report.submission_id);
        if known && round.status == RoundStatus::Grading {
            round.grades.insert(report.submission_id, report);
            self.bump();
        }
        self.all_graded()
    }

    /// Whether every retained submission of the current round is graded.
    pub fn all_graded(&self) -> bool {
        let Some(round) = self.current_round() else {
            return false;
        };
        round
            .submissions
            .values()
            .all(|s| round.grades.contains_key(&s.submission_id))
    }

    /// Submissions of the current round still waiting for a grade.
    pub fn ungraded_submissions(&self) -> Vec<SubmissionId> {
        let Some(round) = self.current_round() else {
            return Vec::new();
        };
        round
            .submissions
            .values()
            .filter(|s| !round.grades.contains_key(&s.submission_id))
            .map(|s| s.submission_id)
            .collect()
    }

    /// Closes the current round: computes per-player scores and updates
    /// running totals.
    pub fn close_round(&mut self) -> RoundClose {
        let cursor = self.cursor;
        let player_ids: Vec<PlayerId> = self.players.iter().map(|p| p.player_id).collect();
        let mut per_player = BTreeMap::new();
        let mut degraded = false;

        if let Some(round) = self.current_round_mut() {
            round.status = RoundStatus::Closed;
            for player_id in player_ids {
                let report = round
                    .submissions
                    .get(&player_id)
                    .and_then(|s| round.grades.get(&s.submission_id))
                    .cloned();
                let score = report.as_ref().map(|r| r.score_total as i64).unwrap_or(0);
                degraded |= report.as_ref().is_some_and(|r| r.degraded);
                round.scores.insert(player_id, score);
                per_player.insert(player_id, PlayerRoundResult { score, report });
            }
        }
        for (player_id, result) in &per_player {
            *self.totals.entry(*player_id).or_insert(0) += result.score;
        }
        self.bump();
        RoundClose {
            round_index: cursor,
            per_player,
            totals: self.totals.clone(),
            grading_degraded: degraded,
        }
    }

    /// Advances the cursor past a closed round; completes the match after
    /// the last one.
    pub fn advance(&mut self, now: Instant) -> Advanced {
        self.cursor += 1;
        self.bump();
        if self.cursor >= self.config.round_count {
            self.status = MatchStatus::Completed;
            self.end_reason = Some(EndReason::Completed);
            self.ended_at = Some(now);
            Advanced::Completed
        } else {
            Advanced::NextRound
        }
    }

    /// Strips a player of their slot mid-match; they score zero for
    /// subsequent rounds. Returns the number of active humans left.
    pub fn eject(&mut self, player_id: PlayerId) -> usize {
        if self.ejected.insert(player_id) {
            self.bump();
        }
        self.active_humans().count()
    }

    /// Completes the match by forfeit in favor of the remaining players.
    pub fn complete_forfeit(&mut self, now: Instant) {
        if self.status.is_terminal() {
            return;
        }
        self.status = MatchStatus::Completed;
        self.end_reason = Some(EndReason::Forfeit);
        self.ended_at = Some(now);
        self.bump();
    }

    /// Cancels the match from any pre-terminal state.
    pub fn cancel(&mut self, reason: CancelReason, now: Instant) {
        if self.status.is_terminal() {
            return;
        }
        self.status = MatchStatus::Cancelled;
        self.end_reason = Some(EndReason::Cancelled);
        self.cancel_reason = Some(reason);
        self.ended_at = Some(now);
        self.bump();
    }

    /// Flags a player's connection state.
    pub fn set_connected(&mut self, player_id: PlayerId, connected: bool, now: Instant) {
        if let Some(player) = self.player_mut(player_id) {
            player.connected = connected;
            player.last_seen_at = Some(now);
            self.bump();
        }
    }

    /// Final placements: total descending, then earliest retained
    /// submission, then id for determinism. One entry per player.
    pub fn standings(&self) -> Vec<Standing> {
        let mut rows: Vec<(&Player, i64, Option<Instant>)> = self
            .players
            .iter()
            .map(|p| {
                (
                    p,
                    self.totals.get(&p.player_id).copied().unwrap_or(0),
                    self.earliest_submission.get(&p.player_id).copied(),
                )
            })
            .collect();
        rows.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| match (a.2, b.2) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.0.player_id.cmp(&b.0.player_id))
        });

        let mut standings = Vec::with_capacity(rows.len());
        let mut last_total: Option<i64> = None;
        let mut rank = 0;
        for (i, (player, total, _)) in rows.into_iter().enumerate() {
            if last_total != Some(total) {
                rank = i as u32 + 1;
                last_total = Some(total);
            }
            standings.push(Standing {
                rank,
                player_id: player.player_id,
                display_name: player.display_name.clone(),
                total,
            });
        }
        standings
    }

    /// Builds the transport snapshot of the current state.
    pub fn snapshot(&self, clock: &Clock) -> MatchSnapshot {
        let now = clock.now();
        let round = self.current_round().map(|r| RoundSnapshot {
            round_index: r.round_index,
            problem: r.problem.clone(),
            status: r.status,
            deadline_in_ms: r
                .deadline_at
                .filter(|_| r.status == RoundStatus::Open)
                .map(|d| d.saturating_duration_since(now).as_millis() as u64),
            submitted: r.submissions.keys().copied().collect(),
        });
        MatchSnapshot {
            match_id: self.match_id,
            mode: self.config.mode,
            status: self.status,
            cursor: self.cursor,
            round_count: self.config.round_count,
            version: self.version,
            players: self.players.clone(),
            spectators: self.spectators.clone(),
            totals: self.totals.clone(),
            round,
            standings: self.status.is_terminal().then(|| self.standings()),
            end_reason: self.end_reason,
        }
    }
}
