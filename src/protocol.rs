//! Wire protocol: the closed sets of client commands and server events.
//!
//! Both directions are serde enums tagged by `type` in snake_case; an
//! unknown variant fails deserialization and is reported to the sender as
//! a validation error rather than silently accepted. Any message-framed
//! bidirectional transport can carry these.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::CustomConfig;
use crate::error::{CommandError, ErrorCode};
use crate::match_state::{EndReason, MatchSnapshot, PlayerRoundResult, Problem, Standing};
use crate::player::{MatchId, MatchMode, Player, PlayerId, SubmissionId};

/// Matchmaking preferences sent with `find_match`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchPreferences {
    /// Languages the player wants to compete in; the match whitelist is
    /// narrowed to the intersection of all paired players' preferences
    /// when it is non-empty.
    #[serde(default)]
    pub languages: Vec<String>,
}

/// Client → server events; validated by the session hub and delivered as
/// mailbox commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Enqueue for matchmaking.
    FindMatch {
        /// Desired mode; must be a queued mode.
        mode: MatchMode,
        /// Optional preferences.
        #[serde(default)]
        preferences: MatchPreferences,
    },
    /// Cancel a pending matchmaking ticket.
    CancelMatchmaking {},
    /// Create a custom lobby owned by the caller.
    CreateCustom {
        /// Lobby configuration.
        #[serde(default)]
        config: CustomConfig,
    },
    /// Join a match as a player.
    JoinGame {
        /// Target match.
        match_id: MatchId,
    },
    /// Leave pre-start; forfeit post-start.
    LeaveGame {
        /// Target match.
        match_id: MatchId,
    },
    /// Confirm readiness (doubles as pairing confirmation).
    Ready {
        /// Target match.
        match_id: MatchId,
    },
    /// Owner-only forced start of a custom lobby.
    StartGame {
        /// Target match.
        match_id: MatchId,
    },
    /// Submit a solution for the current round.
    SubmitSolution {
        /// Target match.
        match_id: MatchId,
        /// Round the code answers; must equal the cursor.
        round_index: u32,
        /// Source code.
        code: String,
        /// Language tag.
        language: String,
    },
    /// Join the spectator room.
    SpectateGame {
        /// Target match.
        match_id: MatchId,
    },
    /// Leave the spectator room.
    StopSpectating {
        /// Target match.
        match_id: MatchId,
    },
    /// Request a state snapshot (used on resync).
    GetGameState {
        /// Target match.
        match_id: MatchId,
    },
    /// Broadcast a chat line to the match room.
    SendChatMessage {
        /// Target match.
        match_id: MatchId,
        /// Message body.
        text: String,
    },
    /// Broadcast a typing indicator to the match room.
    UserTyping {
        /// Target match.
        match_id: MatchId,
        /// Whether the player is currently typing.
        is_typing: bool,
    },
}

impl ClientCommand {
    /// The match this command targets, when match-scoped.
    pub fn match_id(&self) -> Option<MatchId> {
        match self {
            ClientCommand::FindMatch { .. }
            | ClientCommand::CancelMatchmaking {}
            | ClientCommand::CreateCustom { .. } => None,
            ClientCommand::JoinGame { match_id }
            | ClientCommand::LeaveGame { match_id }
            | ClientCommand::Ready { match_id }
            | ClientCommand::StartGame { match_id }
            | ClientCommand::SubmitSolution { match_id, .. }
            | ClientCommand::SpectateGame { match_id }
            | ClientCommand::StopSpectating { match_id }
            | ClientCommand::GetGameState { match_id }
            | ClientCommand::SendChatMessage { match_id, .. }
            | ClientCommand::UserTyping { match_id, .. } => Some(*match_id),
        }
    }
}

/// Why a player left a match, carried by `player_left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Voluntary leave before start.
    Left,
    /// Connection lost; the slot is retained for the grace window.
    Disconnected,
    /// Grace window expired or the player resigned mid-match.
    Forfeited,
}

/// Server → client events. Match-scoped events are wrapped in an
/// [`Envelope`] carrying the match id and snapshot version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A pairing was made for a queued ticket.
    MatchFound {
        /// The new match.
        match_id: MatchId,
        /// Its mode.
        mode: MatchMode,
        /// The paired players.
        players: Vec<Player>,
    },
    /// A player joined the lobby.
    PlayerJoined {
        /// Who joined.
        player: Player,
    },
    /// A player left, disconnected or forfeited.
    PlayerLeft {
        /// Who left.
        player_id: PlayerId,
        /// Why.
        reason: LeaveReason,
    },
    /// The pre-round countdown began.
    MatchStarting {
        /// Countdown length in milliseconds.
        countdown_ms: u64,
    },
    /// A round opened.
    RoundStart {
        /// Which round.
        round_index: u32,
        /// The problem to solve.
        problem: Problem,
        /// Milliseconds until the submission deadline.
        deadline_in_ms: u64,
    },
    /// A submission was accepted; sent to the submitter only.
    SubmissionAck {
        /// Id of the retained submission.
        submission_id: SubmissionId,
    },
    /// A round closed with scores.
    RoundResult {
        /// Which round.
        round_index: u32,
        /// Per-player score and report.
        per_player: BTreeMap<PlayerId, PlayerRoundResult>,
        /// Running totals after this round.
        totals: BTreeMap<PlayerId, i64>,
        /// Whether any score came from the fallback path.
        grading_degraded: bool,
    },
    /// The match reached a terminal state.
    MatchEnd {
        /// Final placements.
        standings: Vec<Standing>,
        /// Why it ended.
        reason: EndReason,
    },
    /// A chat line.
    ChatMessage {
        /// Sender.
        from: PlayerId,
        /// Body.
        text: String,
        /// Milliseconds since the core's epoch.
        ts_ms: u64,
    },
    /// A typing indicator.
    UserTyping {
        /// Who is typing.
        from: PlayerId,
        /// Whether they started or stopped.
        is_typing: bool,
    },
    /// Full state snapshot for (re)joining clients.
    Resync {
        /// Current match snapshot.
        snapshot: MatchSnapshot,
    },
    /// A rejected command; sent to the offender only.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable reason.
        message: String,
    },
}

impl From<CommandError> for ServerEvent {
    fn from(err: CommandError) -> Self {
        ServerEvent::Error {
            code: err.code,
            message: err.message,
        }
    }
}

/// A server event with its routing and ordering metadata.
///
/// For match-scoped events `version` is the match snapshot version at
/// emission; a subscriber observing versions strictly increase can detect
/// gaps and issue a resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Match the event belongs to, when match-scoped.
    pub match_id: Option<MatchId>,
    /// Snapshot version at emission, when match-scoped.
    pub version: Option<u64>,
    /// The event itself.
    pub event: ServerEvent,
}

impl Envelope {
    /// Wraps a match-scoped event.
    pub fn scoped(match_id: MatchId, version: u64, event: ServerEvent) -> Self {
        Self {
            match_id: Some(match_id),
            version: Some(version),
            event,
        }
    }

    /// Wraps a connection-scoped event (errors, matchmaking notices).
    pub fn direct(event: ServerEvent) -> Self {
        Self {
            match_id: None,
            version: None,
            event,
        }
    }
}
