//! Player identity and game-mode tags shared across the core.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identity of a player for the duration of a session.
    PlayerId
);
uuid_id!(
    /// Identity of a single match.
    MatchId
);
uuid_id!(
    /// Identity of a single code submission.
    SubmissionId
);
uuid_id!(
    /// Identity of one duplex connection (a player may hold several).
    ConnId
);
uuid_id!(
    /// Identity of a matchmaking ticket.
    TicketId
);

/// A player as seen by the core: identity, rating and liveness.
///
/// Owned by the [`SessionHub`](crate::session_hub::SessionHub) for the
/// duration of a connection; matches hold references by value but never
/// mutate identity fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    /// Stable player identity.
    pub player_id: PlayerId,
    /// Name shown to other participants.
    pub display_name: String,
    /// Skill rating used for matchmaking buckets.
    pub rating: i32,
    /// Synthesized opponent used to pad under-filled matches.
    #[serde(default)]
    pub is_bot: bool,
    /// Whether the player currently has at least one live connection.
    #[serde(default = "default_connected")]
    pub connected: bool,
    /// Monotonic instant of the last activity observed for this player.
    #[serde(skip)]
    pub last_seen_at: Option<Instant>,
}

fn default_connected() -> bool {
    true
}

impl Player {
    /// Creates a connected human player.
    pub fn new(display_name: impl Into<String>, rating: i32) -> Self {
        Self {
            player_id: PlayerId::new(),
            display_name: display_name.into(),
            rating,
            is_bot: false,
            connected: true,
            last_seen_at: None,
        }
    }

    /// Creates a synthesized opponent with the given rating.
    pub fn bot(rating: i32) -> Self {
        let suffix: u16 = rand::random();
        Self {
            player_id: PlayerId::new(),
            display_name: format!("bot-{suffix:04x}"),
            rating,
            is_bot: true,
            connected: true,
            last_seen_at: None,
        }
    }
}

/// Tag selecting round count, time limits, scoring curve and problem source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Unranked head-to-head.
    Casual,
    /// Rated head-to-head.
    Ranked,
    /// Short rounds, many of them.
    Blitz,
    /// Single-player warmup.
    Practice,
    /// Multi-player quickfire questions.
    Trivia,
    /// Fix-the-bug rounds.
    Debug,
    /// Player-configured lobby.
    Custom,
}

impl MatchMode {
    /// Stable lowercase name, used in queue keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Casual => "casual",
            MatchMode::Ranked => "ranked",
            MatchMode::Blitz => "blitz",
            MatchMode::Practice => "practice",
            MatchMode::Trivia => "trivia",
            MatchMode::Debug => "debug",
            MatchMode::Custom => "custom",
        }
    }

    /// Modes the matchmaker queues players for; `Custom` is join-by-id only.
    pub fn is_queued(&self) -> bool {
        !matches!(self, MatchMode::Custom)
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
