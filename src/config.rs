//! Configuration for the orchestration core.
//!
//! All knobs live on [`CoreConfig`], created programmatically with
//! [`CoreConfig::new()`] and chainable `with_*` setters, or from
//! environment variables with [`CoreConfig::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional; unset or unparsable values fall back to the
//! defaults listed on each setter.
//!
//! - `ARENA_ROUND_TIME_LIMIT_S` — default per-round time limit in seconds
//! - `ARENA_GRACE_DISCONNECT_S` — slot-retention window after a disconnect
//! - `ARENA_GRADING_BUDGET_S` — wall budget for one round's grading pass
//! - `ARENA_CONFIRM_WINDOW_S` — pairing confirmation window
//! - `ARENA_FILL_DEADLINE_S` — multi-player queue fill deadline
//! - `ARENA_CHAT_RATE_PER_10S` — chat/typing messages allowed per 10 s
//! - `ARENA_CHAT_HISTORY_SIZE` — retained chat messages per match
//! - `ARENA_MAX_MATCHES` — per-process live match cap
//! - `ARENA_LOG_DIR` — enable file logging to this directory

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RetryPolicy;
use crate::player::{MatchMode, PlayerId};

/// Maximum criterion points per scoring dimension; the five weights sum
/// to 100 so a perfect round scores 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Points available for passing the tests.
    pub correctness: u8,
    /// Points available for runtime/space efficiency.
    pub efficiency: u8,
    /// Points available for readability.
    pub readability: u8,
    /// Points available for idiomatic style.
    pub style: u8,
    /// Points available for novelty of approach.
    pub innovation: u8,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            correctness: 40,
            efficiency: 25,
            readability: 20,
            style: 10,
            innovation: 5,
        }
    }
}

impl ScoreWeights {
    /// Sum of all weights.
    pub fn total(&self) -> u32 {
        self.correctness as u32
            + self.efficiency as u32
            + self.readability as u32
            + self.style as u32
            + self.innovation as u32
    }
}

/// Per-mode shape of a match: round structure and player slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeRules {
    /// Number of rounds played to completion.
    pub round_count: u32,
    /// Time limit of each round.
    pub round_time_limit: Duration,
    /// Minimum players required to start.
    pub min_players: u32,
    /// Maximum players admitted.
    pub max_players: u32,
    /// Whether final standings feed the rating system.
    pub is_ranked: bool,
    /// Scoring curve for this mode.
    pub weights: ScoreWeights,
}

/// Client-supplied configuration for a custom lobby.
///
/// Unset fields fall back to the `Custom` mode rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomConfig {
    /// Override for the number of rounds.
    #[serde(default)]
    pub round_count: Option<u32>,
    /// Override for the per-round time limit, in seconds.
    #[serde(default)]
    pub round_time_limit_s: Option<u64>,
    /// Override for the player cap.
    #[serde(default)]
    pub max_players: Option<u32>,
    /// Whether the lobby is hidden and invite-only.
    #[serde(default)]
    pub is_private: bool,
    /// Players allowed to join or spectate a private lobby.
    #[serde(default)]
    pub invited: Vec<PlayerId>,
    /// Restricts submission languages; empty keeps the server default.
    #[serde(default)]
    pub language_whitelist: Vec<String>,
}

/// Core-scoped configuration with defaults for every knob.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub(crate) round_time_limit: Duration,
    pub(crate) bucket_widen_step: u32,
    pub(crate) bucket_widen_interval: Duration,
    pub(crate) bucket_widen_max: u32,
    pub(crate) grace_disconnect: Duration,
    pub(crate) grading_budget: Duration,
    pub(crate) grading_concurrency: Option<usize>,
    pub(crate) language_whitelist: Vec<String>,
    pub(crate) max_code_len: usize,
    pub(crate) chat_rate_per_10s: u32,
    pub(crate) chat_history_size: usize,
    pub(crate) confirm_window: Duration,
    pub(crate) auto_start_after: Duration,
    pub(crate) waiting_expiry: Duration,
    pub(crate) countdown: Duration,
    pub(crate) fill_deadline: Duration,
    pub(crate) retention: Duration,
    pub(crate) sweep_interval: Duration,
    pub(crate) max_matches: usize,
    pub(crate) mailbox_capacity: usize,
    pub(crate) store_retry: RetryPolicy,
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) mode_overrides: BTreeMap<MatchMode, ModeRules>,
}

impl CoreConfig {
    /// Creates a configuration with the documented defaults.
    pub fn new() -> Self {
        Self {
            round_time_limit: Duration::from_secs(300),
            bucket_widen_step: 50,
            bucket_widen_interval: Duration::from_secs(5),
            bucket_widen_max: 500,
            grace_disconnect: Duration::from_secs(60),
            grading_budget: Duration::from_secs(30),
            grading_concurrency: None,
            language_whitelist: vec![
                "python".into(),
                "javascript".into(),
                "typescript".into(),
                "rust".into(),
                "go".into(),
                "java".into(),
                "cpp".into(),
            ],
            max_code_len: 64 * 1024,
            chat_rate_per_10s: 10,
            chat_history_size: 200,
            confirm_window: Duration::from_secs(10),
            auto_start_after: Duration::from_secs(10),
            waiting_expiry: Duration::from_secs(300),
            countdown: Duration::from_secs(3),
            fill_deadline: Duration::from_secs(30),
            retention: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            max_matches: 1024,
            mailbox_capacity: 64,
            store_retry: RetryPolicy::default(),
            log_dir: None,
            mode_overrides: BTreeMap::new(),
        }
    }

    /// Creates a configuration from `ARENA_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        fn secs(var: &str) -> Option<Duration> {
            std::env::var(var).ok()?.parse().ok().map(Duration::from_secs)
        }
        fn num<T: std::str::FromStr>(var: &str) -> Option<T> {
            std::env::var(var).ok()?.parse().ok()
        }

        let mut config = Self::new();
        if let Some(v) = secs("ARENA_ROUND_TIME_LIMIT_S") {
            config.round_time_limit = v;
        }
        if let Some(v) = secs("ARENA_GRACE_DISCONNECT_S") {
            config.grace_disconnect = v;
        }
        if let Some(v) = secs("ARENA_GRADING_BUDGET_S") {
            config.grading_budget = v;
        }
        if let Some(v) = secs("ARENA_CONFIRM_WINDOW_S") {
            config.confirm_window = v;
        }
        if let Some(v) = secs("ARENA_FILL_DEADLINE_S") {
            config.fill_deadline = v;
        }
        if let Some(v) = num("ARENA_CHAT_RATE_PER_10S") {
            config.chat_rate_per_10s = v;
        }
        if let Some(v) = num("ARENA_CHAT_HISTORY_SIZE") {
            config.chat_history_size = v;
        }
        if let Some(v) = num("ARENA_MAX_MATCHES") {
            config.max_matches = v;
        }
        config.log_dir = std::env::var("ARENA_LOG_DIR")
            .ok()
            .map(PathBuf::from)
            .filter(|p| p.is_dir());
        config
    }

    /// Default per-round time limit (default 300 s; modes override it).
    pub fn with_round_time_limit(mut self, value: Duration) -> Self {
        self.round_time_limit = value;
        self
    }

    /// Matchmaking bucket widening: rating step (default 50), interval
    /// between widenings (default 5 s), and the widest half-window
    /// (default ±500).
    pub fn with_bucket_widening(mut self, step: u32, interval: Duration, max: u32) -> Self {
        self.bucket_widen_step = step;
        self.bucket_widen_interval = interval;
        self.bucket_widen_max = max;
        self
    }

    /// Slot-retention window after a mid-match disconnect (default 60 s).
    pub fn with_grace_disconnect(mut self, value: Duration) -> Self {
        self.grace_disconnect = value;
        self
    }

    /// Wall budget for one round's grading pass (default 30 s).
    pub fn with_grading_budget(mut self, value: Duration) -> Self {
        self.grading_budget = value;
        self
    }

    /// Cap on concurrent grade calls per match; `None` grades every
    /// submission at once (the default).
    pub fn with_grading_concurrency(mut self, value: Option<usize>) -> Self {
        self.grading_concurrency = value;
        self
    }

    /// Languages accepted in submissions.
    pub fn with_language_whitelist<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.language_whitelist = languages.into_iter().map(Into::into).collect();
        self
    }

    /// Maximum accepted submission size in bytes (default 64 KiB).
    pub fn with_max_code_len(mut self, value: usize) -> Self {
        self.max_code_len = value;
        self
    }

    /// Chat/typing token bucket: messages per 10 s (default 10).
    pub fn with_chat_rate(mut self, per_10s: u32) -> Self {
        self.chat_rate_per_10s = per_10s;
        self
    }

    /// Retained chat messages per match (default 200).
    pub fn with_chat_history_size(mut self, value: usize) -> Self {
        self.chat_history_size = value;
        self
    }

    /// Pairing confirmation window for matchmade matches (default 10 s).
    pub fn with_confirm_window(mut self, value: Duration) -> Self {
        self.confirm_window = value;
        self
    }

    /// Auto-start delay for lobbies once minimum players joined
    /// (default 10 s).
    pub fn with_auto_start_after(mut self, value: Duration) -> Self {
        self.auto_start_after = value;
        self
    }

    /// How long a lobby may sit in `waiting` before it is cancelled
    /// (default 5 min).
    pub fn with_waiting_expiry(mut self, value: Duration) -> Self {
        self.waiting_expiry = value;
        self
    }

    /// Pre-start countdown during which joins are rejected (default 3 s).
    pub fn with_countdown(mut self, value: Duration) -> Self {
        self.countdown = value;
        self
    }

    /// Multi-player fill deadline before padding or relaxing (default 30 s).
    pub fn with_fill_deadline(mut self, value: Duration) -> Self {
        self.fill_deadline = value;
        self
    }

    /// How long a terminal match stays resyncable before cleanup
    /// (default 5 min).
    pub fn with_retention(mut self, value: Duration) -> Self {
        self.retention = value;
        self
    }

    /// Matchmaker pairing sweep period (default 1 s).
    pub fn with_sweep_interval(mut self, value: Duration) -> Self {
        self.sweep_interval = value;
        self
    }

    /// Per-process live match cap (default 1024).
    pub fn with_max_matches(mut self, value: usize) -> Self {
        self.max_matches = value;
        self
    }

    /// Bound of each match runtime's command mailbox (default 64).
    pub fn with_mailbox_capacity(mut self, value: usize) -> Self {
        self.mailbox_capacity = value;
        self
    }

    /// Retry schedule for transient state-store failures.
    pub fn with_store_retry(mut self, value: RetryPolicy) -> Self {
        self.store_retry = value;
        self
    }

    /// Enables file logging to the given directory.
    pub fn with_log_dir(mut self, value: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(value.into());
        self
    }

    /// Replaces the rules of one mode.
    pub fn with_mode_rules(mut self, mode: MatchMode, rules: ModeRules) -> Self {
        self.mode_overrides.insert(mode, rules);
        self
    }

    /// Round structure and player slots for `mode`.
    pub fn mode_rules(&self, mode: MatchMode) -> ModeRules {
        if let Some(rules) = self.mode_overrides.get(&mode) {
            return rules.clone();
        }
        let weights = ScoreWeights::default();
        let limit = self.round_time_limit;
        match mode {
            MatchMode::Casual => ModeRules {
                round_count: 3,
                round_time_limit: limit,
                min_players: 2,
                max_players: 2,
                is_ranked: false,
                weights,
            },
            MatchMode::Ranked => ModeRules {
                round_count: 3,
                round_time_limit: limit,
                min_players: 2,
                max_players: 2,
                is_ranked: true,
                weights,
            },
            MatchMode::Blitz => ModeRules {
                round_count: 10,
                round_time_limit: Duration::from_secs(60),
                min_players: 2,
                max_players: 2,
                is_ranked: true,
                weights,
            },
            MatchMode::Practice => ModeRules {
                round_count: 1,
                round_time_limit: limit,
                min_players: 1,
                max_players: 1,
                is_ranked: false,
                weights,
            },
            MatchMode::Trivia => ModeRules {
                round_count: 5,
                round_time_limit: Duration::from_secs(30),
                min_players: 2,
                max_players: 4,
                is_ranked: false,
                weights,
            },
            MatchMode::Debug => ModeRules {
                round_count: 3,
                round_time_limit: limit,
                min_players: 2,
                max_players: 2,
                is_ranked: false,
                weights,
            },
            MatchMode::Custom => ModeRules {
                round_count: 3,
                round_time_limit: limit,
                min_players: 2,
                max_players: 8,
                is_ranked: false,
                weights,
            },
        }
    }

}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_100() {
        assert_eq!(ScoreWeights::default().total(), 100);
    }

    #[test]
    fn mode_rules_have_sane_bounds() {
        let config = CoreConfig::new();
        for mode in [
            MatchMode::Casual,
            MatchMode::Ranked,
            MatchMode::Blitz,
            MatchMode::Practice,
            MatchMode::Trivia,
            MatchMode::Debug,
            MatchMode::Custom,
        ] {
            let rules = config.mode_rules(mode);
            assert!(rules.min_players >= 1, "{mode}");
            assert!(rules.max_players >= rules.min_players, "{mode}");
            assert!(rules.round_count >= 1, "{mode}");
            assert_eq!(rules.weights.total(), 100, "{mode}");
        }
    }

    #[test]
    fn overrides_replace_mode_rules() {
        let config = CoreConfig::new().with_mode_rules(
            MatchMode::Blitz,
            ModeRules {
                round_count: 5,
                round_time_limit: Duration::from_secs(45),
                min_players: 2,
                max_players: 2,
                is_ranked: true,
                weights: ScoreWeights::default(),
            },
        );
        assert_eq!(config.mode_rules(MatchMode::Blitz).round_count, 5);
        assert_eq!(config.mode_rules(MatchMode::Casual).round_count, 3);
    }
}
