//! Persistence boundary.
//!
//! The core does not own durable storage; it reports terminal match
//! records through [`Store`] and pulls round problems through
//! [`ProblemSource`]. Rating math (ELO and friends) lives behind the
//! `Store` implementation — the core only reports `is_ranked` and the
//! final standings.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::grader::GradeReport;
use crate::match_state::{CancelReason, EndReason, MatchState, Problem, Standing};
use crate::player::{MatchId, MatchMode, PlayerId};

/// One round in a terminal match record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Zero-based index.
    pub round_index: u32,
    /// Problem played.
    pub problem_id: String,
    /// Final per-player scores.
    pub scores: BTreeMap<PlayerId, i64>,
    /// Grade reports produced for the round.
    pub grades: Vec<GradeReport>,
}

/// Terminal record of one match, persisted exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Match identity.
    pub match_id: MatchId,
    /// Mode tag.
    pub mode: MatchMode,
    /// Whether standings feed the rating system.
    pub is_ranked: bool,
    /// How the match ended.
    pub reason: EndReason,
    /// Why it was cancelled, when it was.
    pub cancel_reason: Option<CancelReason>,
    /// Final placements.
    pub standings: Vec<Standing>,
    /// Rounds actually played.
    pub rounds: Vec<RoundRecord>,
    /// Wall time between start and end, when the match started.
    pub duration: Option<Duration>,
}

impl MatchRecord {
    /// Builds the terminal record from a finished match.
    pub fn from_state(state: &MatchState) -> Self {
        let rounds = state
            .rounds
            .iter()
            .map(|r| RoundRecord {
                round_index: r.round_index,
                problem_id: r.problem.problem_id.clone(),
                scores: r.scores.clone(),
                grades: r.grades.values().cloned().collect(),
            })
            .collect();
        Self {
            match_id: state.match_id(),
            mode: state.config.mode,
            is_ranked: state.config.is_ranked,
            reason: state.end_reason.unwrap_or(EndReason::Cancelled),
            cancel_reason: state.cancel_reason(),
            standings: state.standings(),
            rounds,
            duration: match (state.started_at, state.ended_at) {
                (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
                _ => None,
            },
        }
    }
}

/// Durable storage of terminal match results.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Persists a terminal record; must be idempotent on `match_id`.
    async fn record_match_result(&self, record: &MatchRecord) -> anyhow::Result<()>;
}

/// Serves the problem for each round of a match.
#[async_trait]
pub trait ProblemSource: Send + Sync + 'static {
    /// Problem for `round_index` of a `mode` match.
    async fn next_problem(&self, mode: MatchMode, round_index: u32) -> anyhow::Result<Problem>;
}

/// In-memory [`Store`] keeping records for inspection; the default when
/// no durable backend is wired.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<MatchId, MatchRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all persisted records.
    pub fn records(&self) -> Vec<MatchRecord> {
        self.records.lock().values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn record_match_result(&self, record: &MatchRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .insert(record.match_id, record.clone());
        Ok(())
    }
}

/// [`ProblemSource`] serving a fixed seed set round-robin per mode, so
/// the core runs without any external problem service.
pub struct StaticProblemSource {
    problems: Vec<Problem>,
}

impl StaticProblemSource {
    /// Source over the built-in seed set.
    pub fn new() -> Self {
        Self {
            problems: seed_problems(),
        }
    }

    /// Source over a caller-provided set; must be non-empty.
    pub fn with_problems(problems: Vec<Problem>) -> Self {
        assert!(!problems.is_empty(), "problem set must not be empty");
        Self { problems }
    }
}

impl Default for StaticProblemSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProblemSource for StaticProblemSource {
    async fn next_problem(&self, mode: MatchMode, round_index: u32) -> anyhow::Result<Problem> {
        // Offset by mode so concurrent modes do not all see the same order.
        let offset = mode.as_str().len() as u32;
        let idx = (round_index + offset) as usize % self.problems.len();
        Ok(self.problems[idx].clone())
    }
}

fn seed_problems() -> Vec<Problem> {
    let limit = Duration::from_secs(300);
    let seed = [
        (
            "two-sum",
            "Two Sum",
            "Given an array and a target, return indices of two numbers adding to the target.",
        ),
        (
            "valid-parens",
            "Valid Parentheses",
            "Decide whether a string of brackets is balanced.",
        ),
        (
            "merge-intervals",
            "Merge Intervals",
            "Merge all overlapping intervals in a list.",
        ),
        (
            "lru-cache",
            "LRU Cache",
            "Implement a fixed-capacity least-recently-used cache.",
        ),
        (
            "word-ladder",
            "Word Ladder",
            "Find the shortest transformation sequence between two words.",
        ),
        (
            "topo-order",
            "Course Schedule",
            "Order courses so every prerequisite comes first, or report a cycle.",
        ),
    ];
    seed.iter()
        .map(|(id, title, prompt)| Problem {
            problem_id: (*id).into(),
            title: (*title).into(),
            prompt: (*prompt).into(),
            time_limit: limit,
        })
        .collect()
}

/// Convenience alias bundling the collaborator handles every actor needs.
#[derive(Clone)]
pub struct Collaborators {
    /// Shared state store.
    pub state_store: Arc<dyn crate::state_store::StateStore>,
    /// Durable result store.
    pub store: Arc<dyn Store>,
    /// Problem source.
    pub problems: Arc<dyn ProblemSource>,
    /// Grader boundary.
    pub grader: Arc<dyn crate::grader::GraderClient>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_is_idempotent_per_match() {
        let store = MemoryStore::new();
        let record = MatchRecord {
            match_id: MatchId::new(),
            mode: MatchMode::Casual,
            is_ranked: false,
            reason: EndReason::Completed,
            cancel_reason: None,
            standings: vec![],
            rounds: vec![],
            duration: Some(Duration::from_secs(90)),
        };
        store.record_match_result(&record).await.unwrap();
        store.record_match_result(&record).await.unwrap();
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn static_source_cycles_problems() {
        let source = StaticProblemSource::new();
        let first = source.next_problem(MatchMode::Casual, 0).await.unwrap();
        let again = source.next_problem(MatchMode::Casual, 0).await.unwrap();
        assert_eq!(first.problem_id, again.problem_id);

        let next = source.next_problem(MatchMode::Casual, 1).await.unwrap();
        assert_ne!(first.problem_id, next.problem_id);
    }
}
