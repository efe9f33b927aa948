//! The code-grading boundary.
//!
//! The core never evaluates code itself; it hands accepted submissions to
//! a [`GraderClient`] with an absolute deadline and folds the resulting
//! [`GradeReport`] into the round. When the grader is unreachable or
//! overruns the deadline, [`fallback_report`] substitutes a calibrated
//! heuristic score so the match keeps progressing.
//!
//! Contract for implementors:
//!
//! - `grade` must be cancel-safe; the runtime drops the future at the
//!   deadline.
//! - Grading is idempotent on `submission_id` within a match lifetime;
//!   re-issued calls return the same report.
//! - Criterion points are absolute, already scaled to the mode's
//!   [`ScoreWeights`], and sum to at most 100. The runtime never
//!   re-normalizes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ScoreWeights;
use crate::match_state::{Problem, Submission};
use crate::player::SubmissionId;

/// Outcome class of one grading attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Full evaluation completed.
    Ok,
    /// The grader failed; scores are heuristic.
    GraderError,
    /// The grader missed the deadline; scores are heuristic.
    Timeout,
    /// The submission could not be evaluated (did not compile, empty, …).
    Invalid,
}

/// Criterion points, each already scaled to its weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CriterionScores {
    /// Points for passing tests.
    pub correctness: f64,
    /// Points for efficiency.
    pub efficiency: f64,
    /// Points for readability.
    pub readability: f64,
    /// Points for style.
    pub style: f64,
    /// Points for innovation.
    pub innovation: f64,
}

impl CriterionScores {
    /// Sum of all criterion points.
    pub fn total(&self) -> f64 {
        self.correctness + self.efficiency + self.readability + self.style + self.innovation
    }
}

/// The grade of one submission; produced exactly once per accepted
/// submission and cached in the match until match end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeReport {
    /// Submission this report grades.
    pub submission_id: SubmissionId,
    /// Rounded total, clamped to `[0, 100]`.
    pub score_total: u32,
    /// Per-criterion breakdown.
    pub criteria: CriterionScores,
    /// Prose feedback shown to the player.
    pub feedback: String,
    /// Outcome class.
    pub verdict: Verdict,
    /// Whether the scores came from the fallback path.
    #[serde(default)]
    pub degraded: bool,
}

impl GradeReport {
    /// Builds a completed report from criterion points.
    pub fn from_criteria(
        submission_id: SubmissionId,
        criteria: CriterionScores,
        feedback: impl Into<String>,
    ) -> Self {
        Self {
            submission_id,
            score_total: round_total(criteria.total()),
            criteria,
            feedback: feedback.into(),
            verdict: Verdict::Ok,
            degraded: false,
        }
    }
}

/// Sandbox test results available even when full grading failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Test cases passed.
    pub passed: u32,
    /// Test cases run.
    pub total: u32,
}

impl TestOutcome {
    /// Pass ratio in `[0, 1]`; zero when no tests ran.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.passed) / f64::from(self.total)
        }
    }
}

/// One grading request: the submission, its problem and the absolute
/// deadline by which the report must be produced.
#[derive(Debug, Clone)]
pub struct GradeRequest {
    /// Submission to grade.
    pub submission: Submission,
    /// Problem it answers.
    pub problem: Problem,
    /// Absolute deadline; the runtime cancels the call past it.
    pub deadline: Instant,
}

/// Failure of a grading attempt. Partial sandbox results ride along so the
/// fallback can derive a correctness estimate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GradeError {
    /// The grader reported it could not finish in time.
    #[error("grader timed out")]
    Timeout {
        /// Sandbox results gathered before the timeout, if any.
        tests: Option<TestOutcome>,
    },
    /// Transport or evaluation failure.
    #[error("grader unavailable: {message}")]
    Unavailable {
        /// What went wrong.
        message: String,
        /// Sandbox results gathered before the failure, if any.
        tests: Option<TestOutcome>,
    },
}

impl GradeError {
    /// Sandbox results usable by the fallback path.
    pub fn tests(&self) -> Option<TestOutcome> {
        match self {
            GradeError::Timeout { tests } | GradeError::Unavailable { tests, .. } => *tests,
        }
    }

    /// Verdict class the fallback report carries for this failure.
    pub fn verdict(&self) -> Verdict {
        match self {
            GradeError::Timeout { .. } => Verdict::Timeout,
            GradeError::Unavailable { .. } => Verdict::GraderError,
        }
    }
}

/// Async code-to-grade interface; see the module docs for the contract.
#[async_trait]
pub trait GraderClient: Send + Sync + 'static {
    /// Grades one submission.
    async fn grade(&self, request: GradeRequest) -> Result<GradeReport, GradeError>;
}

/// Feedback line attached to heuristic scores.
pub const FALLBACK_FEEDBACK: &str = "AI offline — heuristic score.";

/// Heuristic report substituted when grading failed or timed out.
///
/// Correctness is derived from the sandbox pass ratio when available,
/// otherwise zero; efficiency, readability and style default to the
/// calibrated mid-point of their weights; innovation to zero.
pub fn fallback_report(
    submission_id: SubmissionId,
    weights: &ScoreWeights,
    tests: Option<TestOutcome>,
    verdict: Verdict,
) -> GradeReport {
    let criteria = CriterionScores {
        correctness: tests.map(|t| t.ratio()).unwrap_or(0.0) * f64::from(weights.correctness),
        efficiency: 0.5 * f64::from(weights.efficiency),
        readability: 0.5 * f64::from(weights.readability),
        style: 0.5 * f64::from(weights.style),
        innovation: 0.0,
    };
    GradeReport {
        submission_id,
        score_total: round_total(criteria.total()),
        criteria,
        feedback: FALLBACK_FEEDBACK.to_string(),
        verdict,
        degraded: true,
    }
}

fn round_total(total: f64) -> u32 {
    total.round().clamp(0.0, 100.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_uses_pass_ratio_for_correctness() {
        let weights = ScoreWeights::default();

        // 3/4 tests passing: 30 + 12.5 + 10 + 5 + 0 = 57.5, rounded up.
        let report = fallback_report(
            SubmissionId::new(),
            &weights,
            Some(TestOutcome {
                passed: 3,
                total: 4,
            }),
            Verdict::GraderError,
        );
        assert_eq!(report.score_total, 58);
        assert!(report.degraded);
        assert_eq!(report.verdict, Verdict::GraderError);

        // 4/4: 40 + 12.5 + 10 + 5 + 0 = 67.5, rounded up.
        let report = fallback_report(
            SubmissionId::new(),
            &weights,
            Some(TestOutcome {
                passed: 4,
                total: 4,
            }),
            Verdict::GraderError,
        );
        assert_eq!(report.score_total, 68);
    }

    #[test]
    fn fallback_without_tests_scores_zero_correctness() {
        let report = fallback_report(
            SubmissionId::new(),
            &ScoreWeights::default(),
            None,
            Verdict::Timeout,
        );
        assert_eq!(report.criteria.correctness, 0.0);
        assert_eq!(report.score_total, 28); // 12.5 + 10 + 5 rounded
        assert_eq!(report.feedback, FALLBACK_FEEDBACK);
    }

    #[test]
    fn totals_are_clamped() {
        let criteria = CriterionScores {
            correctness: 90.0,
            efficiency: 90.0,
            ..Default::default()
        };
        let report = GradeReport::from_criteria(SubmissionId::new(), criteria, "");
        assert_eq!(report.score_total, 100);
    }
}
