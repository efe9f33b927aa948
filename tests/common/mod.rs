#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use arena_core::clock::Clock;
use arena_core::config::CoreConfig;
use arena_core::grader::{
    CriterionScores, GradeError, GradeReport, GradeRequest, GraderClient,
};
use arena_core::player::{ConnId, Player, SubmissionId};
use arena_core::protocol::{ClientCommand, Envelope, ServerEvent};
use arena_core::state_store::MemoryStateStore;
use arena_core::store::{MemoryStore, StaticProblemSource};
use arena_core::supervisor::Supervisor;

type Script = Box<dyn Fn(&GradeRequest) -> Result<GradeReport, GradeError> + Send + Sync>;

/// Grader test double: a fixed response function plus the idempotence
/// cache the real contract requires, and an optional artificial delay.
pub struct ScriptedGrader {
    script: Script,
    delay: Option<Duration>,
    cache: Mutex<HashMap<SubmissionId, Result<GradeReport, GradeError>>>,
}

impl ScriptedGrader {
    pub fn new(
        script: impl Fn(&GradeRequest) -> Result<GradeReport, GradeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            delay: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl GraderClient for ScriptedGrader {
    async fn grade(&self, request: GradeRequest) -> Result<GradeReport, GradeError> {
        let id = request.submission.submission_id;
        if let Some(hit) = self.cache.lock().get(&id) {
            return hit.clone();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = (self.script)(&request);
        self.cache.lock().insert(id, result.clone());
        result
    }
}

/// Report with criterion points scaled so they sum to `total`.
pub fn report_with_total(submission_id: SubmissionId, total: f64) -> GradeReport {
    let criteria = CriterionScores {
        correctness: total * 0.40,
        efficiency: total * 0.25,
        readability: total * 0.20,
        style: total * 0.10,
        innovation: total * 0.05,
    };
    GradeReport::from_criteria(submission_id, criteria, "scripted")
}

/// A full core over in-memory collaborators.
pub struct TestArena {
    pub supervisor: Supervisor,
    pub state_store: Arc<MemoryStateStore>,
    pub store: Arc<MemoryStore>,
}

impl TestArena {
    pub fn new(config: CoreConfig, grader: ScriptedGrader) -> Self {
        let state_store = Arc::new(MemoryStateStore::new());
        let store = Arc::new(MemoryStore::new());
        let supervisor = Supervisor::new(
            Clock::new(),
            config,
            state_store.clone(),
            store.clone(),
            Arc::new(StaticProblemSource::new()),
            Arc::new(grader),
        );
        Self {
            supervisor,
            state_store,
            store,
        }
    }

    pub async fn connect(&self, player: &Player) -> Client {
        let outcome = self.supervisor.connect(player.clone()).await;
        Client {
            supervisor: self.supervisor.clone(),
            player: player.clone(),
            conn_id: outcome.conn_id,
            events: outcome.events,
        }
    }
}

/// One connected player plus their outbound event stream.
pub struct Client {
    pub supervisor: Supervisor,
    pub player: Player,
    pub conn_id: ConnId,
    pub events: UnboundedReceiver<Envelope>,
}

impl Client {
    pub async fn send(&self, command: ClientCommand) {
        self.supervisor.handle_command(self.conn_id, command).await;
    }

    /// Skips events until one matches `pred`; panics after ten simulated
    /// minutes without a match.
    pub async fn expect(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> Envelope {
        let deadline = Duration::from_secs(600);
        tokio::time::timeout(deadline, async {
            loop {
                let envelope = self.events.recv().await.expect("event stream closed");
                if pred(&envelope.event) {
                    return envelope;
                }
            }
        })
        .await
        .expect("no matching event before timeout")
    }

    pub async fn expect_round_start(&mut self) -> Envelope {
        self.expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
            .await
    }

    pub async fn expect_error(&mut self) -> Envelope {
        self.expect(|e| matches!(e, ServerEvent::Error { .. })).await
    }
}
