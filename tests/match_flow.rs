//! End-to-end match lifecycle over paused time: pairing, rounds,
//! grading, disconnects and shutdown, driven through the public command
//! surface with in-memory collaborators.

use std::time::Duration;

use arena_core::grader::{GradeError, TestOutcome};
use arena_core::match_state::{EndReason, MatchStatus};
use arena_core::player::{MatchId, MatchMode, Player};
use arena_core::protocol::{ClientCommand, LeaveReason, MatchPreferences, ServerEvent};

mod common;
use common::{report_with_total, Client, ScriptedGrader, TestArena};

fn find_match(mode: MatchMode) -> ClientCommand {
    ClientCommand::FindMatch {
        mode,
        preferences: MatchPreferences::default(),
    }
}

async fn pair_and_confirm(a: &mut Client, b: &mut Client, mode: MatchMode) -> MatchId {
    a.send(find_match(mode)).await;
    b.send(find_match(mode)).await;

    let found = a
        .expect(|e| matches!(e, ServerEvent::MatchFound { .. }))
        .await;
    let match_id = match found.event {
        ServerEvent::MatchFound { match_id, .. } => match_id,
        _ => unreachable!(),
    };
    b.expect(|e| matches!(e, ServerEvent::MatchFound { .. }))
        .await;

    a.send(ClientCommand::Ready { match_id }).await;
    b.send(ClientCommand::Ready { match_id }).await;
    a.expect(|e| matches!(e, ServerEvent::MatchStarting { .. }))
        .await;
    b.expect(|e| matches!(e, ServerEvent::MatchStarting { .. }))
        .await;
    match_id
}

#[tokio::test(start_paused = true)]
async fn happy_path_two_player_casual() {
    // Alice's submissions grade to 100 per round, Bob's to 80.
    let grader = ScriptedGrader::new(|req| {
        let total = if req.submission.code.contains("alice") {
            100.0
        } else {
            80.0
        };
        Ok(report_with_total(req.submission.submission_id, total))
    });
    let arena = TestArena::new(
        arena_core::config::CoreConfig::new().with_round_time_limit(Duration::from_secs(60)),
        grader,
    );
    let alice = Player::new("alice", 1000);
    let bob = Player::new("bob", 1020);
    let mut a = arena.connect(&alice).await;
    let mut b = arena.connect(&bob).await;

    let match_id = pair_and_confirm(&mut a, &mut b, MatchMode::Casual).await;

    let mut last_version = 0;
    for round in 0..3u32 {
        let start = a
            .expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
            .await;
        match &start.event {
            ServerEvent::RoundStart {
                round_index,
                deadline_in_ms,
                ..
            } => {
                assert_eq!(*round_index, round);
                assert_eq!(*deadline_in_ms, 60_000);
            }
            _ => unreachable!(),
        }
        b.expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
            .await;

        tokio::time::advance(Duration::from_secs(30)).await;
        a.send(ClientCommand::SubmitSolution {
            match_id,
            round_index: round,
            code: format!("def alice_{round}(): pass"),
            language: "python".into(),
        })
        .await;
        a.expect(|e| matches!(e, ServerEvent::SubmissionAck { .. }))
            .await;

        tokio::time::advance(Duration::from_secs(15)).await;
        b.send(ClientCommand::SubmitSolution {
            match_id,
            round_index: round,
            code: format!("def bob_{round}(): pass"),
            language: "python".into(),
        })
        .await;
        b.expect(|e| matches!(e, ServerEvent::SubmissionAck { .. }))
            .await;

        // Both submitted: the round closes without waiting for the
        // deadline.
        let result = a
            .expect(|e| matches!(e, ServerEvent::RoundResult { .. }))
            .await;
        match &result.event {
            ServerEvent::RoundResult {
                round_index,
                per_player,
                grading_degraded,
                ..
            } => {
                assert_eq!(*round_index, round);
                assert!(!grading_degraded);
                assert_eq!(per_player[&alice.player_id].score, 100);
                assert_eq!(per_player[&bob.player_id].score, 80);
            }
            _ => unreachable!(),
        }
        // Match-scoped events carry strictly increasing versions.
        let version = result.version.unwrap();
        assert!(version > last_version);
        last_version = version;
        b.expect(|e| matches!(e, ServerEvent::RoundResult { .. }))
            .await;
    }

    let end = a
        .expect(|e| matches!(e, ServerEvent::MatchEnd { .. }))
        .await;
    match end.event {
        ServerEvent::MatchEnd { standings, reason } => {
            assert_eq!(reason, EndReason::Completed);
            assert_eq!(standings.len(), 2);
            assert_eq!(standings[0].player_id, alice.player_id);
            assert_eq!(standings[0].total, 300);
            assert_eq!(standings[1].player_id, bob.player_id);
            assert_eq!(standings[1].total, 240);
        }
        _ => unreachable!(),
    }
    assert!(end.version.unwrap() > last_version);

    // The terminal record reached the durable store.
    let records = arena.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].standings[0].total, 300);
    assert_eq!(records[0].rounds.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn grader_outage_uses_heuristic_fallback() {
    // The grader is down for everyone, but the sandbox pass counts
    // survive: 3/4 for Alice, 4/4 for Bob.
    let grader = ScriptedGrader::new(|req| {
        let tests = if req.submission.code.contains("alice") {
            TestOutcome { passed: 3, total: 4 }
        } else {
            TestOutcome { passed: 4, total: 4 }
        };
        Err(GradeError::Unavailable {
            message: "model offline".into(),
            tests: Some(tests),
        })
    });
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), grader);
    let alice = Player::new("alice", 1000);
    let bob = Player::new("bob", 1000);
    let mut a = arena.connect(&alice).await;
    let mut b = arena.connect(&bob).await;

    let match_id = pair_and_confirm(&mut a, &mut b, MatchMode::Casual).await;
    a.expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
        .await;

    a.send(ClientCommand::SubmitSolution {
        match_id,
        round_index: 0,
        code: "alice heuristics".into(),
        language: "python".into(),
    })
    .await;
    b.send(ClientCommand::SubmitSolution {
        match_id,
        round_index: 0,
        code: "bob heuristics".into(),
        language: "python".into(),
    })
    .await;

    let result = a
        .expect(|e| matches!(e, ServerEvent::RoundResult { .. }))
        .await;
    match result.event {
        ServerEvent::RoundResult {
            per_player,
            grading_degraded,
            ..
        } => {
            assert!(grading_degraded);
            // 3/4·40 + 12.5 + 10 + 5 = 57.5 → 58; 4/4·40 + 27.5 = 67.5 → 68.
            assert_eq!(per_player[&alice.player_id].score, 58);
            assert_eq!(per_player[&bob.player_id].score, 68);
        }
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn grading_deadline_closes_round_with_fallback() {
    // The grader answers, but only after the 30 s grading budget.
    let grader = ScriptedGrader::new(|req| {
        Ok(report_with_total(req.submission.submission_id, 100.0))
    })
    .with_delay(Duration::from_secs(120));
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), grader);
    let alice = Player::new("alice", 1000);
    let bob = Player::new("bob", 1000);
    let mut a = arena.connect(&alice).await;
    let mut b = arena.connect(&bob).await;

    let match_id = pair_and_confirm(&mut a, &mut b, MatchMode::Casual).await;
    a.expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
        .await;

    for (client, code) in [(&a, "alice slow"), (&b, "bob slow")] {
        client
            .send(ClientCommand::SubmitSolution {
                match_id,
                round_index: 0,
                code: code.into(),
                language: "python".into(),
            })
            .await;
    }

    let result = a
        .expect(|e| matches!(e, ServerEvent::RoundResult { .. }))
        .await;
    match result.event {
        ServerEvent::RoundResult {
            per_player,
            grading_degraded,
            ..
        } => {
            assert!(grading_degraded);
            // No test info: mid-point efficiency/readability/style only.
            assert_eq!(per_player[&alice.player_id].score, 28);
            assert_eq!(per_player[&bob.player_id].score, 28);
        }
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn disconnect_and_reconnect_within_grace() {
    let grader = ScriptedGrader::new(|req| {
        Ok(report_with_total(req.submission.submission_id, 90.0))
    });
    let arena = TestArena::new(
        arena_core::config::CoreConfig::new().with_round_time_limit(Duration::from_secs(60)),
        grader,
    );
    let alice = Player::new("alice", 1000);
    let bob = Player::new("bob", 1000);
    let mut a = arena.connect(&alice).await;
    let mut b = arena.connect(&bob).await;

    let match_id = pair_and_confirm(&mut a, &mut b, MatchMode::Casual).await;
    a.expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
        .await;

    tokio::time::advance(Duration::from_secs(10)).await;
    a.send(ClientCommand::SubmitSolution {
        match_id,
        round_index: 0,
        code: "early bird".into(),
        language: "python".into(),
    })
    .await;
    a.expect(|e| matches!(e, ServerEvent::SubmissionAck { .. }))
        .await;

    // Bob drops at t=20 into the round.
    tokio::time::advance(Duration::from_secs(10)).await;
    arena.supervisor.disconnect(b.conn_id).await;
    a.expect(|e| {
        matches!(
            e,
            ServerEvent::PlayerLeft {
                reason: LeaveReason::Disconnected,
                ..
            }
        )
    })
    .await;

    // ...and returns at t=50, inside the 60 s grace window.
    tokio::time::advance(Duration::from_secs(30)).await;
    let mut b2 = arena.connect(&bob).await;
    let resync = b2
        .expect(|e| matches!(e, ServerEvent::Resync { .. }))
        .await;
    match resync.event {
        ServerEvent::Resync { snapshot } => {
            assert_eq!(snapshot.match_id, match_id);
            assert_eq!(snapshot.status, MatchStatus::InProgress);
            assert_eq!(snapshot.cursor, 0);
        }
        _ => unreachable!(),
    }

    // A submission at t=58 is still inside the round deadline.
    tokio::time::advance(Duration::from_secs(8)).await;
    b2.send(ClientCommand::SubmitSolution {
        match_id,
        round_index: 0,
        code: "late but fine".into(),
        language: "python".into(),
    })
    .await;
    b2.expect(|e| matches!(e, ServerEvent::SubmissionAck { .. }))
        .await;

    let result = a
        .expect(|e| matches!(e, ServerEvent::RoundResult { .. }))
        .await;
    match result.event {
        ServerEvent::RoundResult { per_player, .. } => {
            assert_eq!(per_player[&bob.player_id].score, 90);
        }
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn grace_expiry_forfeits_to_remaining_player() {
    let grader = ScriptedGrader::new(|req| {
        Ok(report_with_total(req.submission.submission_id, 90.0))
    });
    let arena = TestArena::new(
        arena_core::config::CoreConfig::new().with_round_time_limit(Duration::from_secs(60)),
        grader,
    );
    let alice = Player::new("alice", 1000);
    let bob = Player::new("bob", 1000);
    let mut a = arena.connect(&alice).await;
    let mut b = arena.connect(&bob).await;

    let match_id = pair_and_confirm(&mut a, &mut b, MatchMode::Casual).await;
    a.expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
        .await;

    // Bob drops at t=20 and never comes back.
    tokio::time::advance(Duration::from_secs(20)).await;
    arena.supervisor.disconnect(b.conn_id).await;
    a.expect(|e| {
        matches!(
            e,
            ServerEvent::PlayerLeft {
                reason: LeaveReason::Disconnected,
                ..
            }
        )
    })
    .await;

    tokio::time::advance(Duration::from_secs(10)).await;
    a.send(ClientCommand::SubmitSolution {
        match_id,
        round_index: 0,
        code: "solo".into(),
        language: "python".into(),
    })
    .await;
    a.expect(|e| matches!(e, ServerEvent::SubmissionAck { .. }))
        .await;

    // The round deadline (t=60) closes round 0 with Bob at zero.
    let result = a
        .expect(|e| matches!(e, ServerEvent::RoundResult { .. }))
        .await;
    match result.event {
        ServerEvent::RoundResult { per_player, .. } => {
            assert_eq!(per_player[&alice.player_id].score, 90);
            assert_eq!(per_player[&bob.player_id].score, 0);
        }
        _ => unreachable!(),
    }
    a.expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
        .await;

    // Grace ran out at t=80 (disconnect + 60 s): Bob is ejected and Alice
    // wins by forfeit.
    a.expect(|e| {
        matches!(
            e,
            ServerEvent::PlayerLeft {
                reason: LeaveReason::Forfeited,
                ..
            }
        )
    })
    .await;
    let end = a
        .expect(|e| matches!(e, ServerEvent::MatchEnd { .. }))
        .await;
    match end.event {
        ServerEvent::MatchEnd { standings, reason } => {
            assert_eq!(reason, EndReason::Forfeit);
            assert_eq!(standings.len(), 2);
            assert_eq!(standings[0].player_id, alice.player_id);
        }
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_running_matches() {
    let grader = ScriptedGrader::new(|req| {
        Ok(report_with_total(req.submission.submission_id, 50.0))
    });
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), grader);
    let alice = Player::new("alice", 1000);
    let bob = Player::new("bob", 1000);
    let mut a = arena.connect(&alice).await;
    let mut b = arena.connect(&bob).await;

    pair_and_confirm(&mut a, &mut b, MatchMode::Casual).await;
    a.expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
        .await;
    assert_eq!(arena.supervisor.live_matches(), 1);

    arena.supervisor.shutdown().await;
    let end = a
        .expect(|e| matches!(e, ServerEvent::MatchEnd { .. }))
        .await;
    assert!(matches!(
        end.event,
        ServerEvent::MatchEnd {
            reason: EndReason::Cancelled,
            ..
        }
    ));
    assert_eq!(arena.supervisor.live_matches(), 0);

    // A minimal terminal record still exists for the cancelled match.
    assert_eq!(arena.store.records().len(), 1);
}
