//! Matchmaking behavior: bucket widening over wait time, queue
//! cancellation, custom lobby capacity and privacy, and pairing
//! confirmation.

use std::time::Duration;

use tokio::time::Instant;

use arena_core::config::CustomConfig;
use arena_core::error::ErrorCode;
use arena_core::match_state::EndReason;
use arena_core::player::{MatchId, MatchMode, Player};
use arena_core::protocol::{ClientCommand, MatchPreferences, ServerEvent};
use arena_core::state_store::{queue_key, StateStore};

mod common;
use common::{report_with_total, Client, ScriptedGrader, TestArena};

fn scripted() -> ScriptedGrader {
    ScriptedGrader::new(|req| Ok(report_with_total(req.submission.submission_id, 100.0)))
}

fn find_match(mode: MatchMode) -> ClientCommand {
    ClientCommand::FindMatch {
        mode,
        preferences: MatchPreferences::default(),
    }
}

async fn expect_match_found(client: &mut Client) -> MatchId {
    let envelope = client
        .expect(|e| matches!(e, ServerEvent::MatchFound { .. }))
        .await;
    match envelope.event {
        ServerEvent::MatchFound { match_id, .. } => match_id,
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn bucket_widening_pairs_distant_ratings_after_waiting() {
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), scripted());
    let low = Player::new("low", 1000);
    let high = Player::new("high", 1400);
    let mut a = arena.connect(&low).await;
    let mut c = arena.connect(&high).await;

    let start = Instant::now();
    a.send(find_match(MatchMode::Ranked)).await;
    c.send(find_match(MatchMode::Ranked)).await;

    // 400 rating apart: the window reaches past 400 only once both have
    // waited 25 s (±50, ±100 at 5 s, …, ±500 at 25 s).
    expect_match_found(&mut c).await;
    let waited = Instant::now().duration_since(start);
    assert_eq!(waited, Duration::from_secs(25));
    expect_match_found(&mut a).await;
}

#[tokio::test(start_paused = true)]
async fn equal_ratings_pair_immediately() {
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), scripted());
    let p = Player::new("p", 1200);
    let q = Player::new("q", 1210);
    let mut a = arena.connect(&p).await;
    let mut b = arena.connect(&q).await;

    let start = Instant::now();
    a.send(find_match(MatchMode::Casual)).await;
    b.send(find_match(MatchMode::Casual)).await;

    expect_match_found(&mut a).await;
    expect_match_found(&mut b).await;
    assert!(Instant::now().duration_since(start) < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn ratings_past_the_cap_never_pair() {
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), scripted());
    let low = Player::new("low", 1000);
    let high = Player::new("high", 2200);
    let mut a = arena.connect(&low).await;
    let b = arena.connect(&high).await;

    a.send(find_match(MatchMode::Ranked)).await;
    b.send(find_match(MatchMode::Ranked)).await;

    // 1200 apart with a ±500 cap: two minutes of waiting changes nothing.
    let outcome = tokio::time::timeout(
        Duration::from_secs(120),
        a.expect(|e| matches!(e, ServerEvent::MatchFound { .. })),
    )
    .await;
    assert!(outcome.is_err());
}

#[tokio::test(start_paused = true)]
async fn cancel_before_pairing_leaves_the_queue_unchanged() {
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), scripted());
    let solo = Player::new("solo", 1000);
    let a = arena.connect(&solo).await;

    a.send(find_match(MatchMode::Casual)).await;
    // Let at least one sweep observe the queued ticket.
    tokio::time::sleep(Duration::from_secs(2)).await;
    a.send(ClientCommand::CancelMatchmaking {}).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let bucket = 1000 / 100;
    let queued = arena
        .state_store
        .zrange(&queue_key("casual", bucket))
        .await
        .unwrap();
    assert!(queued.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_pairing_requeues_the_confirmed_player_at_head() {
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), scripted());
    let keen = Player::new("keen", 1000);
    let ghost = Player::new("ghost", 1010);
    let mut a = arena.connect(&keen).await;
    let mut b = arena.connect(&ghost).await;

    a.send(find_match(MatchMode::Casual)).await;
    b.send(find_match(MatchMode::Casual)).await;
    let first = expect_match_found(&mut a).await;
    expect_match_found(&mut b).await;

    // Only one player confirms; the confirmation window (10 s) expires.
    a.send(ClientCommand::Ready { match_id: first }).await;
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

    // The confirmed player is back in the queue with their original
    // position; a fresh opponent pairs with them right away.
    let third = Player::new("third", 1005);
    let mut c = arena.connect(&third).await;
    c.send(find_match(MatchMode::Casual)).await;

    let second = expect_match_found(&mut a).await;
    assert_ne!(first, second);
    expect_match_found(&mut c).await;
}

#[tokio::test(start_paused = true)]
async fn lone_trivia_player_is_padded_with_a_bot_at_fill_deadline() {
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), scripted());
    let solo = Player::new("solo", 1000);
    let mut a = arena.connect(&solo).await;

    let start = Instant::now();
    a.send(find_match(MatchMode::Trivia)).await;

    let envelope = a
        .expect(|e| matches!(e, ServerEvent::MatchFound { .. }))
        .await;
    let (match_id, players) = match envelope.event {
        ServerEvent::MatchFound {
            match_id, players, ..
        } => (match_id, players),
        _ => unreachable!(),
    };
    assert!(Instant::now().duration_since(start) >= Duration::from_secs(30));
    assert_eq!(players.len(), 2);
    assert!(players.iter().any(|p| p.is_bot));

    // Bots neither confirm nor submit: the human's ready starts the
    // match, and the round closes at its deadline with zero scores.
    a.send(ClientCommand::Ready { match_id }).await;
    a.expect(|e| matches!(e, ServerEvent::MatchStarting { .. }))
        .await;
    a.expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
        .await;
    let result = a
        .expect(|e| matches!(e, ServerEvent::RoundResult { .. }))
        .await;
    match result.event {
        ServerEvent::RoundResult { per_player, .. } => {
            assert_eq!(per_player[&solo.player_id].score, 0);
        }
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn custom_lobby_capacity_is_enforced() {
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), scripted());
    let owner = Player::new("owner", 1100);
    let p = Player::new("p", 1000);
    let q = Player::new("q", 1050);
    let mut o = arena.connect(&owner).await;
    let mut pc = arena.connect(&p).await;
    let mut qc = arena.connect(&q).await;

    o.send(ClientCommand::CreateCustom {
        config: CustomConfig {
            max_players: Some(2),
            ..CustomConfig::default()
        },
    })
    .await;
    let match_id = expect_match_found(&mut o).await;

    pc.send(ClientCommand::JoinGame { match_id }).await;
    pc.expect(|e| matches!(e, ServerEvent::Resync { .. })).await;
    o.expect(|e| matches!(e, ServerEvent::PlayerJoined { .. }))
        .await;

    qc.send(ClientCommand::JoinGame { match_id }).await;
    let err = qc.expect_error().await;
    match err.event {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Full),
        _ => unreachable!(),
    }

    // The lobby itself is unaffected by the rejected join.
    o.send(ClientCommand::GetGameState { match_id }).await;
    let resync = o.expect(|e| matches!(e, ServerEvent::Resync { .. })).await;
    match resync.event {
        ServerEvent::Resync { snapshot } => assert_eq!(snapshot.players.len(), 2),
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn a_player_already_in_a_match_cannot_enter_another() {
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), scripted());
    let host_a = Player::new("host_a", 1100);
    let host_b = Player::new("host_b", 1150);
    let joiner = Player::new("joiner", 1000);
    let mut ha = arena.connect(&host_a).await;
    let mut hb = arena.connect(&host_b).await;
    let mut j = arena.connect(&joiner).await;

    ha.send(ClientCommand::CreateCustom {
        config: CustomConfig::default(),
    })
    .await;
    let match_a = expect_match_found(&mut ha).await;
    hb.send(ClientCommand::CreateCustom {
        config: CustomConfig::default(),
    })
    .await;
    let match_b = expect_match_found(&mut hb).await;

    j.send(ClientCommand::JoinGame { match_id: match_a }).await;
    j.expect(|e| matches!(e, ServerEvent::Resync { .. })).await;

    // Holding a slot in lobby A blocks every way into a second match.
    j.send(ClientCommand::JoinGame { match_id: match_b }).await;
    let err = j.expect_error().await;
    assert!(matches!(
        err.event,
        ServerEvent::Error {
            code: ErrorCode::WrongState,
            ..
        }
    ));

    j.send(find_match(MatchMode::Casual)).await;
    let err = j.expect_error().await;
    assert!(matches!(
        err.event,
        ServerEvent::Error {
            code: ErrorCode::WrongState,
            ..
        }
    ));

    ha.send(ClientCommand::CreateCustom {
        config: CustomConfig::default(),
    })
    .await;
    let err = ha.expect_error().await;
    assert!(matches!(
        err.event,
        ServerEvent::Error {
            code: ErrorCode::WrongState,
            ..
        }
    ));

    // Rejoining the match they are already in is rejected, not rerouted.
    j.send(ClientCommand::JoinGame { match_id: match_a }).await;
    let err = j.expect_error().await;
    assert!(matches!(
        err.event,
        ServerEvent::Error {
            code: ErrorCode::WrongState,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn private_lobby_requires_invite() {
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), scripted());
    let owner = Player::new("owner", 1100);
    let friend = Player::new("friend", 1000);
    let stranger = Player::new("stranger", 1050);
    let mut o = arena.connect(&owner).await;
    let mut f = arena.connect(&friend).await;
    let mut s = arena.connect(&stranger).await;

    o.send(ClientCommand::CreateCustom {
        config: CustomConfig {
            is_private: true,
            invited: vec![friend.player_id],
            ..CustomConfig::default()
        },
    })
    .await;
    let match_id = expect_match_found(&mut o).await;

    s.send(ClientCommand::JoinGame { match_id }).await;
    let err = s.expect_error().await;
    assert!(matches!(
        err.event,
        ServerEvent::Error {
            code: ErrorCode::PrivateDenied,
            ..
        }
    ));

    // Spectating a private lobby needs the invite as well.
    s.send(ClientCommand::SpectateGame { match_id }).await;
    let err = s.expect_error().await;
    assert!(matches!(
        err.event,
        ServerEvent::Error {
            code: ErrorCode::PrivateDenied,
            ..
        }
    ));

    f.send(ClientCommand::JoinGame { match_id }).await;
    f.expect(|e| matches!(e, ServerEvent::Resync { .. })).await;
}

#[tokio::test(start_paused = true)]
async fn owner_can_force_start_a_full_lobby() {
    let arena = TestArena::new(arena_core::config::CoreConfig::new(), scripted());
    let owner = Player::new("owner", 1100);
    let p = Player::new("p", 1000);
    let mut o = arena.connect(&owner).await;
    let mut pc = arena.connect(&p).await;

    o.send(ClientCommand::CreateCustom {
        config: CustomConfig {
            max_players: Some(2),
            round_count: Some(1),
            ..CustomConfig::default()
        },
    })
    .await;
    let match_id = expect_match_found(&mut o).await;
    pc.send(ClientCommand::JoinGame { match_id }).await;
    pc.expect(|e| matches!(e, ServerEvent::Resync { .. })).await;

    // A non-owner cannot force the start.
    pc.send(ClientCommand::StartGame { match_id }).await;
    let err = pc.expect_error().await;
    assert!(matches!(
        err.event,
        ServerEvent::Error {
            code: ErrorCode::Unauthorized,
            ..
        }
    ));

    o.send(ClientCommand::StartGame { match_id }).await;
    o.expect(|e| matches!(e, ServerEvent::MatchStarting { .. }))
        .await;
    pc.expect(|e| matches!(e, ServerEvent::RoundStart { .. }))
        .await;
}
