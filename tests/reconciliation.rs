//! Integration tests for fleet reconciliation and supervision.
//!
//! These drive the fleet and supervisor against the mock runtime:
//! 1. Reloads converge the process set onto the desired token list
//! 2. Metrics ports stay contiguous from the base port
//! 3. Dead children are restarted, batches shut down within one grace
//!    period

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cloudflared_supervisor::error::SupervisorError;
use cloudflared_supervisor::fleet::{Fleet, FleetConfig};
use cloudflared_supervisor::runtime::MockRuntime;
use cloudflared_supervisor::signals::SignalHandler;
use cloudflared_supervisor::supervisor::Supervisor;
use cloudflared_supervisor::tokens::{Token, TokenSource};

const BASE: u16 = 15300;

fn token(name: &str) -> Token {
    Token::new(name)
}

fn tokens(names: &[&str]) -> Vec<Token> {
    names.iter().map(|n| token(n)).collect()
}

fn test_fleet(runtime: Arc<MockRuntime>) -> Fleet {
    Fleet::new(
        runtime,
        FleetConfig {
            base_port: BASE,
            grace: Duration::from_millis(50),
        },
    )
}

/// Token source that replays a scripted sequence of fetch results.
struct ScriptedSource {
    responses: Mutex<VecDeque<Result<Vec<Token>, SupervisorError>>>,
}

impl ScriptedSource {
    fn new(responses: Vec<Result<Vec<Token>, SupervisorError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl TokenSource for ScriptedSource {
    async fn fetch(&self) -> Result<Vec<Token>, SupervisorError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(SupervisorError::ConfigUnavailable("script exhausted".into()))
            })
    }
}

#[tokio::test]
async fn test_initial_build_assigns_ports_in_fetch_order() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());

    fleet.build(&tokens(&["a", "b", "c"])).await.unwrap();

    assert_eq!(fleet.ports(), vec![BASE, BASE + 1, BASE + 2]);
    assert_eq!(fleet.port_of(&token("a")), Some(BASE));
    assert_eq!(fleet.port_of(&token("b")), Some(BASE + 1));
    assert_eq!(fleet.port_of(&token("c")), Some(BASE + 2));
    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1, BASE + 2]);
}

#[tokio::test]
async fn test_reload_with_equal_set_is_a_no_op() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b", "c"])).await.unwrap();
    assert_eq!(runtime.spawn_count(), 3);

    // Same set, different order: nothing restarts.
    fleet.reconcile(&tokens(&["c", "a", "b"])).await;

    assert_eq!(runtime.spawn_count(), 3);
    assert_eq!(runtime.kill_count(), 0);
    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1, BASE + 2]);
    assert_eq!(fleet.port_of(&token("a")), Some(BASE));
}

#[tokio::test]
async fn test_new_token_takes_lowest_free_port() {
    // [a, b, c] at 15300..15302, reload to [b, c, d]: a is destroyed,
    // b and c keep their ports, d takes the freed 15300.
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b", "c"])).await.unwrap();

    fleet.reconcile(&tokens(&["b", "c", "d"])).await;

    assert_eq!(fleet.port_of(&token("a")), None);
    assert_eq!(fleet.port_of(&token("b")), Some(BASE + 1));
    assert_eq!(fleet.port_of(&token("c")), Some(BASE + 2));
    assert_eq!(fleet.port_of(&token("d")), Some(BASE));
    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1, BASE + 2]);
}

#[tokio::test]
async fn test_scale_down_keeps_in_range_survivor() {
    // [a, b] at 15300, 15301, reload to [a]: b destroyed, a untouched.
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b"])).await.unwrap();
    assert_eq!(runtime.spawn_count(), 2);

    fleet.reconcile(&tokens(&["a"])).await;

    assert_eq!(fleet.len(), 1);
    assert_eq!(fleet.port_of(&token("a")), Some(BASE));
    assert_eq!(runtime.live_ports(), vec![BASE]);
    // a was never respawned.
    assert_eq!(runtime.spawn_count(), 2);
}

#[tokio::test]
async fn test_scale_down_renumbers_out_of_range_survivor() {
    // [a, b, c] at 15300..15302, reload to [c]: the valid range shrinks
    // to [15300, 15301), so c is destroyed and recreated at 15300.
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b", "c"])).await.unwrap();

    fleet.reconcile(&tokens(&["c"])).await;

    assert_eq!(fleet.len(), 1);
    assert_eq!(fleet.port_of(&token("c")), Some(BASE));
    assert_eq!(runtime.live_ports(), vec![BASE]);
    // Never two live processes for the same token.
    assert_eq!(runtime.live_count_for(&token("c")), 1);
    assert_eq!(runtime.spawn_count(), 4);
}

#[tokio::test]
async fn test_ports_stay_contiguous_across_churn() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b", "c", "d"])).await.unwrap();

    for desired in [
        tokens(&["b", "d"]),
        tokens(&["b", "d", "e", "f"]),
        tokens(&["f"]),
        tokens(&["f", "a", "b"]),
    ] {
        fleet.reconcile(&desired).await;

        let expected: Vec<u16> = (BASE..BASE + desired.len() as u16).collect();
        assert_eq!(fleet.ports(), expected, "fleet ports after {desired:?}");
        assert_eq!(runtime.live_ports(), expected, "live ports after {desired:?}");
        for t in &desired {
            assert_eq!(runtime.live_count_for(t), 1, "ownership of {t:?}");
        }
    }
}

#[tokio::test]
async fn test_reconcile_to_empty_destroys_everything() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b"])).await.unwrap();

    fleet.reconcile(&[]).await;

    assert!(fleet.is_empty());
    assert!(runtime.live_ports().is_empty());
}

#[tokio::test]
async fn test_restart_on_death() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b"])).await.unwrap();

    runtime.crash(&token("b"));
    assert_eq!(runtime.live_ports(), vec![BASE]);

    fleet.restart_dead().await;

    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1]);
    assert_eq!(fleet.port_of(&token("b")), Some(BASE + 1));
    // Only the dead record was respawned.
    assert_eq!(runtime.spawn_count(), 3);
}

#[tokio::test]
async fn test_multiple_deaths_handled_in_one_pass() {
    // Three exits, one notification: all three come back.
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b", "c"])).await.unwrap();

    runtime.crash(&token("a"));
    runtime.crash(&token("b"));
    runtime.crash(&token("c"));
    assert!(runtime.live_ports().is_empty());

    fleet.restart_dead().await;

    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1, BASE + 2]);
    assert_eq!(runtime.spawn_count(), 6);
}

#[tokio::test]
async fn test_redundant_death_notification_is_harmless() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b"])).await.unwrap();

    // Nothing actually died.
    fleet.restart_dead().await;

    assert_eq!(runtime.spawn_count(), 2);
    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1]);
}

#[tokio::test(start_paused = true)]
async fn test_batch_shutdown_bounded_by_one_grace_period() {
    // Three processes that all ignore SIGTERM still shut down in about
    // one grace period, not three.
    let grace = Duration::from_secs(5);
    let runtime = Arc::new(MockRuntime::stubborn());
    let mut fleet = Fleet::new(
        runtime.clone(),
        FleetConfig {
            base_port: BASE,
            grace,
        },
    );
    fleet.build(&tokens(&["a", "b", "c"])).await.unwrap();

    let started = tokio::time::Instant::now();
    fleet.shutdown_all().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= grace, "shutdown returned before the deadline");
    assert!(
        elapsed < grace + Duration::from_secs(1),
        "shutdown took {elapsed:?} for a {grace:?} grace period"
    );
    assert_eq!(runtime.kill_count(), 3);
    assert!(runtime.live_ports().is_empty());
    assert!(fleet.is_empty());
}

#[tokio::test]
async fn test_graceful_batch_shutdown_skips_kill() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b"])).await.unwrap();

    fleet.shutdown_all().await;

    assert!(runtime.live_ports().is_empty());
    assert_eq!(runtime.kill_count(), 0);
}

#[tokio::test]
async fn test_spawn_failure_during_reconcile_is_partial() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a", "b"])).await.unwrap();

    // d cannot start; the other changes still go through and d's port
    // stays reserved so the range remains contiguous.
    runtime.deny(&token("d"));
    fleet.reconcile(&tokens(&["b", "d"])).await;

    assert_eq!(fleet.port_of(&token("d")), Some(BASE));
    assert_eq!(fleet.port_of(&token("b")), Some(BASE + 1));
    assert_eq!(fleet.ports(), vec![BASE, BASE + 1]);
    assert_eq!(runtime.live_ports(), vec![BASE + 1]);

    // The next child-exit pass retries the failed token.
    runtime.allow(&token("d"));
    fleet.restart_dead().await;

    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1]);
    assert_eq!(runtime.live_count_for(&token("d")), 1);
}

#[tokio::test]
async fn test_reload_with_unchanged_set_retries_failed_spawn() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a"])).await.unwrap();

    runtime.deny(&token("b"));
    fleet.reconcile(&tokens(&["a", "b"])).await;
    assert_eq!(runtime.live_ports(), vec![BASE]);

    // The token list did not change, but the failed token must still be
    // retried: with no live sibling to die, no SIGCHLD may ever arrive.
    runtime.allow(&token("b"));
    fleet.reconcile(&tokens(&["a", "b"])).await;

    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1]);
    assert_eq!(fleet.port_of(&token("b")), Some(BASE + 1));
    // a was never touched.
    assert_eq!(runtime.live_count_for(&token("a")), 1);
}

#[tokio::test]
async fn test_reload_with_changed_set_retries_failed_spawn() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = test_fleet(runtime.clone());
    fleet.build(&tokens(&["a"])).await.unwrap();

    runtime.deny(&token("b"));
    fleet.reconcile(&tokens(&["a", "b"])).await;

    runtime.allow(&token("b"));
    fleet.reconcile(&tokens(&["a", "b", "c"])).await;

    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1, BASE + 2]);
    assert_eq!(fleet.port_of(&token("b")), Some(BASE + 1));
    assert_eq!(runtime.live_count_for(&token("b")), 1);
}

#[tokio::test]
async fn test_oversized_token_list_is_rejected_on_reload() {
    // Three tokens starting at u16::MAX - 1 would run off the end of the
    // port space; the reload is refused and the fleet stays as it was.
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = Fleet::new(
        runtime.clone(),
        FleetConfig {
            base_port: u16::MAX - 1,
            grace: Duration::from_millis(50),
        },
    );
    fleet.build(&tokens(&["a"])).await.unwrap();
    assert_eq!(fleet.ports(), vec![u16::MAX - 1]);

    fleet.reconcile(&tokens(&["a", "b", "c"])).await;

    assert_eq!(fleet.ports(), vec![u16::MAX - 1]);
    assert_eq!(runtime.live_ports(), vec![u16::MAX - 1]);
    assert_eq!(runtime.spawn_count(), 1);
}

#[tokio::test]
async fn test_oversized_token_list_is_fatal_at_startup() {
    let runtime = Arc::new(MockRuntime::new());
    let mut fleet = Fleet::new(
        runtime.clone(),
        FleetConfig {
            base_port: u16::MAX - 1,
            grace: Duration::from_millis(50),
        },
    );

    let result = fleet.build(&tokens(&["a", "b", "c"])).await;

    assert!(matches!(result, Err(SupervisorError::ConfigUnavailable(_))));
    assert_eq!(runtime.spawn_count(), 0);
}

#[tokio::test]
async fn test_failed_reload_leaves_fleet_untouched() {
    let runtime = Arc::new(MockRuntime::new());
    let source = ScriptedSource::new(vec![
        Ok(tokens(&["a", "b"])),
        Err(SupervisorError::ConfigUnavailable("snapctl down".into())),
        Ok(tokens(&["a"])),
    ]);
    let mut supervisor = Supervisor::new(
        Box::new(source),
        runtime.clone(),
        FleetConfig {
            base_port: BASE,
            grace: Duration::from_millis(50),
        },
    );

    supervisor.start().await.unwrap();
    assert_eq!(supervisor.fleet().ports(), vec![BASE, BASE + 1]);

    // Fetch fails: the fleet is untouched.
    supervisor.reload().await;
    assert_eq!(supervisor.fleet().ports(), vec![BASE, BASE + 1]);
    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1]);

    // Next reload succeeds and converges.
    supervisor.reload().await;
    assert_eq!(supervisor.fleet().ports(), vec![BASE]);
    assert_eq!(runtime.live_ports(), vec![BASE]);
}

#[tokio::test]
async fn test_startup_spawn_failure_is_fatal() {
    let runtime = Arc::new(MockRuntime::failing());
    let source = ScriptedSource::new(vec![Ok(tokens(&["a"]))]);
    let mut supervisor = Supervisor::new(
        Box::new(source),
        runtime,
        FleetConfig {
            base_port: BASE,
            grace: Duration::from_millis(50),
        },
    );

    let result = supervisor.start().await;
    assert!(matches!(result, Err(SupervisorError::SpawnFailure(_))));
}

#[tokio::test]
async fn test_run_shuts_fleet_down_when_startup_fails_midway() {
    // Two tokens, the second cannot spawn: startup fails, and the one
    // process that did start is torn down on the way out.
    let runtime = Arc::new(MockRuntime::new());
    runtime.deny(&token("b"));
    let source = ScriptedSource::new(vec![Ok(tokens(&["a", "b"]))]);
    let mut supervisor = Supervisor::new(
        Box::new(source),
        runtime.clone(),
        FleetConfig {
            base_port: BASE,
            grace: Duration::from_millis(50),
        },
    );

    let mut signals = SignalHandler::new().unwrap();
    let result = supervisor.run(&mut signals).await;

    assert!(matches!(result, Err(SupervisorError::SpawnFailure(_))));
    assert!(runtime.live_ports().is_empty());
}

#[tokio::test]
async fn test_child_exit_pass_via_supervisor() {
    let runtime = Arc::new(MockRuntime::new());
    let source = ScriptedSource::new(vec![Ok(tokens(&["a", "b"]))]);
    let mut supervisor = Supervisor::new(
        Box::new(source),
        runtime.clone(),
        FleetConfig {
            base_port: BASE,
            grace: Duration::from_millis(50),
        },
    );

    supervisor.start().await.unwrap();
    runtime.crash(&token("a"));

    supervisor.handle_child_exit().await;

    assert_eq!(runtime.live_ports(), vec![BASE, BASE + 1]);
    assert_eq!(runtime.spawn_count(), 3);
}
