mod common;

use chrono::TimeDelta;
use serde_json::json;
use sf_engine::{BuildOrigin, ErrorKind};

use common::{CounterSim, Harness, KEY, engine_at};

#[test]
fn reuse_returns_same_scenario_without_rebuilding() {
    let h = Harness::new();
    let first = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), Some(1), true)
        .unwrap();
    assert_eq!(first.origin, BuildOrigin::Built);

    let second = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), Some(1), true)
        .unwrap();
    assert!(second.reused());
    assert_eq!(second.scenario_id(), first.scenario_id());
    assert_eq!(h.builds(), 1);
}

#[test]
fn no_reuse_always_builds_fresh() {
    let h = Harness::new();
    let first = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), None, true)
        .unwrap();
    let second = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), None, false)
        .unwrap();
    assert_eq!(second.origin, BuildOrigin::Built);
    assert_ne!(second.scenario_id(), first.scenario_id());
    assert_eq!(second.record.config_hash, first.record.config_hash);
    assert_eq!(h.builds(), 2);
}

#[test]
fn non_positive_ttl_is_never_reused() {
    let h = Harness::new();
    for ttl in [0, -3] {
        let first = h
            .engine
            .get_or_build_scenario(KEY, &h.config(), Some(ttl), true)
            .unwrap();
        let second = h
            .engine
            .get_or_build_scenario(KEY, &h.config(), Some(ttl), true)
            .unwrap();
        assert_ne!(first.scenario_id(), second.scenario_id());
        assert_eq!(first.record.expires_at, first.record.created_at);
    }
    assert_eq!(h.builds(), 4);
}

#[test]
fn scenario_expires_after_ttl() {
    let h = Harness::new();
    let built = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), Some(1), true)
        .unwrap();
    assert_eq!(built.record.created_at, common::t0());

    h.clock.advance(TimeDelta::minutes(30));
    let reused = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), Some(1), true)
        .unwrap();
    assert_eq!(reused.scenario_id(), built.scenario_id());
    assert_eq!(h.builds(), 1);

    h.clock.advance(TimeDelta::minutes(90));
    let rebuilt = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), Some(1), true)
        .unwrap();
    assert_eq!(rebuilt.origin, BuildOrigin::Built);
    assert_ne!(rebuilt.scenario_id(), built.scenario_id());
    assert_eq!(h.builds(), 2);
}

#[test]
fn default_ttl_applies_when_omitted() {
    let h = Harness::with_config(|c| c.default_ttl_hours = 6);
    let built = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), None, true)
        .unwrap();
    assert_eq!(built.record.ttl_hours, 6);
    assert_eq!(
        built.record.expires_at,
        built.record.created_at + TimeDelta::hours(6)
    );
}

#[test]
fn equivalent_configs_share_a_scenario() {
    let h = Harness::new();
    let a = h
        .engine
        .get_or_build_scenario(
            KEY,
            &json!({"entity": "x", "start": "2024-01-01T01:00:00+01:00", "base_load": 50}),
            None,
            true,
        )
        .unwrap();
    let b = h
        .engine
        .get_or_build_scenario(
            KEY,
            &json!({"base_load": 50.0, "start": "2024-01-01T00:00:00Z", "entity": "x"}),
            None,
            true,
        )
        .unwrap();
    assert_eq!(a.scenario_id(), b.scenario_id());
    assert_eq!(h.builds(), 1);

    let c = h
        .engine
        .get_or_build_scenario(KEY, &json!({"entity": "y"}), None, true)
        .unwrap();
    assert_ne!(c.scenario_id(), a.scenario_id());
    assert_ne!(c.record.config_hash, a.record.config_hash);
}

#[test]
fn build_records_manifest_and_metrics() {
    let h = Harness::new();
    let built = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), None, true)
        .unwrap();
    assert_eq!(
        built.record.artifacts,
        vec!["inputs.json".to_string(), "series/load.table".to_string()]
    );
    assert_eq!(built.record.baseline_metrics["energy"], 50.0);

    let workspace = h.engine.store().workspace(built.scenario_id()).unwrap();
    assert!(workspace.is_sealed());
    assert_eq!(workspace.read_table("series/load.table").unwrap().num_rows(), 24);
}

#[test]
fn unknown_simulation_and_invalid_config() {
    let h = Harness::new();
    let err = h
        .engine
        .get_or_build_scenario("nope", &h.config(), None, true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SimulationNotFound);
    assert!(err.to_string().contains(KEY));

    let err = h
        .engine
        .get_or_build_scenario(KEY, &json!({"start": "2024-01-01"}), None, true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.builds(), 0);
}

#[test]
fn scenarios_survive_restart() {
    let h = Harness::new();
    let built = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), Some(4), true)
        .unwrap();

    let sim = CounterSim::new(KEY);
    let builds = std::sync::Arc::clone(&sim.builds);
    let restarted = engine_at(&h.dir, &h.clock, sim, |_| {});
    let again = restarted
        .get_or_build_scenario(KEY, &h.config(), Some(4), true)
        .unwrap();
    assert!(again.reused());
    assert_eq!(again.scenario_id(), built.scenario_id());
    assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn new_simulation_version_does_not_reuse() {
    let h = Harness::new();
    let built = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), Some(4), true)
        .unwrap();

    let mut sim = CounterSim::new(KEY);
    sim.version = "2.0.0";
    let upgraded = engine_at(&h.dir, &h.clock, sim, |_| {});
    let rebuilt = upgraded
        .get_or_build_scenario(KEY, &h.config(), Some(4), true)
        .unwrap();
    assert_eq!(rebuilt.origin, BuildOrigin::Built);
    assert_ne!(rebuilt.scenario_id(), built.scenario_id());
    assert_eq!(rebuilt.record.simulation_version, "2.0.0");
}

#[test]
fn reuse_skips_newer_records_of_another_version() {
    let h = Harness::new();
    let original = h
        .engine
        .get_or_build_scenario(KEY, &h.config(), Some(4), true)
        .unwrap();

    h.clock.advance(TimeDelta::minutes(5));
    let mut sim = CounterSim::new(KEY);
    sim.version = "2.0.0";
    let upgraded = engine_at(&h.dir, &h.clock, sim, |_| {});
    let newer = upgraded
        .get_or_build_scenario(KEY, &h.config(), Some(4), true)
        .unwrap();
    assert_eq!(newer.origin, BuildOrigin::Built);

    // Rolled back: the older record built by this version is still live.
    let rolled_back = engine_at(&h.dir, &h.clock, CounterSim::new(KEY), |_| {});
    let reused = rolled_back
        .get_or_build_scenario(KEY, &h.config(), Some(4), true)
        .unwrap();
    assert_eq!(reused.origin, BuildOrigin::Reused);
    assert_eq!(reused.scenario_id(), original.scenario_id());
    assert_eq!(reused.record.simulation_version, "1.0.0");
}
