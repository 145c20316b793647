mod common;

use chrono::TimeDelta;
use serde_json::{Value, json};
use sf_engine::{EngineError, ErrorKind};

use common::{BARE_KEY, Harness, KEY};

fn built(h: &Harness, key: &str, ttl: Option<i64>) -> String {
    h.engine
        .get_or_build_scenario(key, &h.config(), ttl, true)
        .unwrap()
        .scenario_id()
        .to_string()
}

#[test]
fn run_reports_delta_against_baseline_metrics() {
    let h = Harness::new();
    let id = built(&h, KEY, None);

    let outcome = h
        .engine
        .run_simulation(KEY, &id, &json!({"extra_load": 15.0, "export": 10.0}))
        .unwrap();
    assert_eq!(outcome.result["energy"], 65.0);
    assert_eq!(outcome.result["hours"], 24);
    assert_eq!(outcome.baseline.as_ref().unwrap()["energy"], 50.0);

    let delta = outcome.delta.unwrap();
    let energy = delta.get("energy").unwrap();
    assert_eq!(energy.delta, 15.0);
    assert_eq!(energy.percent, Some(30.0));

    let export = delta.get("export").unwrap();
    assert_eq!(export.delta, 10.0);
    assert_eq!(export.percent, None);
}

#[test]
fn run_rejects_foreign_scenario() {
    let h = Harness::new();
    let id = built(&h, KEY, None);
    let err = h
        .engine
        .run_simulation(BARE_KEY, &id, &json!({}))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::SimulationKeyMismatch { ref requested, ref actual, .. }
            if requested == BARE_KEY && actual == KEY
    ));
}

#[test]
fn run_on_missing_or_expired_scenario() {
    let h = Harness::new();
    let err = h
        .engine
        .run_simulation(KEY, "does-not-exist", &json!({}))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScenarioNotFound);

    let id = built(&h, KEY, Some(1));
    h.clock.advance(TimeDelta::hours(2));
    let err = h.engine.run_simulation(KEY, &id, &json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScenarioNotFound);
}

#[test]
fn expired_runs_can_be_allowed() {
    let h = Harness::with_config(|c| c.allow_expired_runs = true);
    let id = built(&h, KEY, Some(1));
    h.clock.advance(TimeDelta::hours(2));
    let outcome = h.engine.run_simulation(KEY, &id, &json!({})).unwrap();
    assert_eq!(outcome.result["energy"], 50.0);
}

#[test]
fn invalid_parameters_are_validation_errors() {
    let h = Harness::new();
    let id = built(&h, KEY, None);

    let err = h
        .engine
        .run_simulation(KEY, &id, &json!({"extra_load": "lots"}))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h
        .engine
        .run_simulation(KEY, &id, &json!({"extra_load": -1.0}))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("non-negative"));
}

#[test]
fn hook_failure_is_a_run_failure() {
    let h = Harness::new();
    let id = built(&h, KEY, None);
    let err = h
        .engine
        .run_simulation(KEY, &id, &json!({"fail": true}))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RunFailed);
}

#[test]
fn missing_artifact_surfaces_as_artifact_not_found() {
    let h = Harness::new();
    let id = built(&h, KEY, None);
    let table = h
        .engine
        .store()
        .layout()
        .artifacts_dir(KEY, &id)
        .join("series/load.table");
    std::fs::remove_file(table).unwrap();

    let err = h.engine.run_simulation(KEY, &id, &json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArtifactNotFound);
}

#[test]
fn inline_run_executes_even_with_zero_ttl() {
    let h = Harness::new();
    let outcome = h
        .engine
        .run_inline(KEY, &h.config(), &json!({"extra_load": 5.0}), Some(0))
        .unwrap();
    assert_eq!(outcome.result["energy"], 55.0);

    let err = h
        .engine
        .run_simulation(KEY, &outcome.scenario_id, &json!({}))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScenarioNotFound);
}

#[test]
fn inline_run_validates_before_building() {
    let h = Harness::new();
    let err = h
        .engine
        .run_inline(KEY, &h.config(), &json!({"extra_load": -5.0}), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.builds(), 0);
}

#[test]
fn sweep_preserves_order_and_counts_failures() {
    let h = Harness::new();
    let id = built(&h, KEY, None);
    let sets: Vec<Value> = vec![
        json!({"extra_load": 1.0, "sleep_ms": 60}),
        json!({"fail": true}),
        json!({"extra_load": 2.0}),
        json!({"extra_load": "bad"}),
        json!({"extra_load": 3.0, "sleep_ms": 30}),
        json!({"extra_load": 4.0}),
    ];

    let report = h.engine.sweep(KEY, &id, &sets, true).unwrap();
    assert_eq!(report.total_runs, 6);
    assert_eq!(report.failed_runs, 2);
    assert_eq!(report.successful_runs, 4);
    assert_eq!(report.baseline.as_ref().unwrap()["energy"], 50.0);
    assert!(report.baseline_error.is_none());

    for (i, entry) in report.results.iter().enumerate() {
        assert_eq!(entry.index, i);
        assert_eq!(entry.parameters, sets[i]);
    }
    let energies: Vec<Option<f64>> = report
        .results
        .iter()
        .map(|e| e.result.as_ref().and_then(|r| r["energy"].as_f64()))
        .collect();
    assert_eq!(
        energies,
        vec![Some(51.0), None, Some(52.0), None, Some(53.0), Some(54.0)]
    );
    assert_eq!(report.results[1].error.as_ref().unwrap().kind, ErrorKind::RunFailed);
    assert_eq!(report.results[3].error.as_ref().unwrap().kind, ErrorKind::Validation);
    assert!(report.results[1].result.is_none());
    assert!(report.results[0].error.is_none());
    assert!(report.results[1].delta.is_none());

    let delta = report.results[5].delta.as_ref().unwrap();
    assert_eq!(delta.get("energy").unwrap().delta, 4.0);
    assert_eq!(delta.get("energy").unwrap().percent, Some(8.0));
    assert!(delta.get("hours").unwrap().delta.abs() < f64::EPSILON);
}

#[test]
fn sweep_without_baseline_has_no_deltas() {
    let h = Harness::new();
    let id = built(&h, KEY, None);
    let report = h
        .engine
        .sweep(KEY, &id, &[json!({"extra_load": 1.0})], false)
        .unwrap();
    assert!(report.baseline.is_none());
    assert!(report.baseline_error.is_none());
    assert!(report.results[0].delta.is_none());
}

#[test]
fn sweep_continues_without_default_parameters() {
    let h = Harness::new();
    let id = built(&h, BARE_KEY, None);
    let report = h
        .engine
        .sweep(BARE_KEY, &id, &[json!({"extra_load": 1.0})], true)
        .unwrap();
    assert!(report.baseline.is_none());
    assert!(report.baseline_error.as_ref().unwrap().contains("default parameters"));
    assert_eq!(report.successful_runs, 1);
    assert!(report.results[0].delta.is_none());
}

#[test]
fn hung_entry_times_out_without_blocking_others() {
    let h = Harness::with_config(|c| c.sweep_entry_timeout_ms = Some(200));
    let id = built(&h, KEY, None);
    let sets = vec![
        json!({"extra_load": 1.0}),
        json!({"sleep_ms": 5000}),
        json!({"extra_load": 2.0}),
    ];

    let started = std::time::Instant::now();
    let report = h.engine.sweep(KEY, &id, &sets, false).unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
    assert_eq!(report.failed_runs, 1);
    assert_eq!(report.results[1].error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert!(report.results[0].is_success());
    assert!(report.results[2].is_success());
}

#[test]
fn sweep_aborts_only_on_scenario_level_errors() {
    let h = Harness::new();
    let err = h
        .engine
        .sweep(KEY, "missing", &[json!({})], true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScenarioNotFound);

    let id = built(&h, KEY, None);
    let err = h
        .engine
        .sweep(BARE_KEY, &id, &[json!({})], true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SimulationKeyMismatch);

    let empty = h.engine.sweep(KEY, &id, &[], true).unwrap();
    assert_eq!(empty.total_runs, 0);
    assert!(empty.baseline.is_some());
}

#[test]
fn sweep_report_serializes() {
    let h = Harness::new();
    let id = built(&h, KEY, None);
    let report = h
        .engine
        .sweep(KEY, &id, &[json!({"fail": true})], true)
        .unwrap();
    let encoded = serde_json::to_value(&report).unwrap();
    assert_eq!(encoded["failed_runs"], 1);
    let entry = &encoded["results"][0];
    assert_eq!(entry["error"]["kind"], "run_failed");
    assert!(entry.get("result").is_none());
    assert!(entry.get("delta").is_none());
    assert_eq!(entry["parameters"], json!({"fail": true}));

    let report = h
        .engine
        .sweep(KEY, &id, &[json!({"extra_load": 5.0})], true)
        .unwrap();
    let entry = &serde_json::to_value(&report).unwrap()["results"][0];
    assert_eq!(entry["result"]["energy"], 55.0);
    assert_eq!(entry["delta"]["energy"]["delta"], 5.0);
    assert!(entry.get("error").is_none());
}

#[test]
fn default_config_bounds_every_sweep_entry() {
    let h = Harness::new();
    assert_eq!(
        h.engine.config().sweep_entry_timeout(),
        Some(std::time::Duration::from_millis(sf_engine::DEFAULT_SWEEP_ENTRY_TIMEOUT_MS))
    );
    let id = built(&h, KEY, None);

    let report = h
        .engine
        .sweep(KEY, &id, &[json!({"sleep_ms": 50}), json!({"extra_load": 1.0})], false)
        .unwrap();
    assert_eq!(report.successful_runs, 2);
}

#[test]
fn hung_entries_do_not_hold_the_sweep_past_their_limits() {
    let h = Harness::with_config(|c| {
        c.sweep_workers = 1;
        c.sweep_entry_timeout_ms = Some(100);
    });
    let id = built(&h, KEY, None);
    let sets: Vec<Value> = (0..6).map(|_| json!({"sleep_ms": 5000})).collect();

    let started = std::time::Instant::now();
    let report = h.engine.sweep(KEY, &id, &sets, false).unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(3));
    assert_eq!(report.failed_runs, 6);
    assert!(
        report
            .results
            .iter()
            .all(|e| e.error.as_ref().unwrap().kind == ErrorKind::Timeout)
    );
}
