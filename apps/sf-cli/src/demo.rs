//! Bundled demo simulation: PV and battery sizing for one site.
//!
//! Build pulls an hourly load profile and a per-kWp PV yield through the
//! values fetcher and stores them as a table. Runs replay that series with
//! extra PV capacity and a battery and report grid exchange and cost.

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use sf_engine::{
    BuildContext, FetchError, HookResult, Row, RunContext, Simulation, ValuesFetcher,
};
use sf_store::{Column, Table};

pub const KEY: &str = "demo.pv-sizing";
const FETCHER: &str = "load_profile";
const SERIES: &str = "series/hourly.table";
const MAX_SPAN_DAYS: i64 = 366;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub site_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_resolution")]
    pub resolution_minutes: u32,
    #[serde(default)]
    pub existing_pv_kwp: f64,
}

fn default_resolution() -> u32 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteScenario {
    pub site_id: String,
    pub start: DateTime<Utc>,
    pub steps: usize,
    pub existing_pv_kwp: f64,
    pub total_load_kwh: f64,
    pub pv_yield_kwh_per_kwp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingParameters {
    pub add_pv_kwp: f64,
    pub battery_kwh: f64,
    pub import_price: f64,
    pub export_price: f64,
}

impl Default for SizingParameters {
    fn default() -> Self {
        Self {
            add_pv_kwp: 0.0,
            battery_kwh: 0.0,
            import_price: 0.30,
            export_price: 0.08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingOutput {
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub self_consumed_kwh: f64,
    pub self_consumption_ratio: f64,
    pub energy_cost: f64,
}

#[derive(Debug, Default)]
pub struct PvSizing;

impl Simulation for PvSizing {
    type Config = SiteConfig;
    type Scenario = SiteScenario;
    type Parameters = SizingParameters;
    type Output = SizingOutput;

    fn key(&self) -> &str {
        KEY
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn build(&self, config: &SiteConfig, ctx: &mut BuildContext) -> HookResult<SiteScenario> {
        let rows = ctx.fetch(
            FETCHER,
            &json!({
                "site_id": config.site_id,
                "start": config.start,
                "end": config.end,
                "resolution_minutes": config.resolution_minutes,
            }),
        )?;

        let mut timestamps = Vec::with_capacity(rows.len());
        let mut load = Vec::with_capacity(rows.len());
        let mut pv_yield = Vec::with_capacity(rows.len());
        for row in &rows {
            timestamps.push(row_timestamp(row)?);
            load.push(row_number(row, "load_kwh")?);
            pv_yield.push(row_number(row, "pv_kwh_per_kwp")?);
        }

        let table = Table::new(vec![
            Column::timestamp("timestamp", timestamps),
            Column::float("load_kwh", load.clone()),
            Column::float("pv_kwh_per_kwp", pv_yield.clone()),
        ])?;
        ctx.workspace().write_table(SERIES, &table)?;

        let baseline = dispatch(&load, &pv_yield, config.existing_pv_kwp, &SizingParameters::default());
        for (name, value) in metrics(&baseline) {
            ctx.record_metric(name, value);
        }

        let scenario = SiteScenario {
            site_id: config.site_id.clone(),
            start: config.start,
            steps: rows.len(),
            existing_pv_kwp: config.existing_pv_kwp,
            total_load_kwh: load.iter().sum(),
            pv_yield_kwh_per_kwp: pv_yield.iter().sum(),
        };
        ctx.workspace().write_structured("summary.json", &scenario)?;
        Ok(scenario)
    }

    fn run(
        &self,
        scenario: &SiteScenario,
        parameters: &SizingParameters,
        ctx: &RunContext,
    ) -> HookResult<SizingOutput> {
        let table = ctx.workspace().read_table(SERIES)?;
        let load = table.floats("load_kwh")?;
        let pv_yield = table.floats("pv_kwh_per_kwp")?;
        Ok(dispatch(load, pv_yield, scenario.existing_pv_kwp, parameters))
    }

    fn default_parameters(&self) -> Option<SizingParameters> {
        Some(SizingParameters::default())
    }

    fn validate_config(&self, config: &SiteConfig) -> Result<(), String> {
        if config.site_id.trim().is_empty() {
            return Err("site_id must not be empty".to_string());
        }
        if config.end <= config.start {
            return Err("end must be after start".to_string());
        }
        if config.end - config.start > TimeDelta::days(MAX_SPAN_DAYS) {
            return Err(format!("range must not exceed {MAX_SPAN_DAYS} days"));
        }
        if ![15, 30, 60].contains(&config.resolution_minutes) {
            return Err("resolution_minutes must be 15, 30 or 60".to_string());
        }
        if !(config.existing_pv_kwp.is_finite() && config.existing_pv_kwp >= 0.0) {
            return Err("existing_pv_kwp must be a non-negative number".to_string());
        }
        Ok(())
    }

    fn validate_parameters(&self, parameters: &SizingParameters) -> Result<(), String> {
        let fields = [
            ("add_pv_kwp", parameters.add_pv_kwp),
            ("battery_kwh", parameters.battery_kwh),
            ("import_price", parameters.import_price),
            ("export_price", parameters.export_price),
        ];
        match fields.iter().find(|(_, v)| !(v.is_finite() && *v >= 0.0)) {
            Some((name, _)) => Err(format!("{name} must be a non-negative number")),
            None => Ok(()),
        }
    }
}

fn row_number(row: &Row, field: &str) -> Result<f64, FetchError> {
    row.get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| FetchError::Failed {
            fetcher: FETCHER.to_string(),
            message: format!("row without numeric '{field}'"),
        })
}

fn row_timestamp(row: &Row) -> Result<DateTime<Utc>, FetchError> {
    row.get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| FetchError::Failed {
            fetcher: FETCHER.to_string(),
            message: "row without a valid 'timestamp'".to_string(),
        })
}

/// Greedy self-consumption dispatch: PV serves load, surplus charges the
/// battery, the battery covers deficits, the grid takes the rest.
pub fn dispatch(
    load: &[f64],
    pv_yield: &[f64],
    existing_pv_kwp: f64,
    parameters: &SizingParameters,
) -> SizingOutput {
    let pv_kwp = existing_pv_kwp + parameters.add_pv_kwp;
    let mut soc = 0.0_f64;
    let mut grid_import = 0.0;
    let mut grid_export = 0.0;
    let mut self_consumed = 0.0;

    for (&demand, &yield_per_kwp) in load.iter().zip(pv_yield) {
        let pv = yield_per_kwp * pv_kwp;
        let direct = pv.min(demand);
        let mut surplus = pv - direct;
        let mut deficit = demand - direct;

        let charge = surplus.min(parameters.battery_kwh - soc).max(0.0);
        soc += charge;
        surplus -= charge;

        let discharge = deficit.min(soc);
        soc -= discharge;
        deficit -= discharge;

        grid_import += deficit;
        grid_export += surplus;
        self_consumed += direct + discharge;
    }

    let total_load: f64 = load.iter().sum();
    SizingOutput {
        grid_import_kwh: grid_import,
        grid_export_kwh: grid_export,
        self_consumed_kwh: self_consumed,
        self_consumption_ratio: if total_load > 0.0 {
            self_consumed / total_load
        } else {
            0.0
        },
        energy_cost: grid_import * parameters.import_price - grid_export * parameters.export_price,
    }
}

fn metrics(output: &SizingOutput) -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("grid_import_kwh".to_string(), output.grid_import_kwh),
        ("grid_export_kwh".to_string(), output.grid_export_kwh),
        ("self_consumed_kwh".to_string(), output.self_consumed_kwh),
        ("self_consumption_ratio".to_string(), output.self_consumption_ratio),
        ("energy_cost".to_string(), output.energy_cost),
    ])
}

/// Deterministic stand-in for a metering backend.
#[derive(Debug, Default)]
pub struct SyntheticValues;

impl ValuesFetcher for SyntheticValues {
    fn fetch(&self, fetcher: &str, params: &Value) -> Result<Vec<Row>, FetchError> {
        if fetcher != FETCHER {
            return Err(FetchError::UnknownFetcher(fetcher.to_string()));
        }
        let failed = |message: &str| FetchError::Failed {
            fetcher: fetcher.to_string(),
            message: message.to_string(),
        };
        let start: DateTime<Utc> = serde_json::from_value(params["start"].clone())
            .map_err(|_| failed("missing start"))?;
        let end: DateTime<Utc> =
            serde_json::from_value(params["end"].clone()).map_err(|_| failed("missing end"))?;
        let minutes = params["resolution_minutes"].as_i64().unwrap_or(60).max(1);
        let step = TimeDelta::minutes(minutes);
        let scale = minutes as f64 / 60.0;

        let mut rows = Vec::new();
        let mut t = start;
        while t < end {
            let hour = t.hour() as f64 + t.minute() as f64 / 60.0;
            let weekend = t.weekday().number_from_monday() >= 6;
            let mut row = Row::new();
            row.insert("timestamp".into(), json!(t));
            row.insert("load_kwh".into(), json!(load_kw(hour, weekend) * scale));
            row.insert("pv_kwh_per_kwp".into(), json!(pv_kw_per_kwp(hour) * scale));
            rows.push(row);
            t += step;
        }
        Ok(rows)
    }
}

fn load_kw(hour: f64, weekend: bool) -> f64 {
    let base = if weekend { 0.6 } else { 0.4 };
    let morning = (-(hour - 7.5).powi(2) / 2.0).exp() * 0.8;
    let evening = (-(hour - 19.0).powi(2) / 4.0).exp() * 1.4;
    base + morning + evening
}

fn pv_kw_per_kwp(hour: f64) -> f64 {
    if !(6.0..=18.0).contains(&hour) {
        return 0.0;
    }
    (std::f64::consts::PI * (hour - 6.0) / 12.0).sin() * 0.75
}
