//! `weft report costs` — per-workflow cost and duration aggregates.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use weft::{RunFilter, SqliteRunRepository};

use super::CliError;

#[derive(Debug)]
pub struct CostsOptions {
    pub period: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub workflow: Option<String>,
    pub output: Option<PathBuf>,
    pub csv: bool,
}

#[derive(Debug, Default, Serialize)]
struct WorkflowCosts {
    workflow: String,
    runs: usize,
    completed: usize,
    failed: usize,
    total_cost_usd: f64,
    avg_cost_usd: f64,
    total_duration_seconds: f64,
}

/// `7d`, `24h`, `4w` → a window ending now.
fn parse_period(period: &str) -> Result<TimeDelta, CliError> {
    let (number, unit) = period.split_at(period.len().saturating_sub(1));
    let n: i64 = number
        .parse()
        .map_err(|_| CliError::Runtime(format!("bad period `{}` (use e.g. 7d, 24h, 4w)", period)))?;
    match unit {
        "h" => Ok(TimeDelta::hours(n)),
        "d" => Ok(TimeDelta::days(n)),
        "w" => Ok(TimeDelta::weeks(n)),
        _ => Err(CliError::Runtime(format!(
            "bad period unit in `{}` (use h, d, or w)",
            period
        ))),
    }
}

fn parse_date(s: &str, end_of_day: bool) -> Result<DateTime<Utc>, CliError> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| CliError::Runtime(format!("bad date `{}` (use YYYY-MM-DD)", s)))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    let Some(time) = time else {
        return Err(CliError::Runtime(format!("bad date `{}`", s)));
    };
    Ok(time.and_utc())
}

pub async fn costs(options: CostsOptions) -> Result<(), CliError> {
    let mut filter = RunFilter {
        workflow: options.workflow.clone(),
        ..Default::default()
    };
    if let Some(ref period) = options.period {
        filter.since = Some(Utc::now() - parse_period(period)?);
    }
    if let Some(ref start) = options.start {
        filter.since = Some(parse_date(start, false)?);
    }
    if let Some(ref end) = options.end {
        filter.until = Some(parse_date(end, true)?);
    }

    let settings = config::Settings::from_env();
    let repo = SqliteRunRepository::new(&settings.db_path)?;
    let runs = weft::RunRepository::list(&repo, &filter).await?;

    let mut by_workflow: BTreeMap<String, WorkflowCosts> = BTreeMap::new();
    for run in &runs {
        let entry = by_workflow
            .entry(run.workflow_name.clone())
            .or_insert_with(|| WorkflowCosts {
                workflow: run.workflow_name.clone(),
                ..Default::default()
            });
        entry.runs += 1;
        match run.status {
            weft::RunStatus::Completed => entry.completed += 1,
            weft::RunStatus::Failed => entry.failed += 1,
            _ => {}
        }
        entry.total_cost_usd += run.cost_usd.unwrap_or(0.0);
        entry.total_duration_seconds += run.duration_seconds.unwrap_or(0.0);
    }
    let mut rows: Vec<WorkflowCosts> = by_workflow.into_values().collect();
    for row in &mut rows {
        if row.runs > 0 {
            row.avg_cost_usd = row.total_cost_usd / row.runs as f64;
        }
    }

    let rendered = if options.csv {
        let mut out = String::from(
            "workflow,runs,completed,failed,total_cost_usd,avg_cost_usd,total_duration_seconds\n",
        );
        for row in &rows {
            out.push_str(&format!(
                "{},{},{},{},{:.6},{:.6},{:.2}\n",
                row.workflow,
                row.runs,
                row.completed,
                row.failed,
                row.total_cost_usd,
                row.avg_cost_usd,
                row.total_duration_seconds,
            ));
        }
        out
    } else {
        serde_json::to_string_pretty(&rows).map_err(|e| CliError::Runtime(e.to_string()))?
    };

    match options.output {
        Some(path) => std::fs::write(&path, rendered)
            .map_err(|e| CliError::Runtime(format!("write {}: {}", path.display(), e)))?,
        None => println!("{}", rendered),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_parsing() {
        assert_eq!(parse_period("7d").unwrap(), TimeDelta::days(7));
        assert_eq!(parse_period("24h").unwrap(), TimeDelta::hours(24));
        assert_eq!(parse_period("4w").unwrap(), TimeDelta::weeks(4));
        assert!(parse_period("7x").is_err());
        assert!(parse_period("d").is_err());
    }

    #[test]
    fn date_parsing_spans_the_day() {
        let start = parse_date("2026-08-01", false).unwrap();
        let end = parse_date("2026-08-01", true).unwrap();
        assert!(start < end);
        assert_eq!(start.to_rfc3339(), "2026-08-01T00:00:00+00:00");
    }
}
