//! Daily orchestration: a strictly serial step runner over isolated external
//! processes, per-step log capture, run reports, and the final history upsert.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cadence_core::PipelineConfig;
use cadence_metrics::upsert_history_file;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cadence-sync";

/// One pipeline job: an external command, run from `cwd`, with its combined
/// output captured to a log artifact.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub command: Vec<String>,
    /// A failure here halts the remaining sequence and fails the run.
    pub required: bool,
    /// Prerequisite path; when absent the step is skipped, which lets the
    /// whole pipeline run on a checkout where optional integrations were
    /// never configured.
    pub run_if_exists: Option<PathBuf>,
}

impl Step {
    pub fn new(name: &str, command: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            required: false,
            run_if_exists: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn run_if_exists(mut self, path: impl Into<PathBuf>) -> Self {
        self.run_if_exists = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
}

/// Outcome of one step, as recorded in the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Echoed only when a required step failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

impl StepResult {
    fn skipped(name: &str, reason: String) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Skipped,
            returncode: None,
            started_at: None,
            ended_at: None,
            log_file: None,
            reason: Some(reason),
            error: None,
            required: false,
        }
    }
}

fn stamp(config: &PipelineConfig) -> String {
    Utc::now()
        .with_timezone(&config.home_zone)
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

fn log_path_for(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{}.log", name.to_lowercase().replace(' ', "_")))
}

/// Run one step to completion, writing its log artifact before returning.
///
/// A spawn failure (missing binary, permission error) is captured as a
/// `failed` result, never propagated: a broken optional integration must not
/// take the rest of the run down with it.
pub async fn run_step(
    step: &Step,
    cwd: &Path,
    log_dir: &Path,
    config: &PipelineConfig,
) -> StepResult {
    if let Some(prerequisite) = &step.run_if_exists {
        if !prerequisite.exists() {
            return StepResult::skipped(&step.name, format!("missing {}", prerequisite.display()));
        }
    }

    let started_at = stamp(config);
    let log_path = log_path_for(log_dir, &step.name);
    let rendered_cmd = step.command.join(" ");

    if step.command.is_empty() {
        return StepResult {
            name: step.name.clone(),
            status: StepStatus::Failed,
            returncode: None,
            started_at: Some(started_at.clone()),
            ended_at: Some(stamp(config)),
            log_file: Some(log_path.display().to_string()),
            reason: None,
            error: Some("empty command".to_string()),
            required: step.required,
        };
    }

    let output = tokio::process::Command::new(&step.command[0])
        .args(&step.command[1..])
        .current_dir(cwd)
        .output()
        .await;
    let ended_at = stamp(config);

    match output {
        Ok(output) => {
            let mut log = format!("$ {rendered_cmd}\n\n");
            log.push_str(&String::from_utf8_lossy(&output.stdout));
            if !output.stderr.is_empty() {
                log.push_str("\n--- STDERR ---\n");
                log.push_str(&String::from_utf8_lossy(&output.stderr));
            }
            if let Err(err) = tokio::fs::write(&log_path, log).await {
                warn!(path = %log_path.display(), %err, "failed to write step log");
            }

            let ok = output.status.success();
            StepResult {
                name: step.name.clone(),
                status: if ok { StepStatus::Ok } else { StepStatus::Failed },
                returncode: output.status.code(),
                started_at: Some(started_at),
                ended_at: Some(ended_at),
                log_file: Some(log_path.display().to_string()),
                reason: None,
                error: None,
                required: step.required && !ok,
            }
        }
        Err(err) => {
            let log = format!("$ {rendered_cmd}\n\nSpawn error: {err}\n");
            if let Err(write_err) = tokio::fs::write(&log_path, log).await {
                warn!(path = %log_path.display(), %write_err, "failed to write step log");
            }
            StepResult {
                name: step.name.clone(),
                status: StepStatus::Failed,
                returncode: None,
                started_at: Some(started_at),
                ended_at: Some(ended_at),
                log_file: Some(log_path.display().to_string()),
                reason: None,
                error: Some(err.to_string()),
                required: step.required,
            }
        }
    }
}

// --- step registry ----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct StepSpec {
    name: String,
    command: Vec<String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    run_if_exists: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
struct StepRegistry {
    steps: Vec<StepSpec>,
}

/// Load the step sequence from a `steps.yaml` registry, falling back to the
/// built-in default sequence when the file is absent.
pub fn load_steps(registry_path: &Path, exe: &Path, year: i32) -> Result<Vec<Step>> {
    if !registry_path.exists() {
        return Ok(default_steps(exe, year));
    }
    let text = std::fs::read_to_string(registry_path)
        .with_context(|| format!("reading {}", registry_path.display()))?;
    let registry: StepRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", registry_path.display()))?;
    Ok(registry
        .steps
        .into_iter()
        .map(|spec| Step {
            name: spec.name,
            command: spec.command,
            required: spec.required,
            run_if_exists: spec.run_if_exists,
        })
        .collect())
}

/// The default daily sequence. Collaborator scripts are skipped when not
/// installed; the in-crate shows jobs run through our own binary so every
/// step stays an isolated process.
pub fn default_steps(exe: &Path, year: i32) -> Vec<Step> {
    let exe = exe.display().to_string();
    let year = year.to_string();
    vec![
        Step::new("sugarwod_import", &["python3", "scripts/import_sugarwod_csv.py"])
            .run_if_exists("scripts/import_sugarwod_csv.py"),
        Step::new("fitness_metrics", &["python3", "scripts/fitness_metrics.py"])
            .run_if_exists("scripts/fitness_metrics.py"),
        Step::new(
            "strava_fetch",
            &["python3", "scripts/fetch_strava_activities.py", "--year", &year],
        )
        .run_if_exists("scripts/fetch_strava_activities.py"),
        Step::new(
            "running_metrics",
            &["python3", "scripts/running_metrics.py", "--year", &year],
        )
        .run_if_exists("scripts/running_metrics.py"),
        Step::new("hardcover_fetch", &["python3", "scripts/hardcover_fetch.py"])
            .run_if_exists("scripts/hardcover_fetch.py"),
        Step::new(
            "hardcover_metrics",
            &["python3", "scripts/hardcover_metrics.py", "--year", &year],
        )
        .run_if_exists("scripts/hardcover_metrics.py"),
        Step::new(
            "calendar_export",
            &["python3", "scripts/calendar_export.py", "--year", &year],
        )
        .run_if_exists("scripts/calendar_export.py"),
        Step::new(
            "calendar_metrics",
            &["python3", "scripts/calendar_metrics.py", "--year", &year],
        )
        .run_if_exists("scripts/calendar_metrics.py"),
        Step::new("aeg_events_fetch", &[&exe, "fetch", "aeg"]),
        Step::new("ticketmaster_fetch", &[&exe, "fetch", "ticketmaster"]),
        Step::new("shows_metrics", &[&exe, "shows", "--year", &year]),
        Step::new(
            "spotify_metrics",
            &["python3", "scripts/spotify_metrics.py", "--year", &year],
        )
        .run_if_exists("scripts/spotify_metrics.py"),
    ]
}

// --- run orchestration ------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub date: String,
    pub year: i32,
    pub started_at: String,
    pub finished_at: String,
    pub steps: Vec<StepResult>,
    pub failed_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_path: Option<String>,
}

/// Execute the step sequence serially, then write the run reports and upsert
/// the consolidated history row.
///
/// The sequence halts early only when a `required` step fails. The reports
/// are written in every case, so partial failures stay diagnosable without a
/// re-run. The history upsert happens exactly once, at the very end, and its
/// own failure is logged but can never fail the run.
pub async fn run_daily(
    config: &PipelineConfig,
    steps: Vec<Step>,
    year: i32,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let today = config.today();
    let date = today.format("%Y-%m-%d").to_string();
    let started_at = stamp(config);

    let run_dir = config.run_dir(today);
    tokio::fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let cwd = std::env::current_dir().context("resolving working directory")?;

    let mut results = Vec::with_capacity(steps.len());
    let mut failed_required = false;
    for step in &steps {
        info!(step = %step.name, "running step");
        let result = run_step(step, &cwd, &run_dir, config).await;
        let halt = result.status == StepStatus::Failed && step.required;
        results.push(result);
        if halt {
            warn!(step = %step.name, "required step failed; halting sequence");
            failed_required = true;
            break;
        }
    }

    let mut summary = RunSummary {
        run_id,
        date,
        year,
        started_at,
        finished_at: stamp(config),
        steps: results,
        failed_required,
        history_path: None,
    };

    // Consolidated history row, best effort, never fatal.
    match upsert_history_file(config, today, year) {
        Ok(path) => summary.history_path = Some(path.display().to_string()),
        Err(err) => warn!(%err, "failed to upsert daily history"),
    }

    write_reports(&run_dir, &summary).await?;
    Ok(summary)
}

async fn write_reports(run_dir: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    let json_path = run_dir.join("summary.json");
    tokio::fs::write(&json_path, json)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;

    let md_path = run_dir.join("summary.md");
    tokio::fs::write(&md_path, render_markdown(summary))
        .await
        .with_context(|| format!("writing {}", md_path.display()))?;

    info!(json = %json_path.display(), md = %md_path.display(), "wrote run reports");
    Ok(())
}

/// Human-readable run report with one marker line per attempted step.
pub fn render_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        format!("# Daily Sync — {}", summary.date),
        String::new(),
        format!("- Year: {}", summary.year),
        format!("- Run ID: `{}`", summary.run_id),
        String::new(),
    ];

    for step in &summary.steps {
        match step.status {
            StepStatus::Ok => lines.push(format!(
                "- ✅ {}  (log: {})",
                step.name,
                step.log_file.as_deref().unwrap_or("-")
            )),
            StepStatus::Skipped => lines.push(format!(
                "- ⏭️ {} — skipped ({})",
                step.name,
                step.reason.as_deref().unwrap_or("no reason recorded")
            )),
            StepStatus::Failed => {
                lines.push(format!(
                    "- ❌ {}  (log: {})",
                    step.name,
                    step.log_file.as_deref().unwrap_or("-")
                ));
                if let Some(code) = step.returncode {
                    lines.push(format!("  - returncode: {code}"));
                }
                if let Some(error) = &step.error {
                    lines.push(format!("  - error: {error}"));
                }
            }
        }
    }

    if let Some(history) = &summary.history_path {
        lines.push(String::new());
        lines.push(format!("- History: `{history}`"));
    }
    lines.push(String::new());
    lines.join("\n")
}
