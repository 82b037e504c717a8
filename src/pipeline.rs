//! Runs configured stages in order, gating each on its input and timing it.
//!
//! A pipeline config names stages by implementation; implementations come from
//! an explicit [`StageRegistry`], so a misspelled name is caught before any
//! stage runs.

use crate::config::{Credentials, Pacing};
use crate::error::PipelineError;
use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub dataset_name: String,
    #[serde(default = "default_true")]
    pub skip_stage_if_exists: bool,
    pub stages: Vec<StageDescriptor>,
}

impl PipelineConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open pipeline config: {:?}", path))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Pipeline config is not valid: {:?}", path))
    }
}

/// One stage as declared in the config. Paths are relative to the dataset
/// directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: String,
    pub implementation: String,
    #[serde(default)]
    pub input: Option<String>,
    pub output: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub params: Value,
}

/// What a stage reports back when it returns normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    /// The stage could not do its job; later stages still run
    NotRun(String),
}

pub trait Stage {
    /// `input` is `None` for stages that declare no input.
    fn run(
        &mut self,
        input: Option<&Path>,
        output: &Path,
        skip_if_exists: bool,
    ) -> Result<StageStatus>;
}

/// Everything a stage constructor may draw on.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Dataset directory (`<root>/<dataset_name>`)
    pub root_dir: PathBuf,
    pub dataset_name: String,
    pub stage_name: String,
    pub params: Value,
    pub credentials: Credentials,
    pub pacing: Pacing,
}

impl StageContext {
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T, PipelineError> {
        let value = self.params.get(key).ok_or_else(|| PipelineError::InvalidParams {
            stage: self.stage_name.clone(),
            reason: format!("missing '{}'", key),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| PipelineError::InvalidParams {
            stage: self.stage_name.clone(),
            reason: format!("'{}': {}", key, e),
        })
    }

    pub fn param_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, PipelineError> {
        if self.params.get(key).is_some() {
            self.param(key)
        } else {
            Ok(default)
        }
    }

    /// Where a stage keeps scrape namespaces it owns.
    pub fn scrape_dir(&self) -> PathBuf {
        self.root_dir.join("_scrape")
    }
}

pub type StageFactory = Box<dyn Fn(&StageContext) -> Result<Box<dyn Stage>>>;

#[derive(Default)]
pub struct StageRegistry {
    factories: FxHashMap<String, StageFactory>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, implementation: &str, factory: F)
    where
        F: Fn(&StageContext) -> Result<Box<dyn Stage>> + 'static,
    {
        self.factories.insert(implementation.to_string(), Box::new(factory));
    }

    pub fn contains(&self, implementation: &str) -> bool {
        self.factories.contains_key(implementation)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn build(&self, implementation: &str, ctx: &StageContext) -> Result<Box<dyn Stage>> {
        let factory = self
            .factories
            .get(implementation)
            .ok_or_else(|| PipelineError::UnknownStage {
                stage: ctx.stage_name.clone(),
                implementation: implementation.to_string(),
            })?;
        factory(ctx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Success,
    Failed(String),
    MissingInput(PathBuf),
    Disabled,
}

impl StageResult {
    pub fn label(&self) -> &'static str {
        match self {
            StageResult::Success => "Success",
            StageResult::Failed(_) => "Fail",
            StageResult::MissingInput(_) => "Missing input",
            StageResult::Disabled => "Disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub name: String,
    pub implementation: String,
    pub enabled: bool,
    pub result: StageResult,
    pub output: PathBuf,
    /// Only stages that actually ran are timed
    pub elapsed: Option<Duration>,
}

pub struct PipelineRunner<'r> {
    registry: &'r StageRegistry,
    data_dir: PathBuf,
    credentials: Credentials,
    pacing: Pacing,
}

impl<'r> PipelineRunner<'r> {
    pub fn new(registry: &'r StageRegistry, data_dir: impl AsRef<Path>) -> Self {
        Self {
            registry,
            data_dir: data_dir.as_ref().to_path_buf(),
            credentials: Credentials::default(),
            pacing: Pacing::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Rejects duplicate stage names and unknown implementations.
    pub fn validate(&self, config: &PipelineConfig) -> Result<(), PipelineError> {
        let mut names = FxHashSet::default();
        for stage in &config.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::DuplicateStage(stage.name.clone()));
            }
            if !self.registry.contains(&stage.implementation) {
                return Err(PipelineError::UnknownStage {
                    stage: stage.name.clone(),
                    implementation: stage.implementation.clone(),
                });
            }
        }
        Ok(())
    }

    /// Runs every stage in declared order.
    ///
    /// Missing inputs and `NotRun` are recorded and the run continues; an
    /// error from a stage stops the run.
    pub fn run(&self, config: &PipelineConfig) -> Result<Vec<StageReport>> {
        self.validate(config)?;

        let root_dir = self.data_dir.join(&config.dataset_name);
        fs::create_dir_all(&root_dir)
            .with_context(|| format!("Failed to create dataset directory: {:?}", root_dir))?;
        info!(
            dataset = %config.dataset_name,
            stages = config.stages.len(),
            root = ?root_dir,
            "Starting pipeline"
        );

        let mut reports = Vec::with_capacity(config.stages.len());
        for desc in &config.stages {
            let output = root_dir.join(&desc.output);
            let mut report = StageReport {
                name: desc.name.clone(),
                implementation: desc.implementation.clone(),
                enabled: desc.enabled,
                result: StageResult::Disabled,
                output: output.clone(),
                elapsed: None,
            };

            if !desc.enabled {
                info!(stage = %desc.name, "Stage disabled");
                reports.push(report);
                continue;
            }

            info!(stage = %desc.name, implementation = %desc.implementation, "---{}---", desc.name);

            let input = desc.input.as_ref().map(|i| root_dir.join(i));
            if let Some(path) = &input {
                if !path.exists() {
                    warn!(
                        stage = %desc.name,
                        input = ?path,
                        "Input expected but none found; skipping stage"
                    );
                    report.result = StageResult::MissingInput(path.clone());
                    reports.push(report);
                    continue;
                }
            }

            let ctx = StageContext {
                root_dir: root_dir.clone(),
                dataset_name: config.dataset_name.clone(),
                stage_name: desc.name.clone(),
                params: desc.params.clone(),
                credentials: self.credentials.clone(),
                pacing: self.pacing.clone(),
            };
            let mut stage = self.registry.build(&desc.implementation, &ctx)?;

            let started = Instant::now();
            let status = stage
                .run(input.as_deref(), &output, config.skip_stage_if_exists)
                .with_context(|| format!("Stage '{}' failed", desc.name))?;
            report.elapsed = Some(started.elapsed());

            report.result = match status {
                StageStatus::Completed => StageResult::Success,
                StageStatus::NotRun(reason) => {
                    error!(stage = %desc.name, reason = %reason, "Stage could not run");
                    StageResult::Failed(reason)
                }
            };
            reports.push(report);
        }

        Ok(reports)
    }
}

/// Fixed-width summary table of a finished run.
pub fn render_summary(reports: &[StageReport]) -> String {
    let total: f64 = reports.iter().filter_map(|r| r.elapsed).map(|d| d.as_secs_f64()).sum();

    let rows: Vec<[String; 7]> = reports
        .iter()
        .map(|r| {
            let output = r
                .output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (time, share) = match r.elapsed {
                Some(d) => {
                    let secs = d.as_secs_f64();
                    let share = if total > 0.0 { secs / total * 100.0 } else { 0.0 };
                    (format!("{:.2}s", secs), format!("{:.2}%", share))
                }
                None => ("-".to_string(), "-".to_string()),
            };
            [
                r.name.clone(),
                r.implementation.clone(),
                r.enabled.to_string(),
                r.result.label().to_string(),
                output,
                time,
                share,
            ]
        })
        .collect();

    let header = ["name", "implementation", "enabled", "result", "output", "time", "time %"];
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect();
        let _ = writeln!(out, "{}", padded.join("  ").trim_end());
    };
    line(header.to_vec());
    for row in &rows {
        line(row.iter().map(String::as_str).collect());
    }
    out
}
