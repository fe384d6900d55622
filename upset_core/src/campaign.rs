//! Persisted records of a campaign: the campaign itself, one result per
//! iteration, and the injections, diffs and events attached to a result.

use crate::comparator::{MemoryDiff, RegisterDiff};
use crate::injector::InjectionSite;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome recorded for a result until the iteration is classified.
pub const IN_PROGRESS: &str = "In progress";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Faults are injected into simulator checkpoints.
    Simulated,
    /// Faults are injected into a live board through a hardware debugger.
    Hardware,
}

/// Coarse classification of an iteration. Serialized as the display string.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeCategory {
    #[serde(rename = "Incomplete")]
    Incomplete,
    #[serde(rename = "No error")]
    NoError,
    #[serde(rename = "Execution error")]
    ExecutionError,
    #[serde(rename = "AUX execution error")]
    AuxExecutionError,
    #[serde(rename = "Post execution error")]
    PostExecutionError,
    #[serde(rename = "SCP error")]
    ScpError,
    #[serde(rename = "Data error")]
    DataError,
    #[serde(rename = "Simics error")]
    SimicsError,
    #[serde(rename = "Debugger error")]
    DebuggerError,
    #[serde(rename = "Supervisor")]
    Supervisor,
    #[serde(rename = "Injector")]
    Injector,
}

impl OutcomeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCategory::Incomplete => "Incomplete",
            OutcomeCategory::NoError => "No error",
            OutcomeCategory::ExecutionError => "Execution error",
            OutcomeCategory::AuxExecutionError => "AUX execution error",
            OutcomeCategory::PostExecutionError => "Post execution error",
            OutcomeCategory::ScpError => "SCP error",
            OutcomeCategory::DataError => "Data error",
            OutcomeCategory::SimicsError => "Simics error",
            OutcomeCategory::DebuggerError => "Debugger error",
            OutcomeCategory::Supervisor => "Supervisor",
            OutcomeCategory::Injector => "Injector",
        }
    }
}

impl fmt::Display for OutcomeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Campaign {
    pub id: u64,
    pub architecture: String,
    pub mode: Mode,
    pub command: String,
    pub aux_command: Option<String>,
    pub use_aux: bool,
    pub output_file: Option<String>,
    pub aux_output_file: bool,
    pub log_files: Vec<String>,
    pub aux_log_files: Vec<String>,
    pub caches: bool,
    /// Average wall-clock seconds of one application run.
    pub execution_time: f64,
    /// Average simulated cycles of one application run.
    pub cycles: u64,
    pub start_cycle: u64,
    pub start_time: f64,
    pub num_checkpoints: u32,
    pub cycles_between: u64,
    pub dut_output: String,
    pub aux_output: String,
    pub debugger_output: String,
    pub timestamp_ms: u64,
}

impl Campaign {
    pub fn new(architecture: &str, mode: Mode, command: &str) -> Self {
        Self {
            id: 0,
            architecture: architecture.to_string(),
            mode,
            command: command.to_string(),
            aux_command: None,
            use_aux: false,
            output_file: None,
            aux_output_file: false,
            log_files: Vec::new(),
            aux_log_files: Vec::new(),
            caches: false,
            execution_time: 0.0,
            cycles: 0,
            start_cycle: 0,
            start_time: 0.0,
            num_checkpoints: 0,
            cycles_between: 0,
            dut_output: String::new(),
            aux_output: String::new(),
            debugger_output: String::new(),
            timestamp_ms: now_ms(),
        }
    }
}

/// One iteration of a campaign.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub id: u64,
    pub campaign_id: u64,
    pub iteration: Option<u64>,
    pub outcome: String,
    pub outcome_category: OutcomeCategory,
    pub num_injections: u32,
    pub num_register_diffs: usize,
    pub num_memory_diffs: usize,
    pub data_diff: Option<f64>,
    pub detected_errors: Option<u64>,
    pub execution_time: Option<f64>,
    pub cycles: Option<u64>,
    pub dut_output: String,
    pub aux_output: String,
    pub debugger_output: String,
    pub timestamp_ms: u64,
}

impl ResultRecord {
    /// A fresh placeholder for an iteration that has not run yet.
    pub fn placeholder(campaign_id: u64) -> Self {
        Self {
            id: 0,
            campaign_id,
            iteration: None,
            outcome: IN_PROGRESS.to_string(),
            outcome_category: OutcomeCategory::Incomplete,
            num_injections: 0,
            num_register_diffs: 0,
            num_memory_diffs: 0,
            data_diff: None,
            detected_errors: None,
            execution_time: None,
            cycles: None,
            dut_output: String::new(),
            aux_output: String::new(),
            debugger_output: String::new(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.outcome == IN_PROGRESS
    }

    pub fn set_outcome(&mut self, outcome: impl Into<String>, category: OutcomeCategory) {
        self.outcome = outcome.into();
        self.outcome_category = category;
    }

    pub fn has_output(&self) -> bool {
        !self.dut_output.is_empty() || !self.aux_output.is_empty() || !self.debugger_output.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InjectionRecord {
    pub id: u64,
    pub result_id: u64,
    pub injection_number: u32,
    /// Checkpoint the fault was injected into (simulated mode).
    pub checkpoint_number: Option<u32>,
    /// Seconds into the run the fault was injected (hardware mode).
    pub time: Option<f64>,
    pub site: Option<InjectionSite>,
    pub success: bool,
    pub timestamp_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RegisterDiffRecord {
    pub id: u64,
    pub result_id: u64,
    pub diff: RegisterDiff,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MemoryDiffRecord {
    pub id: u64,
    pub result_id: u64,
    pub diff: MemoryDiff,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: u64,
    pub campaign_id: u64,
    pub result_id: Option<u64>,
    pub level: EventLevel,
    /// Component that raised the event, e.g. `DUT` or `Debugger`.
    pub source: String,
    pub kind: String,
    pub description: Option<String>,
    pub success: Option<bool>,
    pub timestamp_ms: u64,
}

impl EventRecord {
    pub fn new(campaign_id: u64, result_id: Option<u64>, level: EventLevel, source: &str, kind: &str) -> Self {
        Self {
            id: 0,
            campaign_id,
            result_id,
            level,
            source: source.to_string(),
            kind: kind.to_string(),
            description: None,
            success: None,
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }
}

/// Directory layout of a campaign's on-disk artifacts.
///
/// ```text
/// <root>/gold-checkpoints/<campaign>/<n>
/// <root>/injected-checkpoints/<campaign>/<result>/<n>_injected
/// <root>/injected-checkpoints/<campaign>/<result>/<n>
/// <root>/campaign-data/<campaign>/gold/
/// <root>/campaign-data/<campaign>/results/<result>/
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    campaign_id: u64,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, campaign_id: u64) -> Self {
        Self {
            root: root.into(),
            campaign_id,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn gold_checkpoints(&self) -> PathBuf {
        self.root
            .join("gold-checkpoints")
            .join(self.campaign_id.to_string())
    }

    pub fn gold_checkpoint(&self, checkpoint: u32) -> PathBuf {
        self.gold_checkpoints().join(checkpoint.to_string())
    }

    pub fn injected_checkpoints(&self, result_id: u64) -> PathBuf {
        self.root
            .join("injected-checkpoints")
            .join(self.campaign_id.to_string())
            .join(result_id.to_string())
    }

    pub fn injected_checkpoint(&self, result_id: u64, checkpoint: u32) -> PathBuf {
        self.injected_checkpoints(result_id)
            .join(format!("{checkpoint}_injected"))
    }

    pub fn monitored_checkpoint(&self, result_id: u64, checkpoint: u32) -> PathBuf {
        self.injected_checkpoints(result_id)
            .join(checkpoint.to_string())
    }

    pub fn campaign_data(&self) -> PathBuf {
        self.root
            .join("campaign-data")
            .join(self.campaign_id.to_string())
    }

    pub fn gold_data(&self) -> PathBuf {
        self.campaign_data().join("gold")
    }

    pub fn result_data(&self, result_id: u64) -> PathBuf {
        self.campaign_data()
            .join("results")
            .join(result_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_category_serializes_as_display_string() {
        for category in [
            OutcomeCategory::NoError,
            OutcomeCategory::AuxExecutionError,
            OutcomeCategory::ScpError,
            OutcomeCategory::SimicsError,
        ] {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category));
        }
    }

    #[test]
    fn placeholder_starts_incomplete_and_in_progress() {
        let result = ResultRecord::placeholder(3);
        assert!(result.is_in_progress());
        assert_eq!(result.outcome_category, OutcomeCategory::Incomplete);
        assert!(!result.has_output());
    }

    #[test]
    fn workspace_layout_is_scoped_by_campaign_and_result() {
        let workspace = Workspace::new("/tmp/ws", 7);
        assert_eq!(
            workspace.gold_checkpoint(3),
            PathBuf::from("/tmp/ws/gold-checkpoints/7/3")
        );
        assert_eq!(
            workspace.injected_checkpoint(12, 3),
            PathBuf::from("/tmp/ws/injected-checkpoints/7/12/3_injected")
        );
        assert_eq!(
            workspace.monitored_checkpoint(12, 4),
            PathBuf::from("/tmp/ws/injected-checkpoints/7/12/4")
        );
        assert_eq!(
            workspace.result_data(12),
            PathBuf::from("/tmp/ws/campaign-data/7/results/12")
        );
    }
}
