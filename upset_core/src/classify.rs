//! Outcome classification of one iteration.
//!
//! Evidence is gathered into an [`Observation`]; [`classify`] applies the
//! precedence: execution errors (DUT over AUX), then output retrieval
//! errors, then data errors, then latent faults, and finally masked faults.
//! Latent (and, on hardware, masked) results are confirmed by re-running the
//! application, see [`settle`].

use crate::campaign::{Mode, OutcomeCategory};
use crate::comparator::RegisterDiff;
use crate::injector::InjectionSite;
use crate::value::parse_literal;

pub const LATENT_FAULTS: &str = "Latent faults";
pub const MASKED_FAULTS: &str = "Masked faults";
pub const PERSISTENT_FAULTS: &str = "Persistent faults";
pub const DETECTED_DATA_ERROR: &str = "Detected data error";
pub const SILENT_DATA_ERROR: &str = "Silent data error";
pub const MISSING_OUTPUT: &str = "Missing output file";
pub const TRANSFER_ERROR: &str = "Error getting output file";

/// Line prefix the application prints with its own error count.
pub const DETECTED_ERRORS_MARKER: &str = "drseus_detected_errors:";

/// Why the output file could not be checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputError {
    Transfer,
    Missing,
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// Outcome of a failed DUT read.
    pub dut_error: Option<String>,
    /// Outcome of a failed AUX read.
    pub aux_error: Option<String>,
    pub output_error: Option<OutputError>,
    pub detected_errors: Option<u64>,
    /// Similarity of the output file to the gold output, `1.0` when equal.
    pub data_diff: Option<f64>,
    /// Whether the checkpoint comparison found any divergence.
    pub latent_faults: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub outcome: String,
    pub category: OutcomeCategory,
}

impl Classification {
    pub fn new(outcome: impl Into<String>, category: OutcomeCategory) -> Self {
        Self {
            outcome: outcome.into(),
            category,
        }
    }
}

pub fn classify(observation: &Observation) -> Classification {
    if let Some(outcome) = &observation.dut_error {
        return Classification::new(outcome, OutcomeCategory::ExecutionError);
    }
    if let Some(outcome) = &observation.aux_error {
        return Classification::new(outcome, OutcomeCategory::AuxExecutionError);
    }
    match &observation.output_error {
        Some(OutputError::Transfer) => {
            return Classification::new(TRANSFER_ERROR, OutcomeCategory::ScpError);
        }
        Some(OutputError::Missing) => {
            return Classification::new(MISSING_OUTPUT, OutcomeCategory::ScpError);
        }
        Some(OutputError::Other(outcome)) => {
            return Classification::new(outcome, OutcomeCategory::PostExecutionError);
        }
        None => {}
    }
    if observation.detected_errors.is_some_and(|n| n > 0) {
        Classification::new(DETECTED_DATA_ERROR, OutcomeCategory::DataError)
    } else if observation.data_diff.is_some_and(|d| d < 1.0) {
        Classification::new(SILENT_DATA_ERROR, OutcomeCategory::DataError)
    } else if observation.latent_faults {
        Classification::new(LATENT_FAULTS, OutcomeCategory::NoError)
    } else {
        Classification::new(MASKED_FAULTS, OutcomeCategory::NoError)
    }
}

/// Whether `classification` must be confirmed by an uninjected re-run.
pub fn needs_rerun(classification: &Classification, mode: Mode) -> bool {
    classification.outcome == LATENT_FAULTS
        || (mode == Mode::Hardware && classification.outcome == MASKED_FAULTS)
}

/// Final outcome once the re-runs are in. A re-run that was not clean turns
/// the result into a post execution error carrying the re-run's outcome;
/// otherwise latent faults that froze at their injected values are
/// persistent.
pub fn settle(first: Classification, reruns: &[Classification], persistent: bool) -> Classification {
    if let Some(unclean) = reruns.iter().find(|r| r.outcome != MASKED_FAULTS) {
        return Classification::new(unclean.outcome.clone(), OutcomeCategory::PostExecutionError);
    }
    if persistent && first.outcome == LATENT_FAULTS {
        return Classification::new(PERSISTENT_FAULTS, first.category);
    }
    first
}

/// A fault is persistent when there is no memory divergence and every
/// register diff shows exactly the value some injection wrote into that
/// register.
pub fn is_persistent(
    register_diffs: &[RegisterDiff],
    memory_diffs: usize,
    injections: &[InjectionSite],
) -> bool {
    if memory_diffs > 0 {
        return false;
    }
    register_diffs.iter().all(|diff| {
        let monitored = parse_literal(&diff.monitored_value).ok();
        injections.iter().any(|site| {
            site.config_object == diff.config_object
                && site.register_path() == diff.register
                && monitored.is_some()
                && site
                    .injected_value
                    .as_deref()
                    .and_then(|v| parse_literal(v).ok())
                    == monitored
        })
    })
}

/// Error count reported by the application in `output`, if it reported one.
pub fn detected_errors(output: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let position = line.find(DETECTED_ERRORS_MARKER)?;
        line[position + DETECTED_ERRORS_MARKER.len()..]
            .trim()
            .parse()
            .ok()
    })
}

/// Combines the DUT and AUX error counts; a count from either side makes
/// the total known.
pub fn combine_detected_errors(dut: Option<u64>, aux: Option<u64>) -> Option<u64> {
    match (dut, aux) {
        (None, None) => None,
        (dut, aux) => Some(dut.unwrap_or(0) + aux.unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(register: &str, index: Option<Vec<usize>>, injected: &str) -> InjectionSite {
        InjectionSite {
            target: "CPU".to_string(),
            target_index: Some(0),
            config_object: "DUT.cpu[0]".to_string(),
            register: register.to_string(),
            register_index: index,
            field: None,
            bit: 0,
            num_bits: 32,
            gold_value: Some("0x0".to_string()),
            injected_value: Some(injected.to_string()),
        }
    }

    fn diff(register: &str, monitored: &str) -> RegisterDiff {
        RegisterDiff {
            checkpoint: 2,
            config_object: "DUT.cpu[0]".to_string(),
            register: register.to_string(),
            gold_value: "0x0".to_string(),
            monitored_value: monitored.to_string(),
        }
    }

    #[test]
    fn execution_error_dominates_diffs() {
        let observation = Observation {
            dut_error: Some("Kernel error".to_string()),
            aux_error: Some("Hanging".to_string()),
            data_diff: Some(0.5),
            latent_faults: true,
            ..Default::default()
        };
        assert_eq!(
            classify(&observation),
            Classification::new("Kernel error", OutcomeCategory::ExecutionError)
        );
    }

    #[test]
    fn aux_error_applies_when_dut_is_clean() {
        let observation = Observation {
            aux_error: Some("Hanging".to_string()),
            latent_faults: true,
            ..Default::default()
        };
        assert_eq!(classify(&observation).category, OutcomeCategory::AuxExecutionError);
    }

    #[test]
    fn output_errors_precede_data_errors() {
        let mut observation = Observation {
            output_error: Some(OutputError::Missing),
            detected_errors: Some(3),
            ..Default::default()
        };
        assert_eq!(
            classify(&observation),
            Classification::new(MISSING_OUTPUT, OutcomeCategory::ScpError)
        );
        observation.output_error = Some(OutputError::Other("Hanging".to_string()));
        assert_eq!(classify(&observation).category, OutcomeCategory::PostExecutionError);
    }

    #[test]
    fn data_errors_then_latent_then_masked() {
        let mut observation = Observation {
            detected_errors: Some(1),
            data_diff: Some(0.5),
            latent_faults: true,
            ..Default::default()
        };
        assert_eq!(classify(&observation).outcome, DETECTED_DATA_ERROR);
        observation.detected_errors = Some(0);
        assert_eq!(classify(&observation).outcome, SILENT_DATA_ERROR);
        observation.data_diff = Some(1.0);
        assert_eq!(
            classify(&observation),
            Classification::new(LATENT_FAULTS, OutcomeCategory::NoError)
        );
        observation.latent_faults = false;
        assert_eq!(classify(&observation).outcome, MASKED_FAULTS);
    }

    #[test]
    fn rerun_rules_depend_on_mode() {
        let latent = Classification::new(LATENT_FAULTS, OutcomeCategory::NoError);
        let masked = Classification::new(MASKED_FAULTS, OutcomeCategory::NoError);
        assert!(needs_rerun(&latent, Mode::Simulated));
        assert!(!needs_rerun(&masked, Mode::Simulated));
        assert!(needs_rerun(&masked, Mode::Hardware));
    }

    #[test]
    fn unclean_rerun_becomes_post_execution_error() {
        let latent = Classification::new(LATENT_FAULTS, OutcomeCategory::NoError);
        let reruns = [Classification::new("Hanging", OutcomeCategory::ExecutionError)];
        assert_eq!(
            settle(latent.clone(), &reruns, true),
            Classification::new("Hanging", OutcomeCategory::PostExecutionError)
        );
        let clean = [Classification::new(MASKED_FAULTS, OutcomeCategory::NoError)];
        assert_eq!(settle(latent.clone(), &clean, true).outcome, PERSISTENT_FAULTS);
        assert_eq!(settle(latent, &clean, false).outcome, LATENT_FAULTS);
    }

    #[test]
    fn persistence_requires_injected_values_and_no_memory_diffs() {
        let injections = [site("gprs", Some(vec![3]), "0x10")];
        let frozen = [diff("gprs:3", "0x10")];
        assert!(is_persistent(&frozen, 0, &injections));
        assert!(!is_persistent(&frozen, 1, &injections), "Memory diffs force non-persistent");
        let propagated = [diff("gprs:3", "0x10"), diff("pc", "0x4")];
        assert!(!is_persistent(&propagated, 0, &injections));
        let changed = [diff("gprs:3", "0x11")];
        assert!(!is_persistent(&changed, 0, &injections));
    }

    #[test]
    fn detected_errors_are_parsed_and_summed() {
        assert_eq!(detected_errors("run\ndrseus_detected_errors: 4\n# "), Some(4));
        assert_eq!(detected_errors("no marker"), None);
        assert_eq!(combine_detected_errors(Some(2), Some(3)), Some(5));
        assert_eq!(combine_detected_errors(None, Some(1)), Some(1));
        assert_eq!(combine_detected_errors(None, None), None);
    }
}
