//! The debugger interface: how a campaign drives the device under test,
//! whether it is a full-system simulator or a board behind a JTAG probe.
//!
//! The orchestrator only ever holds a `Box<dyn Debugger>`; backends differ in
//! which capabilities they support. A simulator can write and restore
//! checkpoints and run for an exact number of cycles, a hardware debugger
//! can halt a live board and poke its registers.

pub mod dummy;
pub mod jtag;
pub mod simics;

use crate::campaign::OutcomeCategory;
use crate::channel::{ChannelError, DeviceChannel};
use crate::checkpoint::{AttributeAccess, CheckpointError};
use crate::config::UpsetConfig;
use crate::worker::CancellationToken;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// A debugger failure. `kind` becomes the outcome of an iteration that
/// fails on it; `raw_output` is what the debugger printed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}")]
pub struct DebuggerError {
    pub kind: String,
    pub raw_output: String,
}

impl DebuggerError {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            raw_output: String::new(),
        }
    }

    pub fn with_output(kind: impl Into<String>, raw_output: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            raw_output: raw_output.into(),
        }
    }

    pub fn unsupported(backend: DebuggerKind, operation: &str) -> Self {
        Self::new(format!("{backend} does not support {operation}"))
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind == "Interrupted"
    }
}

impl From<ChannelError> for DebuggerError {
    fn from(err: ChannelError) -> Self {
        DebuggerError::with_output(err.outcome(), err.output())
    }
}

impl From<CheckpointError> for DebuggerError {
    fn from(err: CheckpointError) -> Self {
        DebuggerError::new(err.to_string())
    }
}

impl From<std::io::Error> for DebuggerError {
    fn from(err: std::io::Error) -> Self {
        DebuggerError::new(format!("Debugger I/O error: {err}"))
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DebuggerKind {
    #[default]
    Simics,
    Jtag,
    Dummy,
}

impl DebuggerKind {
    /// Category of an iteration aborted by a failure of this debugger.
    pub fn error_category(&self) -> OutcomeCategory {
        match self {
            DebuggerKind::Simics => OutcomeCategory::SimicsError,
            DebuggerKind::Jtag | DebuggerKind::Dummy => OutcomeCategory::DebuggerError,
        }
    }
}

impl fmt::Display for DebuggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DebuggerKind::Simics => "Simics",
            DebuggerKind::Jtag => "JTAG",
            DebuggerKind::Dummy => "Dummy",
        })
    }
}

/// A live debugger session. Checkpoint attributes are read and edited
/// through its [`AttributeAccess`] half.
pub trait Debugger: AttributeAccess + Send {
    fn kind(&self) -> DebuggerKind;

    /// Resets the device and waits for it to boot to a prompt.
    fn reset(&mut self) -> Result<(), DebuggerError>;

    /// Last-resort recovery when resets keep failing.
    fn power_cycle(&mut self) -> Result<(), DebuggerError> {
        Err(DebuggerError::unsupported(self.kind(), "power cycling"))
    }

    /// Starts a session, from `checkpoint` when given.
    fn launch(&mut self, checkpoint: Option<&Path>) -> Result<(), DebuggerError>;

    fn halt(&mut self) -> Result<(), DebuggerError>;

    fn resume(&mut self) -> Result<(), DebuggerError>;

    /// Current `(cycles, seconds)` of the device clock.
    fn get_time(&mut self) -> Result<(u64, f64), DebuggerError>;

    /// Runs exactly `cycles` cycles, then stays halted.
    fn run_for(&mut self, cycles: u64) -> Result<(), DebuggerError>;

    fn write_checkpoint(&mut self, path: &Path) -> Result<(), DebuggerError>;

    /// Reads one element of a register of the halted live device.
    fn read_register(
        &mut self,
        _object: &str,
        _register: &str,
        _index: Option<&[usize]>,
    ) -> Result<u64, DebuggerError> {
        Err(DebuggerError::unsupported(self.kind(), "live register reads"))
    }

    fn write_register(
        &mut self,
        _object: &str,
        _register: &str,
        _index: Option<&[usize]>,
        _value: u64,
    ) -> Result<(), DebuggerError> {
        Err(DebuggerError::unsupported(self.kind(), "live register writes"))
    }

    /// The DUT console and, when attached, the AUX console.
    fn channels(
        &mut self,
    ) -> Result<(&mut dyn DeviceChannel, Option<&mut dyn DeviceChannel>), DebuggerError>;

    fn dut(&mut self) -> Result<&mut dyn DeviceChannel, DebuggerError> {
        Ok(self.channels()?.0)
    }

    fn aux(&mut self) -> Result<Option<&mut dyn DeviceChannel>, DebuggerError> {
        Ok(self.channels()?.1)
    }

    /// Drains the transcript of the debugger's own console.
    fn take_output(&mut self) -> String;

    /// Ends the session. Safe to call when nothing is running.
    fn close(&mut self) -> Result<(), DebuggerError>;
}

/// Builds the session selected by `[debugger] backend`.
pub fn from_config(
    config: &UpsetConfig,
    cancel: CancellationToken,
) -> Result<Box<dyn Debugger>, DebuggerError> {
    let missing = |section: &str| DebuggerError::new(format!("Missing [debugger.{section}] section"));
    let use_aux = config.uses_aux();
    match config.debugger.backend {
        DebuggerKind::Simics => {
            let simics = config.debugger.simics.as_ref().ok_or_else(|| missing("simics"))?;
            let settings = simics.settings(&config.channel, use_aux);
            Ok(Box::new(simics::SimicsSession::new(settings, cancel)))
        }
        DebuggerKind::Jtag => {
            let jtag = config.debugger.jtag.as_ref().ok_or_else(|| missing("jtag"))?;
            let settings = jtag
                .settings(&config.channel)
                .map_err(|e| DebuggerError::new(e.to_string()))?;
            Ok(Box::new(jtag::JtagSession::new(settings, cancel)))
        }
        DebuggerKind::Dummy => {
            let dummy = config.debugger.dummy.as_ref().ok_or_else(|| missing("dummy"))?;
            let program = dummy
                .program(&config.campaign)
                .map_err(|e| DebuggerError::new(e.to_string()))?;
            let settings = dummy.settings(&config.channel, use_aux);
            Ok(Box::new(dummy::DummySession::new(program, settings, cancel)?))
        }
    }
}

/// Error for backends that are asked for channels before `launch`.
pub(crate) fn not_connected(kind: DebuggerKind) -> DebuggerError {
    DebuggerError::new(format!("{kind} session is not connected"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn config(backend: &str, extra: &str) -> UpsetConfig {
        toml::from_str(&format!(
            r#"
[campaign]
architecture = "p2020"
mode = "simulated"
command = "./app"

[debugger]
backend = "{backend}"
{extra}
"#
        ))
        .unwrap()
    }

    #[test]
    fn missing_backend_section_is_reported() {
        let err = from_config(&config("simics", ""), CancellationToken::new()).err();
        match err {
            Some(DebuggerError { kind, .. }) => assert_eq!(kind, "Missing [debugger.simics] section"),
            None => panic!("Expected an error for a missing section"),
        }
    }

    #[test]
    fn dummy_backend_is_built_from_config() {
        let config = config(
            "dummy",
            r#"
[debugger.dummy]
total-cycles = 5
prints = { object = "DUT.cpu", register = "r0" }
registers = { "DUT.cpu" = { r0 = 7 } }
"#,
        );
        let mut debugger = from_config(&config, CancellationToken::new()).unwrap();
        assert_eq!(debugger.kind(), DebuggerKind::Dummy);
        debugger.launch(None).unwrap();
        let dut = debugger.dut().unwrap();
        dut.write("./app\n").unwrap();
        let output = dut.read_prompt().unwrap();
        assert!(output.contains("\n7\n"), "Unexpected output {output:?}");
    }

    #[test]
    fn checkpoints_are_read_back_through_the_session() {
        let config = config(
            "dummy",
            r#"
[debugger.dummy]
total-cycles = 5
registers = { "DUT.cpu" = { r0 = 7 } }
"#,
        );
        let mut debugger = from_config(&config, CancellationToken::new()).unwrap();
        debugger.launch(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        debugger.write_checkpoint(dir.path()).unwrap();

        let mut store = debugger.read_checkpoint(dir.path()).unwrap();
        assert_eq!(debugger.get_attr(&store, "DUT.cpu", "r0").unwrap(), &Value::Scalar(7));
        debugger.set_attr(&mut store, "DUT.cpu", "r0", Value::Scalar(8));
        assert_eq!(debugger.get_attr(&store, "DUT.cpu", "r0").unwrap(), &Value::Scalar(8));
        match debugger.get_attr(&store, "DUT.cpu", "r9") {
            Err(CheckpointError::MissingRegister { register, .. }) => assert_eq!(register, "r9"),
            other => panic!("Expected MissingRegister, got {other:?}"),
        }
    }

    #[test]
    fn simulator_errors_map_to_simics_category() {
        assert_eq!(DebuggerKind::Simics.error_category(), OutcomeCategory::SimicsError);
        assert_eq!(DebuggerKind::Jtag.error_category(), OutcomeCategory::DebuggerError);
        let err = DebuggerError::from(ChannelError::Interrupted {
            output: "partial".to_string(),
        });
        assert!(err.is_interrupted());
        assert_eq!(err.raw_output, "partial");
    }
}
