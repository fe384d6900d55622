//! Hardware targets behind a JTAG probe.
//!
//! The probe is driven over a line-oriented control console (usually a TCP
//! telnet port of the probe server). Commands are templates so one backend
//! covers different probe grammars; the placeholders are `{object}`,
//! `{register}`, `{index}` (indices joined by `_`), `{path}` (the register
//! path, `reg:i:j`) and `{value}`.

use super::{Debugger, DebuggerError, DebuggerKind, not_connected};
use crate::channel::{ChannelSettings, DeviceChannel, ScpTransfer, SignatureSet, StreamChannel};
use crate::checkpoint::AttributeAccess;
use crate::injector::register_path;
use crate::value::{format_hex, parse_literal};
use crate::worker::CancellationToken;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEndpoint {
    Serial(PathBuf),
    Tcp(String),
}

#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
    pub endpoint: ConsoleEndpoint,
    pub prompt: String,
    pub timeout: Duration,
    pub scp: Option<ScpTransfer>,
}

#[derive(Debug, Clone)]
pub struct JtagSettings {
    pub control_address: String,
    pub prompt: String,
    pub timeout: Duration,
    pub reset_command: String,
    pub halt_command: String,
    pub resume_command: String,
    pub read_register_command: String,
    pub write_register_command: String,
    /// Local shell command that power cycles the board.
    pub power_cycle_command: Option<String>,
    pub boot_timeout: Duration,
    pub dut: DeviceEndpoint,
    pub aux: Option<DeviceEndpoint>,
}

impl JtagSettings {
    pub fn new(control_address: &str, dut: DeviceEndpoint) -> Self {
        Self {
            control_address: control_address.to_string(),
            prompt: "> ".to_string(),
            timeout: Duration::from_secs(30),
            reset_command: "reset".to_string(),
            halt_command: "halt".to_string(),
            resume_command: "resume".to_string(),
            read_register_command: "rd {object} {path}".to_string(),
            write_register_command: "rm {object} {path} {value}".to_string(),
            power_cycle_command: None,
            boot_timeout: Duration::from_secs(300),
            dut,
            aux: None,
        }
    }
}

struct Placeholders<'a> {
    object: &'a str,
    register: &'a str,
    index: Option<&'a [usize]>,
    value: Option<u64>,
}

fn render(template: &str, p: &Placeholders<'_>) -> String {
    let index = p
        .index
        .map(|i| i.iter().map(|n| n.to_string()).collect::<Vec<_>>().join("_"))
        .unwrap_or_default();
    template
        .replace("{object}", p.object)
        .replace("{register}", p.register)
        .replace("{index}", &index)
        .replace("{path}", &register_path(p.register, p.index))
        .replace("{value}", &p.value.map(format_hex).unwrap_or_default())
}

/// The register value in a probe reply: the last token that parses as a
/// numeric literal, ignoring the echoed command line.
pub fn parse_register_reply(command: &str, reply: &str) -> Option<u64> {
    reply
        .lines()
        .filter(|line| line.trim() != command.trim())
        .flat_map(str::split_whitespace)
        .filter_map(|token| parse_literal(token.trim_end_matches([',', ';'])).ok())
        .last()
}

pub struct JtagSession {
    settings: JtagSettings,
    cancel: CancellationToken,
    control: Option<Box<dyn DeviceChannel>>,
    dut: Option<Box<dyn DeviceChannel>>,
    aux: Option<Box<dyn DeviceChannel>>,
    transcript: String,
}

impl JtagSession {
    pub fn new(settings: JtagSettings, cancel: CancellationToken) -> Self {
        Self {
            settings,
            cancel,
            control: None,
            dut: None,
            aux: None,
            transcript: String::new(),
        }
    }

    /// A session over already open channels.
    pub fn with_channels(
        settings: JtagSettings,
        control: Box<dyn DeviceChannel>,
        dut: Box<dyn DeviceChannel>,
        aux: Option<Box<dyn DeviceChannel>>,
    ) -> Self {
        Self {
            settings,
            cancel: CancellationToken::new(),
            control: Some(control),
            dut: Some(dut),
            aux,
            transcript: String::new(),
        }
    }

    fn open_device(
        &self,
        name: &str,
        device: &DeviceEndpoint,
    ) -> Result<Box<dyn DeviceChannel>, DebuggerError> {
        let settings = ChannelSettings {
            name: name.to_string(),
            prompt: device.prompt.clone(),
            timeout: device.timeout,
            signatures: SignatureSet::device(),
        };
        let mut channel = match &device.endpoint {
            ConsoleEndpoint::Serial(path) => StreamChannel::open_device(settings, path)?,
            ConsoleEndpoint::Tcp(address) => StreamChannel::connect_tcp(settings, address)?,
        }
        .with_cancellation(self.cancel.clone());
        if let Some(scp) = &device.scp {
            channel = channel.with_transfer(Box::new(scp.clone()));
        }
        Ok(Box::new(channel))
    }

    fn connect(&mut self) -> Result<(), DebuggerError> {
        if self.control.is_none() {
            let settings = ChannelSettings {
                name: "JTAG".to_string(),
                prompt: self.settings.prompt.clone(),
                timeout: self.settings.timeout,
                signatures: SignatureSet::default(),
            };
            let mut control = StreamChannel::connect_tcp(settings, &self.settings.control_address)?
                .with_cancellation(self.cancel.clone());
            let banner = control.read_prompt()?;
            self.transcript.push_str(&banner);
            self.control = Some(Box::new(control));
        }
        if self.dut.is_none() {
            self.dut = Some(self.open_device("DUT", &self.settings.dut)?);
        }
        if self.aux.is_none() {
            if let Some(aux) = &self.settings.aux {
                self.aux = Some(self.open_device("AUX", aux)?);
            }
        }
        Ok(())
    }

    fn command(&mut self, command: &str) -> Result<String, DebuggerError> {
        let control = self
            .control
            .as_mut()
            .ok_or_else(|| not_connected(DebuggerKind::Jtag))?;
        self.transcript.push_str(command);
        self.transcript.push('\n');
        let reply = control.command(command);
        match &reply {
            Ok(text) => self.transcript.push_str(text),
            Err(err) => self.transcript.push_str(err.output()),
        }
        let text = reply?;
        let prompt = &self.settings.prompt;
        Ok(text.strip_suffix(prompt.as_str()).unwrap_or(&text).to_string())
    }

    fn wait_for_boot(&mut self) -> Result<(), DebuggerError> {
        let timeout = self.settings.boot_timeout;
        let dut = self
            .dut
            .as_mut()
            .ok_or_else(|| not_connected(DebuggerKind::Jtag))?;
        let prompt = dut.prompt().to_string();
        dut.read_until(&prompt, timeout)?;
        if let Some(aux) = self.aux.as_mut() {
            let prompt = aux.prompt().to_string();
            aux.read_until(&prompt, timeout)?;
        }
        Ok(())
    }
}

impl AttributeAccess for JtagSession {}

impl Debugger for JtagSession {
    fn kind(&self) -> DebuggerKind {
        DebuggerKind::Jtag
    }

    fn reset(&mut self) -> Result<(), DebuggerError> {
        self.connect()?;
        let command = self.settings.reset_command.clone();
        self.command(&command)?;
        self.wait_for_boot()
    }

    fn power_cycle(&mut self) -> Result<(), DebuggerError> {
        let Some(command) = self.settings.power_cycle_command.clone() else {
            return Err(DebuggerError::unsupported(self.kind(), "power cycling"));
        };
        warn!("Power cycling DUT");
        self.transcript.push_str(&format!("! {command}\n"));
        let output = Command::new("sh").arg("-c").arg(&command).output()?;
        if !output.status.success() {
            return Err(DebuggerError::with_output(
                "Error power cycling DUT",
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        self.connect()?;
        self.wait_for_boot()
    }

    fn launch(&mut self, checkpoint: Option<&Path>) -> Result<(), DebuggerError> {
        if checkpoint.is_some() {
            return Err(DebuggerError::unsupported(self.kind(), "checkpoints"));
        }
        self.connect()?;
        info!("Connected to JTAG probe at {}", self.settings.control_address);
        Ok(())
    }

    fn halt(&mut self) -> Result<(), DebuggerError> {
        let command = self.settings.halt_command.clone();
        self.command(&command)?;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DebuggerError> {
        let command = self.settings.resume_command.clone();
        self.command(&command)?;
        Ok(())
    }

    /// Hardware runs are timed on the DUT channel, not on a device clock.
    fn get_time(&mut self) -> Result<(u64, f64), DebuggerError> {
        Err(DebuggerError::unsupported(self.kind(), "cycle counting"))
    }

    fn run_for(&mut self, _cycles: u64) -> Result<(), DebuggerError> {
        Err(DebuggerError::unsupported(self.kind(), "running for a cycle count"))
    }

    fn write_checkpoint(&mut self, _path: &Path) -> Result<(), DebuggerError> {
        Err(DebuggerError::unsupported(self.kind(), "checkpoints"))
    }

    fn read_register(
        &mut self,
        object: &str,
        register: &str,
        index: Option<&[usize]>,
    ) -> Result<u64, DebuggerError> {
        let command = render(
            &self.settings.read_register_command,
            &Placeholders {
                object,
                register,
                index,
                value: None,
            },
        );
        let reply = self.command(&command)?;
        parse_register_reply(&command, &reply).ok_or_else(|| {
            DebuggerError::with_output(
                format!("Error reading register {}", register_path(register, index)),
                reply,
            )
        })
    }

    fn write_register(
        &mut self,
        object: &str,
        register: &str,
        index: Option<&[usize]>,
        value: u64,
    ) -> Result<(), DebuggerError> {
        let command = render(
            &self.settings.write_register_command,
            &Placeholders {
                object,
                register,
                index,
                value: Some(value),
            },
        );
        let reply = self.command(&command)?;
        if reply.to_lowercase().contains("error") {
            return Err(DebuggerError::with_output(
                format!("Error writing register {}", register_path(register, index)),
                reply,
            ));
        }
        Ok(())
    }

    fn channels(
        &mut self,
    ) -> Result<(&mut dyn DeviceChannel, Option<&mut dyn DeviceChannel>), DebuggerError> {
        let dut: &mut dyn DeviceChannel = match self.dut.as_mut() {
            Some(dut) => dut.as_mut(),
            None => return Err(not_connected(DebuggerKind::Jtag)),
        };
        let aux: Option<&mut dyn DeviceChannel> = match self.aux.as_mut() {
            Some(aux) => Some(aux.as_mut()),
            None => None,
        };
        Ok((dut, aux))
    }

    fn take_output(&mut self) -> String {
        std::mem::take(&mut self.transcript)
    }

    fn close(&mut self) -> Result<(), DebuggerError> {
        self.control = None;
        self.dut = None;
        self.aux = None;
        Ok(())
    }
}
