//! Full-system simulation through a Simics subprocess.
//!
//! The simulator's command console is the child's stdin/stdout. Device
//! consoles are pseudo terminals the simulator opens while booting; their
//! paths, and the host port forwarded to the target's SSH server, are read
//! back from the boot script's output.

use super::{Debugger, DebuggerError, DebuggerKind, not_connected};
use crate::channel::{ChannelSettings, DeviceChannel, ScpTransfer, SignatureSet, StreamChannel};
use crate::checkpoint::AttributeAccess;
use crate::worker::CancellationToken;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONSOLE_MARKER: &str = "pseudo device opened: ";
const PORT_MARKER: &str = "Host TCP port ";

#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    pub prompt: String,
    pub timeout: Duration,
    /// Time allowed for the boot script to reach the shell prompt.
    pub boot_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub identity: Option<PathBuf>,
    pub remote_dir: String,
}

#[derive(Debug, Clone)]
pub struct SimicsSettings {
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub args: Vec<String>,
    pub boot_script: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
    pub launch_attempts: u32,
    pub launch_backoff: Duration,
    pub dut: ConsoleSettings,
    pub aux: Option<ConsoleSettings>,
    pub ssh: SshSettings,
    /// Shell command run after `write-configuration`; `{checkpoint}` is
    /// replaced with the checkpoint path. Used to export attributes into
    /// the form the injector reads.
    pub checkpoint_export: Option<String>,
    /// Shell command run before `read-configuration`, the inverse of
    /// `checkpoint_export`.
    pub checkpoint_import: Option<String>,
}

impl SimicsSettings {
    pub fn new(executable: impl Into<PathBuf>, boot_script: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            working_dir: PathBuf::from("."),
            args: vec!["-no-win".to_string(), "-no-gui".to_string(), "-q".to_string()],
            boot_script: boot_script.into(),
            prompt: "simics> ".to_string(),
            timeout: Duration::from_secs(30),
            launch_attempts: 10,
            launch_backoff: Duration::from_secs(30),
            dut: ConsoleSettings {
                prompt: "root@p2020rdb:~# ".to_string(),
                timeout: Duration::from_secs(300),
                boot_timeout: Duration::from_secs(600),
            },
            aux: None,
            ssh: SshSettings {
                user: "root".to_string(),
                identity: None,
                remote_dir: "~".to_string(),
            },
            checkpoint_export: None,
            checkpoint_import: None,
        }
    }
}

/// Pseudo terminals opened by the simulator, in order of appearance.
pub fn parse_consoles(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let lower = line.to_lowercase();
            let start = lower.find(CONSOLE_MARKER)? + CONSOLE_MARKER.len();
            line[start..].split_whitespace().next().map(PathBuf::from)
        })
        .collect()
}

/// Host ports forwarded to port 22 of a simulated target, in order.
pub fn parse_ssh_ports(output: &str) -> Vec<u16> {
    output
        .lines()
        .filter(|line| line.trim_end().ends_with(":22"))
        .filter_map(|line| {
            let start = line.find(PORT_MARKER)? + PORT_MARKER.len();
            line[start..].split_whitespace().next()?.parse().ok()
        })
        .collect()
}

/// Extracts `(cycles, seconds)` from the table `print-time` prints. The
/// data row is the last line before the prompt.
pub fn parse_print_time(output: &str) -> Result<(u64, f64), DebuggerError> {
    let invalid = || DebuggerError::with_output("Error parsing simulator time", output);
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() < 2 {
        return Err(invalid());
    }
    let fields: Vec<&str> = lines[lines.len() - 2].split_whitespace().collect();
    let cycles = fields.get(2).and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
    let seconds = fields.get(3).and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
    Ok((cycles, seconds))
}

fn expand(template: &str, checkpoint: &Path) -> String {
    template.replace("{checkpoint}", &checkpoint.display().to_string())
}

pub struct SimicsSession {
    settings: SimicsSettings,
    cancel: CancellationToken,
    child: Option<Child>,
    console: Option<StreamChannel>,
    dut: Option<StreamChannel>,
    aux: Option<StreamChannel>,
    transcript: String,
}

impl SimicsSession {
    pub fn new(settings: SimicsSettings, cancel: CancellationToken) -> Self {
        Self {
            settings,
            cancel,
            child: None,
            console: None,
            dut: None,
            aux: None,
            transcript: String::new(),
        }
    }

    fn spawn(&mut self) -> Result<(), DebuggerError> {
        let mut child = Command::new(&self.settings.executable)
            .args(&self.settings.args)
            .current_dir(&self.settings.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DebuggerError::new(format!("Failed to launch Simics: {e}")))?;
        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            let _ = child.kill();
            return Err(DebuggerError::new("Simics pipes unavailable"));
        };
        let settings = ChannelSettings {
            name: "Simics".to_string(),
            prompt: self.settings.prompt.clone(),
            timeout: self.settings.timeout,
            signatures: SignatureSet::simulator(),
        };
        self.console = Some(
            StreamChannel::new(settings, stdout, stdin).with_cancellation(self.cancel.clone()),
        );
        self.child = Some(child);
        let banner = self.console_mut()?.read_prompt();
        self.transcript.push_str(&banner.clone().unwrap_or_default());
        banner?;
        Ok(())
    }

    fn console_mut(&mut self) -> Result<&mut StreamChannel, DebuggerError> {
        self.console
            .as_mut()
            .ok_or_else(|| not_connected(DebuggerKind::Simics))
    }

    /// Sends one simulator command and returns its reply without the prompt.
    fn command(&mut self, command: &str) -> Result<String, DebuggerError> {
        self.transcript.push_str(command);
        self.transcript.push('\n');
        let reply = self.console_mut()?.command(command);
        match &reply {
            Ok(text) => self.transcript.push_str(text),
            Err(err) => self.transcript.push_str(err.output()),
        }
        let text = reply?;
        let prompt = &self.settings.prompt;
        Ok(text.strip_suffix(prompt.as_str()).unwrap_or(&text).to_string())
    }

    fn run_shell(&self, command: &str) -> Result<(), DebuggerError> {
        debug!("Running {command:?}");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.settings.working_dir)
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DebuggerError::with_output(
                format!("Checkpoint command failed: {command}"),
                String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    fn open_console(
        &self,
        name: &str,
        path: &Path,
        settings: &ConsoleSettings,
        ssh_port: Option<u16>,
    ) -> Result<StreamChannel, DebuggerError> {
        let channel_settings = ChannelSettings {
            name: name.to_string(),
            prompt: settings.prompt.clone(),
            timeout: settings.timeout,
            signatures: SignatureSet::device(),
        };
        let mut channel = StreamChannel::open_device(channel_settings, path)?
            .with_cancellation(self.cancel.clone());
        if let Some(port) = ssh_port {
            channel = channel.with_transfer(Box::new(ScpTransfer {
                host: "127.0.0.1".to_string(),
                port,
                user: self.settings.ssh.user.clone(),
                identity: self.settings.ssh.identity.clone(),
                remote_dir: self.settings.ssh.remote_dir.clone(),
            }));
        }
        Ok(channel)
    }

    fn attach_consoles(&mut self, boot_output: &str) -> Result<(), DebuggerError> {
        let consoles = parse_consoles(boot_output);
        let ports = parse_ssh_ports(boot_output);
        let dut_path = consoles
            .first()
            .ok_or_else(|| DebuggerError::with_output("DUT console not found", boot_output))?;
        self.dut = Some(self.open_console(
            "DUT",
            dut_path,
            &self.settings.dut,
            ports.first().copied(),
        )?);
        if let Some(aux_settings) = &self.settings.aux {
            let aux_path = consoles
                .get(1)
                .ok_or_else(|| DebuggerError::with_output("AUX console not found", boot_output))?;
            self.aux = Some(self.open_console("AUX", aux_path, aux_settings, ports.get(1).copied())?);
        }
        Ok(())
    }

    fn launch_once(&mut self, checkpoint: Option<&Path>) -> Result<(), DebuggerError> {
        self.spawn()?;
        match checkpoint {
            Some(path) => {
                if let Some(template) = &self.settings.checkpoint_import {
                    self.run_shell(&expand(template, path))?;
                }
                let output = self.command(&format!("read-configuration {}", path.display()))?;
                self.attach_consoles(&output)?;
            }
            None => {
                let script = self.settings.boot_script.display().to_string();
                let output = self.command(&format!("run-command-file {script}"))?;
                self.attach_consoles(&output)?;
                self.resume()?;
                self.boot_wait()?;
            }
        }
        Ok(())
    }

    fn boot_wait(&mut self) -> Result<(), DebuggerError> {
        let boot_timeout = self.settings.dut.boot_timeout;
        if let Some(dut) = self.dut.as_mut() {
            let prompt = dut.prompt().to_string();
            dut.read_until(&prompt, boot_timeout)?;
        }
        let aux_boot = self.settings.aux.as_ref().map(|a| a.boot_timeout);
        if let (Some(aux), Some(timeout)) = (self.aux.as_mut(), aux_boot) {
            let prompt = aux.prompt().to_string();
            aux.read_until(&prompt, timeout)?;
        }
        Ok(())
    }

    fn interrupt(&self) -> Result<(), DebuggerError> {
        let child = self
            .child
            .as_ref()
            .ok_or_else(|| not_connected(DebuggerKind::Simics))?;
        let pid = libc::pid_t::try_from(child.id())
            .map_err(|_| DebuggerError::new("Simics pid out of range"))?;
        // SAFETY: the pid belongs to a child this session spawned and has not reaped.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc == 0 {
            Ok(())
        } else {
            Err(DebuggerError::new(format!(
                "Failed to interrupt Simics: {}",
                std::io::Error::last_os_error()
            )))
        }
    }
}

impl AttributeAccess for SimicsSession {}

impl Debugger for SimicsSession {
    fn kind(&self) -> DebuggerKind {
        DebuggerKind::Simics
    }

    /// A simulated reset is a fresh boot.
    fn reset(&mut self) -> Result<(), DebuggerError> {
        self.close()?;
        self.launch(None)
    }

    fn launch(&mut self, checkpoint: Option<&Path>) -> Result<(), DebuggerError> {
        let attempts = self.settings.launch_attempts.max(1);
        let mut last_error = DebuggerError::new("Error launching Simics");
        for attempt in 1..=attempts {
            match self.launch_once(checkpoint) {
                Ok(()) => {
                    info!("Simics launched (attempt {attempt})");
                    return Ok(());
                }
                Err(err) if err.is_interrupted() => return Err(err),
                Err(err) => {
                    warn!("Error launching Simics (attempt {attempt}/{attempts}): {err}");
                    let _ = self.close();
                    last_error = err;
                    if attempt < attempts && self.cancel.sleep(self.settings.launch_backoff) {
                        return Err(DebuggerError::new("Interrupted"));
                    }
                }
            }
        }
        Err(DebuggerError::with_output(
            format!("Error launching Simics: {}", last_error.kind),
            last_error.raw_output,
        ))
    }

    fn halt(&mut self) -> Result<(), DebuggerError> {
        self.interrupt()?;
        self.transcript.push_str("^C\n");
        let reply = self.console_mut()?.read_prompt();
        match &reply {
            Ok(text) => self.transcript.push_str(text),
            Err(err) => self.transcript.push_str(err.output()),
        }
        reply?;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DebuggerError> {
        self.transcript.push_str("run\n");
        self.console_mut()?.write("run\n")?;
        Ok(())
    }

    fn get_time(&mut self) -> Result<(u64, f64), DebuggerError> {
        let output = self.command("print-time")?;
        let with_prompt = format!("{output}{}", self.settings.prompt);
        parse_print_time(&with_prompt)
    }

    fn run_for(&mut self, cycles: u64) -> Result<(), DebuggerError> {
        self.command(&format!("run-cycles {cycles}"))?;
        Ok(())
    }

    fn write_checkpoint(&mut self, path: &Path) -> Result<(), DebuggerError> {
        self.command(&format!("write-configuration {}", path.display()))?;
        if let Some(template) = &self.settings.checkpoint_export {
            self.run_shell(&expand(template, path))?;
        }
        Ok(())
    }

    fn channels(
        &mut self,
    ) -> Result<(&mut dyn DeviceChannel, Option<&mut dyn DeviceChannel>), DebuggerError> {
        let dut: &mut dyn DeviceChannel = self
            .dut
            .as_mut()
            .ok_or_else(|| not_connected(DebuggerKind::Simics))?;
        let aux = self.aux.as_mut().map(|a| a as &mut dyn DeviceChannel);
        Ok((dut, aux))
    }

    fn take_output(&mut self) -> String {
        std::mem::take(&mut self.transcript)
    }

    fn close(&mut self) -> Result<(), DebuggerError> {
        self.dut = None;
        self.aux = None;
        let Some(mut child) = self.child.take() else {
            self.console = None;
            return Ok(());
        };
        if let Ok(pid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: signalling our own unreaped child.
            unsafe {
                libc::kill(pid, libc::SIGINT);
            }
        }
        if let Some(console) = self.console.as_mut() {
            let _ = console.write("quit\n");
        }
        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if start.elapsed() < CLOSE_TIMEOUT => thread::sleep(POLL_INTERVAL),
                Ok(None) => {
                    warn!("Simics did not quit, killing it");
                    let _ = child.kill();
                    break child.wait().ok();
                }
                Err(e) => {
                    warn!("Failed to wait for Simics: {e}");
                    break None;
                }
            }
        };
        if let Some(console) = self.console.as_mut() {
            let _ = console.read_available().map(|text| self.transcript.push_str(&text));
        }
        self.console = None;
        debug!("Simics exited with {status:?}");
        Ok(())
    }
}

impl Drop for SimicsSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOT_OUTPUT: &str = "\
[DUT_p2020rdb.soc.uart[0].con] Pseudo device opened: /dev/pts/7
[DUT_p2020rdb.service_node] Host TCP port 4022 -> 10.10.0.100:22
[AUX_p2020rdb.soc.uart[0].con] Pseudo device opened: /dev/pts/9
[AUX_p2020rdb.service_node] Host TCP port 4023 -> 10.10.0.104:22
[DUT_p2020rdb.service_node] Host TCP port 4080 -> 10.10.0.100:80
";

    #[test]
    fn boot_output_yields_consoles_in_order() {
        assert_eq!(
            parse_consoles(BOOT_OUTPUT),
            vec![PathBuf::from("/dev/pts/7"), PathBuf::from("/dev/pts/9")]
        );
    }

    #[test]
    fn only_ssh_forwards_are_collected() {
        assert_eq!(parse_ssh_ports(BOOT_OUTPUT), vec![4022, 4023]);
        assert!(parse_ssh_ports("no forwards here").is_empty());
    }

    #[test]
    fn print_time_reads_row_before_prompt() {
        let output = "processor            steps       cycles    time [s]\n\
                      DUT_p2020rdb.cpu[0]  12345       67890     0.0679\n\
                      simics> ";
        assert_eq!(parse_print_time(output).unwrap(), (67890, 0.0679));
    }

    #[test]
    fn malformed_print_time_is_a_debugger_error() {
        let err = parse_print_time("garbage\nsimics> ").unwrap_err();
        assert_eq!(err.kind, "Error parsing simulator time");
        assert!(err.raw_output.contains("garbage"));
        assert!(parse_print_time("").is_err());
    }

    #[test]
    fn checkpoint_templates_substitute_path() {
        assert_eq!(
            expand("bin/export {checkpoint}", Path::new("/tmp/gold/3")),
            "bin/export /tmp/gold/3"
        );
    }

    #[test]
    fn cancellation_cuts_launch_backoff_short() {
        let mut settings = SimicsSettings::new("/nonexistent/simics", "boot.simics");
        settings.launch_attempts = 3;
        settings.launch_backoff = Duration::from_secs(60);
        let cancel = CancellationToken::new();
        let mut session = SimicsSession::new(settings, cancel.clone());

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });
        let started = Instant::now();
        let err = session.launch(None).unwrap_err();
        canceller.join().unwrap();
        assert!(err.is_interrupted(), "Expected Interrupted, got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn session_without_process_is_not_connected() {
        let mut session = SimicsSession::new(
            SimicsSettings::new("simics", "boot.simics"),
            CancellationToken::new(),
        );
        assert!(session.channels().is_err());
        assert!(session.halt().is_err());
        assert!(session.close().is_ok());
    }

    #[test]
    fn missing_executable_exhausts_launch_attempts() {
        let mut settings = SimicsSettings::new("/nonexistent/simics", "boot.simics");
        settings.launch_attempts = 2;
        settings.launch_backoff = Duration::from_millis(1);
        let mut session = SimicsSession::new(settings, CancellationToken::new());
        let err = session.launch(None).unwrap_err();
        assert!(err.kind.starts_with("Error launching Simics"), "got {err:?}");
    }
}
