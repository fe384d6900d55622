//! An in-process device for exercising campaigns without a simulator or a
//! board.
//!
//! The machine runs one deterministic program: writing its command on the
//! DUT console starts it from its initial register state, each cycle may
//! apply a step function, and on completion the program renders its output
//! from the registers, prints it followed by the prompt and optionally
//! writes it to an output file on the device filesystem. Because output is
//! a function of register state, a flipped bit that survives to the end of
//! the run shows up as corrupted output.

use super::{Debugger, DebuggerError, DebuggerKind, not_connected};
use crate::channel::{ChannelError, DeviceChannel, FileTransfer, SignatureSet};
use crate::checkpoint::{self, AttributeAccess, AttributeStore};
use crate::injector::register_path;
use crate::value::{Value, format_hex};
use crate::worker::CancellationToken;
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Configuration object holding the machine's own clock state in checkpoints.
pub const MACHINE_OBJECT: &str = "dummy";
const IDLE: u64 = u64::MAX;
const SECONDS_PER_CYCLE: f64 = 1e-6;

pub type RenderFn = Arc<dyn Fn(&AttributeStore) -> String + Send + Sync>;
pub type StepFn = Arc<dyn Fn(u64, &mut AttributeStore, &mut BTreeMap<String, Vec<u8>>) + Send + Sync>;

#[derive(Clone)]
pub struct DummyProgram {
    pub command: String,
    pub total_cycles: u64,
    pub registers: AttributeStore,
    /// Memory images by file name (`*.img`).
    pub memory: BTreeMap<String, Vec<u8>>,
    pub output_file: Option<String>,
    pub render: RenderFn,
    pub step: Option<StepFn>,
}

impl DummyProgram {
    pub fn new(command: &str, total_cycles: u64, registers: AttributeStore) -> Self {
        Self {
            command: command.to_string(),
            total_cycles,
            registers,
            memory: BTreeMap::new(),
            output_file: None,
            render: Arc::new(|_| String::new()),
            step: None,
        }
    }

    /// Renders the decimal value of `object.register` as the program output.
    pub fn printing_register(mut self, object: &str, register: &str) -> Self {
        let object = object.to_string();
        let register = register.to_string();
        self.render = Arc::new(move |store| match store.get(&object, &register) {
            Ok(Value::Scalar(v)) => v.to_string(),
            Ok(other) => other.to_string(),
            Err(e) => format!("error: {e}"),
        });
        self
    }

    pub fn with_render(mut self, render: RenderFn) -> Self {
        self.render = render;
        self
    }

    pub fn with_step(mut self, step: StepFn) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_memory(mut self, image: &str, bytes: Vec<u8>) -> Self {
        self.memory.insert(image.to_string(), bytes);
        self
    }

    pub fn with_output_file(mut self, name: &str) -> Self {
        self.output_file = Some(name.to_string());
        self
    }
}

pub struct DummyMachine {
    program: DummyProgram,
    prompt: String,
    registers: AttributeStore,
    memory: BTreeMap<String, Vec<u8>>,
    cycle: u64,
    running: Option<u64>,
    halted: bool,
    dut_console: String,
    aux_console: String,
    files: TempDir,
    failing_resets: u32,
    resets: u32,
    power_cycles: u32,
    runs: u32,
}

impl DummyMachine {
    fn new(program: DummyProgram, prompt: &str) -> Result<Self, DebuggerError> {
        Ok(Self {
            registers: program.registers.clone(),
            memory: program.memory.clone(),
            program,
            prompt: prompt.to_string(),
            cycle: 0,
            running: None,
            halted: false,
            dut_console: String::new(),
            aux_console: String::new(),
            files: tempfile::tempdir()?,
            failing_resets: 0,
            resets: 0,
            power_cycles: 0,
            runs: 0,
        })
    }

    fn boot(&mut self) {
        self.registers = self.program.registers.clone();
        self.memory = self.program.memory.clone();
        self.running = None;
        self.halted = false;
        self.dut_console.clear();
        self.aux_console.clear();
    }

    fn start(&mut self) {
        self.registers = self.program.registers.clone();
        self.memory = self.program.memory.clone();
        self.running = Some(0);
        self.runs += 1;
        if self.program.total_cycles == 0 {
            self.finish();
        }
    }

    fn finish(&mut self) {
        self.running = None;
        let output = (self.program.render)(&self.registers);
        if let Some(name) = &self.program.output_file {
            if let Err(e) = fs::write(self.files.path().join(name), &output) {
                debug!("Dummy device failed to write {name}: {e}");
            }
        }
        self.dut_console.push_str(&output);
        self.dut_console.push('\n');
        self.dut_console.push_str(&self.prompt);
    }

    fn advance(&mut self, cycles: u64) {
        let mut remaining = cycles;
        while remaining > 0 {
            let Some(pc) = self.running else {
                self.cycle += remaining;
                return;
            };
            let n = match self.program.step.clone() {
                Some(step) => {
                    step(pc + 1, &mut self.registers, &mut self.memory);
                    1
                }
                None => remaining.min(self.program.total_cycles.saturating_sub(pc)).max(1),
            };
            self.cycle += n;
            remaining -= n;
            if pc + n >= self.program.total_cycles {
                self.finish();
            } else {
                self.running = Some(pc + n);
            }
        }
    }

    fn run_to_completion(&mut self) {
        if let Some(pc) = self.running {
            self.advance(self.program.total_cycles.saturating_sub(pc).max(1));
        }
    }

    fn console(&mut self, aux: bool) -> &mut String {
        if aux {
            &mut self.aux_console
        } else {
            &mut self.dut_console
        }
    }

    fn handle_line(&mut self, line: &str, aux: bool) {
        let prompt = self.prompt.clone();
        let console = self.console(aux);
        console.push_str(line);
        console.push('\n');
        if aux {
            console.push_str(&prompt);
            return;
        }
        if line == "\u{3}" {
            self.running = None;
            self.dut_console.push_str(&prompt);
        } else if line.trim() == self.program.command {
            self.start();
        } else if let Some(files) = line.trim().strip_prefix("rm ") {
            for name in files.split_whitespace().filter(|f| !f.starts_with('-')) {
                let _ = fs::remove_file(self.files.path().join(name));
            }
            self.dut_console.push_str(&prompt);
        } else {
            self.dut_console.push_str(&prompt);
        }
    }

    /// Cycles the machine has executed since boot.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Number of times the program has been started.
    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn power_cycles(&self) -> u32 {
        self.power_cycles
    }

    /// Makes the next `count` resets fail.
    pub fn fail_resets(&mut self, count: u32) {
        self.failing_resets = count;
    }

    pub fn files_root(&self) -> PathBuf {
        self.files.path().to_path_buf()
    }
}

fn lock(machine: &Mutex<DummyMachine>) -> MutexGuard<'_, DummyMachine> {
    machine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transfers against the dummy device's filesystem.
#[derive(Debug, Clone)]
pub struct DummyTransfer {
    root: PathBuf,
}

impl FileTransfer for DummyTransfer {
    fn get(&mut self, remote: &str, local_dir: &Path) -> Result<PathBuf, ChannelError> {
        let source = self.root.join(remote);
        if !source.is_file() {
            return Err(ChannelError::Transfer(format!("{remote}: No such file or directory")));
        }
        fs::create_dir_all(local_dir)?;
        let name = Path::new(remote)
            .file_name()
            .ok_or_else(|| ChannelError::Transfer(format!("Invalid remote path {remote:?}")))?;
        let destination = local_dir.join(name);
        fs::copy(&source, &destination)?;
        Ok(destination)
    }

    fn put(&mut self, files: &[PathBuf]) -> Result<(), ChannelError> {
        for file in files {
            let name = file
                .file_name()
                .ok_or_else(|| ChannelError::Transfer(format!("Invalid local path {file:?}")))?;
            fs::copy(file, self.root.join(name))
                .map_err(|e| ChannelError::Transfer(format!("{file:?}: {e}")))?;
        }
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn FileTransfer> {
        Box::new(self.clone())
    }
}

pub struct DummyChannel {
    name: String,
    aux: bool,
    machine: Arc<Mutex<DummyMachine>>,
    prompt: String,
    timeout: Duration,
    signatures: SignatureSet,
    transfer: DummyTransfer,
    output: String,
    timer: Option<Instant>,
    cancel: CancellationToken,
}

impl DummyChannel {
    fn scan(&self, buff: String) -> Result<String, ChannelError> {
        match self.signatures.scan(&buff) {
            Some(outcome) => Err(ChannelError::Signature {
                outcome,
                output: buff,
            }),
            None => Ok(buff),
        }
    }
}

impl DeviceChannel for DummyChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn write(&mut self, data: &str) -> Result<(), ChannelError> {
        let mut machine = lock(&self.machine);
        for line in data.split_terminator('\n') {
            machine.handle_line(line, self.aux);
        }
        Ok(())
    }

    fn read_until(&mut self, terminator: &str, _timeout: Duration) -> Result<String, ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Interrupted {
                output: String::new(),
            });
        }
        let buff = {
            let mut machine = lock(&self.machine);
            if !self.aux && !machine.halted {
                machine.run_to_completion();
            }
            let console = machine.console(self.aux);
            match console.find(terminator) {
                Some(position) => Some(console.drain(..position + terminator.len()).collect::<String>()),
                None => {
                    let pending = std::mem::take(console);
                    self.output.push_str(&pending);
                    return match self.signatures.scan(&pending) {
                        Some(outcome) => Err(ChannelError::Signature {
                            outcome,
                            output: pending,
                        }),
                        None => Err(ChannelError::Timeout {
                            terminator: terminator.to_string(),
                            output: pending,
                        }),
                    };
                }
            }
        };
        let buff = buff.unwrap_or_default();
        self.output.push_str(&buff);
        self.scan(buff)
    }

    fn read_available(&mut self) -> Result<String, ChannelError> {
        let buff = std::mem::take(lock(&self.machine).console(self.aux));
        self.output.push_str(&buff);
        self.scan(buff)
    }

    fn reset_timer(&mut self) {
        self.timer = Some(Instant::now());
    }

    fn get_timer_value(&self) -> f64 {
        self.timer.map_or(0.0, |start| start.elapsed().as_secs_f64())
    }

    fn get_file(&mut self, remote: &str, local_dir: &Path) -> Result<PathBuf, ChannelError> {
        self.transfer.get(remote, local_dir)
    }

    fn send_files(&mut self, files: &[PathBuf]) -> Result<(), ChannelError> {
        self.transfer.put(files)
    }

    fn file_transfer(&self) -> Option<Box<dyn FileTransfer>> {
        Some(self.transfer.boxed_clone())
    }

    fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}

#[derive(Debug, Clone)]
pub struct DummySettings {
    pub prompt: String,
    pub timeout: Duration,
    pub use_aux: bool,
}

impl Default for DummySettings {
    fn default() -> Self {
        Self {
            prompt: "root@dummy:~# ".to_string(),
            timeout: Duration::from_secs(1),
            use_aux: false,
        }
    }
}

pub struct DummySession {
    machine: Arc<Mutex<DummyMachine>>,
    dut: DummyChannel,
    aux: Option<DummyChannel>,
    connected: bool,
    transcript: String,
}

impl DummySession {
    pub fn new(
        program: DummyProgram,
        settings: DummySettings,
        cancel: CancellationToken,
    ) -> Result<Self, DebuggerError> {
        let machine = DummyMachine::new(program, &settings.prompt)?;
        let transfer = DummyTransfer {
            root: machine.files_root(),
        };
        let machine = Arc::new(Mutex::new(machine));
        let channel = |name: &str, aux: bool| DummyChannel {
            name: name.to_string(),
            aux,
            machine: Arc::clone(&machine),
            prompt: settings.prompt.clone(),
            timeout: settings.timeout,
            signatures: SignatureSet::device(),
            transfer: transfer.clone(),
            output: String::new(),
            timer: None,
            cancel: cancel.clone(),
        };
        let dut = channel("DUT", false);
        let aux = settings.use_aux.then(|| channel("AUX", true));
        Ok(Self {
            machine,
            dut,
            aux,
            connected: false,
            transcript: String::new(),
        })
    }

    /// Shared handle to the machine, for inspection.
    pub fn machine(&self) -> Arc<Mutex<DummyMachine>> {
        Arc::clone(&self.machine)
    }

    fn record(&mut self, command: &str) {
        self.transcript.push_str("dummy> ");
        self.transcript.push_str(command);
        self.transcript.push('\n');
    }

    fn require_connected(&self) -> Result<(), DebuggerError> {
        if self.connected {
            Ok(())
        } else {
            Err(not_connected(DebuggerKind::Dummy))
        }
    }
}

impl AttributeAccess for DummySession {}

impl Debugger for DummySession {
    fn kind(&self) -> DebuggerKind {
        DebuggerKind::Dummy
    }

    fn reset(&mut self) -> Result<(), DebuggerError> {
        self.record("reset");
        let mut machine = lock(&self.machine);
        if machine.failing_resets > 0 {
            machine.failing_resets -= 1;
            return Err(DebuggerError::new("Error resetting DUT"));
        }
        machine.resets += 1;
        machine.boot();
        drop(machine);
        self.connected = true;
        Ok(())
    }

    fn power_cycle(&mut self) -> Result<(), DebuggerError> {
        self.record("power-cycle");
        let mut machine = lock(&self.machine);
        machine.power_cycles += 1;
        machine.failing_resets = 0;
        machine.boot();
        drop(machine);
        self.connected = true;
        Ok(())
    }

    fn launch(&mut self, checkpoint: Option<&Path>) -> Result<(), DebuggerError> {
        let mut machine = lock(&self.machine);
        machine.boot();
        if let Some(path) = checkpoint {
            let mut store = AttributeStore::read(path)?;
            let clock = store
                .remove_object(MACHINE_OBJECT)
                .ok_or_else(|| DebuggerError::new("Checkpoint has no machine state"))?;
            let scalar = |name: &str| clock.get(name).and_then(Value::as_scalar).unwrap_or(0);
            machine.cycle = scalar("cycle");
            let program_cycle = scalar("program_cycle");
            machine.running = (program_cycle != IDLE).then_some(program_cycle);
            machine.registers = store;
            machine.memory.clear();
            for image in checkpoint::memory_images(path)? {
                let bytes = checkpoint::read_memory_image(path, &image)?;
                machine.memory.insert(image, bytes);
            }
            machine.halted = true;
        }
        drop(machine);
        self.record(&match checkpoint {
            Some(path) => format!("read-configuration {}", path.display()),
            None => "boot".to_string(),
        });
        self.connected = true;
        Ok(())
    }

    fn halt(&mut self) -> Result<(), DebuggerError> {
        self.require_connected()?;
        self.record("stop");
        lock(&self.machine).halted = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DebuggerError> {
        self.require_connected()?;
        self.record("run");
        lock(&self.machine).halted = false;
        Ok(())
    }

    fn get_time(&mut self) -> Result<(u64, f64), DebuggerError> {
        self.require_connected()?;
        self.record("print-time");
        let cycle = lock(&self.machine).cycle;
        Ok((cycle, cycle as f64 * SECONDS_PER_CYCLE))
    }

    fn run_for(&mut self, cycles: u64) -> Result<(), DebuggerError> {
        self.require_connected()?;
        self.record(&format!("run-cycles {cycles}"));
        let mut machine = lock(&self.machine);
        machine.advance(cycles);
        machine.halted = true;
        Ok(())
    }

    fn write_checkpoint(&mut self, path: &Path) -> Result<(), DebuggerError> {
        self.require_connected()?;
        self.record(&format!("write-configuration {}", path.display()));
        let machine = lock(&self.machine);
        let mut store = machine.registers.clone();
        store.set(MACHINE_OBJECT, "cycle", Value::Scalar(machine.cycle));
        store.set(
            MACHINE_OBJECT,
            "program_cycle",
            Value::Scalar(machine.running.unwrap_or(IDLE)),
        );
        store.write(path)?;
        for (image, bytes) in &machine.memory {
            checkpoint::write_memory_image(path, image, bytes)?;
        }
        Ok(())
    }

    fn read_register(
        &mut self,
        object: &str,
        register: &str,
        index: Option<&[usize]>,
    ) -> Result<u64, DebuggerError> {
        self.require_connected()?;
        let machine = lock(&self.machine);
        if !machine.halted {
            return Err(DebuggerError::new("Register read while DUT is running"));
        }
        let value = machine.registers.get(object, register)?;
        value
            .leaf(index.unwrap_or(&[]))
            .map_err(|e| DebuggerError::new(e.to_string()))
    }

    fn write_register(
        &mut self,
        object: &str,
        register: &str,
        index: Option<&[usize]>,
        value: u64,
    ) -> Result<(), DebuggerError> {
        self.require_connected()?;
        self.record(&format!(
            "write {object}.{} {}",
            register_path(register, index),
            format_hex(value)
        ));
        let mut machine = lock(&self.machine);
        if !machine.halted {
            return Err(DebuggerError::new("Register write while DUT is running"));
        }
        machine
            .registers
            .get_mut(object, register)?
            .replace_leaf(index.unwrap_or(&[]), value)
            .map_err(|e| DebuggerError::new(e.to_string()))?;
        Ok(())
    }

    fn channels(
        &mut self,
    ) -> Result<(&mut dyn DeviceChannel, Option<&mut dyn DeviceChannel>), DebuggerError> {
        self.require_connected()?;
        let dut: &mut dyn DeviceChannel = &mut self.dut;
        let aux = self.aux.as_mut().map(|a| a as &mut dyn DeviceChannel);
        Ok((dut, aux))
    }

    fn take_output(&mut self) -> String {
        std::mem::take(&mut self.transcript)
    }

    fn close(&mut self) -> Result<(), DebuggerError> {
        if self.connected {
            self.record("quit");
        }
        self.connected = false;
        Ok(())
    }
}
