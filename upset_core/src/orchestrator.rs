//! The campaign state machine.
//!
//! A campaign is set up once: the device boots, the application is timed,
//! gold checkpoints are written (simulated campaigns) and the gold output is
//! stored. Workers then run iterations against a shared
//! [`IterationBudget`]: each iteration injects one or more faults, lets the
//! application finish, classifies what happened and persists a result.
//! Failures of the debugger or the device are scoped to the iteration that
//! hit them; only result store failures and interrupts end a worker.

use crate::campaign::{
    Campaign, EventLevel, EventRecord, InjectionRecord, MemoryDiffRecord, Mode, OutcomeCategory,
    RegisterDiffRecord, ResultRecord, Workspace, now_ms,
};
use crate::catalog::{Catalog, CatalogDefinition, CatalogError, CatalogFilter};
use crate::channel::{ChannelError, DeviceChannel, HANGING, quick_ratio};
use crate::checkpoint::{self, CheckpointError};
use crate::classify::{self, Classification, LATENT_FAULTS, MASKED_FAULTS, Observation, OutputError};
use crate::comparator::{CheckpointComparator, DiffTally, RegisterDiff};
use crate::config::UpsetConfig;
use crate::debugger::{Debugger, DebuggerError};
use crate::injector::{CheckpointInjector, InjectionPlan, InjectionSite};
use crate::selector::TargetSelector;
use crate::store::{ResultStore, RetryPolicy, StoreError};
use crate::value::{flip_scalar, format_hex};
use crate::worker::{
    BackgroundTask, CancellationToken, IterationBudget, WorkerError, panic_message, read_both,
    run_workers,
};
use log::{debug, error, info, warn};
use rand::Rng;
use rand::seq::index;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::any::Any;
use std::backtrace::Backtrace;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const INTERRUPTED: &str = "Interrupted";
pub const UNCAUGHT_EXCEPTION: &str = "Uncaught exception";
pub const EXITED: &str = "Exited";

/// Outcomes after which a supervised device is reset before the next run.
const RESET_OUTCOMES: [&str; 3] = ["Reboot", HANGING, "Kernel error"];

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("{0}")]
    Debugger(DebuggerError),

    #[error("{0}")]
    Channel(ChannelError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Campaign I/O error: {0}")]
    Io(String),

    #[error("Invalid campaign: {0}")]
    Invalid(String),

    #[error("Interrupted")]
    Interrupted,
}

impl From<DebuggerError> for CampaignError {
    fn from(err: DebuggerError) -> Self {
        if err.is_interrupted() {
            CampaignError::Interrupted
        } else {
            CampaignError::Debugger(err)
        }
    }
}

impl From<ChannelError> for CampaignError {
    fn from(err: ChannelError) -> Self {
        if err.is_interrupted() {
            CampaignError::Interrupted
        } else {
            CampaignError::Channel(err)
        }
    }
}

impl From<std::io::Error> for CampaignError {
    fn from(err: std::io::Error) -> Self {
        CampaignError::Io(err.to_string())
    }
}

impl CampaignError {
    /// Splits errors that only abort the current iteration from those that
    /// end the worker.
    fn into_scoped(self) -> Result<DebuggerError, CampaignError> {
        match self {
            CampaignError::Debugger(err) => Ok(err),
            CampaignError::Channel(err) => Ok(err.into()),
            CampaignError::Checkpoint(err) => Ok(err.into()),
            CampaignError::Io(message) => Ok(DebuggerError::new(message)),
            fatal => Err(fatal),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignState {
    Setup,
    Calibrating,
    CreatingCheckpoints,
    Ready,
    Resetting,
    Executing,
    Injecting,
    Monitoring,
    Classifying,
    Logged,
    Closing,
}

/// Transient state of the iteration in flight.
#[derive(Debug, Default)]
struct IterationContext {
    sites: Vec<InjectionSite>,
    register_diffs: Vec<RegisterDiff>,
    memory_diffs: usize,
    tally: DiffTally,
}

/// Campaign record for a new campaign described by `config`.
pub fn campaign_from_config(config: &UpsetConfig) -> Campaign {
    let settings = &config.campaign;
    let mut campaign = Campaign::new(&settings.architecture, settings.mode, &settings.command);
    campaign.aux_command = settings.aux_command.clone();
    campaign.use_aux = config.uses_aux();
    campaign.output_file = settings.output_file.clone();
    campaign.aux_output_file = settings.aux_output_file;
    campaign.log_files = settings.log_files.clone();
    campaign.aux_log_files = settings.aux_log_files.clone();
    campaign.caches = settings.include_caches;
    if settings.mode == Mode::Simulated {
        campaign.num_checkpoints = settings.num_checkpoints;
    }
    campaign
}

/// The injection catalog, restricted to the selected targets and
/// registers, and the comparison catalog covering everything injectable in
/// the campaign's mode.
fn build_catalogs(config: &UpsetConfig, mode: Mode) -> Result<(Catalog, Catalog), CatalogError> {
    let definition = match &config.campaign.catalog {
        Some(path) => CatalogDefinition::load_from_file(path)?,
        None => CatalogDefinition::builtin(&config.campaign.architecture)?,
    };
    let filter = CatalogFilter {
        mode: Some(mode),
        selected_targets: config.campaign.selected_targets.clone(),
        selected_registers: config.campaign.selected_registers.clone(),
        include_caches: config.campaign.include_caches,
    };
    let injection = Catalog::build(&definition, &filter)?;
    let comparison = Catalog::build(
        &definition,
        &CatalogFilter {
            selected_targets: None,
            selected_registers: None,
            ..filter
        },
    )?;
    Ok((injection, comparison))
}

fn fetch_file(
    channel: &mut dyn DeviceChannel,
    file: &str,
    dir: &Path,
    remove: bool,
) -> Result<PathBuf, ChannelError> {
    let local = channel.get_file(file, dir)?;
    if remove {
        channel.command(&format!("rm {file}"))?;
    }
    Ok(local)
}

fn output_error(err: ChannelError) -> OutputError {
    match err {
        ChannelError::Transfer(message) if message.contains("No such file") => OutputError::Missing,
        ChannelError::Transfer(_) => OutputError::Transfer,
        other => OutputError::Other(other.outcome()),
    }
}

pub struct Orchestrator {
    config: UpsetConfig,
    campaign: Campaign,
    catalog: Catalog,
    compare_catalog: Catalog,
    selector: TargetSelector,
    debugger: Box<dyn Debugger>,
    store: Arc<dyn ResultStore>,
    workspace: Workspace,
    rng: ChaCha8Rng,
    cancel: CancellationToken,
    worker: usize,
    state: CampaignState,
    result: ResultRecord,
    result_open: bool,
    iteration: IterationContext,
}

impl Orchestrator {
    pub fn new(
        config: &UpsetConfig,
        campaign: Campaign,
        debugger: Box<dyn Debugger>,
        store: Arc<dyn ResultStore>,
        worker: usize,
        cancel: CancellationToken,
    ) -> Result<Self, CampaignError> {
        let (catalog, compare_catalog) = build_catalogs(config, campaign.mode)?;
        Ok(Self {
            config: config.clone(),
            workspace: Workspace::new(&config.workspace, campaign.id),
            result: ResultRecord::placeholder(campaign.id),
            campaign,
            catalog,
            compare_catalog,
            selector: TargetSelector::default(),
            debugger,
            store,
            rng: ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(worker as u64)),
            cancel,
            worker,
            state: CampaignState::Setup,
            result_open: false,
            iteration: IterationContext::default(),
        })
    }

    pub fn campaign(&self) -> &Campaign {
        &self.campaign
    }

    pub fn state(&self) -> CampaignState {
        self.state
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn transition(&mut self, state: CampaignState) {
        if self.state != state {
            debug!("Worker {}: {:?} -> {:?}", self.worker, self.state, state);
            self.state = state;
        }
    }

    fn hardware(&self) -> bool {
        self.campaign.mode == Mode::Hardware
    }

    fn record_event(
        &self,
        level: EventLevel,
        source: &str,
        kind: &str,
        description: Option<String>,
        success: Option<bool>,
    ) -> Result<(), StoreError> {
        let result_id = self.result_open.then_some(self.result.id);
        let mut event = EventRecord::new(self.campaign.id, result_id, level, source, kind);
        event.description = description;
        event.success = success;
        self.store.insert_event(&mut event)
    }

    // Setup

    fn register_campaign(&mut self) -> Result<(), CampaignError> {
        self.store.insert_campaign(&mut self.campaign)?;
        self.workspace = Workspace::new(&self.config.workspace, self.campaign.id);
        self.result = ResultRecord::placeholder(self.campaign.id);
        info!("Created campaign {}", self.campaign.id);
        Ok(())
    }

    fn setup(&mut self) -> Result<(), CampaignError> {
        self.transition(CampaignState::Setup);
        if self.campaign.mode == Mode::Simulated && self.campaign.num_checkpoints < 2 {
            return Err(CampaignError::Invalid(
                "simulated campaigns need at least two gold checkpoints".to_string(),
            ));
        }
        if self.campaign.command.is_empty() {
            return Err(CampaignError::Invalid("no application command".to_string()));
        }
        match self.campaign.mode {
            Mode::Simulated => self.debugger.launch(None)?,
            Mode::Hardware => self.reset_device()?,
        }
        self.send_files()?;

        self.transition(CampaignState::Calibrating);
        let timed = self.time_application();
        self.record_event(
            EventLevel::Info,
            "Fault injector",
            "Timed application",
            None,
            Some(timed.is_ok()),
        )?;
        timed?;
        info!(
            "Execution time {:.6} s, {} cycles",
            self.campaign.execution_time, self.campaign.cycles
        );

        if self.campaign.mode == Mode::Simulated {
            self.transition(CampaignState::CreatingCheckpoints);
            self.create_checkpoints()?;
        }
        self.store_gold_artifacts()?;
        self.collect_campaign_output();
        self.campaign.timestamp_ms = now_ms();
        self.store.update_campaign(&self.campaign)?;
        self.transition(CampaignState::Ready);
        Ok(())
    }

    fn send_files(&mut self) -> Result<(), CampaignError> {
        let files = self.config.campaign.files.clone();
        let aux_files = self.config.campaign.aux_files.clone();
        let (dut, aux) = self.debugger.channels()?;
        if !files.is_empty() {
            dut.send_files(&files)?;
        }
        if let (Some(aux), false) = (aux, aux_files.is_empty()) {
            aux.send_files(&aux_files)?;
        }
        Ok(())
    }

    /// Writes the AUX and DUT commands, restarting the DUT timer.
    fn write_commands(&mut self) -> Result<(), CampaignError> {
        if self.result_open {
            if let Some(aux_command) = &self.campaign.aux_command {
                self.record_event(EventLevel::Info, "AUX", "Command", Some(aux_command.clone()), None)?;
            }
            self.record_event(
                EventLevel::Info,
                "DUT",
                "Command",
                Some(self.campaign.command.clone()),
                None,
            )?;
        }
        let command = format!("{}\n", self.campaign.command);
        let aux_command = self.campaign.aux_command.as_ref().map(|c| format!("{c}\n"));
        let (dut, aux) = self.debugger.channels()?;
        if let (Some(aux), Some(aux_command)) = (aux, &aux_command) {
            aux.write(aux_command)?;
        }
        dut.reset_timer();
        dut.write(&command)?;
        Ok(())
    }

    /// Reads both consoles up to their prompts; any failure is returned.
    fn read_run(&mut self) -> Result<(), CampaignError> {
        let use_aux = self.campaign.use_aux;
        let (dut, aux) = self.debugger.channels()?;
        let aux = aux.filter(|_| use_aux);
        let dut_timeout = dut.timeout();
        let aux_timeout = aux.as_ref().map_or(dut_timeout, |a| a.timeout());
        let read = read_both(dut, aux, dut_timeout, aux_timeout);
        read.dut?;
        read.aux.transpose()?;
        Ok(())
    }

    /// Removes the output file and relative log files left on the devices.
    fn remove_device_files(&mut self) -> Result<(), CampaignError> {
        let output_file = self.campaign.output_file.clone();
        let aux_side = self.campaign.aux_output_file;
        let log_files: Vec<String> = self
            .campaign
            .log_files
            .iter()
            .filter(|f| !f.starts_with('/'))
            .cloned()
            .collect();
        let aux_log_files: Vec<String> = self
            .campaign
            .aux_log_files
            .iter()
            .filter(|f| !f.starts_with('/'))
            .cloned()
            .collect();
        let (dut, mut aux) = self.debugger.channels()?;
        if let Some(file) = &output_file {
            match aux.as_deref_mut() {
                Some(aux) if aux_side => aux.command(&format!("rm {file}"))?,
                _ => dut.command(&format!("rm {file}"))?,
            };
        }
        for file in &log_files {
            dut.command(&format!("rm {file}"))?;
        }
        if let Some(aux) = aux.as_deref_mut() {
            for file in &aux_log_files {
                aux.command(&format!("rm {file}"))?;
            }
        }
        Ok(())
    }

    fn time_application(&mut self) -> Result<(), CampaignError> {
        let iterations = self.config.campaign.timing_iterations.max(1);
        let simulated = self.campaign.mode == Mode::Simulated;
        let mut cycles = Vec::new();
        let mut times = Vec::new();
        for i in 0..iterations {
            if self.cancel.is_cancelled() {
                return Err(CampaignError::Interrupted);
            }
            let start = if simulated {
                self.debugger.halt()?;
                Some(self.debugger.get_time()?)
            } else {
                None
            };
            self.write_commands()?;
            if simulated {
                self.debugger.resume()?;
            }
            self.read_run()?;
            match start {
                Some((start_cycles, start_time)) => {
                    self.debugger.halt()?;
                    let (end_cycles, end_time) = self.debugger.get_time()?;
                    cycles.push(end_cycles.saturating_sub(start_cycles));
                    times.push(end_time - start_time);
                    self.debugger.resume()?;
                }
                None => times.push(self.debugger.dut()?.get_timer_value()),
            }
            if i + 1 < iterations {
                self.remove_device_files()?;
            }
        }
        if simulated {
            self.debugger.halt()?;
            let (end_cycles, end_time) = self.debugger.get_time()?;
            self.campaign.start_cycle = end_cycles;
            self.campaign.start_time = end_time;
            self.campaign.cycles = cycles.iter().sum::<u64>() / cycles.len() as u64;
        }
        self.campaign.execution_time = times.iter().sum::<f64>() / times.len() as f64;
        Ok(())
    }

    /// Re-runs the application from a halted simulator, writing a gold
    /// checkpoint every `cycles / num_checkpoints` cycles.
    fn create_checkpoints(&mut self) -> Result<(), CampaignError> {
        let count = self.campaign.num_checkpoints;
        self.campaign.cycles_between = (self.campaign.cycles / u64::from(count)).max(1);
        fs::create_dir_all(self.workspace.gold_checkpoints())?;
        self.write_commands()?;
        for n in 1..=count {
            if self.cancel.is_cancelled() {
                return Err(CampaignError::Interrupted);
            }
            self.debugger.run_for(self.campaign.cycles_between)?;
            let output = self.debugger.dut()?.take_output();
            self.campaign.dut_output.push_str(&output);
            self.campaign
                .dut_output
                .push_str(&format!("***drseus_checkpoint: {n}***\n"));
            self.debugger.write_checkpoint(&self.workspace.gold_checkpoint(n))?;
        }
        checkpoint::mark_complete(&self.workspace.gold_checkpoint(count))?;
        info!(
            "Created {count} gold checkpoints, {} cycles apart",
            self.campaign.cycles_between
        );
        self.debugger.resume()?;
        self.read_run()
    }

    fn store_gold_artifacts(&mut self) -> Result<(), CampaignError> {
        let gold = self.workspace.gold_data();
        fs::create_dir_all(&gold)?;
        let output_file = self.campaign.output_file.clone();
        let aux_side = self.campaign.aux_output_file;
        let log_files = self.campaign.log_files.clone();
        let aux_log_files = self.campaign.aux_log_files.clone();
        {
            let (dut, mut aux) = self.debugger.channels()?;
            if let Some(file) = &output_file {
                if aux_side {
                    let aux = aux.as_deref_mut().ok_or_else(|| {
                        CampaignError::Invalid("AUX output file without an AUX device".to_string())
                    })?;
                    fetch_file(aux, file, &gold, true)?;
                } else {
                    fetch_file(dut, file, &gold, true)?;
                }
            }
            for file in &log_files {
                fetch_file(dut, file, &gold, !file.starts_with('/'))?;
            }
            if let Some(aux) = aux.as_deref_mut() {
                for file in &aux_log_files {
                    fetch_file(aux, file, &gold, !file.starts_with('/'))?;
                }
            }
        }
        if fs::read_dir(&gold)?.next().is_none() {
            fs::remove_dir(&gold)?;
        }
        Ok(())
    }

    fn collect_campaign_output(&mut self) {
        self.campaign
            .debugger_output
            .push_str(&self.debugger.take_output());
        if let Ok((dut, aux)) = self.debugger.channels() {
            self.campaign.dut_output.push_str(&dut.take_output());
            if let Some(aux) = aux {
                self.campaign.aux_output.push_str(&aux.take_output());
            }
        }
    }

    // Iterations

    fn open_result(&mut self) -> Result<(), CampaignError> {
        let mut result = ResultRecord::placeholder(self.campaign.id);
        self.store.insert_result(&mut result)?;
        self.result = result;
        self.result_open = true;
        Ok(())
    }

    /// Runs `iteration`, turning a panic into an "Uncaught exception" result.
    fn guarded(&mut self, iteration: fn(&mut Self) -> Result<(), CampaignError>) -> Result<(), CampaignError> {
        match catch_unwind(AssertUnwindSafe(|| iteration(self))) {
            Ok(outcome) => outcome,
            Err(payload) => self.uncaught(payload),
        }
    }

    /// Runs injection iterations until `budget` is spent.
    pub fn run_injections(&mut self, budget: &IterationBudget) -> Result<u64, CampaignError> {
        self.transition(CampaignState::Ready);
        let outcome = self.injection_loop(budget);
        let closed = self.close();
        let completed = outcome?;
        closed?;
        Ok(completed)
    }

    fn injection_loop(&mut self, budget: &IterationBudget) -> Result<u64, CampaignError> {
        self.open_result()?;
        let mut completed = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CampaignError::Interrupted);
            }
            let Some(iteration) = budget.claim() else {
                break;
            };
            self.result.iteration = Some(iteration);
            match self.guarded(Self::run_iteration) {
                Ok(()) => {}
                Err(CampaignError::Interrupted) => {
                    self.abandon_interrupted()?;
                    return Err(CampaignError::Interrupted);
                }
                Err(err) => return Err(err),
            }
            self.log_result()?;
            completed += 1;
        }
        Ok(completed)
    }

    fn run_iteration(&mut self) -> Result<(), CampaignError> {
        self.iteration = IterationContext::default();
        self.result.num_injections = self.config.injection.injections.max(1);
        if let Err(err) = self.inject_and_monitor() {
            let scoped = err.into_scoped()?;
            warn!("Iteration {} failed: {scoped}", self.result.id);
            self.result
                .set_outcome(scoped.kind.clone(), self.debugger.kind().error_category());
            self.result.debugger_output.push_str(&scoped.raw_output);
            if self.hardware() {
                self.drain_devices();
            }
        }
        self.finish_iteration()
    }

    fn inject_and_monitor(&mut self) -> Result<(), CampaignError> {
        let mode = self.campaign.mode;
        if mode == Mode::Hardware {
            self.transition(CampaignState::Resetting);
            self.reset_device()?;
            self.transition(CampaignState::Executing);
            self.write_commands()?;
        }

        self.transition(CampaignState::Injecting);
        match mode {
            Mode::Simulated => self.inject_simulated()?,
            Mode::Hardware => self.inject_hardware()?,
        }
        self.result.num_register_diffs = self.iteration.tally.register_diffs;
        self.result.num_memory_diffs = self.iteration.tally.memory_diffs;

        self.transition(CampaignState::Monitoring);
        let flusher = self.start_log_flusher();
        let first = self.monitor(true, 0);
        if let Some(flusher) = flusher {
            flusher.stop();
        }
        let first = first?;

        self.transition(CampaignState::Classifying);
        let mut reruns = Vec::new();
        if classify::needs_rerun(&first, mode) {
            for latent_iteration in 1..=self.config.injection.latent_iterations {
                self.write_commands()?;
                let rerun = self.monitor(false, latent_iteration)?;
                let clean = rerun.outcome == MASKED_FAULTS;
                reruns.push(rerun);
                if !clean {
                    break;
                }
            }
        }
        let persistent = mode == Mode::Simulated
            && first.outcome == LATENT_FAULTS
            && classify::is_persistent(
                &self.iteration.register_diffs,
                self.iteration.memory_diffs,
                &self.iteration.sites,
            );
        let settled = classify::settle(first, &reruns, persistent);
        self.result.set_outcome(settled.outcome, settled.category);
        Ok(())
    }

    fn record_injection(
        &mut self,
        number: usize,
        checkpoint_number: Option<u32>,
        time: Option<f64>,
        site: Option<InjectionSite>,
        failure: Option<String>,
    ) -> Result<(), CampaignError> {
        let mut record = InjectionRecord {
            id: 0,
            result_id: self.result.id,
            injection_number: number as u32 + 1,
            checkpoint_number,
            time,
            site: site.clone(),
            success: failure.is_none(),
            timestamp_ms: now_ms(),
        };
        self.store.insert_injection(&mut record)?;
        match failure {
            Some(reason) => Err(CampaignError::Debugger(DebuggerError::new(format!(
                "Error injecting fault: {reason}"
            )))),
            None => {
                self.iteration.sites.extend(site);
                Ok(())
            }
        }
    }

    /// Injects into checkpoints sampled without replacement from the gold
    /// timeline, in ascending order, running forward between them.
    fn inject_simulated(&mut self) -> Result<(), CampaignError> {
        let count = self.campaign.num_checkpoints;
        if count < 2 {
            return Err(CampaignError::Invalid("campaign has no injectable checkpoints".to_string()));
        }
        let injections = self.config.injection.injections.clamp(1, count - 1);
        let mut checkpoints: Vec<u32> = index::sample(&mut self.rng, (count - 1) as usize, injections as usize)
            .into_iter()
            .map(|i| i as u32 + 1)
            .collect();
        checkpoints.sort_unstable();

        let result_id = self.result.id;
        fs::create_dir_all(self.workspace.injected_checkpoints(result_id))?;
        for (i, &checkpoint_number) in checkpoints.iter().enumerate() {
            let source = if i == 0 {
                self.workspace.gold_checkpoint(checkpoint_number)
            } else {
                self.workspace.monitored_checkpoint(result_id, checkpoint_number)
            };
            let destination = self.workspace.injected_checkpoint(result_id, checkpoint_number);
            let injected = {
                let injector = CheckpointInjector::new(&self.catalog, &self.selector);
                injector.inject(
                    &*self.debugger,
                    &source,
                    &destination,
                    InjectionPlan::Fresh,
                    &mut self.rng,
                )
            };
            match injected {
                Ok(site) => self.record_injection(i, Some(checkpoint_number), None, Some(site), None)?,
                Err(failure) => {
                    let reason = failure.source.to_string();
                    self.record_injection(i, Some(checkpoint_number), None, failure.site, Some(reason))?;
                }
            }
            self.debugger.launch(Some(&destination))?;
            let next = checkpoints.get(i + 1).copied().unwrap_or(count);
            self.compare_span(checkpoint_number, next)?;
            if i + 1 < checkpoints.len() {
                self.debugger.close()?;
            }
        }
        self.debugger.resume()?;
        Ok(())
    }

    /// Runs from checkpoint `from` to `to`, writing the checkpoints that are
    /// compared or that the next injection starts from.
    fn compare_span(&mut self, from: u32, to: u32) -> Result<(), CampaignError> {
        let count = self.campaign.num_checkpoints;
        let result_id = self.result.id;
        for checkpoint_number in from + 1..=to {
            if self.cancel.is_cancelled() {
                return Err(CampaignError::Interrupted);
            }
            self.debugger.run_for(self.campaign.cycles_between)?;
            let compare = self.config.injection.compare_all || checkpoint_number == count;
            if !compare && checkpoint_number != to {
                continue;
            }
            let monitored = self.workspace.monitored_checkpoint(result_id, checkpoint_number);
            self.debugger.write_checkpoint(&monitored)?;
            checkpoint::mark_complete(&monitored)?;
            if compare {
                self.compare_checkpoint(checkpoint_number, &monitored)?;
            }
        }
        Ok(())
    }

    fn compare_checkpoint(&mut self, checkpoint_number: u32, monitored: &Path) -> Result<(), CampaignError> {
        let gold = self.workspace.gold_checkpoint(checkpoint_number);
        let comparator =
            CheckpointComparator::new(&self.compare_catalog, self.config.injection.memory_block_size);
        let register_diffs =
            comparator.compare_registers(&*self.debugger, checkpoint_number, &gold, monitored)?;
        let memory_diffs = comparator.compare_memory(
            checkpoint_number,
            &gold,
            monitored,
            self.config.injection.extract_blocks,
        )?;
        self.iteration
            .tally
            .observe(register_diffs.len(), memory_diffs.len());
        self.iteration.memory_diffs += memory_diffs.len();
        for diff in &register_diffs {
            let mut record = RegisterDiffRecord {
                id: 0,
                result_id: self.result.id,
                diff: diff.clone(),
            };
            self.store.insert_register_diff(&mut record)?;
        }
        for diff in memory_diffs {
            let mut record = MemoryDiffRecord {
                id: 0,
                result_id: self.result.id,
                diff,
            };
            self.store.insert_memory_diff(&mut record)?;
        }
        self.iteration.register_diffs.extend(register_diffs);
        Ok(())
    }

    /// Injects at random times during the run by halting the live device
    /// and rewriting one register.
    fn inject_hardware(&mut self) -> Result<(), CampaignError> {
        let injections = self.config.injection.injections.max(1);
        let span = self.campaign.execution_time;
        let mut times: Vec<f64> = (0..injections)
            .map(|_| {
                if span > 0.0 {
                    self.rng.random_range(0.0..span)
                } else {
                    0.0
                }
            })
            .collect();
        times.sort_by(f64::total_cmp);

        let started = Instant::now();
        for (i, time) in times.into_iter().enumerate() {
            if let Some(wait) = Duration::from_secs_f64(time).checked_sub(started.elapsed()) {
                if self.cancel.sleep(wait) {
                    return Err(CampaignError::Interrupted);
                }
            }
            self.debugger.halt()?;
            let chosen = {
                let injector = CheckpointInjector::new(&self.catalog, &self.selector);
                injector.choose_site(&mut self.rng)
            };
            let mut site = match chosen {
                Ok(site) => site,
                Err(err) => return self.record_injection(i, None, Some(time), None, Some(err.to_string())),
            };
            match self.flip_live(&mut site) {
                Ok(()) => self.record_injection(i, None, Some(time), Some(site), None)?,
                Err(err) if err.is_interrupted() => return Err(CampaignError::Interrupted),
                Err(err) => return self.record_injection(i, None, Some(time), Some(site), Some(err.kind)),
            }
            self.debugger.resume()?;
        }
        Ok(())
    }

    fn flip_live(&mut self, site: &mut InjectionSite) -> Result<(), DebuggerError> {
        let index = site.register_index.clone();
        let gold = self
            .debugger
            .read_register(&site.config_object, &site.register, index.as_deref())?;
        let injected = flip_scalar(gold, site.num_bits, site.bit).map_err(|e| DebuggerError::new(e.to_string()))?;
        self.debugger
            .write_register(&site.config_object, &site.register, index.as_deref(), injected)?;
        site.gold_value = Some(format_hex(gold));
        site.injected_value = Some(format_hex(injected));
        debug!(
            "Injected {}:{} bit {} at run time",
            site.config_object,
            site.register_path(),
            site.bit
        );
        Ok(())
    }

    fn start_log_flusher(&mut self) -> Option<BackgroundTask> {
        let delay = Duration::from_millis(self.config.injection.log_delay_ms?);
        if self.campaign.log_files.is_empty() {
            return None;
        }
        let mut transfer = self.debugger.dut().ok()?.file_transfer()?;
        let files = self.campaign.log_files.clone();
        let dir = self.workspace.result_data(self.result.id);
        Some(BackgroundTask::spawn("log-flusher", delay, move || {
            for file in &files {
                if let Err(e) = transfer.get(file, &dir) {
                    debug!("Failed to flush {file}: {e}");
                }
            }
        }))
    }

    /// Waits for the run to finish and gathers the evidence for its
    /// classification. Re-runs (`latent_iteration > 0`) do not count the
    /// injection's checkpoint diffs.
    fn monitor(&mut self, log_time: bool, latent_iteration: u32) -> Result<Classification, CampaignError> {
        let use_aux = self.campaign.use_aux;
        let read = {
            let (dut, aux) = self.debugger.channels()?;
            let aux = aux.filter(|_| use_aux);
            let dut_timeout = dut.timeout();
            let aux_timeout = aux.as_ref().map_or(dut_timeout, |a| a.timeout());
            read_both(dut, aux, dut_timeout, aux_timeout)
        };

        let mut observation = Observation {
            latent_faults: latent_iteration == 0 && self.iteration.tally.any(),
            ..Default::default()
        };
        let mut aux_detected = None;
        if let Some(aux) = &read.aux {
            match aux {
                Ok(text) => aux_detected = classify::detected_errors(text),
                Err(err) if err.is_interrupted() => return Err(CampaignError::Interrupted),
                Err(err) => {
                    observation.aux_error = Some(err.outcome());
                    aux_detected = classify::detected_errors(err.output());
                }
            }
        }
        let dut_detected = match &read.dut {
            Ok(text) => classify::detected_errors(text),
            Err(err) if err.is_interrupted() => return Err(CampaignError::Interrupted),
            Err(err) => {
                observation.dut_error = Some(err.outcome());
                classify::detected_errors(err.output())
            }
        };
        observation.detected_errors = classify::combine_detected_errors(dut_detected, aux_detected);

        if log_time {
            if let Err(err) = self.log_time() {
                if err.is_interrupted() {
                    return Err(CampaignError::Interrupted);
                }
                return Ok(Classification::new(err.kind, self.debugger.kind().error_category()));
            }
        }
        if self.campaign.output_file.is_some()
            && observation.dut_error.is_none()
            && observation.aux_error.is_none()
        {
            match self.check_output() {
                Ok(data_diff) => observation.data_diff = Some(data_diff),
                Err(err) => observation.output_error = Some(err),
            }
        }
        self.fetch_logs(latent_iteration)?;

        if latent_iteration == 0 {
            self.result.data_diff = observation.data_diff;
            self.result.detected_errors = observation.detected_errors;
        }
        Ok(classify::classify(&observation))
    }

    fn log_time(&mut self) -> Result<(), DebuggerError> {
        match self.campaign.mode {
            Mode::Simulated => {
                self.debugger.halt()?;
                let (cycles, seconds) = self.debugger.get_time()?;
                self.result.cycles = Some(cycles.saturating_sub(self.campaign.start_cycle));
                self.result.execution_time = Some(seconds - self.campaign.start_time);
                self.debugger.resume()
            }
            Mode::Hardware => {
                self.result.execution_time = Some(self.debugger.dut()?.get_timer_value());
                Ok(())
            }
        }
    }

    /// Fetches the output file and returns its similarity to the gold copy.
    /// Identical copies are not kept.
    fn check_output(&mut self) -> Result<f64, OutputError> {
        let Some(output_file) = self.campaign.output_file.clone() else {
            return Ok(1.0);
        };
        let result_dir = self.workspace.result_data(self.result.id);
        let gold_path = match Path::new(&output_file).file_name() {
            Some(name) => self.workspace.gold_data().join(name),
            None => return Err(OutputError::Other(format!("Invalid output file {output_file:?}"))),
        };
        let aux_side = self.campaign.aux_output_file;
        let (dut, aux) = self
            .debugger
            .channels()
            .map_err(|e| OutputError::Other(e.kind))?;
        let channel = match aux {
            Some(aux) if aux_side => aux,
            _ => dut,
        };
        let fetched = channel.get_file(&output_file, &result_dir);
        if let Err(e) = channel.command(&format!("rm {output_file}")) {
            debug!("Failed to remove {output_file} from {}: {e}", channel.name());
        }
        let local = fetched.map_err(output_error)?;
        if !local.is_file() {
            return Err(OutputError::Missing);
        }
        let gold = fs::read(&gold_path)
            .map_err(|e| OutputError::Other(format!("Missing gold output file: {e}")))?;
        let output = fs::read(&local).map_err(|e| OutputError::Other(e.to_string()))?;
        let data_diff = quick_ratio(&String::from_utf8_lossy(&gold), &String::from_utf8_lossy(&output));
        if data_diff >= 1.0 {
            if let Err(e) = fs::remove_file(&local) {
                debug!("Failed to remove {local:?}: {e}");
            }
            if fs::read_dir(&result_dir).is_ok_and(|mut entries| entries.next().is_none()) {
                if let Err(e) = fs::remove_dir(&result_dir) {
                    debug!("Failed to remove {result_dir:?}: {e}");
                }
            }
        }
        Ok(data_diff)
    }

    fn fetch_logs(&mut self, latent_iteration: u32) -> Result<(), CampaignError> {
        if self.campaign.log_files.is_empty() && self.campaign.aux_log_files.is_empty() {
            return Ok(());
        }
        let mut dir = self.workspace.result_data(self.result.id);
        if latent_iteration > 0 {
            dir = dir.join(format!("latent-{latent_iteration}"));
        }
        let log_files = self.campaign.log_files.clone();
        let aux_log_files = self.campaign.aux_log_files.clone();
        let mut missing = Vec::new();
        {
            let (dut, mut aux) = self.debugger.channels()?;
            for file in &log_files {
                if let Err(e) = dut.get_file(file, &dir) {
                    missing.push(("DUT", format!("{file}: {e}")));
                }
            }
            if let Some(aux) = aux.as_deref_mut() {
                for file in &aux_log_files {
                    if let Err(e) = aux.get_file(file, &dir) {
                        missing.push(("AUX", format!("{file}: {e}")));
                    }
                }
            }
        }
        for (source, description) in missing {
            self.record_event(EventLevel::Warning, source, "Missing log file", Some(description), Some(false))?;
        }
        Ok(())
    }

    /// Lets a hardware device finish whatever it was running after a
    /// failed injection.
    fn drain_devices(&mut self) {
        if let Err(e) = self.debugger.resume() {
            debug!("Resume after failure: {e}");
            return;
        }
        let use_aux = self.campaign.use_aux;
        if let Ok((dut, aux)) = self.debugger.channels() {
            let aux = aux.filter(|_| use_aux);
            let dut_timeout = dut.timeout();
            let aux_timeout = aux.as_ref().map_or(dut_timeout, |a| a.timeout());
            let read = read_both(dut, aux, dut_timeout, aux_timeout);
            debug!("Drained devices: DUT ok {}", read.dut.is_ok());
        }
    }

    /// Checks the consoles for late crash messages.
    fn flush_devices(&mut self) {
        let Ok((dut, aux)) = self.debugger.channels() else {
            return;
        };
        match dut.read_available() {
            Ok(_) => {}
            Err(ChannelError::Signature { outcome, .. }) => {
                self.result
                    .set_outcome(outcome, OutcomeCategory::PostExecutionError);
            }
            Err(e) => debug!("Flushing DUT: {e}"),
        }
        if let Some(aux) = aux {
            if let Err(e) = aux.read_available() {
                debug!("Flushing AUX: {e}");
            }
        }
    }

    fn collect_channel_output(&mut self) {
        if let Ok((dut, aux)) = self.debugger.channels() {
            self.result.dut_output.push_str(&dut.take_output());
            if let Some(aux) = aux {
                self.result.aux_output.push_str(&aux.take_output());
            }
        }
    }

    fn collect_debugger_output(&mut self) {
        self.result
            .debugger_output
            .push_str(&self.debugger.take_output());
    }

    fn remove_injected_checkpoints(&self) {
        let dir = self.workspace.injected_checkpoints(self.result.id);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("Failed to remove {dir:?}: {e}");
            }
        }
    }

    fn finish_iteration(&mut self) -> Result<(), CampaignError> {
        match self.campaign.mode {
            Mode::Simulated => {
                self.collect_channel_output();
                if let Err(err) = self.debugger.close() {
                    if err.is_interrupted() {
                        return Err(CampaignError::Interrupted);
                    }
                    self.result
                        .set_outcome(err.kind, self.debugger.kind().error_category());
                }
                self.collect_debugger_output();
                self.remove_injected_checkpoints();
            }
            Mode::Hardware => {
                self.flush_devices();
                self.collect_channel_output();
                self.collect_debugger_output();
            }
        }
        Ok(())
    }

    fn uncaught(&mut self, payload: Box<dyn Any + Send>) -> Result<(), CampaignError> {
        let message = panic_message(payload.as_ref());
        error!("Uncaught exception in result {}: {message}", self.result.id);
        self.result
            .set_outcome(UNCAUGHT_EXCEPTION, OutcomeCategory::Incomplete);
        let backtrace = Backtrace::force_capture();
        self.record_event(
            EventLevel::Error,
            "Fault injector",
            "Exception",
            Some(format!("{message}\n{backtrace}")),
            None,
        )?;
        self.collect_channel_output();
        if let Err(e) = self.debugger.close() {
            warn!("Error closing debugger: {e}");
        }
        self.collect_debugger_output();
        self.remove_injected_checkpoints();
        Ok(())
    }

    /// Persists the in-flight result as interrupted and releases the device.
    fn abandon_interrupted(&mut self) -> Result<(), CampaignError> {
        warn!("Result {} interrupted", self.result.id);
        self.result
            .set_outcome(INTERRUPTED, OutcomeCategory::Incomplete);
        if self.hardware() {
            if let Err(e) = self.debugger.resume() {
                debug!("Resume after interrupt: {e}");
            }
            if let Ok(dut) = self.debugger.dut() {
                if let Err(e) = dut.read_available() {
                    debug!("Flush after interrupt: {e}");
                }
            }
        }
        self.collect_channel_output();
        if let Err(e) = self.debugger.close() {
            debug!("Close after interrupt: {e}");
        }
        self.collect_debugger_output();
        self.remove_injected_checkpoints();
        self.record_event(EventLevel::Warning, "Fault injector", "Interrupted", None, None)?;
        self.result.timestamp_ms = now_ms();
        self.store.update_result(&self.result)?;
        self.result_open = false;
        Ok(())
    }

    fn summary(&self) -> String {
        let mut line = format!(
            "{}: {} - {}",
            self.result.id, self.result.outcome_category, self.result.outcome
        );
        if let Some(data_diff) = self.result.data_diff.filter(|d| *d < 1.0) {
            line.push_str(&format!(" {:.2}%", data_diff * 100.0));
        }
        line
    }

    /// Persists the finished result and opens the next placeholder.
    fn log_result(&mut self) -> Result<(), CampaignError> {
        self.transition(CampaignState::Logged);
        if self.result.is_in_progress() {
            self.result.set_outcome(EXITED, OutcomeCategory::Injector);
        }
        self.result.timestamp_ms = now_ms();
        self.store.update_result(&self.result)?;
        info!("{}", self.summary());
        self.iteration = IterationContext::default();
        self.open_result()
    }

    /// Closes the debugger and resolves the open placeholder: it is deleted
    /// when nothing refers to it, otherwise persisted with a terminal
    /// outcome.
    pub fn close(&mut self) -> Result<(), CampaignError> {
        self.transition(CampaignState::Closing);
        if let Err(e) = self.debugger.close() {
            warn!("Error closing debugger: {e}");
        }
        let transcript = self.debugger.take_output();
        if !transcript.is_empty() {
            debug!("Debugger transcript after close: {transcript:?}");
        }
        if !self.result_open {
            return Ok(());
        }
        self.result_open = false;
        if self.store.has_children(self.result.id)? || self.result.has_output() {
            if self.result.is_in_progress() {
                self.result.set_outcome(EXITED, OutcomeCategory::Injector);
            }
            self.result.timestamp_ms = now_ms();
            self.store.update_result(&self.result)?;
        } else {
            self.store.delete_result(self.result.id)?;
        }
        Ok(())
    }

    // Recovery

    /// Resets the device with bounded retries, power cycling it when every
    /// attempt fails.
    fn reset_device(&mut self) -> Result<(), CampaignError> {
        let policy = RetryPolicy::new(
            self.config.retry.reset_attempts,
            Duration::from_secs(self.config.retry.reset_backoff_secs),
        );
        let mut failures = Vec::new();
        let reset = {
            let debugger = &mut self.debugger;
            let cancel = &self.cancel;
            policy.run(
                "Resetting DUT",
                Some(cancel),
                |e: &DebuggerError| !e.is_interrupted(),
                |attempt| {
                    debugger
                        .reset()
                        .inspect_err(|e| failures.push(format!("Attempt {attempt}: {e}")))
                },
            )
        };
        for failure in failures {
            self.record_event(
                EventLevel::Warning,
                "Debugger",
                "Error resetting DUT",
                Some(failure),
                Some(false),
            )?;
        }
        let err = match reset {
            Ok(()) => return Ok(()),
            Err(err) if err.is_interrupted() || self.cancel.is_cancelled() => {
                return Err(CampaignError::Interrupted);
            }
            Err(err) => err,
        };
        warn!("Reset failed, power cycling: {err}");
        let cycled = self.debugger.power_cycle();
        self.record_event(
            EventLevel::Warning,
            "Debugger",
            "Power cycle",
            Some(err.kind.clone()),
            Some(cycled.is_ok()),
        )?;
        cycled.map_err(|cycle_err| {
            warn!("Power cycle failed: {cycle_err}");
            CampaignError::from(err)
        })
    }

    /// Keeps resetting until the device comes back or the campaign is
    /// interrupted.
    fn recover(&mut self) -> Result<(), CampaignError> {
        let backoff = Duration::from_secs(self.config.retry.reset_backoff_secs);
        loop {
            match self.reset_device() {
                Ok(()) => return Ok(()),
                Err(CampaignError::Interrupted) => return Err(CampaignError::Interrupted),
                Err(err) => {
                    let scoped = err.into_scoped()?;
                    warn!("Device did not recover: {scoped}");
                    if self.cancel.sleep(backoff) {
                        return Err(CampaignError::Interrupted);
                    }
                }
            }
        }
    }

    // Supervision

    /// Runs the application without injections for about `run_time`,
    /// classifying every run and resetting the device after crashes.
    pub fn supervise(&mut self, run_time: Duration) -> Result<u64, CampaignError> {
        let per_run = self.campaign.execution_time;
        let runs = if per_run > 0.0 {
            (run_time.as_secs_f64() / per_run).floor().max(1.0) as u64
        } else {
            1
        };
        info!("Supervising {runs} runs");
        let budget = IterationBudget::counted(runs);
        let outcome = self.supervise_loop(&budget);
        let closed = self.close();
        let completed = outcome?;
        closed?;
        Ok(completed)
    }

    fn supervise_loop(&mut self, budget: &IterationBudget) -> Result<u64, CampaignError> {
        self.transition(CampaignState::Resetting);
        match self.campaign.mode {
            Mode::Simulated => self.debugger.launch(None)?,
            Mode::Hardware => self.reset_device()?,
        }
        self.open_result()?;
        let mut completed = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CampaignError::Interrupted);
            }
            let Some(iteration) = budget.claim() else {
                break;
            };
            self.result.iteration = Some(iteration);
            match self.guarded(Self::supervised_run) {
                Ok(()) => {}
                Err(CampaignError::Interrupted) => {
                    self.abandon_interrupted()?;
                    return Err(CampaignError::Interrupted);
                }
                Err(err) => return Err(err),
            }
            let crashed = RESET_OUTCOMES.contains(&self.result.outcome.as_str());
            self.log_result()?;
            completed += 1;
            if crashed {
                self.recover()?;
            }
        }
        Ok(completed)
    }

    fn supervised_run(&mut self) -> Result<(), CampaignError> {
        self.iteration = IterationContext::default();
        self.result.num_injections = 0;
        let mut record = InjectionRecord {
            id: 0,
            result_id: self.result.id,
            injection_number: 0,
            checkpoint_number: None,
            time: None,
            site: None,
            success: false,
            timestamp_ms: now_ms(),
        };
        self.store.insert_injection(&mut record)?;

        self.transition(CampaignState::Executing);
        let run = self.write_commands().and_then(|()| {
            self.transition(CampaignState::Monitoring);
            self.monitor(true, 0)
        });
        match run {
            Ok(classification) => {
                self.result
                    .set_outcome(classification.outcome, classification.category);
            }
            Err(err) => {
                let scoped = err.into_scoped()?;
                self.result
                    .set_outcome(scoped.kind, self.debugger.kind().error_category());
            }
        }
        self.flush_devices();
        self.collect_channel_output();
        self.collect_debugger_output();
        Ok(())
    }

    // Offline inspection

    /// Rebuilds the injected checkpoints of `result_id` by replaying its
    /// recorded injections. Returns the last injected checkpoint.
    pub fn regenerate_checkpoint(&mut self, result_id: u64) -> Result<PathBuf, CampaignError> {
        if self.hardware() {
            return Err(CampaignError::Invalid(
                "checkpoints exist only for simulated campaigns".to_string(),
            ));
        }
        let planned: Vec<(u32, InjectionSite)> = self
            .store
            .injections_for(result_id)?
            .into_iter()
            .filter(|record| record.success)
            .filter_map(|record| Some((record.checkpoint_number?, record.site?)))
            .collect();
        if planned.is_empty() {
            return Err(CampaignError::Invalid(format!(
                "result {result_id} has no replayable injections"
            )));
        }

        let mut last = PathBuf::new();
        for (i, (checkpoint_number, site)) in planned.iter().enumerate() {
            let source = if i == 0 {
                self.workspace.gold_checkpoint(*checkpoint_number)
            } else {
                self.workspace.monitored_checkpoint(result_id, *checkpoint_number)
            };
            let destination = self.workspace.injected_checkpoint(result_id, *checkpoint_number);
            {
                let injector = CheckpointInjector::new(&self.catalog, &self.selector);
                injector
                    .inject(
                        &*self.debugger,
                        &source,
                        &destination,
                        InjectionPlan::Replay(site),
                        &mut self.rng,
                    )
                    .map_err(|failure| {
                        CampaignError::Invalid(format!("replay failed: {}", failure.source))
                    })?;
            }
            if let Some((next, _)) = planned.get(i + 1) {
                self.debugger.launch(Some(&destination))?;
                self.debugger
                    .run_for(self.campaign.cycles_between * u64::from(next - checkpoint_number))?;
                let monitored = self.workspace.monitored_checkpoint(result_id, *next);
                self.debugger.write_checkpoint(&monitored)?;
                checkpoint::mark_complete(&monitored)?;
                self.debugger.close()?;
            }
            last = destination;
        }
        info!("Regenerated {} for result {result_id}", last.display());
        Ok(last)
    }
}

/// Creates a campaign and runs its setup. Any failure here is fatal; the
/// debugger is closed either way.
pub fn setup_campaign(
    config: &UpsetConfig,
    debugger: Box<dyn Debugger>,
    store: Arc<dyn ResultStore>,
    cancel: CancellationToken,
) -> Result<Campaign, CampaignError> {
    let campaign = campaign_from_config(config);
    let mut orchestrator = Orchestrator::new(config, campaign, debugger, store, 0, cancel)?;
    orchestrator.register_campaign()?;
    let setup = orchestrator.setup();
    if let Err(e) = orchestrator.debugger.close() {
        warn!("Error closing debugger after setup: {e}");
    }
    setup?;
    Ok(orchestrator.campaign)
}

/// Runs `config.workers.threads` workers against one shared budget, each
/// with its own debugger. Returns the number of completed iterations.
pub fn run_campaign<F>(
    config: &UpsetConfig,
    campaign: &Campaign,
    store: Arc<dyn ResultStore>,
    cancel: &CancellationToken,
    budget: &IterationBudget,
    make_debugger: F,
) -> Result<u64, CampaignError>
where
    F: Fn(usize) -> Result<Box<dyn Debugger>, DebuggerError> + Sync,
{
    let outcomes = run_workers(config.workers.threads, |worker| {
        let debugger = make_debugger(worker)?;
        let mut orchestrator = Orchestrator::new(
            config,
            campaign.clone(),
            debugger,
            Arc::clone(&store),
            worker,
            cancel.clone(),
        )?;
        orchestrator.run_injections(budget)
    });

    let mut completed = 0;
    let mut first_error = None;
    for (worker, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(Ok(count)) => completed += count,
            Ok(Err(err)) => {
                error!("Worker {worker} stopped: {err}");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(err) => {
                error!("{err}");
                if first_error.is_none() {
                    first_error = Some(err.into());
                }
            }
        }
    }
    info!("Campaign {}: {completed} iterations", campaign.id);
    match first_error {
        Some(err) => Err(err),
        None => Ok(completed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::AttributeStore;
    use crate::debugger::dummy::{DummyProgram, DummySession, DummySettings};
    use crate::store::InMemoryResultStore;
    use crate::value::Value;
    use tempfile::{TempDir, tempdir};

    const CATALOG: &str = r#"
architecture = "unit"
object-prefix = "DUT"

[[targets]]
name = "CPU"
object = ".cpu"
registers = [{ name = "r0", bits = 8 }]
"#;

    fn config(dir: &TempDir, mode: Mode) -> UpsetConfig {
        let catalog = dir.path().join("catalog.toml");
        fs::write(&catalog, CATALOG).unwrap();
        let mut config = UpsetConfig::default();
        config.campaign.architecture = "unit".to_string();
        config.campaign.mode = mode;
        config.campaign.command = "./app".to_string();
        config.campaign.output_file = Some("out.txt".to_string());
        config.campaign.timing_iterations = 2;
        config.campaign.num_checkpoints = 2;
        config.campaign.catalog = Some(catalog);
        config.workspace = dir.path().join("workspace");
        config.retry.reset_backoff_secs = 0;
        config
    }

    fn dummy(cancel: &CancellationToken) -> Box<dyn Debugger> {
        let mut registers = AttributeStore::new();
        registers.set("DUT.cpu", "r0", Value::Scalar(42));
        let program = DummyProgram::new("./app", 100, registers)
            .printing_register("DUT.cpu", "r0")
            .with_output_file("out.txt");
        Box::new(DummySession::new(program, DummySettings::default(), cancel.clone()).unwrap())
    }

    #[test]
    fn scoped_errors_are_separated_from_fatal_ones() {
        let scoped = CampaignError::from(ChannelError::Io("gone".to_string())).into_scoped();
        assert!(scoped.is_ok());
        let fatal = CampaignError::from(StoreError::NoCampaign).into_scoped();
        assert!(matches!(fatal, Err(CampaignError::Store(StoreError::NoCampaign))));
        let interrupted = CampaignError::from(DebuggerError::new("Interrupted"));
        assert!(matches!(interrupted, CampaignError::Interrupted));
    }

    #[test]
    fn setup_calibrates_and_writes_gold_state() {
        let dir = tempdir().unwrap();
        let config = config(&dir, Mode::Simulated);
        let cancel = CancellationToken::new();
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let campaign = setup_campaign(&config, dummy(&cancel), Arc::clone(&store), cancel).unwrap();

        assert_eq!(campaign.cycles, 100);
        assert_eq!(campaign.cycles_between, 50);
        let workspace = Workspace::new(&config.workspace, campaign.id);
        assert!(workspace.gold_checkpoint(1).is_dir());
        assert!(checkpoint::is_complete(&workspace.gold_checkpoint(2)));
        assert_eq!(fs::read_to_string(workspace.gold_data().join("out.txt")).unwrap(), "42");
        assert!(campaign.dut_output.contains("***drseus_checkpoint: 2***"));
        assert_eq!(store.campaign(Some(campaign.id)).unwrap().cycles, 100);
    }

    #[test]
    fn setup_rejects_a_single_gold_checkpoint() {
        let dir = tempdir().unwrap();
        let mut config = config(&dir, Mode::Simulated);
        config.campaign.num_checkpoints = 1;
        let cancel = CancellationToken::new();
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        match setup_campaign(&config, dummy(&cancel), store, cancel) {
            Err(CampaignError::Invalid(_)) => {}
            other => panic!("Expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn simulated_injection_is_classified_as_data_error() {
        let dir = tempdir().unwrap();
        let config = config(&dir, Mode::Simulated);
        let cancel = CancellationToken::new();
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let campaign = setup_campaign(&config, dummy(&cancel), Arc::clone(&store), cancel.clone()).unwrap();

        let mut orchestrator =
            Orchestrator::new(&config, campaign, dummy(&cancel), Arc::clone(&store), 0, cancel).unwrap();
        let completed = orchestrator.run_injections(&IterationBudget::counted(1)).unwrap();
        assert_eq!(completed, 1);
        assert_eq!(orchestrator.state(), CampaignState::Closing);

        let results = store.results_for(orchestrator.campaign().id).unwrap();
        assert_eq!(results.len(), 1, "Placeholder should be deleted, got {results:?}");
        let result = &results[0];
        assert_eq!(result.outcome_category, OutcomeCategory::DataError);
        assert_eq!(result.outcome, classify::SILENT_DATA_ERROR);
        assert_eq!(result.num_register_diffs, 1);
        assert!(result.data_diff.is_some_and(|d| d < 1.0));
        assert_eq!(result.cycles, Some(100));

        let injections = store.injections_for(result.id).unwrap();
        assert_eq!(injections.len(), 1);
        assert_eq!(injections[0].checkpoint_number, Some(1));
        assert!(injections[0].success);
        assert!(!orchestrator.workspace().injected_checkpoints(result.id).exists());
    }

    #[test]
    fn hardware_injection_flips_a_live_register() {
        let dir = tempdir().unwrap();
        let config = config(&dir, Mode::Hardware);
        let cancel = CancellationToken::new();
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let campaign = setup_campaign(&config, dummy(&cancel), Arc::clone(&store), cancel.clone()).unwrap();
        assert_eq!(campaign.num_checkpoints, 0);

        let mut orchestrator =
            Orchestrator::new(&config, campaign, dummy(&cancel), Arc::clone(&store), 0, cancel).unwrap();
        orchestrator.run_injections(&IterationBudget::counted(1)).unwrap();

        let results = store.results_for(orchestrator.campaign().id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome_category, OutcomeCategory::DataError);
        assert_eq!(results[0].num_register_diffs, 0);
        assert!(results[0].execution_time.is_some());
        let injections = store.injections_for(results[0].id).unwrap();
        assert!(injections[0].time.is_some());
        assert_eq!(injections[0].checkpoint_number, None);
        let site = injections[0].site.as_ref().unwrap();
        assert_eq!(site.gold_value.as_deref(), Some("0x2a"));
    }

    #[test]
    fn supervised_runs_log_empty_injections() {
        let dir = tempdir().unwrap();
        let config = config(&dir, Mode::Hardware);
        let cancel = CancellationToken::new();
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let mut campaign =
            setup_campaign(&config, dummy(&cancel), Arc::clone(&store), cancel.clone()).unwrap();
        campaign.execution_time = 1.0;

        let mut orchestrator =
            Orchestrator::new(&config, campaign, dummy(&cancel), Arc::clone(&store), 0, cancel).unwrap();
        let runs = orchestrator.supervise(Duration::from_secs(3)).unwrap();
        assert_eq!(runs, 3);
        let results = store.results_for(orchestrator.campaign().id).unwrap();
        assert_eq!(results.len(), 3);
        for result in &results {
            assert_eq!(result.outcome, MASKED_FAULTS);
            assert_eq!(result.num_injections, 0);
            let injections = store.injections_for(result.id).unwrap();
            assert_eq!(injections[0].injection_number, 0);
        }
    }

    #[test]
    fn cancelled_worker_leaves_no_placeholder() {
        let dir = tempdir().unwrap();
        let config = config(&dir, Mode::Simulated);
        let cancel = CancellationToken::new();
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let campaign = setup_campaign(&config, dummy(&cancel), Arc::clone(&store), cancel.clone()).unwrap();

        cancel.cancel();
        let mut orchestrator =
            Orchestrator::new(&config, campaign, dummy(&cancel), Arc::clone(&store), 0, cancel).unwrap();
        match orchestrator.run_injections(&IterationBudget::counted(5)) {
            Err(CampaignError::Interrupted) => {}
            other => panic!("Expected Interrupted, got {other:?}"),
        }
        assert!(store.results_for(orchestrator.campaign().id).unwrap().is_empty());
    }
}
