use crate::campaign::Mode;
use crate::channel::ScpTransfer;
use crate::checkpoint::AttributeStore;
use crate::debugger::DebuggerKind;
use crate::debugger::dummy::{DummyProgram, DummySettings};
use crate::debugger::jtag::{ConsoleEndpoint, DeviceEndpoint, JtagSettings};
use crate::debugger::simics::{ConsoleSettings, SimicsSettings, SshSettings};
use crate::value::{Value, ValueError, parse_literal};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSettings {
    pub architecture: String,
    pub mode: Mode,
    pub command: String,
    #[serde(default)]
    pub aux_command: Option<String>,
    #[serde(default)]
    pub output_file: Option<String>,
    /// Fetch the output file from the AUX device instead of the DUT.
    #[serde(default)]
    pub aux_output_file: bool,
    #[serde(default)]
    pub log_files: Vec<String>,
    #[serde(default)]
    pub aux_log_files: Vec<String>,
    /// Local files copied to the DUT during setup, e.g. the application.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub aux_files: Vec<PathBuf>,
    #[serde(default = "default_timing_iterations")]
    pub timing_iterations: u32,
    #[serde(default = "default_num_checkpoints")]
    pub num_checkpoints: u32,
    #[serde(default)]
    pub include_caches: bool,
    #[serde(default)]
    pub selected_targets: Option<Vec<String>>,
    #[serde(default)]
    pub selected_registers: Option<Vec<String>>,
    /// Catalog definition file; the built-in catalog of `architecture` when
    /// absent.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
}

pub fn default_timing_iterations() -> u32 {
    5
}

pub fn default_num_checkpoints() -> u32 {
    50
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InjectionSettings {
    #[serde(default = "default_injections")]
    pub injections: u32,
    #[serde(default)]
    pub iterations: Option<u64>,
    #[serde(default)]
    pub time_budget_secs: Option<u64>,
    /// Compare every checkpoint after an injection, not just the last one.
    #[serde(default)]
    pub compare_all: bool,
    #[serde(default)]
    pub extract_blocks: bool,
    #[serde(default = "default_memory_block_size")]
    pub memory_block_size: usize,
    #[serde(default = "default_latent_iterations")]
    pub latent_iterations: u32,
    /// Interval of the background log-file flush; disabled when absent.
    #[serde(default)]
    pub log_delay_ms: Option<u64>,
}

pub fn default_injections() -> u32 {
    1
}

pub fn default_memory_block_size() -> usize {
    4096
}

pub fn default_latent_iterations() -> u32 {
    1
}

impl Default for InjectionSettings {
    fn default() -> Self {
        Self {
            injections: default_injections(),
            iterations: None,
            time_budget_secs: None,
            compare_all: false,
            extract_blocks: false,
            memory_block_size: default_memory_block_size(),
            latent_iterations: default_latent_iterations(),
            log_delay_ms: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    #[serde(default = "default_prompt")]
    pub dut_prompt: String,
    #[serde(default = "default_prompt")]
    pub aux_prompt: String,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,
}

pub fn default_prompt() -> String {
    "root@p2020rdb:~# ".to_string()
}

pub fn default_read_timeout_secs() -> u64 {
    300
}

pub fn default_boot_timeout_secs() -> u64 {
    600
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            dut_prompt: default_prompt(),
            aux_prompt: default_prompt(),
            read_timeout_secs: default_read_timeout_secs(),
            boot_timeout_secs: default_boot_timeout_secs(),
        }
    }
}

impl ChannelConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SimicsConfig {
    pub executable: PathBuf,
    pub boot_script: PathBuf,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default = "default_simics_prompt")]
    pub prompt: String,
    #[serde(default = "default_simics_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_launch_attempts")]
    pub launch_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub launch_backoff_secs: u64,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_identity: Option<PathBuf>,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default)]
    pub checkpoint_export: Option<String>,
    #[serde(default)]
    pub checkpoint_import: Option<String>,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

pub fn default_simics_prompt() -> String {
    "simics> ".to_string()
}

pub fn default_simics_timeout_secs() -> u64 {
    30
}

pub fn default_launch_attempts() -> u32 {
    10
}

pub fn default_backoff_secs() -> u64 {
    30
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_remote_dir() -> String {
    "~".to_string()
}

impl SimicsConfig {
    pub fn settings(&self, channel: &ChannelConfig, use_aux: bool) -> SimicsSettings {
        let mut settings = SimicsSettings::new(&self.executable, &self.boot_script);
        settings.working_dir = self.working_dir.clone();
        if let Some(args) = &self.args {
            settings.args = args.clone();
        }
        settings.prompt = self.prompt.clone();
        settings.timeout = Duration::from_secs(self.timeout_secs);
        settings.launch_attempts = self.launch_attempts;
        settings.launch_backoff = Duration::from_secs(self.launch_backoff_secs);
        settings.dut = ConsoleSettings {
            prompt: channel.dut_prompt.clone(),
            timeout: channel.read_timeout(),
            boot_timeout: channel.boot_timeout(),
        };
        settings.aux = use_aux.then(|| ConsoleSettings {
            prompt: channel.aux_prompt.clone(),
            timeout: channel.read_timeout(),
            boot_timeout: channel.boot_timeout(),
        });
        settings.ssh = SshSettings {
            user: self.ssh_user.clone(),
            identity: self.ssh_identity.clone(),
            remote_dir: self.remote_dir.clone(),
        };
        settings.checkpoint_export = self.checkpoint_export.clone();
        settings.checkpoint_import = self.checkpoint_import.clone();
        settings
    }
}

/// Where a board's console is reached, and how files are copied to it.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    #[serde(default)]
    pub serial: Option<PathBuf>,
    /// `host:port` of a telnet-style console server.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub scp_host: Option<String>,
    #[serde(default = "default_scp_port")]
    pub scp_port: u16,
    #[serde(default = "default_ssh_user")]
    pub scp_user: String,
    #[serde(default)]
    pub scp_identity: Option<PathBuf>,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
}

fn default_scp_port() -> u16 {
    22
}

impl EndpointConfig {
    fn endpoint(&self, name: &str, prompt: &str, timeout: Duration) -> Result<DeviceEndpoint, anyhow::Error> {
        let endpoint = match (&self.serial, &self.address) {
            (Some(path), None) => ConsoleEndpoint::Serial(path.clone()),
            (None, Some(address)) => ConsoleEndpoint::Tcp(address.clone()),
            _ => anyhow::bail!("{name} endpoint needs exactly one of serial or address"),
        };
        let scp = self.scp_host.as_ref().map(|host| ScpTransfer {
            host: host.clone(),
            port: self.scp_port,
            user: self.scp_user.clone(),
            identity: self.scp_identity.clone(),
            remote_dir: self.remote_dir.clone(),
        });
        Ok(DeviceEndpoint {
            endpoint,
            prompt: prompt.to_string(),
            timeout,
            scp,
        })
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct JtagConfig {
    pub control_address: String,
    pub dut: EndpointConfig,
    #[serde(default)]
    pub aux: Option<EndpointConfig>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub reset_command: Option<String>,
    #[serde(default)]
    pub halt_command: Option<String>,
    #[serde(default)]
    pub resume_command: Option<String>,
    #[serde(default)]
    pub read_register_command: Option<String>,
    #[serde(default)]
    pub write_register_command: Option<String>,
    #[serde(default)]
    pub power_cycle_command: Option<String>,
}

impl JtagConfig {
    pub fn settings(&self, channel: &ChannelConfig) -> Result<JtagSettings, anyhow::Error> {
        let dut = self
            .dut
            .endpoint("DUT", &channel.dut_prompt, channel.read_timeout())?;
        let mut settings = JtagSettings::new(&self.control_address, dut);
        settings.aux = self
            .aux
            .as_ref()
            .map(|aux| aux.endpoint("AUX", &channel.aux_prompt, channel.read_timeout()))
            .transpose()?;
        let overrides = [
            (&self.prompt, &mut settings.prompt),
            (&self.reset_command, &mut settings.reset_command),
            (&self.halt_command, &mut settings.halt_command),
            (&self.resume_command, &mut settings.resume_command),
            (&self.read_register_command, &mut settings.read_register_command),
            (&self.write_register_command, &mut settings.write_register_command),
        ];
        for (value, slot) in overrides {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        settings.power_cycle_command = self.power_cycle_command.clone();
        settings.boot_timeout = channel.boot_timeout();
        Ok(settings)
    }
}

/// A register value as written in TOML: an integer, a numeric literal such
/// as `"0xff"`, or a list of either.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ValueLiteral {
    Number(u64),
    Literal(String),
    List(Vec<ValueLiteral>),
}

impl ValueLiteral {
    pub fn to_value(&self) -> Result<Value, ValueError> {
        Ok(match self {
            ValueLiteral::Number(n) => Value::Scalar(*n),
            ValueLiteral::Literal(s) => Value::Scalar(parse_literal(s)?),
            ValueLiteral::List(items) => Value::Array(
                items
                    .iter()
                    .map(ValueLiteral::to_value)
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RegisterRef {
    pub object: String,
    pub register: String,
}

/// An in-process device running a program whose output is one register.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DummyConfig {
    #[serde(default = "default_total_cycles")]
    pub total_cycles: u64,
    #[serde(default)]
    pub prints: Option<RegisterRef>,
    /// Initial register state by configuration object.
    #[serde(default)]
    pub registers: BTreeMap<String, BTreeMap<String, ValueLiteral>>,
    /// Memory images by file name, zero filled to the given size.
    #[serde(default)]
    pub memory: BTreeMap<String, usize>,
}

fn default_total_cycles() -> u64 {
    1000
}

impl DummyConfig {
    pub fn program(&self, campaign: &CampaignSettings) -> Result<DummyProgram, anyhow::Error> {
        let mut registers = AttributeStore::new();
        for (object, values) in &self.registers {
            for (register, literal) in values {
                let value = literal
                    .to_value()
                    .map_err(|e| anyhow::anyhow!("Dummy register {object}.{register}: {e}"))?;
                registers.set(object, register, value);
            }
        }
        let mut program = DummyProgram::new(&campaign.command, self.total_cycles, registers);
        if let Some(prints) = &self.prints {
            program = program.printing_register(&prints.object, &prints.register);
        }
        for (image, size) in &self.memory {
            program = program.with_memory(image, vec![0; *size]);
        }
        if let Some(output_file) = &campaign.output_file {
            program = program.with_output_file(output_file);
        }
        Ok(program)
    }

    pub fn settings(&self, channel: &ChannelConfig, use_aux: bool) -> DummySettings {
        DummySettings {
            prompt: channel.dut_prompt.clone(),
            timeout: channel.read_timeout(),
            use_aux,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DebuggerConfig {
    #[serde(default)]
    pub backend: DebuggerKind,
    #[serde(default)]
    pub simics: Option<SimicsConfig>,
    #[serde(default)]
    pub jtag: Option<JtagConfig>,
    #[serde(default)]
    pub dummy: Option<DummyConfig>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WorkerSettings {
    #[serde(default = "default_threads")]
    pub threads: usize,
}

pub fn default_threads() -> usize {
    1
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory of the JSON result store, `<workspace>/results` when absent.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_store_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub retry_backoff_secs: u64,
}

pub fn default_store_attempts() -> u32 {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: None,
            retry_attempts: default_store_attempts(),
            retry_backoff_secs: default_backoff_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_reset_attempts")]
    pub reset_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub reset_backoff_secs: u64,
}

pub fn default_reset_attempts() -> u32 {
    5
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            reset_attempts: default_reset_attempts(),
            reset_backoff_secs: default_backoff_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct UpsetConfig {
    pub campaign: CampaignSettings,
    #[serde(default)]
    pub injection: InjectionSettings,
    #[serde(default)]
    pub debugger: DebuggerConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub workers: WorkerSettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default)]
    pub seed: u64,
}

pub fn default_workspace() -> PathBuf {
    PathBuf::from("./upset-workspace")
}

impl UpsetConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: UpsetConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn uses_aux(&self) -> bool {
        self.campaign.aux_command.is_some()
    }
}

impl Default for UpsetConfig {
    fn default() -> Self {
        Self {
            campaign: CampaignSettings {
                architecture: "p2020".to_string(),
                mode: Mode::Simulated,
                command: String::new(),
                aux_command: None,
                output_file: None,
                aux_output_file: false,
                log_files: Vec::new(),
                aux_log_files: Vec::new(),
                files: Vec::new(),
                aux_files: Vec::new(),
                timing_iterations: default_timing_iterations(),
                num_checkpoints: default_num_checkpoints(),
                include_caches: false,
                selected_targets: None,
                selected_registers: None,
                catalog: None,
            },
            injection: InjectionSettings::default(),
            debugger: DebuggerConfig::default(),
            channel: ChannelConfig::default(),
            workers: WorkerSettings::default(),
            store: StoreConfig::default(),
            retry: RetrySettings::default(),
            workspace: default_workspace(),
            seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
[campaign]
architecture = "p2020"
mode = "simulated"
command = "./app"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: UpsetConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.campaign.timing_iterations, 5);
        assert_eq!(config.campaign.num_checkpoints, 50);
        assert_eq!(config.injection.injections, 1);
        assert_eq!(config.injection.memory_block_size, 4096);
        assert_eq!(config.injection.latent_iterations, 1);
        assert_eq!(config.channel.read_timeout(), Duration::from_secs(300));
        assert_eq!(config.retry.reset_attempts, 5);
        assert_eq!(config.retry.reset_backoff_secs, 30);
        assert_eq!(config.store.retry_attempts, 10);
        assert_eq!(config.workers.threads, 1);
        assert_eq!(config.debugger.backend, DebuggerKind::Simics);
        assert!(!config.uses_aux());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let content = format!("{MINIMAL}\n[workers]\nthreads = 2\nprocesses = 4\n");
        assert!(toml::from_str::<UpsetConfig>(&content).is_err());
    }

    #[test]
    fn dummy_program_is_built_from_literals() {
        let content = format!(
            r#"{MINIMAL}
[debugger]
backend = "dummy"

[debugger.dummy]
total-cycles = 10
prints = {{ object = "DUT.cpu", register = "r0" }}
memory = {{ "ram.img" = 64 }}

[debugger.dummy.registers."DUT.cpu"]
r0 = "0x2a"
gprs = [1, "0b10", [3]]
"#
        );
        let config: UpsetConfig = toml::from_str(&content).unwrap();
        assert_eq!(config.debugger.backend, DebuggerKind::Dummy);
        let dummy = config.debugger.dummy.as_ref().unwrap();
        let program = dummy.program(&config.campaign).unwrap();
        assert_eq!(program.total_cycles, 10);
        assert_eq!(program.registers.get("DUT.cpu", "r0").unwrap(), &Value::Scalar(42));
        assert_eq!(
            program.registers.get("DUT.cpu", "gprs").unwrap(),
            &Value::Array(vec![
                Value::Scalar(1),
                Value::Scalar(2),
                Value::Array(vec![Value::Scalar(3)]),
            ])
        );
        assert_eq!(program.memory["ram.img"].len(), 64);
        assert_eq!((program.render)(&program.registers), "42");
    }

    #[test]
    fn jtag_endpoint_requires_one_console() {
        let content = format!(
            r#"{MINIMAL}
[debugger]
backend = "jtag"

[debugger.jtag]
control-address = "10.0.0.2:2001"
halt-command = "stop"
dut = {{ serial = "/dev/ttyUSB0", address = "10.0.0.3:23" }}
"#
        );
        let config: UpsetConfig = toml::from_str(&content).unwrap();
        let jtag = config.debugger.jtag.as_ref().unwrap();
        assert!(jtag.settings(&config.channel).is_err());

        let mut fixed = jtag.clone();
        fixed.dut.address = None;
        let settings = fixed.settings(&config.channel).unwrap();
        assert_eq!(settings.halt_command, "stop");
        assert_eq!(settings.resume_command, "resume");
        assert_eq!(settings.dut.endpoint, ConsoleEndpoint::Serial(PathBuf::from("/dev/ttyUSB0")));
    }

    #[test]
    fn load_from_file_reports_parse_errors() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = UpsetConfig::load_from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.campaign.command, "./app");

        let mut broken = NamedTempFile::new().unwrap();
        broken.write_all(b"[campaign\n").unwrap();
        let err = UpsetConfig::load_from_file(&broken.path().to_path_buf()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"));
    }
}
