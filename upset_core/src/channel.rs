//! Line-oriented channels to a device's console, plus file transfer.
//!
//! A [`DeviceChannel`] reads until a terminator (usually the shell prompt)
//! with a timeout and scans what it read for error signatures: kernel
//! panics, signal handler reports from the application, simulator errors.
//! A signature turns a successful read into a [`ChannelError::Signature`]
//! so callers can classify the run from the error alone.

use crate::worker::CancellationToken;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Outcome recorded when a read runs out of time or the channel closes.
pub const HANGING: &str = "Hanging";

/// Marker the application's signal handler prints before a signal name.
pub const SIGHANDLER_MARKER: &str = "drseus_sighandler:";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Timed out waiting for {terminator:?}")]
    Timeout { terminator: String, output: String },

    #[error("Channel closed while waiting for {terminator:?}")]
    Closed { terminator: String, output: String },

    #[error("{outcome}")]
    Signature { outcome: String, output: String },

    #[error("File transfer failed: {0}")]
    Transfer(String),

    #[error("Interrupted")]
    Interrupted { output: String },

    #[error("Channel I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io(err.to_string())
    }
}

impl ChannelError {
    /// Outcome string for a run that failed with this error.
    pub fn outcome(&self) -> String {
        match self {
            ChannelError::Timeout { .. } | ChannelError::Closed { .. } => HANGING.to_string(),
            ChannelError::Signature { outcome, .. } => outcome.clone(),
            ChannelError::Transfer(_) => "SCP error".to_string(),
            ChannelError::Interrupted { .. } => "Interrupted".to_string(),
            ChannelError::Io(_) => "Channel error".to_string(),
        }
    }

    /// Whatever was read before the error.
    pub fn output(&self) -> &str {
        match self {
            ChannelError::Timeout { output, .. }
            | ChannelError::Closed { output, .. }
            | ChannelError::Signature { output, .. }
            | ChannelError::Interrupted { output } => output,
            ChannelError::Transfer(_) | ChannelError::Io(_) => "",
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ChannelError::Interrupted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub pattern: String,
    pub outcome: String,
}

impl Signature {
    pub fn new(pattern: &str, outcome: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            outcome: outcome.to_string(),
        }
    }
}

/// Error patterns scanned for in everything a channel reads.
///
/// When the signal-handler marker is present only signal names are matched;
/// otherwise the first matching error pattern wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureSet {
    errors: Vec<Signature>,
    signal_marker: Option<String>,
    signals: Vec<String>,
}

impl SignatureSet {
    /// Signatures of a Linux target console.
    pub fn device() -> Self {
        Self {
            errors: vec![
                Signature::new("Kernel panic", "Kernel error"),
                Signature::new("panic", "Kernel error"),
                Signature::new("Oops", "Kernel error"),
                Signature::new("Segmentation fault", "Segmentation fault"),
                Signature::new("Restarting system", "Reboot"),
            ],
            signal_marker: Some(SIGHANDLER_MARKER.to_string()),
            signals: [
                "SIGSEGV", "SIGILL", "SIGBUS", "SIGFPE", "SIGABRT", "SIGIOT", "SIGTRAP", "SIGSYS",
                "SIGEMT",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    /// Signatures of the simulator's own command console.
    pub fn simulator() -> Self {
        let patterns = [
            "Address not mapped",
            "Illegal Instruction",
            "Illegal instruction",
            "Illegal memory mapping",
            "Illegal Memory Mapping",
            "Error setting attribute",
            "dropping memop (peer attribute not set)",
            "where nothing is mapped",
            "Error",
        ];
        Self {
            errors: patterns.iter().map(|p| Signature::new(p, p)).collect(),
            signal_marker: None,
            signals: Vec::new(),
        }
    }

    pub fn with_error(mut self, pattern: &str, outcome: &str) -> Self {
        self.errors.push(Signature::new(pattern, outcome));
        self
    }

    /// Outcome of the first signature found in `text`.
    pub fn scan(&self, text: &str) -> Option<String> {
        if let Some(marker) = &self.signal_marker {
            if text.contains(marker.as_str()) {
                return self
                    .signals
                    .iter()
                    .find(|s| text.contains(s.as_str()))
                    .map(|s| format!("Signal {s}"));
            }
        }
        self.errors
            .iter()
            .find(|s| text.contains(s.pattern.as_str()))
            .map(|s| s.outcome.clone())
    }
}

/// Moves files between the host and a device.
pub trait FileTransfer: Send {
    /// Copies `remote` into `local_dir`, returning the local path.
    fn get(&mut self, remote: &str, local_dir: &Path) -> Result<PathBuf, ChannelError>;

    fn put(&mut self, files: &[PathBuf]) -> Result<(), ChannelError>;

    /// An independent handle to the same device, usable from another thread.
    fn boxed_clone(&self) -> Box<dyn FileTransfer>;
}

/// File transfer through the system `scp` client.
#[derive(Debug, Clone)]
pub struct ScpTransfer {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity: Option<PathBuf>,
    pub remote_dir: String,
}

impl ScpTransfer {
    fn base_command(&self) -> Command {
        let mut cmd = Command::new("scp");
        cmd.arg("-q")
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .arg("-P")
            .arg(self.port.to_string());
        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd
    }

    fn remote(&self, path: &str) -> String {
        if path.starts_with('/') || self.remote_dir.is_empty() {
            format!("{}@{}:{}", self.user, self.host, path)
        } else {
            format!(
                "{}@{}:{}/{}",
                self.user,
                self.host,
                self.remote_dir.trim_end_matches('/'),
                path
            )
        }
    }

    fn run(&self, mut cmd: Command) -> Result<(), ChannelError> {
        let output = cmd
            .output()
            .map_err(|e| ChannelError::Transfer(format!("Failed to spawn scp: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ChannelError::Transfer(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

impl FileTransfer for ScpTransfer {
    fn get(&mut self, remote: &str, local_dir: &Path) -> Result<PathBuf, ChannelError> {
        std::fs::create_dir_all(local_dir)?;
        let mut cmd = self.base_command();
        cmd.arg(self.remote(remote)).arg(local_dir);
        self.run(cmd)?;
        let name = Path::new(remote)
            .file_name()
            .ok_or_else(|| ChannelError::Transfer(format!("Invalid remote path {remote:?}")))?;
        Ok(local_dir.join(name))
    }

    fn put(&mut self, files: &[PathBuf]) -> Result<(), ChannelError> {
        if files.is_empty() {
            return Ok(());
        }
        let mut cmd = self.base_command();
        cmd.args(files).arg(self.remote(""));
        self.run(cmd)
    }

    fn boxed_clone(&self) -> Box<dyn FileTransfer> {
        Box::new(self.clone())
    }
}

/// A console to a device (the DUT or the AUX board).
pub trait DeviceChannel: Send {
    fn name(&self) -> &str;

    fn prompt(&self) -> &str;

    /// Default timeout for [`DeviceChannel::read_prompt`].
    fn timeout(&self) -> Duration;

    fn write(&mut self, data: &str) -> Result<(), ChannelError>;

    /// Reads until `terminator` has been seen, then scans what was read for
    /// error signatures.
    fn read_until(&mut self, terminator: &str, timeout: Duration) -> Result<String, ChannelError>;

    /// Returns whatever has arrived so far without waiting.
    fn read_available(&mut self) -> Result<String, ChannelError>;

    fn read_prompt(&mut self) -> Result<String, ChannelError> {
        let prompt = self.prompt().to_string();
        let timeout = self.timeout();
        self.read_until(&prompt, timeout)
    }

    fn command(&mut self, command: &str) -> Result<String, ChannelError> {
        self.write(&format!("{command}\n"))?;
        self.read_prompt()
    }

    fn reset_timer(&mut self);

    /// Seconds since the last [`DeviceChannel::reset_timer`].
    fn get_timer_value(&self) -> f64;

    fn get_file(&mut self, remote: &str, local_dir: &Path) -> Result<PathBuf, ChannelError>;

    fn send_files(&mut self, files: &[PathBuf]) -> Result<(), ChannelError>;

    /// A detached transfer handle for background log collection.
    fn file_transfer(&self) -> Option<Box<dyn FileTransfer>>;

    /// Drains the transcript of everything read so far.
    fn take_output(&mut self) -> String;
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub name: String,
    pub prompt: String,
    pub timeout: Duration,
    pub signatures: SignatureSet,
}

enum ReadEvent {
    Data(Vec<u8>),
    Closed,
}

/// A [`DeviceChannel`] over any byte stream: a serial device, a pseudo
/// terminal or a TCP console. A background thread pumps the reader so
/// reads can time out.
pub struct StreamChannel {
    settings: ChannelSettings,
    writer: Box<dyn Write + Send>,
    events: Receiver<ReadEvent>,
    /// Trailing bytes of a UTF-8 sequence cut by a read boundary.
    undecoded: Vec<u8>,
    pending: String,
    output: String,
    closed: bool,
    timer: Option<Instant>,
    transfer: Option<Box<dyn FileTransfer>>,
    cancel: CancellationToken,
}

impl StreamChannel {
    pub fn new<R, W>(settings: ChannelSettings, mut reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, events) = mpsc::channel();
        let thread_name = format!("{}-reader", settings.name.to_lowercase());
        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(ReadEvent::Closed);
                        break;
                    }
                    Ok(n) => {
                        if tx.send(ReadEvent::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        let _ = tx.send(ReadEvent::Closed);
                        break;
                    }
                }
            }
        });
        if let Err(e) = spawned {
            warn!("Failed to spawn reader for {}: {e}", settings.name);
        }

        Self {
            settings,
            writer: Box::new(writer),
            events,
            undecoded: Vec::new(),
            pending: String::new(),
            output: String::new(),
            closed: false,
            timer: None,
            transfer: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn connect_tcp(settings: ChannelSettings, address: &str) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect(address)
            .map_err(|e| ChannelError::Io(format!("Failed to connect to {address}: {e}")))?;
        let reader = stream.try_clone()?;
        Ok(Self::new(settings, reader, stream))
    }

    /// Opens a serial device or pseudo terminal.
    pub fn open_device(settings: ChannelSettings, path: &Path) -> Result<Self, ChannelError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ChannelError::Io(format!("Failed to open {:?}: {}", path, e)))?;
        let reader = file.try_clone()?;
        Ok(Self::new(settings, reader, file))
    }

    pub fn with_transfer(mut self, transfer: Box<dyn FileTransfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn absorb(&mut self, bytes: &[u8]) {
        self.undecoded.extend_from_slice(bytes);
        let text = self.decode(false);
        self.push_text(&text);
    }

    fn mark_closed(&mut self) {
        let text = self.decode(true);
        self.push_text(&text);
        self.closed = true;
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        trace!("{} <- {:?}", self.settings.name, text);
        self.pending.push_str(text);
        self.output.push_str(text);
    }

    /// Decodes the buffered bytes. An incomplete sequence at the end is held
    /// back for the next read unless `flush` is set.
    fn decode(&mut self, flush: bool) -> String {
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.undecoded) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.undecoded.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.undecoded[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.undecoded.drain(..valid + invalid);
                        }
                        None if flush => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.undecoded.clear();
                            return text;
                        }
                        None => {
                            self.undecoded.drain(..valid);
                            return text;
                        }
                    }
                }
            }
        }
    }

    fn fail(&mut self, terminator: &str, timed_out: bool) -> ChannelError {
        let output = std::mem::take(&mut self.pending);
        if let Some(outcome) = self.settings.signatures.scan(&output) {
            return ChannelError::Signature { outcome, output };
        }
        let terminator = terminator.to_string();
        if timed_out {
            ChannelError::Timeout { terminator, output }
        } else {
            ChannelError::Closed { terminator, output }
        }
    }
}

impl DeviceChannel for StreamChannel {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn prompt(&self) -> &str {
        &self.settings.prompt
    }

    fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    fn write(&mut self, data: &str) -> Result<(), ChannelError> {
        debug!("{} -> {:?}", self.settings.name, data);
        self.writer.write_all(data.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_until(&mut self, terminator: &str, timeout: Duration) -> Result<String, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(position) = self.pending.find(terminator) {
                let buff: String = self.pending.drain(..position + terminator.len()).collect();
                return match self.settings.signatures.scan(&buff) {
                    Some(outcome) => Err(ChannelError::Signature {
                        outcome,
                        output: buff,
                    }),
                    None => Ok(buff),
                };
            }
            if self.cancel.is_cancelled() {
                return Err(ChannelError::Interrupted {
                    output: std::mem::take(&mut self.pending),
                });
            }
            if self.closed {
                return Err(self.fail(terminator, false));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.fail(terminator, true));
            }
            match self.events.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok(ReadEvent::Data(bytes)) => self.absorb(&bytes),
                Ok(ReadEvent::Closed) | Err(RecvTimeoutError::Disconnected) => self.mark_closed(),
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn read_available(&mut self) -> Result<String, ChannelError> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ReadEvent::Data(bytes) => self.absorb(&bytes),
                ReadEvent::Closed => self.mark_closed(),
            }
        }
        let buff = std::mem::take(&mut self.pending);
        match self.settings.signatures.scan(&buff) {
            Some(outcome) => Err(ChannelError::Signature {
                outcome,
                output: buff,
            }),
            None => Ok(buff),
        }
    }

    fn reset_timer(&mut self) {
        self.timer = Some(Instant::now());
    }

    fn get_timer_value(&self) -> f64 {
        self.timer.map_or(0.0, |start| start.elapsed().as_secs_f64())
    }

    fn get_file(&mut self, remote: &str, local_dir: &Path) -> Result<PathBuf, ChannelError> {
        match self.transfer.as_mut() {
            Some(transfer) => transfer.get(remote, local_dir),
            None => Err(ChannelError::Transfer(format!(
                "{} has no file transfer configured",
                self.settings.name
            ))),
        }
    }

    fn send_files(&mut self, files: &[PathBuf]) -> Result<(), ChannelError> {
        match self.transfer.as_mut() {
            Some(transfer) => transfer.put(files),
            None if files.is_empty() => Ok(()),
            None => Err(ChannelError::Transfer(format!(
                "{} has no file transfer configured",
                self.settings.name
            ))),
        }
    }

    fn file_transfer(&self) -> Option<Box<dyn FileTransfer>> {
        self.transfer.as_ref().map(|t| t.boxed_clone())
    }

    fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}

/// Cheap upper bound on the similarity of two texts: twice the size of
/// their character multiset intersection over their combined length. Two
/// empty texts are identical.
pub fn quick_ratio(a: &str, b: &str) -> f64 {
    let total = a.chars().count() + b.chars().count();
    if total == 0 {
        return 1.0;
    }
    let mut available: HashMap<char, usize> = HashMap::new();
    for c in b.chars() {
        *available.entry(c).or_default() += 1;
    }
    let mut matches = 0;
    for c in a.chars() {
        if let Some(count) = available.get_mut(&c) {
            if *count > 0 {
                *count -= 1;
                matches += 1;
            }
        }
    }
    2.0 * matches as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn settings() -> ChannelSettings {
        ChannelSettings {
            name: "DUT".to_string(),
            prompt: "root@dut:~# ".to_string(),
            timeout: Duration::from_secs(2),
            signatures: SignatureSet::device(),
        }
    }

    fn channel(script: &str) -> StreamChannel {
        StreamChannel::new(settings(), Cursor::new(script.as_bytes().to_vec()), SharedSink::default())
    }

    #[test]
    fn read_until_returns_through_terminator_and_keeps_remainder() {
        let mut dut = channel("boot\nroot@dut:~# ./app\n42\nroot@dut:~# ");
        assert_eq!(dut.read_prompt().unwrap(), "boot\nroot@dut:~# ");
        assert_eq!(dut.read_prompt().unwrap(), "./app\n42\nroot@dut:~# ");
        assert_eq!(
            dut.take_output(),
            "boot\nroot@dut:~# ./app\n42\nroot@dut:~# "
        );
    }

    /// Hands out one queued chunk per read.
    struct ChunkedReader(VecDeque<Vec<u8>>);

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    #[test]
    fn characters_split_across_reads_are_decoded_whole() {
        let text = "température 25°C\nroot@dut:~# ";
        let bytes = text.as_bytes();
        let inside_e = text.find('é').unwrap() + 1;
        let inside_degree = text.find('°').unwrap() + 1;
        let chunks = VecDeque::from(vec![
            bytes[..inside_e].to_vec(),
            bytes[inside_e..inside_degree].to_vec(),
            bytes[inside_degree..].to_vec(),
        ]);
        let mut dut = StreamChannel::new(settings(), ChunkedReader(chunks), SharedSink::default());
        assert_eq!(dut.read_prompt().unwrap(), text);
        assert!(!dut.output.contains(char::REPLACEMENT_CHARACTER));
    }

    #[test]
    fn truncated_character_at_close_is_replaced() {
        let chunks = VecDeque::from(vec![b"abc\xE2\x82".to_vec()]);
        let mut dut = StreamChannel::new(settings(), ChunkedReader(chunks), SharedSink::default());
        match dut.read_until("x", Duration::from_secs(2)) {
            Err(ChannelError::Closed { output, .. }) => assert_eq!(output, "abc\u{FFFD}"),
            other => panic!("Expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn closed_stream_without_terminator_is_hanging() {
        let mut dut = channel("partial output");
        match dut.read_prompt() {
            Err(err @ ChannelError::Closed { .. }) => {
                assert_eq!(err.outcome(), HANGING);
                assert_eq!(err.output(), "partial output");
            }
            other => panic!("Expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn silent_stream_times_out() {
        let (reader, _writer) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut dut = StreamChannel::new(settings(), reader, SharedSink::default());
        let started = Instant::now();
        match dut.read_until("never", Duration::from_millis(200)) {
            Err(ChannelError::Timeout { terminator, .. }) => assert_eq!(terminator, "never"),
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn kernel_panic_is_reported_as_signature() {
        let mut dut = channel("Kernel panic - not syncing\nroot@dut:~# ");
        match dut.read_prompt() {
            Err(ChannelError::Signature { outcome, output }) => {
                assert_eq!(outcome, "Kernel error");
                assert!(output.contains("not syncing"));
            }
            other => panic!("Expected Signature, got {other:?}"),
        }
    }

    #[test]
    fn signal_marker_restricts_matching_to_signal_names() {
        let signatures = SignatureSet::device();
        assert_eq!(
            signatures.scan("drseus_sighandler: SIGSEGV\nSegmentation fault"),
            Some("Signal SIGSEGV".to_string())
        );
        assert_eq!(signatures.scan("Segmentation fault"), Some("Segmentation fault".to_string()));
        assert_eq!(signatures.scan("all good"), None);
        assert_eq!(
            SignatureSet::simulator().scan("*** Error setting attribute"),
            Some("Error setting attribute".to_string())
        );
    }

    #[test]
    fn cancelled_read_is_interrupted() {
        let (reader, _writer) = std::os::unix::net::UnixStream::pair().unwrap();
        let cancel = CancellationToken::new();
        let mut dut =
            StreamChannel::new(settings(), reader, SharedSink::default()).with_cancellation(cancel.clone());
        cancel.cancel();
        let err = dut.read_until("x", Duration::from_secs(5)).unwrap_err();
        assert!(err.is_interrupted(), "Expected Interrupted, got {err:?}");
    }

    #[test]
    fn command_writes_line_and_reads_prompt() {
        let sink = SharedSink::default();
        let mut dut = StreamChannel::new(
            settings(),
            Cursor::new(b"ls\nfile\nroot@dut:~# ".to_vec()),
            sink.clone(),
        );
        let reply = dut.command("ls").unwrap();
        assert!(reply.ends_with("root@dut:~# "));
        assert_eq!(sink.0.lock().unwrap().as_slice(), b"ls\n");
    }

    #[test]
    fn missing_transfer_fails_only_when_files_are_sent() {
        let mut dut = channel("");
        assert!(dut.send_files(&[]).is_ok());
        assert!(matches!(
            dut.send_files(&[PathBuf::from("app")]),
            Err(ChannelError::Transfer(_))
        ));
        assert!(dut.file_transfer().is_none());
    }

    #[test]
    fn quick_ratio_matches_character_overlap() {
        assert_eq!(quick_ratio("", ""), 1.0);
        assert_eq!(quick_ratio("42", "42"), 1.0);
        assert_eq!(quick_ratio("42", "43"), 0.5);
        assert_eq!(quick_ratio("abc", ""), 0.0);
    }
}
