//! Cross-worker coordination: the shared iteration budget, cancellation,
//! the worker pool, concurrent DUT/AUX reads and the background log flusher.

use crate::channel::{ChannelError, DeviceChannel};
use log::{debug, warn};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

const TICK: Duration = Duration::from_millis(50);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Worker {worker} panicked: {message}")]
    Panicked { worker: usize, message: String },
    #[error("Failed to spawn worker {worker}: {message}")]
    Spawn { worker: usize, message: String },
}

/// Shared stop flag. Cloning hands out another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` or until cancelled. Returns whether it was
    /// cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(TICK));
        }
    }
}

/// Campaign-wide iteration budget shared by all workers: a fixed number of
/// iterations, a deadline, or both.
#[derive(Debug)]
pub struct IterationBudget {
    limit: Option<u64>,
    deadline: Option<Instant>,
    next: AtomicU64,
}

impl IterationBudget {
    pub fn counted(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            deadline: None,
            next: AtomicU64::new(0),
        }
    }

    pub fn timed(duration: Duration) -> Self {
        Self {
            limit: None,
            deadline: Some(Instant::now() + duration),
            next: AtomicU64::new(0),
        }
    }

    pub fn new(limit: Option<u64>, duration: Option<Duration>) -> Self {
        Self {
            limit,
            deadline: duration.map(|d| Instant::now() + d),
            next: AtomicU64::new(0),
        }
    }

    /// Claims the next iteration, returning its 1-based number, or `None`
    /// once the budget is spent. Each number is handed out at most once.
    pub fn claim(&self) -> Option<u64> {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return None;
        }
        let limit = self.limit;
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |claimed| {
                limit.is_none_or(|l| claimed < l).then_some(claimed + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    pub fn claimed(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// Runs `threads` workers, each on its own OS thread, and collects their
/// results in worker order. A panicking worker does not take down the
/// others; it is reported as [`WorkerError::Panicked`].
pub fn run_workers<T, F>(threads: usize, work: F) -> Vec<Result<T, WorkerError>>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    let work = &work;
    thread::scope(|scope| {
        let handles: Vec<_> = (0..threads.max(1))
            .map(|worker| {
                let spawned = thread::Builder::new()
                    .name(format!("worker-{worker}"))
                    .spawn_scoped(scope, move || {
                        catch_unwind(AssertUnwindSafe(|| work(worker)))
                    });
                (worker, spawned)
            })
            .collect();
        handles
            .into_iter()
            .map(|(worker, spawned)| {
                let handle = spawned.map_err(|e| WorkerError::Spawn {
                    worker,
                    message: e.to_string(),
                })?;
                match handle.join() {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(payload)) | Err(payload) => Err(WorkerError::Panicked {
                        worker,
                        message: panic_message(payload.as_ref()),
                    }),
                }
            })
            .collect()
    })
}

/// Outcome of reading the DUT and AUX consoles side by side.
#[derive(Debug)]
pub struct DualRead {
    pub dut: Result<String, ChannelError>,
    pub aux: Option<Result<String, ChannelError>>,
}

/// Reads each console up to its prompt on its own thread so a hung device
/// does not hold up the other one.
pub fn read_both(
    dut: &mut dyn DeviceChannel,
    aux: Option<&mut dyn DeviceChannel>,
    dut_timeout: Duration,
    aux_timeout: Duration,
) -> DualRead {
    fn read(channel: &mut dyn DeviceChannel, timeout: Duration) -> Result<String, ChannelError> {
        let prompt = channel.prompt().to_string();
        channel.read_until(&prompt, timeout)
    }

    let Some(aux) = aux else {
        return DualRead {
            dut: read(dut, dut_timeout),
            aux: None,
        };
    };
    thread::scope(|scope| {
        let aux_reader = scope.spawn(move || read(aux, aux_timeout));
        let dut_result = read(dut, dut_timeout);
        let aux_result = aux_reader.join().unwrap_or_else(|payload| {
            Err(ChannelError::Io(format!(
                "AUX reader panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
        DualRead {
            dut: dut_result,
            aux: Some(aux_result),
        }
    })
}

/// A periodic job on its own thread, stopped through its own token.
pub struct BackgroundTask {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let stop = CancellationToken::new();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !thread_stop.sleep(interval) {
                    tick();
                }
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to spawn {name}: {e}");
                None
            }
        };
        Self { stop, handle }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("Background task panicked");
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}
