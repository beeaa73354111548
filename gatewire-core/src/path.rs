//! Paths: directional pipelines from one source node through a hook chain
//! and a bounded queue to one or more destination nodes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::hook::{Hook, HookAction, HookChain, HookError, HookPoint};
use crate::node::Node;
use crate::pool::{Pool, SampleRef};
use crate::queue::{PathQueue, ReaderId};
use crate::timer::{RateTimer, Tick, TimerError};

pub const DEFAULT_QUEUELEN: usize = 1024;
pub const DEFAULT_SAMPLELEN: usize = 64;

/// Backoff while the pool is exhausted and the receive loop cannot make
/// progress until destinations release samples.
const POOL_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Created,
    Prepared,
    Running,
    Stopped,
}

/// Tunables of one path, all optional in the configuration.
#[derive(Debug, Clone, Copy)]
pub struct PathSettings {
    /// Output rate in Hz; zero forwards on arrival.
    pub rate: f64,
    pub queuelen: usize,
    pub samplelen: usize,
    /// Pool capacity. Defaults to twice the queue length so that in-flight
    /// batches and resend caches do not starve the receive loop.
    pub poolsize: Option<usize>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            rate: 0.0,
            queuelen: DEFAULT_QUEUELEN,
            samplelen: DEFAULT_SAMPLELEN,
            poolsize: None,
        }
    }
}

/// Counter snapshot for stats output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathCounters {
    pub received: u64,
    pub sent: u64,
    pub skipped: u64,
    pub overruns: u64,
}

struct Destination {
    node: Arc<Node>,
    reader: ReaderId,
    /// Clones of the batch most recently sent, kept for resend ticks.
    last: Mutex<Vec<SampleRef>>,
}

struct Shared {
    name: String,
    source: Arc<Node>,
    destinations: Vec<Destination>,
    pool: Pool,
    queue: PathQueue,
    chain: Mutex<HookChain>,
    rate: f64,
    received: AtomicU64,
    sent: AtomicU64,
    skipped: AtomicU64,
    overrun: AtomicU64,
    fatal: AtomicBool,
}

/// One configured pipeline. Owns its pool, queue, hook instances and the
/// worker threads; nodes are shared with the process registry.
pub struct Path {
    name: String,
    source: Arc<Node>,
    dest_nodes: Vec<Arc<Node>>,
    hooks: Vec<(Box<dyn Hook>, Option<toml::Value>)>,
    settings: PathSettings,
    state: PathState,
    shared: Option<Arc<Shared>>,
    shutdown_tx: Option<Sender<()>>,
    recv_thread: Option<JoinHandle<()>>,
    send_thread: Option<JoinHandle<()>>,
}

impl Path {
    pub fn new(
        source: Arc<Node>,
        destinations: Vec<Arc<Node>>,
        hooks: Vec<(Box<dyn Hook>, Option<toml::Value>)>,
        settings: PathSettings,
    ) -> Self {
        let mut name = format!("{} =>", source.name());
        for dest in &destinations {
            name.push(' ');
            name.push_str(dest.name());
        }
        Self {
            name,
            source,
            dest_nodes: destinations,
            hooks,
            settings,
            state: PathState::Created,
            shared: None,
            shutdown_tx: None,
            recv_thread: None,
            send_thread: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PathState {
        self.state
    }

    pub fn counters(&self) -> PathCounters {
        match &self.shared {
            Some(shared) => PathCounters {
                received: shared.received.load(Ordering::Acquire),
                sent: shared.sent.load(Ordering::Relaxed),
                skipped: shared.skipped.load(Ordering::Relaxed),
                overruns: shared.overrun.load(Ordering::Relaxed),
            },
            None => PathCounters::default(),
        }
    }

    /// A fatal node fault tore the path down.
    pub fn is_faulted(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.fatal.load(Ordering::Acquire))
    }

    pub fn uses_node(&self, name: &str) -> bool {
        self.source.name().as_ref() == name
            || self.dest_nodes.iter().any(|n| n.name().as_ref() == name)
    }

    /// Allocate pool and queue, initialize and parse hooks, and register one
    /// queue reader per destination and per hook with a history window.
    pub fn prepare(&mut self) -> Result<(), PathError> {
        if self.state != PathState::Created {
            return Err(PathError::InvalidState {
                op: "prepare",
                state: self.state,
            });
        }
        if self.dest_nodes.is_empty() {
            return Err(PathError::NoDestinations);
        }
        if !self.settings.rate.is_finite() || self.settings.rate < 0.0 {
            return Err(PathError::InvalidRate(self.settings.rate));
        }

        let mut chain = HookChain::new(std::mem::take(&mut self.hooks));
        chain.init()?;
        chain.parse()?;
        chain.check()?;

        let pool = Pool::new(
            self.settings.poolsize.unwrap_or(self.settings.queuelen * 2),
            self.settings.samplelen,
            self.source.signals().clone(),
        );
        let queue = PathQueue::new(self.settings.queuelen);

        chain.attach_history_readers(|| queue.register_reader());

        let destinations = self
            .dest_nodes
            .iter()
            .map(|node| Destination {
                node: node.clone(),
                reader: queue.register_reader(),
                last: Mutex::new(Vec::new()),
            })
            .collect();

        self.shared = Some(Arc::new(Shared {
            name: self.name.clone(),
            source: self.source.clone(),
            destinations,
            pool,
            queue,
            chain: Mutex::new(chain),
            rate: self.settings.rate,
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            overrun: AtomicU64::new(0),
            fatal: AtomicBool::new(false),
        }));
        self.state = PathState::Prepared;
        Ok(())
    }

    /// Start the hooks and spawn the worker threads.
    pub fn start(&mut self) -> Result<(), PathError> {
        if self.state != PathState::Prepared {
            return Err(PathError::InvalidState {
                op: "start",
                state: self.state,
            });
        }
        let shared = self.shared.clone().expect("prepared path has shared state");

        tracing::info!(
            path = %self.name,
            hooks = shared.chain.lock().unwrap_or_else(|e| e.into_inner()).len(),
            rate = self.settings.rate,
            "starting path"
        );

        shared
            .chain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .start()?;

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        if self.settings.rate > 0.0 {
            let timer = RateTimer::new(self.settings.rate)?;
            let send_shared = shared.clone();
            let send_rx = shutdown_rx.clone();
            self.send_thread = Some(
                std::thread::Builder::new()
                    .name(format!("send:{}", self.name))
                    .spawn(move || run_send(send_shared, send_rx, timer))
                    .map_err(PathError::Spawn)?,
            );
        }

        let recv_shared = shared;
        self.recv_thread = Some(
            std::thread::Builder::new()
                .name(format!("recv:{}", self.name))
                .spawn(move || run_receive(recv_shared, shutdown_rx))
                .map_err(PathError::Spawn)?,
        );

        self.shutdown_tx = Some(shutdown_tx);
        self.state = PathState::Running;
        Ok(())
    }

    /// Signal the worker threads, join them in receive-then-send order and
    /// stop the hooks.
    pub fn stop(&mut self) -> Result<(), PathError> {
        if self.state != PathState::Running {
            return Ok(());
        }
        tracing::info!(path = %self.name, "stopping path");

        // Dropping the sender disconnects every shutdown receiver.
        drop(self.shutdown_tx.take());
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.send_thread.take() {
            let _ = handle.join();
        }
        self.state = PathState::Stopped;

        if let Some(shared) = &self.shared {
            shared
                .chain
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .stop()?;
        }
        Ok(())
    }
}

impl Drop for Path {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    matches!(
        shutdown.try_recv(),
        Ok(()) | Err(TryRecvError::Disconnected)
    )
}

/// Wait on the shutdown channel for at most `timeout`. Returns true when
/// shutdown was requested.
fn shutdown_wait(shutdown: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(
        shutdown.recv_timeout(timeout),
        Err(crossbeam_channel::RecvTimeoutError::Timeout)
    )
}

fn run_receive(shared: Arc<Shared>, shutdown: Receiver<()>) {
    let vectorize = shared.source.vectorize();

    loop {
        if shutdown_requested(&shutdown) {
            break;
        }

        let mut batch = shared.pool.acquire(vectorize);
        if batch.len() < vectorize {
            tracing::warn!(
                path = %shared.name,
                got = batch.len(),
                want = vectorize,
                "pool underrun"
            );
        }
        if batch.is_empty() {
            // All samples are in flight; progress resumes once destinations
            // release some.
            if shutdown_wait(&shutdown, POOL_RETRY) {
                break;
            }
            continue;
        }

        let acquired = batch.len();
        let read = match shared.source.read(&mut batch) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(path = %shared.name, node = %shared.source.name(), error = %e, "read failed, stopping path");
                shared.source.fault();
                shared.fatal.store(true, Ordering::Release);
                break;
            }
        };
        if read == 0 {
            continue;
        }
        if read < acquired {
            tracing::warn!(path = %shared.name, read, expected = acquired, "partial read");
        }
        batch.truncate(read);

        let outcome = lock_chain(&shared).run(HookPoint::PathRead, &mut batch);
        if outcome.skipped > 0 {
            shared
                .skipped
                .fetch_add(outcome.skipped as u64, Ordering::Relaxed);
        }
        if outcome.stop {
            tracing::info!(path = %shared.name, "hook requested path stop");
            break;
        }

        let to_enqueue = batch.len();
        let pushed = shared.queue.push_many(&mut batch);
        if pushed < to_enqueue {
            let dropped = batch.len() as u64;
            shared.skipped.fetch_add(dropped, Ordering::Relaxed);
            tracing::warn!(path = %shared.name, dropped, "queue overflow");
            batch.clear();
        }
        shared
            .received
            .store(shared.queue.writer_pos(), Ordering::Release);

        // Age out samples past each history window so they return to the pool.
        let write_pos = shared.queue.writer_pos();
        for (reader, window) in lock_chain(&shared).history_readers() {
            let behind = write_pos - shared.queue.reader_pos(reader);
            let aged = behind.saturating_sub(window as u64);
            if aged > 0 {
                drop(shared.queue.pull_many(reader, aged as usize));
            }
        }

        if shared.rate == 0.0 && send_all(&shared, false) {
            shared.fatal.store(true, Ordering::Release);
            break;
        }
    }
}

fn run_send(shared: Arc<Shared>, shutdown: Receiver<()>, mut timer: RateTimer) {
    let mut last_seen = 0u64;

    loop {
        match timer.wait(&shutdown) {
            Tick::Shutdown => break,
            Tick::Elapsed(expirations) => {
                if expirations > 1 {
                    let missed = expirations - 1;
                    shared.overrun.fetch_add(missed, Ordering::Relaxed);
                    tracing::warn!(path = %shared.name, missed, "timer overrun");
                }
            }
        }
        if shared.fatal.load(Ordering::Acquire) {
            break;
        }

        let received = shared.received.load(Ordering::Acquire);
        if received == 0 {
            continue;
        }
        if lock_chain(&shared).run_periodic() != HookAction::Ok {
            continue;
        }

        // No news since the previous tick: keep the line warm by re-emitting
        // the last vector without touching the reader cursors.
        let resend = received == last_seen;
        if send_all(&shared, resend) {
            shared.fatal.store(true, Ordering::Release);
            break;
        }
        last_seen = received;
    }
}

/// Run the write half for every destination in configured order. Returns
/// true on a fatal fault; a single destination failing does not keep the
/// others from being served first.
fn send_all(shared: &Shared, resend: bool) -> bool {
    let mut fatal = false;

    for dest in &shared.destinations {
        let vectorize = dest.node.vectorize();

        let mut batch = if resend {
            let last = dest
                .last
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if last.is_empty() {
                continue;
            }
            last
        } else {
            let base = shared.queue.reader_pos(dest.reader);
            let peeked = shared.queue.peek(base, vectorize);
            if peeked.is_empty() {
                continue;
            }
            if peeked.len() < vectorize {
                tracing::debug!(
                    path = %shared.name,
                    node = %dest.node.name(),
                    available = peeked.len(),
                    expected = vectorize,
                    "queue underrun"
                );
            }
            peeked
        };

        let outcome = lock_chain(shared).run(HookPoint::PathWrite, &mut batch);
        if outcome.skipped > 0 {
            shared
                .skipped
                .fetch_add(outcome.skipped as u64, Ordering::Relaxed);
        }
        if batch.is_empty() {
            continue;
        }

        let tosend = batch.len();
        let sent = match dest.node.write(&batch) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(
                    path = %shared.name,
                    node = %dest.node.name(),
                    error = %e,
                    "write failed"
                );
                dest.node.fault();
                fatal = true;
                continue;
            }
        };
        if sent < tosend {
            tracing::warn!(path = %shared.name, node = %dest.node.name(), sent, tosend, "partial write");
        }
        shared.sent.fetch_add(sent as u64, Ordering::Relaxed);

        if !resend {
            *dest.last.lock().unwrap_or_else(|e| e.into_inner()) = batch[..sent].to_vec();
            // Advance the cursor; slots passed by every reader go back to
            // the pool.
            drop(shared.queue.pull_many(dest.reader, sent));
        }
    }

    fatal
}

fn lock_chain(shared: &Shared) -> std::sync::MutexGuard<'_, HookChain> {
    shared.chain.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path has no destination nodes")]
    NoDestinations,
    #[error("invalid output rate {0}")]
    InvalidRate(f64),
    #[error("cannot {op} a path in state {state:?}")]
    InvalidState { op: &'static str, state: PathState },
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error("failed to spawn path thread: {0}")]
    Spawn(std::io::Error),
}
