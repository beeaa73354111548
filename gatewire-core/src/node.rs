//! I/O endpoints with pluggable protocol backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::pool::SampleRef;
use crate::sample::Timestamp;
use crate::signal::Signal;

/// Protocol-specific half of a node. One instance per configured node.
///
/// `read` fills the provided pool samples and returns how many it produced;
/// zero is a valid "no data right now". Implementations must return within a
/// bounded time when idle (use read timeouts on blocking I/O) so that paths
/// can shut down cooperatively. `write` returns how many samples the backend
/// accepted. Both report fatal faults through [`NodeError`].
pub trait NodeBackend: Send {
    /// One-line human summary of the instance configuration.
    fn summary(&self) -> String {
        String::new()
    }

    /// Validate configuration before the node starts.
    fn check(&self) -> Result<(), NodeError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    fn read(&mut self, smps: &mut [SampleRef]) -> Result<usize, NodeError>;

    fn write(&mut self, smps: &[SampleRef]) -> Result<usize, NodeError>;

    /// Swap input and output roles (addresses, topics, file paths).
    fn reverse(&mut self) -> Result<(), NodeError> {
        Err(NodeError::NotSupported("reverse"))
    }

    /// Largest batch the backend accepts per call, if it cannot take
    /// arbitrary spans. The node splits larger writes accordingly.
    fn max_batch(&self) -> Option<usize> {
        None
    }

    /// Exact batch the backend requires per call, if any. Mismatched spans
    /// fail cleanly instead of being split.
    fn required_batch(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Created = 0,
    Started = 1,
    Stopped = 2,
    Faulted = 3,
}

/// A named endpoint. Shared by every path that reads from or writes to it;
/// backend access is serialized by an internal mutex (each backend is only
/// ever driven by one thread at a time).
pub struct Node {
    name: Arc<str>,
    type_name: &'static str,
    vectorize: usize,
    signals: Arc<[Signal]>,
    backend: Mutex<Box<dyn NodeBackend>>,
    state: AtomicU8,
    received: AtomicU64,
    sent: AtomicU64,
}

impl Node {
    pub fn new(
        name: impl Into<Arc<str>>,
        type_name: &'static str,
        vectorize: usize,
        signals: Arc<[Signal]>,
        backend: Box<dyn NodeBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            type_name,
            vectorize: vectorize.max(1),
            signals,
            backend: Mutex::new(backend),
            state: AtomicU8::new(NodeState::Created as u8),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Samples exchanged per read/write call.
    pub fn vectorize(&self) -> usize {
        self.vectorize
    }

    pub fn signals(&self) -> &Arc<[Signal]> {
        &self.signals
    }

    pub fn state(&self) -> NodeState {
        match self.state.load(Ordering::Acquire) {
            0 => NodeState::Created,
            1 => NodeState::Started,
            2 => NodeState::Stopped,
            _ => NodeState::Faulted,
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), NodeError> {
        self.backend().check()
    }

    pub fn start(&self) -> Result<(), NodeError> {
        let mut backend = self.backend();
        tracing::info!(node = %self.name, node_type = self.type_name, "starting node: {}", backend.summary());
        backend.start()?;
        self.state
            .store(NodeState::Started as u8, Ordering::Release);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), NodeError> {
        if self.state() != NodeState::Started && self.state() != NodeState::Faulted {
            return Ok(());
        }
        tracing::info!(node = %self.name, "stopping node");
        let result = self.backend().stop();
        self.state
            .store(NodeState::Stopped as u8, Ordering::Release);
        result
    }

    /// Read up to `smps.len()` samples into the given pool samples. Received
    /// timestamps and the source back-reference are stamped here so backends
    /// only fill payload fields.
    pub fn read(&self, smps: &mut [SampleRef]) -> Result<usize, NodeError> {
        if self.state() != NodeState::Started {
            return Err(NodeError::NotRunning);
        }
        if let Some(required) = self.backend().required_batch() {
            if smps.len() != required {
                return Err(NodeError::BatchSize {
                    required,
                    got: smps.len(),
                });
            }
        }
        let read = self.backend().read(smps)?;
        let now = Timestamp::now();
        for smp in &smps[..read] {
            let mut data = smp.data_mut();
            data.ts_received = now;
            data.source = Some(self.name.clone());
        }
        self.received.fetch_add(read as u64, Ordering::Relaxed);
        Ok(read)
    }

    /// Write a batch, splitting it when the backend cannot take the whole
    /// span at once. Returns the number of samples accepted.
    pub fn write(&self, smps: &[SampleRef]) -> Result<usize, NodeError> {
        if self.state() != NodeState::Started {
            return Err(NodeError::NotRunning);
        }
        let mut backend = self.backend();
        if let Some(required) = backend.required_batch() {
            if smps.len() != required {
                return Err(NodeError::BatchSize {
                    required,
                    got: smps.len(),
                });
            }
        }
        let step = backend.max_batch().unwrap_or(smps.len()).max(1);
        let mut written = 0;
        while written < smps.len() {
            let end = (written + step).min(smps.len());
            let chunk = end - written;
            let accepted = backend.write(&smps[written..end])?;
            written += accepted;
            if accepted < chunk {
                // Partial write; the caller decides how loudly to complain.
                break;
            }
        }
        self.sent.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    pub fn reverse(&self) -> Result<(), NodeError> {
        self.backend().reverse()
    }

    /// Mark the node faulted after a fatal backend error.
    pub fn fault(&self) {
        self.state
            .store(NodeState::Faulted as u8, Ordering::Release);
    }

    fn backend(&self) -> std::sync::MutexGuard<'_, Box<dyn NodeBackend>> {
        self.backend.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Type-level half of a node plug-in: knows how to build backends from
/// configuration and observes first/last instance transitions.
pub trait NodeTypePlugin: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn instantiate(&self, cfg: &toml::Value) -> Result<Box<dyn NodeBackend>, NodeError>;

    /// Called when the first instance of this type is created.
    fn on_first_instance(&self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Called after the last instance of this type was released.
    fn on_last_instance(&self) {}
}

struct RegisteredType {
    plugin: Box<dyn NodeTypePlugin>,
    instances: AtomicU64,
}

/// Mapping from type identifiers to plug-ins, built once at program start
/// and handed by reference into the daemon. Immutable after construction.
#[derive(Default)]
pub struct NodeTypeRegistry {
    types: HashMap<&'static str, RegisteredType>,
}

impl NodeTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn NodeTypePlugin>) {
        let name = plugin.type_name();
        let previous = self.types.insert(
            name,
            RegisteredType {
                plugin,
                instances: AtomicU64::new(0),
            },
        );
        assert!(previous.is_none(), "node type '{name}' registered twice");
    }

    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.types.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Build a backend of the given type. The first instance of a type runs
    /// the plug-in's type-level start.
    pub fn instantiate(
        &self,
        type_name: &str,
        cfg: &toml::Value,
    ) -> Result<(&'static str, Box<dyn NodeBackend>), NodeError> {
        let registered = self
            .types
            .get(type_name)
            .ok_or_else(|| NodeError::UnknownType(type_name.to_string()))?;
        let backend = registered.plugin.instantiate(cfg)?;
        if registered.instances.fetch_add(1, Ordering::AcqRel) == 0 {
            registered.plugin.on_first_instance()?;
        }
        Ok((registered.plugin.type_name(), backend))
    }

    /// Account for a destroyed instance. The last one of a type runs the
    /// plug-in's type-level stop.
    pub fn release(&self, type_name: &str) {
        if let Some(registered) = self.types.get(type_name) {
            if registered.instances.fetch_sub(1, Ordering::AcqRel) == 1 {
                registered.plugin.on_last_instance();
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("unknown node type '{0}'")]
    UnknownType(String),
    #[error("invalid node configuration: {0}")]
    InvalidConfig(String),
    #[error("node is not running")]
    NotRunning,
    #[error("backend requires batches of {required}, got {got}")]
    BatchSize { required: usize, got: usize },
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("i/o fault: {0}")]
    Io(#[from] std::io::Error),
    #[error("fatal node fault: {0}")]
    Fatal(String),
}
