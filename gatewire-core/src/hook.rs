//! Per-path processing chain: stateful hooks with lifecycle callbacks.

use crate::pool::SampleRef;
use crate::queue::ReaderId;
use crate::sample::SampleData;

/// Where in the processing flow a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// After a node produced samples, before they are handed to a path.
    NodeRead,
    /// Right before a node consumes samples.
    NodeWrite,
    /// After the path received a batch, before it enters the queue.
    PathRead,
    /// After the queue, before samples go out to a destination.
    PathWrite,
    /// On every tick of a rate-driven send thread.
    Periodic,
}

/// Verdict of processing one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Keep the sample.
    Ok,
    /// Discard the sample; the path counts it as skipped.
    Skip,
    /// Discard the sample and log; still counted as skipped.
    Error,
    /// Stop the whole path.
    Stop,
}

/// A transformation or observer in a path's processing chain.
///
/// Lifecycle: `init` and `parse` during path preparation, `check` before
/// start, `start`/`stop` around the path's running phase. `process` runs per
/// sample at every [`HookPoint`] the hook subscribed to; `periodic` runs on
/// rate ticks and may suppress a resend by returning [`HookAction::Skip`].
pub trait Hook: Send {
    fn name(&self) -> &'static str;

    /// Total order of execution within a chain; lower runs first.
    fn priority(&self) -> i32 {
        99
    }

    fn points(&self) -> &'static [HookPoint];

    /// How many past samples this hook needs to keep reachable in the queue.
    /// A non-zero window installs a dedicated reader cursor.
    fn history(&self) -> usize {
        0
    }

    fn init(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    fn parse(&mut self, _cfg: &toml::Value) -> Result<(), HookError> {
        Ok(())
    }

    fn check(&self) -> Result<(), HookError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    fn process(&mut self, _point: HookPoint, _smp: &mut SampleData) -> HookAction {
        HookAction::Ok
    }

    fn periodic(&mut self) -> HookAction {
        HookAction::Ok
    }

    fn stop(&mut self) -> Result<(), HookError> {
        Ok(())
    }
}

struct Entry {
    hook: Box<dyn Hook>,
    cfg: Option<toml::Value>,
    reader: Option<ReaderId>,
}

/// Result of running a batch through the chain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChainOutcome {
    /// Samples discarded by hook verdicts.
    pub skipped: usize,
    /// A hook demanded the path to stop.
    pub stop: bool,
}

/// Priority-sorted hook list owned by one path.
#[derive(Default)]
pub struct HookChain {
    entries: Vec<Entry>,
}

impl HookChain {
    pub fn new(hooks: Vec<(Box<dyn Hook>, Option<toml::Value>)>) -> Self {
        let mut entries: Vec<Entry> = hooks
            .into_iter()
            .map(|(hook, cfg)| Entry {
                hook,
                cfg,
                reader: None,
            })
            .collect();
        entries.sort_by_key(|e| e.hook.priority());
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn init(&mut self) -> Result<(), HookError> {
        self.entries.iter_mut().try_for_each(|e| e.hook.init())
    }

    /// Feed every hook its configuration fragment, if it has one.
    pub fn parse(&mut self) -> Result<(), HookError> {
        self.entries.iter_mut().try_for_each(|e| match &e.cfg {
            Some(cfg) => e.hook.parse(cfg),
            None => Ok(()),
        })
    }

    pub fn check(&self) -> Result<(), HookError> {
        self.entries.iter().try_for_each(|e| e.hook.check())
    }

    pub fn start(&mut self) -> Result<(), HookError> {
        self.entries.iter_mut().try_for_each(|e| e.hook.start())
    }

    pub fn stop(&mut self) -> Result<(), HookError> {
        self.entries.iter_mut().try_for_each(|e| e.hook.stop())
    }

    /// Attach queue readers for hooks that declared a history window.
    /// `register` is called once per such hook.
    pub fn attach_history_readers(&mut self, mut register: impl FnMut() -> ReaderId) {
        for entry in &mut self.entries {
            if entry.hook.history() > 0 {
                entry.reader = Some(register());
            }
        }
    }

    /// Reader cursors of history hooks together with their window sizes.
    pub fn history_readers(&self) -> Vec<(ReaderId, usize)> {
        self.entries
            .iter()
            .filter_map(|e| e.reader.map(|r| (r, e.hook.history())))
            .collect()
    }

    /// Run every hook subscribed to `point` over the batch in priority order,
    /// dropping samples whose last verdict was skip. Survivors stay in
    /// `batch`; drops release their pool slots immediately.
    pub fn run(&mut self, point: HookPoint, batch: &mut Vec<SampleRef>) -> ChainOutcome {
        let mut outcome = ChainOutcome::default();
        if batch.is_empty() || !self.entries.iter().any(|e| e.hook.points().contains(&point)) {
            return outcome;
        }

        let mut kept = Vec::with_capacity(batch.len());
        'samples: for smp in batch.drain(..) {
            let mut verdict = HookAction::Ok;
            {
                let mut data = smp.data_mut();
                for entry in &mut self.entries {
                    if !entry.hook.points().contains(&point) {
                        continue;
                    }
                    match entry.hook.process(point, &mut data) {
                        HookAction::Ok => {}
                        HookAction::Skip => {
                            verdict = HookAction::Skip;
                            break;
                        }
                        HookAction::Error => {
                            tracing::warn!(hook = entry.hook.name(), "hook rejected sample");
                            verdict = HookAction::Skip;
                            break;
                        }
                        HookAction::Stop => {
                            drop(data);
                            outcome.skipped += 1;
                            outcome.stop = true;
                            continue 'samples;
                        }
                    }
                }
            }
            match verdict {
                HookAction::Ok => kept.push(smp),
                _ => outcome.skipped += 1,
            }
        }
        *batch = kept;
        outcome
    }

    /// Run the periodic callbacks. Any skip verdict suppresses the pending
    /// emission.
    pub fn run_periodic(&mut self) -> HookAction {
        for entry in &mut self.entries {
            match entry.hook.periodic() {
                HookAction::Ok => {}
                other => return other,
            }
        }
        HookAction::Ok
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("unknown hook type '{0}'")]
    UnknownType(String),
    #[error("invalid hook configuration: {0}")]
    InvalidConfig(String),
    #[error("hook failed: {0}")]
    Failed(String),
}
