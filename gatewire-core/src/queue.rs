//! Bounded single-writer ring with independent per-reader cursors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::pool::SampleRef;

/// Identifies one registered reader of a [`PathQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderId(usize);

/// Circular buffer mediating one writer and several readers inside a path.
///
/// The writer appends, each reader consumes at its own pace, and a slot is
/// reclaimed (its sample handle dropped, returning the sample to its pool)
/// once the slowest reader has passed it. The writer never laps the slowest
/// reader: `push_many` truncates instead, and the caller reports overflow.
pub struct PathQueue {
    slots: Box<[Mutex<Option<SampleRef>>]>,
    mask: u64,
    writer: AtomicU64,
    readers: RwLock<Vec<AtomicU64>>,
    sealed: AtomicBool,
    reclaimed: Mutex<u64>,
}

impl PathQueue {
    /// Create a queue with at least `len` slots, rounded up to a power of two.
    pub fn new(len: usize) -> Self {
        let len = len.max(2).next_power_of_two();
        let slots = (0..len)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: len as u64 - 1,
            writer: AtomicU64::new(0),
            readers: RwLock::new(Vec::new()),
            sealed: AtomicBool::new(false),
            reclaimed: Mutex::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Add a reader cursor. Only allowed before the first push; a reader
    /// registered after activity could miss samples, so this panics instead.
    pub fn register_reader(&self) -> ReaderId {
        assert!(
            !self.sealed.load(Ordering::Acquire),
            "reader registered after the queue saw pushes"
        );
        let mut readers = self.readers.write().unwrap_or_else(|e| e.into_inner());
        let start = self.writer.load(Ordering::Relaxed);
        readers.push(AtomicU64::new(start));
        ReaderId(readers.len() - 1)
    }

    /// Position of the writer cursor: total number of samples pushed.
    pub fn writer_pos(&self) -> u64 {
        self.writer.load(Ordering::Acquire)
    }

    pub fn reader_pos(&self, id: ReaderId) -> u64 {
        let readers = self.readers.read().unwrap_or_else(|e| e.into_inner());
        readers[id.0].load(Ordering::Acquire)
    }

    /// Samples pushed but not yet pulled by this reader.
    pub fn available(&self, id: ReaderId) -> u64 {
        self.writer_pos() - self.reader_pos(id)
    }

    /// Append samples from the front of `batch`, stopping at the span that
    /// fits without overrunning the slowest reader. Pushed samples are
    /// drained from `batch`; whatever remains is the caller's responsibility.
    /// Returns the number pushed.
    pub fn push_many(&self, batch: &mut Vec<SampleRef>) -> usize {
        self.sealed.store(true, Ordering::Release);
        let w = self.writer.load(Ordering::Relaxed);
        let free = self.slots.len() as u64 - (w - self.min_reader(w));
        let n = (free as usize).min(batch.len());
        for (i, smp) in batch.drain(..n).enumerate() {
            let pos = w + i as u64;
            let mut slot = self.slot(pos);
            // Anything the slowest reader already passed dies on overwrite.
            *slot = Some(smp);
        }
        self.writer.store(w + n as u64, Ordering::Release);
        n
    }

    /// Consume up to `max` samples in FIFO order, advancing this reader's
    /// cursor. Returns an empty vector when the reader is caught up.
    pub fn pull_many(&self, id: ReaderId, max: usize) -> Vec<SampleRef> {
        let w = self.writer.load(Ordering::Acquire);
        let readers = self.readers.read().unwrap_or_else(|e| e.into_inner());
        let r = readers[id.0].load(Ordering::Relaxed);
        let n = ((w - r) as usize).min(max);
        let mut out = Vec::with_capacity(n);
        for pos in r..r + n as u64 {
            if let Some(smp) = self.slot(pos).as_ref() {
                out.push(smp.clone());
            }
        }
        readers[id.0].store(r + n as u64, Ordering::Release);
        drop(readers);
        self.reclaim();
        out
    }

    /// Non-advancing read of up to `max` samples starting at `base`. Used by
    /// the send path so that reading for transmission does not consume.
    pub fn peek(&self, base: u64, max: usize) -> Vec<SampleRef> {
        let w = self.writer.load(Ordering::Acquire);
        let hi = (base + max as u64).min(w);
        let mut out = Vec::new();
        for pos in base..hi {
            if let Some(smp) = self.slot(pos).as_ref() {
                out.push(smp.clone());
            }
        }
        out
    }

    fn slot(&self, pos: u64) -> std::sync::MutexGuard<'_, Option<SampleRef>> {
        self.slots[(pos & self.mask) as usize]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn min_reader(&self, writer: u64) -> u64 {
        let readers = self.readers.read().unwrap_or_else(|e| e.into_inner());
        readers
            .iter()
            .map(|r| r.load(Ordering::Acquire))
            .min()
            .unwrap_or(writer)
    }

    /// Drop slot contents below the slowest reader. Slot release is driven by
    /// `min` over all cursors, nothing else.
    fn reclaim(&self) {
        let mut done = self.reclaimed.lock().unwrap_or_else(|e| e.into_inner());
        let min = self.min_reader(self.writer.load(Ordering::Acquire));
        for pos in *done..min {
            let _ = self.slot(pos).take();
        }
        if min > *done {
            *done = min;
        }
    }
}
