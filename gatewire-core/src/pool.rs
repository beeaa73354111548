//! Bounded pool of reusable samples with reference-counted handles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam_queue::ArrayQueue;

use crate::sample::SampleData;
use crate::signal::Signal;

struct Slot {
    refcnt: AtomicUsize,
    data: RwLock<SampleData>,
}

struct PoolInner {
    slots: Vec<Slot>,
    free: ArrayQueue<u32>,
}

/// Fixed-capacity sample allocator. Acquire never blocks; on exhaustion the
/// caller receives fewer samples and the shortfall surfaces upstream as a
/// pool underrun. Dropping the last [`SampleRef`] clone returns the slot to
/// the free list, so the multiset (free slots + in-flight samples) is
/// constant.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool of `count` samples, each with room for `samplelen`
    /// values described by the shared `signals` list.
    pub fn new(count: usize, samplelen: usize, signals: Arc<[Signal]>) -> Self {
        assert!(count > 0, "pool must hold at least one sample");
        let free = ArrayQueue::new(count);
        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            slots.push(Slot {
                refcnt: AtomicUsize::new(0),
                data: RwLock::new(SampleData::with_capacity(samplelen, signals.clone())),
            });
            // A fresh queue of matching capacity cannot be full.
            let _ = free.push(index as u32);
        }
        Self {
            inner: Arc::new(PoolInner { slots, free }),
        }
    }

    /// Take up to `cnt` free samples, metadata reset. Returns fewer (possibly
    /// none) when the pool is exhausted.
    pub fn acquire(&self, cnt: usize) -> Vec<SampleRef> {
        let mut out = Vec::with_capacity(cnt);
        for _ in 0..cnt {
            let Some(index) = self.inner.free.pop() else {
                break;
            };
            let slot = &self.inner.slots[index as usize];
            // The index came off the free list, so no other handle exists.
            slot.refcnt.store(1, Ordering::Release);
            slot.data
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .reset();
            out.push(SampleRef {
                pool: self.inner.clone(),
                index,
            });
        }
        out
    }

    /// Explicitly return samples. Each must belong to this pool, otherwise
    /// the call fails. Handles always recycle into their owning pool, so a
    /// foreign sample is an accounting error, never a leak.
    pub fn release(&self, samples: Vec<SampleRef>) -> Result<usize, PoolError> {
        if samples.iter().any(|s| !self.owns(s)) {
            return Err(PoolError::ForeignSample);
        }
        let n = samples.len();
        drop(samples);
        Ok(n)
    }

    pub fn owns(&self, sample: &SampleRef) -> bool {
        Arc::ptr_eq(&self.inner, &sample.pool)
    }

    /// Number of samples currently on the free list.
    pub fn free_len(&self) -> usize {
        self.inner.free.len()
    }

    /// Total number of samples this pool was built with.
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }
}

/// Handle to one pooled sample. Clones share the slot; the slot is recycled
/// once the last clone is dropped. Between acquire and first enqueue the
/// producer holds the only handle and may take the write side; afterwards the
/// sample is read-only by convention.
pub struct SampleRef {
    pool: Arc<PoolInner>,
    index: u32,
}

impl SampleRef {
    pub fn data(&self) -> RwLockReadGuard<'_, SampleData> {
        self.slot().data.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, SampleData> {
        self.slot().data.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Slot index inside the owning pool. Identifies the sample without
    /// keeping its data locked.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn ref_count(&self) -> usize {
        self.slot().refcnt.load(Ordering::Acquire)
    }

    fn slot(&self) -> &Slot {
        &self.pool.slots[self.index as usize]
    }
}

impl Clone for SampleRef {
    fn clone(&self) -> Self {
        self.slot().refcnt.fetch_add(1, Ordering::Relaxed);
        Self {
            pool: self.pool.clone(),
            index: self.index,
        }
    }
}

impl Drop for SampleRef {
    fn drop(&mut self) {
        if self.slot().refcnt.fetch_sub(1, Ordering::Release) == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            // Last handle gone; slot storage stays intact for reuse.
            let _ = self.pool.free.push(self.index);
        }
    }
}

impl std::fmt::Debug for SampleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRef")
            .field("index", &self.index)
            .field("refcnt", &self.ref_count())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("sample does not belong to this pool")]
    ForeignSample,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{self, SignalType, SignalValue};

    fn pool(count: usize) -> Pool {
        Pool::new(count, 4, signal::generate(4, SignalType::Float))
    }

    #[test]
    fn acquire_returns_fewer_on_exhaustion() {
        let p = pool(3);
        let first = p.acquire(2);
        assert_eq!(first.len(), 2);
        let second = p.acquire(4);
        assert_eq!(second.len(), 1);
        assert_eq!(p.free_len(), 0);
        assert!(p.acquire(1).is_empty());
    }

    #[test]
    fn drop_recycles_slot() {
        let p = pool(2);
        let smps = p.acquire(2);
        assert_eq!(p.free_len(), 0);
        drop(smps);
        assert_eq!(p.free_len(), 2);
        // Free + in-flight stays constant.
        let again = p.acquire(2);
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn clones_share_one_slot() {
        let p = pool(1);
        let s = p.acquire(1).pop().unwrap();
        let c = s.clone();
        assert_eq!(s.ref_count(), 2);
        drop(s);
        assert_eq!(p.free_len(), 0);
        drop(c);
        assert_eq!(p.free_len(), 1);
    }

    #[test]
    fn acquire_resets_metadata_not_capacity() {
        let p = pool(1);
        {
            let s = p.acquire(1).pop().unwrap();
            let mut d = s.data_mut();
            d.sequence = 99;
            d.push_value(SignalValue::Float(1.5));
        }
        let s = p.acquire(1).pop().unwrap();
        let d = s.data();
        assert_eq!(d.sequence, 0);
        assert_eq!(d.len(), 0);
        assert_eq!(d.capacity(), 4);
    }

    #[test]
    fn release_rejects_foreign_sample() {
        let p = pool(1);
        let other = pool(1);
        let mine = p.acquire(1).pop().unwrap();
        let theirs = other.acquire(1).pop().unwrap();
        assert!(p.owns(&mine));
        assert!(!p.owns(&theirs));
        let err = p.release(vec![theirs]).unwrap_err();
        assert_eq!(err, PoolError::ForeignSample);
        assert_eq!(p.release(vec![mine]).unwrap(), 1);
        assert_eq!(p.free_len(), 1);
    }
}
