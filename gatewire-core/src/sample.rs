//! The time-stamped value vector travelling through a path.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::signal::{Signal, SignalValue};

/// Nanosecond-resolution wall clock timestamp (seconds since the Unix epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u32,
}

impl Timestamp {
    pub fn new(sec: u64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: since_epoch.as_secs(),
            nsec: since_epoch.subsec_nanos(),
        }
    }

    pub fn as_nanos(&self) -> u128 {
        self.sec as u128 * 1_000_000_000 + self.nsec as u128
    }
}

/// Contents of one sample: metadata plus a typed value vector of fixed
/// capacity. The populated length is always <= the capacity reserved at pool
/// construction.
#[derive(Debug)]
pub struct SampleData {
    /// Monotonic sequence number, assigned by the producing node.
    pub sequence: u64,
    /// When the data was sampled at its origin.
    pub ts_origin: Timestamp,
    /// When the data was received by this process.
    pub ts_received: Timestamp,
    /// Name of the node this sample originated from. Identity only.
    pub source: Option<Arc<str>>,
    /// Shared descriptor list for the value vector.
    pub signals: Arc<[Signal]>,
    values: Vec<SignalValue>,
    capacity: usize,
}

impl SampleData {
    pub fn with_capacity(capacity: usize, signals: Arc<[Signal]>) -> Self {
        Self {
            sequence: 0,
            ts_origin: Timestamp::default(),
            ts_received: Timestamp::default(),
            source: None,
            signals,
            values: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[SignalValue] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [SignalValue] {
        &mut self.values
    }

    /// Replace the value vector, truncating at the reserved capacity.
    /// Returns the number of values actually stored.
    pub fn set_values(&mut self, values: &[SignalValue]) -> usize {
        let n = values.len().min(self.capacity);
        self.values.clear();
        self.values.extend_from_slice(&values[..n]);
        n
    }

    pub fn push_value(&mut self, value: SignalValue) -> bool {
        if self.values.len() < self.capacity {
            self.values.push(value);
            true
        } else {
            false
        }
    }

    /// Reset metadata for reuse. Value storage is left as-is; it is undefined
    /// until the next producer writes it.
    pub fn reset(&mut self) {
        self.sequence = 0;
        self.ts_origin = Timestamp::default();
        self.ts_received = Timestamp::default();
        self.source = None;
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{self, SignalType};

    #[test]
    fn capacity_bounds_length() {
        let signals = signal::generate(2, SignalType::Float);
        let mut data = SampleData::with_capacity(2, signals);
        let stored = data.set_values(&[
            SignalValue::Float(1.0),
            SignalValue::Float(2.0),
            SignalValue::Float(3.0),
        ]);
        assert_eq!(stored, 2);
        assert_eq!(data.len(), 2);
        assert!(!data.push_value(SignalValue::Float(4.0)));
    }

    #[test]
    fn reset_clears_metadata_only() {
        let signals = signal::generate(1, SignalType::Integer);
        let mut data = SampleData::with_capacity(1, signals);
        data.sequence = 42;
        data.ts_origin = Timestamp::new(1, 2);
        data.push_value(SignalValue::Integer(7));
        data.reset();
        assert_eq!(data.sequence, 0);
        assert_eq!(data.ts_origin, Timestamp::default());
        assert_eq!(data.len(), 0);
        assert_eq!(data.capacity(), 1);
    }

    #[test]
    fn timestamp_ordering() {
        let a = Timestamp::new(1, 999_999_999);
        let b = Timestamp::new(2, 0);
        assert!(a < b);
        assert_eq!(b.as_nanos(), 2_000_000_000);
    }
}
