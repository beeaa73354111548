//! In-memory node type: samples written in come back out. No I/O involved,
//! which makes it the natural endpoint for tests and local fan-out paths.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::node::{NodeBackend, NodeError, NodeTypePlugin};
use crate::pool::SampleRef;
use crate::sample::Timestamp;
use crate::signal::SignalValue;

const DEFAULT_QUEUELEN: usize = 1024;
const READ_POLL: Duration = Duration::from_millis(20);

/// Payload carried across the loopback boundary. Plain data, detached from
/// any pool, so both sides keep their own sample lifetimes.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackMessage {
    pub sequence: u64,
    pub ts_origin: Timestamp,
    pub values: Vec<SignalValue>,
}

impl LoopbackMessage {
    pub fn new(sequence: u64, values: Vec<SignalValue>) -> Self {
        Self {
            sequence,
            ts_origin: Timestamp::now(),
            values,
        }
    }
}

/// Bounded channel backend. Writes drop on a full channel (surfaced as a
/// partial write); reads block briefly and report "no data" on timeout.
pub struct LoopbackNode {
    tx: Sender<LoopbackMessage>,
    rx: Receiver<LoopbackMessage>,
}

impl LoopbackNode {
    pub fn new(queuelen: usize) -> Self {
        let (tx, rx) = bounded(queuelen.max(1));
        Self { tx, rx }
    }

    /// Handle for injecting and observing messages from outside the node,
    /// e.g. from tests or a co-located producer.
    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl NodeBackend for LoopbackNode {
    fn summary(&self) -> String {
        format!("queuelen={}", self.tx.capacity().unwrap_or(0))
    }

    fn read(&mut self, smps: &mut [SampleRef]) -> Result<usize, NodeError> {
        if smps.is_empty() {
            return Ok(0);
        }
        // Block for the first message only; drain whatever else is ready.
        let first = match self.rx.recv_timeout(READ_POLL) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(NodeError::Fatal("loopback channel closed".into()))
            }
        };

        let mut filled = 0;
        let mut next = Some(first);
        while let Some(msg) = next.take() {
            let mut data = smps[filled].data_mut();
            data.sequence = msg.sequence;
            data.ts_origin = msg.ts_origin;
            data.set_values(&msg.values);
            drop(data);
            filled += 1;
            if filled < smps.len() {
                next = self.rx.try_recv().ok();
            }
        }
        Ok(filled)
    }

    fn write(&mut self, smps: &[SampleRef]) -> Result<usize, NodeError> {
        let mut accepted = 0;
        for smp in smps {
            let data = smp.data();
            let msg = LoopbackMessage {
                sequence: data.sequence,
                ts_origin: data.ts_origin,
                values: data.values().to_vec(),
            };
            drop(data);
            match self.tx.try_send(msg) {
                Ok(()) => accepted += 1,
                // Full channel: stop here, the caller records a partial write.
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Disconnected(_)) => {
                    return Err(NodeError::Fatal("loopback channel closed".into()))
                }
            }
        }
        Ok(accepted)
    }

    fn reverse(&mut self) -> Result<(), NodeError> {
        // Symmetric by construction.
        Ok(())
    }
}

/// Cloneable external endpoint of a [`LoopbackNode`].
#[derive(Clone)]
pub struct LoopbackHandle {
    tx: Sender<LoopbackMessage>,
    rx: Receiver<LoopbackMessage>,
}

impl LoopbackHandle {
    pub fn send(&self, msg: LoopbackMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<LoopbackMessage> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<LoopbackMessage> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Plug-in registration for the loopback type.
pub struct LoopbackPlugin;

impl NodeTypePlugin for LoopbackPlugin {
    fn type_name(&self) -> &'static str {
        "loopback"
    }

    fn instantiate(&self, cfg: &toml::Value) -> Result<Box<dyn NodeBackend>, NodeError> {
        let queuelen = match cfg.get("queuelen") {
            Some(v) => v
                .as_integer()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    NodeError::InvalidConfig("'queuelen' must be a positive integer".into())
                })? as usize,
            None => DEFAULT_QUEUELEN,
        };
        Ok(Box::new(LoopbackNode::new(queuelen)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use crate::signal::{self, SignalType};

    #[test]
    fn written_samples_come_back_out() {
        let pool = Pool::new(4, 2, signal::generate(2, SignalType::Float));
        let mut node = LoopbackNode::new(8);

        let outgoing = pool.acquire(2);
        for (i, smp) in outgoing.iter().enumerate() {
            let mut data = smp.data_mut();
            data.sequence = i as u64 + 1;
            data.set_values(&[SignalValue::Float(i as f64)]);
        }
        assert_eq!(node.write(&outgoing).unwrap(), 2);

        let mut incoming = pool.acquire(2);
        assert_eq!(node.read(&mut incoming).unwrap(), 2);
        assert_eq!(incoming[0].data().sequence, 1);
        assert_eq!(incoming[1].data().sequence, 2);
        assert_eq!(incoming[1].data().values(), &[SignalValue::Float(1.0)]);
    }

    #[test]
    fn full_channel_reports_partial_write() {
        let pool = Pool::new(4, 1, signal::generate(1, SignalType::Float));
        let mut node = LoopbackNode::new(2);
        let smps = pool.acquire(4);
        assert_eq!(node.write(&smps).unwrap(), 2);
    }

    #[test]
    fn empty_channel_reads_zero() {
        let pool = Pool::new(1, 1, signal::generate(1, SignalType::Float));
        let mut node = LoopbackNode::new(2);
        let mut smps = pool.acquire(1);
        assert_eq!(node.read(&mut smps).unwrap(), 0);
    }

    #[test]
    fn handle_injects_messages() {
        let pool = Pool::new(2, 1, signal::generate(1, SignalType::Float));
        let mut node = LoopbackNode::new(4);
        let handle = node.handle();
        handle.send(LoopbackMessage::new(7, vec![SignalValue::Float(0.5)]));

        let mut smps = pool.acquire(1);
        assert_eq!(node.read(&mut smps).unwrap(), 1);
        assert_eq!(smps[0].data().sequence, 7);
    }
}
