//! C37.118 TCP client node: requests the stream configuration, binds it,
//! and turns incoming data frames into samples.
//!
//! Read-only from the path's perspective; the write direction of the
//! protocol consists of the command frames this node sends itself.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::Deserialize;

use gatewire_core::c37_118::types::{Command, Config, Data, Frame, Message};
use gatewire_core::c37_118::{self, FrameError};
use gatewire_core::{NodeBackend, NodeError, NodeTypePlugin, SampleRef, SignalValue, Timestamp};

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct C37Config {
    /// PMU or PDC endpoint, `host:port`.
    remote: String,
    /// Our station identifier used in command frames.
    #[serde(default = "default_idcode")]
    idcode: u16,
}

fn default_idcode() -> u16 {
    1
}

pub struct C37Node {
    cfg: C37Config,
    stream: Option<TcpStream>,
    bound: Option<Config>,
    buf: Vec<u8>,
    sequence: u64,
}

impl C37Node {
    fn new(cfg: C37Config) -> Self {
        Self {
            cfg,
            stream: None,
            bound: None,
            buf: Vec::new(),
            sequence: 0,
        }
    }

    fn send_command(&mut self, cmd: u16) -> Result<(), NodeError> {
        let frame = Frame {
            version: PROTOCOL_VERSION,
            idcode: self.cfg.idcode,
            soc: Timestamp::now().sec as u32,
            fracsec: 0,
            message: Message::Command(Command::new(cmd)),
        };
        let bytes = c37_118::serialize(&frame, None)
            .map_err(|e| NodeError::Fatal(format!("command encode failed: {e}")))?;
        let stream = self.stream.as_mut().ok_or(NodeError::NotRunning)?;
        stream.write_all(&bytes)?;
        Ok(())
    }

    /// Pull one complete frame out of the stream buffer, reading more bytes
    /// when needed. `Ok(None)` means no full frame arrived in time.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, NodeError> {
        loop {
            if let Some(frame) = take_frame(&mut self.buf)? {
                return Ok(Some(frame));
            }
            let stream = self.stream.as_mut().ok_or(NodeError::NotRunning)?;
            let mut scratch = [0u8; 4096];
            match stream.read(&mut scratch) {
                Ok(0) => return Err(NodeError::Fatal("peer closed the connection".into())),
                Ok(n) => self.buf.extend_from_slice(&scratch[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Split one complete frame off the front of `buf`, if present.
fn take_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, NodeError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let size = match c37_118::frame_size(buf) {
        Ok(size) => size,
        Err(FrameError::MissingBytes) => return Ok(None),
        Err(e) => return Err(NodeError::Fatal(format!("stream out of sync: {e}"))),
    };
    if size < 4 {
        return Err(NodeError::Fatal("stream out of sync: zero frame size".into()));
    }
    if buf.len() < size {
        return Ok(None);
    }
    let frame = buf[..size].to_vec();
    buf.drain(..size);
    Ok(Some(frame))
}

/// Flatten one data frame into a value vector: per PMU the phasors as
/// complex values, frequency and its rate of change, the analogs, and the
/// digital status words.
fn data_to_values(data: &Data) -> Vec<SignalValue> {
    let mut values = Vec::new();
    for pmu in &data.pmus {
        for phasor in &pmu.phasors {
            values.push(SignalValue::Complex(phasor.to_complex()));
        }
        values.push(SignalValue::Float(pmu.freq.to_float() as f64));
        values.push(SignalValue::Float(pmu.dfreq.to_float() as f64));
        for analog in &pmu.analogs {
            values.push(SignalValue::Float(analog.to_float() as f64));
        }
        for &word in &pmu.digital {
            values.push(SignalValue::Integer(word as i64));
        }
    }
    values
}

/// Wall-clock timestamp of a frame given the config's fractional time base.
fn frame_timestamp(frame: &Frame, time_base: u32) -> Timestamp {
    let nsec = if time_base == 0 {
        0
    } else {
        ((frame.fracsec as u64 * 1_000_000_000) / time_base as u64) as u32
    };
    Timestamp::new(frame.soc as u64, nsec)
}

impl NodeBackend for C37Node {
    fn summary(&self) -> String {
        format!("remote={}, idcode={}", self.cfg.remote, self.cfg.idcode)
    }

    fn check(&self) -> Result<(), NodeError> {
        self.cfg
            .remote
            .parse::<std::net::SocketAddr>()
            .map_err(|e| NodeError::InvalidConfig(format!("remote address: {e}")))?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), NodeError> {
        let stream = TcpStream::connect(&self.cfg.remote)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.buf.clear();
        self.bound = None;
        self.sequence = 0;

        self.send_command(Command::GET_CONFIG2)?;
        self.send_command(Command::DATA_START)?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NodeError> {
        if self.stream.is_some() {
            // Best effort; the peer may already be gone.
            let _ = self.send_command(Command::DATA_STOP);
        }
        self.stream = None;
        self.bound = None;
        Ok(())
    }

    fn read(&mut self, smps: &mut [SampleRef]) -> Result<usize, NodeError> {
        if smps.is_empty() {
            return Ok(0);
        }
        let Some(bytes) = self.read_frame()? else {
            return Ok(0);
        };

        let frame = match c37_118::deserialize(&bytes, self.bound.as_ref()) {
            Ok(frame) => frame,
            Err(FrameError::MissingConfig) => {
                tracing::warn!("data frame before config, dropping");
                return Ok(0);
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable frame");
                return Ok(0);
            }
        };

        match frame.message {
            Message::Config1(config) | Message::Config2(config) => {
                tracing::info!(
                    pmus = config.pmus.len(),
                    data_rate = config.data_rate,
                    "bound stream configuration"
                );
                self.bound = Some(config);
                Ok(0)
            }
            Message::Data(ref data) => {
                let time_base = self
                    .bound
                    .as_ref()
                    .map(|c| c.time_base)
                    .unwrap_or_default();
                let mut sample = smps[0].data_mut();
                self.sequence += 1;
                sample.sequence = self.sequence;
                sample.ts_origin = frame_timestamp(&frame, time_base);
                sample.set_values(&data_to_values(data));
                Ok(1)
            }
            // Header and command frames carry no measurements.
            _ => Ok(0),
        }
    }

    fn write(&mut self, _smps: &[SampleRef]) -> Result<usize, NodeError> {
        Err(NodeError::NotSupported("c37_118 client is receive-only"))
    }
}

pub struct C37Plugin;

impl NodeTypePlugin for C37Plugin {
    fn type_name(&self) -> &'static str {
        "c37_118"
    }

    fn instantiate(&self, cfg: &toml::Value) -> Result<Box<dyn NodeBackend>, NodeError> {
        let cfg: C37Config = cfg
            .clone()
            .try_into()
            .map_err(|e| NodeError::InvalidConfig(format!("c37_118 node: {e}")))?;
        Ok(Box::new(C37Node::new(cfg)))
    }
}
