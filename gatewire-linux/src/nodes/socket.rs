//! UDP socket node type carrying raw-format datagrams.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use serde::Deserialize;

use gatewire_core::{format, NodeBackend, NodeError, NodeTypePlugin, SampleRef};

/// Read timeout so the receive loop can observe shutdown requests.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SocketConfig {
    /// Address to bind for receiving.
    local: String,
    /// Peer for outgoing datagrams; optional for receive-only nodes.
    #[serde(default)]
    remote: Option<String>,
}

pub struct SocketNode {
    local: String,
    remote: Option<String>,
    socket: Option<UdpSocket>,
    remote_addr: Option<SocketAddr>,
    buf: Vec<u8>,
}

impl SocketNode {
    fn new(local: String, remote: Option<String>) -> Self {
        Self {
            local,
            remote,
            socket: None,
            remote_addr: None,
            buf: vec![0; MAX_DATAGRAM],
        }
    }

    /// Address the socket actually bound to. Only valid after start.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl NodeBackend for SocketNode {
    fn summary(&self) -> String {
        format!(
            "local={}, remote={}",
            self.local,
            self.remote.as_deref().unwrap_or("-")
        )
    }

    fn check(&self) -> Result<(), NodeError> {
        self.local
            .parse::<SocketAddr>()
            .map_err(|e| NodeError::InvalidConfig(format!("local address: {e}")))?;
        if let Some(remote) = &self.remote {
            remote
                .parse::<SocketAddr>()
                .map_err(|e| NodeError::InvalidConfig(format!("remote address: {e}")))?;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), NodeError> {
        let socket = UdpSocket::bind(&self.local)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        self.remote_addr = match &self.remote {
            Some(remote) => Some(
                remote
                    .parse()
                    .map_err(|e| NodeError::InvalidConfig(format!("remote address: {e}")))?,
            ),
            None => None,
        };
        self.socket = Some(socket);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NodeError> {
        self.socket = None;
        Ok(())
    }

    fn read(&mut self, smps: &mut [SampleRef]) -> Result<usize, NodeError> {
        let Some(socket) = &self.socket else {
            return Err(NodeError::NotRunning);
        };
        if smps.is_empty() {
            return Ok(0);
        }

        let len = match socket.recv(&mut self.buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(0)
            }
            Err(e) => return Err(e.into()),
        };

        match format::decode(&self.buf[..len], &mut smps[0].data_mut()) {
            Ok(()) => Ok(1),
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable datagram");
                Ok(0)
            }
        }
    }

    fn write(&mut self, smps: &[SampleRef]) -> Result<usize, NodeError> {
        let Some(socket) = &self.socket else {
            return Err(NodeError::NotRunning);
        };
        let Some(remote) = self.remote_addr else {
            return Err(NodeError::NotSupported("write without a remote address"));
        };
        let mut sent = 0;
        for smp in smps {
            let datagram = format::encode(&smp.data());
            socket.send_to(&datagram, remote)?;
            sent += 1;
        }
        Ok(sent)
    }

    fn reverse(&mut self) -> Result<(), NodeError> {
        match self.remote.take() {
            Some(remote) => {
                self.remote = Some(std::mem::replace(&mut self.local, remote));
                Ok(())
            }
            None => Err(NodeError::NotSupported("reverse without a remote address")),
        }
    }
}

pub struct SocketPlugin;

impl NodeTypePlugin for SocketPlugin {
    fn type_name(&self) -> &'static str {
        "socket"
    }

    fn instantiate(&self, cfg: &toml::Value) -> Result<Box<dyn NodeBackend>, NodeError> {
        let cfg: SocketConfig = cfg
            .clone()
            .try_into()
            .map_err(|e| NodeError::InvalidConfig(format!("socket node: {e}")))?;
        Ok(Box::new(SocketNode::new(cfg.local, cfg.remote)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatewire_core::{signal, Pool, SignalType, SignalValue};

    #[test]
    fn datagram_roundtrip_over_localhost() {
        let mut receiver = SocketNode::new("127.0.0.1:0".into(), None);
        receiver.start().unwrap();
        let addr = receiver.local_addr().unwrap();

        let mut sender = SocketNode::new("127.0.0.1:0".into(), Some(addr.to_string()));
        sender.start().unwrap();

        let pool = Pool::new(4, 2, signal::generate(2, SignalType::Float));
        let outgoing = pool.acquire(1);
        {
            let mut data = outgoing[0].data_mut();
            data.sequence = 5;
            data.set_values(&[SignalValue::Float(2.5), SignalValue::Integer(3).cast(SignalType::Float)]);
        }
        assert_eq!(sender.write(&outgoing).unwrap(), 1);

        let mut incoming = pool.acquire(1);
        let mut got = 0;
        for _ in 0..20 {
            got = receiver.read(&mut incoming).unwrap();
            if got > 0 {
                break;
            }
        }
        assert_eq!(got, 1);
        let data = incoming[0].data();
        assert_eq!(data.sequence, 5);
        assert_eq!(
            data.values(),
            &[SignalValue::Float(2.5), SignalValue::Float(3.0)]
        );
    }

    #[test]
    fn reverse_swaps_addresses() {
        let mut node = SocketNode::new("127.0.0.1:1000".into(), Some("127.0.0.1:2000".into()));
        node.reverse().unwrap();
        assert_eq!(node.local, "127.0.0.1:2000");
        assert_eq!(node.remote.as_deref(), Some("127.0.0.1:1000"));
    }

    #[test]
    fn check_rejects_bad_addresses() {
        let node = SocketNode::new("not-an-address".into(), None);
        assert!(matches!(node.check(), Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn write_needs_a_remote() {
        let mut node = SocketNode::new("127.0.0.1:0".into(), None);
        node.start().unwrap();
        let pool = Pool::new(1, 1, signal::generate(1, SignalType::Float));
        let smps = pool.acquire(1);
        assert!(matches!(
            node.write(&smps),
            Err(NodeError::NotSupported(_))
        ));
    }
}
