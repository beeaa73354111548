//! MQTT node type: publish samples to one topic, subscribe to another.
//!
//! A dedicated broker thread per client drives the connection event loop and
//! feeds received payloads into a bounded channel the `read` side drains.
//! Samples travel as JSON objects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};

use gatewire_core::{
    NodeBackend, NodeError, NodeTypePlugin, SampleData, SampleRef, SignalValue, Timestamp,
};

const CHANNEL_CAPACITY: usize = 1024;
const READ_POLL: Duration = Duration::from_millis(100);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MqttConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    publish: Option<String>,
    #[serde(default)]
    subscribe: Option<String>,
    #[serde(default)]
    qos: u8,
    #[serde(default)]
    retain: bool,
    #[serde(default = "default_keepalive")]
    keepalive: u64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    5
}

/// JSON representation of one sample on the wire.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireSample {
    sequence: u64,
    ts_origin: (u64, u32),
    data: Vec<serde_json::Value>,
}

fn to_wire(data: &SampleData) -> WireSample {
    WireSample {
        sequence: data.sequence,
        ts_origin: (data.ts_origin.sec, data.ts_origin.nsec),
        data: data.values().iter().map(value_to_json).collect(),
    }
}

fn value_to_json(value: &SignalValue) -> serde_json::Value {
    match value {
        SignalValue::Integer(i) => serde_json::json!(i),
        SignalValue::Float(f) => serde_json::json!(f),
        SignalValue::Boolean(b) => serde_json::json!(b),
        SignalValue::Complex(c) => serde_json::json!([c.re, c.im]),
    }
}

fn json_to_value(value: &serde_json::Value) -> Option<SignalValue> {
    match value {
        serde_json::Value::Bool(b) => Some(SignalValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(SignalValue::Integer(i))
            } else {
                n.as_f64().map(SignalValue::Float)
            }
        }
        serde_json::Value::Array(parts) if parts.len() == 2 => {
            let re = parts[0].as_f64()? as f32;
            let im = parts[1].as_f64()? as f32;
            Some(SignalValue::Complex(gatewire_core::Complex32::new(re, im)))
        }
        _ => None,
    }
}

fn apply_wire(wire: &WireSample, data: &mut SampleData) -> bool {
    let mut values = Vec::with_capacity(wire.data.len());
    for entry in &wire.data {
        match json_to_value(entry) {
            Some(value) => values.push(value),
            None => return false,
        }
    }
    data.sequence = wire.sequence;
    data.ts_origin = Timestamp::new(wire.ts_origin.0, wire.ts_origin.1);
    data.set_values(&values);
    true
}

fn qos_from(level: u8) -> Result<QoS, NodeError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(NodeError::InvalidConfig(format!(
            "qos must be 0..=2, got {other}"
        ))),
    }
}

pub struct MqttNode {
    cfg: MqttConfig,
    client: Option<Client>,
    incoming: Option<Receiver<Vec<u8>>>,
    broker_thread: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
    faulted: Arc<AtomicBool>,
}

impl MqttNode {
    fn new(cfg: MqttConfig) -> Self {
        Self {
            cfg,
            client: None,
            incoming: None,
            broker_thread: None,
            stopping: Arc::new(AtomicBool::new(false)),
            faulted: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl NodeBackend for MqttNode {
    fn summary(&self) -> String {
        format!(
            "host={}:{}, publish={}, subscribe={}, qos={}",
            self.cfg.host,
            self.cfg.port,
            self.cfg.publish.as_deref().unwrap_or("-"),
            self.cfg.subscribe.as_deref().unwrap_or("-"),
            self.cfg.qos,
        )
    }

    fn check(&self) -> Result<(), NodeError> {
        if self.cfg.publish.is_none() && self.cfg.subscribe.is_none() {
            return Err(NodeError::InvalidConfig(
                "mqtt node needs a 'publish' or 'subscribe' topic".into(),
            ));
        }
        qos_from(self.cfg.qos).map(|_| ())
    }

    fn start(&mut self) -> Result<(), NodeError> {
        let client_id = self
            .cfg
            .client_id
            .clone()
            .unwrap_or_else(|| format!("gatewire-{}", std::process::id()));
        let mut options = MqttOptions::new(client_id, self.cfg.host.clone(), self.cfg.port);
        options.set_keep_alive(Duration::from_secs(self.cfg.keepalive.max(1)));
        if let (Some(user), Some(pass)) = (&self.cfg.username, &self.cfg.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut connection) = Client::new(options, 64);
        if let Some(topic) = &self.cfg.subscribe {
            client
                .subscribe(topic.clone(), qos_from(self.cfg.qos)?)
                .map_err(|e| NodeError::Fatal(format!("subscribe failed: {e}")))?;
        }

        let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = bounded(CHANNEL_CAPACITY);
        let stopping = self.stopping.clone();
        let faulted = self.faulted.clone();

        self.broker_thread = Some(
            std::thread::Builder::new()
                .name("mqtt-broker".into())
                .spawn(move || {
                    let mut consecutive_errors = 0u32;
                    for event in connection.iter() {
                        if stopping.load(Ordering::Acquire) {
                            break;
                        }
                        match event {
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                consecutive_errors = 0;
                                if tx.try_send(publish.payload.to_vec()).is_err() {
                                    tracing::warn!(
                                        topic = publish.topic,
                                        "mqtt subscriber queue full, dropping message"
                                    );
                                }
                            }
                            Ok(_) => consecutive_errors = 0,
                            Err(e) => {
                                consecutive_errors += 1;
                                if consecutive_errors == 1 {
                                    tracing::warn!(error = %e, "mqtt connection error, attempting reconnect");
                                    std::thread::sleep(RECONNECT_PAUSE);
                                } else {
                                    tracing::warn!(error = %e, "persisting mqtt connection error");
                                    faulted.store(true, Ordering::Release);
                                    break;
                                }
                            }
                        }
                    }
                })
                .map_err(|e| NodeError::Fatal(format!("failed to spawn broker thread: {e}")))?,
        );

        self.incoming = Some(rx);
        self.client = Some(client);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NodeError> {
        self.stopping.store(true, Ordering::Release);
        if let Some(client) = self.client.take() {
            let _ = client.disconnect();
        }
        if let Some(handle) = self.broker_thread.take() {
            let _ = handle.join();
        }
        self.incoming = None;
        Ok(())
    }

    fn read(&mut self, smps: &mut [SampleRef]) -> Result<usize, NodeError> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(NodeError::Fatal("mqtt connection lost".into()));
        }
        let Some(rx) = &self.incoming else {
            return Err(NodeError::NotRunning);
        };
        if smps.is_empty() {
            return Ok(0);
        }

        let mut filled = 0;
        let mut payload = match rx.recv_timeout(READ_POLL) {
            Ok(payload) => Some(payload),
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(NodeError::Fatal("mqtt broker thread gone".into()))
            }
        };

        while let Some(bytes) = payload.take() {
            match serde_json::from_slice::<WireSample>(&bytes) {
                Ok(wire) => {
                    if apply_wire(&wire, &mut smps[filled].data_mut()) {
                        filled += 1;
                    } else {
                        tracing::warn!("mqtt message with unsupported value shapes");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "invalid mqtt sample payload"),
            }
            if filled < smps.len() {
                payload = rx.try_recv().ok();
            }
        }
        Ok(filled)
    }

    fn write(&mut self, smps: &[SampleRef]) -> Result<usize, NodeError> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(NodeError::Fatal("mqtt connection lost".into()));
        }
        let Some(client) = &self.client else {
            return Err(NodeError::NotRunning);
        };
        let Some(topic) = &self.cfg.publish else {
            return Err(NodeError::NotSupported("write without a publish topic"));
        };
        let qos = qos_from(self.cfg.qos)?;

        let mut sent = 0;
        for smp in smps {
            let wire = to_wire(&smp.data());
            let payload = serde_json::to_vec(&wire)
                .map_err(|e| NodeError::Fatal(format!("sample encode failed: {e}")))?;
            client
                .publish(topic.clone(), qos, self.cfg.retain, payload)
                .map_err(|e| NodeError::Fatal(format!("publish failed: {e}")))?;
            sent += 1;
        }
        Ok(sent)
    }

    fn reverse(&mut self) -> Result<(), NodeError> {
        std::mem::swap(&mut self.cfg.publish, &mut self.cfg.subscribe);
        Ok(())
    }
}

pub struct MqttPlugin;

impl NodeTypePlugin for MqttPlugin {
    fn type_name(&self) -> &'static str {
        "mqtt"
    }

    fn instantiate(&self, cfg: &toml::Value) -> Result<Box<dyn NodeBackend>, NodeError> {
        let cfg: MqttConfig = cfg
            .clone()
            .try_into()
            .map_err(|e| NodeError::InvalidConfig(format!("mqtt node: {e}")))?;
        Ok(Box::new(MqttNode::new(cfg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatewire_core::signal::{self, SignalType};

    fn config(text: &str) -> MqttConfig {
        let value: toml::Value = text.parse().unwrap();
        value.try_into().unwrap()
    }

    #[test]
    fn config_defaults_and_overrides() {
        let cfg = config(
            r#"
            host = "broker.example"
            subscribe = "meters/in"
            qos = 1
        "#,
        );
        assert_eq!(cfg.port, 1883);
        assert_eq!(cfg.qos, 1);
        assert_eq!(cfg.subscribe.as_deref(), Some("meters/in"));
        assert!(cfg.publish.is_none());
        assert!(!cfg.retain);
    }

    #[test]
    fn check_needs_a_topic() {
        let node = MqttNode::new(config("host = \"broker\""));
        assert!(node.check().is_err());

        let node = MqttNode::new(config("host = \"broker\"\npublish = \"out\""));
        node.check().unwrap();
    }

    #[test]
    fn qos_levels_map_and_reject() {
        assert_eq!(qos_from(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from(3).is_err());
    }

    #[test]
    fn wire_sample_roundtrip() {
        let signals = signal::generate(4, SignalType::Float);
        let mut data = SampleData::with_capacity(4, signals.clone());
        data.sequence = 3;
        data.ts_origin = Timestamp::new(10, 20);
        data.set_values(&[
            SignalValue::Integer(-4),
            SignalValue::Float(0.5),
            SignalValue::Boolean(true),
            SignalValue::Complex(gatewire_core::Complex32::new(1.0, 2.0)),
        ]);

        let bytes = serde_json::to_vec(&to_wire(&data)).unwrap();
        let wire: WireSample = serde_json::from_slice(&bytes).unwrap();

        let mut decoded = SampleData::with_capacity(4, signals);
        assert!(apply_wire(&wire, &mut decoded));
        assert_eq!(decoded.sequence, 3);
        assert_eq!(decoded.ts_origin, Timestamp::new(10, 20));
        assert_eq!(decoded.values(), data.values());
    }

    #[test]
    fn reverse_swaps_topics() {
        let mut node = MqttNode::new(config(
            "host = \"broker\"\npublish = \"a\"\nsubscribe = \"b\"",
        ));
        node.reverse().unwrap();
        assert_eq!(node.cfg.publish.as_deref(), Some("b"));
        assert_eq!(node.cfg.subscribe.as_deref(), Some("a"));
    }
}
