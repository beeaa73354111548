//! File node type: line-oriented sample replay and logging.
//!
//! One sample per line: `<sec>.<nsec>(<sequence>) <value> <value> ...`
//! Values are stored as floats; blank lines and `#` comments are skipped.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use gatewire_core::{
    NodeBackend, NodeError, NodeTypePlugin, SampleData, SampleRef, SignalType, SignalValue,
    Timestamp,
};

/// Pause at end of file before reporting "no data" again, so a tailing
/// reader does not spin.
const EOF_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default, rename = "in")]
    input: Option<DirectionConfig>,
    #[serde(default)]
    out: Option<DirectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DirectionConfig {
    path: PathBuf,
}

pub struct FileNode {
    read_path: Option<PathBuf>,
    write_path: Option<PathBuf>,
    reader: Option<BufReader<File>>,
    writer: Option<BufWriter<File>>,
}

impl FileNode {
    fn new(read_path: Option<PathBuf>, write_path: Option<PathBuf>) -> Self {
        Self {
            read_path,
            write_path,
            reader: None,
            writer: None,
        }
    }
}

impl NodeBackend for FileNode {
    fn summary(&self) -> String {
        format!(
            "in={}, out={}",
            self.read_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".into()),
            self.write_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".into()),
        )
    }

    fn check(&self) -> Result<(), NodeError> {
        if self.read_path.is_none() && self.write_path.is_none() {
            return Err(NodeError::InvalidConfig(
                "file node needs an 'in' or 'out' path".into(),
            ));
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), NodeError> {
        if let Some(path) = &self.read_path {
            self.reader = Some(BufReader::new(File::open(path)?));
        }
        if let Some(path) = &self.write_path {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NodeError> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        self.reader = None;
        self.writer = None;
        Ok(())
    }

    fn read(&mut self, smps: &mut [SampleRef]) -> Result<usize, NodeError> {
        let Some(reader) = &mut self.reader else {
            return Err(NodeError::NotSupported("read without an 'in' path"));
        };

        let mut filled = 0;
        let mut line = String::new();
        while filled < smps.len() {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            match parse_line(&line) {
                Some((ts, sequence, values)) => {
                    let mut data = smps[filled].data_mut();
                    data.sequence = sequence;
                    data.ts_origin = ts;
                    let floats: Vec<SignalValue> =
                        values.into_iter().map(SignalValue::Float).collect();
                    data.set_values(&floats);
                    drop(data);
                    filled += 1;
                }
                None if line.trim().is_empty() || line.trim_start().starts_with('#') => {}
                None => {
                    tracing::warn!(line = line.trim(), "skipping malformed sample line");
                }
            }
        }
        if filled == 0 {
            // End of file is a valid "no data"; the path keeps polling.
            std::thread::sleep(EOF_BACKOFF);
        }
        Ok(filled)
    }

    fn write(&mut self, smps: &[SampleRef]) -> Result<usize, NodeError> {
        let Some(writer) = &mut self.writer else {
            return Err(NodeError::NotSupported("write without an 'out' path"));
        };
        for smp in smps {
            let line = format_line(&smp.data());
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(smps.len())
    }

    fn reverse(&mut self) -> Result<(), NodeError> {
        std::mem::swap(&mut self.read_path, &mut self.write_path);
        Ok(())
    }
}

fn format_line(data: &SampleData) -> String {
    let mut line = format!(
        "{}.{:09}({})",
        data.ts_origin.sec, data.ts_origin.nsec, data.sequence
    );
    for value in data.values() {
        let float = match value.cast(SignalType::Float) {
            SignalValue::Float(f) => f,
            _ => unreachable!("cast to float yields a float"),
        };
        line.push(' ');
        line.push_str(&format!("{float}"));
    }
    line
}

fn parse_line(line: &str) -> Option<(Timestamp, u64, Vec<f64>)> {
    let line = line.trim();
    let (stamp, values_part) = line.split_once(')')?;
    let (ts_part, seq_part) = stamp.split_once('(')?;
    let (sec_part, nsec_part) = ts_part.split_once('.')?;

    let sec = sec_part.parse().ok()?;
    let nsec = nsec_part.parse().ok()?;
    let sequence = seq_part.parse().ok()?;

    let mut values = Vec::new();
    for token in values_part.split_whitespace() {
        values.push(token.parse().ok()?);
    }
    Some((Timestamp::new(sec, nsec), sequence, values))
}

pub struct FilePlugin;

impl NodeTypePlugin for FilePlugin {
    fn type_name(&self) -> &'static str {
        "file"
    }

    fn instantiate(&self, cfg: &toml::Value) -> Result<Box<dyn NodeBackend>, NodeError> {
        let cfg: FileConfig = cfg
            .clone()
            .try_into()
            .map_err(|e| NodeError::InvalidConfig(format!("file node: {e}")))?;
        Ok(Box::new(FileNode::new(
            cfg.input.map(|d| d.path),
            cfg.out.map(|d| d.path),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatewire_core::{signal, Pool};

    fn scratch_file(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "gatewire-file-test-{tag}-{}",
            std::process::id()
        ))
    }

    #[test]
    fn line_roundtrip() {
        let signals = signal::generate(3, SignalType::Float);
        let mut data = SampleData::with_capacity(3, signals);
        data.sequence = 17;
        data.ts_origin = Timestamp::new(1600000000, 41407900);
        data.set_values(&[SignalValue::Float(5.3), SignalValue::Float(-2.0)]);

        let line = format_line(&data);
        assert_eq!(line, "1600000000.041407900(17) 5.3 -2");

        let (ts, seq, values) = parse_line(&line).unwrap();
        assert_eq!(ts, Timestamp::new(1600000000, 41407900));
        assert_eq!(seq, 17);
        assert_eq!(values, vec![5.3, -2.0]);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(parse_line("").is_none());
        assert!(parse_line("gibberish").is_none());
        assert!(parse_line("1.2(x) 3.0").is_none());
    }

    #[test]
    fn log_then_replay() {
        let path = scratch_file("replay");
        let _ = std::fs::remove_file(&path);

        let pool = Pool::new(4, 2, signal::generate(2, SignalType::Float));
        let smps = pool.acquire(2);
        for (i, smp) in smps.iter().enumerate() {
            let mut data = smp.data_mut();
            data.sequence = i as u64 + 1;
            data.ts_origin = Timestamp::new(100 + i as u64, 0);
            data.set_values(&[SignalValue::Float(i as f64)]);
        }

        let mut log = FileNode::new(None, Some(path.clone()));
        log.start().unwrap();
        assert_eq!(log.write(&smps).unwrap(), 2);
        log.stop().unwrap();

        let mut replay = FileNode::new(Some(path.clone()), None);
        replay.start().unwrap();
        let mut incoming = pool.acquire(2);
        assert_eq!(replay.read(&mut incoming).unwrap(), 2);
        assert_eq!(incoming[0].data().sequence, 1);
        assert_eq!(incoming[1].data().sequence, 2);
        assert_eq!(incoming[1].data().values(), &[SignalValue::Float(1.0)]);

        // Past the end: no data, not an error.
        let mut more = pool.acquire(1);
        assert_eq!(replay.read(&mut more).unwrap(), 0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reverse_swaps_directions() {
        let mut node = FileNode::new(Some("/a".into()), Some("/b".into()));
        node.reverse().unwrap();
        assert_eq!(node.read_path, Some(PathBuf::from("/b")));
        assert_eq!(node.write_path, Some(PathBuf::from("/a")));
    }

    #[test]
    fn config_requires_some_direction() {
        let node = FileNode::new(None, None);
        assert!(node.check().is_err());
    }
}
