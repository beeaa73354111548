//! Built-in hook types.

use crate::hook::{Hook, HookAction, HookError, HookPoint};
use crate::sample::SampleData;
use crate::signal::SignalType;

/// Construct a built-in hook from a `{ type = "...", ... }` config table.
/// The fragment itself is parsed later, during path preparation.
pub fn from_config(cfg: &toml::Value) -> Result<Box<dyn Hook>, HookError> {
    let ty = cfg
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HookError::InvalidConfig("hook entry without a 'type' key".into()))?;

    match ty {
        "print" => Ok(Box::new(PrintHook::default())),
        "decimate" => Ok(Box::new(DecimateHook::default())),
        "cast" => Ok(Box::new(CastHook::default())),
        "stats" => Ok(Box::new(StatsHook::default())),
        other => Err(HookError::UnknownType(other.to_string())),
    }
}

/// Log every sample passing through. Mostly useful while bringing up a path.
#[derive(Default)]
pub struct PrintHook {
    prefix: Option<String>,
}

impl Hook for PrintHook {
    fn name(&self) -> &'static str {
        "print"
    }

    fn points(&self) -> &'static [HookPoint] {
        &[HookPoint::PathRead, HookPoint::PathWrite]
    }

    fn parse(&mut self, cfg: &toml::Value) -> Result<(), HookError> {
        if let Some(prefix) = cfg.get("prefix") {
            let prefix = prefix.as_str().ok_or_else(|| {
                HookError::InvalidConfig("'prefix' must be a string".into())
            })?;
            self.prefix = Some(prefix.to_string());
        }
        Ok(())
    }

    fn process(&mut self, point: HookPoint, smp: &mut SampleData) -> HookAction {
        let prefix = self.prefix.as_deref().unwrap_or("");
        tracing::info!(
            ?point,
            sequence = smp.sequence,
            values = ?smp.values(),
            "{prefix}sample"
        );
        HookAction::Ok
    }
}

/// Keep only every Nth sample.
pub struct DecimateHook {
    ratio: u64,
    count: u64,
}

impl Default for DecimateHook {
    fn default() -> Self {
        Self { ratio: 1, count: 0 }
    }
}

impl Hook for DecimateHook {
    fn name(&self) -> &'static str {
        "decimate"
    }

    fn points(&self) -> &'static [HookPoint] {
        &[HookPoint::PathRead]
    }

    fn parse(&mut self, cfg: &toml::Value) -> Result<(), HookError> {
        let ratio = cfg
            .get("ratio")
            .and_then(|v| v.as_integer())
            .ok_or_else(|| HookError::InvalidConfig("decimate needs an integer 'ratio'".into()))?;
        if ratio < 1 {
            return Err(HookError::InvalidConfig(format!(
                "decimate ratio must be >= 1, got {ratio}"
            )));
        }
        self.ratio = ratio as u64;
        Ok(())
    }

    fn process(&mut self, _point: HookPoint, _smp: &mut SampleData) -> HookAction {
        let keep = self.count % self.ratio == 0;
        self.count += 1;
        if keep {
            HookAction::Ok
        } else {
            HookAction::Skip
        }
    }
}

/// Change the declared type of one signal, converting its value slot.
#[derive(Default)]
pub struct CastHook {
    signal: usize,
    new_type: Option<SignalType>,
}

impl Hook for CastHook {
    fn name(&self) -> &'static str {
        "cast"
    }

    fn points(&self) -> &'static [HookPoint] {
        &[HookPoint::PathRead]
    }

    fn parse(&mut self, cfg: &toml::Value) -> Result<(), HookError> {
        let signal = cfg
            .get("signal")
            .and_then(|v| v.as_integer())
            .ok_or_else(|| HookError::InvalidConfig("cast needs an integer 'signal' index".into()))?;
        if signal < 0 {
            return Err(HookError::InvalidConfig("signal index must be >= 0".into()));
        }
        self.signal = signal as usize;

        let ty = cfg
            .get("new_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HookError::InvalidConfig("cast needs a 'new_type' string".into()))?;
        self.new_type = Some(match ty {
            "integer" => SignalType::Integer,
            "float" => SignalType::Float,
            "boolean" => SignalType::Boolean,
            "complex" => SignalType::Complex,
            other => {
                return Err(HookError::InvalidConfig(format!(
                    "unknown signal type '{other}'"
                )))
            }
        });
        Ok(())
    }

    fn check(&self) -> Result<(), HookError> {
        if self.new_type.is_none() {
            return Err(HookError::InvalidConfig(
                "cast hook was never given a 'new_type'".into(),
            ));
        }
        Ok(())
    }

    fn process(&mut self, _point: HookPoint, smp: &mut SampleData) -> HookAction {
        let Some(to) = self.new_type else {
            return HookAction::Ok;
        };
        match smp.values_mut().get_mut(self.signal) {
            Some(value) => {
                *value = value.cast(to);
                HookAction::Ok
            }
            // Value index beyond the populated length; nothing to convert.
            None => HookAction::Ok,
        }
    }
}

/// Count samples at both ends of the queue and report on periodic ticks.
#[derive(Default)]
pub struct StatsHook {
    read: u64,
    written: u64,
}

impl Hook for StatsHook {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn points(&self) -> &'static [HookPoint] {
        &[HookPoint::PathRead, HookPoint::PathWrite]
    }

    fn process(&mut self, point: HookPoint, _smp: &mut SampleData) -> HookAction {
        match point {
            HookPoint::PathWrite => self.written += 1,
            _ => self.read += 1,
        }
        HookAction::Ok
    }

    fn periodic(&mut self) -> HookAction {
        tracing::info!(read = self.read, written = self.written, "hook stats");
        HookAction::Ok
    }

    fn stop(&mut self) -> Result<(), HookError> {
        tracing::info!(read = self.read, written = self.written, "final hook stats");
        Ok(())
    }
}
