//! Signal descriptors and typed sample values.

use std::fmt;
use std::sync::Arc;

pub use num_complex::Complex32;
use serde::Deserialize;

/// Wire-independent value type of one slot in a sample vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Integer,
    Float,
    Boolean,
    Complex,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Integer => "integer",
            SignalType::Float => "float",
            SignalType::Boolean => "boolean",
            SignalType::Complex => "complex",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value slot of a sample. The discriminant must agree with the declared
/// [`SignalType`] of the same index in the signal list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Complex(Complex32),
}

impl SignalValue {
    pub fn kind(&self) -> SignalType {
        match self {
            SignalValue::Integer(_) => SignalType::Integer,
            SignalValue::Float(_) => SignalType::Float,
            SignalValue::Boolean(_) => SignalType::Boolean,
            SignalValue::Complex(_) => SignalType::Complex,
        }
    }

    /// Lossy conversion to another value type. Complex converts via magnitude.
    pub fn cast(&self, to: SignalType) -> SignalValue {
        let as_float = match *self {
            SignalValue::Integer(i) => i as f64,
            SignalValue::Float(f) => f,
            SignalValue::Boolean(b) => b as i64 as f64,
            SignalValue::Complex(c) => c.norm() as f64,
        };

        match to {
            SignalType::Integer => SignalValue::Integer(as_float as i64),
            SignalType::Float => SignalValue::Float(as_float),
            SignalType::Boolean => SignalValue::Boolean(as_float != 0.0),
            SignalType::Complex => SignalValue::Complex(Complex32::new(as_float as f32, 0.0)),
        }
    }
}

/// Description of one element of a sample vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub name: String,
    pub unit: Option<String>,
    pub ty: SignalType,
}

impl Signal {
    pub fn new(name: impl Into<String>, ty: SignalType) -> Self {
        Self {
            name: name.into(),
            unit: None,
            ty,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// Generate a default signal list: `count` signals of one type, named
/// `signal0`, `signal1`, ...
pub fn generate(count: usize, ty: SignalType) -> Arc<[Signal]> {
    (0..count)
        .map(|i| Signal::new(format!("signal{i}"), ty))
        .collect::<Vec<_>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_list_names_and_type() {
        let signals = generate(3, SignalType::Float);
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[0].name, "signal0");
        assert_eq!(signals[2].name, "signal2");
        assert!(signals.iter().all(|s| s.ty == SignalType::Float));
    }

    #[test]
    fn cast_between_types() {
        assert_eq!(
            SignalValue::Float(2.7).cast(SignalType::Integer),
            SignalValue::Integer(2)
        );
        assert_eq!(
            SignalValue::Integer(1).cast(SignalType::Boolean),
            SignalValue::Boolean(true)
        );
        assert_eq!(
            SignalValue::Boolean(true).cast(SignalType::Float),
            SignalValue::Float(1.0)
        );
        let c = SignalValue::Complex(Complex32::new(3.0, 4.0));
        assert_eq!(c.cast(SignalType::Float), SignalValue::Float(5.0));
    }

    #[test]
    fn value_kind_matches_variant() {
        assert_eq!(SignalValue::Integer(0).kind(), SignalType::Integer);
        assert_eq!(
            SignalValue::Complex(Complex32::new(0.0, 0.0)).kind(),
            SignalType::Complex
        );
    }
}
