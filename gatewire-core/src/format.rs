//! Raw binary sample representation used by datagram node types.
//!
//! Layout, all big-endian: sequence (u64), origin timestamp seconds (u64)
//! and nanoseconds (u32), value count (u16), then one 9-byte cell per value:
//! a type tag followed by the 8-byte payload.

use num_complex::Complex32;

use crate::sample::{SampleData, Timestamp};
use crate::signal::SignalValue;

const HEADER_LEN: usize = 8 + 8 + 4 + 2;
const CELL_LEN: usize = 1 + 8;

const TAG_INTEGER: u8 = 0;
const TAG_FLOAT: u8 = 1;
const TAG_BOOLEAN: u8 = 2;
const TAG_COMPLEX: u8 = 3;

/// Encode one sample into a fresh datagram payload.
pub fn encode(data: &SampleData) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + data.len() * CELL_LEN);
    out.extend_from_slice(&data.sequence.to_be_bytes());
    out.extend_from_slice(&data.ts_origin.sec.to_be_bytes());
    out.extend_from_slice(&data.ts_origin.nsec.to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    for value in data.values() {
        match value {
            SignalValue::Integer(i) => {
                out.push(TAG_INTEGER);
                out.extend_from_slice(&i.to_be_bytes());
            }
            SignalValue::Float(f) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&f.to_be_bytes());
            }
            SignalValue::Boolean(b) => {
                out.push(TAG_BOOLEAN);
                out.extend_from_slice(&(*b as u64).to_be_bytes());
            }
            SignalValue::Complex(c) => {
                out.push(TAG_COMPLEX);
                out.extend_from_slice(&c.re.to_be_bytes());
                out.extend_from_slice(&c.im.to_be_bytes());
            }
        }
    }
    out
}

/// Decode one datagram into the given sample. Values beyond the sample's
/// capacity are dropped silently; the caller sized the pool.
pub fn decode(bytes: &[u8], data: &mut SampleData) -> Result<(), FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::MissingBytes);
    }
    let sequence = u64::from_be_bytes(bytes[0..8].try_into().expect("checked length"));
    let sec = u64::from_be_bytes(bytes[8..16].try_into().expect("checked length"));
    let nsec = u32::from_be_bytes(bytes[16..20].try_into().expect("checked length"));
    let count = u16::from_be_bytes(bytes[20..22].try_into().expect("checked length")) as usize;

    if bytes.len() < HEADER_LEN + count * CELL_LEN {
        return Err(FormatError::MissingBytes);
    }

    data.reset();
    data.sequence = sequence;
    data.ts_origin = Timestamp::new(sec, nsec);

    for i in 0..count {
        let cell = &bytes[HEADER_LEN + i * CELL_LEN..HEADER_LEN + (i + 1) * CELL_LEN];
        let payload: [u8; 8] = cell[1..9].try_into().expect("cell is nine bytes");
        let value = match cell[0] {
            TAG_INTEGER => SignalValue::Integer(i64::from_be_bytes(payload)),
            TAG_FLOAT => SignalValue::Float(f64::from_be_bytes(payload)),
            TAG_BOOLEAN => SignalValue::Boolean(u64::from_be_bytes(payload) != 0),
            TAG_COMPLEX => {
                let re = f32::from_be_bytes(payload[0..4].try_into().expect("four bytes"));
                let im = f32::from_be_bytes(payload[4..8].try_into().expect("four bytes"));
                SignalValue::Complex(Complex32::new(re, im))
            }
            tag => return Err(FormatError::InvalidValue(tag)),
        };
        if !data.push_value(value) {
            break;
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("datagram too short")]
    MissingBytes,
    #[error("unknown value tag {0}")]
    InvalidValue(u8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{self, SignalType};

    fn empty_sample(capacity: usize) -> SampleData {
        SampleData::with_capacity(capacity, signal::generate(capacity, SignalType::Float))
    }

    #[test]
    fn roundtrip_mixed_values() {
        let mut sample = empty_sample(4);
        sample.sequence = 1234;
        sample.ts_origin = Timestamp::new(1_700_000_000, 987_654_321);
        sample.set_values(&[
            SignalValue::Integer(-5),
            SignalValue::Float(3.25),
            SignalValue::Boolean(true),
            SignalValue::Complex(Complex32::new(1.0, -2.0)),
        ]);

        let bytes = encode(&sample);
        let mut decoded = empty_sample(4);
        decode(&bytes, &mut decoded).unwrap();

        assert_eq!(decoded.sequence, 1234);
        assert_eq!(decoded.ts_origin, Timestamp::new(1_700_000_000, 987_654_321));
        assert_eq!(decoded.values(), sample.values());
    }

    #[test]
    fn short_datagram_is_rejected() {
        let mut sample = empty_sample(1);
        assert_eq!(
            decode(&[0u8; 5], &mut sample),
            Err(FormatError::MissingBytes)
        );

        let mut full = empty_sample(1);
        full.set_values(&[SignalValue::Float(1.0)]);
        let bytes = encode(&full);
        assert_eq!(
            decode(&bytes[..bytes.len() - 1], &mut sample),
            Err(FormatError::MissingBytes)
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut full = empty_sample(1);
        full.set_values(&[SignalValue::Float(1.0)]);
        let mut bytes = encode(&full);
        bytes[HEADER_LEN] = 9;
        let mut sample = empty_sample(1);
        assert_eq!(
            decode(&bytes, &mut sample),
            Err(FormatError::InvalidValue(9))
        );
    }

    #[test]
    fn excess_values_truncate_at_capacity() {
        let mut wide = empty_sample(3);
        wide.set_values(&[
            SignalValue::Float(1.0),
            SignalValue::Float(2.0),
            SignalValue::Float(3.0),
        ]);
        let bytes = encode(&wide);
        let mut narrow = empty_sample(2);
        decode(&bytes, &mut narrow).unwrap();
        assert_eq!(narrow.len(), 2);
    }
}
