//! Framing and big-endian codec for C37.118 frames.
//!
//! Envelope: sync word (0xAA lead byte, frame type and version nibbles),
//! total frame size, station ID, seconds-of-century, fractional second,
//! message payload, and a trailing CRC-CCITT-false over everything except
//! the CRC field itself.

use super::types::{
    Analog, ChannelInfo, Command, Config, Data, DigitalInfo, Frame, Freq, Header, Message, Phasor,
    PmuConfig, PmuData,
};

/// Sync word down to envelope CRC, excluding the payload.
const HEADER_LEN: usize = 14;
const CRC_LEN: usize = 2;
const NAME_LEN: usize = 16;
const DIGITAL_NAMES: usize = 16;

const TYPE_DATA: u16 = 0x0;
const TYPE_HEADER: u16 = 0x1;
const TYPE_CONFIG1: u16 = 0x2;
const TYPE_CONFIG2: u16 = 0x3;
const TYPE_COMMAND: u16 = 0x4;
const TYPE_CONFIG3: u16 = 0x5;

/// CRC-CCITT-false over the given bytes.
pub fn calculate_crc(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in bytes {
        let temp = (crc >> 8) ^ byte as u16;
        crc <<= 8;
        let mut quick = temp ^ (temp >> 4);
        crc ^= quick;
        quick <<= 5;
        crc ^= quick;
        quick <<= 7;
        crc ^= quick;
    }
    crc
}

/// Total size of the frame starting at `bytes`, taken from the envelope.
/// Needs at least the first four bytes; useful for reading frames off a
/// stream before handing them to [`deserialize`].
pub fn frame_size(bytes: &[u8]) -> Result<usize, FrameError> {
    if bytes.len() < 4 {
        return Err(FrameError::MissingBytes);
    }
    if bytes[0] != 0xAA {
        return Err(FrameError::InvalidValue);
    }
    Ok(u16::from_be_bytes([bytes[2], bytes[3]]) as usize)
}

/// Parse one frame. Data frames need the `config` that was previously
/// negotiated for the stream; without it they are refused.
pub fn deserialize(bytes: &[u8], config: Option<&Config>) -> Result<Frame, FrameError> {
    let mut r = Reader::new(bytes);
    let sync = r.u16()?;
    let framesize = r.u16()? as usize;

    if sync >> 8 != 0xAA {
        return Err(FrameError::InvalidValue);
    }
    if framesize < HEADER_LEN + CRC_LEN {
        return Err(FrameError::InvalidSlice);
    }
    if bytes.len() < framesize {
        return Err(FrameError::MissingBytes);
    }

    let idcode = r.u16()?;
    let soc = r.u32()?;
    let fracsec = r.u32()?;

    let stored_crc = u16::from_be_bytes([bytes[framesize - 2], bytes[framesize - 1]]);
    if stored_crc != calculate_crc(&bytes[..framesize - CRC_LEN]) {
        return Err(FrameError::InvalidChecksum);
    }

    let payload = &bytes[HEADER_LEN..framesize - CRC_LEN];
    let message = match (sync >> 4) & 0xF {
        TYPE_DATA => {
            let config = config.ok_or(FrameError::MissingConfig)?;
            Message::Data(decode_data(payload, config)?)
        }
        TYPE_HEADER => Message::Header(Header {
            data: String::from_utf8_lossy(payload).into_owned(),
        }),
        TYPE_CONFIG1 => Message::Config1(decode_config(payload)?),
        TYPE_CONFIG2 => Message::Config2(decode_config(payload)?),
        TYPE_COMMAND => Message::Command(decode_command(payload)?),
        // Config-3 exists on the wire but its layout is not implemented.
        TYPE_CONFIG3 => return Err(FrameError::InvalidValue),
        _ => return Err(FrameError::InvalidValue),
    };

    Ok(Frame {
        version: (sync & 0xF) as u8,
        idcode,
        soc,
        fracsec,
        message,
    })
}

/// Serialize one frame. The frame size and CRC fields depend on the payload
/// length, so they are written as placeholders and patched afterwards.
pub fn serialize(frame: &Frame, config: Option<&Config>) -> Result<Vec<u8>, FrameError> {
    if frame.version > 0xF {
        return Err(FrameError::InvalidValue);
    }
    let type_nibble = match &frame.message {
        Message::Data(_) => TYPE_DATA,
        Message::Header(_) => TYPE_HEADER,
        Message::Config1(_) => TYPE_CONFIG1,
        Message::Config2(_) => TYPE_CONFIG2,
        Message::Command(_) => TYPE_COMMAND,
    };

    let mut w = Writer::new();
    w.u16(0xAA00 | (type_nibble << 4) | frame.version as u16);
    let size_at = w.placeholder_u16();
    w.u16(frame.idcode);
    w.u32(frame.soc);
    w.u32(frame.fracsec);

    match &frame.message {
        Message::Data(data) => {
            let config = config.ok_or(FrameError::MissingConfig)?;
            encode_data(&mut w, data, config)?;
        }
        Message::Header(header) => w.bytes(header.data.as_bytes()),
        Message::Config1(config) | Message::Config2(config) => encode_config(&mut w, config),
        Message::Command(command) => {
            w.u16(command.cmd);
            w.bytes(&command.ext);
        }
    }

    let total = (w.len() + CRC_LEN) as u16;
    w.patch_u16(size_at, total);
    let crc = calculate_crc(w.as_slice());
    w.u16(crc);
    Ok(w.into_inner())
}

fn decode_config(payload: &[u8]) -> Result<Config, FrameError> {
    let mut r = Reader::new(payload);
    let time_base = r.u32()?;
    let num_pmu = r.u16()?;

    let mut pmus = Vec::with_capacity(num_pmu as usize);
    for _ in 0..num_pmu {
        pmus.push(decode_pmu_config(&mut r)?);
    }
    let data_rate = r.u16()?;

    Ok(Config {
        time_base,
        pmus,
        data_rate,
    })
}

fn decode_pmu_config(r: &mut Reader<'_>) -> Result<PmuConfig, FrameError> {
    let station = r.name()?;
    let idcode = r.u16()?;
    let format = r.u16()?;
    let phnmr = r.u16()? as usize;
    let annmr = r.u16()? as usize;
    let dgnmr = r.u16()? as usize;

    let mut phasor_names = Vec::with_capacity(phnmr);
    for _ in 0..phnmr {
        phasor_names.push(r.name()?);
    }
    let mut analog_names = Vec::with_capacity(annmr);
    for _ in 0..annmr {
        analog_names.push(r.name()?);
    }
    let mut digital_names = Vec::with_capacity(dgnmr);
    for _ in 0..dgnmr {
        let mut names = Vec::with_capacity(DIGITAL_NAMES);
        for _ in 0..DIGITAL_NAMES {
            names.push(r.name()?);
        }
        digital_names.push(names);
    }

    let mut phasor_units = Vec::with_capacity(phnmr);
    for _ in 0..phnmr {
        phasor_units.push(r.u32()?);
    }
    let mut analog_units = Vec::with_capacity(annmr);
    for _ in 0..annmr {
        analog_units.push(r.u32()?);
    }
    let mut digital_units = Vec::with_capacity(dgnmr);
    for _ in 0..dgnmr {
        digital_units.push(r.u32()?);
    }

    let fnom = r.u16()?;
    let cfgcnt = r.u16()?;

    Ok(PmuConfig {
        station,
        idcode,
        format,
        phasor_info: phasor_names
            .into_iter()
            .zip(phasor_units)
            .map(|(name, unit)| ChannelInfo { name, unit })
            .collect(),
        analog_info: analog_names
            .into_iter()
            .zip(analog_units)
            .map(|(name, unit)| ChannelInfo { name, unit })
            .collect(),
        digital_info: digital_names
            .into_iter()
            .zip(digital_units)
            .map(|(names, unit)| DigitalInfo { names, unit })
            .collect(),
        fnom,
        cfgcnt,
    })
}

fn encode_config(w: &mut Writer, config: &Config) {
    w.u32(config.time_base);
    w.u16(config.pmus.len() as u16);
    for pmu in &config.pmus {
        w.name(&pmu.station);
        w.u16(pmu.idcode);
        w.u16(pmu.format);
        w.u16(pmu.phasor_info.len() as u16);
        w.u16(pmu.analog_info.len() as u16);
        w.u16(pmu.digital_info.len() as u16);
        for info in &pmu.phasor_info {
            w.name(&info.name);
        }
        for info in &pmu.analog_info {
            w.name(&info.name);
        }
        for info in &pmu.digital_info {
            for i in 0..DIGITAL_NAMES {
                w.name(info.names.get(i).map(String::as_str).unwrap_or(""));
            }
        }
        for info in &pmu.phasor_info {
            w.u32(info.unit);
        }
        for info in &pmu.analog_info {
            w.u32(info.unit);
        }
        for info in &pmu.digital_info {
            w.u32(info.unit);
        }
        w.u16(pmu.fnom);
        w.u16(pmu.cfgcnt);
    }
    w.u16(config.data_rate);
}

fn decode_data(payload: &[u8], config: &Config) -> Result<Data, FrameError> {
    let mut r = Reader::new(payload);
    let mut pmus = Vec::with_capacity(config.pmus.len());
    for pmu_config in &config.pmus {
        pmus.push(decode_pmu_data(&mut r, pmu_config)?);
    }
    Ok(Data { pmus })
}

fn decode_pmu_data(r: &mut Reader<'_>, config: &PmuConfig) -> Result<PmuData, FrameError> {
    let stat = r.u16()?;

    let mut phasors = Vec::with_capacity(config.phasor_info.len());
    for _ in 0..config.phasor_info.len() {
        phasors.push(match config.phasor_format() {
            0 => Phasor::RectangularInt {
                real: r.i16()?,
                imag: r.i16()?,
            },
            1 => Phasor::PolarInt {
                magnitude: r.u16()?,
                phase: r.i16()?,
            },
            2 => Phasor::RectangularFloat {
                real: r.f32()?,
                imag: r.f32()?,
            },
            _ => Phasor::PolarFloat {
                magnitude: r.f32()?,
                phase: r.f32()?,
            },
        });
    }

    let freq = decode_freq(r, config)?;
    let dfreq = decode_freq(r, config)?;

    let mut analogs = Vec::with_capacity(config.analog_info.len());
    for _ in 0..config.analog_info.len() {
        analogs.push(if config.float_analogs() {
            Analog::Float(r.f32()?)
        } else {
            Analog::Int(r.i16()?)
        });
    }

    let mut digital = Vec::with_capacity(config.digital_info.len());
    for _ in 0..config.digital_info.len() {
        digital.push(r.u16()?);
    }

    Ok(PmuData {
        stat,
        phasors,
        freq,
        dfreq,
        analogs,
        digital,
    })
}

fn decode_freq(r: &mut Reader<'_>, config: &PmuConfig) -> Result<Freq, FrameError> {
    Ok(if config.float_freq() {
        Freq::Float(r.f32()?)
    } else {
        Freq::Int(r.i16()?)
    })
}

fn encode_data(w: &mut Writer, data: &Data, config: &Config) -> Result<(), FrameError> {
    if data.pmus.len() != config.pmus.len() {
        return Err(FrameError::InvalidValue);
    }
    for (pmu, pmu_config) in data.pmus.iter().zip(&config.pmus) {
        encode_pmu_data(w, pmu, pmu_config)?;
    }
    Ok(())
}

fn encode_pmu_data(w: &mut Writer, pmu: &PmuData, config: &PmuConfig) -> Result<(), FrameError> {
    if pmu.phasors.len() != config.phasor_info.len()
        || pmu.analogs.len() != config.analog_info.len()
        || pmu.digital.len() != config.digital_info.len()
    {
        return Err(FrameError::InvalidValue);
    }

    w.u16(pmu.stat);
    for phasor in &pmu.phasors {
        if phasor.format_index() != config.phasor_format() {
            return Err(FrameError::InvalidValue);
        }
        match *phasor {
            Phasor::RectangularInt { real, imag } => {
                w.i16(real);
                w.i16(imag);
            }
            Phasor::PolarInt { magnitude, phase } => {
                w.u16(magnitude);
                w.i16(phase);
            }
            Phasor::RectangularFloat { real, imag } => {
                w.f32(real);
                w.f32(imag);
            }
            Phasor::PolarFloat { magnitude, phase } => {
                w.f32(magnitude);
                w.f32(phase);
            }
        }
    }

    encode_freq(w, pmu.freq, config)?;
    encode_freq(w, pmu.dfreq, config)?;

    for analog in &pmu.analogs {
        match (analog, config.float_analogs()) {
            (Analog::Int(i), false) => w.i16(*i),
            (Analog::Float(f), true) => w.f32(*f),
            _ => return Err(FrameError::InvalidValue),
        }
    }
    for &word in &pmu.digital {
        w.u16(word);
    }
    Ok(())
}

fn encode_freq(w: &mut Writer, freq: Freq, config: &PmuConfig) -> Result<(), FrameError> {
    match (freq, config.float_freq()) {
        (Freq::Int(i), false) => w.i16(i),
        (Freq::Float(f), true) => w.f32(f),
        _ => return Err(FrameError::InvalidValue),
    }
    Ok(())
}

fn decode_command(payload: &[u8]) -> Result<Command, FrameError> {
    let mut r = Reader::new(payload);
    let cmd = r.u16()?;
    Ok(Command {
        cmd,
        ext: r.rest().to_vec(),
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.buf.len() - self.pos < len {
            return Err(FrameError::MissingBytes);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, FrameError> {
        Ok(self.u16()? as i16)
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Result<f32, FrameError> {
        Ok(f32::from_bits(self.u32()?))
    }

    /// Sixteen-byte channel name, trailing padding stripped.
    fn name(&mut self) -> Result<String, FrameError> {
        let raw = self.take(NAME_LEN)?;
        let text = String::from_utf8_lossy(raw);
        Ok(text.trim_end_matches([' ', '\0']).to_string())
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.u32(v.to_bits());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Space-padded sixteen-byte channel name, truncated when longer.
    fn name(&mut self, name: &str) {
        let mut field = [b' '; NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LEN);
        field[..n].copy_from_slice(&bytes[..n]);
        self.buf.extend_from_slice(&field);
    }

    /// Reserve a two-byte field for later patching; returns its offset.
    fn placeholder_u16(&mut self) -> usize {
        let at = self.buf.len();
        self.u16(0);
        at
    }

    fn patch_u16(&mut self, at: usize, v: u16) {
        self.buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame needs more bytes")]
    MissingBytes,
    #[error("data frame without a bound config")]
    MissingConfig,
    #[error("invalid field value")]
    InvalidValue,
    #[error("frame checksum mismatch")]
    InvalidChecksum,
    #[error("frame size field out of range")]
    InvalidSlice,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_pmu_config() -> Config {
        let pmu = |station: &str, idcode| PmuConfig {
            station: station.to_string(),
            idcode,
            // Polar float phasors, integer frequency, integer analogs.
            format: 0x0003,
            phasor_info: vec![
                ChannelInfo {
                    name: "VA".into(),
                    unit: 0,
                },
                ChannelInfo {
                    name: "VB".into(),
                    unit: 0,
                },
            ],
            analog_info: vec![ChannelInfo {
                name: "ANALOG1".into(),
                unit: 1,
            }],
            digital_info: vec![DigitalInfo {
                names: (0..16).map(|i| format!("BIT{i}")).collect(),
                unit: 0xFFFF,
            }],
            fnom: 0,
            cfgcnt: 1,
        };
        Config {
            time_base: 1_000_000,
            pmus: vec![pmu("STATION A", 1), pmu("STATION B", 2)],
            data_rate: 30,
        }
    }

    fn data_frame(config: &Config) -> Frame {
        let pmu_data = |seed: f32| PmuData {
            stat: 0,
            phasors: vec![
                Phasor::PolarFloat {
                    magnitude: 230.0 + seed,
                    phase: 0.1,
                },
                Phasor::PolarFloat {
                    magnitude: 231.0 + seed,
                    phase: -0.1,
                },
            ],
            freq: Freq::Int(2500),
            dfreq: Freq::Int(-3),
            analogs: vec![Analog::Int(42)],
            digital: vec![0x00FF],
        };
        Frame {
            version: 1,
            idcode: 7,
            soc: 1_600_000_000,
            fracsec: 5000,
            message: Message::Data(Data {
                pmus: config.pmus.iter().enumerate().map(|(i, _)| pmu_data(i as f32)).collect(),
            }),
        }
    }

    #[test]
    fn crc_ccitt_false_reference_value() {
        assert_eq!(calculate_crc(b"123456789"), 0x29B1);
    }

    #[test]
    fn config2_roundtrip_with_two_pmus() {
        let frame = Frame {
            version: 1,
            idcode: 7,
            soc: 1_600_000_000,
            fracsec: 0,
            message: Message::Config2(two_pmu_config()),
        };
        let bytes = serialize(&frame, None).unwrap();

        // The envelope ends in the CRC over everything before it.
        let crc = u16::from_be_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
        assert_eq!(crc, calculate_crc(&bytes[..bytes.len() - 2]));
        assert_eq!(frame_size(&bytes).unwrap(), bytes.len());

        let parsed = deserialize(&bytes, None).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn data_roundtrip_with_bound_config() {
        let config = two_pmu_config();
        let frame = data_frame(&config);
        let bytes = serialize(&frame, Some(&config)).unwrap();
        let parsed = deserialize(&bytes, Some(&config)).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn data_without_config_is_refused() {
        let config = two_pmu_config();
        let frame = data_frame(&config);
        let bytes = serialize(&frame, Some(&config)).unwrap();

        assert_eq!(deserialize(&bytes, None), Err(FrameError::MissingConfig));
        assert_eq!(
            serialize(&frame, None).unwrap_err(),
            FrameError::MissingConfig
        );
    }

    #[test]
    fn corrupted_crc_is_detected() {
        let config = two_pmu_config();
        let mut bytes = serialize(&data_frame(&config), Some(&config)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(
            deserialize(&bytes, Some(&config)),
            Err(FrameError::InvalidChecksum)
        );
    }

    #[test]
    fn truncated_frame_needs_more_bytes() {
        let config = two_pmu_config();
        let bytes = serialize(&data_frame(&config), Some(&config)).unwrap();
        assert_eq!(
            deserialize(&bytes[..bytes.len() / 2], Some(&config)),
            Err(FrameError::MissingBytes)
        );
    }

    #[test]
    fn bad_sync_and_size_fields() {
        let config = two_pmu_config();
        let mut bytes = serialize(&data_frame(&config), Some(&config)).unwrap();
        bytes[0] = 0xAB;
        assert_eq!(
            deserialize(&bytes, Some(&config)),
            Err(FrameError::InvalidValue)
        );

        let mut tiny = serialize(
            &Frame {
                version: 1,
                idcode: 1,
                soc: 0,
                fracsec: 0,
                message: Message::Command(Command::new(Command::DATA_START)),
            },
            None,
        )
        .unwrap();
        tiny[2..4].copy_from_slice(&4u16.to_be_bytes());
        assert_eq!(deserialize(&tiny, None), Err(FrameError::InvalidSlice));
    }

    #[test]
    fn command_frame_uses_its_own_type_nibble() {
        let frame = Frame {
            version: 2,
            idcode: 9,
            soc: 100,
            fracsec: 200,
            message: Message::Command(Command {
                cmd: Command::GET_CONFIG2,
                ext: vec![1, 2, 3],
            }),
        };
        let bytes = serialize(&frame, None).unwrap();
        assert_eq!(bytes[0], 0xAA);
        assert_eq!(bytes[1] & 0xF0, 0x40);
        assert_eq!(bytes[1] & 0x0F, 0x02);
        assert_eq!(deserialize(&bytes, None).unwrap(), frame);
    }

    #[test]
    fn config3_frames_are_not_supported() {
        let frame = Frame {
            version: 1,
            idcode: 1,
            soc: 0,
            fracsec: 0,
            message: Message::Command(Command::new(Command::DATA_STOP)),
        };
        let mut bytes = serialize(&frame, None).unwrap();
        // Rewrite the type nibble to config-3 and fix the checksum up.
        bytes[1] = (bytes[1] & 0x0F) | 0x50;
        let len = bytes.len();
        let crc = calculate_crc(&bytes[..len - 2]);
        bytes[len - 2..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(deserialize(&bytes, None), Err(FrameError::InvalidValue));
    }

    #[test]
    fn mismatched_data_shape_is_invalid() {
        let config = two_pmu_config();
        let mut frame = data_frame(&config);
        if let Message::Data(data) = &mut frame.message {
            data.pmus.pop();
        }
        assert_eq!(
            serialize(&frame, Some(&config)).unwrap_err(),
            FrameError::InvalidValue
        );

        let mut frame = data_frame(&config);
        if let Message::Data(data) = &mut frame.message {
            // Rectangular phasor against a polar format word.
            data.pmus[0].phasors[0] = Phasor::RectangularInt { real: 1, imag: 2 };
        }
        assert_eq!(
            serialize(&frame, Some(&config)).unwrap_err(),
            FrameError::InvalidValue
        );
    }

    #[test]
    fn header_frame_roundtrip() {
        let frame = Frame {
            version: 1,
            idcode: 3,
            soc: 10,
            fracsec: 20,
            message: Message::Header(Header {
                data: "station metadata".into(),
            }),
        };
        let bytes = serialize(&frame, None).unwrap();
        assert_eq!(deserialize(&bytes, None).unwrap(), frame);
    }
}
