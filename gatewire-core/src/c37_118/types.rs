//! Message structures of the C37.118 protocol.

use num_complex::Complex32;

/// Complex channel value. The wire representation is selected by bits 0..1
/// of the owning PMU's format word.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phasor {
    RectangularInt { real: i16, imag: i16 },
    PolarInt { magnitude: u16, phase: i16 },
    RectangularFloat { real: f32, imag: f32 },
    PolarFloat { magnitude: f32, phase: f32 },
}

impl Phasor {
    /// Index of this representation in the format word's low two bits.
    pub fn format_index(&self) -> u16 {
        match self {
            Phasor::RectangularInt { .. } => 0,
            Phasor::PolarInt { .. } => 1,
            Phasor::RectangularFloat { .. } => 2,
            Phasor::PolarFloat { .. } => 3,
        }
    }

    pub fn to_complex(&self) -> Complex32 {
        match *self {
            Phasor::RectangularInt { real, imag } => Complex32::new(real as f32, imag as f32),
            // Integer polar phase is in milliradians.
            Phasor::PolarInt { magnitude, phase } => {
                Complex32::from_polar(magnitude as f32, phase as f32 / 1000.0)
            }
            Phasor::RectangularFloat { real, imag } => Complex32::new(real, imag),
            Phasor::PolarFloat { magnitude, phase } => Complex32::from_polar(magnitude, phase),
        }
    }
}

/// Analog channel value; bit 2 of the format word selects the encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Analog {
    Int(i16),
    Float(f32),
}

impl Analog {
    pub fn to_float(&self) -> f32 {
        match *self {
            Analog::Int(i) => i as f32,
            Analog::Float(f) => f,
        }
    }
}

/// Frequency or rate-of-change value; bit 3 of the format word selects the
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Freq {
    Int(i16),
    Float(f32),
}

impl Freq {
    pub fn to_float(&self) -> f32 {
        match *self {
            Freq::Int(i) => i as f32,
            Freq::Float(f) => f,
        }
    }
}

/// Measurements of one PMU inside a data frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PmuData {
    pub stat: u16,
    pub phasors: Vec<Phasor>,
    pub freq: Freq,
    pub dfreq: Freq,
    pub analogs: Vec<Analog>,
    pub digital: Vec<u16>,
}

impl Default for Freq {
    fn default() -> Self {
        Freq::Int(0)
    }
}

/// Payload of a data frame. Its shape is only defined relative to a
/// previously negotiated [`Config`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Data {
    pub pmus: Vec<PmuData>,
}

/// Free-form header text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Header {
    pub data: String,
}

/// Description of one phasor or analog channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    /// Sixteen bytes on the wire, space padded.
    pub name: String,
    pub unit: u32,
}

/// Description of one digital status word: sixteen bit labels plus the
/// normal-state/valid masks.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalInfo {
    pub names: Vec<String>,
    pub unit: u32,
}

/// Per-PMU section of a configuration frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PmuConfig {
    pub station: String,
    pub idcode: u16,
    /// Bit 0: polar phasors, bit 1: float phasors, bit 2: float analogs,
    /// bit 3: float frequency.
    pub format: u16,
    pub phasor_info: Vec<ChannelInfo>,
    pub analog_info: Vec<ChannelInfo>,
    pub digital_info: Vec<DigitalInfo>,
    pub fnom: u16,
    pub cfgcnt: u16,
}

impl PmuConfig {
    pub fn phasor_format(&self) -> u16 {
        self.format & 0x3
    }

    pub fn float_analogs(&self) -> bool {
        self.format & 0x4 != 0
    }

    pub fn float_freq(&self) -> bool {
        self.format & 0x8 != 0
    }
}

/// Configuration frame payload, shared by the config-1 and config-2 frame
/// types.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub time_base: u32,
    pub pmus: Vec<PmuConfig>,
    pub data_rate: u16,
}

/// Command frame payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Command {
    pub cmd: u16,
    pub ext: Vec<u8>,
}

impl Command {
    pub const DATA_START: u16 = 0x1;
    pub const DATA_STOP: u16 = 0x2;
    pub const GET_HEADER: u16 = 0x3;
    pub const GET_CONFIG1: u16 = 0x4;
    pub const GET_CONFIG2: u16 = 0x5;
    pub const GET_CONFIG3: u16 = 0x6;

    pub fn new(cmd: u16) -> Self {
        Self {
            cmd,
            ext: Vec::new(),
        }
    }
}

/// The five supported frame payloads. Config-3 exists on the wire but its
/// layout is not implemented; decoding one fails with an invalid-value error.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Data(Data),
    Header(Header),
    Config1(Config),
    Config2(Config),
    Command(Command),
}

/// A framed envelope around one [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Protocol version, low nibble of the sync word.
    pub version: u8,
    /// Station / stream identifier.
    pub idcode: u16,
    /// Seconds of century.
    pub soc: u32,
    /// Fraction of second, scaled by the config's time base.
    pub fracsec: u32,
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phasor_conversions() {
        let rect = Phasor::RectangularInt { real: 3, imag: 4 };
        assert_eq!(rect.to_complex(), Complex32::new(3.0, 4.0));
        assert_eq!(rect.format_index(), 0);

        let polar = Phasor::PolarInt {
            magnitude: 100,
            phase: 0,
        };
        let c = polar.to_complex();
        assert!((c.re - 100.0).abs() < 1e-3);
        assert!(c.im.abs() < 1e-3);
        assert_eq!(polar.format_index(), 1);

        assert_eq!(
            Phasor::PolarFloat {
                magnitude: 1.0,
                phase: std::f32::consts::FRAC_PI_2,
            }
            .format_index(),
            3
        );
    }

    #[test]
    fn scalar_conversions() {
        assert_eq!(Analog::Int(-7).to_float(), -7.0);
        assert_eq!(Analog::Float(1.5).to_float(), 1.5);
        assert_eq!(Freq::Int(2500).to_float(), 2500.0);
    }

    #[test]
    fn format_word_bits() {
        let pmu = PmuConfig {
            station: "PMU".into(),
            idcode: 1,
            format: 0x0003,
            phasor_info: Vec::new(),
            analog_info: Vec::new(),
            digital_info: Vec::new(),
            fnom: 0,
            cfgcnt: 0,
        };
        assert_eq!(pmu.phasor_format(), 3);
        assert!(!pmu.float_analogs());
        assert!(!pmu.float_freq());
    }
}
