//! Field encodings found inside tables.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub const ENERGY_RECORD_LEN: usize = 10;
const ASCII_TIME_LEN: usize = 5;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldCodec {
    /// Whole degrees Fahrenheit in one unsigned byte.
    RawFahrenheit,
    Uint8,
    /// Big-endian.
    Uint16,
    Flag,
    EnergyRecord,
    /// `HH:MM`
    AsciiTime,
    /// NUL-padded text of the given width.
    Ascii(usize),
}

impl FieldCodec {
    pub const fn len(&self) -> usize {
        match self {
            FieldCodec::RawFahrenheit | FieldCodec::Uint8 | FieldCodec::Flag => 1,
            FieldCodec::Uint16 => 2,
            FieldCodec::EnergyRecord => ENERGY_RECORD_LEN,
            FieldCodec::AsciiTime => ASCII_TIME_LEN,
            FieldCodec::Ascii(width) => *width,
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<FieldValue, CodecError> {
        if bytes.len() != self.len() {
            return Err(CodecError::WrongLength {
                codec: *self,
                expected: self.len(),
                actual: bytes.len(),
            });
        }
        Ok(match self {
            FieldCodec::RawFahrenheit => FieldValue::Fahrenheit(bytes[0]),
            FieldCodec::Uint8 => FieldValue::Uint(bytes[0] as u16),
            FieldCodec::Uint16 => FieldValue::Uint(u16::from_be_bytes([bytes[0], bytes[1]])),
            FieldCodec::Flag => FieldValue::Flag(bytes[0] != 0),
            FieldCodec::EnergyRecord => FieldValue::Energy(EnergyRecord::decode(bytes)),
            FieldCodec::AsciiTime => {
                let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidText(format!("{:02x?}", bytes)))?;
                let time = NaiveTime::parse_from_str(text, "%H:%M")
                    .map_err(|_| CodecError::InvalidText(format!("not a time of day: {:?}", text)))?;
                FieldValue::Time(time)
            }
            FieldCodec::Ascii(_) => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                let text = std::str::from_utf8(&bytes[..end])
                    .ok()
                    .filter(|s| s.is_ascii())
                    .ok_or_else(|| CodecError::InvalidText(format!("{:02x?}", bytes)))?;
                FieldValue::Text(text.trim_end().to_string())
            }
        })
    }

    pub fn encode(&self, value: &FieldValue) -> Result<Vec<u8>, CodecError> {
        let mismatch = || CodecError::Mismatch {
            codec: *self,
            value: value.clone(),
        };
        match (self, value) {
            (FieldCodec::RawFahrenheit, FieldValue::Fahrenheit(f)) => Ok(vec![*f]),
            (FieldCodec::Uint8, FieldValue::Uint(n)) => u8::try_from(*n).map(|b| vec![b]).map_err(|_| mismatch()),
            (FieldCodec::Uint16, FieldValue::Uint(n)) => Ok(n.to_be_bytes().to_vec()),
            (FieldCodec::Flag, FieldValue::Flag(b)) => Ok(vec![*b as u8]),
            (FieldCodec::EnergyRecord, FieldValue::Energy(record)) => Ok(record.encode().to_vec()),
            (FieldCodec::AsciiTime, FieldValue::Time(t)) => {
                if t.second() != 0 || t.nanosecond() != 0 {
                    return Err(mismatch());
                }
                Ok(t.format("%H:%M").to_string().into_bytes())
            }
            (FieldCodec::Ascii(width), FieldValue::Text(s)) => {
                if !s.is_ascii() || s.len() > *width || s.contains('\0') {
                    return Err(CodecError::InvalidText(format!("{:?} does not fit {} ascii bytes", s, width)));
                }
                let mut out = s.as_bytes().to_vec();
                out.resize(*width, 0);
                Ok(out)
            }
            _ => Err(mismatch()),
        }
    }
}

impl Display for FieldCodec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldCodec::Ascii(width) => write!(f, "ascii[{}]", width),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Fahrenheit(u8),
    Uint(u16),
    Flag(bool),
    Energy(EnergyRecord),
    Time(NaiveTime),
    Text(String),
}

impl FieldValue {
    pub fn as_fahrenheit(&self) -> Option<u8> {
        match self {
            FieldValue::Fahrenheit(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u16> {
        match self {
            FieldValue::Uint(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_energy(&self) -> Option<&EnergyRecord> {
        match self {
            FieldValue::Energy(record) => Some(record),
            _ => None,
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Fahrenheit(v) => write!(f, "{}°F", v),
            FieldValue::Uint(v) => write!(f, "{}", v),
            FieldValue::Flag(v) => write!(f, "{}", v),
            FieldValue::Energy(r) => write!(
                f,
                "{} {} {} {} {} kWh",
                r.hp_heat_kwh, r.cooling_kwh, r.electric_kwh, r.fan_kwh, r.total_kwh
            ),
            FieldValue::Time(t) => write!(f, "{}", t.format("%H:%M")),
            FieldValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// One day of energy use, as stored in the daily rollup.
///
/// Byte order: heat pump heat, cooling, electric heat, fan, reheat, then five
/// bytes not yet understood (kept so a rewrite leaves them intact).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyRecord {
    pub hp_heat_kwh: u8,
    pub cooling_kwh: u8,
    pub electric_kwh: u8,
    pub fan_kwh: u8,
    pub reheat_kwh: u8,
    /// Sum of the five categories; derived, not on the wire.
    pub total_kwh: u16,
    #[serde(skip)]
    pub unknown: [u8; 5],
}

impl EnergyRecord {
    pub fn new(hp_heat_kwh: u8, cooling_kwh: u8, electric_kwh: u8, fan_kwh: u8, reheat_kwh: u8) -> Self {
        let total_kwh = [hp_heat_kwh, cooling_kwh, electric_kwh, fan_kwh, reheat_kwh]
            .iter()
            .map(|v| *v as u16)
            .sum();
        Self {
            hp_heat_kwh,
            cooling_kwh,
            electric_kwh,
            fan_kwh,
            reheat_kwh,
            total_kwh,
            unknown: [0; 5],
        }
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut record = Self::new(bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]);
        record.unknown.copy_from_slice(&bytes[5..ENERGY_RECORD_LEN]);
        record
    }

    fn encode(&self) -> [u8; ENERGY_RECORD_LEN] {
        let mut out = [0u8; ENERGY_RECORD_LEN];
        out[..5].copy_from_slice(&[
            self.hp_heat_kwh,
            self.cooling_kwh,
            self.electric_kwh,
            self.fan_kwh,
            self.reheat_kwh,
        ]);
        out[5..].copy_from_slice(&self.unknown);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    WrongLength { codec: FieldCodec, expected: usize, actual: usize },
    /// Value variant or range does not suit the codec.
    Mismatch { codec: FieldCodec, value: FieldValue },
    InvalidText(String),
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::WrongLength {
                codec,
                expected,
                actual,
            } => write!(f, "{} expects {} bytes, got {}", codec, expected, actual),
            CodecError::Mismatch { codec, value } => write!(f, "cannot encode {} as {}", value, codec),
            CodecError::InvalidText(s) => write!(f, "invalid text: {}", s),
        }
    }
}

impl std::error::Error for CodecError {}
