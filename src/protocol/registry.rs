//! Static table layouts, as reverse-engineered from bus captures.
//!
//! Scope: data only. Supporting another table means adding an entry to
//! [`Registry::builtin`]; nothing in the transaction engine knows about
//! individual tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::protocol::codec::FieldCodec;

// =====================
// Devices
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Thermostat,
    /// The SAM peer. The controller sends as this device to be allowed to write.
    ImpersonatedController,
    AirHandler,
    HeatPump,
}

impl DeviceClass {
    pub const fn bus_address(self) -> u16 {
        match self {
            DeviceClass::Thermostat => 0x2001,
            DeviceClass::ImpersonatedController => 0x9201,
            DeviceClass::AirHandler => 0x4001,
            DeviceClass::HeatPump => 0x5101,
        }
    }

    pub fn from_bus_address(raw: u16) -> Option<Self> {
        match raw {
            0x2001 => Some(DeviceClass::Thermostat),
            0x9201 => Some(DeviceClass::ImpersonatedController),
            0x4001 => Some(DeviceClass::AirHandler),
            0x5101 => Some(DeviceClass::HeatPump),
            _ => None,
        }
    }
}

impl Display for DeviceClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceClass::Thermostat => "thermostat",
            DeviceClass::ImpersonatedController => "controller",
            DeviceClass::AirHandler => "air handler",
            DeviceClass::HeatPump => "heat pump",
        };
        write!(f, "{} ({:04x})", name, self.bus_address())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub raw: u16,
    pub class: DeviceClass,
}

impl DeviceAddress {
    pub const fn of(class: DeviceClass) -> Self {
        Self {
            raw: class.bus_address(),
            class,
        }
    }
}

/// Source address of every frame this crate sends.
pub const CONTROLLER: DeviceAddress = DeviceAddress::of(DeviceClass::ImpersonatedController);

// =====================
// Tables
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId([u8; 3]);

impl TableId {
    pub const LEN: usize = 3;

    pub const fn new(a: u8, b: u8, c: u8) -> Self {
        Self([a, b, c])
    }

    pub const fn bytes(self) -> [u8; 3] {
        self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [a, b, c] => Some(Self([*a, *b, *c])),
            _ => None,
        }
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

impl FromStr for TableId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 6 || !s.is_ascii() {
            return Err(format!("table id must be 6 hex digits, got {:?}", s));
        }
        let byte = |i: usize| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| format!("invalid table id {:?}", s));
        Ok(Self([byte(0)?, byte(2)?, byte(4)?]))
    }
}

pub const COMFORT_PROFILE: TableId = TableId::new(0x00, 0x40, 0x0a);
pub const HEAT_PUMP_INDOOR: TableId = TableId::new(0x00, 0x03, 0x04);
pub const HEAT_PUMP_OUTDOOR: TableId = TableId::new(0x00, 0x06, 0x1f);
pub const THERMOSTAT_SENSORS: TableId = TableId::new(0x00, 0x49, 0x01);
pub const DAILY_ENERGY: TableId = TableId::new(0x00, 0x46, 0x0e);
pub const YEARLY_ENERGY: TableId = TableId::new(0x00, 0x46, 0x10);
pub const WEEKDAY_PROGRAM: TableId = TableId::new(0x00, 0x41, 0x06);
pub const WEEKEND_PROGRAM: TableId = TableId::new(0x00, 0x41, 0x07);

pub mod fields {
    pub const HEAT_SETPOINT: &str = "heat_setpoint";
    pub const COOL_SETPOINT: &str = "cool_setpoint";
    pub const INDOOR_TEMP: &str = "indoor_temp";
    pub const OUTDOOR_TEMP: &str = "outdoor_temp";

    pub const YTD_HP_HEAT: &str = "ytd_hp_heat";
    pub const YTD_ELECTRIC: &str = "ytd_electric";
    pub const YTD_COOLING: &str = "ytd_cooling";
    pub const PRIOR_COOLING: &str = "prior_cooling";
    pub const PRIOR_HP_HEAT: &str = "prior_hp_heat";
    pub const PRIOR_ELECTRIC: &str = "prior_electric";
    pub const PRIOR_FAN: &str = "prior_fan";

    /// Daily energy record, 0 = yesterday.
    pub fn day(index: usize) -> String {
        format!("day{}", index)
    }

    /// Program slot field, slots are 1-based.
    pub fn slot(slot: usize, part: &str) -> String {
        format!("p{}_{}", slot, part)
    }
}

pub const DAILY_RECORDS: usize = 10;
pub const PROGRAM_SLOTS: usize = 6;
pub const PROGRAM_SLOT_LEN: usize = 16;
pub const PERIOD_NAME_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub offset: usize,
    pub codec: FieldCodec,
}

impl Field {
    pub fn len(&self) -> usize {
        self.codec.len()
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub device: DeviceClass,
    pub table: TableId,
    pub name: &'static str,
    pub len: usize,
    pub fields: Vec<Field>,
}

impl TableSchema {
    pub fn new(device: DeviceClass, table: TableId, name: &'static str, len: usize) -> Self {
        Self {
            device,
            table,
            name,
            len,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, offset: usize, codec: FieldCodec) -> Self {
        self.fields.push(Field {
            name: name.into(),
            offset,
            codec,
        });
        self
    }

    pub fn field(&self, name: &str) -> Result<&Field, RegistryError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| RegistryError::UnknownField {
                table: self.table,
                field: name.to_string(),
            })
    }

    fn check_layout(&self) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidLayout {
            table: self.table,
            reason,
        };
        for (i, field) in self.fields.iter().enumerate() {
            if field.range().end > self.len {
                return Err(invalid(format!(
                    "field {} ends at {} past table length {}",
                    field.name,
                    field.range().end,
                    self.len
                )));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(invalid(format!("duplicate field {}", field.name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    UnknownTable { device: DeviceClass, table: TableId },
    UnknownField { table: TableId, field: String },
    InvalidLayout { table: TableId, reason: String },
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::UnknownTable { device, table } => write!(f, "unknown table {} on {}", table, device),
            RegistryError::UnknownField { table, field } => write!(f, "table {} has no field {}", table, field),
            RegistryError::InvalidLayout { table, reason } => {
                write!(f, "invalid layout for table {}: {}", table, reason)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    schemas: HashMap<(DeviceClass, TableId), TableSchema>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every table known from captures. Lengths marked provisional in the
    /// design notes still need confirming on hardware.
    pub fn builtin() -> Self {
        use fields::*;
        use DeviceClass::{HeatPump, Thermostat};

        let mut registry = Registry::new();
        let mut daily = TableSchema::new(Thermostat, DAILY_ENERGY, "daily energy", DAILY_RECORDS * 10);
        for i in 0..DAILY_RECORDS {
            daily = daily.with_field(day(i), i * 10, FieldCodec::EnergyRecord);
        }

        let schemas = [
            TableSchema::new(Thermostat, COMFORT_PROFILE, "comfort profile", 64)
                .with_field(HEAT_SETPOINT, 25, FieldCodec::RawFahrenheit)
                .with_field(COOL_SETPOINT, 26, FieldCodec::RawFahrenheit),
            TableSchema::new(HeatPump, HEAT_PUMP_INDOOR, "heat pump indoor", 16).with_field(
                INDOOR_TEMP,
                10,
                FieldCodec::RawFahrenheit,
            ),
            TableSchema::new(HeatPump, HEAT_PUMP_OUTDOOR, "heat pump outdoor", 40).with_field(
                OUTDOOR_TEMP,
                32,
                FieldCodec::RawFahrenheit,
            ),
            TableSchema::new(Thermostat, THERMOSTAT_SENSORS, "thermostat sensors", 24).with_field(
                OUTDOOR_TEMP,
                16,
                FieldCodec::RawFahrenheit,
            ),
            daily,
            TableSchema::new(Thermostat, YEARLY_ENERGY, "yearly energy", 40)
                .with_field(YTD_HP_HEAT, 3, FieldCodec::Uint16)
                .with_field(YTD_ELECTRIC, 7, FieldCodec::Uint16)
                .with_field(YTD_COOLING, 11, FieldCodec::Uint16)
                .with_field(PRIOR_COOLING, 19, FieldCodec::Uint16)
                .with_field(PRIOR_HP_HEAT, 23, FieldCodec::Uint16)
                .with_field(PRIOR_ELECTRIC, 27, FieldCodec::Uint16)
                .with_field(PRIOR_FAN, 35, FieldCodec::Uint16),
            program_schema(WEEKDAY_PROGRAM, "weekday program"),
            program_schema(WEEKEND_PROGRAM, "weekend program"),
        ];
        for schema in schemas {
            registry.register(schema).expect("builtin table layouts are consistent");
        }
        registry
    }

    pub fn register(&mut self, schema: TableSchema) -> Result<(), RegistryError> {
        schema.check_layout()?;
        self.schemas.insert((schema.device, schema.table), schema);
        Ok(())
    }

    pub fn schema_for(&self, device: DeviceClass, table: TableId) -> Result<&TableSchema, RegistryError> {
        self.schemas
            .get(&(device, table))
            .ok_or(RegistryError::UnknownTable { device, table })
    }

    pub fn field_for<'a>(&self, schema: &'a TableSchema, name: &str) -> Result<&'a Field, RegistryError> {
        schema.field(name)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &TableSchema> {
        self.schemas.values()
    }
}

fn program_schema(table: TableId, name: &'static str) -> TableSchema {
    let mut schema = TableSchema::new(DeviceClass::Thermostat, table, name, PROGRAM_SLOTS * PROGRAM_SLOT_LEN);
    for slot in 1..=PROGRAM_SLOTS {
        let base = (slot - 1) * PROGRAM_SLOT_LEN;
        schema = schema
            .with_field(fields::slot(slot, "enabled"), base, FieldCodec::Flag)
            .with_field(fields::slot(slot, "name"), base + 1, FieldCodec::Ascii(PERIOD_NAME_LEN))
            .with_field(fields::slot(slot, "start"), base + 9, FieldCodec::AsciiTime)
            .with_field(fields::slot(slot, "heat"), base + 14, FieldCodec::RawFahrenheit)
            .with_field(fields::slot(slot, "cool"), base + 15, FieldCodec::RawFahrenheit);
    }
    schema
}
