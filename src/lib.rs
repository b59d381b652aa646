//! Transaction engine for Carrier Infinity equipment on the ABCD RS-485 bus.
//!
//! The bus carries fixed-size byte tables owned by the thermostat, air
//! handler and heat pump. This crate frames requests, owns the half-duplex
//! link, maps tables to named fields, commits writes that the firmware only
//! accepts inside an intermittent processing window, and builds status and
//! schedule logic on top.

pub mod protocol {
    pub mod codec;
    pub mod frame;
    pub mod registry;
}

pub mod bus;
pub mod config;
pub mod engine;
pub mod schedule;
pub mod simulator;
pub mod status;
pub mod thermostat;

pub use crate::bus::{BusError, BusLink, SerialLink, Transport, TransportSettings};
pub use crate::engine::{Engine, EngineError, FieldOutcome, PersistOutcome, PersistencePolicy, TableSnapshot};
pub use crate::protocol::codec::{CodecError, EnergyRecord, FieldCodec, FieldValue};
pub use crate::protocol::frame::{Frame, FrameError, Opcode};
pub use crate::protocol::registry::{DeviceAddress, DeviceClass, Field, Registry, RegistryError, TableId, TableSchema};
pub use crate::schedule::{DayType, Mode, Period, SaveReport, SavedField, ScheduleEngine, ScheduleError, ScheduleState};
pub use crate::status::{Reading, Status, StatusAggregator, YearlyEnergy};
pub use crate::thermostat::{ControlError, SetpointChange, SetpointKind, Thermostat};
