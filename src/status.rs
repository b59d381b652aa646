//! Status snapshot assembled from the polled tables.
//!
//! Each table is read independently. A table that cannot be read degrades
//! only the readings taken from it, and a recent cached copy is served as
//! `Stale` rather than passed off as fresh.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::{Engine, EngineError, TableSnapshot};
use crate::protocol::codec::{EnergyRecord, FieldValue};
use crate::protocol::registry::{
    COMFORT_PROFILE, DAILY_ENERGY, DeviceClass, HEAT_PUMP_INDOOR, HEAT_PUMP_OUTDOOR, THERMOSTAT_SENSORS, TableId,
    YEARLY_ENERGY, fields,
};

pub const DEFAULT_CACHE_AGE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq)]
pub enum Reading<T> {
    Fresh(T),
    /// Served from cache; `as_of` is when the table was last read.
    Stale {
        value: T,
        as_of: DateTime<Utc>,
    },
    Unavailable,
}

impl<T> Reading<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Reading::Fresh(value) | Reading::Stale { value, .. } => Some(value),
            Reading::Unavailable => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Reading::Fresh(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Reading::Unavailable)
    }

    pub fn as_ref(&self) -> Reading<&T> {
        match self {
            Reading::Fresh(value) => Reading::Fresh(value),
            Reading::Stale { value, as_of } => Reading::Stale { value, as_of: *as_of },
            Reading::Unavailable => Reading::Unavailable,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reading<U> {
        self.and_then(|value| Some(f(value)))
    }

    /// Like `map`, but `None` turns the reading unavailable.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Option<U>) -> Reading<U> {
        match self {
            Reading::Fresh(value) => f(value).map_or(Reading::Unavailable, Reading::Fresh),
            Reading::Stale { value, as_of } => {
                f(value).map_or(Reading::Unavailable, |value| Reading::Stale { value, as_of })
            }
            Reading::Unavailable => Reading::Unavailable,
        }
    }
}

/// `{"value": .., "stale": bool, "as_of": timestamp or null}`
impl<T: Serialize> Serialize for Reading<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Reading", 3)?;
        state.serialize_field("value", &self.value())?;
        match self {
            Reading::Stale { as_of, .. } => {
                state.serialize_field("stale", &true)?;
                state.serialize_field("as_of", &Some(as_of))?;
            }
            _ => {
                state.serialize_field("stale", &false)?;
                state.serialize_field("as_of", &None::<DateTime<Utc>>)?;
            }
        }
        state.end()
    }
}

/// Yearly totals; fields the table does not carry for that year are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearlyEnergy {
    pub hp_heat_kwh: Option<u16>,
    pub electric_kwh: Option<u16>,
    pub cooling_kwh: Option<u16>,
    pub fan_kwh: Option<u16>,
    pub total_kwh: u32,
}

impl YearlyEnergy {
    pub fn new(
        hp_heat_kwh: Option<u16>,
        electric_kwh: Option<u16>,
        cooling_kwh: Option<u16>,
        fan_kwh: Option<u16>,
    ) -> Self {
        let total_kwh = [hp_heat_kwh, electric_kwh, cooling_kwh, fan_kwh]
            .iter()
            .flatten()
            .map(|kwh| *kwh as u32)
            .sum();
        Self {
            hp_heat_kwh,
            electric_kwh,
            cooling_kwh,
            fan_kwh,
            total_kwh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub polled_at: DateTime<Utc>,
    pub indoor_temp: Reading<u8>,
    pub outdoor_temp: Reading<u8>,
    pub heat_setpoint: Reading<u8>,
    pub cool_setpoint: Reading<u8>,
    pub energy_yesterday: Reading<EnergyRecord>,
    pub energy_two_days_ago: Reading<EnergyRecord>,
    pub energy_ytd: Reading<YearlyEnergy>,
    /// Newest first.
    pub prior_years: Reading<Vec<YearlyEnergy>>,
}

pub struct StatusAggregator {
    engine: Arc<Engine>,
    max_age: Duration,
    cache: Mutex<HashMap<(DeviceClass, TableId), TableSnapshot>>,
}

impl StatusAggregator {
    pub fn new(engine: Arc<Engine>, max_age: Duration) -> Self {
        Self {
            engine,
            max_age,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// One status snapshot. A table the bus cannot deliver only degrades its
    /// own readings; registry and schema errors abort the poll.
    pub fn poll(&self) -> Result<Status, EngineError> {
        use DeviceClass::{HeatPump, Thermostat};

        let comfort = self.fetch(Thermostat, COMFORT_PROFILE)?;
        let indoor = self.fetch(HeatPump, HEAT_PUMP_INDOOR)?;
        let daily = self.fetch(Thermostat, DAILY_ENERGY)?;
        let yearly = self.fetch(Thermostat, YEARLY_ENERGY)?;

        let mut outdoor_temp = self.fahrenheit(&self.fetch(HeatPump, HEAT_PUMP_OUTDOOR)?, fields::OUTDOOR_TEMP);
        if !outdoor_temp.is_fresh() {
            // the thermostat keeps its own copy of the outdoor sensor
            let sensors = self.fetch(Thermostat, THERMOSTAT_SENSORS)?;
            let fallback = self.fahrenheit(&sensors, fields::OUTDOOR_TEMP);
            if fallback.is_fresh() || outdoor_temp.is_unavailable() {
                outdoor_temp = fallback;
            }
        }

        let kwh = |snapshot: &TableSnapshot, name: &str| self.decode(snapshot, name).and_then(|v| v.as_uint());
        let energy_ytd = yearly.as_ref().map(|s| {
            YearlyEnergy::new(
                kwh(s, fields::YTD_HP_HEAT),
                kwh(s, fields::YTD_ELECTRIC),
                kwh(s, fields::YTD_COOLING),
                None,
            )
        });
        let prior_years = yearly.as_ref().map(|s| {
            vec![YearlyEnergy::new(
                kwh(s, fields::PRIOR_HP_HEAT),
                kwh(s, fields::PRIOR_ELECTRIC),
                kwh(s, fields::PRIOR_COOLING),
                kwh(s, fields::PRIOR_FAN),
            )]
        });

        let status = Status {
            polled_at: Utc::now(),
            indoor_temp: self.fahrenheit(&indoor, fields::INDOOR_TEMP),
            outdoor_temp,
            heat_setpoint: self.fahrenheit(&comfort, fields::HEAT_SETPOINT),
            cool_setpoint: self.fahrenheit(&comfort, fields::COOL_SETPOINT),
            energy_yesterday: self.energy(&daily, 0),
            energy_two_days_ago: self.energy(&daily, 1),
            energy_ytd,
            prior_years,
        };
        debug!("Status: polled at {}", status.polled_at);
        Ok(status)
    }

    /// Only bus failures fall back to the cache.
    fn fetch(&self, device: DeviceClass, table: TableId) -> Result<Reading<TableSnapshot>, EngineError> {
        let result = self.engine.read(device, table);
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match result {
            Ok(snapshot) => {
                cache.insert((device, table), snapshot.clone());
                Ok(Reading::Fresh(snapshot))
            }
            Err(EngineError::Bus(e)) => {
                warn!("Status: cannot read {} from {}: {}", table, device, e);
                Ok(match cache.get(&(device, table)) {
                    Some(cached) if self.within_max_age(cached) => Reading::Stale {
                        value: cached.clone(),
                        as_of: cached.fetched_at,
                    },
                    _ => Reading::Unavailable,
                })
            }
            Err(e) => {
                cache.remove(&(device, table));
                Err(e)
            }
        }
    }

    fn within_max_age(&self, snapshot: &TableSnapshot) -> bool {
        (Utc::now() - snapshot.fetched_at)
            .to_std()
            .map(|age| age <= self.max_age)
            .unwrap_or(true)
    }

    fn decode(&self, snapshot: &TableSnapshot, name: &str) -> Option<FieldValue> {
        self.engine
            .field_value(snapshot, name)
            .inspect_err(|e| warn!("Status: cannot decode {} of {}: {}", name, snapshot.table, e))
            .ok()
    }

    fn fahrenheit(&self, snapshot: &Reading<TableSnapshot>, name: &str) -> Reading<u8> {
        snapshot.as_ref().and_then(|s| self.decode(s, name)?.as_fahrenheit())
    }

    fn energy(&self, snapshot: &Reading<TableSnapshot>, day: usize) -> Reading<EnergyRecord> {
        snapshot
            .as_ref()
            .and_then(|s| self.decode(s, &fields::day(day))?.as_energy().cloned())
    }
}
