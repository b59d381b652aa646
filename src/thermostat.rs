//! The operations an outer control layer drives: raw table access, status,
//! schedule management and manual setpoints.

use chrono::NaiveDateTime;
use log::info;
use std::fmt::{Display, Formatter};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, EngineError, PersistOutcome, TableSnapshot};
use crate::protocol::codec::FieldValue;
use crate::protocol::registry::{COMFORT_PROFILE, DeviceClass, TableId, fields};
use crate::schedule::{COOL_LIMITS, HEAT_LIMITS, Mode, Period, SaveReport, ScheduleEngine, ScheduleError, ScheduleState};
use crate::status::{Status, StatusAggregator};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetpointKind {
    Heat,
    Cool,
}

impl SetpointKind {
    pub fn field(self) -> &'static str {
        match self {
            SetpointKind::Heat => fields::HEAT_SETPOINT,
            SetpointKind::Cool => fields::COOL_SETPOINT,
        }
    }

    pub fn limits(self) -> RangeInclusive<u8> {
        match self {
            SetpointKind::Heat => HEAT_LIMITS,
            SetpointKind::Cool => COOL_LIMITS,
        }
    }
}

impl Display for SetpointKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SetpointKind::Heat => write!(f, "heat"),
            SetpointKind::Cool => write!(f, "cool"),
        }
    }
}

#[derive(Debug)]
pub enum ControlError {
    OutOfRange { kind: SetpointKind, value: u8 },
    Engine(EngineError),
    Schedule(ScheduleError),
}

impl Display for ControlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::OutOfRange { kind, value } => {
                let limits = kind.limits();
                write!(
                    f,
                    "{} setpoint {} outside {}-{}",
                    kind,
                    value,
                    limits.start(),
                    limits.end()
                )
            }
            ControlError::Engine(e) => write!(f, "{}", e),
            ControlError::Schedule(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Engine(e) => Some(e),
            ControlError::Schedule(e) => Some(e),
            ControlError::OutOfRange { .. } => None,
        }
    }
}

impl From<EngineError> for ControlError {
    fn from(value: EngineError) -> Self {
        ControlError::Engine(value)
    }
}

impl From<ScheduleError> for ControlError {
    fn from(value: ScheduleError) -> Self {
        ControlError::Schedule(value)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SetpointChange {
    /// This request took the schedule out of control.
    pub switched_to_manual: bool,
    pub outcome: PersistOutcome,
}

pub struct Thermostat {
    engine: Arc<Engine>,
    status: StatusAggregator,
    schedule: ScheduleEngine,
}

impl Thermostat {
    pub fn new(engine: Arc<Engine>, status_cache_age: Duration) -> Self {
        Self {
            status: StatusAggregator::new(Arc::clone(&engine), status_cache_age),
            schedule: ScheduleEngine::new(Arc::clone(&engine)),
            engine,
        }
    }

    pub fn read(&self, device: DeviceClass, table: TableId) -> Result<TableSnapshot, EngineError> {
        self.engine.read(device, table)
    }

    pub fn write_field(
        &self,
        device: DeviceClass,
        table: TableId,
        field: &str,
        value: &FieldValue,
    ) -> Result<(), EngineError> {
        self.engine.write_field(device, table, field, value)
    }

    pub fn persistent_write(
        &self,
        device: DeviceClass,
        table: TableId,
        field: &str,
        value: &FieldValue,
    ) -> Result<PersistOutcome, EngineError> {
        self.engine.persistent_write(device, table, field, value)
    }

    pub fn poll(&self) -> Result<Status, EngineError> {
        self.status.poll()
    }

    pub fn schedule(&self) -> &ScheduleEngine {
        &self.schedule
    }

    pub fn get_schedule(&self) -> ScheduleState {
        self.schedule.state()
    }

    pub fn load_schedule(&self) -> Result<ScheduleState, EngineError> {
        self.schedule.load()
    }

    pub fn save_schedule(&self, weekday: Vec<Period>, weekend: Vec<Period>) -> Result<SaveReport, ScheduleError> {
        self.schedule.save_schedule(weekday, weekend)
    }

    pub fn set_mode(&self, mode: Mode) {
        self.schedule.set_mode(mode)
    }

    /// Manual setpoint change. Takes the schedule out of control first, so a
    /// running schedule cannot overwrite the new value.
    pub fn set_setpoint(&self, kind: SetpointKind, value: u8) -> Result<SetpointChange, ControlError> {
        if !kind.limits().contains(&value) {
            return Err(ControlError::OutOfRange { kind, value });
        }
        let switched_to_manual = self.schedule.ensure_manual();
        info!("Setting {} setpoint to {}°F", kind, value);
        let outcome = self.engine.persistent_write(
            DeviceClass::Thermostat,
            COMFORT_PROFILE,
            kind.field(),
            &FieldValue::Fahrenheit(value),
        )?;
        Ok(SetpointChange {
            switched_to_manual,
            outcome,
        })
    }

    pub fn tick_schedule(&self, now: NaiveDateTime) -> Result<Option<Period>, EngineError> {
        self.schedule.tick(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{test_engine, test_engine_paced};
    use crate::status::{DEFAULT_CACHE_AGE, Reading};
    use std::thread;

    #[test]
    fn setpoint_persists_and_shows_in_status() {
        let (engine, _) = test_engine(2);
        let thermostat = Thermostat::new(engine, DEFAULT_CACHE_AGE);
        let change = thermostat.set_setpoint(SetpointKind::Cool, 78).unwrap();
        assert_eq!(
            change,
            SetpointChange {
                switched_to_manual: false,
                outcome: PersistOutcome::Committed
            }
        );
        assert_eq!(thermostat.poll().unwrap().cool_setpoint, Reading::Fresh(78));
    }

    #[test]
    fn out_of_range_setpoint_is_rejected_up_front() {
        let (engine, handle) = test_engine(2);
        let thermostat = Thermostat::new(engine, DEFAULT_CACHE_AGE);
        thermostat.set_mode(Mode::Schedule);
        assert!(matches!(
            thermostat.set_setpoint(SetpointKind::Heat, 90),
            Err(ControlError::OutOfRange {
                kind: SetpointKind::Heat,
                value: 90
            })
        ));
        assert_eq!(thermostat.get_schedule().mode, Mode::Schedule);
        assert_eq!(handle.requests_seen(), 0);
    }

    #[test]
    fn rapid_setpoints_switch_to_manual_once() {
        let (engine, _) = test_engine(2);
        let thermostat = Arc::new(Thermostat::new(engine, DEFAULT_CACHE_AGE));
        thermostat.set_mode(Mode::Schedule);

        let workers: Vec<_> = (0..5u8)
            .map(|i| {
                let thermostat = Arc::clone(&thermostat);
                thread::spawn(move || thermostat.set_setpoint(SetpointKind::Heat, 66 + i))
            })
            .collect();
        let changes: Vec<SetpointChange> = workers.into_iter().map(|w| w.join().unwrap().unwrap()).collect();

        assert_eq!(changes.iter().filter(|c| c.switched_to_manual).count(), 1);
        assert!(changes.iter().any(|c| c.outcome == PersistOutcome::Committed));
        assert_eq!(thermostat.get_schedule().mode, Mode::Manual);
    }

    #[test]
    fn manual_setpoint_cancels_a_runner_in_flight() {
        let (engine, handle) = test_engine_paced(4, Duration::from_millis(50));
        let mut comfort = handle.table(DeviceClass::Thermostat, COMFORT_PROFILE).unwrap();
        comfort[26] = 85;
        handle.set_table(DeviceClass::Thermostat, COMFORT_PROFILE, comfort);
        // the runner's first round misses the commit window
        handle.ignore_writes(1);

        let thermostat = Arc::new(Thermostat::new(engine, DEFAULT_CACHE_AGE));
        thermostat.set_mode(Mode::Schedule);
        let monday = chrono::NaiveDate::from_ymd_opt(2025, 1, 6)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap();
        let runner = {
            let thermostat = Arc::clone(&thermostat);
            thread::spawn(move || thermostat.tick_schedule(monday))
        };
        while handle.writes_seen() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let change = thermostat.set_setpoint(SetpointKind::Heat, 72).unwrap();
        assert!(change.switched_to_manual);
        assert_eq!(change.outcome, PersistOutcome::Committed);
        assert_eq!(runner.join().unwrap().unwrap(), None);

        let comfort = handle.table(DeviceClass::Thermostat, COMFORT_PROFILE).unwrap();
        assert_eq!((comfort[25], comfort[26]), (72, 85));
        assert_eq!(thermostat.get_schedule().mode, Mode::Manual);
    }

    #[test]
    fn manual_setpoint_stops_the_runner() {
        let (engine, handle) = test_engine(1);
        let thermostat = Thermostat::new(engine, DEFAULT_CACHE_AGE);
        thermostat.set_mode(Mode::Schedule);
        thermostat.set_setpoint(SetpointKind::Heat, 72).unwrap();

        let monday = chrono::NaiveDate::from_ymd_opt(2025, 1, 6)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap();
        assert_eq!(thermostat.tick_schedule(monday).unwrap(), None);
        assert_eq!(handle.table(DeviceClass::Thermostat, COMFORT_PROFILE).unwrap()[25], 72);
    }
}
