//! Weekday/weekend programs, the active-period rules and the runner that
//! drives the comfort profile from them.
//!
//! Periods of a day type are kept sorted by start time. Each one runs until
//! the next one starts; the last period of the day runs past midnight into
//! the first period of the following day.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Weekday};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::engine::{Engine, EngineError, FieldOutcome};
use crate::protocol::codec::FieldValue;
use crate::protocol::registry::{
    COMFORT_PROFILE, DeviceClass, PERIOD_NAME_LEN, PROGRAM_SLOTS, TableId, WEEKDAY_PROGRAM, WEEKEND_PROGRAM, fields,
};

pub const HEAT_LIMITS: RangeInclusive<u8> = 55..=85;
pub const COOL_LIMITS: RangeInclusive<u8> = 60..=90;
/// Closest two neighbouring periods may start.
pub const MIN_SPACING_MINUTES: i64 = 15;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayType {
    Weekday,
    Weekend,
}

fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

impl DayType {
    pub fn for_date(date: NaiveDate) -> Self {
        if is_weekend(date.weekday()) {
            DayType::Weekend
        } else {
            DayType::Weekday
        }
    }

    pub fn program_table(self) -> TableId {
        match self {
            DayType::Weekday => WEEKDAY_PROGRAM,
            DayType::Weekend => WEEKEND_PROGRAM,
        }
    }
}

impl Display for DayType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DayType::Weekday => write!(f, "weekday"),
            DayType::Weekend => write!(f, "weekend"),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Manual,
    Schedule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub name: String,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    pub heat: u8,
    pub cool: u8,
}

impl Period {
    pub fn new(name: impl Into<String>, start: NaiveTime, heat: u8, cool: u8) -> Self {
        Self {
            name: name.into(),
            start,
            heat,
            cool,
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&text, FORMAT).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    LastPeriodUndeletable { day: DayType },
    DuplicateStart { day: DayType, start: NaiveTime },
    DuplicateName { day: DayType, name: String },
    UnknownPeriod { day: DayType, name: String },
    EmptyDay(DayType),
    ScheduleFull { day: DayType },
    /// Empty, non-ASCII or longer than the program table's name field.
    InvalidName(String),
    SetpointOutOfRange { period: String, heat: u8, cool: u8 },
}

impl Display for ScheduleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::LastPeriodUndeletable { day } => write!(f, "cannot delete the only {} period", day),
            ScheduleError::DuplicateStart { day, start } => {
                write!(f, "{} already has a period starting at {}", day, start.format("%H:%M"))
            }
            ScheduleError::DuplicateName { day, name } => write!(f, "{} already has a period named {:?}", day, name),
            ScheduleError::UnknownPeriod { day, name } => write!(f, "{} has no period named {:?}", day, name),
            ScheduleError::EmptyDay(day) => write!(f, "{} program has no periods", day),
            ScheduleError::ScheduleFull { day } => write!(f, "{} program is limited to {} periods", day, PROGRAM_SLOTS),
            ScheduleError::InvalidName(name) => write!(
                f,
                "invalid period name {:?}: 1 to {} ascii characters",
                name, PERIOD_NAME_LEN
            ),
            ScheduleError::SetpointOutOfRange { period, heat, cool } => write!(
                f,
                "period {:?}: heat {} must be within {}-{}, cool {} within {}-{}",
                period,
                heat,
                HEAT_LIMITS.start(),
                HEAT_LIMITS.end(),
                cool,
                COOL_LIMITS.start(),
                COOL_LIMITS.end()
            ),
        }
    }
}

impl std::error::Error for ScheduleError {}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).expect("valid time of day")
}

/// `time` moved by `minutes`, or `None` if that leaves the day.
fn shifted(time: NaiveTime, minutes: i64) -> Option<NaiveTime> {
    match time.overflowing_add_signed(TimeDelta::minutes(minutes)) {
        (moved, 0) => Some(moved),
        _ => None,
    }
}

/// `time` moved by `minutes`, only if that crosses midnight.
fn across_midnight(time: NaiveTime, minutes: i64) -> Option<NaiveTime> {
    match time.overflowing_add_signed(TimeDelta::minutes(minutes)) {
        (_, 0) => None,
        (moved, _) => Some(moved),
    }
}

fn check_period(period: &Period) -> Result<(), ScheduleError> {
    let name = &period.name;
    let stored_as_is = !name.contains('\0') && name.trim_end() == name;
    if name.is_empty() || name.len() > PERIOD_NAME_LEN || !name.is_ascii() || !stored_as_is {
        return Err(ScheduleError::InvalidName(name.clone()));
    }
    if !HEAT_LIMITS.contains(&period.heat) || !COOL_LIMITS.contains(&period.cool) {
        return Err(ScheduleError::SetpointOutOfRange {
            period: name.clone(),
            heat: period.heat,
            cool: period.cool,
        });
    }
    Ok(())
}

fn check_day(day: DayType, periods: &[Period]) -> Result<(), ScheduleError> {
    if periods.is_empty() {
        return Err(ScheduleError::EmptyDay(day));
    }
    if periods.len() > PROGRAM_SLOTS {
        return Err(ScheduleError::ScheduleFull { day });
    }
    for (i, period) in periods.iter().enumerate() {
        check_period(period)?;
        let earlier = &periods[..i];
        if earlier.iter().any(|p| p.start == period.start) {
            return Err(ScheduleError::DuplicateStart {
                day,
                start: period.start,
            });
        }
        if earlier.iter().any(|p| p.name == period.name) {
            return Err(ScheduleError::DuplicateName {
                day,
                name: period.name.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub mode: Mode,
    pub weekday: Vec<Period>,
    pub weekend: Vec<Period>,
}

impl ScheduleState {
    pub fn new(mode: Mode, weekday: Vec<Period>, weekend: Vec<Period>) -> Result<Self, ScheduleError> {
        let mut state = Self { mode, weekday, weekend };
        state.weekday.sort_by_key(|p| p.start);
        state.weekend.sort_by_key(|p| p.start);
        state.validate()?;
        Ok(state)
    }

    /// Used until the thermostat's own program has been read.
    pub fn default_program() -> Self {
        let weekday = vec![
            Period::new("wake", hm(6, 30), 70, 76),
            Period::new("home", hm(8, 0), 68, 75),
            Period::new("away", hm(17, 0), 62, 80),
            Period::new("sleep", hm(22, 0), 65, 78),
        ];
        let weekend = vec![
            Period::new("wake", hm(8, 0), 70, 76),
            Period::new("home", hm(9, 0), 68, 75),
            Period::new("away", hm(17, 0), 62, 80),
            Period::new("sleep", hm(22, 0), 65, 78),
        ];
        Self {
            mode: Mode::Manual,
            weekday,
            weekend,
        }
    }

    pub fn periods(&self, day: DayType) -> &[Period] {
        match day {
            DayType::Weekday => &self.weekday,
            DayType::Weekend => &self.weekend,
        }
    }

    fn periods_mut(&mut self, day: DayType) -> &mut Vec<Period> {
        match day {
            DayType::Weekday => &mut self.weekday,
            DayType::Weekend => &mut self.weekend,
        }
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        check_day(DayType::Weekday, &self.weekday)?;
        check_day(DayType::Weekend, &self.weekend)
    }

    fn active_index(&self, now: NaiveTime, day: DayType) -> Option<usize> {
        let periods = self.periods(day);
        periods
            .iter()
            .rposition(|p| p.start <= now)
            .or_else(|| periods.len().checked_sub(1))
    }

    /// Latest period started by `now`; before the first start of the day,
    /// the day's last period is still running.
    pub fn active_period(&self, now: NaiveTime, day: DayType) -> Option<&Period> {
        self.active_index(now, day).map(|i| &self.periods(day)[i])
    }

    /// Period after the active one, wrapping to the first.
    pub fn next_transition(&self, now: NaiveTime, day: DayType) -> Option<&Period> {
        let periods = self.periods(day);
        self.active_index(now, day).map(|i| &periods[(i + 1) % periods.len()])
    }

    /// When the next period starts, looking into tomorrow's program
    /// (possibly the other day type) once today's last period is running.
    pub fn next_transition_at(&self, now: NaiveDateTime) -> Option<(NaiveDateTime, &Period)> {
        let today = self.periods(DayType::for_date(now.date()));
        if let Some(period) = today.iter().find(|p| p.start > now.time()) {
            return Some((now.date().and_time(period.start), period));
        }
        let tomorrow = now.date().succ_opt()?;
        let period = self.periods(DayType::for_date(tomorrow)).first()?;
        Some((tomorrow.and_time(period.start), period))
    }

    pub fn add_period(&mut self, day: DayType, period: Period) -> Result<(), ScheduleError> {
        check_period(&period)?;
        let periods = self.periods(day);
        if periods.len() >= PROGRAM_SLOTS {
            return Err(ScheduleError::ScheduleFull { day });
        }
        if periods.iter().any(|p| p.start == period.start) {
            return Err(ScheduleError::DuplicateStart {
                day,
                start: period.start,
            });
        }
        if periods.iter().any(|p| p.name == period.name) {
            return Err(ScheduleError::DuplicateName { day, name: period.name });
        }
        let periods = self.periods_mut(day);
        let at = periods.partition_point(|p| p.start < period.start);
        periods.insert(at, period);
        Ok(())
    }

    pub fn delete_period(&mut self, day: DayType, name: &str) -> Result<Period, ScheduleError> {
        let index = self.index_of(day, name)?;
        let periods = self.periods_mut(day);
        if periods.len() == 1 {
            return Err(ScheduleError::LastPeriodUndeletable { day });
        }
        Ok(periods.remove(index))
    }

    /// Move a period's start, clamped to keep `MIN_SPACING_MINUTES` from both
    /// neighbours and inside the day. The first and last periods are
    /// neighbours across midnight. Returns the start actually applied.
    pub fn set_period_start(
        &mut self,
        day: DayType,
        name: &str,
        requested: NaiveTime,
    ) -> Result<NaiveTime, ScheduleError> {
        let index = self.index_of(day, name)?;
        let periods = self.periods_mut(day);
        let current = periods[index].start;
        let last = periods.len() - 1;

        let earliest = match index.checked_sub(1) {
            Some(prev) => shifted(periods[prev].start, MIN_SPACING_MINUTES),
            None if last > 0 => Some(across_midnight(periods[last].start, MIN_SPACING_MINUTES).unwrap_or(hm(0, 0))),
            None => Some(hm(0, 0)),
        };
        let latest = match periods.get(index + 1) {
            Some(next) => shifted(next.start, -MIN_SPACING_MINUTES),
            None if last > 0 => Some(across_midnight(periods[0].start, -MIN_SPACING_MINUTES).unwrap_or(hm(23, 59))),
            None => Some(hm(23, 59)),
        };
        let (Some(earliest), Some(latest)) = (earliest, latest) else {
            return Ok(current);
        };
        if earliest > latest {
            debug!("Schedule: no room to move {} {}, keeping {}", day, name, current.format("%H:%M"));
            return Ok(current);
        }

        let requested = hm(requested.hour(), requested.minute());
        let applied = requested.clamp(earliest, latest);
        periods[index].start = applied;
        Ok(applied)
    }

    fn index_of(&self, day: DayType, name: &str) -> Result<usize, ScheduleError> {
        self.periods(day)
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| ScheduleError::UnknownPeriod {
                day,
                name: name.to_string(),
            })
    }
}

/// Outcome of persisting one program field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedField {
    pub day: DayType,
    pub field: String,
    /// `Err` holds the reason the whole table write gave up.
    pub outcome: Result<FieldOutcome, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub fields: Vec<SavedField>,
}

impl SaveReport {
    pub fn failures(&self) -> impl Iterator<Item = &SavedField> {
        self.fields
            .iter()
            .filter(|f| !matches!(f.outcome, Ok(FieldOutcome::Committed) | Ok(FieldOutcome::Superseded)))
    }

    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }
}

struct Runner {
    state: ScheduleState,
    /// Period last pushed to the comfort profile.
    last_applied: Option<(DayType, String)>,
    /// Bumped on every mode change; a tick in flight stops when it moves.
    epoch: u64,
}

pub struct ScheduleEngine {
    engine: Arc<Engine>,
    runner: Mutex<Runner>,
}

impl ScheduleEngine {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            runner: Mutex::new(Runner {
                state: ScheduleState::default_program(),
                last_applied: None,
                epoch: 0,
            }),
        }
    }

    fn runner(&self) -> MutexGuard<'_, Runner> {
        self.runner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ScheduleState {
        self.runner().state.clone()
    }

    pub fn mode(&self) -> Mode {
        self.runner().state.mode
    }

    /// Read both program tables. A day type with no usable slot keeps the
    /// default program. The mode is not stored on the device and is kept.
    pub fn load(&self) -> Result<ScheduleState, EngineError> {
        let defaults = ScheduleState::default_program();
        let mut loaded = Vec::with_capacity(2);
        for day in [DayType::Weekday, DayType::Weekend] {
            let periods = match self.read_program(day)? {
                Some(periods) => match check_day(day, &periods) {
                    Ok(()) => periods,
                    Err(e) => {
                        warn!("Schedule: {} program on the thermostat is unusable ({}), using defaults", day, e);
                        defaults.periods(day).to_vec()
                    }
                },
                None => {
                    info!("Schedule: no {} program stored, using defaults", day);
                    defaults.periods(day).to_vec()
                }
            };
            loaded.push(periods);
        }

        let mut runner = self.runner();
        let weekend = loaded.pop().unwrap_or_default();
        let weekday = loaded.pop().unwrap_or_default();
        runner.state.weekday = weekday;
        runner.state.weekend = weekend;
        runner.last_applied = None;
        Ok(runner.state.clone())
    }

    fn read_program(&self, day: DayType) -> Result<Option<Vec<Period>>, EngineError> {
        let snapshot = self.engine.read(DeviceClass::Thermostat, day.program_table())?;
        let field = |slot: usize, part: &str| self.engine.field_value(&snapshot, &fields::slot(slot, part));

        let mut periods = Vec::new();
        for slot in 1..=PROGRAM_SLOTS {
            if field(slot, "enabled")? != FieldValue::Flag(true) {
                continue;
            }
            let decoded = (
                field(slot, "name"),
                field(slot, "start"),
                field(slot, "heat"),
                field(slot, "cool"),
            );
            match decoded {
                (
                    Ok(FieldValue::Text(name)),
                    Ok(FieldValue::Time(start)),
                    Ok(FieldValue::Fahrenheit(heat)),
                    Ok(FieldValue::Fahrenheit(cool)),
                ) => periods.push(Period::new(name, start, heat, cool)),
                other => warn!("Schedule: skipping undecodable {} slot {}: {:?}", day, slot, other),
            }
        }
        periods.sort_by_key(|p| p.start);
        Ok((!periods.is_empty()).then_some(periods))
    }

    /// Validate and adopt a new program without touching the device.
    pub fn replace(&self, weekday: Vec<Period>, weekend: Vec<Period>) -> Result<(), ScheduleError> {
        let mut runner = self.runner();
        let state = ScheduleState::new(runner.state.mode, weekday, weekend)?;
        runner.state = state;
        runner.last_applied = None;
        Ok(())
    }

    /// Apply `edit` to a copy of the schedule and keep it only if it succeeds.
    pub fn edit<R>(
        &self,
        edit: impl FnOnce(&mut ScheduleState) -> Result<R, ScheduleError>,
    ) -> Result<R, ScheduleError> {
        let mut runner = self.runner();
        let mut draft = runner.state.clone();
        let result = edit(&mut draft)?;
        draft.validate()?;
        runner.state = draft;
        runner.last_applied = None;
        Ok(result)
    }

    /// Persist both programs, one table at a time. Every field gets its own
    /// entry in the report.
    pub fn save(&self) -> SaveReport {
        let state = self.state();
        let mut report = SaveReport::default();
        for day in [DayType::Weekday, DayType::Weekend] {
            let writes = program_writes(state.periods(day));
            let batch: Vec<(&str, FieldValue)> =
                writes.iter().map(|(name, value)| (name.as_str(), value.clone())).collect();
            match self
                .engine
                .persistent_write_fields(DeviceClass::Thermostat, day.program_table(), &batch)
            {
                Ok(outcomes) => report.fields.extend(outcomes.into_iter().map(|(field, outcome)| SavedField {
                    day,
                    field,
                    outcome: Ok(outcome),
                })),
                Err(e) => {
                    warn!("Schedule: saving {} program failed: {}", day, e);
                    report.fields.extend(writes.iter().map(|(field, _)| SavedField {
                        day,
                        field: field.clone(),
                        outcome: Err(e.to_string()),
                    }))
                }
            }
        }
        let failed = report.failures().count();
        if failed == 0 {
            info!("Schedule: saved {} program fields", report.fields.len());
        } else {
            warn!("Schedule: {} of {} program fields did not persist", failed, report.fields.len());
        }
        report
    }

    pub fn save_schedule(&self, weekday: Vec<Period>, weekend: Vec<Period>) -> Result<SaveReport, ScheduleError> {
        self.replace(weekday, weekend)?;
        Ok(self.save())
    }

    pub fn set_mode(&self, mode: Mode) {
        let mut runner = self.runner();
        if mode == Mode::Schedule {
            // re-apply the active period on the next tick
            runner.last_applied = None;
        }
        if runner.state.mode != mode {
            info!("Schedule: mode {:?} -> {:?}", runner.state.mode, mode);
            runner.epoch += 1;
        }
        runner.state.mode = mode;
    }

    /// Leave schedule mode. True only for the call that made the switch.
    pub fn ensure_manual(&self) -> bool {
        let mut runner = self.runner();
        if runner.state.mode != Mode::Schedule {
            return false;
        }
        info!("Schedule: manual setpoint requested, switching to manual mode");
        runner.state.mode = Mode::Manual;
        runner.last_applied = None;
        runner.epoch += 1;
        true
    }

    /// Push the active period's setpoints if it changed since the last
    /// application. Returns the period applied, if any.
    ///
    /// Leaving schedule mode while the rounds run stops them; nothing is
    /// written for the period after the switch.
    pub fn tick(&self, now: NaiveDateTime) -> Result<Option<Period>, EngineError> {
        let day = DayType::for_date(now.date());
        let (period, epoch) = {
            let runner = self.runner();
            if runner.state.mode != Mode::Schedule {
                return Ok(None);
            }
            let Some(period) = runner.state.active_period(now.time(), day) else {
                return Ok(None);
            };
            if runner.last_applied.as_ref() == Some(&(day, period.name.clone())) {
                return Ok(None);
            }
            (period.clone(), runner.epoch)
        };
        let in_control = || {
            let runner = self.runner();
            runner.state.mode == Mode::Schedule && runner.epoch == epoch
        };

        info!(
            "Schedule: {} period {} active, heat {} cool {}",
            day, period.name, period.heat, period.cool
        );
        let outcomes = self.engine.persistent_write_while(
            DeviceClass::Thermostat,
            COMFORT_PROFILE,
            &[
                (fields::HEAT_SETPOINT, FieldValue::Fahrenheit(period.heat)),
                (fields::COOL_SETPOINT, FieldValue::Fahrenheit(period.cool)),
            ],
            &in_control,
        )?;
        for (field, outcome) in outcomes {
            if let FieldOutcome::Mismatch { expected, actual } = outcome {
                return Err(EngineError::PersistenceFailed {
                    device: DeviceClass::Thermostat,
                    table: COMFORT_PROFILE,
                    field,
                    expected,
                    actual,
                });
            }
        }

        let mut runner = self.runner();
        if runner.state.mode != Mode::Schedule || runner.epoch != epoch {
            info!("Schedule: mode changed while applying {}, stopped", period.name);
            return Ok(None);
        }
        runner.last_applied = Some((day, period.name.clone()));
        Ok(Some(period))
    }
}

/// Program table contents for `periods`: every field of the used slots, and
/// a cleared `enabled` flag for the rest.
fn program_writes(periods: &[Period]) -> Vec<(String, FieldValue)> {
    let mut writes = Vec::new();
    for slot in 1..=PROGRAM_SLOTS {
        match periods.get(slot - 1) {
            Some(p) => writes.extend([
                (fields::slot(slot, "enabled"), FieldValue::Flag(true)),
                (fields::slot(slot, "name"), FieldValue::Text(p.name.clone())),
                (fields::slot(slot, "start"), FieldValue::Time(p.start)),
                (fields::slot(slot, "heat"), FieldValue::Fahrenheit(p.heat)),
                (fields::slot(slot, "cool"), FieldValue::Fahrenheit(p.cool)),
            ]),
            None => writes.push((fields::slot(slot, "enabled"), FieldValue::Flag(false))),
        }
    }
    writes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::test_engine;

    fn sample_day() -> Vec<Period> {
        vec![
            Period::new("wake", hm(6, 0), 70, 76),
            Period::new("home", hm(8, 30), 68, 75),
            Period::new("away", hm(17, 0), 62, 80),
            Period::new("sleep", hm(22, 0), 65, 78),
        ]
    }

    fn sample() -> ScheduleState {
        ScheduleState::new(Mode::Manual, sample_day(), sample_day()).unwrap()
    }

    fn at(date: (i32, u32, u32), time: NaiveTime) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap().and_time(time)
    }

    #[test]
    fn active_period_wraps_past_midnight() {
        let state = sample();
        let day = DayType::Weekday;
        assert_eq!(state.active_period(hm(7, 0), day).unwrap().name, "wake");
        assert_eq!(state.active_period(hm(5, 0), day).unwrap().name, "sleep");
        assert_eq!(state.active_period(hm(8, 30), day).unwrap().name, "home");
        assert_eq!(state.active_period(hm(23, 59), day).unwrap().name, "sleep");

        let next = state.next_transition(hm(7, 0), day).unwrap();
        assert_eq!((next.start, next.name.as_str()), (hm(8, 30), "home"));
        assert_eq!(state.next_transition(hm(23, 0), day).unwrap().name, "wake");
        assert_eq!(state.next_transition(hm(5, 0), day).unwrap().name, "wake");
    }

    #[test]
    fn next_transition_crosses_into_the_weekend() {
        let state = ScheduleState::default_program();
        // Friday night
        let (when, period) = state.next_transition_at(at((2025, 1, 10), hm(23, 0))).unwrap();
        assert_eq!(when, at((2025, 1, 11), hm(8, 0)));
        assert_eq!(period.name, "wake");
        // Sunday night
        let (when, _) = state.next_transition_at(at((2025, 1, 12), hm(22, 30))).unwrap();
        assert_eq!(when, at((2025, 1, 13), hm(6, 30)));
        // Monday morning, same day
        let (when, period) = state.next_transition_at(at((2025, 1, 13), hm(7, 15))).unwrap();
        assert_eq!((when, period.name.as_str()), (at((2025, 1, 13), hm(8, 0)), "home"));
    }

    #[test]
    fn day_type_follows_the_calendar() {
        assert_eq!(DayType::for_date(NaiveDate::from_ymd_opt(2025, 1, 11).unwrap()), DayType::Weekend);
        assert_eq!(DayType::for_date(NaiveDate::from_ymd_opt(2025, 1, 13).unwrap()), DayType::Weekday);
    }

    #[test]
    fn last_period_cannot_be_deleted() {
        let weekday = vec![Period::new("home", hm(0, 0), 68, 75)];
        let mut state = ScheduleState::new(Mode::Manual, weekday, sample_day()).unwrap();
        assert_eq!(
            state.delete_period(DayType::Weekday, "home"),
            Err(ScheduleError::LastPeriodUndeletable { day: DayType::Weekday })
        );
        assert_eq!(state.weekday.len(), 1);
        assert!(matches!(
            state.delete_period(DayType::Weekend, "nap"),
            Err(ScheduleError::UnknownPeriod { .. })
        ));
        assert_eq!(state.delete_period(DayType::Weekend, "away").unwrap().start, hm(17, 0));
    }

    #[test]
    fn moved_starts_are_clamped_to_neighbours() {
        let mut state = sample();
        let day = DayType::Weekday;
        assert_eq!(state.set_period_start(day, "home", hm(6, 5)).unwrap(), hm(6, 15));
        assert_eq!(state.set_period_start(day, "home", hm(16, 55)).unwrap(), hm(16, 45));
        assert_eq!(state.set_period_start(day, "home", hm(9, 10)).unwrap(), hm(9, 10));
        assert_eq!(state.set_period_start(day, "sleep", hm(23, 59)).unwrap(), hm(23, 59));
        assert_eq!(state.set_period_start(day, "wake", hm(0, 0)).unwrap(), hm(0, 14));
        assert_eq!(state.periods(day)[1].start, hm(9, 10));
        assert!(state.validate().is_ok());
    }

    #[test]
    fn spacing_holds_across_midnight() {
        let mut state = sample();
        let day = DayType::Weekday;
        assert_eq!(state.set_period_start(day, "wake", hm(0, 5)).unwrap(), hm(0, 5));
        assert_eq!(state.set_period_start(day, "sleep", hm(23, 59)).unwrap(), hm(23, 50));

        let mut single = ScheduleState::new(Mode::Manual, vec![Period::new("home", hm(6, 0), 68, 75)], sample_day())
            .unwrap();
        assert_eq!(single.set_period_start(day, "home", hm(0, 0)).unwrap(), hm(0, 0));
        assert_eq!(single.set_period_start(day, "home", hm(23, 59)).unwrap(), hm(23, 59));
    }

    #[test]
    fn additions_are_validated() {
        let mut state = sample();
        let day = DayType::Weekend;
        assert!(matches!(
            state.add_period(day, Period::new("lunch", hm(8, 30), 68, 75)),
            Err(ScheduleError::DuplicateStart { .. })
        ));
        assert!(matches!(
            state.add_period(day, Period::new("overnight", hm(2, 0), 68, 75)),
            Err(ScheduleError::InvalidName(_))
        ));
        assert!(matches!(
            state.add_period(day, Period::new("lunch ", hm(12, 0), 69, 75)),
            Err(ScheduleError::InvalidName(_))
        ));
        assert!(matches!(
            state.add_period(day, Period::new("lunch", hm(12, 0), 50, 75)),
            Err(ScheduleError::SetpointOutOfRange { heat: 50, .. })
        ));

        state.add_period(day, Period::new("lunch", hm(12, 0), 69, 75)).unwrap();
        state.add_period(day, Period::new("nap", hm(14, 0), 69, 75)).unwrap();
        let names: Vec<&str> = state.periods(day).iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["wake", "home", "lunch", "nap", "away", "sleep"]);
        assert_eq!(
            state.add_period(day, Period::new("tea", hm(16, 0), 69, 75)),
            Err(ScheduleError::ScheduleFull { day })
        );
    }

    #[test]
    fn periods_serialize_with_hh_mm_starts() {
        let period = Period::new("wake", hm(6, 30), 70, 76);
        let json = serde_json::to_string(&period).unwrap();
        assert_eq!(json, r#"{"name":"wake","start":"06:30","heat":70,"cool":76}"#);
        assert_eq!(serde_json::from_str::<Period>(&json).unwrap(), period);
        assert!(serde_json::from_str::<Period>(r#"{"name":"x","start":"6h","heat":70,"cool":76}"#).is_err());
    }

    #[test]
    fn empty_program_tables_load_defaults() {
        let (engine, _) = test_engine(1);
        let schedule = ScheduleEngine::new(engine);
        let state = schedule.load().unwrap();
        assert_eq!(state, ScheduleState::default_program());
    }

    #[test]
    fn saved_program_loads_back() {
        let (engine, _) = test_engine(1);
        let schedule = ScheduleEngine::new(Arc::clone(&engine));
        let weekend = vec![
            Period::new("late", hm(9, 45), 71, 77),
            Period::new("night", hm(23, 0), 64, 79),
        ];
        let report = schedule.save_schedule(sample_day(), weekend.clone()).unwrap();
        assert!(report.is_complete(), "{:?}", report.failures().collect::<Vec<_>>());
        // weekday: 4 slots x 5 fields + 2 cleared flags; weekend: 2 x 5 + 4
        assert_eq!(report.fields.len(), 22 + 14);
        assert!(report.fields.iter().any(|f| f.day == DayType::Weekend && f.field == "p2_start"));

        let reloaded = ScheduleEngine::new(engine).load().unwrap();
        assert_eq!(reloaded.weekday, sample_day());
        assert_eq!(reloaded.weekend, weekend);
    }

    #[test]
    fn invalid_program_is_rejected_before_saving() {
        let (engine, handle) = test_engine(1);
        let schedule = ScheduleEngine::new(engine);
        assert_eq!(
            schedule.save_schedule(vec![], sample_day()),
            Err(ScheduleError::EmptyDay(DayType::Weekday))
        );
        assert_eq!(handle.requests_seen(), 0);
        assert_eq!(schedule.state(), ScheduleState::default_program());
    }

    #[test]
    fn runner_applies_each_period_once() {
        let (engine, handle) = test_engine(1);
        let schedule = ScheduleEngine::new(engine);
        let monday_morning = at((2025, 1, 6), hm(7, 0));

        assert_eq!(schedule.tick(monday_morning).unwrap(), None);
        assert_eq!(handle.requests_seen(), 0);

        schedule.set_mode(Mode::Schedule);
        let applied = schedule.tick(monday_morning).unwrap().unwrap();
        assert_eq!(applied.name, "wake");
        let comfort = handle.table(DeviceClass::Thermostat, COMFORT_PROFILE).unwrap();
        assert_eq!((comfort[25], comfort[26]), (70, 76));
        assert_eq!(schedule.mode(), Mode::Schedule);

        assert_eq!(schedule.tick(at((2025, 1, 6), hm(7, 30))).unwrap(), None);
        let applied = schedule.tick(at((2025, 1, 6), hm(8, 0))).unwrap().unwrap();
        assert_eq!(applied.name, "home");

        schedule.set_mode(Mode::Schedule);
        assert!(schedule.tick(at((2025, 1, 6), hm(8, 5))).unwrap().is_some());
    }

    #[test]
    fn edits_roll_back_on_error() {
        let (engine, _) = test_engine(1);
        let schedule = ScheduleEngine::new(engine);
        let before = schedule.state();
        let result = schedule.edit(|state| {
            state.add_period(DayType::Weekday, Period::new("lunch", hm(12, 0), 69, 75))?;
            state.delete_period(DayType::Weekday, "brunch")
        });
        assert!(result.is_err());
        assert_eq!(schedule.state(), before);
    }

    #[test]
    fn ensure_manual_switches_once() {
        let (engine, _) = test_engine(1);
        let schedule = ScheduleEngine::new(engine);
        assert!(!schedule.ensure_manual());
        schedule.set_mode(Mode::Schedule);
        assert!(schedule.ensure_manual());
        assert!(!schedule.ensure_manual());
        assert_eq!(schedule.mode(), Mode::Manual);
    }
}
