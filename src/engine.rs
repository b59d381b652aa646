//! Table reads, field read-modify-writes and persistence writes.
//!
//! A persistence write repeats the read-modify-write for a number of rounds
//! because the firmware only commits writes that land inside an internal
//! processing window. The verifying read afterwards is what decides the
//! outcome, not the number of rounds that went out.
//!
//! Newer requests for the same `(device, table, field)` supersede older ones.
//! Supersession is checked between rounds only. A round that has started
//! always finishes, and rounds on the same table never interleave.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::bus::{BusError, Transport};
use crate::protocol::codec::{CodecError, FieldValue};
use crate::protocol::frame::Frame;
use crate::protocol::registry::{CONTROLLER, DeviceClass, Field, Registry, RegistryError, TableId, TableSchema};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    pub device: DeviceClass,
    pub table: TableId,
    pub bytes: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl TableSnapshot {
    pub fn decode(&self, field: &Field) -> Result<FieldValue, CodecError> {
        field.codec.decode(self.bytes.get(field.range()).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistencePolicy {
    pub rounds: u32,
    /// Pause between rounds.
    pub interval: Duration,
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self {
            rounds: 6,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistPhase {
    Idle,
    Writing { round: u32 },
    Verifying,
    Committed,
    Failed,
}

impl Display for PersistPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistPhase::Writing { round } => write!(f, "writing (round {})", round),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Result of a persistence write for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldOutcome {
    Committed,
    /// A newer request for the same field took over.
    Superseded,
    /// Verifying read disagrees. `actual` is `None` when the bytes do not decode.
    Mismatch {
        expected: FieldValue,
        actual: Option<FieldValue>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Committed,
    Superseded,
}

#[derive(Debug)]
pub enum EngineError {
    Registry(RegistryError),
    Codec(CodecError),
    Bus(BusError),
    SchemaMismatch {
        device: DeviceClass,
        table: TableId,
        expected: usize,
        actual: usize,
    },
    PersistenceFailed {
        device: DeviceClass,
        table: TableId,
        field: String,
        expected: FieldValue,
        actual: Option<FieldValue>,
    },
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Registry(e) => write!(f, "{}", e),
            EngineError::Codec(e) => write!(f, "{}", e),
            EngineError::Bus(e) => write!(f, "{}", e),
            EngineError::SchemaMismatch {
                device,
                table,
                expected,
                actual,
            } => write!(
                f,
                "table {} on {} returned {} bytes, schema expects {}",
                table, device, actual, expected
            ),
            EngineError::PersistenceFailed {
                device,
                table,
                field,
                expected,
                actual,
            } => {
                write!(f, "{} {}.{} did not persist: wrote {}, read back ", device, table, field, expected)?;
                match actual {
                    Some(value) => write!(f, "{}", value),
                    None => write!(f, "undecodable bytes"),
                }
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Registry(e) => Some(e),
            EngineError::Codec(e) => Some(e),
            EngineError::Bus(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RegistryError> for EngineError {
    fn from(value: RegistryError) -> Self {
        EngineError::Registry(value)
    }
}

impl From<CodecError> for EngineError {
    fn from(value: CodecError) -> Self {
        EngineError::Codec(value)
    }
}

impl From<BusError> for EngineError {
    fn from(value: BusError) -> Self {
        EngineError::Bus(value)
    }
}

/// A field value already turned into bytes.
struct Encoded<'a> {
    field: &'a Field,
    value: FieldValue,
    bytes: Vec<u8>,
}

type FieldKey = (DeviceClass, TableId, String);
type TableKey = (DeviceClass, TableId);

pub struct Engine {
    transport: Transport,
    registry: Arc<Registry>,
    policy: PersistencePolicy,
    generations: Mutex<HashMap<FieldKey, u64>>,
    /// Held for the read and write of one round.
    table_locks: Mutex<HashMap<TableKey, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(transport: Transport, registry: Arc<Registry>, policy: PersistencePolicy) -> Self {
        Self {
            transport,
            registry,
            policy,
            generations: Mutex::new(HashMap::new()),
            table_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn policy(&self) -> PersistencePolicy {
        self.policy
    }

    pub fn read(&self, device: DeviceClass, table: TableId) -> Result<TableSnapshot, EngineError> {
        let schema = self.registry.schema_for(device, table)?;
        self.read_schema(schema)
    }

    /// Decode one named field out of a snapshot.
    pub fn field_value(&self, snapshot: &TableSnapshot, name: &str) -> Result<FieldValue, EngineError> {
        let schema = self.registry.schema_for(snapshot.device, snapshot.table)?;
        let field = self.registry.field_for(schema, name)?;
        Ok(snapshot.decode(field)?)
    }

    /// Read-modify-write of a single field; the rest of the table is written
    /// back exactly as read.
    pub fn write_field(
        &self,
        device: DeviceClass,
        table: TableId,
        field: &str,
        value: &FieldValue,
    ) -> Result<(), EngineError> {
        let schema = self.registry.schema_for(device, table)?;
        let encoded = encode(schema, &[(field, value.clone())])?;
        self.write_round(schema, &encoded, |_| true)?;
        Ok(())
    }

    /// Persistence write of one field with the configured policy.
    pub fn persistent_write(
        &self,
        device: DeviceClass,
        table: TableId,
        field: &str,
        value: &FieldValue,
    ) -> Result<PersistOutcome, EngineError> {
        let mut outcomes = self.persistent_write_fields(device, table, &[(field, value.clone())])?;
        match outcomes.pop().map(|(_, outcome)| outcome) {
            Some(FieldOutcome::Committed) => Ok(PersistOutcome::Committed),
            Some(FieldOutcome::Superseded) | None => Ok(PersistOutcome::Superseded),
            Some(FieldOutcome::Mismatch { expected, actual }) => Err(EngineError::PersistenceFailed {
                device,
                table,
                field: field.to_string(),
                expected,
                actual,
            }),
        }
    }

    /// Persistence write of several fields of one table, in lockstep.
    ///
    /// Returns one outcome per requested field, in request order. Only
    /// registry, codec and schema errors, or a failed verifying read, abort
    /// the whole batch.
    pub fn persistent_write_fields(
        &self,
        device: DeviceClass,
        table: TableId,
        writes: &[(&str, FieldValue)],
    ) -> Result<Vec<(String, FieldOutcome)>, EngineError> {
        self.persistent_write_while(device, table, writes, &|| true)
    }

    /// Like [`Engine::persistent_write_fields`], for a caller that may lose
    /// its right to write while the rounds run.
    ///
    /// `allowed` is checked atomically with claiming the fields, then again
    /// before every round and at verification. Once it turns false the
    /// remaining fields are reported as `Superseded`.
    pub fn persistent_write_while(
        &self,
        device: DeviceClass,
        table: TableId,
        writes: &[(&str, FieldValue)],
        allowed: &dyn Fn() -> bool,
    ) -> Result<Vec<(String, FieldOutcome)>, EngineError> {
        let schema = self.registry.schema_for(device, table)?;
        let encoded = encode(schema, writes)?;
        let Some(claims) = self.claim(device, table, &encoded, allowed) else {
            debug!("Persist {} {}: withdrawn before the first round", device, table);
            return Ok(encoded
                .iter()
                .map(|e| (e.field.name.clone(), FieldOutcome::Superseded))
                .collect());
        };
        let live = |i: usize| allowed() && self.is_current(device, table, &encoded[i].field.name, claims[i]);
        let trace = |phase: PersistPhase| {
            debug!("Persist {} {} ({} field(s)): {}", device, table, encoded.len(), phase)
        };

        trace(PersistPhase::Idle);
        let rounds = match self.read_schema(schema) {
            Ok(current) if encoded.iter().all(|e| holds(&current, e)) => {
                debug!("Persist {} {}: values already in place, skipping rounds", device, table);
                0
            }
            Ok(_) => self.policy.rounds,
            Err(EngineError::Bus(e)) => {
                warn!("Persist {} {}: pre-read failed, writing anyway: {}", device, table, e);
                self.policy.rounds
            }
            Err(e) => return Err(e),
        };

        for round in 1..=rounds {
            trace(PersistPhase::Writing { round });
            match self.write_round(schema, &encoded, &live) {
                Ok(0) => {
                    debug!("Persist {} {}: superseded before round {}", device, table, round);
                    break;
                }
                Ok(_) => {}
                Err(EngineError::Bus(e)) => {
                    warn!("Persist {} {}: round {}/{} failed: {}", device, table, round, rounds, e);
                }
                Err(e) => {
                    trace(PersistPhase::Failed);
                    return Err(e);
                }
            }
            if round < rounds {
                thread::sleep(self.policy.interval);
            }
        }

        trace(PersistPhase::Verifying);
        let snapshot = self.read_schema(schema).inspect_err(|_| trace(PersistPhase::Failed))?;
        let outcomes: Vec<(String, FieldOutcome)> = encoded
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let outcome = if !live(i) {
                    FieldOutcome::Superseded
                } else if holds(&snapshot, e) {
                    FieldOutcome::Committed
                } else {
                    FieldOutcome::Mismatch {
                        expected: e.value.clone(),
                        actual: snapshot.decode(e.field).ok(),
                    }
                };
                (e.field.name.clone(), outcome)
            })
            .collect();

        let failed = outcomes.iter().any(|(_, o)| matches!(o, FieldOutcome::Mismatch { .. }));
        trace(if failed { PersistPhase::Failed } else { PersistPhase::Committed });
        Ok(outcomes)
    }

    fn read_schema(&self, schema: &TableSchema) -> Result<TableSnapshot, EngineError> {
        let request = Frame::read_request(schema.device.bus_address(), CONTROLLER.raw, schema.table);
        let reply = self.transport.transact(request)?;
        let bytes = reply.table_data().unwrap_or_default();
        if bytes.len() != schema.len {
            return Err(EngineError::SchemaMismatch {
                device: schema.device,
                table: schema.table,
                expected: schema.len,
                actual: bytes.len(),
            });
        }
        Ok(TableSnapshot {
            device: schema.device,
            table: schema.table,
            bytes: bytes.to_vec(),
            fetched_at: Utc::now(),
        })
    }

    /// One read-modify-write of the fields `live` still wants. No other
    /// round on the same table runs in between. Returns how many fields
    /// went out.
    fn write_round(
        &self,
        schema: &TableSchema,
        encoded: &[Encoded],
        live: impl Fn(usize) -> bool,
    ) -> Result<usize, EngineError> {
        let lock = self.table_lock(schema);
        let _round = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let pending: Vec<&Encoded> = encoded.iter().enumerate().filter(|(i, _)| live(*i)).map(|(_, e)| e).collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let mut snapshot = self.read_schema(schema)?;
        for e in &pending {
            snapshot.bytes[e.field.range()].copy_from_slice(&e.bytes);
        }
        let request =
            Frame::write_request(schema.device.bus_address(), CONTROLLER.raw, schema.table, &snapshot.bytes);
        self.transport.transact(request)?;
        Ok(pending.len())
    }

    fn table_lock(&self, schema: &TableSchema) -> Arc<Mutex<()>> {
        let mut locks = self.table_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry((schema.device, schema.table)).or_default())
    }

    fn generations(&self) -> std::sync::MutexGuard<'_, HashMap<FieldKey, u64>> {
        self.generations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a fresh generation for every field, unless `allowed` says no.
    fn claim(
        &self,
        device: DeviceClass,
        table: TableId,
        encoded: &[Encoded],
        allowed: &dyn Fn() -> bool,
    ) -> Option<Vec<u64>> {
        let mut generations = self.generations();
        if !allowed() {
            return None;
        }
        let claims = encoded
            .iter()
            .map(|e| {
                let generation = generations.entry((device, table, e.field.name.clone())).or_insert(0);
                *generation += 1;
                *generation
            })
            .collect();
        Some(claims)
    }

    fn is_current(&self, device: DeviceClass, table: TableId, field: &str, claim: u64) -> bool {
        self.generations().get(&(device, table, field.to_string())) == Some(&claim)
    }
}

fn encode<'a>(schema: &'a TableSchema, writes: &[(&str, FieldValue)]) -> Result<Vec<Encoded<'a>>, EngineError> {
    writes
        .iter()
        .map(|(name, value)| -> Result<Encoded<'a>, EngineError> {
            let field = schema.field(name)?;
            let bytes = field.codec.encode(value)?;
            Ok(Encoded {
                field,
                value: value.clone(),
                bytes,
            })
        })
        .collect()
}

fn holds(snapshot: &TableSnapshot, e: &Encoded) -> bool {
    snapshot.bytes.get(e.field.range()) == Some(&e.bytes[..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TransportSettings;
    use crate::protocol::registry::{COMFORT_PROFILE, DAILY_ENERGY, fields};
    use crate::simulator::{SimHandle, SimulatedBus};

    fn engine_with(rounds: u32, interval: Duration, max_attempts: u32) -> (Arc<Engine>, SimHandle) {
        let registry = Registry::builtin();
        let sim = SimulatedBus::new(&registry);
        let handle = sim.handle();
        let settings = TransportSettings {
            read_timeout: Duration::from_millis(50),
            max_attempts,
        };
        let transport = Transport::start(sim, settings).unwrap();
        let policy = PersistencePolicy { rounds, interval };
        (Arc::new(Engine::new(transport, Arc::new(registry), policy)), handle)
    }

    fn engine(rounds: u32) -> (Arc<Engine>, SimHandle) {
        engine_with(rounds, Duration::ZERO, 2)
    }

    fn comfort(handle: &SimHandle) -> Vec<u8> {
        handle.table(DeviceClass::Thermostat, COMFORT_PROFILE).unwrap()
    }

    #[test]
    fn reads_table_and_decodes_fields() {
        let (engine, _) = engine(1);
        let snapshot = engine.read(DeviceClass::Thermostat, COMFORT_PROFILE).unwrap();
        assert_eq!(snapshot.bytes.len(), 64);
        assert_eq!(
            engine.field_value(&snapshot, fields::HEAT_SETPOINT).unwrap(),
            FieldValue::Fahrenheit(68)
        );
        let daily = engine.read(DeviceClass::Thermostat, DAILY_ENERGY).unwrap();
        let day0 = engine.field_value(&daily, &fields::day(0)).unwrap();
        assert_eq!(day0.as_energy().unwrap().total_kwh, 27);
    }

    #[test]
    fn wrong_length_is_schema_mismatch() {
        let (engine, handle) = engine(1);
        handle.set_table(DeviceClass::Thermostat, COMFORT_PROFILE, vec![0; 60]);
        match engine.read(DeviceClass::Thermostat, COMFORT_PROFILE) {
            Err(EngineError::SchemaMismatch {
                expected: 64,
                actual: 60,
                ..
            }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_table_and_bad_value_fail_before_bus_traffic() {
        let (engine, handle) = engine(1);
        assert!(matches!(
            engine.read(DeviceClass::AirHandler, COMFORT_PROFILE),
            Err(EngineError::Registry(RegistryError::UnknownTable { .. }))
        ));
        assert!(matches!(
            engine.write_field(
                DeviceClass::Thermostat,
                COMFORT_PROFILE,
                fields::HEAT_SETPOINT,
                &FieldValue::Uint(70)
            ),
            Err(EngineError::Codec(_))
        ));
        assert!(matches!(
            engine.write_field(DeviceClass::Thermostat, COMFORT_PROFILE, "fan_mode", &FieldValue::Uint(1)),
            Err(EngineError::Registry(RegistryError::UnknownField { .. }))
        ));
        assert_eq!(handle.requests_seen(), 0);
    }

    #[test]
    fn write_field_touches_only_its_byte() {
        let (engine, handle) = engine(1);
        let before: Vec<u8> = (0..64u32).map(|i| (i * 37 + 11) as u8).collect();
        handle.set_table(DeviceClass::Thermostat, COMFORT_PROFILE, before.clone());

        engine
            .write_field(
                DeviceClass::Thermostat,
                COMFORT_PROFILE,
                fields::HEAT_SETPOINT,
                &FieldValue::Fahrenheit(72),
            )
            .unwrap();

        let after = comfort(&handle);
        for (i, (old, new)) in before.iter().zip(&after).enumerate() {
            if i == 25 {
                assert_eq!(*new, 72);
            } else {
                assert_eq!(old, new, "byte {} changed", i);
            }
        }
    }

    #[test]
    fn persisting_the_current_value_changes_nothing() {
        let (engine, handle) = engine(6);
        let before = comfort(&handle);
        let outcome = engine
            .persistent_write(
                DeviceClass::Thermostat,
                COMFORT_PROFILE,
                fields::HEAT_SETPOINT,
                &FieldValue::Fahrenheit(68),
            )
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Committed);
        assert_eq!(comfort(&handle), before);
        assert_eq!(handle.writes_seen(), 0);
    }

    #[test]
    fn repeated_rounds_land_inside_the_window() {
        let (engine, handle) = engine(6);
        handle.ignore_writes(3);
        let outcome = engine
            .persistent_write(
                DeviceClass::Thermostat,
                COMFORT_PROFILE,
                fields::COOL_SETPOINT,
                &FieldValue::Fahrenheit(74),
            )
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Committed);
        assert_eq!(comfort(&handle)[26], 74);
        assert_eq!(comfort(&handle)[25], 68);
        assert_eq!(handle.writes_seen(), 6);
    }

    #[test]
    fn verification_mismatch_is_persistence_failed() {
        let (engine, handle) = engine(2);
        handle.ignore_writes(10);
        match engine.persistent_write(
            DeviceClass::Thermostat,
            COMFORT_PROFILE,
            fields::HEAT_SETPOINT,
            &FieldValue::Fahrenheit(74),
        ) {
            Err(EngineError::PersistenceFailed { field, expected, actual, .. }) => {
                assert_eq!(field, fields::HEAT_SETPOINT);
                assert_eq!(expected, FieldValue::Fahrenheit(74));
                assert_eq!(actual, Some(FieldValue::Fahrenheit(68)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unresponsive_rounds_are_tolerated() {
        let (engine, handle) = engine_with(3, Duration::ZERO, 2);
        // pre-read and the first round's read both exhaust their attempts
        handle.corrupt_next(4);
        let outcome = engine
            .persistent_write(
                DeviceClass::Thermostat,
                COMFORT_PROFILE,
                fields::HEAT_SETPOINT,
                &FieldValue::Fahrenheit(70),
            )
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Committed);
        assert_eq!(handle.writes_seen(), 2);
    }

    #[test]
    fn batch_reports_each_field() {
        let (engine, handle) = engine(2);
        let outcomes = engine
            .persistent_write_fields(
                DeviceClass::Thermostat,
                COMFORT_PROFILE,
                &[
                    (fields::HEAT_SETPOINT, FieldValue::Fahrenheit(66)),
                    (fields::COOL_SETPOINT, FieldValue::Fahrenheit(79)),
                ],
            )
            .unwrap();
        assert_eq!(
            outcomes,
            vec![
                (fields::HEAT_SETPOINT.to_string(), FieldOutcome::Committed),
                (fields::COOL_SETPOINT.to_string(), FieldOutcome::Committed),
            ]
        );
        assert_eq!((comfort(&handle)[25], comfort(&handle)[26]), (66, 79));
    }

    #[test]
    fn concurrent_writes_to_one_table_keep_both_fields() {
        for run in 0..20u8 {
            let (engine, handle) = engine(1);
            let (heat, cool) = (56 + run % 10, 61 + run % 10);
            let heat_writer = {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    engine.persistent_write(
                        DeviceClass::Thermostat,
                        COMFORT_PROFILE,
                        fields::HEAT_SETPOINT,
                        &FieldValue::Fahrenheit(heat),
                    )
                })
            };
            let cool_outcome = engine.persistent_write(
                DeviceClass::Thermostat,
                COMFORT_PROFILE,
                fields::COOL_SETPOINT,
                &FieldValue::Fahrenheit(cool),
            );

            assert_eq!(heat_writer.join().unwrap().unwrap(), PersistOutcome::Committed, "run {}", run);
            assert_eq!(cool_outcome.unwrap(), PersistOutcome::Committed, "run {}", run);
            assert_eq!((comfort(&handle)[25], comfort(&handle)[26]), (heat, cool), "run {}", run);
        }
    }

    #[test]
    fn withdrawn_writer_stops_between_rounds() {
        let (engine, handle) = engine_with(4, Duration::from_millis(100), 2);
        handle.ignore_writes(10);
        let allowed = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let writer = {
            let (engine, allowed) = (Arc::clone(&engine), Arc::clone(&allowed));
            thread::spawn(move || {
                engine.persistent_write_while(
                    DeviceClass::Thermostat,
                    COMFORT_PROFILE,
                    &[(fields::COOL_SETPOINT, FieldValue::Fahrenheit(80))],
                    &|| allowed.load(std::sync::atomic::Ordering::SeqCst),
                )
            })
        };
        while handle.writes_seen() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        allowed.store(false, std::sync::atomic::Ordering::SeqCst);

        let outcomes = writer.join().unwrap().unwrap();
        assert_eq!(outcomes, vec![(fields::COOL_SETPOINT.to_string(), FieldOutcome::Superseded)]);
        assert_eq!(handle.writes_seen(), 1);

        let refused = engine
            .persistent_write_while(
                DeviceClass::Thermostat,
                COMFORT_PROFILE,
                &[(fields::COOL_SETPOINT, FieldValue::Fahrenheit(80))],
                &|| false,
            )
            .unwrap();
        assert_eq!(refused[0].1, FieldOutcome::Superseded);
        assert_eq!(handle.writes_seen(), 1);
    }

    #[test]
    fn newer_request_supersedes_older() {
        let (engine, handle) = engine_with(3, Duration::from_millis(60), 2);
        let older = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine.persistent_write(
                    DeviceClass::Thermostat,
                    COMFORT_PROFILE,
                    fields::HEAT_SETPOINT,
                    &FieldValue::Fahrenheit(74),
                )
            })
        };
        thread::sleep(Duration::from_millis(20));
        let newer = engine
            .persistent_write(
                DeviceClass::Thermostat,
                COMFORT_PROFILE,
                fields::HEAT_SETPOINT,
                &FieldValue::Fahrenheit(75),
            )
            .unwrap();

        assert_eq!(older.join().unwrap().unwrap(), PersistOutcome::Superseded);
        assert_eq!(newer, PersistOutcome::Committed);
        assert_eq!(comfort(&handle)[25], 75);
    }
}
