//! In-process stand-in for the bus: a thermostat and heat pump that answer
//! table reads and writes the way captured devices do.
//!
//! Faults can be injected through a [`SimHandle`] while the link itself is
//! owned by the transport worker.

use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::bus::BusLink;
use crate::protocol::codec::{EnergyRecord, FieldValue};
use crate::protocol::frame::{Frame, Opcode};
use crate::protocol::registry::{
    CONTROLLER, COMFORT_PROFILE, DAILY_ENERGY, DeviceClass, HEAT_PUMP_INDOOR, HEAT_PUMP_OUTDOOR, Registry,
    THERMOSTAT_SENSORS, TableId, YEARLY_ENERGY, fields,
};

const IDLE_POLL: Duration = Duration::from_millis(2);

#[derive(Default)]
struct SimState {
    tables: HashMap<(DeviceClass, TableId), Vec<u8>>,
    silenced: HashSet<(DeviceClass, TableId)>,
    corrupt_next: usize,
    truncate_next: usize,
    /// Writes ACKed but not committed, like a write outside the firmware window.
    ignore_writes: usize,
    requests_seen: usize,
    writes_seen: usize,
}

pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
    inbox: VecDeque<u8>,
    rng: Option<SmallRng>,
    /// Indoor temperature byte, nudged on reads when noise is enabled.
    indoor: Option<usize>,
}

#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedBus {
    /// Devices hold every registered table, seeded with plausible readings.
    pub fn new(registry: &Registry) -> Self {
        let mut state = SimState::default();
        for schema in registry.schemas() {
            state.tables.insert((schema.device, schema.table), vec![0; schema.len]);
        }

        let mut put = |device, table, field: &str, value: FieldValue| {
            let Ok(schema) = registry.schema_for(device, table) else { return };
            let Ok(field) = schema.field(field) else { return };
            if let (Ok(bytes), Some(data)) = (field.codec.encode(&value), state.tables.get_mut(&(device, table))) {
                data[field.range()].copy_from_slice(&bytes);
            }
        };
        use DeviceClass::{HeatPump, Thermostat};
        put(Thermostat, COMFORT_PROFILE, fields::HEAT_SETPOINT, FieldValue::Fahrenheit(68));
        put(Thermostat, COMFORT_PROFILE, fields::COOL_SETPOINT, FieldValue::Fahrenheit(76));
        put(HeatPump, HEAT_PUMP_INDOOR, fields::INDOOR_TEMP, FieldValue::Fahrenheit(71));
        put(HeatPump, HEAT_PUMP_OUTDOOR, fields::OUTDOOR_TEMP, FieldValue::Fahrenheit(45));
        put(Thermostat, THERMOSTAT_SENSORS, fields::OUTDOOR_TEMP, FieldValue::Fahrenheit(44));
        let days = [(17, 0, 10, 0), (12, 0, 4, 1), (9, 0, 0, 1)];
        for (i, (hp, cool, elec, fan)) in days.into_iter().enumerate() {
            let record = EnergyRecord::new(hp, cool, elec, fan, 0);
            put(Thermostat, DAILY_ENERGY, &fields::day(i), FieldValue::Energy(record));
        }
        for (field, kwh) in [
            (fields::YTD_HP_HEAT, 1_204),
            (fields::YTD_ELECTRIC, 311),
            (fields::YTD_COOLING, 0),
            (fields::PRIOR_COOLING, 2_087),
            (fields::PRIOR_HP_HEAT, 3_550),
            (fields::PRIOR_ELECTRIC, 640),
            (fields::PRIOR_FAN, 402),
        ] {
            put(Thermostat, YEARLY_ENERGY, field, FieldValue::Uint(kwh));
        }

        let indoor = registry
            .schema_for(HeatPump, HEAT_PUMP_INDOOR)
            .and_then(|schema| schema.field(fields::INDOOR_TEMP))
            .map(|field| field.offset)
            .ok();
        Self {
            state: Arc::new(Mutex::new(state)),
            inbox: VecDeque::new(),
            rng: None,
            indoor,
        }
    }

    /// Interleave other peers' frames with replies and let the indoor
    /// temperature wander, reproducibly.
    pub fn with_foreign_traffic(mut self, seed: u64) -> Self {
        self.rng = Some(SmallRng::seed_from_u64(seed));
        self
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn foreign_frames(rng: &mut SmallRng) -> Vec<u8> {
        let poll = Frame::read_request(
            DeviceClass::AirHandler.bus_address(),
            DeviceClass::Thermostat.bus_address(),
            TableId::new(0x00, 0x03, rng.random_range(0x01..=0x06)),
        );
        let len = rng.random_range(4..24);
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let reply = Frame::read_response(&poll, &data);

        let mut out = Vec::new();
        for frame in [poll, reply] {
            if let Ok(bytes) = frame.encode() {
                out.extend_from_slice(&bytes);
            }
        }
        out
    }

    fn respond(state: &mut SimState, request: &Frame) -> Option<Frame> {
        let device = DeviceClass::from_bus_address(request.dst)?;
        let table = request.table_id()?;
        if request.src != CONTROLLER.raw || state.silenced.contains(&(device, table)) {
            return None;
        }
        let nak = Frame::new(request.src, request.dst, Opcode::Nak, table.bytes().to_vec());

        let reply = match request.opcode {
            Opcode::Read => match state.tables.get(&(device, table)) {
                Some(data) => Frame::read_response(request, data),
                None => nak,
            },
            Opcode::Write => {
                let incoming = request.table_data().unwrap_or_default();
                let ignore = state.ignore_writes > 0;
                match state.tables.get_mut(&(device, table)) {
                    Some(data) if data.len() == incoming.len() => {
                        state.writes_seen += 1;
                        if ignore {
                            state.ignore_writes -= 1;
                        } else {
                            data.copy_from_slice(incoming);
                        }
                        Frame::new(request.src, request.dst, Opcode::Ack, vec![0x00])
                    }
                    _ => nak,
                }
            }
            _ => nak,
        };
        Some(reply)
    }
}

impl BusLink for SimulatedBus {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let Ok(request) = Frame::decode(bytes) else {
            return Ok(());
        };
        let mut state = lock(&self.state);
        state.requests_seen += 1;

        if let Some(rng) = self.rng.as_mut() {
            if rng.random_bool(0.5) {
                self.inbox.extend(Self::foreign_frames(rng));
            }
            let indoor_read = request.opcode == Opcode::Read && request.table_id() == Some(HEAT_PUMP_INDOOR);
            if let (true, Some(offset)) = (indoor_read, self.indoor) {
                if let Some(temp) = state
                    .tables
                    .get_mut(&(DeviceClass::HeatPump, HEAT_PUMP_INDOOR))
                    .and_then(|data| data.get_mut(offset))
                {
                    let step: i8 = rng.random_range(-1..=1);
                    *temp = temp.saturating_add_signed(step).clamp(64, 78);
                }
            }
        }

        let Some(reply) = Self::respond(&mut state, &request) else {
            debug!("Simulator: no reply to {:04x} -> {:04x}", request.src, request.dst);
            return Ok(());
        };
        let mut encoded = reply
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if state.corrupt_next > 0 {
            state.corrupt_next -= 1;
            let last = encoded.len() - 1;
            encoded[last] ^= 0xff;
        } else if state.truncate_next > 0 {
            state.truncate_next -= 1;
            encoded.truncate(encoded.len() - 3);
        }
        self.inbox.extend(encoded);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbox.is_empty() {
            thread::sleep(IDLE_POLL);
            return Ok(0);
        }
        let n = buf.len().min(self.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.inbox.clear();
        Ok(())
    }
}

impl SimHandle {
    pub fn table(&self, device: DeviceClass, table: TableId) -> Option<Vec<u8>> {
        lock(&self.state).tables.get(&(device, table)).cloned()
    }

    pub fn set_table(&self, device: DeviceClass, table: TableId, bytes: Vec<u8>) {
        lock(&self.state).tables.insert((device, table), bytes);
    }

    /// Stop answering for one table.
    pub fn silence(&self, device: DeviceClass, table: TableId) {
        lock(&self.state).silenced.insert((device, table));
    }

    pub fn restore(&self, device: DeviceClass, table: TableId) {
        lock(&self.state).silenced.remove(&(device, table));
    }

    pub fn corrupt_next(&self, replies: usize) {
        lock(&self.state).corrupt_next = replies;
    }

    pub fn truncate_next(&self, replies: usize) {
        lock(&self.state).truncate_next = replies;
    }

    pub fn ignore_writes(&self, writes: usize) {
        lock(&self.state).ignore_writes = writes;
    }

    pub fn requests_seen(&self) -> usize {
        lock(&self.state).requests_seen
    }

    pub fn writes_seen(&self) -> usize {
        lock(&self.state).writes_seen
    }
}

/// Engine wired to a fresh simulator with short timeouts and no pause
/// between persistence rounds.
#[cfg(test)]
pub(crate) fn test_engine(rounds: u32) -> (Arc<crate::engine::Engine>, SimHandle) {
    test_engine_paced(rounds, Duration::ZERO)
}

#[cfg(test)]
pub(crate) fn test_engine_paced(rounds: u32, interval: Duration) -> (Arc<crate::engine::Engine>, SimHandle) {
    use crate::bus::{Transport, TransportSettings};
    use crate::engine::{Engine, PersistencePolicy};

    let registry = Registry::builtin();
    let sim = SimulatedBus::new(&registry);
    let handle = sim.handle();
    let settings = TransportSettings {
        read_timeout: Duration::from_millis(30),
        max_attempts: 2,
    };
    let transport = Transport::start(sim, settings).expect("bus worker starts");
    let policy = PersistencePolicy { rounds, interval };
    (Arc::new(Engine::new(transport, Arc::new(registry), policy)), handle)
}
