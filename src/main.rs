use chrono::Local;
use infinity_bus::config::Config;
use infinity_bus::simulator::SimulatedBus;
use infinity_bus::{Engine, Mode, Registry, SerialLink, Thermostat, Transport};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (port={}, baud={}, read_timeout={}ms, max_attempts={})",
        cfg.serial_port.as_deref().unwrap_or("auto"),
        cfg.baud_rate,
        cfg.transport.read_timeout.as_millis(),
        cfg.transport.max_attempts
    );
    info!(
        "Write rounds={} every {}s, status every {}s, schedule_enabled={}, simulate={}",
        cfg.persistence.rounds,
        cfg.persistence.interval.as_secs(),
        cfg.status_interval.as_secs(),
        cfg.schedule_enabled,
        cfg.simulate
    );

    // 2) Open the bus and start the transport worker
    let registry = Arc::new(Registry::builtin());
    let transport = if cfg.simulate {
        info!("Using the simulated bus");
        let sim = SimulatedBus::new(&registry).with_foreign_traffic(rand::random());
        Transport::start(sim, cfg.transport)
    } else {
        let port = cfg
            .serial_port
            .clone()
            .or_else(SerialLink::detect_port)
            .ok_or_else(|| "No SERIAL_PORT set and no USB serial adapter found".to_string())?;
        let link = SerialLink::open(&port, cfg.baud_rate).map_err(|e| format!("{}: {}", port, e))?;
        info!("Opened {} at {} baud", port, cfg.baud_rate);
        Transport::start(link, cfg.transport)
    }
    .map_err(|e| format!("Starting bus worker failed: {}", e))?;

    // 3) Engine and controller
    let engine = Arc::new(Engine::new(transport, Arc::clone(&registry), cfg.persistence));
    let thermostat = Thermostat::new(engine, cfg.status_cache_age);

    // 4) Program from the thermostat
    match thermostat.load_schedule() {
        Ok(state) => info!(
            "Schedule loaded: {} weekday / {} weekend period(s)",
            state.weekday.len(),
            state.weekend.len()
        ),
        Err(e) => warn!("Reading the stored program failed, using defaults: {}", e),
    }
    if cfg.schedule_enabled {
        thermostat.set_mode(Mode::Schedule);
    } else {
        info!("Schedule runner disabled via SCHEDULE_ENABLED={}", cfg.schedule_enabled);
    }

    // 5) Status loop (steady cadence)
    info!("Starting status loop: interval={}s", cfg.status_interval.as_secs());
    run_loop(&thermostat, cfg.status_interval, cfg.schedule_enabled)
}

fn run_loop(thermostat: &Thermostat, interval: Duration, schedule_enabled: bool) -> Result<(), String> {
    loop {
        let tick_start = Instant::now();

        let status = thermostat.poll().map_err(|e| format!("Status poll failed: {}", e))?;
        match serde_json::to_string(&status) {
            Ok(json) => info!("Status: {}", json),
            Err(e) => warn!("Status could not be serialized: {}", e),
        }

        if schedule_enabled {
            let now = Local::now().naive_local();
            match thermostat.tick_schedule(now) {
                Ok(Some(period)) => info!(
                    "Applied {} period (heat {}, cool {})",
                    period.name, period.heat, period.cool
                ),
                Ok(None) => {}
                Err(e) => warn!("Applying the scheduled period failed, retrying next tick: {}", e),
            }
            if let Some((at, period)) = thermostat.get_schedule().next_transition_at(now) {
                debug!("Next transition: {} at {}", period.name, at.format("%a %H:%M"));
            }
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

fn main() {
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    info!(
        "infinity-bus {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
