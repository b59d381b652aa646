//! Half-duplex link ownership and request/response exchange.
//!
//! - One worker thread owns the link; callers queue frames and block on a
//!   reply channel, so exactly one exchange is on the wire at a time.
//! - Corrupt, truncated, rejected and timed-out attempts are retried as-is
//!   without backoff; exhausting the budget yields `DeviceUnresponsive`.
//! - Frames between other peers are skipped without eating the read timeout.

use log::{debug, warn};
use serialport::{ClearBuffer, DataBits, Parity, SerialPortType, StopBits};
use std::fmt::{Display, Formatter};
use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::protocol::frame::{self, Frame, FrameError, MIN_FRAME_LEN, Opcode};

pub const DEFAULT_BAUD_RATE: u32 = 38_400;
/// How long a single `receive` may block before reporting an idle line.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Foreign traffic may stretch one attempt to at most this many read timeouts.
const MAX_DEADLINE_STRETCH: u32 = 4;

/// Byte pipe to the bus.
pub trait BusLink: Send {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Whatever arrived within one poll interval; `Ok(0)` on an idle line.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn discard_input(&mut self) -> io::Result<()>;
}

pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, BusError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(BusError::Open)?;
        Ok(Self { port })
    }

    /// First USB serial adapter, if any.
    pub fn detect_port() -> Option<String> {
        let ports = serialport::available_ports().ok()?;
        ports
            .into_iter()
            .find(|p| matches!(p.port_type, SerialPortType::UsbPort(_)) || p.port_name.to_lowercase().contains("usb"))
            .map(|p| p.port_name)
    }
}

impl BusLink for SerialLink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// Per attempt.
    pub read_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

/// Why a single attempt did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    Frame(FrameError),
    Timeout,
    /// Device answered with NAK.
    Rejected,
}

impl Display for AttemptFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Frame(e) => write!(f, "{}", e),
            AttemptFailure::Timeout => write!(f, "read timeout"),
            AttemptFailure::Rejected => write!(f, "device replied NAK"),
        }
    }
}

#[derive(Debug)]
pub enum BusError {
    Open(serialport::Error),
    Io(io::Error),
    /// Request could not be framed.
    Frame(FrameError),
    DeviceUnresponsive {
        device: u16,
        attempts: u32,
        last: AttemptFailure,
    },
    /// The worker is gone.
    Closed,
}

impl Display for BusError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Open(e) => write!(f, "cannot open serial port: {}", e),
            BusError::Io(e) => write!(f, "bus i/o error: {}", e),
            BusError::Frame(e) => write!(f, "cannot frame request: {}", e),
            BusError::DeviceUnresponsive { device, attempts, last } => write!(
                f,
                "device {:04x} unresponsive after {} attempt(s), last: {}",
                device, attempts, last
            ),
            BusError::Closed => write!(f, "bus worker stopped"),
        }
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BusError::Open(e) => Some(e),
            BusError::Io(e) => Some(e),
            BusError::Frame(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BusError {
    fn from(value: io::Error) -> Self {
        BusError::Io(value)
    }
}

struct Job {
    request: Frame,
    reply: mpsc::Sender<Result<Frame, BusError>>,
}

/// Handle to the bus worker. Cheap to clone; every clone feeds the same queue.
#[derive(Clone)]
pub struct Transport {
    jobs: mpsc::Sender<Job>,
}

impl Transport {
    pub fn start<L: BusLink + 'static>(link: L, settings: TransportSettings) -> Result<Self, BusError> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let worker = Worker { link, settings };
        thread::Builder::new()
            .name("bus-worker".into())
            .spawn(move || worker.run(queue))?;
        Ok(Self { jobs })
    }

    /// Send `request` and wait for the device's reply.
    pub fn transact(&self, request: Frame) -> Result<Frame, BusError> {
        let (reply, response) = mpsc::channel();
        self.jobs.send(Job { request, reply }).map_err(|_| BusError::Closed)?;
        response.recv().map_err(|_| BusError::Closed)?
    }
}

struct Worker<L> {
    link: L,
    settings: TransportSettings,
}

enum AttemptError {
    Io(io::Error),
    Failed(AttemptFailure),
}

impl From<io::Error> for AttemptError {
    fn from(value: io::Error) -> Self {
        AttemptError::Io(value)
    }
}

impl<L: BusLink> Worker<L> {
    fn run(mut self, queue: mpsc::Receiver<Job>) {
        for job in queue {
            let result = self.exchange(&job.request);
            // caller may have given up; nothing to do then
            let _ = job.reply.send(result);
        }
        debug!("Bus worker: queue closed, stopping");
    }

    fn exchange(&mut self, request: &Frame) -> Result<Frame, BusError> {
        let bytes = request.encode().map_err(BusError::Frame)?;
        let attempts = self.settings.max_attempts.max(1);
        let mut last = AttemptFailure::Timeout;
        for attempt in 1..=attempts {
            match self.attempt(request, &bytes) {
                Ok(reply) => {
                    debug!(
                        "Bus: {:04x} -> {:04x} {:?} answered on attempt {} ({} payload bytes)",
                        request.src,
                        request.dst,
                        request.opcode,
                        attempt,
                        reply.payload.len()
                    );
                    return Ok(reply);
                }
                Err(AttemptError::Io(e)) => return Err(BusError::Io(e)),
                Err(AttemptError::Failed(failure)) => {
                    debug!(
                        "Bus: attempt {}/{} to {:04x} failed: {}",
                        attempt, attempts, request.dst, failure
                    );
                    last = failure;
                }
            }
        }
        warn!("Bus: device {:04x} gave no usable reply in {} attempt(s): {}", request.dst, attempts, last);
        Err(BusError::DeviceUnresponsive {
            device: request.dst,
            attempts,
            last,
        })
    }

    fn attempt(&mut self, request: &Frame, bytes: &[u8]) -> Result<Frame, AttemptError> {
        self.link.discard_input()?;
        self.link.send(bytes)?;

        let timeout = self.settings.read_timeout;
        let started = Instant::now();
        let hard_stop = started + timeout * MAX_DEADLINE_STRETCH;
        let mut deadline = started + timeout;
        let mut captured = Vec::with_capacity(256);
        let mut chunk = [0u8; 256];

        loop {
            let scan = scan_for_reply(&mut captured, request);
            if scan.skipped > 0 {
                deadline = (Instant::now() + timeout).min(hard_stop).max(deadline);
            }
            match scan.outcome {
                Outcome::Reply(reply) if reply.opcode == Opcode::Nak => {
                    return Err(AttemptError::Failed(AttemptFailure::Rejected));
                }
                Outcome::Reply(reply) => return Ok(reply),
                Outcome::Bad(e) => return Err(AttemptError::Failed(AttemptFailure::Frame(e))),
                Outcome::Waiting { partial } => {
                    if Instant::now() >= deadline {
                        let failure = match partial {
                            Some((declared, captured)) => {
                                AttemptFailure::Frame(FrameError::Truncated { declared, captured })
                            }
                            None => AttemptFailure::Timeout,
                        };
                        return Err(AttemptError::Failed(failure));
                    }
                }
            }

            let n = self.link.receive(&mut chunk)?;
            captured.extend_from_slice(&chunk[..n]);
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Reply(Frame),
    /// A frame carrying our reply header failed validation.
    Bad(FrameError),
    /// `partial` holds (declared, captured) when our reply has started arriving.
    Waiting { partial: Option<(usize, usize)> },
}

#[derive(Debug)]
struct Scan {
    outcome: Outcome,
    /// Complete frames between other peers consumed by this scan.
    skipped: usize,
}

/// Look through `buf` for the reply to `request`, consuming what was examined.
fn scan_for_reply(buf: &mut Vec<u8>, request: &Frame) -> Scan {
    let anchor = request.reply_anchor();
    let mut skipped = 0;
    let mut pos = 0;

    let outcome = loop {
        let rest = &buf[pos..];
        if rest.len() < MIN_FRAME_LEN {
            break Outcome::Waiting { partial: None };
        }
        let declared = frame::declared_len(rest).unwrap_or(MIN_FRAME_LEN);

        if rest[..4] == anchor {
            if rest.len() < declared {
                break Outcome::Waiting {
                    partial: Some((declared, rest.len())),
                };
            }
            match Frame::decode(&rest[..declared]) {
                Ok(reply) if reply.answers(request) => {
                    pos += declared;
                    break Outcome::Reply(reply);
                }
                // stale reply to an earlier request
                Ok(_) => pos += declared,
                Err(e) => {
                    pos += declared;
                    break Outcome::Bad(e);
                }
            }
            continue;
        }

        if rest.len() >= declared {
            if Frame::decode(&rest[..declared]).is_ok() {
                skipped += 1;
                pos += declared;
            } else {
                pos += 1;
            }
        } else if frame::plausible_header(rest) {
            // another peer's frame still arriving
            break Outcome::Waiting { partial: None };
        } else {
            pos += 1;
        }
    };

    buf.drain(..pos);
    Scan { outcome, skipped }
}
