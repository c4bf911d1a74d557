//! In-memory simulated device.
//!
//! [`SimBackend`] stands in for the host's serial ports: ports can be plugged,
//! unplugged and made to fail on open. Each port hosts a [`SimDevice`] that
//! speaks the firmware's line protocol, including its grammar checks, so the
//! whole driver can run without hardware.
//!
//! Device behaviour:
//! - on open, the configured banner lines are queued
//! - a line violating [`crate::grammar`] gets `ERROR: invalid syntax`
//! - `analog(0b<mask>)` gets one value per set bit, highest bit first, each
//!   followed by `,`
//! - `defget(NAME)` gets `NAME <value>` or `ERROR: unknown definition`
//! - any other valid command gets `WARN: unknown command`
//! - an empty line gets no reply
//!
//! Transports opened before an unplug stay dead after a replug, like a
//! stale file descriptor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::debug;

use crate::command::{CMD_ANALOG, CMD_DEFGET, DEF_TRUE_VOLTAGE};
use crate::errors::{DriverError, Result};
use crate::grammar;
use crate::transport::{Backend, PortInfo, Transport};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Device
// ============================================================================

#[derive(Debug)]
enum Scripted {
    Lines(Vec<String>),
    /// Raw text with no line ending, as if the device stalled mid-line
    Partial(String),
}

#[derive(Debug)]
struct DeviceState {
    banner: Vec<String>,
    analog: Vec<f64>,
    definitions: HashMap<String, f64>,
    /// Replies served verbatim instead of the computed ones, oldest first
    scripted: VecDeque<Scripted>,
    silent: bool,
    waveform: Option<Instant>,
    received: Vec<String>,
    input: Vec<u8>,
    output: VecDeque<u8>,
    /// Bumped on every unplug; transports of older generations are dead
    generation: u64,
}

impl DeviceState {
    fn new(channels: usize) -> Self {
        let mut definitions = HashMap::new();
        definitions.insert(DEF_TRUE_VOLTAGE.to_string(), 5.0);
        Self {
            banner: Vec::new(),
            analog: vec![0.0; channels],
            definitions,
            scripted: VecDeque::new(),
            silent: false,
            waveform: None,
            received: Vec::new(),
            input: Vec::new(),
            output: VecDeque::new(),
            generation: 0,
        }
    }

    fn emit(&mut self, line: &str) {
        self.output.extend(line.as_bytes());
        self.output.extend(b"\r\n");
    }

    fn value(&self, channel: usize) -> f64 {
        let base = self.analog.get(channel).copied().unwrap_or(0.0);
        match self.waveform {
            Some(origin) => {
                let t = origin.elapsed().as_secs_f64();
                let phase = t * 0.5 + channel as f64 * std::f64::consts::FRAC_PI_3;
                2.5 + 2.0 * phase.sin() + base
            }
            None => base,
        }
    }

    fn handle_line(&mut self, line: &str) {
        self.received.push(line.to_string());
        if line.is_empty() || self.silent {
            return;
        }
        match self.scripted.pop_front() {
            Some(Scripted::Lines(lines)) => {
                for l in lines {
                    self.emit(&l);
                }
                return;
            }
            Some(Scripted::Partial(text)) => {
                self.output.extend(text.as_bytes());
                return;
            }
            None => {}
        }

        let command = match grammar::parse(line) {
            Ok(c) => c,
            Err(e) => {
                debug!("sim rejected {:?}: {}", line, e);
                self.emit("ERROR: invalid syntax");
                return;
            }
        };
        match (command.name.as_str(), command.args.as_slice()) {
            (CMD_ANALOG, [mask]) => {
                let Some(bits) = mask
                    .strip_prefix("0b")
                    .and_then(|m| u32::from_str_radix(m, 2).ok())
                else {
                    self.emit("ERROR: invalid channel mask");
                    return;
                };
                let mut reply = String::new();
                for channel in (0..32).rev().filter(|c| bits & (1 << c) != 0) {
                    reply.push_str(&format!("{:.3},", self.value(channel)));
                }
                self.emit(&reply);
            }
            (CMD_DEFGET, [name]) => match self.definitions.get(name.as_str()) {
                Some(value) => {
                    let line = format!("{name} {value}");
                    self.emit(&line);
                }
                None => self.emit("ERROR: unknown definition"),
            },
            _ => self.emit("WARN: unknown command"),
        }
    }
}

/// Handle to a simulated device. Clones share the same device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimDevice {
    pub fn new(channels: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::new(channels))),
        }
    }

    pub fn set_banner(&self, lines: &[&str]) -> &Self {
        lock(&self.state).banner = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn set_analog(&self, channel: usize, value: f64) -> &Self {
        let mut state = lock(&self.state);
        if state.analog.len() <= channel {
            state.analog.resize(channel + 1, 0.0);
        }
        state.analog[channel] = value;
        self
    }

    pub fn set_definition(&self, name: &str, value: f64) -> &Self {
        lock(&self.state).definitions.insert(name.to_string(), value);
        self
    }

    /// Serve `lines` as the reply to the next non-empty command.
    pub fn script_reply(&self, lines: &[&str]) -> &Self {
        lock(&self.state)
            .scripted
            .push_back(Scripted::Lines(lines.iter().map(|l| l.to_string()).collect()));
        self
    }

    /// Answer the next non-empty command with `text` and no line ending.
    pub fn script_partial_reply(&self, text: &str) -> &Self {
        lock(&self.state)
            .scripted
            .push_back(Scripted::Partial(text.to_string()));
        self
    }

    /// A silent device reads commands but never answers.
    pub fn set_silent(&self, silent: bool) -> &Self {
        lock(&self.state).silent = silent;
        self
    }

    /// Replace static analog values by slow sine waves (offset by the static value).
    pub fn animate(&self) -> &Self {
        lock(&self.state).waveform = Some(Instant::now());
        self
    }

    /// Every line received so far, newline stripped.
    pub fn received(&self) -> Vec<String> {
        lock(&self.state).received.clone()
    }

    fn attach(&self) -> u64 {
        let mut state = lock(&self.state);
        state.input.clear();
        state.output.clear();
        let banner = state.banner.clone();
        for line in &banner {
            state.emit(line);
        }
        state.generation
    }

    fn detach_all(&self) {
        let mut state = lock(&self.state);
        state.generation += 1;
        state.input.clear();
        state.output.clear();
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Default)]
struct World {
    ports: Vec<PortInfo>,
    devices: HashMap<String, SimDevice>,
    open_failures: HashSet<String>,
}

/// Simulated port list. Clones share the same ports.
#[derive(Debug, Clone, Default)]
pub struct SimBackend {
    world: Arc<Mutex<World>>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device in at `name`, reusing the device previously plugged there.
    pub fn plug(&self, name: &str, description: &str) -> SimDevice {
        let mut world = lock(&self.world);
        let device = world
            .devices
            .entry(name.to_string())
            .or_insert_with(|| SimDevice::new(6))
            .clone();
        if !world.ports.iter().any(|p| p.name == name) {
            world.ports.push(PortInfo::new(name, description));
        }
        device
    }

    pub fn unplug(&self, name: &str) {
        let mut world = lock(&self.world);
        world.ports.retain(|p| p.name != name);
        if let Some(device) = world.devices.get(name) {
            device.detach_all();
        }
    }

    pub fn set_open_failure(&self, name: &str, fail: bool) {
        let mut world = lock(&self.world);
        if fail {
            world.open_failures.insert(name.to_string());
        } else {
            world.open_failures.remove(name);
        }
    }

    pub fn device(&self, name: &str) -> Option<SimDevice> {
        lock(&self.world).devices.get(name).cloned()
    }
}

impl Backend for SimBackend {
    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(lock(&self.world).ports.clone())
    }

    fn open(&self, port: &str) -> Result<Box<dyn Transport>> {
        let world = lock(&self.world);
        if world.open_failures.contains(port) {
            return Err(DriverError::Io(io::Error::new(
                ErrorKind::PermissionDenied,
                format!("{port}: access denied"),
            )));
        }
        let device = world
            .ports
            .iter()
            .any(|p| p.name == port)
            .then(|| world.devices.get(port).cloned())
            .flatten()
            .ok_or_else(|| {
                DriverError::Io(io::Error::new(
                    ErrorKind::NotFound,
                    format!("{port}: no such device"),
                ))
            })?;
        let generation = device.attach();
        Ok(Box::new(SimTransport { device, generation }))
    }
}

/// An open connection to a [`SimDevice`].
pub struct SimTransport {
    device: SimDevice,
    generation: u64,
}

impl SimTransport {
    fn live(&self) -> io::Result<MutexGuard<'_, DeviceState>> {
        let state = lock(&self.device.state);
        if state.generation != self.generation {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "device unplugged"));
        }
        Ok(state)
    }
}

impl Read for SimTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.live()?;
        let n = buf.len().min(state.output.len());
        for (slot, b) in buf.iter_mut().zip(state.output.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }
}

impl Write for SimTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.live()?;
        for &b in buf {
            if b == b'\n' {
                let raw = std::mem::take(&mut state.input);
                let line = String::from_utf8_lossy(&raw);
                state.handle_line(line.trim_end_matches('\r'));
            } else {
                state.input.push(b);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.live().map(|_| ())
    }
}

impl Transport for SimTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.live()?.output.len())
    }
}
