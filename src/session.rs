//! The driver facade.
//!
//! A [`Session`] wires the link manager, the acquisition controller and the
//! scheduler together and is the only thing a front end talks to. It is a
//! plain state machine: nothing happens unless the caller invokes
//! [`Session::tick`] (or one of the action methods), and every observable
//! outcome is either readable through an accessor or queued as a
//! [`SessionEvent`].
//!
//! Periodic exchanges do not block. A sampling or calibration tick writes its
//! command and leaves an [`Exchange`] in flight; a later `tick` collects the
//! reply once the settle delay has passed. At most one exchange is in flight,
//! so the device always sees strict request-then-response traffic. A timer
//! that comes due while the slot is taken stays due and runs as soon as the
//! slot frees up.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::acquisition::{AcquisitionController, AcquisitionState, TickStats};
use crate::channel::Sample;
use crate::command::{Command, Reply, ReplyKind};
use crate::config::DriverConfig;
use crate::errors::{DriverError, Result};
use crate::link::{LinkEvent, LinkManager, LinkSettings, SerialState};
use crate::protocol::{self, Exchange};
use crate::scheduler::{Scheduler, Tick};
use crate::transport::{Backend, PortInfo};

/// Something a front end may want to react to. Drained with
/// [`Session::drain_events`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    PortSelected { port: String },
    Connected { port: String, banner: Vec<String> },
    ConnectFailed { port: String },
    Disconnected { port: String },
    AcquisitionHalted,
    AcquisitionResumed,
    CalibrationUpdated { true_voltage: f64, ceiling: f64 },
    TickFailed { tick: Tick, reason: String },
}

/// Result of [`Session::send_user_command`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserReply {
    pub command: String,
    pub reply: Reply,
    pub kind: ReplyKind,
    /// Set when the reply was a `TRUE_VOLTAGE` definition.
    pub true_voltage: Option<f64>,
}

/// Which actions make sense right now. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Controls {
    pub start: bool,
    pub stop: bool,
    pub clear: bool,
    pub select_channels: bool,
    pub send_command: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub index: usize,
    pub selected: bool,
    pub segment_count: usize,
    pub active: Vec<Sample>,
}

/// Everything a front end needs to redraw.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub serial_state: SerialState,
    pub acquisition_state: AcquisitionState,
    pub port: Option<String>,
    pub ports: Vec<PortInfo>,
    pub channels: Vec<ChannelSnapshot>,
    pub voltage_ceiling: f64,
    pub elapsed: Option<f64>,
    pub stats: TickStats,
    pub controls: Controls,
}

#[derive(Debug)]
enum Purpose {
    Sample { refs: Vec<usize> },
    Calibration,
}

impl Purpose {
    fn tick(&self) -> Tick {
        match self {
            Purpose::Sample { .. } => Tick::Acquisition,
            Purpose::Calibration => Tick::Calibration,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    purpose: Purpose,
    exchange: Exchange,
}

enum Outcome {
    Done,
    Deferred,
}

pub struct Session<B> {
    config: DriverConfig,
    link: LinkManager<B>,
    acquisition: AcquisitionController,
    scheduler: Scheduler,
    in_flight: Option<InFlight>,
    /// Due time of the acquisition tick last counted as deferred
    deferred_due: Option<Instant>,
    voltage_ceiling: f64,
    events: VecDeque<SessionEvent>,
}

impl<B: Backend> Session<B> {
    /// Build a session whose first link check is due immediately.
    pub fn new(backend: B, config: DriverConfig) -> Result<Self> {
        Self::new_at(backend, config, Instant::now())
    }

    /// Like [`Session::new`] with an explicit time origin for the scheduler.
    pub fn new_at(backend: B, config: DriverConfig, now: Instant) -> Result<Self> {
        config.validate()?;
        let mut scheduler = Scheduler::from_config(&config);
        scheduler.enable_immediately(Tick::LinkCheck, now);

        debug!(
            "session created: channels={}, baud={}",
            config.channel_count, config.baud_rate
        );
        Ok(Self {
            link: LinkManager::new(backend, LinkSettings::from(&config)),
            acquisition: AcquisitionController::new(config.default_selection.clone()),
            scheduler,
            in_flight: None,
            deferred_due: None,
            voltage_ceiling: config.default_voltage_ceiling,
            events: VecDeque::new(),
            config,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn link(&self) -> &LinkManager<B> {
        &self.link
    }

    pub fn acquisition(&self) -> &AcquisitionController {
        &self.acquisition
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn serial_state(&self) -> SerialState {
        self.link.state()
    }

    pub fn acquisition_state(&self) -> AcquisitionState {
        self.acquisition.state()
    }

    pub fn selected_port(&self) -> Option<&str> {
        self.link.selected_port()
    }

    pub fn ports(&self) -> &[PortInfo] {
        self.link.ports()
    }

    pub fn banner(&self) -> &Reply {
        self.link.banner()
    }

    /// Samples of the segment being recorded on `channel`.
    pub fn active_segment(&self, channel: usize) -> Option<&[Sample]> {
        self.acquisition.channel(channel).map(|c| c.active_segment())
    }

    pub fn selection(&self) -> &[bool] {
        self.acquisition.selection()
    }

    /// Suggested vertical-scale ceiling in volts.
    pub fn voltage_ceiling(&self) -> f64 {
        self.voltage_ceiling
    }

    pub fn stats(&self) -> TickStats {
        self.acquisition.stats()
    }

    /// True while a periodic exchange waits for its reply.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn controls(&self) -> Controls {
        let ok = self.link.state() == SerialState::Ok;
        let state = self.acquisition.state();
        Controls {
            start: ok && state != AcquisitionState::Running,
            stop: matches!(state, AcquisitionState::Running | AcquisitionState::Halted),
            clear: matches!(state, AcquisitionState::Stopped | AcquisitionState::Halted),
            select_channels: state != AcquisitionState::Running,
            send_command: ok,
        }
    }

    pub fn snapshot(&self, now: Instant) -> Snapshot {
        let selection = self.acquisition.selection();
        let channels = self
            .acquisition
            .channels()
            .iter()
            .enumerate()
            .map(|(index, channel)| ChannelSnapshot {
                index,
                selected: selection.get(index).copied().unwrap_or(false),
                segment_count: channel.segment_count(),
                active: channel.active_segment().to_vec(),
            })
            .collect();
        Snapshot {
            serial_state: self.link.state(),
            acquisition_state: self.acquisition.state(),
            port: self.link.selected_port().map(str::to_string),
            ports: self.link.ports().to_vec(),
            channels,
            voltage_ceiling: self.voltage_ceiling,
            elapsed: self.acquisition.elapsed(now),
            stats: self.acquisition.stats(),
            controls: self.controls(),
        }
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// When the next call to [`Session::tick`] has something to do.
    ///
    /// While an exchange is in flight only its deadline and the link check
    /// matter, since other due timers are waiting for the slot.
    pub fn next_wakeup(&self) -> Option<Instant> {
        match &self.in_flight {
            Some(pending) => {
                let deadline = pending.exchange.deadline();
                Some(match self.scheduler.next_due(Tick::LinkCheck) {
                    Some(link) => deadline.min(link),
                    None => deadline,
                })
            }
            None => self.scheduler.next_deadline(),
        }
    }

    /// Collect a finished exchange, then run every due timer.
    ///
    /// Timers are checked one by one in [`Tick::ALL`] order, so a timer
    /// enabled by an earlier one (calibration after a connect) runs in the
    /// same call.
    pub fn tick(&mut self, now: Instant) {
        self.collect_in_flight(now);
        for tick in Tick::ALL {
            if !self.scheduler.is_due(tick, now) {
                continue;
            }
            let outcome = match tick {
                Tick::LinkCheck => {
                    self.link_check(now);
                    Outcome::Done
                }
                Tick::Calibration => self.calibration_tick(now),
                Tick::Acquisition => self.acquisition_tick(now),
            };
            if let Outcome::Done = outcome {
                self.scheduler.mark_fired(tick, now);
            }
        }
    }

    /// Begin a recording run. Needs an open link.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.link.state() != SerialState::Ok {
            return Err(DriverError::NotConnected);
        }
        self.acquisition.start(now)?;
        self.scheduler.enable(Tick::Acquisition, now);
        Ok(())
    }

    /// Stop recording. A sample already in flight completes but is dropped.
    pub fn stop(&mut self) -> Result<()> {
        self.acquisition.stop()?;
        self.scheduler.disable(Tick::Acquisition);
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.acquisition.clear()
    }

    pub fn set_channel_selected(&mut self, index: usize, on: bool) -> Result<()> {
        self.acquisition.set_selected(index, on)
    }

    /// Retarget to another port. A running acquisition is stopped first and
    /// any pending exchange is allowed to finish on the old port.
    pub fn select_port(&mut self, port: &str, now: Instant) -> Result<()> {
        let port = port.trim();
        if port.is_empty() {
            return Err(DriverError::InvalidState("empty port name".into()));
        }
        if self.link.selected_port() == Some(port) {
            return Ok(());
        }
        if self.acquisition.is_running() {
            self.stop()?;
        }
        self.finish_in_flight(now);
        self.scheduler.disable(Tick::Calibration);
        self.push_event(SessionEvent::PortSelected {
            port: port.to_string(),
        });
        if let Some(event) = self.link.select_port(port) {
            self.apply_link_event(event, now);
        }
        Ok(())
    }

    /// Send a free-form command typed by a user and wait for its reply.
    pub fn send_user_command(&mut self, text: &str, now: Instant) -> Result<UserReply> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DriverError::EmptyCommand);
        }
        if self.link.state() != SerialState::Ok {
            return Err(DriverError::NotConnected);
        }
        self.finish_in_flight(now);

        let settle = self.config.command_settle();
        let poll_interval = self.config.poll_interval();
        let transport = self.link.transport().ok_or(DriverError::NotConnected)?;
        protocol::discard_input(transport)?;
        let reply = protocol::exchange(transport, text, settle, now, poll_interval)?;

        let kind = reply.classify();
        let true_voltage = reply.true_voltage();
        if let Some(v) = true_voltage {
            self.apply_true_voltage(v);
        }
        info!("user command: {:?} -> {} line(s)", text, reply.lines.len());
        Ok(UserReply {
            command: text.to_string(),
            reply,
            kind,
            true_voltage,
        })
    }

    /// Stop recording and close the port. A pending exchange is abandoned.
    pub fn shutdown(&mut self) {
        if self.acquisition.is_running() {
            let _ = self.stop();
        }
        if self.in_flight.take().is_some() {
            debug!("pending exchange abandoned at shutdown");
        }
        self.scheduler.disable(Tick::Calibration);
        self.link.disconnect();
    }

    fn link_check(&mut self, now: Instant) {
        if let Some(event) = self.link.check_connection(false) {
            self.apply_link_event(event, now);
        }
    }

    fn apply_link_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::Connected { port, banner } => {
                self.push_event(SessionEvent::Connected {
                    port,
                    banner: banner.lines,
                });
                self.scheduler.enable_immediately(Tick::Calibration, now);
                if self.acquisition.resume() {
                    self.scheduler.enable(Tick::Acquisition, now);
                    self.push_event(SessionEvent::AcquisitionResumed);
                }
            }
            LinkEvent::ConnectFailed { port } => {
                self.scheduler.disable(Tick::Calibration);
                self.push_event(SessionEvent::ConnectFailed { port });
            }
            LinkEvent::Lost { port } => {
                if self.in_flight.take().is_some() {
                    debug!("pending exchange abandoned with the link");
                }
                self.scheduler.disable(Tick::Calibration);
                if self.acquisition.halt() {
                    self.scheduler.disable(Tick::Acquisition);
                    self.push_event(SessionEvent::AcquisitionHalted);
                }
                self.push_event(SessionEvent::Disconnected { port });
            }
        }
    }

    fn acquisition_tick(&mut self, now: Instant) -> Outcome {
        if !self.acquisition.is_running() {
            return Outcome::Done;
        }
        if self.in_flight.is_some() {
            let due = self.scheduler.next_due(Tick::Acquisition);
            if self.deferred_due != due {
                self.deferred_due = due;
                self.acquisition.stats_mut().skipped_busy += 1;
                trace!("acquisition tick deferred, exchange in flight");
            }
            return Outcome::Deferred;
        }
        let request = self.acquisition.sample_request();
        let settle = self.config.sample_settle();
        self.begin(
            Purpose::Sample { refs: request.refs },
            &request.command,
            settle,
            now,
        );
        Outcome::Done
    }

    fn calibration_tick(&mut self, now: Instant) -> Outcome {
        if self.link.state() != SerialState::Ok {
            return Outcome::Done;
        }
        if self.in_flight.is_some() {
            return Outcome::Deferred;
        }
        let settle = self.config.calibration_settle();
        self.begin(Purpose::Calibration, &Command::true_voltage(), settle, now);
        Outcome::Done
    }

    fn begin(&mut self, purpose: Purpose, command: &Command, settle: Duration, now: Instant) {
        let Some(transport) = self.link.transport() else {
            return;
        };
        let started = protocol::discard_input(transport)
            .and_then(|_| Exchange::begin_command(transport, command, settle, now));
        match started {
            Ok(exchange) => {
                self.in_flight = Some(InFlight { purpose, exchange });
                // zero settle completes right away
                self.collect_in_flight(now);
            }
            Err(e) => self.tick_failed(purpose.tick(), e),
        }
    }

    fn collect_in_flight(&mut self, now: Instant) {
        let Some(mut pending) = self.in_flight.take() else {
            return;
        };
        let Some(transport) = self.link.transport() else {
            debug!("pending exchange dropped, link not ok");
            return;
        };
        match pending.exchange.poll(transport, now) {
            Ok(None) => self.in_flight = Some(pending),
            Ok(Some(reply)) => self.finish(pending.purpose, reply, now),
            Err(e) => self.tick_failed(pending.purpose.tick(), e),
        }
    }

    /// Block until the pending exchange, if any, has its reply.
    fn finish_in_flight(&mut self, now: Instant) {
        let Some(InFlight { purpose, exchange }) = self.in_flight.take() else {
            return;
        };
        let poll_interval = self.config.poll_interval();
        let Some(transport) = self.link.transport() else {
            return;
        };
        match exchange.wait(transport, now, poll_interval) {
            Ok(reply) => self.finish(purpose, reply, now),
            Err(e) => self.tick_failed(purpose.tick(), e),
        }
    }

    fn finish(&mut self, purpose: Purpose, reply: Reply, now: Instant) {
        match purpose {
            Purpose::Sample { refs } => {
                match self.acquisition.apply_sample(&reply, &refs, now) {
                    Ok(n) => trace!("sample applied: channels={}", n),
                    Err(e) => {
                        warn!("sample reply rejected: {}", e);
                        self.push_event(SessionEvent::TickFailed {
                            tick: Tick::Acquisition,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Purpose::Calibration => {
                if reply.is_empty() {
                    debug!("no calibration reply");
                    return;
                }
                match reply.true_voltage() {
                    Some(v) => self.apply_true_voltage(v),
                    None => {
                        warn!("unexpected calibration reply: {:?}", reply.lines);
                        self.push_event(SessionEvent::TickFailed {
                            tick: Tick::Calibration,
                            reason: format!("unexpected reply {:?}", reply.lines),
                        });
                    }
                }
            }
        }
    }

    fn apply_true_voltage(&mut self, true_voltage: f64) {
        let ceiling = true_voltage * self.config.voltage_headroom;
        debug!("calibration: true_voltage={}, ceiling={:.3}", true_voltage, ceiling);
        self.voltage_ceiling = ceiling;
        self.push_event(SessionEvent::CalibrationUpdated {
            true_voltage,
            ceiling,
        });
    }

    /// Transport failures are counted and reported; the link state is left
    /// to the link check.
    fn tick_failed(&mut self, tick: Tick, error: DriverError) {
        if matches!(error, DriverError::Io(_) | DriverError::Serial(_)) {
            self.acquisition.stats_mut().transport_errors += 1;
        }
        warn!("{:?} tick failed: {}", tick, error);
        self.push_event(SessionEvent::TickFailed {
            tick,
            reason: error.to_string(),
        });
    }

    fn push_event(&mut self, event: SessionEvent) {
        if self.events.len() >= self.config.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

impl<B> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("link", &self.link)
            .field("acquisition", &self.acquisition.state())
            .field("in_flight", &self.in_flight.is_some())
            .field("voltage_ceiling", &self.voltage_ceiling)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn config() -> DriverConfig {
        DriverConfig {
            handshake_settle_ms: 0,
            command_settle_ms: 0,
            poll_interval_ms: 1,
            ..DriverConfig::default()
        }
    }

    fn connected(sim: &SimBackend, t0: Instant) -> Session<SimBackend> {
        sim.plug("/dev/ttyACM0", "Arduino Uno");
        let mut session = Session::new_at(sim.clone(), config(), t0).unwrap();
        session.tick(t0);
        assert_eq!(session.serial_state(), SerialState::Ok);
        session
    }

    #[test]
    fn sampling_tick_waits_out_the_settle_delay() {
        let sim = SimBackend::new();
        let t0 = Instant::now();
        let mut session = connected(&sim, t0);
        sim.device("/dev/ttyACM0").unwrap().set_analog(0, 2.5);
        // let the first calibration round trip complete
        session.tick(t0 + ms(100));
        assert!(!session.is_busy());

        session.start(t0 + ms(100)).unwrap();
        session.tick(t0 + ms(200));
        assert!(session.is_busy());
        assert_eq!(session.next_wakeup(), Some(t0 + ms(300)));
        assert!(session.active_segment(0).unwrap().is_empty());

        session.tick(t0 + ms(300));
        let segment = session.active_segment(0).unwrap();
        assert_eq!(segment.len(), 1);
        assert_eq!(segment[0].v, 2.5);
    }

    #[test]
    fn busy_slot_defers_instead_of_dropping() {
        let sim = SimBackend::new();
        let t0 = Instant::now();
        let mut session = connected(&sim, t0);
        // calibration went out at t0 and holds the slot until t0+100ms
        assert!(session.is_busy());
        session.start(t0).unwrap();

        session.tick(t0 + ms(100));
        // calibration collected, then the due acquisition tick started
        assert!(session.is_busy());
        assert_eq!(session.stats().skipped_busy, 0);
        assert_eq!(session.voltage_ceiling(), 5.0 * 1.04);
    }

    #[test]
    fn deferred_tick_is_counted() {
        let sim = SimBackend::new();
        let t0 = Instant::now();
        let mut session = connected(&sim, t0);
        session.start(t0 - ms(100)).unwrap();
        // acquisition is due at t0 but calibration is still in flight
        session.tick(t0 + ms(50));
        assert_eq!(session.stats().skipped_busy, 1);
        assert!(session.scheduler().due(t0 + ms(50)).contains(&Tick::Acquisition));
    }

    #[test]
    fn one_deferral_is_counted_once_however_often_ticked() {
        let sim = SimBackend::new();
        let t0 = Instant::now();
        let mut session = connected(&sim, t0);
        session.start(t0 - ms(100)).unwrap();
        for n in 1..10 {
            session.tick(t0 + ms(n * 10));
        }
        assert_eq!(session.stats().skipped_busy, 1);

        // calibration reply collected, the deferred sample goes out
        session.tick(t0 + ms(100));
        assert!(session.is_busy());
        session.tick(t0 + ms(150));
        assert_eq!(session.stats().skipped_busy, 1);
    }

    #[test]
    fn pending_sample_finished_by_a_user_command_uses_the_callers_clock() {
        let sim = SimBackend::new();
        let t0 = Instant::now();
        let mut session = connected(&sim, t0);
        sim.device("/dev/ttyACM0").unwrap().set_analog(0, 1.5);
        session.tick(t0 + ms(100));
        session.start(t0 + ms(100)).unwrap();
        session.tick(t0 + ms(200));
        assert!(session.is_busy());

        // an hour of injected time later, nothing may be stamped with the wall clock
        let later = t0 + Duration::from_secs(3600);
        session.send_user_command("ping()", later).unwrap();
        let segment = session.active_segment(0).unwrap();
        assert_eq!(segment.len(), 1);
        assert!((segment[0].t - 3599.9).abs() < 1e-6);
    }

    #[test]
    fn events_are_bounded() {
        let sim = SimBackend::new();
        let t0 = Instant::now();
        let cfg = DriverConfig {
            max_events: 2,
            ..config()
        };
        sim.plug("/dev/ttyACM0", "Arduino Uno");
        sim.plug("/dev/ttyACM1", "Arduino Nano");
        let mut session = Session::new_at(sim.clone(), cfg, t0).unwrap();
        session.tick(t0);
        session.select_port("/dev/ttyACM1", t0).unwrap();
        session.select_port("/dev/ttyACM0", t0).unwrap();
        let events = session.drain_events();
        assert_eq!(events.len(), 2);
        assert!(session.drain_events().is_empty());
    }

    #[test]
    fn controls_follow_state() {
        let sim = SimBackend::new();
        let t0 = Instant::now();
        let mut session = Session::new_at(sim.clone(), config(), t0).unwrap();
        let c = session.controls();
        assert!(!c.start && !c.stop && !c.clear && !c.send_command);
        assert!(c.select_channels);

        sim.plug("/dev/ttyACM0", "Arduino Uno");
        session.tick(t0);
        session.start(t0).unwrap();
        let c = session.controls();
        assert!(!c.start && c.stop && !c.clear && !c.select_channels);
    }
}
