//! Port discovery and connection upkeep.
//!
//! [`LinkManager`] owns the transport and the [`SerialState`]. It is driven by
//! the link-check tick: every call rediscovers ports and reconciles the
//! selected port's presence with the current state. Open and close failures
//! never escape as errors; they end up as state.

use std::fmt;
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use crate::command::Reply;
use crate::config::DriverConfig;
use crate::protocol;
use crate::transport::{Backend, PortInfo, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SerialState {
    /// No port observed yet
    None,
    /// Selected port absent, or needs (re)connecting
    Disconnected,
    Ok,
    /// Selected port present but could not be opened
    Error,
}

impl fmt::Display for SerialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SerialState::None => "NONE",
            SerialState::Disconnected => "DISCONNECTED",
            SerialState::Ok => "OK",
            SerialState::Error => "ERROR",
        })
    }
}

/// A state change produced by a link check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { port: String, banner: Reply },
    ConnectFailed { port: String },
    Lost { port: String },
}

/// Handshake settings used when a port is opened.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub expect_banner: bool,
    pub handshake_settle: std::time::Duration,
    pub poll_interval: std::time::Duration,
}

impl From<&DriverConfig> for LinkSettings {
    fn from(config: &DriverConfig) -> Self {
        Self {
            expect_banner: config.expect_banner,
            handshake_settle: config.handshake_settle(),
            poll_interval: config.poll_interval(),
        }
    }
}

pub struct LinkManager<B> {
    backend: B,
    settings: LinkSettings,
    state: SerialState,
    selected: Option<String>,
    ports: Vec<PortInfo>,
    transport: Option<Box<dyn Transport>>,
    banner: Reply,
}

impl<B: Backend> LinkManager<B> {
    pub fn new(backend: B, settings: LinkSettings) -> Self {
        Self {
            backend,
            settings,
            state: SerialState::None,
            selected: None,
            ports: Vec::new(),
            transport: None,
            banner: Reply::default(),
        }
    }

    pub fn state(&self) -> SerialState {
        self.state
    }

    pub fn selected_port(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Ports seen by the last link check.
    pub fn ports(&self) -> &[PortInfo] {
        &self.ports
    }

    /// Lines the device printed during the last connect handshake.
    pub fn banner(&self) -> &Reply {
        &self.banner
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// The open transport, only while the link is OK.
    pub fn transport(&mut self) -> Option<&mut (dyn Transport + 'static)> {
        if self.state != SerialState::Ok {
            return None;
        }
        self.transport.as_deref_mut()
    }

    /// Enumerate ports. Enumeration failures read as "no ports".
    pub fn discover(&self) -> Vec<PortInfo> {
        match self.backend.available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("port discovery failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Reconcile the selected port with what is plugged in.
    ///
    /// Does nothing when the port list is unchanged, unless `force` is set.
    pub fn check_connection(&mut self, force: bool) -> Option<LinkEvent> {
        let ports = self.discover();
        if ports == self.ports && !force {
            return None;
        }
        debug!(
            "port list changed: {:?}",
            ports.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()
        );
        self.ports = ports;

        if self.selected.is_none() {
            if let Some(first) = self.ports.first() {
                debug!("selecting first discovered port: port={}", first.name);
                self.selected = Some(first.name.clone());
                self.state = SerialState::Disconnected;
            }
        }
        let port = self.selected.clone()?;
        let found = self.ports.iter().any(|p| p.name == port);

        match (found, self.state) {
            (false, SerialState::Ok | SerialState::Error) => {
                info!("port disappeared: port={}", port);
                self.disconnect();
                self.state = SerialState::Disconnected;
                Some(LinkEvent::Lost { port })
            }
            (true, SerialState::Disconnected) => {
                if self.connect() {
                    info!("connected: port={}", port);
                    self.state = SerialState::Ok;
                    Some(LinkEvent::Connected {
                        port,
                        banner: self.banner.clone(),
                    })
                } else {
                    self.state = SerialState::Error;
                    Some(LinkEvent::ConnectFailed { port })
                }
            }
            _ => None,
        }
    }

    /// Retarget to another port and run a forced link check. Selecting the
    /// port that is already selected does nothing.
    pub fn select_port(&mut self, port: &str) -> Option<LinkEvent> {
        if self.selected.as_deref() == Some(port) {
            return None;
        }
        info!("port selected: port={}", port);
        self.state = SerialState::Disconnected;
        self.disconnect();
        self.selected = Some(port.to_string());
        self.check_connection(true)
    }

    /// Open the selected port and read the startup banner. Never fails loudly.
    pub fn connect(&mut self) -> bool {
        let Some(port) = self.selected.clone() else {
            return false;
        };
        self.disconnect();

        let mut transport = match self.backend.open(&port) {
            Ok(t) => t,
            Err(e) => {
                warn!("failed to open port: port={}, error={}", port, e);
                return false;
            }
        };

        self.banner = Reply::default();
        if self.settings.expect_banner {
            match protocol::exchange(
                transport.as_mut(),
                "",
                self.settings.handshake_settle,
                Instant::now(),
                self.settings.poll_interval,
            ) {
                Ok(reply) => {
                    debug!("handshake banner: {:?}", reply.lines);
                    self.banner = reply;
                }
                Err(e) => {
                    warn!("handshake failed: port={}, error={}", port, e);
                    return false;
                }
            }
        }
        self.transport = Some(transport);
        true
    }

    /// Close the transport, if any. Idempotent.
    pub fn disconnect(&mut self) {
        if self.transport.take().is_some() {
            info!("port closed: port={}", self.selected.as_deref().unwrap_or("?"));
        }
    }
}

impl<B> fmt::Debug for LinkManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkManager")
            .field("state", &self.state)
            .field("selected", &self.selected)
            .field("ports", &self.ports)
            .field("open", &self.transport.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;
    use std::time::Duration;

    fn settings() -> LinkSettings {
        LinkSettings {
            expect_banner: true,
            handshake_settle: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
        }
    }

    fn manager(sim: &SimBackend) -> LinkManager<SimBackend> {
        LinkManager::new(sim.clone(), settings())
    }

    #[test]
    fn starts_in_none_with_nothing_plugged() {
        let sim = SimBackend::new();
        let mut link = manager(&sim);
        assert_eq!(link.check_connection(false), None);
        assert_eq!(link.state(), SerialState::None);
        assert_eq!(link.selected_port(), None);
    }

    #[test]
    fn first_port_is_selected_and_connected() {
        let sim = SimBackend::new();
        sim.plug("/dev/ttyACM0", "Arduino Uno").set_banner(&["INFO: ready"]);
        sim.plug("/dev/ttyACM1", "Arduino Nano");
        let mut link = manager(&sim);

        let event = link.check_connection(false);
        assert_eq!(
            event,
            Some(LinkEvent::Connected {
                port: "/dev/ttyACM0".into(),
                banner: Reply::new(vec!["INFO: ready".into()]),
            })
        );
        assert_eq!(link.state(), SerialState::Ok);
        assert!(link.transport().is_some());
        assert_eq!(link.ports().len(), 2);
    }

    #[test]
    fn unchanged_port_list_is_a_no_op() {
        let sim = SimBackend::new();
        sim.plug("/dev/ttyACM0", "Arduino Uno");
        let mut link = manager(&sim);
        assert!(link.check_connection(false).is_some());
        assert_eq!(link.check_connection(false), None);
        assert_eq!(link.state(), SerialState::Ok);
    }

    #[test]
    fn open_failure_is_reported_as_error_state() {
        let sim = SimBackend::new();
        sim.plug("/dev/ttyACM0", "Arduino Uno");
        sim.set_open_failure("/dev/ttyACM0", true);
        let mut link = manager(&sim);

        assert_eq!(
            link.check_connection(false),
            Some(LinkEvent::ConnectFailed {
                port: "/dev/ttyACM0".into()
            })
        );
        assert_eq!(link.state(), SerialState::Error);
        assert!(link.transport().is_none());

        // ERROR only leaves through the port disappearing
        sim.unplug("/dev/ttyACM0");
        assert!(matches!(link.check_connection(false), Some(LinkEvent::Lost { .. })));
        assert_eq!(link.state(), SerialState::Disconnected);
    }

    #[test]
    fn unplug_and_replug_cycles_state() {
        let sim = SimBackend::new();
        sim.plug("/dev/ttyACM0", "Arduino Uno");
        let mut link = manager(&sim);
        link.check_connection(false);

        sim.unplug("/dev/ttyACM0");
        assert_eq!(
            link.check_connection(false),
            Some(LinkEvent::Lost {
                port: "/dev/ttyACM0".into()
            })
        );
        assert_eq!(link.state(), SerialState::Disconnected);
        assert!(!link.is_open());
        assert_eq!(link.selected_port(), Some("/dev/ttyACM0"));

        sim.plug("/dev/ttyACM0", "Arduino Uno");
        assert!(matches!(link.check_connection(false), Some(LinkEvent::Connected { .. })));
        assert_eq!(link.state(), SerialState::Ok);
    }

    #[test]
    fn select_port_retargets() {
        let sim = SimBackend::new();
        sim.plug("/dev/ttyACM0", "Arduino Uno");
        sim.plug("/dev/ttyACM1", "Arduino Nano");
        let mut link = manager(&sim);
        link.check_connection(false);

        assert_eq!(link.select_port("/dev/ttyACM0"), None);
        assert_eq!(link.state(), SerialState::Ok);
        let outcome = link.select_port("/dev/ttyACM1");
        assert!(
            matches!(outcome, Some(LinkEvent::Connected { ref port, .. }) if port == "/dev/ttyACM1")
        );
        assert_eq!(link.selected_port(), Some("/dev/ttyACM1"));

        // retargeting to a missing port leaves the link disconnected
        assert_eq!(link.select_port("/dev/ttyUSB9"), None);
        assert_eq!(link.state(), SerialState::Disconnected);
        assert!(!link.is_open());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let sim = SimBackend::new();
        sim.plug("/dev/ttyACM0", "Arduino Uno");
        let mut link = manager(&sim);
        link.check_connection(false);
        link.disconnect();
        link.disconnect();
        assert!(!link.is_open());
    }
}
