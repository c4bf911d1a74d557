//! Acquisition state machine and sampling.
//!
//! ```text
//!            start                 stop
//! CLEARED ----------> RUNNING -----------> STOPPED
//!    ^                 |  ^                  |  |
//!    |        link lost|  |link back /start  |  | start
//!    |                 v  |                  |  |
//!    +---- clear ---- HALTED ---- stop ------+  +--> RUNNING
//! ```
//!
//! HALTED marks a run interrupted by link loss. Resuming from HALTED continues
//! the current segment; an explicit `start` always opens a new one.

use std::fmt;
use std::time::Instant;

use log::{debug, info};
use serde::Serialize;

use crate::channel::{ChannelBank, ChannelBuffer};
use crate::command::{Command, Reply};
use crate::errors::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AcquisitionState {
    /// No data
    Cleared,
    /// Data present, not recording
    Stopped,
    Running,
    /// Recording interrupted by link loss
    Halted,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcquisitionState::Cleared => "CLEARED",
            AcquisitionState::Stopped => "STOPPED",
            AcquisitionState::Running => "RUNNING",
            AcquisitionState::Halted => "HALTED",
        })
    }
}

/// Outcome counters for sampling ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickStats {
    /// Ticks whose reply updated the channels
    pub samples: u64,
    /// Ticks that got no reply line in time
    pub empty_replies: u64,
    pub malformed_replies: u64,
    pub transport_errors: u64,
    /// Ticks skipped because the previous exchange was still in flight
    pub skipped_busy: u64,
}

/// A sampling command plus the channels it asked for, lowest index first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRequest {
    pub command: Command,
    pub refs: Vec<usize>,
}

/// Bitmask text with channel 0 as the rightmost (least significant) digit.
pub fn channel_mask(selection: &[bool]) -> String {
    selection
        .iter()
        .rev()
        .map(|&on| if on { '1' } else { '0' })
        .collect()
}

/// Parse an `analog` reply line into values ordered by ascending channel.
///
/// The device lists the highest requested channel first and ends every value
/// with a separator, so `"1.23,3.21,"` for channels {0, 2} yields
/// `[3.21, 1.23]`. The last token is always dropped: a line missing its final
/// separator comes out one value short.
pub fn parse_sample_line(line: &str) -> Result<Vec<f64>> {
    let mut tokens: Vec<&str> = line.trim().split(',').collect();
    tokens.pop();
    let mut values = tokens
        .into_iter()
        .map(|token| {
            let token = token.trim();
            token
                .parse::<f64>()
                .map_err(|e| DriverError::Protocol(format!("bad sample value {token:?}: {e}")))
        })
        .collect::<Result<Vec<f64>>>()?;
    values.reverse();
    Ok(values)
}

/// Owns the acquisition state, the channel selection and the channel data.
#[derive(Debug)]
pub struct AcquisitionController {
    state: AcquisitionState,
    bank: ChannelBank,
    selection: Vec<bool>,
    start_time: Option<Instant>,
    stats: TickStats,
}

impl AcquisitionController {
    pub fn new(selection: Vec<bool>) -> Self {
        Self {
            state: AcquisitionState::Cleared,
            bank: ChannelBank::new(selection.len()),
            selection,
            start_time: None,
            stats: TickStats::default(),
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == AcquisitionState::Running
    }

    pub fn channels(&self) -> &ChannelBank {
        &self.bank
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelBuffer> {
        self.bank.get(index)
    }

    pub fn selection(&self) -> &[bool] {
        &self.selection
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut TickStats {
        &mut self.stats
    }

    /// Seconds since the time origin, if a run has started since the last clear.
    pub fn elapsed(&self, now: Instant) -> Option<f64> {
        self.start_time
            .map(|t0| now.saturating_duration_since(t0).as_secs_f64())
    }

    fn reject(&self, action: &'static str) -> DriverError {
        DriverError::IllegalTransition {
            from: self.state,
            action,
        }
    }

    /// Begin a new recording run.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        match self.state {
            AcquisitionState::Cleared | AcquisitionState::Stopped | AcquisitionState::Halted => {}
            AcquisitionState::Running => return Err(self.reject("start")),
        }
        if !self.bank.has_data() {
            self.start_time = Some(now);
        }
        self.bank.new_segment();
        info!(
            "acquisition started: from={}, segment={}",
            self.state,
            self.bank.segment_count()
        );
        self.state = AcquisitionState::Running;
        Ok(())
    }

    /// User-initiated stop.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            AcquisitionState::Running | AcquisitionState::Halted => {}
            AcquisitionState::Cleared | AcquisitionState::Stopped => {
                return Err(self.reject("stop"))
            }
        }
        info!("acquisition stopped: from={}", self.state);
        self.state = AcquisitionState::Stopped;
        Ok(())
    }

    /// Drop all data. Only allowed while not recording and data exists.
    pub fn clear(&mut self) -> Result<()> {
        match self.state {
            AcquisitionState::Stopped | AcquisitionState::Halted => {}
            AcquisitionState::Cleared | AcquisitionState::Running => {
                return Err(self.reject("clear"))
            }
        }
        self.bank.clear();
        self.start_time = None;
        self.state = AcquisitionState::Cleared;
        info!("acquisition cleared");
        Ok(())
    }

    /// Link lost: RUNNING becomes HALTED. Returns whether a run was interrupted.
    pub fn halt(&mut self) -> bool {
        if self.state != AcquisitionState::Running {
            return false;
        }
        info!("acquisition halted by link loss");
        self.state = AcquisitionState::Halted;
        true
    }

    /// Link back: HALTED resumes into the current segment.
    pub fn resume(&mut self) -> bool {
        if self.state != AcquisitionState::Halted {
            return false;
        }
        info!("acquisition resumed");
        self.state = AcquisitionState::Running;
        true
    }

    /// Include or exclude a channel from sampling. Not allowed mid-run.
    pub fn set_selected(&mut self, index: usize, on: bool) -> Result<()> {
        if self.state == AcquisitionState::Running {
            return Err(DriverError::InvalidState(
                "channel selection cannot change while running".into(),
            ));
        }
        let count = self.selection.len();
        let slot = self.selection.get_mut(index).ok_or_else(|| {
            DriverError::InvalidState(format!("channel {index} out of range (0..{count})"))
        })?;
        *slot = on;
        Ok(())
    }

    /// Build the sampling command for the current selection.
    pub fn sample_request(&self) -> SampleRequest {
        let refs = self
            .selection
            .iter()
            .enumerate()
            .filter_map(|(i, &on)| on.then_some(i))
            .collect();
        SampleRequest {
            command: Command::analog(&channel_mask(&self.selection)),
            refs,
        }
    }

    /// Route a sampling reply into the channels listed in `refs`.
    ///
    /// Returns how many channels were updated. An empty reply updates nothing
    /// and is not an error. A malformed reply is rejected before any channel
    /// is touched.
    pub fn apply_sample(&mut self, reply: &Reply, refs: &[usize], now: Instant) -> Result<usize> {
        if self.state != AcquisitionState::Running {
            debug!("sample reply arrived after run ended, dropped: state={}", self.state);
            return Ok(0);
        }
        let Some(line) = reply.first_line() else {
            self.stats.empty_replies += 1;
            return Ok(0);
        };
        if !reply.is_complete(0) {
            self.stats.malformed_replies += 1;
            return Err(DriverError::Protocol(format!(
                "sample reply cut off before its newline: {line:?}"
            )));
        }
        let values = match parse_sample_line(line) {
            Ok(values) if values.len() == refs.len() => values,
            Ok(values) => {
                self.stats.malformed_replies += 1;
                return Err(DriverError::Protocol(format!(
                    "expected {} values, got {} in {line:?}",
                    refs.len(),
                    values.len()
                )));
            }
            Err(e) => {
                self.stats.malformed_replies += 1;
                return Err(e);
            }
        };
        if let Some(&bad) = refs.iter().find(|&&r| r >= self.bank.len()) {
            return Err(DriverError::InvalidState(format!("channel {bad} out of range")));
        }

        let t = self.elapsed(now).unwrap_or(0.0);
        for (&channel, &value) in refs.iter().zip(&values) {
            self.bank.append(channel, t, value)?;
        }
        self.stats.samples += 1;
        Ok(refs.len())
    }
}
