//! Cooperative periodic timers.
//!
//! Three timers (acquisition, link check, calibration) share one thread. The
//! scheduler never runs anything itself: callers ask which timers are due,
//! run them to completion, then mark them fired, which schedules the next
//! occurrence one interval after completion. A timer can therefore never
//! overlap with itself. Disabling a timer keeps its interval.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::DriverConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tick {
    LinkCheck,
    Calibration,
    Acquisition,
}

impl Tick {
    /// Order in which simultaneously due ticks run.
    pub const ALL: [Tick; 3] = [Tick::LinkCheck, Tick::Calibration, Tick::Acquisition];

    fn slot(self) -> usize {
        match self {
            Tick::LinkCheck => 0,
            Tick::Calibration => 1,
            Tick::Acquisition => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct Timer {
    interval: Duration,
    next_due: Option<Instant>,
}

impl Timer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    timers: [Timer; 3],
}

impl Scheduler {
    /// All timers start disabled.
    pub fn new(link_check: Duration, acquisition: Duration, calibration: Duration) -> Self {
        Self {
            timers: [
                Timer::new(link_check),
                Timer::new(calibration),
                Timer::new(acquisition),
            ],
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(
            config.link_check_interval(),
            config.acquisition_interval(),
            config.calibration_interval(),
        )
    }

    fn timer(&self, tick: Tick) -> &Timer {
        &self.timers[tick.slot()]
    }

    fn timer_mut(&mut self, tick: Tick) -> &mut Timer {
        &mut self.timers[tick.slot()]
    }

    pub fn interval(&self, tick: Tick) -> Duration {
        self.timer(tick).interval
    }

    pub fn is_enabled(&self, tick: Tick) -> bool {
        self.timer(tick).next_due.is_some()
    }

    pub fn next_due(&self, tick: Tick) -> Option<Instant> {
        self.timer(tick).next_due
    }

    /// Enable a timer with its first firing one interval from `now`.
    /// Enabling an already enabled timer keeps its schedule.
    pub fn enable(&mut self, tick: Tick, now: Instant) {
        let timer = self.timer_mut(tick);
        if timer.next_due.is_none() {
            timer.next_due = Some(now + timer.interval);
        }
    }

    /// Enable a timer so that it fires at `now`.
    pub fn enable_immediately(&mut self, tick: Tick, now: Instant) {
        self.timer_mut(tick).next_due = Some(now);
    }

    pub fn disable(&mut self, tick: Tick) {
        self.timer_mut(tick).next_due = None;
    }

    pub fn is_due(&self, tick: Tick, now: Instant) -> bool {
        matches!(self.timer(tick).next_due, Some(due) if due <= now)
    }

    /// Enabled timers whose deadline is at or before `now`, in [`Tick::ALL`] order.
    pub fn due(&self, now: Instant) -> Vec<Tick> {
        Tick::ALL
            .into_iter()
            .filter(|&t| self.is_due(t, now))
            .collect()
    }

    /// Record that `tick` finished at `now`. A timer disabled while it ran stays disabled.
    pub fn mark_fired(&mut self, tick: Tick, now: Instant) {
        let timer = self.timer_mut(tick);
        if timer.next_due.is_some() {
            timer.next_due = Some(now + timer.interval);
        }
    }

    /// Earliest deadline of any enabled timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().filter_map(|t| t.next_due).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(ms(500), ms(100), ms(10_000))
    }

    #[test]
    fn starts_idle() {
        let s = scheduler();
        assert!(s.due(Instant::now() + ms(60_000)).is_empty());
        assert_eq!(s.next_deadline(), None);
    }

    #[test]
    fn fires_on_interval_after_completion() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.enable(Tick::Acquisition, t0);
        assert!(s.due(t0 + ms(99)).is_empty());
        assert_eq!(s.due(t0 + ms(100)), vec![Tick::Acquisition]);

        // a slow tick pushes the next deadline out instead of piling up
        s.mark_fired(Tick::Acquisition, t0 + ms(350));
        assert!(s.due(t0 + ms(400)).is_empty());
        assert_eq!(s.next_due(Tick::Acquisition), Some(t0 + ms(450)));
    }

    #[test]
    fn due_ticks_come_back_in_fixed_order() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.enable_immediately(Tick::Calibration, t0);
        s.enable_immediately(Tick::Acquisition, t0);
        s.enable_immediately(Tick::LinkCheck, t0);
        assert_eq!(s.due(t0), Tick::ALL.to_vec());
    }

    #[test]
    fn disable_keeps_timer_off_even_if_marked() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.enable(Tick::Acquisition, t0);
        s.disable(Tick::Acquisition);
        s.mark_fired(Tick::Acquisition, t0);
        assert!(!s.is_enabled(Tick::Acquisition));
        assert_eq!(s.interval(Tick::Acquisition), ms(100));
    }

    #[test]
    fn re_enabling_does_not_reset_schedule() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.enable(Tick::LinkCheck, t0);
        s.enable(Tick::LinkCheck, t0 + ms(400));
        assert_eq!(s.next_deadline(), Some(t0 + ms(500)));
    }
}
