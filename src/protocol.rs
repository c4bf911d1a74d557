//! Request/response exchange over a line transport.
//!
//! An exchange writes one command line, waits a fixed settle delay sized per
//! command class, then hands back every line the device produced meanwhile.
//! Zero lines is a valid outcome ("no data yet"), never an error.
//!
//! [`Exchange`] is the non-blocking form: `begin` writes and records a
//! deadline, `poll` drains whatever bytes are buffered and yields the reply
//! once the deadline has passed. Periodic ticks use it so a settle delay never
//! stalls the caller. [`exchange`] is the blocking convenience built on top,
//! used for the connect handshake and interactive commands.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::command::{Command, Reply};
use crate::errors::Result;
use crate::transport::Transport;

/// Upper bound on read calls per drain, so a device streaming without pause
/// cannot pin the caller.
const MAX_DRAIN_READS: usize = 64;

/// Smallest sleep slice used while waiting for a deadline
const MIN_POLL_SLICE: Duration = Duration::from_millis(1);

/// Accumulates bytes and splits them into lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    lines: Vec<String>,
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                let raw = std::mem::take(&mut self.partial);
                self.complete(&raw);
            } else {
                self.partial.push(b);
            }
        }
    }

    fn complete(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches('\r');
        if !line.is_empty() {
            self.lines.push(line.to_string());
        }
    }

    /// Bytes of a line whose newline has not arrived yet.
    pub fn has_partial(&self) -> bool {
        !self.partial.iter().all(|&b| b == b'\r')
    }

    /// Take all lines, including a trailing line that never got its newline.
    pub fn finish(&mut self) -> Vec<String> {
        let raw = std::mem::take(&mut self.partial);
        self.complete(&raw);
        std::mem::take(&mut self.lines)
    }
}

/// Read everything the transport has buffered right now into `buffer`.
/// Returns the number of bytes read.
pub fn drain_available(transport: &mut dyn Transport, buffer: &mut LineBuffer) -> Result<usize> {
    let mut total = 0usize;
    for _ in 0..MAX_DRAIN_READS {
        let available = transport.bytes_available()?;
        if available == 0 {
            break;
        }
        let mut chunk = vec![0u8; available];
        match transport.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.push(&chunk[..n]);
                total += n;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

/// Drop any pending input, e.g. a late reply to an earlier command.
pub fn discard_input(transport: &mut dyn Transport) -> Result<usize> {
    let mut scratch = LineBuffer::new();
    let n = drain_available(transport, &mut scratch)?;
    if n > 0 {
        debug!("discarded stale input: bytes={}, lines={:?}", n, scratch.finish());
    }
    Ok(n)
}

/// A command that has been written and is waiting out its settle delay.
#[derive(Debug)]
pub struct Exchange {
    line: String,
    deadline: Instant,
    buffer: LineBuffer,
}

impl Exchange {
    /// Write `line` (newline appended) and start the settle window at `now`.
    pub fn begin(
        transport: &mut dyn Transport,
        line: &str,
        settle: Duration,
        now: Instant,
    ) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        let mut wire = Vec::with_capacity(line.len() + 1);
        wire.extend_from_slice(line.as_bytes());
        wire.push(b'\n');
        transport.write_all(&wire)?;
        transport.flush()?;
        trace!("command sent: {:?}, settle={:?}", line, settle);

        Ok(Self {
            line,
            deadline: now + settle,
            buffer: LineBuffer::new(),
        })
    }

    pub fn begin_command(
        transport: &mut dyn Transport,
        command: &Command,
        settle: Duration,
        now: Instant,
    ) -> Result<Self> {
        Self::begin(transport, &command.to_string(), settle, now)
    }

    /// The line that was sent, without its newline.
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Drain buffered input; once `now` reaches the deadline, return the reply.
    pub fn poll(&mut self, transport: &mut dyn Transport, now: Instant) -> Result<Option<Reply>> {
        drain_available(transport, &mut self.buffer)?;
        if !self.is_due(now) {
            return Ok(None);
        }
        let cut_off = self.buffer.has_partial();
        let reply = Reply::new(self.buffer.finish()).with_cut_off(cut_off);
        trace!("reply to {:?}: {:?}", self.line, reply.lines);
        Ok(Some(reply))
    }

    /// Block until the deadline, polling every `poll_interval`.
    ///
    /// `now` is the caller's clock; only the time left until the deadline as
    /// seen from `now` is actually slept, so injected instants work too.
    pub fn wait(
        mut self,
        transport: &mut dyn Transport,
        now: Instant,
        poll_interval: Duration,
    ) -> Result<Reply> {
        let slice = poll_interval.max(MIN_POLL_SLICE);
        let started = Instant::now();
        loop {
            let clock = now + started.elapsed();
            if let Some(reply) = self.poll(transport, clock)? {
                return Ok(reply);
            }
            std::thread::sleep(self.deadline.saturating_duration_since(clock).min(slice));
        }
    }
}

/// Send `line` at `now` and block for `settle`, returning every line received.
pub fn exchange(
    transport: &mut dyn Transport,
    line: &str,
    settle: Duration,
    now: Instant,
    poll_interval: Duration,
) -> Result<Reply> {
    Exchange::begin(transport, line, settle, now)?.wait(transport, now, poll_interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    #[derive(Default)]
    struct Loopback {
        written: Vec<u8>,
        incoming: VecDeque<u8>,
        fail_reads: bool,
    }

    impl Loopback {
        fn with_input(input: &str) -> Self {
            Self {
                incoming: input.bytes().collect(),
                ..Self::default()
            }
        }
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.fail_reads {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "gone"));
            }
            let n = buf.len().min(self.incoming.len());
            for (slot, b) in buf.iter_mut().zip(self.incoming.drain(..n)) {
                *slot = b;
            }
            Ok(n)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Loopback {
        fn bytes_available(&mut self) -> io::Result<usize> {
            if self.fail_reads {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "gone"));
            }
            Ok(self.incoming.len())
        }
    }

    #[test]
    fn line_buffer_strips_carriage_returns_and_blank_lines() {
        let mut buf = LineBuffer::new();
        buf.push(b"first\r\n\r\nsec");
        buf.push(b"ond\npartial");
        assert_eq!(buf.finish(), vec!["first", "second", "partial"]);
        assert!(buf.finish().is_empty());
    }

    #[test]
    fn begin_writes_exactly_one_line() {
        let mut t = Loopback::default();
        let now = Instant::now();
        let ex = Exchange::begin_command(&mut t, &Command::analog("000101"), Duration::ZERO, now)
            .unwrap();
        assert_eq!(t.written, b"analog(0b000101)\n");
        assert_eq!(ex.line(), "analog(0b000101)");

        let mut t = Loopback::default();
        Exchange::begin(&mut t, "move(10,20)\n", Duration::ZERO, now).unwrap();
        assert_eq!(t.written, b"move(10,20)\n");
    }

    #[test]
    fn empty_line_is_sent_as_bare_newline() {
        let mut t = Loopback::default();
        Exchange::begin(&mut t, "", Duration::ZERO, Instant::now()).unwrap();
        assert_eq!(t.written, b"\n");
    }

    #[test]
    fn poll_waits_for_the_deadline() {
        let mut t = Loopback::with_input("1.23,3.21,\r\n");
        let start = Instant::now();
        let settle = Duration::from_millis(100);
        let mut ex = Exchange::begin(&mut t, "analog(0b000101)", settle, start).unwrap();

        assert!(ex.poll(&mut t, start + Duration::from_millis(50)).unwrap().is_none());
        let reply = ex.poll(&mut t, start + settle).unwrap().unwrap();
        assert_eq!(reply.lines, vec!["1.23,3.21,"]);
    }

    #[test]
    fn reply_remembers_a_line_without_newline() {
        let mut t = Loopback::with_input("INFO: ok\n1.23,3.2");
        let now = Instant::now();
        let mut ex = Exchange::begin(&mut t, "analog(0b000101)", Duration::ZERO, now).unwrap();
        let reply = ex.poll(&mut t, now).unwrap().unwrap();
        assert_eq!(reply.lines, vec!["INFO: ok", "1.23,3.2"]);
        assert!(reply.cut_off);
        assert!(reply.is_complete(0));
        assert!(!reply.is_complete(1));

        let mut t = Loopback::with_input("1.23,3.21,\r\n");
        let mut ex = Exchange::begin(&mut t, "analog(0b000101)", Duration::ZERO, now).unwrap();
        let reply = ex.poll(&mut t, now).unwrap().unwrap();
        assert!(!reply.cut_off);
        assert!(reply.is_complete(0));
    }

    #[test]
    fn zero_lines_is_an_empty_reply() {
        let mut t = Loopback::default();
        let now = Instant::now();
        let mut ex = Exchange::begin(&mut t, "analog(0b1)", Duration::ZERO, now).unwrap();
        let reply = ex.poll(&mut t, now).unwrap().unwrap();
        assert!(reply.is_empty());
    }

    #[test]
    fn blocking_exchange_collects_every_line() {
        let mut t = Loopback::with_input("line one\nline two\n");
        let reply = exchange(
            &mut t,
            "help()",
            Duration::ZERO,
            Instant::now(),
            Duration::from_millis(1),
        )
        .unwrap();
        assert_eq!(reply.lines, vec!["line one", "line two"]);
    }

    #[test]
    fn wait_measures_the_deadline_from_the_given_clock() {
        let mut t = Loopback::with_input("late\n");
        // a clock far ahead of the wall clock must not make wait sleep
        let virtual_now = Instant::now() + Duration::from_secs(3600);
        let ex = Exchange::begin(&mut t, "ping()", Duration::from_secs(3600), virtual_now).unwrap();
        let wall = Instant::now();
        let reply = ex
            .wait(&mut t, virtual_now + Duration::from_secs(3600), Duration::from_millis(1))
            .unwrap();
        assert_eq!(reply.lines, vec!["late"]);
        assert!(wall.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn read_failures_propagate() {
        let mut t = Loopback {
            fail_reads: true,
            ..Loopback::default()
        };
        let now = Instant::now();
        let mut ex = Exchange::begin(&mut t, "analog(0b1)", Duration::ZERO, now).unwrap();
        assert!(ex.poll(&mut t, now).is_err());
    }

    #[test]
    fn discard_input_empties_the_transport() {
        let mut t = Loopback::with_input("late reply\n");
        assert_eq!(discard_input(&mut t).unwrap(), 11);
        assert_eq!(t.bytes_available().unwrap(), 0);
    }
}
