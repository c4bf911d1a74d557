//! Commands and replies of the line protocol.
//!
//! A command travels as a single ASCII line, `name(arg1,arg2,arg3)\n`. A reply
//! is whatever lines the device produced before the settle delay elapsed.
//! Replies are either a single status line (`ERROR: ...`, `WARN: ...`,
//! `INFO: ...`) or generic data.

use std::fmt;

use serde::Serialize;

use crate::errors::{DriverError, Result};

/// Name of the periodic sampling command
pub const CMD_ANALOG: &str = "analog";

/// Name of the definition query command
pub const CMD_DEFGET: &str = "defget";

/// Definition holding the device's reference voltage
pub const DEF_TRUE_VOLTAGE: &str = "TRUE_VOLTAGE";

/// A command as sent on the wire. The driver does not validate the grammar;
/// the device answers with an `ERROR:` status when it rejects a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `analog(0b<mask>)`, the periodic sampling request.
    pub fn analog(mask: &str) -> Self {
        Command::new(CMD_ANALOG).arg(format!("0b{mask}"))
    }

    /// `defget(TRUE_VOLTAGE)`, the calibration query.
    pub fn true_voltage() -> Self {
        Command::new(CMD_DEFGET).arg(DEF_TRUE_VOLTAGE)
    }

    /// The full wire line, newline included.
    pub fn to_wire(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusKind {
    Error,
    Warn,
    Info,
}

impl StatusKind {
    pub const ALL: [StatusKind; 3] = [StatusKind::Error, StatusKind::Warn, StatusKind::Info];

    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Error => "ERROR",
            StatusKind::Warn => "WARN",
            StatusKind::Info => "INFO",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
}

impl Status {
    /// Match `^(ERROR|WARN|INFO): (.*)$` against one line.
    pub fn parse(line: &str) -> Option<Self> {
        StatusKind::ALL.iter().find_map(|&kind| {
            line.strip_prefix(kind.as_str())
                .and_then(|rest| rest.strip_prefix(": "))
                .map(|message| Status {
                    kind,
                    message: message.to_string(),
                })
        })
    }
}

/// Lines read back after a command, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub lines: Vec<String>,
    /// The last line had no newline yet when the settle window closed.
    #[serde(skip)]
    pub cut_off: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplyKind {
    Status(Status),
    Generic { lines: Vec<String> },
}

impl ReplyKind {
    /// `ERROR`, `WARN`, `INFO` or `GENERIC`.
    pub fn label(&self) -> &'static str {
        match self {
            ReplyKind::Status(status) => status.kind.as_str(),
            ReplyKind::Generic { .. } => "GENERIC",
        }
    }
}

impl Reply {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            cut_off: false,
        }
    }

    /// Mark the last line as cut off mid-line.
    pub fn with_cut_off(mut self, cut_off: bool) -> Self {
        self.cut_off = cut_off && !self.lines.is_empty();
        self
    }

    /// Whether line `index` arrived with its newline.
    pub fn is_complete(&self, index: usize) -> bool {
        index < self.lines.len() && !(self.cut_off && index + 1 == self.lines.len())
    }

    /// No line arrived within the settle window. Means "no data yet".
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn first_line(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }

    /// A reply is a status iff it is exactly one line with a status prefix.
    pub fn classify(&self) -> ReplyKind {
        if let [line] = self.lines.as_slice() {
            if let Some(status) = Status::parse(line) {
                return ReplyKind::Status(status);
            }
        }
        ReplyKind::Generic {
            lines: self.lines.clone(),
        }
    }

    /// Parse a single-line `"<NAME> <value>"` definition reply.
    pub fn definition(&self) -> Result<(String, f64)> {
        let line = match self.lines.as_slice() {
            [line] => line,
            [] => return Err(DriverError::Protocol("empty definition reply".into())),
            lines => {
                return Err(DriverError::Protocol(format!(
                    "expected one definition line, got {}",
                    lines.len()
                )))
            }
        };
        let mut parts = line.split_whitespace();
        let (Some(name), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(DriverError::Protocol(format!(
                "malformed definition line: {line:?}"
            )));
        };
        let value = value
            .parse::<f64>()
            .map_err(|e| DriverError::Protocol(format!("bad definition value {value:?}: {e}")))?;
        if !value.is_finite() {
            return Err(DriverError::Protocol(format!(
                "non-finite definition value: {value}"
            )));
        }
        Ok((name.to_string(), value))
    }

    /// The reference voltage, if this reply is a `TRUE_VOLTAGE` definition.
    pub fn true_voltage(&self) -> Option<f64> {
        match self.definition() {
            Ok((name, value)) if name == DEF_TRUE_VOLTAGE => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(lines: &[&str]) -> Reply {
        Reply::new(lines.iter().map(|l| l.to_string()).collect())
    }

    #[test]
    fn encodes_commands() {
        assert_eq!(Command::new("turnOn").to_wire(), "turnOn()\n");
        assert_eq!(
            Command::new("move").arg("10").arg("20").to_string(),
            "move(10,20)"
        );
        assert_eq!(Command::analog("000101").to_wire(), "analog(0b000101)\n");
        assert_eq!(Command::true_voltage().to_string(), "defget(TRUE_VOLTAGE)");
    }

    #[test]
    fn single_status_line_is_status() {
        let kind = reply(&["WARN: low battery"]).classify();
        assert_eq!(
            kind,
            ReplyKind::Status(Status {
                kind: StatusKind::Warn,
                message: "low battery".into()
            })
        );
        assert_eq!(kind.label(), "WARN");
        assert_eq!(reply(&["3.3,"]).classify().label(), "GENERIC");
    }

    #[test]
    fn status_message_may_be_empty_or_contain_colons() {
        assert_eq!(
            Status::parse("ERROR: a: b"),
            Some(Status {
                kind: StatusKind::Error,
                message: "a: b".into()
            })
        );
        assert_eq!(Status::parse("INFO: ").map(|s| s.message), Some(String::new()));
    }

    #[test]
    fn non_status_replies_are_generic() {
        for lines in [
            vec![],
            vec!["INFO: a", "INFO: b"],
            vec!["INFO:missing space"],
            vec!["info: lowercase"],
            vec!["1.0,2.0,"],
        ] {
            let r = reply(&lines);
            assert_eq!(
                r.classify(),
                ReplyKind::Generic {
                    lines: r.lines.clone()
                }
            );
        }
    }

    #[test]
    fn parses_true_voltage_definition() {
        let r = reply(&["TRUE_VOLTAGE 5.02"]);
        assert_eq!(r.definition().unwrap(), ("TRUE_VOLTAGE".to_string(), 5.02));
        assert_eq!(r.true_voltage(), Some(5.02));
        assert_eq!(reply(&["OTHER 1.0"]).true_voltage(), None);
    }

    #[test]
    fn rejects_malformed_definitions() {
        assert!(reply(&[]).definition().is_err());
        assert!(reply(&["TRUE_VOLTAGE"]).definition().is_err());
        assert!(reply(&["TRUE_VOLTAGE five"]).definition().is_err());
        assert!(reply(&["TRUE_VOLTAGE 5 V"]).definition().is_err());
        assert!(reply(&["A 1", "B 2"]).definition().is_err());
        assert!(reply(&["TRUE_VOLTAGE NaN"]).definition().is_err());
    }
}
