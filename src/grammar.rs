//! Command grammar accepted by the device firmware.
//!
//! The driver never checks outgoing lines against this grammar. It is the
//! device's contract, implemented here for the simulated device and for test
//! harnesses that validate a real device's behaviour.
//!
//! A valid line is `name(arg1,arg2,arg3)`: letters, digits and `_` only, a name of
//! at most 15 characters, 0 to 3 non-empty arguments of at most 15 characters
//! each, and nothing after the closing parenthesis.

use std::fmt;

use crate::command::Command;

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

pub const MAX_NAME_LEN: usize = 15;
pub const MAX_ARG_LEN: usize = 15;
pub const MAX_ARGS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarError {
    MissingParenthesis,
    TrailingCharacters,
    EmptyName,
    NameTooLong(usize),
    InvalidNameCharacter(char),
    TooManyArguments(usize),
    EmptyArgument(usize),
    ArgumentTooLong { index: usize, len: usize },
    InvalidArgumentCharacter { index: usize, ch: char },
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarError::MissingParenthesis => write!(f, "missing or unbalanced parenthesis"),
            GrammarError::TrailingCharacters => write!(f, "characters after closing parenthesis"),
            GrammarError::EmptyName => write!(f, "empty command name"),
            GrammarError::NameTooLong(len) => {
                write!(f, "command name has {len} characters (max {MAX_NAME_LEN})")
            }
            GrammarError::InvalidNameCharacter(ch) => {
                write!(f, "invalid character {ch:?} in command name")
            }
            GrammarError::TooManyArguments(n) => {
                write!(f, "{n} arguments given (max {MAX_ARGS})")
            }
            GrammarError::EmptyArgument(i) => write!(f, "argument {i} is empty"),
            GrammarError::ArgumentTooLong { index, len } => {
                write!(f, "argument {index} has {len} characters (max {MAX_ARG_LEN})")
            }
            GrammarError::InvalidArgumentCharacter { index, ch } => {
                write!(f, "invalid character {ch:?} in argument {index}")
            }
        }
    }
}

impl std::error::Error for GrammarError {}

/// Parse one line (without its newline) the way the firmware does.
pub fn parse(line: &str) -> Result<Command, GrammarError> {
    let open = line.find('(').ok_or(GrammarError::MissingParenthesis)?;
    let close = line.find(')').ok_or(GrammarError::MissingParenthesis)?;
    if close < open || line[open + 1..].contains('(') {
        return Err(GrammarError::MissingParenthesis);
    }
    if close + 1 != line.len() {
        return Err(GrammarError::TrailingCharacters);
    }

    let name = &line[..open];
    if name.is_empty() {
        return Err(GrammarError::EmptyName);
    }
    if let Some(ch) = name.chars().find(|&c| !is_word_char(c)) {
        return Err(GrammarError::InvalidNameCharacter(ch));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(GrammarError::NameTooLong(name.len()));
    }

    let inner = &line[open + 1..close];
    let mut command = Command::new(name);
    if inner.is_empty() {
        return Ok(command);
    }

    let args: Vec<&str> = inner.split(',').collect();
    if args.len() > MAX_ARGS {
        return Err(GrammarError::TooManyArguments(args.len()));
    }
    for (index, arg) in args.into_iter().enumerate() {
        if arg.is_empty() {
            return Err(GrammarError::EmptyArgument(index));
        }
        if let Some(ch) = arg.chars().find(|&c| !is_word_char(c)) {
            return Err(GrammarError::InvalidArgumentCharacter { index, ch });
        }
        if arg.len() > MAX_ARG_LEN {
            return Err(GrammarError::ArgumentTooLong {
                index,
                len: arg.len(),
            });
        }
        command = command.arg(arg);
    }
    Ok(command)
}

pub fn is_valid(line: &str) -> bool {
    parse(line).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_commands() {
        for line in [
            "turnOn()",
            "setSpeed(100)",
            "move()",
            "move(10,20)",
            "rotate(90,50)",
            "ledControl(3,HIGH)",
            "config(1,LOW,3)",
            "update(42,314,10)",
            "selfDestruct(5)",
            "undefinedCmd(100)",
            "commandName123(1,2,3)",
            "validCmd(arg1,arg2,arg3)",
            "checkNumbers(123456789012345)",
            "mixedArgs(ON,12345,LOW)",
            "mixedArgs(1234567890,1234567890,1234567890)",
            "defget(TRUE_VOLTAGE)",
        ] {
            assert!(is_valid(line), "{line} should be accepted: {:?}", parse(line));
        }
    }

    #[test]
    fn rejects_invalid_commands() {
        for line in [
            "thisCommandIsTooLong()",
            "reallyLongCommandName(1,2,3)",
            "validCmd(1,2,3,4)",
            "setSpeed(12345678901234561)",
            "longArgs(a1234567890123451)",
            "setSpeed 100",
            "move 10,20",
            "turnOn",
            "setSpeed(",
            "turnOn))",
            "rotate(90,50",
            "move())",
            "move(10;20)",
            "setSpeed(100 200)",
            "setMode(\"A\")",
            "toggle('ON')",
            "setValue(10, 20)",
            "playTone(440,500,300 )",
            "move to(100,200)",
            "set Speed(50)",
            "turn-On()",
            "rotate(90,,50)",
            "setSpeed(100,200,)",
            "playTone(440,500,300,600)",
            "command@name(10,20,30)",
            "invalid#cmd(100)",
            "weird$name(50)",
            "name(50)aaa",
            "undefinedCommand(100)",
            "checkNumbers(1234567890123456)",
            "",
            "()",
        ] {
            assert!(!is_valid(line), "{line} should be rejected");
        }
    }

    #[test]
    fn length_limits_are_inclusive_at_fifteen() {
        assert!(is_valid("abcdefghijklmno()"));
        assert_eq!(parse("abcdefghijklmnop()"), Err(GrammarError::NameTooLong(16)));
        assert!(is_valid("a(123456789012345)"));
        assert_eq!(
            parse("a(1234567890123456)"),
            Err(GrammarError::ArgumentTooLong { index: 0, len: 16 })
        );
    }

    #[test]
    fn parsed_command_round_trips_to_wire_text() {
        let command = parse("move(10,20)").unwrap();
        assert_eq!(command.name, "move");
        assert_eq!(command.args, vec!["10", "20"]);
        assert_eq!(command.to_string(), "move(10,20)");
    }
}
