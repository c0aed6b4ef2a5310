//! Script-line parsing.
//!
//! One command per line, whitespace- and punctuation-insensitive: tokens are
//! the word-character runs of the line, so `W(T1, x3, 33)` and `W T1 x3 33`
//! parse alike. `//` starts a comment, and a line beginning with `===`
//! switches the parser into passthrough mode for the rest of the input
//! (scripts end with an expected-output section).

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{SiteId, TransactionId, VariableId};

/// Line-level rejections.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The first token is not a known command.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Known command, wrong number of arguments.
    #[error("command '{cmd}' expects {expected} argument(s), got {got}")]
    WrongArity {
        cmd: String,
        expected: usize,
        got: usize,
    },

    /// An argument that must be numeric is not.
    #[error("'{0}' is not a number")]
    InvalidNumber(String),
}

/// A parsed script command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Begin { tid: TransactionId },
    BeginRo { tid: TransactionId },
    Read { tid: TransactionId, vid: VariableId },
    Write { tid: TransactionId, vid: VariableId, value: i64 },
    End { tid: TransactionId },
    Fail { sid: SiteId },
    Recover { sid: SiteId },
    Dump,
}

/// Stateful line parser (passthrough mode persists across lines).
#[derive(Debug)]
pub struct Parser {
    token: Regex,
    passthrough: bool,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            token: Regex::new(r"\w+").expect("token pattern is valid"),
            passthrough: false,
        }
    }

    /// Parses one line. `Ok(None)` means there is nothing to execute: a
    /// blank line, a comment, the `===` marker, or any line after it.
    pub fn parse_line(&mut self, line: &str) -> Result<Option<Command>, ParseError> {
        if self.passthrough {
            return Ok(None);
        }
        let code = line.split("//").next().unwrap_or("").trim();
        if code.is_empty() {
            return Ok(None);
        }
        if code.starts_with("===") {
            self.passthrough = true;
            return Ok(None);
        }

        let tokens: Vec<&str> = self.token.find_iter(code).map(|m| m.as_str()).collect();
        let Some((&cmd, args)) = tokens.split_first() else {
            return Ok(None);
        };
        match cmd {
            "begin" => {
                expect_arity(cmd, args, 1)?;
                Ok(Some(Command::Begin {
                    tid: args[0].to_string(),
                }))
            }
            "beginRO" => {
                expect_arity(cmd, args, 1)?;
                Ok(Some(Command::BeginRo {
                    tid: args[0].to_string(),
                }))
            }
            "R" => {
                expect_arity(cmd, args, 2)?;
                Ok(Some(Command::Read {
                    tid: args[0].to_string(),
                    vid: args[1].to_string(),
                }))
            }
            "W" => {
                expect_arity(cmd, args, 3)?;
                Ok(Some(Command::Write {
                    tid: args[0].to_string(),
                    vid: args[1].to_string(),
                    value: parse_number(args[2])?,
                }))
            }
            "end" => {
                expect_arity(cmd, args, 1)?;
                Ok(Some(Command::End {
                    tid: args[0].to_string(),
                }))
            }
            "fail" => {
                expect_arity(cmd, args, 1)?;
                Ok(Some(Command::Fail {
                    sid: parse_number(args[0])?,
                }))
            }
            "recover" => {
                expect_arity(cmd, args, 1)?;
                Ok(Some(Command::Recover {
                    sid: parse_number(args[0])?,
                }))
            }
            "dump" => {
                expect_arity(cmd, args, 0)?;
                Ok(Some(Command::Dump))
            }
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_arity(cmd: &str, args: &[&str], expected: usize) -> Result<(), ParseError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ParseError::WrongArity {
            cmd: cmd.to_string(),
            expected,
            got: args.len(),
        })
    }
}

fn parse_number<T: std::str::FromStr>(token: &str) -> Result<T, ParseError> {
    token
        .parse()
        .map_err(|_| ParseError::InvalidNumber(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Option<Command> {
        Parser::new().parse_line(line).unwrap()
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            parse("begin(T1)"),
            Some(Command::Begin { tid: "T1".to_string() })
        );
        assert_eq!(
            parse("beginRO(T2)"),
            Some(Command::BeginRo { tid: "T2".to_string() })
        );
        assert_eq!(
            parse("R(T1, x4)"),
            Some(Command::Read {
                tid: "T1".to_string(),
                vid: "x4".to_string()
            })
        );
        assert_eq!(
            parse("W(T1, x4, 42)"),
            Some(Command::Write {
                tid: "T1".to_string(),
                vid: "x4".to_string(),
                value: 42
            })
        );
        assert_eq!(parse("end(T1)"), Some(Command::End { tid: "T1".to_string() }));
        assert_eq!(parse("fail(3)"), Some(Command::Fail { sid: 3 }));
        assert_eq!(parse("recover(3)"), Some(Command::Recover { sid: 3 }));
        assert_eq!(parse("dump"), Some(Command::Dump));
    }

    #[test]
    fn test_whitespace_and_punctuation_insensitive() {
        assert_eq!(parse("  W ( T1 , x4 , 42 ) "), parse("W(T1,x4,42)"));
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("   "), None);
        assert_eq!(parse("// a comment"), None);
        assert_eq!(
            parse("begin(T1) // trailing comment"),
            Some(Command::Begin { tid: "T1".to_string() })
        );
    }

    #[test]
    fn test_passthrough_mode_persists() {
        let mut parser = Parser::new();
        assert!(parser.parse_line("begin(T1)").unwrap().is_some());
        assert_eq!(parser.parse_line("=== expected output").unwrap(), None);
        // even valid commands are swallowed afterwards
        assert_eq!(parser.parse_line("begin(T2)").unwrap(), None);
        assert_eq!(parser.parse_line("garbage ###").unwrap(), None);
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            Parser::new().parse_line("frobnicate(T1)"),
            Err(ParseError::UnknownCommand(cmd)) if cmd == "frobnicate"
        ));
    }

    #[test]
    fn test_wrong_arity() {
        assert!(matches!(
            Parser::new().parse_line("W(T1, x4)"),
            Err(ParseError::WrongArity { expected: 3, got: 2, .. })
        ));
        assert!(matches!(
            Parser::new().parse_line("dump(1)"),
            Err(ParseError::WrongArity { expected: 0, got: 1, .. })
        ));
    }

    #[test]
    fn test_bad_number() {
        assert!(matches!(
            Parser::new().parse_line("fail(one)"),
            Err(ParseError::InvalidNumber(_))
        ));
    }
}
