//! Control messages.
//!
//! A record whose control field is non-empty is a control message. The first
//! character selects the command and the rest is its argument:
//!
//! | char | command |
//! |------|---------|
//! | `' '` | no-op filler |
//! | `'.'` | repeated header, ignored |
//! | `'f'` | flush; argument is the acknowledgement id |
//! | `'i'` | interim results; optional `start [end]` |
//! | `'r'` | reset buckets; `start [end]` |
//! | `'t'` | advance time; argument is the new time |
//! | `'u'` | config update; argument is a JSON object |

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Field carrying control messages.
pub const CONTROL_FIELD: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    NoOp,
    Ignore,
    Flush { id: String },
    Interim { range: Option<TimeRange> },
    ResetBuckets { range: TimeRange },
    AdvanceTime { time: i64 },
    UpdateConfig { json: String },
}

/// Half-open `[start, end)` range in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    /// `None` means one bucket starting at `start`.
    pub end: Option<i64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown control message '{0}'")]
    Unknown(String),
    #[error("control message '{command}' needs {what}")]
    MissingArgument { command: char, what: &'static str },
    #[error("invalid time '{value}' in control message '{command}'")]
    InvalidTime { command: char, value: String },
}

impl ControlMessage {
    pub fn parse(message: &str) -> Result<Self, ControlError> {
        let mut chars = message.chars();
        let Some(command) = chars.next() else {
            return Ok(ControlMessage::NoOp);
        };
        let arg = chars.as_str().trim();
        match command {
            ' ' => Ok(ControlMessage::NoOp),
            '.' => Ok(ControlMessage::Ignore),
            'f' => Ok(ControlMessage::Flush { id: arg.to_string() }),
            'i' => Ok(ControlMessage::Interim {
                range: parse_range(command, arg)?,
            }),
            'r' => match parse_range(command, arg)? {
                Some(range) => Ok(ControlMessage::ResetBuckets { range }),
                None => Err(ControlError::MissingArgument {
                    command,
                    what: "a start time",
                }),
            },
            't' => {
                if arg.is_empty() {
                    return Err(ControlError::MissingArgument {
                        command,
                        what: "a time",
                    });
                }
                Ok(ControlMessage::AdvanceTime {
                    time: parse_time(command, arg)?,
                })
            }
            'u' => {
                if arg.is_empty() {
                    return Err(ControlError::MissingArgument {
                        command,
                        what: "a JSON object",
                    });
                }
                Ok(ControlMessage::UpdateConfig {
                    json: arg.to_string(),
                })
            }
            _ => Err(ControlError::Unknown(message.to_string())),
        }
    }
}

fn parse_range(command: char, arg: &str) -> Result<Option<TimeRange>, ControlError> {
    let mut parts = arg.split_whitespace();
    let Some(start) = parts.next() else {
        return Ok(None);
    };
    let start = parse_time(command, start)?;
    let end = parts.next().map(|e| parse_time(command, e)).transpose()?;
    Ok(Some(TimeRange { start, end }))
}

/// Whether `time` lies inside the calendar range. Bucket arithmetic on such
/// times cannot overflow.
pub fn is_representable_time(time: i64) -> bool {
    DateTime::<Utc>::from_timestamp(time, 0).is_some()
}

/// Epoch seconds as an integer or a float, floored. `None` when the value
/// is not a number or is outside the calendar range.
pub fn parse_epoch_seconds(value: &str) -> Option<i64> {
    value
        .parse::<i64>()
        .ok()
        .or_else(|| {
            value
                .parse::<f64>()
                .ok()
                .filter(|t| t.is_finite() && t.abs() < i64::MAX as f64)
                .map(|t| t.floor() as i64)
        })
        .filter(|t| is_representable_time(*t))
}

fn parse_time(command: char, value: &str) -> Result<i64, ControlError> {
    parse_epoch_seconds(value).ok_or_else(|| ControlError::InvalidTime {
            command,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ControlMessage::parse(" ").unwrap(), ControlMessage::NoOp);
        assert_eq!(ControlMessage::parse("..").unwrap(), ControlMessage::Ignore);
        assert_eq!(
            ControlMessage::parse("f42").unwrap(),
            ControlMessage::Flush { id: "42".into() }
        );
        assert_eq!(
            ControlMessage::parse("t3600").unwrap(),
            ControlMessage::AdvanceTime { time: 3600 }
        );
        assert_eq!(
            ControlMessage::parse("u{\"decay_rate\":0.01}").unwrap(),
            ControlMessage::UpdateConfig {
                json: "{\"decay_rate\":0.01}".into()
            }
        );
    }

    #[test]
    fn test_parse_ranges() {
        assert_eq!(
            ControlMessage::parse("i").unwrap(),
            ControlMessage::Interim { range: None }
        );
        assert_eq!(
            ControlMessage::parse("i100 400").unwrap(),
            ControlMessage::Interim {
                range: Some(TimeRange {
                    start: 100,
                    end: Some(400)
                })
            }
        );
        assert_eq!(
            ControlMessage::parse("r 250.5").unwrap(),
            ControlMessage::ResetBuckets {
                range: TimeRange {
                    start: 250,
                    end: None
                }
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            ControlMessage::parse("z"),
            Err(ControlError::Unknown("z".into()))
        );
        assert!(matches!(
            ControlMessage::parse("r"),
            Err(ControlError::MissingArgument { command: 'r', .. })
        ));
        assert!(matches!(
            ControlMessage::parse("tsoon"),
            Err(ControlError::InvalidTime { command: 't', .. })
        ));
    }

    #[test]
    fn test_times_outside_calendar_are_invalid() {
        for message in ["t1e30", "t-1e30", "t9223372036854775807", "i0 1e300", "r-9223372036854775808"] {
            assert!(
                matches!(
                    ControlMessage::parse(message),
                    Err(ControlError::InvalidTime { .. })
                ),
                "{message}"
            );
        }
        assert_eq!(parse_epoch_seconds("-86400.5"), Some(-86_401));
        assert!(is_representable_time(253_402_300_799));
        assert!(!is_representable_time(i64::MIN));
    }
}
