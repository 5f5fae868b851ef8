use std::fmt;
use std::str::FromStr;

use crate::error::{ClientError, ErrorCode};

/// Location of an event in the global log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub commit: u64,
    pub prepare: u64,
}

impl Position {
    pub const START: Position = Position {
        commit: 0,
        prepare: 0,
    };
    pub const END: Position = Position {
        commit: u64::MAX,
        prepare: u64::MAX,
    };

    pub fn new(commit: u64, prepare: u64) -> Self {
        Self { commit, prepare }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Position::END {
            return f.write_str("C:-1/P:-1");
        }
        write!(f, "C:{}/P:{}", self.commit, self.prepare)
    }
}

fn parsing_error(input: &str, reason: impl fmt::Display) -> ClientError {
    ClientError::new(
        ErrorCode::Parsing,
        format!("invalid position '{input}': {reason}"),
    )
}

fn parse_part(input: &str, part: &str, prefix: &str) -> Result<i64, ClientError> {
    let value = part
        .strip_prefix(prefix)
        .ok_or_else(|| parsing_error(input, format!("expected '{prefix}' prefix")))?;
    value.parse::<i64>().map_err(|e| parsing_error(input, e))
}

impl FromStr for Position {
    type Err = ClientError;

    /// Parses the `C:<commit>/P:<prepare>` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (commit, prepare) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| parsing_error(s, "expected 'C:<commit>/P:<prepare>'"))?;
        let commit = parse_part(s, commit, "C:")?;
        let prepare = parse_part(s, prepare, "P:")?;
        match (commit, prepare) {
            (-1, -1) => Ok(Position::END),
            (c, p) if c >= 0 && p >= 0 => Ok(Position::new(c as u64, p as u64)),
            _ => Err(parsing_error(s, "negative position")),
        }
    }
}

/// Where a read or subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPosition<A> {
    #[default]
    Start,
    End,
    Position(A),
}

impl<A> StreamPosition<A> {
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> StreamPosition<B> {
        match self {
            StreamPosition::Start => StreamPosition::Start,
            StreamPosition::End => StreamPosition::End,
            StreamPosition::Position(a) => StreamPosition::Position(f(a)),
        }
    }
}

impl FromStr for StreamPosition<u64> {
    type Err = ClientError;

    /// `0` is the start of the stream, `-1` its end.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<i64>() {
            Ok(0) => Ok(StreamPosition::Start),
            Ok(-1) => Ok(StreamPosition::End),
            Ok(n) if n > 0 => Ok(StreamPosition::Position(n as u64)),
            Ok(n) => Err(parsing_error(s, format!("invalid revision {n}"))),
            Err(e) => Err(parsing_error(s, e)),
        }
    }
}

impl FromStr for StreamPosition<Position> {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Position>()? {
            Position::START => Ok(StreamPosition::Start),
            Position::END => Ok(StreamPosition::End),
            position => Ok(StreamPosition::Position(position)),
        }
    }
}
