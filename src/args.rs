//! Command line: `typometer X,Y WIDTHxHEIGHT`

use thiserror::Error;

use crate::region::WatchRegion;

/// Why the command line was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("expected 2 arguments, got {0}")]
    ArgumentCount(usize),

    #[error("position {0:?} is not of the form X,Y")]
    Position(String),

    #[error("size {0:?} is not of the form WIDTHxHEIGHT")]
    Size(String),

    #[error("{what} {value:?} is not a non-negative 32-bit integer")]
    Number { what: &'static str, value: String },

    #[error("region size must not be zero")]
    EmptyRegion,
}

/// Usage line printed when parsing fails
pub fn usage(program: &str) -> String {
    format!("Usage: {} X,Y WIDTHxHEIGHT", program)
}

/// Parse the positional arguments (program name excluded)
pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<WatchRegion, UsageError> {
    let [position, size] = args else {
        return Err(UsageError::ArgumentCount(args.len()));
    };

    let (x, y) = split_pair(position.as_ref(), ',')
        .ok_or_else(|| UsageError::Position(position.as_ref().to_string()))?;
    let (width, height) = split_pair(size.as_ref(), 'x')
        .ok_or_else(|| UsageError::Size(size.as_ref().to_string()))?;

    let region = WatchRegion::new(
        number("X", x)?,
        number("Y", y)?,
        number("WIDTH", width)?,
        number("HEIGHT", height)?,
    );

    if region.width == 0 || region.height == 0 {
        return Err(UsageError::EmptyRegion);
    }
    Ok(region)
}

fn split_pair(text: &str, separator: char) -> Option<(&str, &str)> {
    let (first, second) = text.split_once(separator)?;
    if first.is_empty() || second.is_empty() {
        return None;
    }
    Some((first, second))
}

fn number(what: &'static str, value: &str) -> Result<u32, UsageError> {
    let invalid = || UsageError::Number {
        what,
        value: value.to_string(),
    };
    // Plain digits only: no sign, no whitespace
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    value.parse().map_err(|_| invalid())
}
