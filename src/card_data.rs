//! Encoding of outbound card track data.
//!
//! Card readers accept a UTF-8 payload terminated by a single zero byte.
//! Depending on how the terminal was configured the text may also need to be
//! framed with magnetic-stripe sentinels: `%...?` for track 1 and `:...?` for
//! track 2.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of characters accepted by the card-data attribute.
///
/// The peripheral accepts 196 bytes; the last one is the terminator.
pub const CARD_DATA_MAX_CHARS: usize = 195;

const TRACK1_START: char = '%';
const TRACK2_START: char = ':';
const END_SENTINEL: char = '?';

/// Errors returned when encoding card data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CardDataError {
    /// Text has more characters than the peripheral accepts.
    #[error("card data exceeds {0} characters")]
    InvalidLength(usize),
}

/// Sentinel framing applied to card data before it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SentinelMode {
    /// Plain text, no framing.
    #[default]
    None,
    /// Track 1 framing: `%` ... `?`
    Track1,
    /// Track 2 framing: `:` ... `?`
    Track2,
}

impl SentinelMode {
    /// Integer code used when persisting the mode in a settings store.
    pub fn code(self) -> i64 {
        match self {
            SentinelMode::Track1 => 0,
            SentinelMode::Track2 => 1,
            SentinelMode::None => 2,
        }
    }

    /// Inverse of [`SentinelMode::code`]. Unknown codes fall back to `None`.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => SentinelMode::Track1,
            1 => SentinelMode::Track2,
            _ => SentinelMode::None,
        }
    }

    fn start(self) -> Option<char> {
        match self {
            SentinelMode::None => None,
            SentinelMode::Track1 => Some(TRACK1_START),
            SentinelMode::Track2 => Some(TRACK2_START),
        }
    }
}

impl fmt::Display for SentinelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SentinelMode::None => write!(f, "none"),
            SentinelMode::Track1 => write!(f, "track1"),
            SentinelMode::Track2 => write!(f, "track2"),
        }
    }
}

impl FromStr for SentinelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(SentinelMode::None),
            "track1" | "1" => Ok(SentinelMode::Track1),
            "track2" | "2" => Ok(SentinelMode::Track2),
            _ => Err(format!("Unknown sentinel mode: {}", s)),
        }
    }
}

/// Validate and encode card data for the card-data attribute.
///
/// The text may hold at most `max_chars` characters. When a sentinel mode is
/// active two of those characters are reserved for the framing, so the text
/// is truncated to `max_chars - 2` before being wrapped. The result is the
/// UTF-8 encoding followed by a single zero byte.
///
/// # Errors
/// Returns [`CardDataError::InvalidLength`] carrying `max_chars` if the text
/// is too long.
///
/// # Example
/// ```
/// use beacon_link::card_data::{SentinelMode, encode};
///
/// let bytes = encode("1234", SentinelMode::Track1, 195).unwrap();
/// assert_eq!(bytes, b"%1234?\0");
/// ```
pub fn encode(text: &str, mode: SentinelMode, max_chars: usize) -> Result<Vec<u8>, CardDataError> {
    if text.chars().count() > max_chars {
        return Err(CardDataError::InvalidLength(max_chars));
    }

    let budget = match mode {
        SentinelMode::None => max_chars,
        _ => max_chars.saturating_sub(2),
    };
    let truncated = text.chars().take(budget);

    let mut framed = String::with_capacity(text.len() + 2);
    if let Some(start) = mode.start() {
        framed.push(start);
        framed.extend(truncated);
        framed.push(END_SENTINEL);
    } else {
        framed.extend(truncated);
    }

    let mut bytes = framed.into_bytes();
    bytes.push(0);
    Ok(bytes)
}
