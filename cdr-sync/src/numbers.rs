use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// How a number coming off the PBX is rewritten before we look it up or dial it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberRule {
    /// Leave the number as is, minus surrounding whitespace.
    Identity,
    /// Keep only the digits.
    Digits,
    /// Keep only the digits, then the last N of them.
    Right(usize),
}

impl NumberRule {
    pub fn apply(&self, number: &str) -> String {
        match self {
            NumberRule::Identity => number.trim().to_owned(),
            NumberRule::Digits => digits(number),
            NumberRule::Right(n) => {
                let digits = digits(number);
                // Digits are ASCII, so byte offsets are char offsets.
                digits[digits.len().saturating_sub(*n)..].to_owned()
            }
        }
    }
}

fn digits(number: &str) -> String {
    number.chars().filter(char::is_ascii_digit).collect()
}

impl FromStr for NumberRule {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rule = s.trim().to_ascii_lowercase();
        match rule.as_str() {
            "identity" => Ok(NumberRule::Identity),
            "digits" => Ok(NumberRule::Digits),
            _ => rule
                .strip_prefix("right:")
                .and_then(|n| n.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .map(NumberRule::Right)
                .ok_or_else(|| SyncError::InvalidRule(s.to_owned())),
        }
    }
}

impl fmt::Display for NumberRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumberRule::Identity => f.write_str("identity"),
            NumberRule::Digits => f.write_str("digits"),
            NumberRule::Right(n) => write!(f, "right:{}", n),
        }
    }
}
