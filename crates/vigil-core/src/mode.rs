//! Timeout policies
//!
//! A policy decides which progress event re-arms or disarms the deadline timer:
//! - UNTIL_FIRST: the deadline bounds the wait for the first element only
//! - UNTIL_NEXT: the deadline bounds every gap between elements
//! - UNTIL_EOS: the deadline bounds the whole subscription

use std::fmt;
use std::str::FromStr;

use crate::StreamError;

/// Which progress event the deadline timer measures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TimeoutMode {
    /// Timer runs from subscription until the first element, then never again
    UntilFirst = 0,
    /// Timer is restarted on every element
    #[default]
    UntilNext = 1,
    /// A single timer runs from subscription until the terminal signal
    UntilEos = 2,
}

impl TimeoutMode {
    pub const ALL: [TimeoutMode; 3] = [
        TimeoutMode::UntilFirst,
        TimeoutMode::UntilNext,
        TimeoutMode::UntilEos,
    ];

    /// Canonical upper-case name
    pub fn name(self) -> &'static str {
        match self {
            TimeoutMode::UntilFirst => "UNTIL_FIRST",
            TimeoutMode::UntilNext => "UNTIL_NEXT",
            TimeoutMode::UntilEos => "UNTIL_EOS",
        }
    }
}

impl fmt::Display for TimeoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TimeoutMode {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();

        match normalized.as_str() {
            "UNTIL_FIRST" => Ok(TimeoutMode::UntilFirst),
            "UNTIL_NEXT" => Ok(TimeoutMode::UntilNext),
            "UNTIL_EOS" => Ok(TimeoutMode::UntilEos),
            _ => Err(StreamError::InvalidConfig(format!(
                "unknown timeout mode: {s:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_default_is_until_next() {
        assert_eq!(TimeoutMode::default(), TimeoutMode::UntilNext);
    }

    #[test]
    fn test_mode_display_parse() {
        for mode in TimeoutMode::ALL {
            let parsed: TimeoutMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }

        assert_eq!("until-eos".parse::<TimeoutMode>().unwrap(), TimeoutMode::UntilEos);
        assert_eq!(" Until_First ".parse::<TimeoutMode>().unwrap(), TimeoutMode::UntilFirst);
    }

    #[test]
    fn test_mode_parse_rejects_unknown() {
        let err = "until_last".parse::<TimeoutMode>().unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));
    }
}
