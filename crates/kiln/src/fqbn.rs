//! Fully Qualified Board Names.
//!
//! An FQBN is the `vendor:architecture:board_id[:key=value,...]` string that
//! selects one board (and optionally its configuration options) out of the
//! installed platforms.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing an FQBN string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FqbnError {
    /// Not of the form `vendor:architecture:board_id[:options]`.
    #[error("invalid FQBN {0:?}: expected vendor:architecture:board_id[:options]")]
    Malformed(String),
    /// One of the three mandatory segments was empty.
    #[error("invalid FQBN {fqbn:?}: empty {segment} segment")]
    EmptySegment {
        /// The offending input.
        fqbn: String,
        /// Which segment was empty.
        segment: &'static str,
    },
    /// A board option was not a `key=value` pair.
    #[error("invalid FQBN option {0:?}: expected key=value")]
    MalformedOption(String),
}

/// A parsed Fully Qualified Board Name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fqbn {
    /// Vendor / package identifier (e.g. `arduino`).
    pub vendor: String,
    /// Platform architecture (e.g. `avr`).
    pub architecture: String,
    /// Board identifier within the platform (e.g. `uno`).
    pub board_id: String,
    /// Board configuration options, in input order.
    pub options: Vec<(String, String)>,
}

impl Fqbn {
    /// The `vendor:architecture` pair identifying the platform that defines
    /// this board.
    pub fn platform_id(&self) -> String {
        format!("{}:{}", self.vendor, self.architecture)
    }
}

impl FromStr for Fqbn {
    type Err = FqbnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(FqbnError::Malformed(s.to_string()));
        }
        for (segment, value) in [
            ("vendor", parts[0]),
            ("architecture", parts[1]),
            ("board_id", parts[2]),
        ] {
            if value.is_empty() {
                return Err(FqbnError::EmptySegment {
                    fqbn: s.to_string(),
                    segment,
                });
            }
        }

        let mut options = Vec::new();
        if let Some(raw) = parts.get(3) {
            for pair in raw.split(',') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| FqbnError::MalformedOption(pair.to_string()))?;
                if key.is_empty() {
                    return Err(FqbnError::MalformedOption(pair.to_string()));
                }
                options.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Fqbn {
            vendor: parts[0].to_string(),
            architecture: parts[1].to_string(),
            board_id: parts[2].to_string(),
            options,
        })
    }
}

impl fmt::Display for Fqbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.vendor, self.architecture, self.board_id
        )?;
        for (i, (key, value)) in self.options.iter().enumerate() {
            f.write_str(if i == 0 { ":" } else { "," })?;
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
