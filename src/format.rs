use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Competitive ruleset a run ingests replays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
pub enum Format {
    #[serde(rename = "OU")]
    #[value(name = "OU")]
    Ou,
    #[serde(rename = "VGC")]
    #[value(name = "VGC")]
    Vgc,
}

impl Format {
    pub const ALL: [Format; 2] = [Format::Ou, Format::Vgc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Ou => "OU",
            Format::Vgc => "VGC",
        }
    }

    /// Lowercase form used to namespace artifact locations.
    pub fn slug(&self) -> &'static str {
        match self {
            Format::Ou => "ou",
            Format::Vgc => "vgc",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Format {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        for format in Format::ALL {
            if trimmed.eq_ignore_ascii_case(format.as_str()) {
                return Ok(format);
            }
        }
        bail!(
            "Unknown format '{}'. Known formats: {}",
            trimmed,
            Format::ALL.map(|f| f.as_str()).join(", ")
        )
    }
}
