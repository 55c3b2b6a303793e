//! Problem categories.
//!
//! The canonical list every component agrees on. Knowledge packs, the
//! classifier and the fallback tables all key on these.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Networking,
    Performance,
    Os,
    Peripherals,
    Mobile,
    Hardware,
    Unknown,
}

impl Category {
    /// All categories, in display order.
    pub const ALL: [Category; 7] = [
        Category::Networking,
        Category::Performance,
        Category::Os,
        Category::Peripherals,
        Category::Mobile,
        Category::Hardware,
        Category::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Networking => "networking",
            Self::Performance => "performance",
            Self::Os => "os",
            Self::Peripherals => "peripherals",
            Self::Mobile => "mobile",
            Self::Hardware => "hardware",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    /// Lenient parse. Older knowledge packs used "system", "security" and
    /// "general"; those map onto the current set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "networking" | "network" => Ok(Self::Networking),
            "performance" => Ok(Self::Performance),
            "os" | "system" | "security" | "software" => Ok(Self::Os),
            "peripherals" | "peripheral" => Ok(Self::Peripherals),
            "mobile" => Ok(Self::Mobile),
            "hardware" => Ok(Self::Hardware),
            "unknown" | "general" | "" => Ok(Self::Unknown),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}
