use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse device class of the client that wrote a message. Cosmetic only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceTag {
    #[serde(rename = "[MOB]")]
    Mobile,
    #[serde(rename = "[TAB]")]
    Tablet,
    #[serde(rename = "[DSK]")]
    Desktop,
}

impl DeviceTag {
    pub fn label(self) -> &'static str {
        match self {
            DeviceTag::Mobile => "[MOB]",
            DeviceTag::Tablet => "[TAB]",
            DeviceTag::Desktop => "[DSK]",
        }
    }
}

impl fmt::Display for DeviceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classify an environment signature (typically a user agent string).
///
/// Mobile wins over tablet, and anything unrecognized is a desktop. Matching
/// is case-insensitive.
pub fn classify_device(signature: &str) -> DeviceTag {
    let signature = signature.to_ascii_lowercase();
    if signature.contains("mobile") {
        DeviceTag::Mobile
    } else if signature.contains("tablet") {
        DeviceTag::Tablet
    } else {
        DeviceTag::Desktop
    }
}
