//! Core domain types used across services

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kenyan mobile network operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Safaricom,
    Airtel,
    Telkom,
    Unknown,
}

impl Operator {
    /// Detect operator from a normalised `254` MSISDN
    pub fn from_msisdn(msisdn: &str) -> Self {
        let Some(local) = msisdn.strip_prefix("254") else {
            return Self::Unknown;
        };
        let prefix = match local.get(..3) {
            Some(p) => p,
            None => return Self::Unknown,
        };

        match prefix {
            "701" | "702" | "703" | "704" | "705" | "706" | "707" | "708" | "709" | "710"
            | "711" | "712" | "713" | "714" | "715" | "716" | "717" | "718" | "719" | "720"
            | "721" | "722" | "723" | "724" | "725" | "726" | "727" | "728" | "729" | "740"
            | "741" | "742" | "743" | "745" | "746" | "748" | "757" | "758" | "759" | "768"
            | "769" | "790" | "791" | "792" | "793" | "794" | "795" | "796" | "797" | "798"
            | "799" | "110" | "111" | "112" | "113" | "114" | "115" => Self::Safaricom,
            "730" | "731" | "732" | "733" | "734" | "735" | "736" | "737" | "738" | "739"
            | "750" | "751" | "752" | "753" | "754" | "755" | "756" | "762" | "780" | "781"
            | "782" | "783" | "784" | "785" | "786" | "787" | "788" | "789" | "100" | "101"
            | "102" => Self::Airtel,
            "770" | "771" | "772" | "773" | "774" | "775" | "776" | "777" | "778" | "779" => {
                Self::Telkom
            }
            _ => Self::Unknown,
        }
    }
}

/// Phone number normalised to the `254XXXXXXXXX` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn new(number: impl Into<String>) -> Self {
        Self(Self::normalize(number.into()))
    }

    fn normalize(number: String) -> String {
        let cleaned: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
        if cleaned.starts_with("254") {
            cleaned
        } else if let Some(rest) = cleaned.strip_prefix('0') {
            format!("254{}", rest)
        } else {
            format!("254{}", cleaned)
        }
    }

    /// True for a 12-digit subscriber number on the 7xx or 1xx ranges
    pub fn is_valid_mobile(&self) -> bool {
        self.0.len() == 12
            && (self.0.starts_with("2547") || self.0.starts_with("2541"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn operator(&self) -> Operator {
        Operator::from_msisdn(&self.0)
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
