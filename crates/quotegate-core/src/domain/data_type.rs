use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Kind of market data a caller asks for.
///
/// The data type drives cache expiry and the router's specialization lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    RealTime,
    Price,
    Fundamentals,
    Technical,
    News,
    Historical,
    Options,
    Volume,
}

impl DataType {
    pub const ALL: [Self; 8] = [
        Self::RealTime,
        Self::Price,
        Self::Fundamentals,
        Self::Technical,
        Self::News,
        Self::Historical,
        Self::Options,
        Self::Volume,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RealTime => "real-time",
            Self::Price => "price",
            Self::Fundamentals => "fundamentals",
            Self::Technical => "technical",
            Self::News => "news",
            Self::Historical => "historical",
            Self::Options => "options",
            Self::Volume => "volume",
        }
    }

    /// Types whose value moves tick to tick and therefore expire quickly while trading.
    pub const fn is_volatile(self) -> bool {
        matches!(self, Self::RealTime | Self::Price)
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "real-time" | "realtime" => Ok(Self::RealTime),
            "price" => Ok(Self::Price),
            "fundamentals" => Ok(Self::Fundamentals),
            "technical" => Ok(Self::Technical),
            "news" => Ok(Self::News),
            "historical" => Ok(Self::Historical),
            "options" => Ok(Self::Options),
            "volume" => Ok(Self::Volume),
            _ => Err(ValidationError::InvalidDataType {
                value: value.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("REAL_TIME".parse::<DataType>(), Ok(DataType::RealTime));
        assert_eq!(" Price ".parse::<DataType>(), Ok(DataType::Price));
        assert!(matches!(
            "quotes".parse::<DataType>(),
            Err(ValidationError::InvalidDataType { .. })
        ));
    }

    #[test]
    fn display_matches_serde_name() {
        for data_type in DataType::ALL {
            let json = serde_json::to_string(&data_type).expect("serialize");
            assert_eq!(json, format!("\"{data_type}\""));
        }
    }
}
