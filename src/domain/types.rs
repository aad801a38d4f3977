//! Core identifier and enum types shared across the crate.
//!
//! Newtype wrappers keep image identifiers from being mixed up with
//! model identifiers or plain paths.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable, unique identifier for an indexed image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ImageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Which embedding backend family is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    /// In-process model inference.
    Local,
    /// Remote embedding service.
    Api,
}

impl ModeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown mode name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid mode '{0}', expected 'local' or 'api'")]
pub struct ParseModeError(pub String);

impl FromStr for ModeKind {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "api" => Ok(Self::Api),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

/// Relative quality/cost tier of a local model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Low,
    Medium,
    High,
}

impl fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_id_equality() {
        assert_eq!(ImageId::from("cat.png"), ImageId("cat.png".to_string()));
        assert_ne!(ImageId::from("cat.png"), ImageId::from("dog.png"));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("local".parse::<ModeKind>().unwrap(), ModeKind::Local);
        assert_eq!(" API ".parse::<ModeKind>().unwrap(), ModeKind::Api);
        assert_eq!(
            "remote".parse::<ModeKind>(),
            Err(ParseModeError("remote".to_string()))
        );
    }

    #[test]
    fn mode_serialization() {
        assert_eq!(serde_json::to_string(&ModeKind::Api).unwrap(), "\"api\"");
        let mode: ModeKind = serde_json::from_str("\"local\"").unwrap();
        assert_eq!(mode, ModeKind::Local);
    }

    #[test]
    fn performance_tier_serialization() {
        let json = serde_json::to_string(&PerformanceTier::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
        assert_eq!(PerformanceTier::High.to_string(), "high");
    }
}
