//! Semantic message version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid message version '{input}': {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

/// `(major, minor, patch)` with lexicographic ordering.
///
/// Parses from `"major[.minor[.patch]]"`; omitted components default to 0.
/// Compatibility is same-major and at-least-as-new.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl MessageVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// `self` can consume messages produced at `other`: same major and
    /// `self >= other`.
    pub fn is_compatible_with(&self, other: &MessageVersion) -> bool {
        self.major == other.major && self >= other
    }
}

impl fmt::Display for MessageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for MessageVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_component = |part: &str| -> Result<u32, VersionParseError> {
            part.parse::<u32>().map_err(|_| VersionParseError {
                input: s.to_string(),
                reason: format!("component '{part}' is not a non-negative integer"),
            })
        };

        let mut parts = s.split('.');
        let major = match parts.next() {
            Some(p) if !p.is_empty() => parse_component(p)?,
            _ => {
                return Err(VersionParseError {
                    input: s.to_string(),
                    reason: "missing major component".to_string(),
                })
            }
        };
        let minor = parts.next().map(parse_component).transpose()?.unwrap_or(0);
        let patch = parts.next().map(parse_component).transpose()?.unwrap_or(0);

        if parts.next().is_some() {
            return Err(VersionParseError {
                input: s.to_string(),
                reason: "too many components".to_string(),
            });
        }

        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_partial_forms() {
        assert_eq!("2".parse::<MessageVersion>().unwrap(), MessageVersion::new(2, 0, 0));
        assert_eq!(
            "1.3".parse::<MessageVersion>().unwrap(),
            MessageVersion::new(1, 3, 0)
        );
        assert_eq!(
            "1.2.7".parse::<MessageVersion>().unwrap(),
            MessageVersion::new(1, 2, 7)
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<MessageVersion>().is_err());
        assert!("a.b".parse::<MessageVersion>().is_err());
        assert!("1.2.3.4".parse::<MessageVersion>().is_err());
        assert!("-1.0".parse::<MessageVersion>().is_err());
    }

    #[test]
    fn display_parse_round_trip() {
        for v in [
            MessageVersion::new(0, 0, 0),
            MessageVersion::new(1, 2, 3),
            MessageVersion::new(10, 0, 42),
        ] {
            assert_eq!(v.to_string().parse::<MessageVersion>().unwrap(), v);
        }
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(MessageVersion::new(1, 2, 3) < MessageVersion::new(1, 3, 0));
        assert!(MessageVersion::new(1, 9, 9) < MessageVersion::new(2, 0, 0));
        assert!(MessageVersion::new(1, 2, 4) > MessageVersion::new(1, 2, 3));
    }

    #[test]
    fn compatibility_requires_same_major_and_newer() {
        let v13 = MessageVersion::new(1, 3, 0);
        assert!(v13.is_compatible_with(&MessageVersion::new(1, 0, 0)));
        assert!(v13.is_compatible_with(&v13));
        assert!(!v13.is_compatible_with(&MessageVersion::new(1, 4, 0)));
        assert!(!v13.is_compatible_with(&MessageVersion::new(2, 0, 0)));
    }
}
