//! Timezone selection for renewal schedules.

use chrono_tz::Tz;
use questcycle_common::{ConfigError, ConfigResult};
use std::fmt;

/// Config value that selects the host's local timezone.
pub const SYSTEM_DEFAULT_ZONE: &str = "SystemDefault";

/// Timezone a schedule is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewZone {
    /// The host's local timezone.
    System,
    /// An IANA timezone.
    Named(Tz),
}

impl RenewZone {
    /// UTC, mostly for tests and servers that want a fixed reference.
    pub const UTC: Self = Self::Named(Tz::UTC);

    /// Parses `SystemDefault` (any case) or an IANA identifier.
    pub fn parse(raw: &str) -> ConfigResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(SYSTEM_DEFAULT_ZONE) {
            return Ok(Self::System);
        }
        trimmed
            .parse::<Tz>()
            .map(Self::Named)
            .map_err(|_| ConfigError::InvalidZone {
                value: raw.to_string(),
            })
    }
}

impl Default for RenewZone {
    fn default() -> Self {
        Self::System
    }
}

impl fmt::Display for RenewZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str(SYSTEM_DEFAULT_ZONE),
            Self::Named(tz) => f.write_str(tz.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_default() {
        assert_eq!(RenewZone::parse("SystemDefault").expect("valid"), RenewZone::System);
        assert_eq!(RenewZone::parse("systemdefault").expect("valid"), RenewZone::System);
    }

    #[test]
    fn test_parse_named() {
        let zone = RenewZone::parse("Europe/Paris").expect("valid");
        assert_eq!(zone, RenewZone::Named(Tz::Europe__Paris));
        assert_eq!(zone.to_string(), "Europe/Paris");
    }

    #[test]
    fn test_parse_unknown() {
        assert!(matches!(
            RenewZone::parse("Mars/Olympus"),
            Err(ConfigError::InvalidZone { .. })
        ));
    }
}
