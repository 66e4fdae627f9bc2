use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The ticket kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Request,
    Task,
    Bug,
    Enhancement,
    Proposal,
}

impl Kind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Enhancement => "enhancement",
            Self::Proposal => "proposal",
        }
    }
}

impl Default for Kind {
    fn default() -> Self {
        Self::Request
    }
}

/// Ticket lifecycle states.
///
/// `New` and `Open` are the live states; everything else is terminal. A
/// deleted ticket is marked `Invalid` in backends that tombstone rather
/// than erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    New,
    Open,
    Resolved,
    Fixed,
    Merged,
    Wontfix,
    Declined,
    Duplicate,
    Invalid,
    #[serde(rename = "on_hold")]
    OnHold,
}

impl Status {
    const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Fixed => "fixed",
            Self::Merged => "merged",
            Self::Wontfix => "wontfix",
            Self::Declined => "declined",
            Self::Duplicate => "duplicate",
            Self::Invalid => "invalid",
            Self::OnHold => "on_hold",
        }
    }

    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        !matches!(self, Self::New | Self::Open)
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::New
    }
}

/// Human-assigned scheduling priority. Defaults to `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Impact assessment, independent of priority. Defaults to `Unrated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unrated,
    Negligible,
    Minor,
    Serious,
    Critical,
    Catastrophic,
}

impl Severity {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Unrated => "unrated",
            Self::Negligible => "negligible",
            Self::Minor => "minor",
            Self::Serious => "serious",
            Self::Critical => "critical",
            Self::Catastrophic => "catastrophic",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::Unrated
    }
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize(input: &str) -> String {
    input.trim().to_ascii_lowercase()
}

impl FromStr for Kind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "request" => Ok(Self::Request),
            "task" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            "enhancement" => Ok(Self::Enhancement),
            "proposal" => Ok(Self::Proposal),
            _ => Err(ParseEnumError {
                expected: "kind",
                got: s.to_string(),
            }),
        }
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "new" => Ok(Self::New),
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            "fixed" => Ok(Self::Fixed),
            "merged" => Ok(Self::Merged),
            "wontfix" => Ok(Self::Wontfix),
            "declined" => Ok(Self::Declined),
            "duplicate" => Ok(Self::Duplicate),
            "invalid" => Ok(Self::Invalid),
            "on_hold" | "on hold" => Ok(Self::OnHold),
            _ => Err(ParseEnumError {
                expected: "status",
                got: s.to_string(),
            }),
        }
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(ParseEnumError {
                expected: "priority",
                got: s.to_string(),
            }),
        }
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "unrated" => Ok(Self::Unrated),
            "negligible" => Ok(Self::Negligible),
            "minor" => Ok(Self::Minor),
            "serious" => Ok(Self::Serious),
            "critical" => Ok(Self::Critical),
            "catastrophic" => Ok(Self::Catastrophic),
            _ => Err(ParseEnumError {
                expected: "severity",
                got: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Kind, Priority, Severity, Status};
    use std::str::FromStr;

    #[test]
    fn display_parse_roundtrips() {
        for value in [
            Kind::Request,
            Kind::Task,
            Kind::Bug,
            Kind::Enhancement,
            Kind::Proposal,
        ] {
            assert_eq!(value, Kind::from_str(&value.to_string()).unwrap());
        }

        for value in [
            Status::New,
            Status::Open,
            Status::Resolved,
            Status::Fixed,
            Status::Merged,
            Status::Wontfix,
            Status::Declined,
            Status::Duplicate,
            Status::Invalid,
            Status::OnHold,
        ] {
            assert_eq!(value, Status::from_str(&value.to_string()).unwrap());
        }

        for value in [
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Urgent,
        ] {
            assert_eq!(value, Priority::from_str(&value.to_string()).unwrap());
        }

        for value in [
            Severity::Unrated,
            Severity::Negligible,
            Severity::Minor,
            Severity::Serious,
            Severity::Critical,
            Severity::Catastrophic,
        ] {
            assert_eq!(value, Severity::from_str(&value.to_string()).unwrap());
        }
    }

    #[test]
    fn closed_states() {
        assert!(!Status::New.is_closed());
        assert!(!Status::Open.is_closed());
        assert!(Status::Resolved.is_closed());
        assert!(Status::Fixed.is_closed());
        assert!(Status::Merged.is_closed());
        assert!(Status::Wontfix.is_closed());
        assert!(Status::Declined.is_closed());
        assert!(Status::Duplicate.is_closed());
        assert!(Status::Invalid.is_closed());
        assert!(Status::OnHold.is_closed());
    }

    #[test]
    fn defaults() {
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Severity::default(), Severity::Unrated);
        assert_eq!(Status::default(), Status::New);
    }

    #[test]
    fn parse_rejects_unknown_values() {
        assert!(Kind::from_str("epic").is_err());
        assert!(Status::from_str("active").is_err());
        assert!(Priority::from_str("hot").is_err());
        assert!(Severity::from_str("mega").is_err());
    }

    #[test]
    fn json_uses_lowercase_names() {
        assert_eq!(serde_json::to_string(&Kind::Bug).unwrap(), "\"bug\"");
        assert_eq!(
            serde_json::to_string(&Status::OnHold).unwrap(),
            "\"on_hold\""
        );
        assert_eq!(
            serde_json::from_str::<Priority>("\"urgent\"").unwrap(),
            Priority::Urgent
        );
    }
}
