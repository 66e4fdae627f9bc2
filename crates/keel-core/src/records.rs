//! Log-free repository records: milestones and labels.
//!
//! Unlike tickets these have no cross-entity consistency requirement, so
//! they are plain mutable records behind the store — created, updated, and
//! deleted in place. Renames cascade onto affected tickets at the facade
//! layer as ordinary field changes.

use crate::status::Status;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

const DEFAULT_COLOR: &str = "#888888";

/// A named milestone with a status and an optional due date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub name: String,
    pub status: Status,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<NaiveDate>,
}

impl Milestone {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: Status::Open,
            color: DEFAULT_COLOR.to_string(),
            due: None,
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.status, Status::New | Status::Open)
    }
}

/// A named label with a display color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub color: String,
}

impl Label {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            color: DEFAULT_COLOR.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Label, Milestone};
    use crate::status::Status;

    #[test]
    fn new_milestone_is_open() {
        let ms = Milestone::new("v1.0");
        assert!(ms.is_open());
        assert_eq!(ms.status, Status::Open);
        assert!(ms.due.is_none());
    }

    #[test]
    fn resolved_milestone_is_not_open() {
        let mut ms = Milestone::new("v1.0");
        ms.status = Status::Resolved;
        assert!(!ms.is_open());
    }

    #[test]
    fn records_roundtrip_as_json() {
        let ms = Milestone::new("v2.1");
        let json = serde_json::to_string(&ms).unwrap();
        assert_eq!(ms, serde_json::from_str::<Milestone>(&json).unwrap());

        let label = Label::new("helpdesk");
        let json = serde_json::to_string(&label).unwrap();
        assert_eq!(label, serde_json::from_str::<Label>(&json).unwrap());
    }
}
