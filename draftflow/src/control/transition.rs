//! Transition records.

use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A validated move between stages, as stored in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Unique identifier for this record.
    pub id: Uuid,
    /// The stage the flow left.
    pub from: Stage,
    /// The stage the flow entered.
    pub to: Stage,
    /// When the transition was recorded.
    pub at: DateTime<Utc>,
    /// Why the transition happened.
    pub reason: String,
    /// Free-form context attached by the caller.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Transition {
    /// Creates a transition record stamped now.
    #[must_use]
    pub fn new(from: Stage, to: Stage, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            at: Utc::now(),
            reason: reason.into(),
            metadata: HashMap::new(),
        }
    }

    /// Replaces the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_metadata_entry(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("id".to_string(), serde_json::json!(self.id.to_string()));
        map.insert("from".to_string(), serde_json::json!(self.from.as_str()));
        map.insert("to".to_string(), serde_json::json!(self.to.as_str()));
        map.insert("at".to_string(), serde_json::json!(self.at.to_rfc3339()));
        map.insert("reason".to_string(), serde_json::json!(self.reason));
        if !self.metadata.is_empty() {
            map.insert("metadata".to_string(), serde_json::json!(self.metadata));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_new() {
        let t = Transition::new(Stage::InputValidation, Stage::Research, "validation passed");
        assert_eq!(t.from, Stage::InputValidation);
        assert_eq!(t.to, Stage::Research);
        assert_eq!(t.reason, "validation passed");
        assert!(t.metadata.is_empty());
    }

    #[test]
    fn test_transition_metadata_builder() {
        let t = Transition::new(Stage::Research, Stage::AudienceAlign, "research done")
            .with_metadata_entry("sources", serde_json::json!(4))
            .with_metadata_entry("cache_hit", serde_json::json!(false));

        assert_eq!(t.metadata.len(), 2);
        assert_eq!(t.metadata.get("sources").unwrap(), 4);
    }

    #[test]
    fn test_transition_to_dict() {
        let t = Transition::new(Stage::QualityCheck, Stage::Finalized, "quality passed");
        let dict = t.to_dict();
        assert_eq!(dict.get("from").unwrap(), "quality_check");
        assert_eq!(dict.get("to").unwrap(), "finalized");
        assert_eq!(dict.get("reason").unwrap(), "quality passed");
        assert!(!dict.contains_key("metadata"));
    }
}
