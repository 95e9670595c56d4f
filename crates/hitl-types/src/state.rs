//! Workflow state, typed partial updates, and the schema updates are checked against.

use crate::{ApprovalStatus, ChatMessage, HitlError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Field names shared by every workflow variant.
pub mod fields {
    pub const MESSAGES: &str = "messages";
    pub const APPROVAL_STATUS: &str = "approval_status";
    pub const HUMAN_FEEDBACK: &str = "human_feedback";
    pub const REVISION_COUNT: &str = "revision_count";
    pub const USER_QUERY: &str = "user_query";
    pub const FINAL_OUTPUT: &str = "final_output";
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// The accumulated data of one thread: a mapping from field name to JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowState {
    values: Map<String, Value>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from an initial update (no schema check).
    pub fn from_update(update: StateUpdate) -> Self {
        let mut state = Self::new();
        state.apply(update);
        state
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Returns the string at `key`, or `default` when absent or not a string.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or(default).to_owned()
    }

    /// Returns a non-empty string at `key`.
    pub fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get_str(key).filter(|s| !s.trim().is_empty())
    }

    pub fn get_count(&self, key: &str) -> usize {
        self.values
            .get(key)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get_text_list(&self, key: &str) -> Vec<String> {
        match self.values.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn get_text_map(&self, key: &str) -> BTreeMap<String, String> {
        match self.values.get(key) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Conversation history; malformed entries are skipped.
    pub fn messages(&self) -> Vec<ChatMessage> {
        match self.values.get(fields::MESSAGES) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The review decision; absent or unrecognised values read as pending.
    pub fn approval_status(&self) -> ApprovalStatus {
        self.get_str(fields::APPROVAL_STATUS)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    /// Merge `update` into the state. Each field is overwritten wholesale;
    /// a `null` value removes the field.
    pub fn apply(&mut self, update: StateUpdate) {
        for (key, value) in update.fields {
            if value.is_null() {
                self.values.remove(&key);
            } else {
                self.values.insert(key, value);
            }
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ---------------------------------------------------------------------------
// StateUpdate
// ---------------------------------------------------------------------------

/// A partial update returned by a stage or supplied by a caller on resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateUpdate {
    fields: Map<String, Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an update from an arbitrary JSON object.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            Value::Null => Ok(Self::new()),
            other => Err(HitlError::InvalidUpdate {
                field: "<root>".into(),
                message: format!("expected an object, got {other}"),
            }),
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn text(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, Value::String(value.into()))
    }

    pub fn count(self, key: impl Into<String>, value: usize) -> Self {
        self.set(key, Value::from(value as u64))
    }

    pub fn flag(self, key: impl Into<String>, value: bool) -> Self {
        self.set(key, Value::Bool(value))
    }

    pub fn text_list<I, S>(self, key: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<Value> = items
            .into_iter()
            .map(|s| Value::String(s.into()))
            .collect();
        self.set(key, Value::Array(items))
    }

    pub fn text_map(self, key: impl Into<String>, map: &BTreeMap<String, String>) -> Self {
        let object: Map<String, Value> = map
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        self.set(key, Value::Object(object))
    }

    /// Replace the conversation history.
    pub fn messages(self, messages: &[ChatMessage]) -> Self {
        let items: Vec<Value> = messages.iter().map(ChatMessage::to_value).collect();
        self.set(fields::MESSAGES, Value::Array(items))
    }

    pub fn approval(self, status: ApprovalStatus) -> Self {
        self.text(fields::APPROVAL_STATUS, status.as_str())
    }

    /// Remove `key` from the state when applied.
    pub fn clear(self, key: impl Into<String>) -> Self {
        self.set(key, Value::Null)
    }

    /// Fold `other` into `self`; fields in `other` win.
    pub fn merge(mut self, other: StateUpdate) -> Self {
        self.fields.extend(other.fields);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ---------------------------------------------------------------------------
// StateSchema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Boolean,
    TextList,
    TextMap,
    Messages,
    Approval,
    Json,
}

impl FieldKind {
    /// `null` matches every kind (it clears the field).
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            FieldKind::Text => value.is_string(),
            FieldKind::Integer => value.is_u64() || value.is_i64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::TextList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            FieldKind::TextMap => value
                .as_object()
                .is_some_and(|map| map.values().all(Value::is_string)),
            FieldKind::Messages => value.as_array().is_some_and(|items| {
                items
                    .iter()
                    .all(|item| serde_json::from_value::<ChatMessage>(item.clone()).is_ok())
            }),
            FieldKind::Approval => value
                .as_str()
                .is_some_and(|s| s.parse::<ApprovalStatus>().is_ok()),
            FieldKind::Json => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::TextList => "list of text",
            FieldKind::TextMap => "map of text",
            FieldKind::Messages => "message list",
            FieldKind::Approval => "approval status",
            FieldKind::Json => "json",
        }
    }
}

/// Declared fields of one workflow variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSchema {
    fields: BTreeMap<String, FieldKind>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema pre-populated with the review-control fields every variant shares.
    pub fn with_review_fields() -> Self {
        Self::new()
            .field(fields::MESSAGES, FieldKind::Messages)
            .field(fields::APPROVAL_STATUS, FieldKind::Approval)
            .field(fields::HUMAN_FEEDBACK, FieldKind::Text)
            .field(fields::REVISION_COUNT, FieldKind::Integer)
            .field(fields::USER_QUERY, FieldKind::Text)
            .field(fields::FINAL_OUTPUT, FieldKind::Text)
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    pub fn kind(&self, name: &str) -> Option<FieldKind> {
        self.fields.get(name).copied()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Reject unknown fields and values of the wrong kind.
    pub fn validate(&self, update: &StateUpdate) -> Result<()> {
        for (name, value) in update.iter() {
            let kind = self.kind(name).ok_or_else(|| HitlError::InvalidUpdate {
                field: name.clone(),
                message: "field is not declared for this workflow".into(),
            })?;
            if !kind.accepts(value) {
                return Err(HitlError::InvalidUpdate {
                    field: name.clone(),
                    message: format!("expected {}", kind.name()),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> StateSchema {
        StateSchema::with_review_fields()
            .field("plan", FieldKind::TextList)
            .field("edits", FieldKind::TextMap)
            .field("payload", FieldKind::Json)
    }

    // --- apply ---

    #[test]
    fn apply_overwrites_fields() {
        let mut state = WorkflowState::from_update(StateUpdate::new().text("a", "one"));
        state.apply(StateUpdate::new().text("a", "two").count("b", 3));
        assert_eq!(state.get_str("a"), Some("two"));
        assert_eq!(state.get_count("b"), 3);
    }

    #[test]
    fn apply_replaces_sequences_wholesale() {
        let mut state =
            WorkflowState::from_update(StateUpdate::new().text_list("plan", ["a", "b", "c"]));
        state.apply(StateUpdate::new().text_list("plan", ["x"]));
        assert_eq!(state.get_text_list("plan"), vec!["x".to_string()]);
    }

    #[test]
    fn apply_null_clears_field() {
        let mut state = WorkflowState::from_update(StateUpdate::new().text("human_feedback", "hi"));
        state.apply(StateUpdate::new().clear("human_feedback"));
        assert!(!state.contains("human_feedback"));
    }

    #[test]
    fn untouched_fields_are_preserved() {
        let mut state = WorkflowState::from_update(StateUpdate::new().text("keep", "me"));
        state.apply(StateUpdate::new().text("other", "x"));
        assert_eq!(state.get_str("keep"), Some("me"));
    }

    // --- accessors ---

    #[test]
    fn messages_roundtrip_through_update() {
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let state = WorkflowState::from_update(StateUpdate::new().messages(&history));
        assert_eq!(state.messages(), history);
    }

    #[test]
    fn approval_status_defaults_to_pending() {
        let state = WorkflowState::new();
        assert_eq!(state.approval_status(), ApprovalStatus::Pending);
        let state =
            WorkflowState::from_update(StateUpdate::new().approval(ApprovalStatus::Approved));
        assert_eq!(state.approval_status(), ApprovalStatus::Approved);
    }

    #[test]
    fn text_map_accessor() {
        let mut edits = BTreeMap::new();
        edits.insert("sentence_0".to_string(), "Hi.".to_string());
        let state = WorkflowState::from_update(StateUpdate::new().text_map("edits", &edits));
        assert_eq!(state.get_text_map("edits"), edits);
        assert!(state.get_text_map("missing").is_empty());
    }

    #[test]
    fn get_nonempty_skips_blank() {
        let state = WorkflowState::from_update(StateUpdate::new().text("f", "  "));
        assert!(state.get_nonempty("f").is_none());
    }

    // --- schema ---

    #[test]
    fn schema_accepts_declared_fields() {
        let update = StateUpdate::new()
            .text_list("plan", ["Intro"])
            .approval(ApprovalStatus::Feedback)
            .count("revision_count", 2)
            .set("payload", json!({"anything": [1, 2]}));
        assert!(schema().validate(&update).is_ok());
    }

    #[test]
    fn schema_rejects_unknown_field() {
        let update = StateUpdate::new().text("bogus", "x");
        let err = schema().validate(&update).unwrap_err();
        assert!(matches!(err, HitlError::InvalidUpdate { ref field, .. } if field == "bogus"));
    }

    #[test]
    fn schema_rejects_kind_mismatch() {
        let update = StateUpdate::new().set("plan", json!([1, 2]));
        assert!(schema().validate(&update).is_err());

        let update = StateUpdate::new().text("approval_status", "maybe");
        assert!(schema().validate(&update).is_err());

        let update = StateUpdate::new().set("messages", json!([{"role": "robot", "content": "x"}]));
        assert!(schema().validate(&update).is_err());
    }

    #[test]
    fn schema_accepts_null_for_any_kind() {
        let update = StateUpdate::new().clear("plan").clear("human_feedback");
        assert!(schema().validate(&update).is_ok());
    }

    #[test]
    fn update_from_json_requires_object() {
        assert!(StateUpdate::from_json(json!({"a": 1})).is_ok());
        assert!(StateUpdate::from_json(json!(null)).unwrap().is_empty());
        assert!(StateUpdate::from_json(json!([1])).is_err());
    }

    #[test]
    fn merge_prefers_later_fields() {
        let merged = StateUpdate::new()
            .text("a", "1")
            .merge(StateUpdate::new().text("a", "2").text("b", "3"));
        assert_eq!(merged.get("a"), Some(&json!("2")));
        assert_eq!(merged.len(), 2);
    }
}
