//! Core data types that flow through the engine.
//!
//! A [`MutationRequest`] names a batch of [`ItemRef`]s and one [`Operation`].
//! The coordinator answers with one [`MutationOutcome`] per item.
//!
//! # Example
//!
//! ```
//! use batch_sync_engine::{ItemRef, MutationRequest, Operation, OperationKind};
//!
//! let request = MutationRequest::new(
//!     vec![ItemRef::synced("b-1"), ItemRef::local("draft-7")],
//!     Operation::Cancel,
//!     "admin@example.com",
//! );
//! assert_eq!(request.operation.kind(), OperationKind::Cancel);
//! assert!(request.items[1].is_local_only());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies a target row.
///
/// `key` is the caller's identity for the row; `sor_id` is present once the
/// row exists in the system of record. The two may differ, e.g. a draft
/// that was synced later keeps its draft key. Cached SoR state is always
/// keyed by `sor_id`. Local-only rows never reach the SoR client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sor_id: Option<String>,
}

impl ItemRef {
    /// A row that exists in the SoR; the mirror key is the SoR id.
    pub fn synced(id: impl Into<String>) -> Self {
        let id = id.into();
        Self { key: id.clone(), sor_id: Some(id) }
    }

    /// A row that only exists in the mirror.
    pub fn local(key: impl Into<String>) -> Self {
        Self { key: key.into(), sor_id: None }
    }

    #[must_use]
    pub fn is_local_only(&self) -> bool {
        self.sor_id.is_none()
    }

    /// Identity of the row's mirror record: the SoR id once synced, the
    /// local key before that.
    #[must_use]
    pub fn record_id(&self) -> &str {
        self.sor_id.as_deref().unwrap_or(&self.key)
    }
}

impl std::fmt::Display for ItemRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sor_id {
            Some(id) if id != &self.key => write!(f, "{}({})", self.key, id),
            Some(_) => write!(f, "{}", self.key),
            None => write!(f, "{}(local)", self.key),
        }
    }
}

/// Lifecycle status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Active,
    Cancelled,
    /// Terminal: the underlying event took place
    Completed,
}

impl ItemStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "cancelled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an item as held by the SoR (and approximated by the mirror).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemState {
    pub status: ItemStatus,
    #[serde(default)]
    pub attended: Option<bool>,
    /// Parent subject (e.g., `exam:42`) whose active-count this item feeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
}

/// SoR property names.
pub mod fields {
    pub const STATUS: &str = "status";
    pub const ATTENDED: &str = "attended";
    pub const SUBJECT: &str = "subject";
    pub const CAPACITY: &str = "capacity";
    pub const ACTIVE_COUNT: &str = "active_count";

    /// Everything the filter needs to classify an item.
    pub const ITEM_FIELDS: [&str; 4] = [STATUS, ATTENDED, SUBJECT, CAPACITY];
}

impl ItemState {
    pub fn active(subject: Option<&str>) -> Self {
        Self {
            status: ItemStatus::Active,
            attended: None,
            subject: subject.map(str::to_string),
            capacity: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Parse SoR properties. Unknown properties are ignored.
    pub fn from_properties(props: &Map<String, Value>) -> Result<Self, String> {
        let status = props
            .get(fields::STATUS)
            .and_then(Value::as_str)
            .ok_or_else(|| "missing status".to_string())?;
        let status = ItemStatus::parse(status).ok_or_else(|| format!("unknown status '{}'", status))?;

        Ok(Self {
            status,
            attended: props.get(fields::ATTENDED).and_then(Value::as_bool),
            subject: props.get(fields::SUBJECT).and_then(Value::as_str).map(String::from),
            capacity: props.get(fields::CAPACITY).and_then(Value::as_u64),
        })
    }

    #[must_use]
    pub fn to_properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert(fields::STATUS.into(), Value::String(self.status.as_str().into()));
        props.insert(
            fields::ATTENDED.into(),
            self.attended.map_or(Value::Null, Value::Bool),
        );
        if let Some(ref subject) = self.subject {
            props.insert(fields::SUBJECT.into(), Value::String(subject.clone()));
        }
        if let Some(capacity) = self.capacity {
            props.insert(fields::CAPACITY.into(), Value::from(capacity));
        }
        props
    }

    /// State after `op` has been applied. Assumes the transition was allowed.
    #[must_use]
    pub fn apply(&self, op: &Operation) -> Self {
        let mut next = self.clone();
        match op {
            Operation::Cancel => next.status = ItemStatus::Cancelled,
            Operation::SetAttendance { attended } => next.attended = *attended,
            Operation::AdjustCounter { value } => next.capacity = Some(*value),
        }
        next
    }

    /// Only the properties `op` changes; this is what gets written to the SoR.
    #[must_use]
    pub fn delta_properties(op: &Operation) -> Map<String, Value> {
        let mut props = Map::new();
        match op {
            Operation::Cancel => {
                props.insert(fields::STATUS.into(), Value::String(ItemStatus::Cancelled.as_str().into()));
            }
            Operation::SetAttendance { attended } => {
                props.insert(fields::ATTENDED.into(), attended.map_or(Value::Null, Value::Bool));
            }
            Operation::AdjustCounter { value } => {
                props.insert(fields::CAPACITY.into(), Value::from(*value));
            }
        }
        props
    }
}

/// Operation discriminant, used as the transition table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Cancel,
    SetAttendance,
    AdjustCounter,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::SetAttendance => "set_attendance",
            Self::AdjustCounter => "adjust_counter",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation with its payload. Every variant is idempotent per item:
/// all of them describe a target state, never a relative change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    Cancel,
    SetAttendance { attended: Option<bool> },
    /// Set the item's capacity counter to `value`
    AdjustCounter { value: u64 },
}

impl Operation {
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Cancel => OperationKind::Cancel,
            Self::SetAttendance { .. } => OperationKind::SetAttendance,
            Self::AdjustCounter { .. } => OperationKind::AdjustCounter,
        }
    }
}

/// A batch of items to mutate. Consumed once by the coordinator, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub items: Vec<ItemRef>,
    #[serde(flatten)]
    pub operation: Operation,
    /// Identity for audit logs
    pub actor: String,
}

impl MutationRequest {
    pub fn new(items: Vec<ItemRef>, operation: Operation, actor: impl Into<String>) -> Self {
        Self { items, operation, actor: actor.into() }
    }
}

/// Why an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    NotFound,
    InvalidTransition,
    RateLimited,
    Transport,
    ProviderRejected,
    MirrorWrite,
}

impl FailureCode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::RateLimited => "RATE_LIMITED",
            Self::Transport => "TRANSPORT",
            Self::ProviderRejected => "PROVIDER_REJECTED",
            Self::MirrorWrite => "MIRROR_WRITE",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final per-item result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutationOutcome {
    Succeeded { item: ItemRef, state: ItemState },
    Skipped { item: ItemRef, reason: String },
    Failed { item: ItemRef, code: FailureCode, message: String },
}

impl MutationOutcome {
    #[must_use]
    pub fn item(&self) -> &ItemRef {
        match self {
            Self::Succeeded { item, .. } | Self::Skipped { item, .. } | Self::Failed { item, .. } => item,
        }
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    #[must_use]
    pub fn failure_code(&self) -> Option<FailureCode> {
        match self {
            Self::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_ref_constructors() {
        let synced = ItemRef::synced("b-1");
        assert_eq!(synced.sor_id.as_deref(), Some("b-1"));
        assert!(!synced.is_local_only());
        assert_eq!(synced.to_string(), "b-1");

        let local = ItemRef::local("draft-1");
        assert!(local.is_local_only());
        assert_eq!(local.to_string(), "draft-1(local)");
    }

    #[test]
    fn test_state_properties_roundtrip_keeps_nulls() {
        let state = ItemState::active(Some("exam:42"));
        let props = state.to_properties();
        assert_eq!(props.get("attended"), Some(&Value::Null));
        assert_eq!(ItemState::from_properties(&props).unwrap(), state);
    }

    #[test]
    fn test_state_from_properties_rejects_unknown_status() {
        let props = json!({"status": "archived"});
        let err = ItemState::from_properties(props.as_object().unwrap()).unwrap_err();
        assert!(err.contains("archived"));
    }

    #[test]
    fn test_apply_and_delta() {
        let state = ItemState::active(Some("exam:1"));

        let cancelled = state.apply(&Operation::Cancel);
        assert_eq!(cancelled.status, ItemStatus::Cancelled);
        assert_eq!(cancelled.subject.as_deref(), Some("exam:1"));

        let attended = state.apply(&Operation::SetAttendance { attended: Some(true) });
        assert_eq!(attended.attended, Some(true));
        assert_eq!(attended.status, ItemStatus::Active);

        let delta = ItemState::delta_properties(&Operation::AdjustCounter { value: 12 });
        assert_eq!(delta.len(), 1);
        assert_eq!(delta["capacity"], json!(12));
    }

    #[test]
    fn test_request_wire_shape() {
        let request: MutationRequest = serde_json::from_value(json!({
            "items": [{"key": "b-1", "sor_id": "b-1"}, {"key": "d-2"}],
            "operation": "set_attendance",
            "attended": null,
            "actor": "ops"
        }))
        .unwrap();

        assert_eq!(request.operation, Operation::SetAttendance { attended: None });
        assert!(request.items[1].is_local_only());
    }

    #[test]
    fn test_failure_code_serializes_screaming() {
        assert_eq!(serde_json::to_value(FailureCode::RateLimited).unwrap(), json!("RATE_LIMITED"));
        assert_eq!(FailureCode::NotFound.to_string(), "NOT_FOUND");
    }
}
