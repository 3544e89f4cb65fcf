//! Activity tokens: externally-scheduled work markers.
//!
//! The host scheduler only keeps background sync eligible to run while the
//! engine holds live activity tokens. A token is created (or adopted, when the
//! scheduler triggered us) before work starts and ended afterwards with one of
//! several end actions. Tokens are owned by exactly one [`set::ActivitySet`]
//! at a time; everything else refers to them by name.

pub mod backend;
pub mod set;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use backend::{ActivityBackend, ActivityId, StartOutcome};
pub use set::{ActivitySet, ActivitySetState, ActivitySetStatus};

/// Why the token exists, carried through to the scheduler payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPurpose {
    /// One-off work marker.
    Generic,
    /// Database watch that re-triggers sync when the folder changes.
    Watch,
    /// Scheduled (interval or retry) sync trigger.
    ScheduledSync,
}

/// Lifecycle state of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    /// Known locally, not yet created with the scheduler.
    NeedsCreation,
    /// Scheduler-created (we were triggered by it), not yet adopted.
    NeedsAdoption,
    CreatePending,
    AdoptPending,
    /// Created but gated on an external condition (e.g. network).
    Waiting,
    Active,
    CompletePending,
    CancelPending,
    Ended,
}

/// What to do with the token when its set ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndAction {
    /// Complete without restarting.
    Complete,
    /// Complete and restart with an updated payload.
    Restart,
    /// Cancel outright.
    Cancel,
    /// Drop our subscription, leaving the scheduler's copy alone.
    Unsubscribe,
}

/// Relative ordering when a set ends its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOrder {
    First,
    Default,
    Last,
}

/// Description used to create or adopt a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySpec {
    /// Unique name; identity within a set and with the scheduler.
    pub name: String,
    pub purpose: ActivityPurpose,
    /// Scheduler payload for creation (requirements, schedule, callback).
    #[serde(default)]
    pub payload: Option<Value>,
    /// Id of an already-existing scheduler activity to adopt instead of
    /// creating a new one.
    #[serde(default)]
    pub adopt_id: Option<ActivityId>,
    /// Replace an existing scheduler activity of the same name on creation.
    #[serde(default)]
    pub replace: bool,
    #[serde(default = "EndOrder::default_order")]
    pub end_order: EndOrder,
}

impl EndOrder {
    fn default_order() -> EndOrder {
        EndOrder::Default
    }
}

impl ActivitySpec {
    pub fn new(name: impl Into<String>, purpose: ActivityPurpose) -> Self {
        Self {
            name: name.into(),
            purpose,
            payload: None,
            adopt_id: None,
            replace: false,
            end_order: EndOrder::Default,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn adopting(mut self, id: ActivityId) -> Self {
        self.adopt_id = Some(id);
        self
    }

    pub fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }

    pub fn with_end_order(mut self, order: EndOrder) -> Self {
        self.end_order = order;
        self
    }
}

/// One activity token. Owned by an [`ActivitySet`]; not constructed directly
/// by callers.
#[derive(Debug, Clone)]
pub struct ActivityToken {
    pub(crate) spec: ActivitySpec,
    pub(crate) state: ActivityState,
    pub(crate) end_action: EndAction,
    pub(crate) external_id: Option<ActivityId>,
    /// Payload applied before completion when `end_action` is `Restart`.
    pub(crate) update_payload: Option<Value>,
}

impl ActivityToken {
    pub(crate) fn new(spec: ActivitySpec) -> Self {
        let (state, external_id) = match &spec.adopt_id {
            Some(id) => (ActivityState::NeedsAdoption, Some(id.clone())),
            None => (ActivityState::NeedsCreation, None),
        };
        Self { spec, state, end_action: EndAction::Unsubscribe, external_id, update_payload: None }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn purpose(&self) -> ActivityPurpose {
        self.spec.purpose
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn end_order(&self) -> EndOrder {
        self.spec.end_order
    }

    /// A start (create or adopt) call is outstanding.
    pub fn is_starting(&self) -> bool {
        matches!(self.state, ActivityState::CreatePending | ActivityState::AdoptPending)
    }

    /// Created with the scheduler but gated on an external condition; such a
    /// token may be ended without waiting for it to become active.
    pub fn is_waiting_to_start(&self) -> bool {
        self.state == ActivityState::Waiting
    }

    pub fn is_active(&self) -> bool {
        self.state == ActivityState::Active
    }

    /// An end (complete/cancel) call is outstanding.
    pub fn is_ending(&self) -> bool {
        matches!(self.state, ActivityState::CompletePending | ActivityState::CancelPending)
    }

    pub fn can_start(&self) -> bool {
        matches!(self.state, ActivityState::NeedsCreation | ActivityState::NeedsAdoption)
    }

    pub(crate) fn set_end_action(&mut self, action: EndAction) {
        self.end_action = action;
    }

    pub(crate) fn set_update_payload(&mut self, payload: Value) {
        self.update_payload = Some(payload);
    }

    pub fn describe(&self) -> String {
        match &self.external_id {
            Some(id) => format!("{} (activity {})", self.spec.name, id),
            None => self.spec.name.clone(),
        }
    }
}

/// Status snapshot of one token, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityTokenStatus {
    pub name: String,
    pub purpose: ActivityPurpose,
    pub state: ActivityState,
    pub end_action: EndAction,
    pub end_order: EndOrder,
    pub external_id: Option<ActivityId>,
}

impl From<&ActivityToken> for ActivityTokenStatus {
    fn from(token: &ActivityToken) -> Self {
        Self {
            name: token.spec.name.clone(),
            purpose: token.spec.purpose,
            state: token.state,
            end_action: token.end_action,
            end_order: token.spec.end_order,
            external_id: token.external_id.clone(),
        }
    }
}
