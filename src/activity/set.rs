//! Activity sets: grouped start/end of activity tokens.
//!
//! A set owns its member tokens and runs at most one start or end cycle at a
//! time; that guard is what prevents the engine from double-issuing create or
//! adopt calls for the same logical work token. Ending is ordered: tokens are
//! drained in three buckets (first, default, last), each bucket only once the
//! previous one has fully settled.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use tracing::{debug, error, warn};

use crate::activity::backend::{ActivityBackend, ActivityId};
use crate::activity::{
    ActivityPurpose, ActivitySpec, ActivityState, ActivityToken, ActivityTokenStatus, EndAction,
    EndOrder,
};
use crate::error::{MailError, Result};

/// Cycle state of the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivitySetState {
    Idle,
    Starting,
    Ending,
}

/// Diagnostics snapshot of a set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySetStatus {
    pub state: ActivitySetState,
    pub activities: Vec<ActivityTokenStatus>,
}

#[derive(Debug)]
struct SetInner {
    state: ActivitySetState,
    tokens: Vec<ActivityToken>,
    /// First error reported by a member during the current or most recent
    /// cycle. Does not abort sibling operations.
    error: Option<MailError>,
}

/// A collection of activity tokens started and ended together.
#[derive(Debug)]
pub struct ActivitySet {
    inner: Mutex<SetInner>,
}

enum StartKind {
    Create(ActivitySpec),
    Adopt(ActivityId),
}

enum EndKind {
    Complete(ActivityId, Option<Value>),
    Cancel(ActivityId),
    Unsubscribe(ActivityId),
    /// Token never reached the scheduler; nothing to call.
    Local,
}

impl Default for ActivitySet {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivitySet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SetInner {
                state: ActivitySetState::Idle,
                tokens: Vec::new(),
                error: None,
            }),
        }
    }

    /// Add a token described by `spec`. Idempotent: a token with the same name
    /// is left alone and `false` is returned.
    pub fn add(&self, spec: ActivitySpec) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.tokens.iter().any(|t| t.name() == spec.name) {
            return false;
        }
        debug!(activity = %spec.name, "adding activity to set");
        inner.tokens.push(ActivityToken::new(spec));
        true
    }

    /// Remove a token by name from the set and all internal tracking.
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.tokens.len();
        inner.tokens.retain(|t| t.name() != name);
        inner.tokens.len() != before
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().tokens.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().tokens.iter().any(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> ActivitySetState {
        self.inner.lock().unwrap().state
    }

    /// Names of member tokens with the given purpose.
    pub fn names_with_purpose(&self, purpose: ActivityPurpose) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .tokens
            .iter()
            .filter(|t| t.purpose() == purpose)
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Find-or-create a named token and mark it to be restarted with `payload`
    /// when the set ends.
    pub fn replace(&self, name: &str, purpose: ActivityPurpose, payload: Value) {
        let mut inner = self.inner.lock().unwrap();
        let token = Self::get_or_create(&mut inner.tokens, name, purpose);
        token.set_end_action(EndAction::Restart);
        token.set_update_payload(payload);
    }

    /// Find-or-create a named token and mark it to be cancelled when the set
    /// ends.
    pub fn cancel(&self, name: &str, purpose: ActivityPurpose) {
        let mut inner = self.inner.lock().unwrap();
        let token = Self::get_or_create(&mut inner.tokens, name, purpose);
        token.set_end_action(EndAction::Cancel);
    }

    /// Override the end action of every member.
    pub fn set_end_action_all(&self, action: EndAction) {
        let mut inner = self.inner.lock().unwrap();
        for token in &mut inner.tokens {
            token.set_end_action(action);
        }
    }

    /// Transfer ownership of every member token to `other`. Tokens already
    /// present in `other` (by name) are dropped rather than duplicated.
    pub fn pass_to(&self, other: &ActivitySet) {
        let tokens = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.tokens)
        };
        let mut other_inner = other.inner.lock().unwrap();
        for token in tokens {
            if !other_inner.tokens.iter().any(|t| t.name() == token.name()) {
                other_inner.tokens.push(token);
            }
        }
    }

    /// Take the first member error captured during the most recent cycle.
    pub fn take_error(&self) -> Option<MailError> {
        self.inner.lock().unwrap().error.take()
    }

    pub fn status(&self) -> ActivitySetStatus {
        let inner = self.inner.lock().unwrap();
        ActivitySetStatus {
            state: inner.state,
            activities: inner.tokens.iter().map(ActivityTokenStatus::from).collect(),
        }
    }

    /// Start (create or adopt) every member that needs it.
    ///
    /// Fails without touching any token if a start or end cycle is already in
    /// flight. Member errors are captured (first wins) and the failing token
    /// removed; siblings are unaffected. Returns once every tracked token has
    /// reported its start outcome.
    pub async fn start_activities(&self, backend: &dyn ActivityBackend) -> Result<()> {
        let ops: Vec<(String, StartKind)> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ActivitySetState::Idle {
                return Err(MailError::internal("activity set already starting or ending"));
            }
            inner.state = ActivitySetState::Starting;

            let mut ops = Vec::new();
            for token in &mut inner.tokens {
                if !token.can_start() {
                    continue;
                }
                match &token.external_id {
                    Some(id) => {
                        token.state = ActivityState::AdoptPending;
                        ops.push((token.name().to_string(), StartKind::Adopt(id.clone())));
                    }
                    None => {
                        token.state = ActivityState::CreatePending;
                        ops.push((token.name().to_string(), StartKind::Create(token.spec.clone())));
                    }
                }
            }
            ops
        };

        let results = join_all(ops.into_iter().map(|(name, kind)| async move {
            let result = match &kind {
                StartKind::Create(spec) => backend.create(spec).await,
                StartKind::Adopt(id) => backend.adopt(id).await,
            };
            (name, result)
        }))
        .await;

        let mut inner = self.inner.lock().unwrap();
        for (name, result) in results {
            match result {
                Ok(outcome) => {
                    if let Some(token) = inner.tokens.iter_mut().find(|t| t.name() == name) {
                        token.external_id = Some(outcome.id);
                        token.state = if outcome.started {
                            ActivityState::Active
                        } else {
                            ActivityState::Waiting
                        };
                    }
                }
                Err(e) => {
                    error!(activity = %name, error = %e, "failed to start activity");
                    if inner.error.is_none() {
                        inner.error = Some(e);
                    }
                    inner.tokens.retain(|t| t.name() != name);
                }
            }
        }
        inner.state = ActivitySetState::Idle;
        Ok(())
    }

    /// End every member according to its end action, bucket by bucket.
    ///
    /// Fails without touching any token if a cycle is already in flight. The
    /// `EndOrder::First` bucket is fully drained before `Default`, which is
    /// fully drained before `Last`. Member errors are captured and the token
    /// removed; siblings keep ending.
    pub async fn end_activities(&self, backend: &dyn ActivityBackend) -> Result<()> {
        let mut buckets: [Vec<(String, EndKind)>; 3] = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ActivitySetState::Idle {
                return Err(MailError::internal("activity set already starting or ending"));
            }
            inner.state = ActivitySetState::Ending;

            let mut buckets: [Vec<(String, EndKind)>; 3] = [Vec::new(), Vec::new(), Vec::new()];
            for token in &mut inner.tokens {
                if token.is_ending() {
                    // An end call is somehow outstanding; leave it be.
                    warn!(activity = %token.name(), "activity already ending");
                    continue;
                }

                let kind = match (&token.external_id, token.end_action) {
                    (None, _) => EndKind::Local,
                    (Some(id), EndAction::Complete) => EndKind::Complete(id.clone(), None),
                    (Some(id), EndAction::Restart) => {
                        let payload =
                            token.update_payload.clone().or_else(|| token.spec.payload.clone());
                        EndKind::Complete(id.clone(), payload)
                    }
                    (Some(id), EndAction::Cancel) => EndKind::Cancel(id.clone()),
                    (Some(id), EndAction::Unsubscribe) => EndKind::Unsubscribe(id.clone()),
                };

                token.state = match token.end_action {
                    EndAction::Cancel => ActivityState::CancelPending,
                    _ => ActivityState::CompletePending,
                };

                let bucket = match token.end_order() {
                    EndOrder::First => 0,
                    EndOrder::Default => 1,
                    EndOrder::Last => 2,
                };
                buckets[bucket].push((token.name().to_string(), kind));
            }
            buckets
        };

        for bucket in buckets.iter_mut() {
            let ops = std::mem::take(bucket);
            if ops.is_empty() {
                continue;
            }
            let results = join_all(ops.into_iter().map(|(name, kind)| async move {
                let result = match &kind {
                    EndKind::Complete(id, restart) => {
                        backend.complete(id, restart.clone()).await
                    }
                    EndKind::Cancel(id) => backend.cancel(id).await,
                    EndKind::Unsubscribe(id) => backend.unsubscribe(id).await,
                    EndKind::Local => Ok(()),
                };
                (name, result)
            }))
            .await;

            let mut inner = self.inner.lock().unwrap();
            for (name, result) in results {
                if let Err(e) = result {
                    error!(activity = %name, error = %e, "failed to end activity");
                    if inner.error.is_none() {
                        inner.error = Some(e);
                    }
                }
                // Ended or failed, the token leaves the set either way.
                inner.tokens.retain(|t| t.name() != name);
            }
        }

        self.inner.lock().unwrap().state = ActivitySetState::Idle;
        Ok(())
    }

    fn get_or_create<'a>(
        tokens: &'a mut Vec<ActivityToken>,
        name: &str,
        purpose: ActivityPurpose,
    ) -> &'a mut ActivityToken {
        if let Some(pos) = tokens.iter().position(|t| t.name() == name) {
            return &mut tokens[pos];
        }
        tokens.push(ActivityToken::new(ActivitySpec::new(name, purpose)));
        tokens.last_mut().unwrap()
    }
}
