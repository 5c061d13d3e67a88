use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status codes whose jobs are deleted under the default policy
pub const DEFAULT_DELETE_STATUSES: [u16; 5] = [200, 400, 401, 403, 410];

/// What to do with a job after the server answered with a given status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusAction {
    /// Give up on the job and remove it
    Delete,
    /// Keep the job and retry later
    RetryLater,
}

/// Maps HTTP status codes to a retry decision.
///
/// Codes without an entry, and attempts that never got a status, are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    actions: HashMap<u16, StatusAction>,
}

impl RetryPolicy {
    /// Policy with no entries: every status is retried
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Policy that deletes jobs for the given codes and retries everything else
    pub fn deleting(codes: impl IntoIterator<Item = u16>) -> Self {
        codes
            .into_iter()
            .fold(Self::empty(), |policy, code| policy.with(code, StatusAction::Delete))
    }

    /// Set the action for a status code
    pub fn with(mut self, code: u16, action: StatusAction) -> Self {
        self.actions.insert(code, action);
        self
    }

    /// Action for a status, `None` meaning no HTTP response was received
    pub fn action_for(&self, status: Option<u16>) -> StatusAction {
        status
            .and_then(|code| self.actions.get(&code).copied())
            .unwrap_or(StatusAction::RetryLater)
    }

    pub fn should_retry_later(&self, status: Option<u16>) -> bool {
        self.action_for(status) == StatusAction::RetryLater
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::deleting(DEFAULT_DELETE_STATUSES)
    }
}
