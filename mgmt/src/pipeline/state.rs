// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-verb pipeline states.

use std::fmt::Display;
use strum::Display;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateState {
    Initial,
    Validated,
    PendingDbeCreate,
    PreDbeAlloc,
    DbeAlloc,
    PreDbeCreate,
    DbeCreate,
    PostDbeCreate,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateState {
    Initial,
    Validated,
    PendingDbeUpdate,
    PreDbeUpdate,
    DbeUpdate,
    PostDbeUpdate,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteState {
    Initial,
    Validated,
    PendingDbeDelete,
    PreDbeDelete,
    DbeDelete,
    PostDbeDelete,
    Done,
}

/// Tracks the state of one request through its verb's transitions.
#[derive(Debug)]
pub struct Stage<S> {
    request_id: String,
    what: String,
    state: S,
}

impl<S: Copy + Display> Stage<S> {
    pub fn new(request_id: &str, what: impl Into<String>, initial: S) -> Self {
        Self {
            request_id: request_id.to_string(),
            what: what.into(),
            state: initial,
        }
    }

    pub fn enter(&mut self, state: S) {
        debug!("{} {}: {} -> {state}", self.request_id, self.what, self.state);
        self.state = state;
    }

    #[must_use]
    pub fn state(&self) -> S {
        self.state
    }

    /// Log a failure in the current state.
    pub fn failed(&self, err: &impl Display) {
        error!(
            "{} {}: failed in state {}: {err}",
            self.request_id, self.what, self.state
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(CreateState::PendingDbeCreate.to_string(), "PENDING_DBE_CREATE");
        assert_eq!(UpdateState::PostDbeUpdate.to_string(), "POST_DBE_UPDATE");
        assert_eq!(DeleteState::DbeDelete.to_string(), "DBE_DELETE");
    }

    #[test]
    fn stage_tracks_transitions() {
        let mut stage = Stage::new("req-1", "create virtual-network", CreateState::Initial);
        stage.enter(CreateState::Validated);
        stage.enter(CreateState::DbeAlloc);
        assert_eq!(stage.state(), CreateState::DbeAlloc);
    }
}
