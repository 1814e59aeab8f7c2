//! Persistent state machine.
//!
//! All mutation goes through `transition`, which replaces the snapshot as a
//! whole. Callers must hold the distributed lock for the resource; nothing
//! here re-checks it, because only the lock's atomic primitives may gate
//! mutating actions.

use crate::snapshot::{BotState, StateUpdates, TradingState};
use crate::store::{StateError, StateStore};
use std::sync::Arc;

pub struct StateMachine {
    store: Arc<dyn StateStore>,
    key: String,
    escalation_threshold: u32,
}

impl StateMachine {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, key: impl Into<String>, escalation_threshold: u32) -> Self {
        Self {
            store,
            key: key.into(),
            escalation_threshold,
        }
    }

    /// Returns the persisted snapshot, or a freshly defaulted one when the
    /// store has nothing or the record cannot be read.
    ///
    /// An unreadable snapshot is deliberately treated like an absent one:
    /// the controller starts IDLE and re-derives exposure from collaborators
    /// on the first cycle.
    pub async fn load(&self) -> BotState {
        match self.store.get(&self.key).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                tracing::info!(key = %self.key, "no persisted state, starting from defaults");
                BotState::default()
            }
            Err(e) => {
                tracing::warn!(
                    key = %self.key,
                    "persisted state unreadable, starting from defaults: {e}"
                );
                BotState::default()
            }
        }
    }

    /// Applies `updates`, sets the new state, persists the whole snapshot,
    /// and returns it. Must only be called while the lock is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be persisted.
    pub async fn transition(
        &self,
        current: &BotState,
        new_state: TradingState,
        updates: StateUpdates,
    ) -> Result<BotState, StateError> {
        let next = current.apply(new_state, updates);
        self.store.set(&self.key, &next).await?;
        if current.current_state != new_state {
            tracing::info!(
                from = %current.current_state,
                to = %new_state,
                "state transition"
            );
        }
        Ok(next)
    }

    /// Whether the controller may do cycle work in this state.
    #[must_use]
    pub const fn can_operate(state: &BotState) -> bool {
        state.current_state.can_operate()
    }

    /// Records a failed cycle. At the escalation threshold the machine moves
    /// to ERROR_RECOVERY, which blocks all further work until an operator
    /// clears the state.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be persisted.
    pub async fn record_failure(
        &self,
        current: &BotState,
        error: &str,
    ) -> Result<BotState, StateError> {
        let failures = current.consecutive_failures + 1;
        let updates = StateUpdates {
            consecutive_failures: Some(failures),
            last_error: Some(Some(error.to_string())),
            ..StateUpdates::default()
        };

        if failures >= self.escalation_threshold {
            tracing::error!(
                failures,
                threshold = self.escalation_threshold,
                "failure threshold reached, escalating to error recovery"
            );
            self.transition(current, TradingState::ErrorRecovery, updates)
                .await
        } else {
            tracing::warn!(failures, "cycle failed: {error}");
            self.transition(current, current.current_state, updates).await
        }
    }

    /// Records a clean cycle. Clears the failure counter and last error; a
    /// no-op when the snapshot is already clean or the state is blocked.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be persisted.
    pub async fn record_success(&self, current: &BotState) -> Result<BotState, StateError> {
        // A blocked state never completes a clean cycle; its counters stay
        // as operator-visible evidence of what went wrong.
        if !current.current_state.can_operate() {
            return Ok(current.clone());
        }
        if current.consecutive_failures == 0 && current.last_error.is_none() {
            return Ok(current.clone());
        }
        self.transition(
            current,
            current.current_state,
            StateUpdates {
                consecutive_failures: Some(0),
                last_error: Some(None),
                ..StateUpdates::default()
            },
        )
        .await
    }

    /// Deletes the persisted snapshot. Operator action only.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn clear(&self) -> Result<(), StateError> {
        self.store.delete(&self.key).await?;
        tracing::info!(key = %self.key, "persisted state cleared");
        Ok(())
    }
}
