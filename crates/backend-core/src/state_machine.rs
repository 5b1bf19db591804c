use crate::{
    error::{EngineError, SyncFailureClass},
    types::{EngineCommand, EngineEvent, EngineLifecycleState},
};

#[derive(Debug, Clone)]
pub struct EngineStateMachine {
    state: EngineLifecycleState,
}

impl Default for EngineStateMachine {
    fn default() -> Self {
        Self {
            state: EngineLifecycleState::Disconnected,
        }
    }
}

impl EngineStateMachine {
    pub fn state(&self) -> EngineLifecycleState {
        self.state
    }

    pub fn apply(&mut self, command: &EngineCommand) -> Result<Vec<EngineEvent>, EngineError> {
        use EngineCommand::*;

        match command {
            Bootstrap { .. } => self.transition_from_any_of(
                &[
                    EngineLifecycleState::Disconnected,
                    EngineLifecycleState::LoggedOut,
                ],
                EngineLifecycleState::Bootstrapping,
                "bootstrap",
            ),
            SendMessage { .. } => {
                if self.is_session_active() {
                    Ok(Vec::new())
                } else {
                    Err(EngineError::invalid_state(self.state, "send_message"))
                }
            }
            Logout => self.transition_from_any_of(
                &[
                    EngineLifecycleState::Bootstrapping,
                    EngineLifecycleState::InitialSync,
                    EngineLifecycleState::Syncing,
                    EngineLifecycleState::RetryBackoff,
                ],
                EngineLifecycleState::LoggedOut,
                "logout",
            ),
        }
    }

    pub fn on_bootstrap_complete(&mut self) -> Result<EngineEvent, EngineError> {
        if self.state != EngineLifecycleState::Bootstrapping {
            return Err(EngineError::invalid_state(self.state, "on_bootstrap_complete"));
        }
        self.state = EngineLifecycleState::InitialSync;
        Ok(EngineEvent::StateChanged { state: self.state })
    }

    pub fn on_initial_sync_complete(&mut self) -> Result<EngineEvent, EngineError> {
        if self.state != EngineLifecycleState::InitialSync {
            return Err(EngineError::invalid_state(
                self.state,
                "on_initial_sync_complete",
            ));
        }
        self.state = EngineLifecycleState::Syncing;
        Ok(EngineEvent::StateChanged { state: self.state })
    }

    /// Record a failed sync cycle. Transient failures keep the current
    /// state (the identical request is reissued); protocol failures move
    /// the steady loop into `RetryBackoff`; auth failures are fatal.
    pub fn on_cycle_failure(&mut self, class: SyncFailureClass) -> Option<EngineEvent> {
        match class {
            SyncFailureClass::Transient => None,
            SyncFailureClass::Protocol => {
                if self.state == EngineLifecycleState::Syncing {
                    self.state = EngineLifecycleState::RetryBackoff;
                    Some(EngineEvent::StateChanged { state: self.state })
                } else {
                    None
                }
            }
            SyncFailureClass::AuthInvalid => Some(self.on_fatal()),
        }
    }

    pub fn on_retry_elapsed(&mut self) -> Result<EngineEvent, EngineError> {
        if self.state != EngineLifecycleState::RetryBackoff {
            return Err(EngineError::invalid_state(self.state, "on_retry_elapsed"));
        }
        self.state = EngineLifecycleState::Syncing;
        Ok(EngineEvent::StateChanged { state: self.state })
    }

    pub fn on_fatal(&mut self) -> EngineEvent {
        self.state = EngineLifecycleState::Fatal;
        EngineEvent::StateChanged { state: self.state }
    }

    fn is_session_active(&self) -> bool {
        matches!(
            self.state,
            EngineLifecycleState::InitialSync
                | EngineLifecycleState::Syncing
                | EngineLifecycleState::RetryBackoff
        )
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[EngineLifecycleState],
        next: EngineLifecycleState,
        action: &str,
    ) -> Result<Vec<EngineEvent>, EngineError> {
        if !expected.contains(&self.state) {
            return Err(EngineError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![EngineEvent::StateChanged { state: next }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrap_command() -> EngineCommand {
        EngineCommand::Bootstrap {
            account_id: "@alice:example.org".into(),
            homeserver: "https://chat.example.org".into(),
            access_token: "syt_secret".into(),
        }
    }

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = EngineStateMachine::default();

        sm.apply(&bootstrap_command()).expect("bootstrap must work");
        assert_eq!(sm.state(), EngineLifecycleState::Bootstrapping);

        sm.on_bootstrap_complete().expect("bootstrap completion");
        assert_eq!(sm.state(), EngineLifecycleState::InitialSync);

        sm.on_initial_sync_complete()
            .expect("initial sync completion");
        assert_eq!(sm.state(), EngineLifecycleState::Syncing);

        sm.apply(&EngineCommand::Logout).expect("logout should work");
        assert_eq!(sm.state(), EngineLifecycleState::LoggedOut);
    }

    #[test]
    fn allows_bootstrap_again_after_logout() {
        let mut sm = EngineStateMachine::default();
        sm.apply(&bootstrap_command()).expect("bootstrap must work");
        sm.apply(&EngineCommand::Logout).expect("logout should work");

        sm.apply(&bootstrap_command())
            .expect("re-bootstrap after logout should work");
        assert_eq!(sm.state(), EngineLifecycleState::Bootstrapping);
    }

    #[test]
    fn rejects_send_before_session_is_active() {
        let mut sm = EngineStateMachine::default();

        let err = sm
            .apply(&EngineCommand::SendMessage {
                room_id: "!abc:example.org".into(),
                content: serde_json::json!({"body": "hello"}),
            })
            .expect_err("send should fail before bootstrap");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn transient_failure_keeps_state() {
        let mut sm = EngineStateMachine::default();
        sm.apply(&bootstrap_command()).expect("bootstrap must work");
        sm.on_bootstrap_complete().expect("bootstrap completion");

        assert!(sm.on_cycle_failure(SyncFailureClass::Transient).is_none());
        assert_eq!(sm.state(), EngineLifecycleState::InitialSync);
    }

    #[test]
    fn protocol_failure_moves_steady_loop_into_backoff_and_back() {
        let mut sm = EngineStateMachine::default();
        sm.apply(&bootstrap_command()).expect("bootstrap must work");
        sm.on_bootstrap_complete().expect("bootstrap completion");
        sm.on_initial_sync_complete().expect("initial completion");

        sm.on_cycle_failure(SyncFailureClass::Protocol)
            .expect("backoff transition should emit an event");
        assert_eq!(sm.state(), EngineLifecycleState::RetryBackoff);

        sm.on_retry_elapsed().expect("retry elapse should work");
        assert_eq!(sm.state(), EngineLifecycleState::Syncing);
    }

    #[test]
    fn auth_failure_is_fatal() {
        let mut sm = EngineStateMachine::default();
        sm.apply(&bootstrap_command()).expect("bootstrap must work");
        sm.on_bootstrap_complete().expect("bootstrap completion");
        sm.on_initial_sync_complete().expect("initial completion");

        sm.on_cycle_failure(SyncFailureClass::AuthInvalid)
            .expect("fatal transition should emit an event");
        assert_eq!(sm.state(), EngineLifecycleState::Fatal);
    }

    #[test]
    fn rejects_retry_elapse_outside_backoff() {
        let mut sm = EngineStateMachine::default();
        let err = sm
            .on_retry_elapsed()
            .expect_err("retry elapse should fail outside backoff");
        assert_eq!(err.code, "invalid_state_transition");
    }
}
