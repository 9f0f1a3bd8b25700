//! Hooks into the storage and apply layers.
//!
//! The coordinator owns no durable state. The local copy of the replica-set
//! config, the master/slave handshake identity, and the applier's reaction to
//! follower-state changes all belong to external collaborators reached
//! through this trait.

use std::sync::Mutex;

use replicore_types::{Error, HostAndPort, MemberState, Result};
use serde_json::Value;

/// External collaborator interface.
pub trait ExternalState: Send + Sync {
    /// Loads the locally persisted replica-set config document, if any.
    fn load_local_config(&self) -> Result<Option<Value>>;

    /// Persists the replica-set config document.
    ///
    /// May fail with `OutOfDiskSpace`; the coordinator then surfaces that
    /// status and leaves its in-memory state untouched.
    fn store_local_config(&self, config: &Value) -> Result<()>;

    /// This client's address, used in the master/slave handshake.
    fn client_host_and_port(&self) -> HostAndPort;

    /// Invoked on every follower-state change so the applier can cancel its
    /// fetcher.
    fn signal_applier_state_change(&self, new_state: MemberState);
}

/// In-memory collaborator for tests.
#[derive(Debug)]
pub struct InMemoryExternalState {
    self_host: HostAndPort,
    stored_config: Mutex<Option<Value>>,
    fail_next_store: Mutex<Option<Error>>,
    state_changes: Mutex<Vec<MemberState>>,
}

impl InMemoryExternalState {
    pub fn new(self_host: HostAndPort) -> Self {
        Self {
            self_host,
            stored_config: Mutex::new(None),
            fail_next_store: Mutex::new(None),
            state_changes: Mutex::new(Vec::new()),
        }
    }

    /// Seeds a pre-existing local config, as if one survived a restart.
    pub fn seed_local_config(&self, config: Value) {
        *self.stored_config.lock().expect("poisoned") = Some(config);
    }

    /// Makes the next `store_local_config` fail with `error`.
    pub fn fail_next_store(&self, error: Error) {
        *self.fail_next_store.lock().expect("poisoned") = Some(error);
    }

    /// The config currently persisted, if any.
    pub fn stored_config(&self) -> Option<Value> {
        self.stored_config.lock().expect("poisoned").clone()
    }

    /// Every follower-state change signalled so far.
    pub fn state_changes(&self) -> Vec<MemberState> {
        self.state_changes.lock().expect("poisoned").clone()
    }
}

impl ExternalState for InMemoryExternalState {
    fn load_local_config(&self) -> Result<Option<Value>> {
        Ok(self.stored_config.lock().expect("poisoned").clone())
    }

    fn store_local_config(&self, config: &Value) -> Result<()> {
        if let Some(error) = self.fail_next_store.lock().expect("poisoned").take() {
            return Err(error);
        }
        *self.stored_config.lock().expect("poisoned") = Some(config.clone());
        Ok(())
    }

    fn client_host_and_port(&self) -> HostAndPort {
        self.self_host.clone()
    }

    fn signal_applier_state_change(&self, new_state: MemberState) {
        self.state_changes.lock().expect("poisoned").push(new_state);
    }
}
