//! The replication coordinator.
//!
//! [`ReplicationCoordinator`] is the public façade of the crate. It owns the
//! topology coordinator, the op-time tracker, the snapshot tracker, the
//! waiter registry, and the task executor, and serializes every mutation
//! behind one mutex. Blocking client calls register a waiter and suspend on
//! the paired condvar, releasing the mutex while asleep; inbound events
//! (timer fires, network responses) are drained by [`ReplicationCoordinator::pump`]
//! and their effects are visible to every later event.
//!
//! The topology coordinator decides, this type executes: network dispatch,
//! timer scheduling, waiter wake-ups, and external-state calls all happen
//! here and only here.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use replicore_config::{
    ReadConcern, ReadConcernLevel, ReplicaSetConfig, WMode, WTimeout, WriteConcern,
};
use replicore_topology::{
    ElectionPhase, HeartbeatRequest, HeartbeatResponse, HeartbeatResponseAction,
    ReplicaSetMetadata, TopologyCoordinator, UpdateTermResult,
};
use replicore_types::{
    Date, Error, HostAndPort, MemberState, OpId, OpTime, Result, SnapshotName, Timestamp,
};
use serde_json::{Value, json};

use crate::executor::{Clock, EventHandle, ScheduledEvent, TaskExecutor};
use crate::external_state::ExternalState;
use crate::lock::{GlobalLock, GlobalLockGuard};
use crate::network::{NetworkDispatcher, RemoteCommandRequest, RequestToken};
use crate::optime_tracker::OpTimeTracker;
use crate::settings::{ReplSettings, ReplicationMode};
use crate::snapshots::SnapshotTracker;
use crate::update_position::{UpdatePositionArgs, UpdatePositionEntry};
use crate::waiters::{Waiter, WaiterCondition, WaiterRegistry};

/// How long an initiate quorum round waits for the last responder.
const INITIATE_QUORUM_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Internal State
// ============================================================================

/// Why a dispatched request is in flight.
#[derive(Debug)]
enum InflightRequest {
    Heartbeat { member_index: usize },
    QuorumCheck { target: HostAndPort },
    VoteRequest { dry_run: bool, term: i64 },
}

/// An election being conducted by this node.
#[derive(Debug)]
struct ElectionInProgress {
    phase: ElectionPhase,
    votes_granted: usize,
    votes_needed: usize,
    responses_pending: usize,
}

/// The initiate quorum round.
#[derive(Debug)]
struct QuorumRound {
    pending: usize,
    failure: Option<Error>,
    deadline: Date,
}

/// A stepdown attempt, blocking or not.
#[derive(Debug)]
struct StepDownAttempt {
    force: bool,
    wait_deadline: Date,
    step_down_duration: Duration,
    op_id: OpId,
    started_at: Date,
    result: Option<Result<()>>,
}

struct Inner {
    mode: ReplicationMode,
    topology: TopologyCoordinator,
    tracker: OpTimeTracker,
    snapshots: SnapshotTracker,
    waiters: WaiterRegistry,
    executor: TaskExecutor,
    inflight: HashMap<RequestToken, InflightRequest>,
    heartbeat_handles: HashMap<usize, EventHandle>,
    election_timer_handle: Option<EventHandle>,
    election_timer_at: Date,
    election: Option<ElectionInProgress>,
    initiate_round: Option<QuorumRound>,
    stepdown: Option<StepDownAttempt>,
    /// Highest term we granted a real vote in.
    last_voted_term: i64,
    /// Downstream hosts that completed the master/slave handshake.
    handshake_hosts: Vec<HostAndPort>,
    rbid: u64,
    shutdown: bool,
}

/// Handle returned by the non-blocking stepdown variant.
///
/// Holds the exclusive operation lock; the lock is released when the handle
/// is consumed by [`ReplicationCoordinator::step_down_finish`] or dropped.
#[derive(Debug)]
pub struct StepDownTicket {
    _lock_guard: GlobalLockGuard,
}

// ============================================================================
// Replication Coordinator
// ============================================================================

/// Per-node owner of membership, elections, heartbeating, and
/// write/read-concern waiting.
pub struct ReplicationCoordinator {
    settings: ReplSettings,
    clock: Arc<dyn Clock>,
    network: Arc<dyn NetworkDispatcher>,
    external: Arc<dyn ExternalState>,
    global_lock: Arc<dyn GlobalLock>,
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl ReplicationCoordinator {
    pub fn new(
        settings: ReplSettings,
        self_host: HostAndPort,
        clock: Arc<dyn Clock>,
        network: Arc<dyn NetworkDispatcher>,
        external: Arc<dyn ExternalState>,
        global_lock: Arc<dyn GlobalLock>,
        seed: u64,
    ) -> Self {
        let mode = settings.initial_mode();
        Self {
            settings,
            clock,
            network,
            external,
            global_lock,
            inner: Mutex::new(Inner {
                mode,
                topology: TopologyCoordinator::new(self_host, seed),
                tracker: OpTimeTracker::new(),
                snapshots: SnapshotTracker::new(),
                waiters: WaiterRegistry::new(),
                executor: TaskExecutor::new(),
                inflight: HashMap::new(),
                heartbeat_handles: HashMap::new(),
                election_timer_handle: None,
                election_timer_at: Date::ZERO,
                election: None,
                initiate_round: None,
                stepdown: None,
                last_voted_term: 0,
                handshake_hosts: Vec::new(),
                rbid: 1,
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("replication coordinator poisoned")
    }

    /// Loads the locally persisted config, if any, and installs it.
    pub fn startup(&self) {
        let mut inner = self.lock_inner();
        if inner.mode != ReplicationMode::ReplSet {
            return;
        }
        let now = self.clock.now();
        match self.external.load_local_config() {
            Ok(Some(doc)) => match ReplicaSetConfig::from_document(&doc) {
                Ok(config) => self.install_config_locked(&mut inner, config, now, false),
                Err(error) => {
                    tracing::error!(error = %error, "locally stored replica set config is invalid");
                }
            },
            Ok(None) => {
                tracing::info!("Did not find local replica set configuration document at startup");
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to load local replica set config");
            }
        }
        drop(inner);
        self.wake.notify_all();
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub fn replication_mode(&self) -> ReplicationMode {
        self.lock_inner().mode
    }

    pub fn member_state(&self) -> MemberState {
        self.lock_inner().topology.member_state()
    }

    pub fn term(&self) -> i64 {
        self.lock_inner().topology.term()
    }

    pub fn current_primary_index(&self) -> i64 {
        self.lock_inner().topology.current_primary_index()
    }

    pub fn config_document(&self) -> Option<Value> {
        self.lock_inner()
            .topology
            .config()
            .map(ReplicaSetConfig::to_document)
    }

    pub fn my_last_applied_op_time(&self) -> OpTime {
        self.lock_inner().tracker.my_last_applied()
    }

    pub fn last_committed_op_time(&self) -> OpTime {
        self.lock_inner().tracker.last_committed()
    }

    pub fn current_committed_snapshot(&self) -> Option<(OpTime, SnapshotName)> {
        self.lock_inner().snapshots.current_committed()
    }

    /// The scheduled election timeout; the zero date when cleared.
    pub fn election_timeout_at(&self) -> Date {
        self.lock_inner().topology.election_timeout_at()
    }

    pub fn step_down_until(&self) -> Date {
        self.lock_inner().topology.step_down_until()
    }

    // ========================================================================
    // Event Pump
    // ========================================================================

    /// Drains every due timer event and arrived network response.
    ///
    /// Events are processed to completion in order; the effects of each are
    /// visible to the next. Tests advance the virtual clock, script network
    /// responses, then pump.
    pub fn pump(&self) {
        let mut inner = self.lock_inner();
        self.pump_locked(&mut inner);
        drop(inner);
        self.wake.notify_all();
    }

    fn pump_locked(&self, inner: &mut Inner) {
        loop {
            let now = self.clock.now();
            let mut progress = false;
            while let Some((_, event)) = inner.executor.pop_due(now) {
                self.handle_scheduled(inner, now, event);
                progress = true;
            }
            let responses = self.network.ready_responses(now);
            if !responses.is_empty() {
                progress = true;
                for (token, response) in responses {
                    self.handle_response(inner, now, token, response);
                }
            }
            self.check_stepdown_deadline(inner, now);
            if !progress {
                break;
            }
        }
    }

    fn handle_scheduled(&self, inner: &mut Inner, now: Date, event: ScheduledEvent) {
        if inner.shutdown {
            return;
        }
        match event {
            ScheduledEvent::HeartbeatDue(member_index) => {
                inner.heartbeat_handles.remove(&member_index);
                self.dispatch_heartbeat(inner, now, member_index);
            }
            ScheduledEvent::ElectionTimeout => {
                inner.election_timer_handle = None;
                inner.election_timer_at = Date::ZERO;
                if inner.topology.should_start_election(now) {
                    self.start_election(inner, now);
                } else {
                    // Fired while frozen or inside a stepdown window; arm a
                    // fresh period rather than re-firing immediately.
                    inner.topology.cancel_and_reschedule_election_timeout(now);
                    self.sync_election_timer(inner);
                }
            }
        }
    }

    fn dispatch_heartbeat(&self, inner: &mut Inner, now: Date, member_index: usize) {
        let Some(config) = inner.topology.config() else {
            return;
        };
        if Some(member_index) == inner.topology.self_index()
            || member_index >= config.member_count()
        {
            return;
        }
        let target = config.members[member_index].host.clone();
        let heartbeat_interval = config.settings.heartbeat_interval;

        inner.topology.mark_down_if_silent(member_index, now);
        let request = inner.topology.prepare_heartbeat_request(now, member_index);
        let token = self.network.dispatch(RemoteCommandRequest {
            target,
            command: request.to_document(),
        });
        inner
            .inflight
            .insert(token, InflightRequest::Heartbeat { member_index });

        // Cadence backup: if the reply never comes, the next beat still goes
        // out one interval later.
        let handle = inner
            .executor
            .schedule_at(now + heartbeat_interval, ScheduledEvent::HeartbeatDue(member_index));
        if let Some(stale) = inner.heartbeat_handles.insert(member_index, handle) {
            inner.executor.cancel(stale);
        }
    }

    fn handle_response(
        &self,
        inner: &mut Inner,
        now: Date,
        token: RequestToken,
        response: Result<Value>,
    ) {
        let Some(purpose) = inner.inflight.remove(&token) else {
            return;
        };
        if inner.shutdown {
            return;
        }
        match purpose {
            InflightRequest::Heartbeat { member_index } => {
                self.handle_heartbeat_response(inner, now, member_index, response);
            }
            InflightRequest::QuorumCheck { target } => {
                self.handle_quorum_response(inner, &target, response);
            }
            InflightRequest::VoteRequest { dry_run, term } => {
                self.handle_vote_response(inner, now, dry_run, term, response);
            }
        }
    }

    fn handle_heartbeat_response(
        &self,
        inner: &mut Inner,
        now: Date,
        member_index: usize,
        response: Result<Value>,
    ) {
        if inner.topology.config().is_none() {
            return;
        }
        let parsed = response.and_then(|doc| HeartbeatResponse::from_document(&doc));
        let applied = parsed.as_ref().ok().map(|r| r.op_time);

        let (next_at, action) = inner
            .topology
            .process_heartbeat_response(now, member_index, parsed);

        // Reschedule the cadence off the receive time.
        let handle = inner
            .executor
            .schedule_at(next_at, ScheduledEvent::HeartbeatDue(member_index));
        if let Some(stale) = inner.heartbeat_handles.insert(member_index, handle) {
            inner.executor.cancel(stale);
        }

        if let Some(applied) = applied {
            inner.tracker.update_member(member_index, applied);
        }
        self.advance_commit_locked(inner);
        self.check_stepdown_progress(inner, now);
        self.sync_election_timer(inner);
        self.reevaluate_waiters(inner);

        match action {
            HeartbeatResponseAction::NoAction => {}
            HeartbeatResponseAction::Reconfig(config) => {
                tracing::info!(
                    version = config.version,
                    "installing newer config received via heartbeat"
                );
                if let Err(error) = self.external.store_local_config(&config.to_document()) {
                    tracing::warn!(error = %error, "failed to persist config from heartbeat");
                }
                self.install_config_locked(inner, config, now, false);
            }
            HeartbeatResponseAction::StepDownSelf => {
                self.relinquish_primary(inner, now);
            }
        }
    }

    fn handle_quorum_response(&self, inner: &mut Inner, target: &HostAndPort, response: Result<Value>) {
        let Some(round) = inner.initiate_round.as_mut() else {
            return;
        };
        round.pending = round.pending.saturating_sub(1);
        let failure = match response {
            Ok(doc) => {
                let ok = doc.get("ok").and_then(Value::as_i64).unwrap_or(0) == 1;
                let config_version = doc
                    .get("configVersion")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                if ok && config_version <= 0 {
                    None
                } else {
                    Some(format!(
                        "'{target}' has data already, cannot initiate set (configVersion {config_version})"
                    ))
                }
            }
            Err(error) => Some(format!("'{target}' failed to respond: {error}")),
        };
        if let Some(message) = failure {
            if round.failure.is_none() {
                round.failure = Some(Error::NodeNotFound(message));
            }
        }
    }

    // ========================================================================
    // Configuration: Initiate
    // ========================================================================

    /// Handles `replSetInitiate`.
    pub fn process_repl_set_initiate(&self, config_doc: &Value) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.shutdown {
            return Err(Error::ShutdownInProgress);
        }
        if inner.mode == ReplicationMode::MasterSlave {
            return Err(Error::NoReplicationEnabled(
                "running with legacy master/slave replication".into(),
            ));
        }
        if inner.topology.config().is_some() {
            return Err(Error::AlreadyInitialized(
                "already initialized; use replSetReconfig to change the set".into(),
            ));
        }

        let config = ReplicaSetConfig::from_document(config_doc)?;
        if config.version != 1 {
            return Err(Error::InvalidReplicaSetConfig(format!(
                "have version 1, but found {}",
                config.version
            )));
        }
        if let Some(name) = &self.settings.replset_name {
            if &config.name != name {
                return Err(Error::InvalidReplicaSetConfig(format!(
                    "--replSet names do not match; command: \"{}\", ours: \"{name}\"",
                    config.name
                )));
            }
        } else if config.members.iter().filter(|m| !m.arbiter_only).count() != 1 {
            return Err(Error::InvalidReplicaSetConfig(
                "you can only specify one member in the config".into(),
            ));
        }

        let self_host = inner.topology.self_host().clone();
        let Some(self_index) = config.find_self_index(&self_host) else {
            return Err(Error::InvalidReplicaSetConfig(
                "No host described in new configuration maps to this node".into(),
            ));
        };

        // Quorum round: every other listed host must be empty and willing.
        if config.member_count() > 1 {
            let (guard, outcome) = self.run_initiate_quorum_round(inner, &config, self_index);
            inner = guard;
            outcome?;
        }

        // Persist before installing; a failed store leaves us in Startup.
        self.external.store_local_config(&config.to_document())?;

        let now = self.clock.now();
        inner.mode = ReplicationMode::ReplSet;
        self.install_config_locked(&mut inner, config, now, true);
        drop(inner);
        self.wake.notify_all();
        Ok(())
    }

    fn run_initiate_quorum_round<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        config: &ReplicaSetConfig,
        self_index: usize,
    ) -> (MutexGuard<'a, Inner>, Result<()>) {
        let started = self.clock.now();
        let request = HeartbeatRequest {
            set_name: config.name.clone(),
            protocol_version: config.protocol_version,
            config_version: config.version,
            sender_host: config.members[self_index].host.clone(),
            sender_id: config.members[self_index].id,
            check_empty: true,
        };
        let others = config.other_member_hosts(self_index);
        inner.initiate_round = Some(QuorumRound {
            pending: others.len(),
            failure: None,
            deadline: started + INITIATE_QUORUM_TIMEOUT,
        });
        for target in others {
            let token = self.network.dispatch(RemoteCommandRequest {
                target: target.clone(),
                command: request.to_document(),
            });
            inner
                .inflight
                .insert(token, InflightRequest::QuorumCheck { target });
        }

        // Sleep until every answer is in, one refuses, or the round times
        // out. Responses arrive through `pump` on another thread.
        let outcome = loop {
            let round = inner
                .initiate_round
                .as_ref()
                .expect("round cleared while waiting");
            if let Some(failure) = &round.failure {
                break Err(failure.clone());
            }
            if round.pending == 0 {
                break Ok(());
            }
            let now = self.clock.now();
            if now >= round.deadline {
                break Err(Error::NodeNotFound(
                    "timed out waiting for quorum check responses".into(),
                ));
            }
            if inner.shutdown {
                break Err(Error::ShutdownInProgress);
            }
            let hint = self.clock.wait_hint(round.deadline.since(now));
            let (guard, _) = self
                .wake
                .wait_timeout(inner, hint)
                .expect("replication coordinator poisoned");
            inner = guard;
        };
        inner.initiate_round = None;
        (inner, outcome)
    }

    // ========================================================================
    // Configuration: Reconfig & Shared Install
    // ========================================================================

    /// Handles `replSetReconfig`.
    pub fn process_repl_set_reconfig(&self, config_doc: &Value, force: bool) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.shutdown {
            return Err(Error::ShutdownInProgress);
        }
        let Some(current) = inner.topology.config() else {
            return Err(Error::NotYetInitialized(
                "run replSetInitiate before replSetReconfig".into(),
            ));
        };
        let current_version = current.version;
        let current_name = current.name.clone();

        if !force && !inner.topology.can_accept_writes() {
            return Err(Error::NotMaster(
                "replSetReconfig should only be run on PRIMARY".into(),
            ));
        }

        let config = ReplicaSetConfig::from_document(config_doc)?;
        if config.name != current_name {
            return Err(Error::InvalidReplicaSetConfig(format!(
                "cannot change replica set name from \"{current_name}\" to \"{}\"",
                config.name
            )));
        }
        if force {
            if config.version <= current_version {
                return Err(Error::InvalidReplicaSetConfig(format!(
                    "version must exceed current version {current_version}, but found {}",
                    config.version
                )));
            }
        } else if config.version != current_version + 1 {
            return Err(Error::InvalidReplicaSetConfig(format!(
                "version must be set to {}, but found {}",
                current_version + 1,
                config.version
            )));
        }

        let self_host = inner.topology.self_host().clone();
        let Some(self_index) = config.find_self_index(&self_host) else {
            return Err(Error::InvalidReplicaSetConfig(
                "No host described in new configuration maps to this node".into(),
            ));
        };
        if !force
            && inner.topology.member_state() == MemberState::Primary
            && !config.members[self_index].is_electable()
        {
            return Err(Error::InvalidReplicaSetConfig(
                "is not electable under the new configuration version".into(),
            ));
        }

        self.external.store_local_config(&config.to_document())?;

        let now = self.clock.now();
        self.install_config_locked(&mut inner, config, now, false);
        drop(inner);
        self.wake.notify_all();
        Ok(())
    }

    /// Installs a validated config: topology, tracker, heartbeats, timers,
    /// waiter feasibility.
    fn install_config_locked(
        &self,
        inner: &mut Inner,
        config: ReplicaSetConfig,
        now: Date,
        fresh_initiate: bool,
    ) {
        let self_host = inner.topology.self_host().clone();
        let self_index = config.find_self_index(&self_host);
        let member_count = config.member_count();
        let state_before = inner.topology.member_state();

        inner.topology.install_config(config, self_index, now);
        inner.tracker.install_config(member_count, self_index);

        // Fresh heartbeat round immediately.
        inner.executor.cancel_heartbeats();
        inner.heartbeat_handles.clear();
        for index in 0..member_count {
            if Some(index) != self_index {
                let handle = inner
                    .executor
                    .schedule_at(now, ScheduledEvent::HeartbeatDue(index));
                inner.heartbeat_handles.insert(index, handle);
            }
        }

        self.sync_election_timer(inner);
        self.reevaluate_waiters(inner);
        self.advance_commit_locked(inner);

        let state_after = inner.topology.member_state();
        if fresh_initiate || state_after != state_before {
            self.external.signal_applier_state_change(state_after);
        }

        self.consider_standing_for_election(inner, now);
    }

    /// Mirrors the topology's election deadline into the task executor.
    fn sync_election_timer(&self, inner: &mut Inner) {
        let at = inner.topology.election_timeout_at();
        if at == inner.election_timer_at {
            return;
        }
        if let Some(handle) = inner.election_timer_handle.take() {
            inner.executor.cancel(handle);
        }
        inner.election_timer_at = at;
        if !at.is_zero() {
            inner.election_timer_handle =
                Some(inner.executor.schedule_at(at, ScheduledEvent::ElectionTimeout));
        }
    }

    // ========================================================================
    // Elections
    // ========================================================================

    fn start_election(&self, inner: &mut Inner, now: Date) {
        if inner.election.is_some() || inner.stepdown.is_some() {
            return;
        }
        let Some(config) = inner.topology.config() else {
            return;
        };
        let votes_needed = ReplicaSetConfig::majority_of(config.voting_member_count());

        inner.topology.begin_election(ElectionPhase::DryRun);
        inner.election = Some(ElectionInProgress {
            phase: ElectionPhase::DryRun,
            votes_granted: 1,
            votes_needed,
            responses_pending: 0,
        });
        self.sync_election_timer(inner);

        if votes_needed <= 1 {
            self.enter_real_election(inner, now);
            return;
        }
        self.dispatch_vote_requests(inner, true);
    }

    fn enter_real_election(&self, inner: &mut Inner, now: Date) {
        inner.topology.begin_election(ElectionPhase::Real);
        let votes_needed = inner
            .election
            .as_ref()
            .map_or(1, |e| e.votes_needed);
        inner.election = Some(ElectionInProgress {
            phase: ElectionPhase::Real,
            votes_granted: 1,
            votes_needed,
            responses_pending: 0,
        });
        if votes_needed <= 1 {
            self.win_election(inner, now);
            return;
        }
        self.dispatch_vote_requests(inner, false);
    }

    fn dispatch_vote_requests(&self, inner: &mut Inner, dry_run: bool) {
        let Some(config) = inner.topology.config() else {
            return;
        };
        let Some(self_index) = inner.topology.self_index() else {
            return;
        };
        let term = inner.topology.term();
        let applied = inner.tracker.my_last_applied();
        let command = json!({
            "replSetRequestVotes": 1,
            "setName": config.name,
            "dryRun": dry_run,
            "term": term,
            "candidateIndex": self_index as i64,
            "configVersion": config.version,
            "lastAppliedOpTime": {
                "ts": {"secs": applied.timestamp.secs, "inc": applied.timestamp.inc},
                "t": applied.term,
            },
        });
        let targets: Vec<HostAndPort> = config.other_member_hosts(self_index);
        let mut dispatched = 0;
        for target in targets {
            let token = self.network.dispatch(RemoteCommandRequest {
                target,
                command: command.clone(),
            });
            inner
                .inflight
                .insert(token, InflightRequest::VoteRequest { dry_run, term });
            dispatched += 1;
        }
        if let Some(election) = inner.election.as_mut() {
            election.responses_pending = dispatched;
        }
    }

    fn handle_vote_response(
        &self,
        inner: &mut Inner,
        now: Date,
        dry_run: bool,
        term: i64,
        response: Result<Value>,
    ) {
        let Some(phase) = inner.election.as_ref().map(|e| e.phase) else {
            return;
        };
        let phase_matches = match phase {
            ElectionPhase::DryRun => dry_run,
            ElectionPhase::Real => !dry_run,
        };
        if !phase_matches || term != inner.topology.term() {
            return;
        }

        let mut granted = false;
        if let Ok(doc) = &response {
            let responder_term = doc.get("term").and_then(Value::as_i64).unwrap_or(-1);
            if responder_term > inner.topology.term() {
                // Someone is ahead of us; abandon the ballot.
                inner.topology.update_term(responder_term);
                self.lose_election(inner, now);
                return;
            }
            granted = doc
                .get("voteGranted")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }

        let Some(election) = inner.election.as_mut() else {
            return;
        };
        election.responses_pending = election.responses_pending.saturating_sub(1);
        if granted {
            election.votes_granted += 1;
        }
        let votes_granted = election.votes_granted;
        let votes_needed = election.votes_needed;
        let responses_pending = election.responses_pending;

        if votes_granted >= votes_needed {
            if dry_run {
                self.enter_real_election(inner, now);
            } else {
                self.win_election(inner, now);
            }
        } else if responses_pending == 0 {
            tracing::info!(
                granted = votes_granted,
                needed = votes_needed,
                dry_run,
                "not enough votes, election lost"
            );
            self.lose_election(inner, now);
        }
    }

    fn win_election(&self, inner: &mut Inner, now: Date) {
        inner.topology.process_win_election(now);
        inner.election = None;
        self.sync_election_timer(inner);
        self.advance_commit_locked(inner);
        self.external.signal_applier_state_change(MemberState::Primary);
    }

    fn lose_election(&self, inner: &mut Inner, now: Date) {
        inner.topology.process_lose_election(now);
        inner.election = None;
        self.sync_election_timer(inner);
    }

    /// Single-node fast path: a lone electable member with an applied
    /// position stands immediately.
    fn consider_standing_for_election(&self, inner: &mut Inner, now: Date) {
        if inner.election.is_some() || inner.shutdown {
            return;
        }
        let Some(config) = inner.topology.config() else {
            return;
        };
        if config.member_count() != 1
            || !inner.topology.is_electable_self()
            || inner.topology.member_state() != MemberState::Secondary
            || inner.tracker.my_last_applied().is_zero()
            || now < inner.topology.freeze_until()
            || now < inner.topology.step_down_until()
        {
            return;
        }
        self.start_election(inner, now);
    }

    /// Handles an inbound `replSetRequestVotes`.
    pub fn process_repl_set_request_votes(&self, args: &Value) -> Result<Value> {
        let mut inner = self.lock_inner();
        if inner.shutdown {
            return Err(Error::ShutdownInProgress);
        }
        let Some(config) = inner.topology.config() else {
            return Err(Error::NotYetInitialized("no replica set config".into()));
        };
        let config_version = config.version;

        let req_term = args.get("term").and_then(Value::as_i64).unwrap_or(-1);
        let dry_run = args.get("dryRun").and_then(Value::as_bool).unwrap_or(false);
        let req_config_version = args
            .get("configVersion")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        let candidate_applied = args
            .get("lastAppliedOpTime")
            .and_then(|optime| {
                let ts = optime.get("ts")?;
                Some(OpTime::new(
                    Timestamp::new(
                        ts.get("secs")?.as_u64()? as u32,
                        ts.get("inc")?.as_u64()? as u32,
                    ),
                    optime.get("t")?.as_i64()?,
                ))
            })
            .unwrap_or(OpTime::ZERO);

        if req_term > inner.topology.term() {
            let now = self.clock.now();
            if let UpdateTermResult::Updated { was_primary: true } =
                inner.topology.update_term(req_term)
            {
                self.relinquish_primary(&mut inner, now);
            }
            self.sync_election_timer(&mut inner);
        }

        let our_term = inner.topology.term();
        let reason;
        let granted;
        if req_config_version != config_version {
            granted = false;
            reason = "candidate's config version differs from mine".to_string();
        } else if req_term < our_term {
            granted = false;
            reason = format!("candidate's term {req_term} is lower than mine {our_term}");
        } else if candidate_applied < inner.tracker.my_last_applied() {
            granted = false;
            reason = "candidate's data is staler than mine".to_string();
        } else if !dry_run && inner.last_voted_term >= req_term {
            granted = false;
            reason = format!("already voted for another candidate in term {req_term}");
        } else {
            granted = true;
            reason = String::new();
            if !dry_run {
                inner.last_voted_term = req_term;
            }
        }
        drop(inner);
        self.wake.notify_all();
        Ok(json!({
            "ok": 1,
            "term": our_term,
            "voteGranted": granted,
            "reason": reason,
        }))
    }

    // ========================================================================
    // Heartbeat Service (inbound)
    // ========================================================================

    /// Answers an inbound `replSetHeartbeat`.
    pub fn process_heartbeat_request(&self, request_doc: &Value) -> Result<Value> {
        let inner = self.lock_inner();
        if inner.shutdown {
            return Err(Error::ShutdownInProgress);
        }
        let request = HeartbeatRequest::from_document(request_doc)?;
        let response = inner
            .topology
            .prepare_heartbeat_response(&request, inner.tracker.my_last_applied());
        Ok(response.to_document())
    }

    // ========================================================================
    // Op-Time Bookkeeping
    // ========================================================================

    /// Records our applied position from the apply pipeline.
    pub fn set_my_last_applied_op_time(&self, op_time: OpTime) {
        let mut inner = self.lock_inner();
        if inner.tracker.set_my_last_applied(op_time) {
            self.advance_commit_locked(&mut inner);
            self.reevaluate_waiters(&mut inner);
            let now = self.clock.now();
            self.check_stepdown_progress(&mut inner, now);
            self.consider_standing_for_election(&mut inner, now);
        }
        drop(inner);
        self.wake.notify_all();
    }

    /// Forward-only variant; equal or smaller values are silently ignored.
    pub fn set_my_last_applied_op_time_forward(&self, op_time: OpTime) {
        self.set_my_last_applied_op_time(op_time);
    }

    /// Recomputes the commit point and the committed snapshot, in that order.
    fn advance_commit_locked(&self, inner: &mut Inner) {
        if let Some(config) = inner.topology.config() {
            let clamp = (inner.topology.member_state() == MemberState::Primary)
                .then(|| inner.tracker.my_last_applied());
            let term = inner.topology.term();
            let config = config.clone();
            inner.tracker.recompute_commit_point(&config, term, clamp);
        }
        let commit = inner.tracker.last_committed();
        inner.snapshots.update_committed(commit);
    }

    // ========================================================================
    // Write-Concern Waiting
    // ========================================================================

    /// Blocks until `target` is replicated per `concern`.
    ///
    /// Returns the time spent waiting.
    pub fn await_replication(
        &self,
        op_id: OpId,
        target: OpTime,
        concern: &WriteConcern,
    ) -> Result<Duration> {
        let started = self.clock.now();
        let mut inner = self.lock_inner();
        if inner.shutdown {
            return Err(Error::ShutdownInProgress);
        }

        if inner.mode == ReplicationMode::ReplSet && !inner.topology.can_accept_writes() {
            return Err(Error::NotMaster(
                "cannot await replication while not primary".into(),
            ));
        }

        // The write this caller is waiting on reserved the most recent
        // snapshot name; the committed snapshot must reach it.
        let min_snapshot_name = (inner.mode == ReplicationMode::ReplSet
            && matches!(concern.w, WMode::Majority))
        .then(|| inner.snapshots.last_reserved_name());

        if self.write_concern_check(&inner, target, concern, min_snapshot_name)? {
            return Ok(self.clock.now().since(started));
        }

        let deadline = match concern.w_timeout {
            WTimeout::NoWaiting => {
                return Err(Error::WriteConcernFailed {
                    waited: self.clock.now().since(started),
                });
            }
            WTimeout::NoTimeout => None,
            WTimeout::Millis(timeout) => Some(started + timeout),
        };

        let waiter_id = inner.waiters.register(
            target,
            WaiterCondition::Write {
                concern: concern.clone(),
                min_snapshot_name,
            },
            op_id,
            started,
        );
        drop(inner);
        self.wake.notify_all();

        self.block_on_waiter(waiter_id, deadline, started)
    }

    /// Awaits replication of our own last applied position.
    pub fn await_replication_of_last_op_for_client(
        &self,
        op_id: OpId,
        concern: &WriteConcern,
    ) -> Result<Duration> {
        let target = self.my_last_applied_op_time();
        self.await_replication(op_id, target, concern)
    }

    fn block_on_waiter(
        &self,
        waiter_id: u64,
        deadline: Option<Date>,
        started: Date,
    ) -> Result<Duration> {
        let mut inner = self.lock_inner();
        loop {
            if let Some(result) = inner.waiters.take_result(waiter_id) {
                let waited = self.clock.now().since(started);
                return result.map(|()| waited);
            }
            let now = self.clock.now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    inner.waiters.abandon(waiter_id);
                    return Err(Error::WriteConcernFailed {
                        waited: now.since(started),
                    });
                }
            }
            let remaining = deadline.map_or(Duration::from_millis(50), |d| d.since(now));
            let hint = self.clock.wait_hint(remaining.max(Duration::from_millis(1)));
            let (guard, _) = self
                .wake
                .wait_timeout(inner, hint)
                .expect("replication coordinator poisoned");
            inner = guard;
        }
    }

    /// Pure satisfaction check; `Err` means the wait can never succeed.
    fn write_concern_check(
        &self,
        inner: &Inner,
        target: OpTime,
        concern: &WriteConcern,
        min_snapshot_name: Option<SnapshotName>,
    ) -> Result<bool> {
        match inner.mode {
            ReplicationMode::None => Err(Error::NoReplicationEnabled(
                "not running with replication".into(),
            )),
            ReplicationMode::MasterSlave => match &concern.w {
                // Majority trivially holds under master/slave.
                WMode::Majority => Ok(true),
                WMode::Nodes(w) => Ok(1 + inner.handshake_hosts.len() >= *w as usize),
                WMode::Custom(name) => Err(Error::UnknownReplWriteConcern(name.clone())),
            },
            ReplicationMode::ReplSet => {
                let Some(config) = inner.topology.config() else {
                    return Err(Error::NotYetInitialized("no replica set config".into()));
                };
                match &concern.w {
                    WMode::Nodes(0) => Ok(true),
                    WMode::Nodes(w) if *w as usize > config.member_count() => {
                        Err(Error::CannotSatisfyWriteConcern(format!(
                            "Not enough data-bearing nodes: want {w}, have {}",
                            config.member_count()
                        )))
                    }
                    WMode::Nodes(w) => Ok(inner.tracker.nodes_satisfied(target, *w)),
                    WMode::Custom(name) => {
                        let Some(mode) = config.get_last_error_mode(name) else {
                            return Err(Error::UnknownReplWriteConcern(name.clone()));
                        };
                        Ok(inner.tracker.mode_satisfied(config, target, mode))
                    }
                    WMode::Majority => {
                        if !inner.tracker.majority_count_satisfied(config, target) {
                            return Ok(false);
                        }
                        let Some((snapshot_op, snapshot_name)) = inner.snapshots.current_committed()
                        else {
                            return Ok(false);
                        };
                        Ok(snapshot_op >= target
                            && min_snapshot_name.is_none_or(|min| snapshot_name >= min))
                    }
                }
            }
        }
    }

    /// Re-evaluates every sleeping operation after a state change.
    fn reevaluate_waiters(&self, inner: &mut Inner) {
        let pending = inner.waiters.unresolved();
        for waiter in pending {
            let decision = self.evaluate_waiter(inner, &waiter);
            if let Some(result) = decision {
                inner.waiters.resolve(waiter.id, result);
            }
        }
    }

    fn evaluate_waiter(&self, inner: &Inner, waiter: &Waiter) -> Option<Result<()>> {
        match &waiter.condition {
            WaiterCondition::Write {
                concern,
                min_snapshot_name,
            } => match self.write_concern_check(inner, waiter.target, concern, *min_snapshot_name)
            {
                Ok(true) => Some(Ok(())),
                Ok(false) => None,
                // Feasibility changed underneath the waiter (reconfig).
                Err(error) => Some(Err(error)),
            },
            WaiterCondition::Read { level } => match level {
                ReadConcernLevel::Local => {
                    (inner.tracker.my_last_applied() >= waiter.target).then_some(Ok(()))
                }
                ReadConcernLevel::Majority => inner
                    .snapshots
                    .current_committed()
                    .is_some_and(|(op, _)| op >= waiter.target)
                    .then_some(Ok(())),
            },
        }
    }

    // ========================================================================
    // Read-Concern Waiting
    // ========================================================================

    /// Blocks until the read predicate for `target` holds.
    ///
    /// Returns whether a wait was performed.
    pub fn wait_until_op_time(
        &self,
        op_id: OpId,
        target: Option<OpTime>,
        concern: ReadConcern,
    ) -> Result<bool> {
        let mut inner = self.lock_inner();
        if inner.shutdown {
            return Err(Error::ShutdownInProgress);
        }
        if inner.mode != ReplicationMode::ReplSet {
            return Err(Error::NotAReplicaSet(
                "node needs to be a replica set member to use read concern".into(),
            ));
        }
        if concern.level == ReadConcernLevel::Majority
            && !self.settings.majority_read_concern_enabled
        {
            return Err(Error::ReadConcernMajorityNotEnabled);
        }
        let Some(target) = target else {
            return Ok(true);
        };

        let satisfied = match concern.level {
            ReadConcernLevel::Local => inner.tracker.my_last_applied() >= target,
            ReadConcernLevel::Majority => inner
                .snapshots
                .current_committed()
                .is_some_and(|(op, _)| op >= target),
        };
        if satisfied {
            return Ok(true);
        }

        let started = self.clock.now();
        let waiter_id = inner.waiters.register(
            target,
            WaiterCondition::Read {
                level: concern.level,
            },
            op_id,
            started,
        );
        drop(inner);
        self.wake.notify_all();

        self.block_on_waiter(waiter_id, None, started).map(|_| true)
    }

    // ========================================================================
    // Stepdown
    // ========================================================================

    /// Blocking stepdown: catch-up, then demotion.
    pub fn step_down(
        &self,
        op_id: OpId,
        force: bool,
        wait_timeout: Duration,
        step_down_duration: Duration,
    ) -> Result<()> {
        let ticket = self.step_down_nonblocking(op_id, force, wait_timeout, step_down_duration)?;
        self.step_down_finish(ticket)
    }

    /// Starts a stepdown attempt without blocking for its completion.
    ///
    /// The returned ticket holds the exclusive operation lock; pass it to
    /// [`ReplicationCoordinator::step_down_finish`] to collect the result.
    pub fn step_down_nonblocking(
        &self,
        op_id: OpId,
        force: bool,
        wait_timeout: Duration,
        step_down_duration: Duration,
    ) -> Result<StepDownTicket> {
        // The exclusive operation lock comes first; failure to acquire
        // within the budget is the caller's whole time allowance.
        let Some(lock_guard) = self.global_lock.try_lock_exclusive(wait_timeout) else {
            return Err(Error::ExceededTimeLimit {
                waited: wait_timeout,
            });
        };

        let mut inner = self.lock_inner();
        if inner.shutdown {
            return Err(Error::ShutdownInProgress);
        }
        if inner.mode != ReplicationMode::ReplSet {
            return Err(Error::NoReplicationEnabled(
                "not a member of a replica set".into(),
            ));
        }
        if inner.topology.member_state() != MemberState::Primary {
            return Err(Error::NotMaster("not primary so can't step down".into()));
        }
        if inner.stepdown.is_some() {
            return Err(Error::OperationFailed(
                "a stepdown is already in progress".into(),
            ));
        }

        let now = self.clock.now();
        inner.stepdown = Some(StepDownAttempt {
            force,
            wait_deadline: now + wait_timeout,
            step_down_duration,
            op_id,
            started_at: now,
            result: None,
        });

        // Catch-up begins with a fresh heartbeat round.
        inner.executor.cancel_heartbeats();
        inner.heartbeat_handles.clear();
        if let Some(config) = inner.topology.config() {
            let member_count = config.member_count();
            let self_index = inner.topology.self_index();
            for index in 0..member_count {
                if Some(index) != self_index {
                    let handle = inner
                        .executor
                        .schedule_at(now, ScheduledEvent::HeartbeatDue(index));
                    inner.heartbeat_handles.insert(index, handle);
                }
            }
        }
        self.pump_locked(&mut inner);

        // First predicate check happens right away; force passes it
        // unconditionally.
        self.check_stepdown_progress(&mut inner, now);

        drop(inner);
        self.wake.notify_all();
        Ok(StepDownTicket {
            _lock_guard: lock_guard,
        })
    }

    /// Waits for a stepdown attempt to finish and returns its outcome.
    pub fn step_down_finish(&self, ticket: StepDownTicket) -> Result<()> {
        let mut inner = self.lock_inner();
        let result = loop {
            let now = self.clock.now();
            self.check_stepdown_deadline(&mut inner, now);
            let Some(attempt) = inner.stepdown.as_ref() else {
                break Err(Error::OperationFailed("no stepdown in progress".into()));
            };
            if attempt.result.is_some() {
                let attempt = inner.stepdown.take().expect("attempt present");
                break attempt.result.expect("result present");
            }
            let remaining = attempt.wait_deadline.since(now);
            let hint = self
                .clock
                .wait_hint(remaining.max(Duration::from_millis(1)));
            let (guard, _) = self
                .wake
                .wait_timeout(inner, hint)
                .expect("replication coordinator poisoned");
            inner = guard;
        };
        drop(inner);
        drop(ticket); // releases the exclusive operation lock
        self.wake.notify_all();
        result
    }

    /// True once the pending stepdown attempt has a result.
    pub fn step_down_result_ready(&self) -> bool {
        self.lock_inner()
            .stepdown
            .as_ref()
            .is_some_and(|attempt| attempt.result.is_some())
    }

    /// Completes the attempt when a caught-up electable secondary exists.
    fn check_stepdown_progress(&self, inner: &mut Inner, now: Date) {
        let Some(attempt) = inner.stepdown.as_ref() else {
            return;
        };
        if attempt.result.is_some() {
            return;
        }
        let caught_up = attempt.force || self.stepdown_predicate(inner);
        if caught_up {
            let duration = attempt.step_down_duration;
            self.relinquish_primary_for(inner, now, now + duration);
            if let Some(attempt) = inner.stepdown.as_mut() {
                attempt.result = Some(Ok(()));
            }
        }
    }

    fn stepdown_predicate(&self, inner: &Inner) -> bool {
        let Some(config) = inner.topology.config() else {
            return false;
        };
        let my_applied = inner.tracker.my_last_applied();
        let self_index = inner.topology.self_index();
        config
            .members
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != self_index)
            .filter(|(_, member)| member.is_electable())
            .any(|(index, _)| inner.tracker.member_last_applied(index) >= my_applied)
    }

    fn check_stepdown_deadline(&self, inner: &mut Inner, now: Date) {
        let Some(attempt) = inner.stepdown.as_mut() else {
            return;
        };
        if attempt.result.is_some() || now < attempt.wait_deadline {
            return;
        }
        if attempt.force {
            let duration = attempt.step_down_duration;
            self.relinquish_primary_for(inner, now, now + duration);
            if let Some(attempt) = inner.stepdown.as_mut() {
                attempt.result = Some(Ok(()));
            }
        } else {
            let waited = now.since(attempt.started_at);
            attempt.result = Some(Err(Error::ExceededTimeLimit { waited }));
        }
    }

    /// Immediate demotion with no post-step window (liveness or term-bump).
    fn relinquish_primary(&self, inner: &mut Inner, now: Date) {
        self.relinquish_primary_for(inner, now, now);
    }

    fn relinquish_primary_for(&self, inner: &mut Inner, now: Date, until: Date) {
        if inner.topology.member_state() != MemberState::Primary {
            return;
        }
        inner.topology.step_down(now, until);
        self.sync_election_timer(inner);

        // Replication waiters fail over to the new primary; reads keep
        // waiting on their predicates.
        inner
            .waiters
            .resolve_where(Waiter::is_write, Error::NotMaster("stepped down".into()));

        self.external
            .signal_applier_state_change(inner.topology.member_state());
    }

    // ========================================================================
    // Term & Metadata
    // ========================================================================

    /// Adopts a term seen on the wire.
    pub fn update_term(&self, term: i64) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.mode != ReplicationMode::ReplSet {
            return Err(Error::BadValue(
                "cannot update term when not a replica set member".into(),
            ));
        }
        match inner.topology.update_term(term) {
            UpdateTermResult::Unchanged => Ok(()),
            UpdateTermResult::Updated { was_primary } => {
                let now = self.clock.now();
                if was_primary {
                    self.relinquish_primary(&mut inner, now);
                }
                if inner.election.is_some() {
                    self.lose_election(&mut inner, now);
                }
                self.sync_election_timer(&mut inner);
                drop(inner);
                self.wake.notify_all();
                Err(Error::StaleTerm(format!("newer term {term} observed")))
            }
        }
    }

    /// Applies a `$replData` metadata block from a command reply.
    pub fn process_repl_set_metadata(&self, metadata: &ReplicaSetMetadata) {
        let mut inner = self.lock_inner();
        let Some(config) = inner.topology.config() else {
            return;
        };
        // Metadata from another config version is not comparable.
        if metadata.config_version != config.version {
            return;
        }
        let now = self.clock.now();
        if let UpdateTermResult::Updated { was_primary } =
            inner.topology.update_term(metadata.term)
        {
            if was_primary {
                self.relinquish_primary(&mut inner, now);
            }
            if inner.election.is_some() {
                self.lose_election(&mut inner, now);
            }
            self.sync_election_timer(&mut inner);
        }
        if inner
            .tracker
            .advance_commit_from_metadata(metadata.last_op_committed)
        {
            let commit = inner.tracker.last_committed();
            inner.snapshots.update_committed(commit);
            self.reevaluate_waiters(&mut inner);
        }
        drop(inner);
        self.wake.notify_all();
    }

    /// Builds the `$replData` block for attachment to a command reply.
    pub fn prepare_replica_set_metadata(&self) -> ReplicaSetMetadata {
        let inner = self.lock_inner();
        ReplicaSetMetadata {
            last_op_committed: inner.tracker.last_committed(),
            last_op_visible: inner.tracker.last_committed(),
            config_version: inner.topology.config().map_or(-1, |c| c.version),
            primary_index: inner.topology.current_primary_index(),
            term: inner.topology.term(),
            sync_source_index: -1,
        }
    }

    // ========================================================================
    // Position Updates
    // ========================================================================

    /// Applies a `replSetUpdatePosition` command.
    ///
    /// On a config-version mismatch, our version is written to
    /// `out_config_version` for the caller's reply.
    pub fn process_repl_set_update_position(
        &self,
        args_doc: &Value,
        out_config_version: &mut i64,
    ) -> Result<()> {
        let args = UpdatePositionArgs::from_document(args_doc)?;
        let mut inner = self.lock_inner();
        let Some(config) = inner.topology.config() else {
            return Err(Error::NotYetInitialized("no replica set config".into()));
        };
        let config_version = config.version;
        let self_id = inner
            .topology
            .self_index()
            .map(|index| config.members[index].id);

        let now = self.clock.now();
        let mut advanced = false;
        for entry in &args.entries {
            // Our own position is tracked locally, not by the protocol.
            if Some(entry.member_id) == self_id {
                continue;
            }
            if entry.config_version != config_version {
                *out_config_version = config_version;
                return Err(Error::InvalidReplicaSetConfig(format!(
                    "received replSetUpdatePosition for config version {}, but our config version is {config_version}",
                    entry.config_version
                )));
            }
            let Some(config) = inner.topology.config() else {
                break;
            };
            let Some(index) = config.find_member_index(entry.member_id) else {
                return Err(Error::NodeNotFound(format!(
                    "Received replSetUpdatePosition for node with memberId {} which doesn't exist in our config",
                    entry.member_id
                )));
            };
            advanced |= inner.tracker.update_member(index, entry.op_time);
            inner.topology.record_member_liveness(index, now);
        }

        if advanced {
            self.advance_commit_locked(&mut inner);
            self.reevaluate_waiters(&mut inner);
            self.check_stepdown_progress(&mut inner, now);
        }
        drop(inner);
        self.wake.notify_all();
        Ok(())
    }

    /// Builds the outbound `replSetUpdatePosition`: our position plus every
    /// live member's, so the upstream view is transitive.
    pub fn prepare_repl_set_update_position_command(&self) -> Result<Value> {
        let inner = self.lock_inner();
        let Some(config) = inner.topology.config() else {
            return Err(Error::NotYetInitialized("no replica set config".into()));
        };
        let now = self.clock.now();
        let self_index = inner.topology.self_index();
        let mut entries = Vec::new();
        for (index, member) in config.members.iter().enumerate() {
            let is_self = Some(index) == self_index;
            // Members we consider down are not forwarded.
            if !is_self && !inner.topology.is_member_live(index, now) {
                continue;
            }
            let op_time = if is_self {
                inner.tracker.my_last_applied()
            } else {
                inner.tracker.member_last_applied(index)
            };
            entries.push(UpdatePositionEntry {
                config_version: config.version,
                member_id: member.id,
                op_time,
            });
        }
        Ok(UpdatePositionArgs { entries }.to_document())
    }

    // ========================================================================
    // Follower Modes, Maintenance, Drain
    // ========================================================================

    /// Explicitly sets a follower state. Returns whether the state changed.
    pub fn set_follower_mode(&self, new_state: MemberState) -> Result<bool> {
        let mut inner = self.lock_inner();
        let now = self.clock.now();
        let result = inner.topology.set_follower_mode(new_state, now)?;
        if result.canceled_election {
            // The vote requester dies with the ballot; the election future
            // resolves with no leadership change.
            inner.election = None;
        }
        self.sync_election_timer(&mut inner);
        if result.changed {
            self.external
                .signal_applier_state_change(inner.topology.member_state());
        }
        drop(inner);
        self.wake.notify_all();
        Ok(result.changed)
    }

    /// Adjusts the maintenance-mode counter.
    pub fn set_maintenance_mode(&self, enable: bool) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.mode != ReplicationMode::ReplSet {
            return Err(Error::NoReplicationEnabled(
                "can only set maintenance mode on replica set members".into(),
            ));
        }
        if inner.stepdown.is_some() {
            return Err(Error::NotSecondary(
                "cannot set maintenance mode while stepping down".into(),
            ));
        }
        let now = self.clock.now();
        inner.topology.set_maintenance_mode(enable, now)?;
        self.sync_election_timer(&mut inner);
        drop(inner);
        self.wake.notify_all();
        Ok(())
    }

    /// The applier finished draining; a freshly elected primary goes
    /// writable.
    pub fn signal_drain_complete(&self) {
        let mut inner = self.lock_inner();
        if inner.topology.signal_drain_complete() {
            self.advance_commit_locked(&mut inner);
            self.reevaluate_waiters(&mut inner);
        }
        drop(inner);
        self.wake.notify_all();
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Reserves a fresh, strictly increasing snapshot name.
    pub fn reserve_snapshot_name(&self) -> SnapshotName {
        self.lock_inner().snapshots.reserve_name()
    }

    /// Registers a storage-engine snapshot.
    pub fn on_snapshot_create(&self, op_time: OpTime, name: SnapshotName) {
        let mut inner = self.lock_inner();
        let commit = inner.tracker.last_committed();
        if inner.snapshots.on_snapshot_create(op_time, name, commit) {
            self.reevaluate_waiters(&mut inner);
        }
        drop(inner);
        self.wake.notify_all();
    }

    /// Drops every tracked snapshot.
    pub fn drop_all_snapshots(&self) {
        let mut inner = self.lock_inner();
        inner.snapshots.drop_all();
        drop(inner);
        self.wake.notify_all();
    }

    // ========================================================================
    // Rollback ID
    // ========================================================================

    /// Handles `replSetGetRBID`.
    pub fn process_repl_set_get_rbid(&self) -> u64 {
        self.lock_inner().rbid
    }

    /// Advances the rollback id; called exactly once per rollback start.
    pub fn increment_rollback_id(&self) {
        let mut inner = self.lock_inner();
        inner.rbid += 1;
        tracing::info!(rbid = inner.rbid, "incremented rollback id");
    }

    // ========================================================================
    // Freeze
    // ========================================================================

    /// Handles `replSetFreeze`.
    pub fn process_repl_set_freeze(&self, duration: Duration) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.mode != ReplicationMode::ReplSet {
            return Err(Error::NoReplicationEnabled(
                "not a member of a replica set".into(),
            ));
        }
        let now = self.clock.now();
        let stand_now = inner.topology.freeze(now, duration)?;
        self.sync_election_timer(&mut inner);
        if stand_now {
            self.consider_standing_for_election(&mut inner, now);
        }
        drop(inner);
        self.wake.notify_all();
        Ok(())
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Builds the `isMaster` response.
    pub fn is_master_response(&self) -> Value {
        let inner = self.lock_inner();
        let self_host = inner.topology.self_host().clone();
        match inner.mode {
            ReplicationMode::None => json!({
                "ismaster": true,
                "secondary": false,
                "me": self_host.to_string(),
            }),
            ReplicationMode::MasterSlave => json!({
                "ismaster": self.settings.master,
                "secondary": self.settings.slave,
                "me": self_host.to_string(),
            }),
            ReplicationMode::ReplSet => {
                let Some(config) = inner.topology.config() else {
                    return json!({
                        "ismaster": false,
                        "secondary": false,
                        "isreplicaset": true,
                        "info": "Does not have a valid replica set config",
                        "me": self_host.to_string(),
                    });
                };
                let mut hosts = Vec::new();
                let mut passives = Vec::new();
                let mut arbiters = Vec::new();
                for member in &config.members {
                    if member.hidden {
                        continue;
                    }
                    let host = member.host.to_string();
                    if member.arbiter_only {
                        arbiters.push(host);
                    } else if member.priority == 0.0 {
                        passives.push(host);
                    } else if member.is_voter() {
                        hosts.push(host);
                    }
                }
                let state = inner.topology.member_state();
                let mut doc = serde_json::Map::new();
                doc.insert(
                    "ismaster".into(),
                    Value::from(inner.topology.can_accept_writes()),
                );
                doc.insert(
                    "secondary".into(),
                    Value::from(state == MemberState::Secondary),
                );
                doc.insert("setName".into(), Value::from(config.name.clone()));
                doc.insert("setVersion".into(), Value::from(config.version));
                doc.insert("hosts".into(), Value::from(hosts));
                if !passives.is_empty() {
                    doc.insert("passives".into(), Value::from(passives));
                }
                if !arbiters.is_empty() {
                    doc.insert("arbiters".into(), Value::from(arbiters));
                }
                let primary_index = inner.topology.current_primary_index();
                if primary_index >= 0 {
                    if let Some(member) = config.members.get(primary_index as usize) {
                        doc.insert("primary".into(), Value::from(member.host.to_string()));
                    }
                }
                doc.insert("me".into(), Value::from(self_host.to_string()));
                if let Some(index) = inner.topology.self_index() {
                    let member = &config.members[index];
                    if !member.tags.is_empty() {
                        let tags: serde_json::Map<String, Value> = member
                            .tags
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                            .collect();
                        doc.insert("tags".into(), Value::Object(tags));
                    }
                    if member.arbiter_only {
                        doc.insert("arbiterOnly".into(), Value::from(true));
                    }
                    if member.hidden {
                        doc.insert("hidden".into(), Value::from(true));
                    }
                }
                Value::Object(doc)
            }
        }
    }

    /// Handles `replSetGetStatus`.
    pub fn process_repl_set_get_status(&self) -> Result<Value> {
        let inner = self.lock_inner();
        let Some(config) = inner.topology.config() else {
            return Err(Error::NotYetInitialized(
                "Received replSetGetStatus but we are in STARTUP state".into(),
            ));
        };
        let now = self.clock.now();
        let self_index = inner.topology.self_index();
        let members: Vec<Value> = config
            .members
            .iter()
            .enumerate()
            .map(|(index, member)| {
                let is_self = Some(index) == self_index;
                let (state, health, applied) = if is_self {
                    (
                        inner.topology.member_state(),
                        1,
                        inner.tracker.my_last_applied(),
                    )
                } else {
                    let data = &inner.topology.member_data()[index];
                    (
                        data.state,
                        i32::from(data.up),
                        inner.tracker.member_last_applied(index),
                    )
                };
                let mut doc = serde_json::Map::new();
                doc.insert("_id".into(), Value::from(member.id.as_i32()));
                doc.insert("name".into(), Value::from(member.host.to_string()));
                doc.insert("state".into(), Value::from(state.as_str()));
                doc.insert("health".into(), Value::from(health));
                doc.insert(
                    "optime".into(),
                    json!({
                        "ts": {"secs": applied.timestamp.secs, "inc": applied.timestamp.inc},
                        "t": applied.term,
                    }),
                );
                if is_self {
                    doc.insert("self".into(), Value::from(true));
                } else {
                    let data = &inner.topology.member_data()[index];
                    doc.insert(
                        "lastHeartbeat".into(),
                        Value::from(data.last_heartbeat_sent.as_millis()),
                    );
                    doc.insert(
                        "lastHeartbeatRecv".into(),
                        Value::from(data.last_heartbeat_recv.as_millis()),
                    );
                }
                Value::Object(doc)
            })
            .collect();
        let committed = inner.tracker.last_committed();
        Ok(json!({
            "set": config.name,
            "date": now.as_millis(),
            "myState": inner.topology.member_state().as_str(),
            "term": inner.topology.term(),
            "members": members,
            "optimes": {
                "lastCommittedOpTime": {
                    "ts": {"secs": committed.timestamp.secs, "inc": committed.timestamp.inc},
                    "t": committed.term,
                },
            },
            "ok": 1,
        }))
    }

    /// Hosts of every configured member except this node.
    pub fn get_other_nodes_in_repl_set(&self) -> Result<Vec<HostAndPort>> {
        let inner = self.lock_inner();
        let Some(config) = inner.topology.config() else {
            return Err(Error::NotYetInitialized("no replica set config".into()));
        };
        let Some(self_index) = inner.topology.self_index() else {
            return Err(Error::NodeNotFound(
                "this node is not in the replica set config".into(),
            ));
        };
        Ok(config.other_member_hosts(self_index))
    }

    // ========================================================================
    // Master/Slave Handshake
    // ========================================================================

    /// Records a downstream client for master/slave numeric-w accounting.
    pub fn process_handshake(&self, client: HostAndPort) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.mode != ReplicationMode::MasterSlave {
            return Ok(());
        }
        if !inner.handshake_hosts.contains(&client) {
            inner.handshake_hosts.push(client);
            self.reevaluate_waiters(&mut inner);
        }
        drop(inner);
        self.wake.notify_all();
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Cancels all timers and resolves every waiter with
    /// `ShutdownInProgress`.
    pub fn shutdown(&self) {
        let mut inner = self.lock_inner();
        inner.shutdown = true;
        inner.executor.cancel_all();
        inner.heartbeat_handles.clear();
        inner.election_timer_handle = None;
        inner.election = None;
        inner.waiters.shutdown_all();
        if let Some(attempt) = inner.stepdown.as_mut() {
            if attempt.result.is_none() {
                attempt.result = Some(Err(Error::ShutdownInProgress));
            }
        }
        if let Some(round) = inner.initiate_round.as_mut() {
            if round.failure.is_none() {
                round.failure = Some(Error::ShutdownInProgress);
            }
        }
        drop(inner);
        self.wake.notify_all();
        tracing::info!("replication coordinator shut down");
    }

    /// Cancels exactly the waiters belonging to `op_id`.
    pub fn interrupt(&self, op_id: OpId) {
        let mut inner = self.lock_inner();
        inner.waiters.interrupt(op_id);
        if let Some(attempt) = inner.stepdown.as_mut() {
            if attempt.op_id == op_id && attempt.result.is_none() {
                // The node remains primary.
                attempt.result = Some(Err(Error::Interrupted));
            }
        }
        drop(inner);
        self.wake.notify_all();
    }

    // ========================================================================
    // Test Observability
    // ========================================================================

    /// Number of unresolved sleeping operations.
    pub fn waiter_count_for_test(&self) -> usize {
        self.lock_inner().waiters.unresolved_count()
    }

    /// True while an election is being conducted.
    pub fn election_in_progress_for_test(&self) -> bool {
        self.lock_inner().election.is_some()
    }

    /// Blocks until the observed member state equals `state`.
    pub fn wait_for_member_state_for_test(
        &self,
        state: MemberState,
        timeout: Duration,
    ) -> Result<()> {
        let started = self.clock.now();
        let mut inner = self.lock_inner();
        loop {
            if inner.topology.member_state() == state {
                return Ok(());
            }
            let now = self.clock.now();
            if now.since(started) >= timeout {
                return Err(Error::ExceededTimeLimit {
                    waited: now.since(started),
                });
            }
            let hint = self.clock.wait_hint(Duration::from_millis(10));
            let (guard, _) = self
                .wake
                .wait_timeout(inner, hint)
                .expect("replication coordinator poisoned");
            inner = guard;
        }
    }

    /// Blocks until no election is in progress.
    pub fn wait_for_election_finish_for_test(&self) {
        let mut inner = self.lock_inner();
        while inner.election.is_some() {
            let (guard, _) = self
                .wake
                .wait_timeout(inner, self.clock.wait_hint(Duration::from_millis(10)))
                .expect("replication coordinator poisoned");
            inner = guard;
        }
    }

    /// Blocks until no stepdown attempt is pending without a result.
    pub fn wait_for_step_down_finish_for_test(&self) {
        let mut inner = self.lock_inner();
        loop {
            match inner.stepdown.as_ref() {
                None => return,
                Some(attempt) if attempt.result.is_some() => return,
                Some(_) => {}
            }
            let now = self.clock.now();
            self.check_stepdown_deadline(&mut inner, now);
            let (guard, _) = self
                .wake
                .wait_timeout(inner, self.clock.wait_hint(Duration::from_millis(10)))
                .expect("replication coordinator poisoned");
            inner = guard;
        }
    }
}
