//! Abstract outbound command channel.
//!
//! The coordinator never opens sockets. It hands command documents to a
//! [`NetworkDispatcher`] and later collects responses keyed by token. The
//! production dispatcher is supplied by the server's transport layer; tests
//! plug in [`MockNetwork`], which records every request and plays back
//! scripted responses by scheduler time.

use std::collections::VecDeque;
use std::sync::Mutex;

use replicore_types::{Date, Error, HostAndPort, Result};
use serde_json::Value;

/// Token correlating a dispatched request with its eventual response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(pub u64);

/// An outbound command.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCommandRequest {
    pub target: HostAndPort,
    pub command: Value,
}

/// Pluggable outbound channel.
pub trait NetworkDispatcher: Send + Sync {
    /// Enqueues a command for delivery and returns its correlation token.
    fn dispatch(&self, request: RemoteCommandRequest) -> RequestToken;

    /// Returns every response that has arrived by `now`, in arrival order.
    fn ready_responses(&self, now: Date) -> Vec<(RequestToken, Result<Value>)>;
}

// ============================================================================
// Mock Network
// ============================================================================

#[derive(Debug)]
struct ScheduledResponse {
    token: RequestToken,
    at: Date,
    response: Result<Value>,
}

#[derive(Debug, Default)]
struct MockNetworkState {
    next_token: u64,
    /// Requests awaiting a scripted response, oldest first.
    outstanding: VecDeque<(RequestToken, RemoteCommandRequest)>,
    /// Responses queued for delivery.
    scheduled: Vec<ScheduledResponse>,
    /// Everything ever dispatched, for assertions.
    log: Vec<RemoteCommandRequest>,
}

/// Scripted responder for tests.
///
/// Requests pile up in arrival order; the test inspects them with
/// [`MockNetwork::take_outstanding`] (or peeks the log) and schedules each
/// response for a delivery time. Responses become visible to the coordinator
/// once the virtual clock passes that time.
#[derive(Debug, Default)]
pub struct MockNetwork {
    state: Mutex<MockNetworkState>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns all requests that have no scheduled response yet.
    pub fn take_outstanding(&self) -> Vec<(RequestToken, RemoteCommandRequest)> {
        let mut state = self.state.lock().expect("mock network poisoned");
        state.outstanding.drain(..).collect()
    }

    /// Number of requests awaiting a response.
    pub fn outstanding_count(&self) -> usize {
        self.state
            .lock()
            .expect("mock network poisoned")
            .outstanding
            .len()
    }

    /// Schedules a successful response document for delivery at `at`.
    pub fn schedule_response(&self, token: RequestToken, at: Date, response: Value) {
        let mut state = self.state.lock().expect("mock network poisoned");
        state.scheduled.push(ScheduledResponse {
            token,
            at,
            response: Ok(response),
        });
    }

    /// Schedules an error for delivery at `at`.
    pub fn schedule_error(&self, token: RequestToken, at: Date, error: Error) {
        let mut state = self.state.lock().expect("mock network poisoned");
        state.scheduled.push(ScheduledResponse {
            token,
            at,
            response: Err(error),
        });
    }

    /// Every request dispatched so far.
    pub fn request_log(&self) -> Vec<RemoteCommandRequest> {
        self.state
            .lock()
            .expect("mock network poisoned")
            .log
            .clone()
    }
}

impl NetworkDispatcher for MockNetwork {
    fn dispatch(&self, request: RemoteCommandRequest) -> RequestToken {
        let mut state = self.state.lock().expect("mock network poisoned");
        let token = RequestToken(state.next_token);
        state.next_token += 1;
        state.log.push(request.clone());
        state.outstanding.push_back((token, request));
        token
    }

    fn ready_responses(&self, now: Date) -> Vec<(RequestToken, Result<Value>)> {
        let mut state = self.state.lock().expect("mock network poisoned");
        let mut ready = Vec::new();
        let mut keep = Vec::new();
        for scheduled in state.scheduled.drain(..) {
            if scheduled.at <= now {
                ready.push((scheduled.token, scheduled.response));
            } else {
                keep.push(scheduled);
            }
        }
        state.scheduled = keep;
        ready.sort_by_key(|(token, _)| token.0);
        ready
    }
}
