//! Phase bookkeeping for the invocation loop.
//!
//! The loop's local variables own the connection and handler; the machine
//! only tracks which phase the runtime is in and rejects events that cannot
//! happen there. An incompatible event is a programming error and panics.

use lambda_bootstrap_client::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Initialized,
    Starting,
    Connected,
    HandlerCreated,
    HandlerCreationFailed,
    ReportingStartupError,
    WaitingForInvocation,
    ExecutingInvocation(RequestId),
    ReportingInvocationResult { pipelined: bool },
    Shutdown,
    Failed,
}

#[derive(Debug)]
pub(crate) struct StateMachine {
    state: State,
}

impl StateMachine {
    pub(crate) fn new() -> StateMachine {
        StateMachine {
            state: State::Initialized,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn start(&mut self) {
        match self.state {
            State::Initialized => self.state = State::Starting,
            state => bad_event("start", state),
        }
    }

    pub(crate) fn connection_ready(&mut self) {
        match self.state {
            State::Starting => self.state = State::Connected,
            State::HandlerCreated => self.state = State::WaitingForInvocation,
            State::HandlerCreationFailed => self.state = State::ReportingStartupError,
            state => bad_event("connection_ready", state),
        }
    }

    pub(crate) fn connection_failed(&mut self) {
        match self.state {
            State::Starting | State::HandlerCreated | State::HandlerCreationFailed => {
                self.state = State::Failed
            }
            state => bad_event("connection_failed", state),
        }
    }

    pub(crate) fn handler_created(&mut self) {
        match self.state {
            State::Starting => self.state = State::HandlerCreated,
            State::Connected => self.state = State::WaitingForInvocation,
            state => bad_event("handler_created", state),
        }
    }

    pub(crate) fn handler_creation_failed(&mut self) {
        match self.state {
            State::Starting => self.state = State::HandlerCreationFailed,
            State::Connected => self.state = State::ReportingStartupError,
            state => bad_event("handler_creation_failed", state),
        }
    }

    pub(crate) fn invocation_received(&mut self, request_id: RequestId) {
        match self.state {
            State::WaitingForInvocation => self.state = State::ExecutingInvocation(request_id),
            state => bad_event("invocation_received", state),
        }
    }

    pub(crate) fn invocation_finished(&mut self, pipelined: bool) {
        match self.state {
            State::ExecutingInvocation(_) => {
                self.state = State::ReportingInvocationResult { pipelined }
            }
            state => bad_event("invocation_finished", state),
        }
    }

    pub(crate) fn accepted_received(&mut self) {
        match self.state {
            State::ReportingInvocationResult { .. } => self.state = State::WaitingForInvocation,
            // the startup error is on the wire; the runtime is done
            State::ReportingStartupError => self.state = State::Failed,
            state => bad_event("accepted_received", state),
        }
    }

    pub(crate) fn error_response_received(&mut self) {
        match self.state {
            State::WaitingForInvocation
            | State::ReportingInvocationResult { .. }
            | State::ReportingStartupError => self.state = State::Failed,
            state => bad_event("error_response_received", state),
        }
    }

    pub(crate) fn channel_inactive(&mut self, shutting_down: bool) {
        match self.state {
            State::Starting
            | State::Connected
            | State::HandlerCreated
            | State::HandlerCreationFailed
            | State::ReportingStartupError
            | State::WaitingForInvocation
            | State::ExecutingInvocation(_)
            | State::ReportingInvocationResult { .. } => {
                self.state = if shutting_down {
                    State::Shutdown
                } else {
                    State::Failed
                };
            }
            state => bad_event("channel_inactive", state),
        }
    }
}

fn bad_event(event: &str, state: State) -> ! {
    panic!("invalid event {event} in state {state:?}")
}
