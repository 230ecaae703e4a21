use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Outcome of a user-presence request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceDecision {
    Allowed,
    Denied,
    TimedOut,
}

/// Capability the command engine uses to confirm a physical gesture.
///
/// Exactly one request is outstanding at a time (command handling is
/// serialized by the transport worker), and the implementation must
/// return within the given budget. The worker blocks for the duration
/// of the gesture wait; the host sees silence until the response frame
/// goes out.
pub trait PresenceOracle: Send {
    fn request_presence(&mut self, timeout: Duration) -> PresenceDecision;
}

/// Grants every request. Development and test use.
pub struct AutoApprove;

impl PresenceOracle for AutoApprove {
    fn request_presence(&mut self, _timeout: Duration) -> PresenceDecision {
        PresenceDecision::Allowed
    }
}

/// Denies every request.
pub struct AutoDeny;

impl PresenceOracle for AutoDeny {
    fn request_presence(&mut self, _timeout: Duration) -> PresenceDecision {
        PresenceDecision::Denied
    }
}

/// Oracle half of a UI channel: posts a request marker, then blocks on
/// the UI thread's verdict.
pub struct ChannelPresence {
    requests: Sender<()>,
    decisions: Receiver<bool>,
}

/// UI half: observe pending requests and resolve them.
pub struct PresenceResolver {
    requests: Receiver<()>,
    decisions: Sender<bool>,
}

/// Build a connected oracle/resolver pair. The resolver belongs on the
/// UI thread, which is the sole producer of "presence granted".
pub fn presence_channel() -> (ChannelPresence, PresenceResolver) {
    let (request_tx, request_rx) = mpsc::channel();
    let (decision_tx, decision_rx) = mpsc::channel();
    (
        ChannelPresence {
            requests: request_tx,
            decisions: decision_rx,
        },
        PresenceResolver {
            requests: request_rx,
            decisions: decision_tx,
        },
    )
}

impl PresenceOracle for ChannelPresence {
    fn request_presence(&mut self, timeout: Duration) -> PresenceDecision {
        if self.requests.send(()).is_err() {
            log::warn!("Presence resolver is gone, denying");
            return PresenceDecision::Denied;
        }
        match self.decisions.recv_timeout(timeout) {
            Ok(true) => PresenceDecision::Allowed,
            Ok(false) => PresenceDecision::Denied,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Presence request timed out after {:?}", timeout);
                PresenceDecision::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Presence resolver disconnected, denying");
                PresenceDecision::Denied
            }
        }
    }
}

impl PresenceResolver {
    /// Wait for the next presence request.
    pub fn next_request(&self, timeout: Duration) -> bool {
        self.requests.recv_timeout(timeout).is_ok()
    }

    /// Answer the outstanding request. Returns false when the oracle is
    /// gone.
    pub fn resolve(&self, allow: bool) -> bool {
        self.decisions.send(allow).is_ok()
    }
}
