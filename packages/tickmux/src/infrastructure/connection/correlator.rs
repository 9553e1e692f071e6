//! Request Correlator
//!
//! Matches each outgoing request to exactly one future inbound response.
//! Correlation ids come from a per-connection monotonic counter that is
//! never reset, not even across reconnects, so an id can never be reused
//! and a stale response can never resurrect a newer call.
//!
//! Each pending request owns a single-resolution slot. Resolution happens
//! exactly once: by a matching inbound message, or by connection-failure
//! propagation when the transport dies. A caller that abandons a suspended
//! call retires its id; a response arriving for a retired id is ignored
//! (and, when it confirms a subscription, triggers an automatic remote
//! cancel so the service does not keep streaming into the void).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::domain::fingerprint::RequestFingerprint;
use crate::domain::message::InboundMessage;
use crate::error::ApiError;

/// Outcome of offering an inbound message to the correlator.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// A pending request was resolved.
    Resolved {
        /// Fingerprint of the originating request, for cache updates.
        fingerprint: RequestFingerprint,
        /// Whether the response was a success (no remote error object).
        success: bool,
    },
    /// The id was retired by its caller before the response arrived.
    Retired {
        /// Remote subscription id carried by the late response, if any;
        /// the connection sends an automatic cancel for it.
        subscription_id: Option<String>,
    },
    /// The id is not pending here; the message may belong to a
    /// subscription stream.
    NotPending,
}

struct PendingRequest {
    slot: oneshot::Sender<Result<InboundMessage, ApiError>>,
    fingerprint: RequestFingerprint,
}

/// Per-connection correlation state.
pub(crate) struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    retired: Mutex<HashSet<u64>>,
}

impl RequestCorrelator {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashSet::new()),
        }
    }

    /// Assign a fresh correlation id and park a single-resolution slot.
    pub(crate) fn register(
        &self,
        fingerprint: RequestFingerprint,
    ) -> (u64, oneshot::Receiver<Result<InboundMessage, ApiError>>) {
        let req_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, receiver) = oneshot::channel();
        self.pending
            .lock()
            .insert(req_id, PendingRequest { slot, fingerprint });
        (req_id, receiver)
    }

    /// Remove an id whose request never reached the wire. The id stays
    /// consumed (the counter is monotonic) but is not tracked as retired.
    pub(crate) fn discard(&self, req_id: u64) {
        self.pending.lock().remove(&req_id);
    }

    /// Retire an id whose caller abandoned the suspended call. Retired ids
    /// are remembered so a late response is recognized and dropped.
    pub(crate) fn retire(&self, req_id: u64) {
        if self.pending.lock().remove(&req_id).is_some() {
            self.retired.lock().insert(req_id);
        }
    }

    /// Offer an inbound message carrying `req_id` for resolution.
    pub(crate) fn resolve(&self, req_id: u64, message: &InboundMessage) -> Resolution {
        let late_subscription = || message.subscription_id().map(ToOwned::to_owned);

        if let Some(entry) = self.pending.lock().remove(&req_id) {
            let outcome = message.error.as_ref().map_or_else(
                || Ok(message.clone()),
                |error| Err(ApiError::remote(error.code.clone(), error.message.clone())),
            );
            let success = outcome.is_ok();
            if entry.slot.send(outcome).is_err() {
                // The caller went away between the send and the response.
                return Resolution::Retired {
                    subscription_id: late_subscription(),
                };
            }
            return Resolution::Resolved {
                fingerprint: entry.fingerprint,
                success,
            };
        }

        if self.retired.lock().remove(&req_id) {
            return Resolution::Retired {
                subscription_id: late_subscription(),
            };
        }

        Resolution::NotPending
    }

    /// Fail every outstanding request with the given error. Called on
    /// connection loss and on explicit disconnect; afterwards no pending
    /// entry remains.
    pub(crate) fn fail_all(&self, error: &ApiError) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.slot.send(Err(error.clone()));
        }
        self.retired.lock().clear();
    }

    /// Number of requests currently awaiting a response.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}
