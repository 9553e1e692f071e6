//! Subscription Manager
//!
//! Deduplicates streaming subscriptions and fans events out to independent
//! subscriber handles. The remote service charges per distinct
//! subscription, so logically identical requests (same
//! [`RequestFingerprint`]) share one upstream channel; each caller still
//! gets its own cancellable handle with its own delivery queue, so a slow
//! consumer never delays the others and no handle ever loses or duplicates
//! an event.
//!
//! Creation is arbitrated: the first subscriber for a fingerprint sends the
//! remote subscribe request; anyone arriving while that is in flight
//! attaches as a waiter instead of double-sending. Events that race in
//! between confirmation and activation are buffered per source and flushed
//! in arrival order.
//!
//! Two secondary indexes map remote identifiers back to sources: the
//! remote subscription id (learned from the confirmation, used for
//! cancellation and event routing) and a derived entity id such as a
//! contract id from a buy-style confirmation, so a later
//! track-this-entity subscribe attaches to the originating source instead
//! of opening a second upstream channel.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::domain::ConnectionId;
use crate::domain::fingerprint::RequestFingerprint;
use crate::domain::message::{ENTITY_ID_FIELD, InboundMessage, entity_string};
use crate::error::ApiError;

// =============================================================================
// Public Types
// =============================================================================

/// One delivery to a subscriber handle.
#[derive(Debug, Clone)]
pub enum SourceUpdate {
    /// A streaming event.
    Event(InboundMessage),
    /// The source ended; no further events will arrive.
    Terminated(TerminationReason),
}

/// Why a source ended.
#[derive(Debug, Clone)]
pub enum TerminationReason {
    /// The subscription was cancelled by `forget` / `forget_all`.
    Forgotten,
    /// The remote side confirmed the request without opening a stream.
    Completed,
    /// The source failed; subscribers observing this must re-subscribe if
    /// they still want the stream.
    Failed(ApiError),
}

impl TerminationReason {
    /// The error a subscriber observes, if the termination was a failure.
    #[must_use]
    pub fn into_error(self) -> Option<ApiError> {
        match self {
            Self::Forgotten | Self::Completed => None,
            Self::Failed(error) => Some(error),
        }
    }
}

/// One subscriber's handle onto a shared source: a lazy, infinite,
/// non-restartable sequence of streaming events.
///
/// Poll it with [`next`](Self::next) or consume it as a
/// [`futures::Stream`]. Dropping a handle detaches it locally; explicit
/// remote cancellation goes through
/// [`Connection::forget`](crate::infrastructure::connection::Connection::forget).
#[derive(Debug)]
pub struct SubscriptionHandle {
    connection_id: ConnectionId,
    handle_id: u64,
    fingerprint: RequestFingerprint,
    kind: String,
    rx: mpsc::UnboundedReceiver<SourceUpdate>,
    finished: bool,
}

impl SubscriptionHandle {
    /// The connection this handle belongs to.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// The stream kind of the underlying source.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The fingerprint of the underlying source.
    #[must_use]
    pub const fn fingerprint(&self) -> &RequestFingerprint {
        &self.fingerprint
    }

    /// Await the next event.
    ///
    /// Returns `None` once the source ended gracefully (forgotten or
    /// completed); a connection failure yields one final `Err`, then
    /// `None`.
    pub async fn next(&mut self) -> Option<Result<InboundMessage, ApiError>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(SourceUpdate::Event(message)) => Some(Ok(message)),
            Some(SourceUpdate::Terminated(reason)) => {
                self.finished = true;
                reason.into_error().map(Err)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

impl Stream for SubscriptionHandle {
    type Item = Result<InboundMessage, ApiError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(SourceUpdate::Event(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(SourceUpdate::Terminated(reason))) => {
                this.finished = true;
                Poll::Ready(reason.into_error().map(Err))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// Internal State
// =============================================================================

/// Creation progress of a source, observed by waiters.
#[derive(Debug, Clone)]
pub(crate) enum CreationOutcome {
    Pending,
    Ready,
    Failed(ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceStatus {
    Creating,
    Active,
}

struct SourceEntry {
    kind: String,
    status: SourceStatus,
    subscription_id: Option<String>,
    handles: HashMap<u64, mpsc::UnboundedSender<SourceUpdate>>,
    outcome_tx: watch::Sender<CreationOutcome>,
    /// Events that arrived between confirmation and activation; flushed in
    /// arrival order right after the confirmation fans out.
    pending_events: Vec<InboundMessage>,
}

#[derive(Default)]
struct Registry {
    sources: HashMap<RequestFingerprint, SourceEntry>,
    by_subscription_id: HashMap<String, RequestFingerprint>,
    by_request_id: HashMap<u64, RequestFingerprint>,
    by_kind: HashMap<String, HashSet<RequestFingerprint>>,
    by_entity: HashMap<String, RequestFingerprint>,
}

/// Result of an attach attempt.
pub(crate) enum AttachOutcome {
    /// The source is active; the handle is live immediately.
    Attached(SubscriptionHandle),
    /// Creation is in flight; await the outcome before handing the handle
    /// to the caller.
    Waiting(SubscriptionHandle, watch::Receiver<CreationOutcome>),
    /// No source existed; the caller owns driving the remote subscribe.
    Begun(SubscriptionHandle),
}

/// Result of activating a source with its confirmation response.
pub(crate) enum Activation {
    /// The source is live and streaming.
    Streaming,
    /// The confirmation carried no subscription id; the source delivered
    /// the confirmation and ended.
    Completed,
    /// Every handle was forgotten while creation was in flight; the caller
    /// must cancel the remote subscription.
    Orphaned {
        /// Remote id to cancel, when the confirmation carried one.
        subscription_id: Option<String>,
    },
}

/// Result of detaching a handle.
pub(crate) enum Detach {
    /// Other handles remain attached.
    Remaining,
    /// The last handle detached and the source was removed.
    LastHandle {
        /// Remote id to cancel, when one was learned.
        subscription_id: Option<String>,
    },
    /// The source was already gone.
    Gone,
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Per-connection subscription state. All maps are owned exclusively by the
/// connection; routing happens on its pump, attach/detach on caller tasks,
/// both funneled through one lock.
pub struct SubscriptionManager {
    state: Mutex<Registry>,
    next_handle_id: AtomicU64,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(Registry::default()),
            next_handle_id: AtomicU64::new(1),
        }
    }

    /// Attach to an existing source (directly or via the entity index) or
    /// begin creating one.
    pub(crate) fn attach_or_begin(
        &self,
        connection_id: ConnectionId,
        fingerprint: RequestFingerprint,
        kind: &str,
        entity: Option<String>,
    ) -> AttachOutcome {
        let mut state = self.state.lock();
        let registry = &mut *state;

        // A request naming a tracked entity attaches to the source that
        // spawned the entity, e.g. tracking a contract bought earlier.
        let target = entity
            .and_then(|id| registry.by_entity.get(&id).cloned())
            .unwrap_or(fingerprint);

        let handle_id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(entry) = registry.sources.get_mut(&target) {
            entry.handles.insert(handle_id, tx);
            let handle = Self::handle(connection_id, handle_id, target, entry.kind.clone(), rx);
            return match entry.status {
                SourceStatus::Active => AttachOutcome::Attached(handle),
                SourceStatus::Creating => {
                    AttachOutcome::Waiting(handle, entry.outcome_tx.subscribe())
                }
            };
        }

        let (outcome_tx, _) = watch::channel(CreationOutcome::Pending);
        let mut entry = SourceEntry {
            kind: kind.to_owned(),
            status: SourceStatus::Creating,
            subscription_id: None,
            handles: HashMap::new(),
            outcome_tx,
            pending_events: Vec::new(),
        };
        entry.handles.insert(handle_id, tx);
        registry
            .by_kind
            .entry(kind.to_owned())
            .or_default()
            .insert(target.clone());
        registry.sources.insert(target.clone(), entry);

        AttachOutcome::Begun(Self::handle(
            connection_id,
            handle_id,
            target,
            kind.to_owned(),
            rx,
        ))
    }

    /// Record the correlation id of the in-flight subscribe request so
    /// events echoing it route to the source before the remote
    /// subscription id is learned.
    pub(crate) fn record_request_id(&self, fingerprint: &RequestFingerprint, req_id: u64) {
        let mut state = self.state.lock();
        let registry = &mut *state;
        if registry.sources.contains_key(fingerprint) {
            registry.by_request_id.insert(req_id, fingerprint.clone());
        }
    }

    /// Activate a source with its confirmation response.
    pub(crate) fn activate(
        &self,
        fingerprint: &RequestFingerprint,
        confirmation: &InboundMessage,
    ) -> Activation {
        let mut state = self.state.lock();
        let registry = &mut *state;

        let subscription_id = confirmation.subscription_id().map(ToOwned::to_owned);

        let Some(entry) = registry.sources.get_mut(fingerprint) else {
            return Activation::Orphaned { subscription_id };
        };

        entry.status = SourceStatus::Active;
        entry.subscription_id = subscription_id.clone();
        entry.outcome_tx.send_replace(CreationOutcome::Ready);

        fan(entry, SourceUpdate::Event(confirmation.clone()));
        let buffered: Vec<InboundMessage> = entry.pending_events.drain(..).collect();
        for event in buffered {
            fan(entry, SourceUpdate::Event(event));
        }

        let kind = entry.kind.clone();
        let orphaned = entry.handles.is_empty();

        if orphaned {
            remove_source(registry, fingerprint);
            return Activation::Orphaned { subscription_id };
        }

        if subscription_id.is_none() {
            if let Some(entry) = registry.sources.get_mut(fingerprint) {
                fan(entry, SourceUpdate::Terminated(TerminationReason::Completed));
            }
            remove_source(registry, fingerprint);
            return Activation::Completed;
        }

        if let Some(id) = &subscription_id {
            registry
                .by_subscription_id
                .insert(id.clone(), fingerprint.clone());
        }

        // Buy-style confirmations carry a derived entity id that later
        // track-requests will name.
        if let Some(entity) = confirmation
            .field(&kind)
            .and_then(|body| body.get(ENTITY_ID_FIELD))
            .and_then(entity_string)
        {
            registry.by_entity.insert(entity, fingerprint.clone());
        }

        Activation::Streaming
    }

    /// Tear down a source whose creation failed; waiters observe the error.
    pub(crate) fn abort(&self, fingerprint: &RequestFingerprint, error: &ApiError) {
        let mut state = self.state.lock();
        let registry = &mut *state;
        if let Some(entry) = remove_source(registry, fingerprint) {
            entry
                .outcome_tx
                .send_replace(CreationOutcome::Failed(error.clone()));
            fan_owned(
                &entry,
                &SourceUpdate::Terminated(TerminationReason::Failed(error.clone())),
            );
        }
    }

    /// Detach one handle from its source.
    pub(crate) fn detach(&self, handle: &SubscriptionHandle) -> Detach {
        let mut state = self.state.lock();
        let registry = &mut *state;
        let Some(entry) = registry.sources.get_mut(&handle.fingerprint) else {
            return Detach::Gone;
        };
        entry.handles.remove(&handle.handle_id);
        if entry.handles.is_empty() {
            let removed = remove_source(registry, &handle.fingerprint);
            return Detach::LastHandle {
                subscription_id: removed.and_then(|entry| entry.subscription_id),
            };
        }
        Detach::Remaining
    }

    /// Terminate every source whose kind matches one of `kinds` (all
    /// sources when empty). Returns the distinct kinds removed, sorted.
    pub(crate) fn terminate_kinds(&self, kinds: &[&str]) -> Vec<String> {
        let mut state = self.state.lock();
        let registry = &mut *state;

        let targets: Vec<RequestFingerprint> = if kinds.is_empty() {
            registry.sources.keys().cloned().collect()
        } else {
            kinds
                .iter()
                .flat_map(|kind| {
                    registry
                        .by_kind
                        .get(*kind)
                        .into_iter()
                        .flatten()
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let mut removed_kinds = Vec::new();
        for fingerprint in targets {
            if let Some(entry) = remove_source(registry, &fingerprint) {
                if !removed_kinds.contains(&entry.kind) {
                    removed_kinds.push(entry.kind.clone());
                }
                entry
                    .outcome_tx
                    .send_replace(CreationOutcome::Failed(ApiError::Connection(
                        crate::error::ConnectionError::Abandoned,
                    )));
                fan_owned(&entry, &SourceUpdate::Terminated(TerminationReason::Forgotten));
            }
        }
        removed_kinds.sort();
        removed_kinds
    }

    /// Fail every source with a connection error; subscribers must
    /// re-subscribe after the connection recovers.
    pub(crate) fn fail_all(&self, error: &ApiError) {
        let mut state = self.state.lock();
        let registry = &mut *state;
        let sources = std::mem::take(&mut registry.sources);
        registry.by_subscription_id.clear();
        registry.by_request_id.clear();
        registry.by_kind.clear();
        registry.by_entity.clear();

        for entry in sources.into_values() {
            entry
                .outcome_tx
                .send_replace(CreationOutcome::Failed(error.clone()));
            fan_owned(
                &entry,
                &SourceUpdate::Terminated(TerminationReason::Failed(error.clone())),
            );
        }
    }

    /// Route an inbound streaming event to its source, by remote
    /// subscription id first, then by the originating correlation id.
    /// Returns the source fingerprint for cache updates.
    pub(crate) fn route_event(&self, message: &InboundMessage) -> Option<RequestFingerprint> {
        let mut state = self.state.lock();
        let registry = &mut *state;

        let fingerprint = message
            .subscription_id()
            .and_then(|id| registry.by_subscription_id.get(id))
            .or_else(|| {
                message
                    .req_id
                    .and_then(|id| registry.by_request_id.get(&id))
            })?
            .clone();

        let entry = registry.sources.get_mut(&fingerprint)?;
        if entry.status == SourceStatus::Creating {
            entry.pending_events.push(message.clone());
        } else {
            fan(entry, SourceUpdate::Event(message.clone()));
        }
        Some(fingerprint)
    }

    /// Number of live sources.
    pub(crate) fn source_count(&self) -> usize {
        self.state.lock().sources.len()
    }

    fn handle(
        connection_id: ConnectionId,
        handle_id: u64,
        fingerprint: RequestFingerprint,
        kind: String,
        rx: mpsc::UnboundedReceiver<SourceUpdate>,
    ) -> SubscriptionHandle {
        SubscriptionHandle {
            connection_id,
            handle_id,
            fingerprint,
            kind,
            rx,
            finished: false,
        }
    }
}

/// Deliver an update to every attached handle, pruning handles whose
/// receiver is gone.
fn fan(entry: &mut SourceEntry, update: SourceUpdate) {
    entry
        .handles
        .retain(|_, tx| tx.send(update.clone()).is_ok());
}

/// Deliver an update to the handles of an already-removed source.
fn fan_owned(entry: &SourceEntry, update: &SourceUpdate) {
    for tx in entry.handles.values() {
        let _ = tx.send(update.clone());
    }
}

/// Remove a source and scrub every index referring to it.
fn remove_source(registry: &mut Registry, fingerprint: &RequestFingerprint) -> Option<SourceEntry> {
    let entry = registry.sources.remove(fingerprint)?;
    if let Some(id) = &entry.subscription_id {
        registry.by_subscription_id.remove(id);
    }
    registry.by_request_id.retain(|_, fp| fp != fingerprint);
    registry.by_entity.retain(|_, fp| fp != fingerprint);
    if let Some(set) = registry.by_kind.get_mut(&entry.kind) {
        set.remove(fingerprint);
        if set.is_empty() {
            registry.by_kind.remove(&entry.kind);
        }
    }
    Some(entry)
}
