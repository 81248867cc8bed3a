//! ---
//! ct_section: "02-messaging-ipc-data-model"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Message envelopes, exchanges and request dispatch."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! Caller-side handles for pending requests.
//!
//! An [`Exchange`] is created by [`crate::Dispatcher::send`] and completes exactly
//! once. Two actors race to complete it: the receive path delivering the correlated
//! response, and the timeout path (the waiter's deadline, the background reaper or
//! the receive-time sweep). The transition happens under the exchange's state lock,
//! so only the first writer wins and every later attempt is a no-op.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::debug;

use crate::codec::decode_payload;
use crate::types::{is_sentinel, Message, MessageId};

/// Details recorded on exchanges that expired before a response arrived.
pub const TIMEOUT_DETAILS: &str = "Timeout";

/// Completion callback invoked with the final outcome.
pub type ExchangeCallback<T> = Box<dyn FnOnce(&ExchangeOutcome<T>) + Send>;

/// Immutable record of how an exchange completed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOutcome<T> {
    /// Id of the request this exchange tracked.
    pub correlation_id: MessageId,
    /// When the request was sent.
    pub requested: DateTime<Utc>,
    /// When the exchange completed.
    pub completed: DateTime<Utc>,
    /// Whether the remote side reported success and the payload decoded.
    pub success: bool,
    /// Whether the exchange expired without a response.
    pub timed_out: bool,
    /// Outcome details from the responder, the decoder or the timeout path.
    pub details: Option<String>,
    /// Decoded response payload, if any was sent.
    pub data: Option<T>,
}

struct Callbacks<T> {
    completed: Vec<ExchangeCallback<T>>,
    succeeded: Vec<ExchangeCallback<T>>,
    failed: Vec<ExchangeCallback<T>>,
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

struct CellState<T> {
    outcome: Option<Arc<ExchangeOutcome<T>>>,
    callbacks: Callbacks<T>,
}

/// Shared completion slot behind an [`Exchange`] handle and the pending table.
pub(crate) struct ExchangeCell<T> {
    correlation_id: MessageId,
    requested: DateTime<Utc>,
    timeout: Duration,
    deadline: tokio::time::Instant,
    state: Mutex<CellState<T>>,
    done: watch::Sender<bool>,
}

impl<T> ExchangeCell<T> {
    pub(crate) fn new(correlation_id: MessageId, requested: DateTime<Utc>, timeout: Duration) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            correlation_id,
            requested,
            timeout,
            deadline: tokio::time::Instant::now() + timeout,
            state: Mutex::new(CellState {
                outcome: None,
                callbacks: Callbacks::default(),
            }),
            done,
        }
    }

    fn outcome(&self) -> Option<Arc<ExchangeOutcome<T>>> {
        self.state.lock().outcome.clone()
    }

    /// Complete the exchange unless another actor already did.
    ///
    /// Returns the stored outcome and whether this call performed the transition.
    fn complete_once(
        &self,
        build: impl FnOnce() -> ExchangeOutcome<T>,
    ) -> (Arc<ExchangeOutcome<T>>, bool) {
        let (outcome, callbacks) = {
            let mut state = self.state.lock();
            if let Some(existing) = &state.outcome {
                return (existing.clone(), false);
            }
            let outcome = Arc::new(build());
            state.outcome = Some(outcome.clone());
            (outcome, std::mem::take(&mut state.callbacks))
        };

        for callback in callbacks.completed {
            callback(&outcome);
        }
        let branch = if outcome.success {
            callbacks.succeeded
        } else {
            callbacks.failed
        };
        for callback in branch {
            callback(&outcome);
        }

        self.done.send_replace(true);
        (outcome, true)
    }

    fn expire(&self, now: DateTime<Utc>) -> (Arc<ExchangeOutcome<T>>, bool) {
        self.complete_once(|| ExchangeOutcome {
            correlation_id: self.correlation_id,
            requested: self.requested,
            completed: now,
            success: false,
            timed_out: true,
            details: Some(TIMEOUT_DETAILS.to_owned()),
            data: None,
        })
    }
}

/// Type-erased view used by the dispatcher's pending table.
pub(crate) trait PendingExchange: Send + Sync {
    /// Whether the exchange has outlived its timeout at `now`.
    fn is_expired(&self, now: DateTime<Utc>) -> bool;
    /// Complete from a correlated response. Returns false when already complete.
    fn complete_from(&self, message: &Message, now: DateTime<Utc>) -> bool;
    /// Complete as timed out. Returns false when already complete.
    fn expire_at(&self, now: DateTime<Utc>) -> bool;
    /// Age of the exchange at completion, for latency metrics.
    fn requested(&self) -> DateTime<Utc>;
}

impl<T> PendingExchange for ExchangeCell<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (now - self.requested).to_std() {
            Ok(age) => age > self.timeout,
            Err(_) => false,
        }
    }

    fn complete_from(&self, message: &Message, now: DateTime<Utc>) -> bool {
        let (_, won) = self.complete_once(|| {
            let mut success = message.success;
            let mut details = message.details.clone();
            let data = if is_sentinel::<T>() {
                decode_payload::<T>(None).ok()
            } else {
                match message.payload.as_deref() {
                    None | Some("null") => None,
                    Some(raw) => match decode_payload::<T>(Some(raw)) {
                        Ok(value) => Some(value),
                        Err(err) => {
                            debug!(
                                correlation_id = self.correlation_id,
                                error = %err,
                                "response payload did not match the expected type"
                            );
                            success = false;
                            details = Some(format!(
                                "Failed to deserialize incoming response data. Expected to receive a {}, \
                                 but received an object that could not be deserialized into this type ({}).",
                                type_name::<T>(),
                                err
                            ));
                            None
                        }
                    },
                }
            };
            ExchangeOutcome {
                correlation_id: self.correlation_id,
                requested: self.requested,
                completed: now,
                success,
                timed_out: false,
                details,
                data,
            }
        });
        won
    }

    fn expire_at(&self, now: DateTime<Utc>) -> bool {
        self.expire(now).1
    }

    fn requested(&self) -> DateTime<Utc> {
        self.requested
    }
}

/// Pending exchanges keyed by the id of the request they track.
pub(crate) type PendingTable = Mutex<HashMap<MessageId, Arc<dyn PendingExchange>>>;

/// Caller-side handle for a request in flight.
pub struct Exchange<T> {
    cell: Arc<ExchangeCell<T>>,
    pending: Weak<PendingTable>,
}

impl<T> Exchange<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(cell: Arc<ExchangeCell<T>>, pending: Weak<PendingTable>) -> Self {
        Self { cell, pending }
    }

    /// Id of the request this exchange tracks.
    pub fn correlation_id(&self) -> MessageId {
        self.cell.correlation_id
    }

    /// When the request was sent.
    pub fn requested(&self) -> DateTime<Utc> {
        self.cell.requested
    }

    /// Configured time to wait for a response.
    pub fn timeout(&self) -> Duration {
        self.cell.timeout
    }

    /// Whether the exchange has completed (by response or timeout).
    pub fn is_complete(&self) -> bool {
        self.cell.state.lock().outcome.is_some()
    }

    /// Outcome if already complete; never blocks.
    pub fn outcome(&self) -> Option<Arc<ExchangeOutcome<T>>> {
        self.cell.outcome()
    }

    /// Run `callback` once the exchange completes, whatever the result.
    pub fn on_completed(&self, callback: impl FnOnce(&ExchangeOutcome<T>) + Send + 'static) -> &Self {
        self.attach(Slot::Completed, Box::new(callback));
        self
    }

    /// Run `callback` once the exchange completes successfully.
    pub fn on_succeeded(&self, callback: impl FnOnce(&ExchangeOutcome<T>) + Send + 'static) -> &Self {
        self.attach(Slot::Succeeded, Box::new(callback));
        self
    }

    /// Run `callback` once the exchange completes unsuccessfully (including timeouts).
    pub fn on_failed(&self, callback: impl FnOnce(&ExchangeOutcome<T>) + Send + 'static) -> &Self {
        self.attach(Slot::Failed, Box::new(callback));
        self
    }

    fn attach(&self, slot: Slot, callback: ExchangeCallback<T>) {
        let ready = {
            let mut state = self.cell.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    let callbacks = &mut state.callbacks;
                    match slot {
                        Slot::Completed => callbacks.completed.push(callback),
                        Slot::Succeeded => callbacks.succeeded.push(callback),
                        Slot::Failed => callbacks.failed.push(callback),
                    }
                    return;
                }
            }
        };
        let applies = match slot {
            Slot::Completed => true,
            Slot::Succeeded => ready.success,
            Slot::Failed => !ready.success,
        };
        if applies {
            callback(&ready);
        }
    }

    /// Suspend until the exchange completes or its deadline passes.
    ///
    /// When the deadline passes first, the waiter performs the timeout transition
    /// itself and removes the exchange from the pending table.
    pub async fn wait(&self) -> Arc<ExchangeOutcome<T>> {
        let mut done = self.cell.done.subscribe();
        let finished = tokio::time::timeout_at(self.cell.deadline, done.wait_for(|done| *done))
            .await
            .map(|signalled| signalled.is_ok())
            .unwrap_or(false);
        if finished {
            if let Some(outcome) = self.cell.outcome() {
                return outcome;
            }
        }

        let (outcome, won) = self.cell.expire(Utc::now());
        if won {
            debug!(correlation_id = self.cell.correlation_id, "exchange timed out while awaited");
        }
        if let Some(pending) = self.pending.upgrade() {
            pending.lock().remove(&self.cell.correlation_id);
        }
        outcome
    }
}

enum Slot {
    Completed,
    Succeeded,
    Failed,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::types::Empty;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Point {
        x: i32,
    }

    fn standalone<T: DeserializeOwned + Send + Sync + 'static>(
        id: MessageId,
        timeout: Duration,
    ) -> (Arc<ExchangeCell<T>>, Exchange<T>) {
        let cell = Arc::new(ExchangeCell::new(id, Utc::now(), timeout));
        let exchange = Exchange::new(cell.clone(), Weak::new());
        (cell, exchange)
    }

    #[test]
    fn first_completion_wins() {
        let (cell, exchange) = standalone::<Point>(41, Duration::from_secs(5));
        let response = Message::response(41, 2, true, None, Some("{\"x\":10}".into()));

        assert!(cell.complete_from(&response, Utc::now()));
        assert!(!cell.expire_at(Utc::now()));

        let outcome = exchange.outcome().expect("complete");
        assert!(outcome.success);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.data, Some(Point { x: 10 }));
    }

    #[test]
    fn timeout_then_late_response_is_ignored() {
        let (cell, exchange) = standalone::<Point>(42, Duration::from_millis(1));
        assert!(cell.expire_at(Utc::now()));
        let late = Message::response(42, 2, true, None, Some("{\"x\":1}".into()));
        assert!(!cell.complete_from(&late, Utc::now()));

        let outcome = exchange.outcome().expect("complete");
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert_eq!(outcome.details.as_deref(), Some(TIMEOUT_DETAILS));
    }

    #[test]
    fn undecodable_payload_forces_failure() {
        let (cell, exchange) = standalone::<Point>(43, Duration::from_secs(5));
        let response = Message::response(43, 2, true, None, Some("\"nope\"".into()));
        assert!(cell.complete_from(&response, Utc::now()));

        let outcome = exchange.outcome().expect("complete");
        assert!(!outcome.success);
        assert!(outcome
            .details
            .as_deref()
            .unwrap_or_default()
            .contains("Failed to deserialize"));
    }

    #[test]
    fn empty_exchanges_ignore_payloads() {
        let (cell, exchange) = standalone::<Empty>(44, Duration::from_secs(5));
        let response = Message::response(44, 2, true, None, Some("{\"extra\":true}".into()));
        cell.complete_from(&response, Utc::now());
        let outcome = exchange.outcome().expect("complete");
        assert!(outcome.success);
        assert_eq!(outcome.data, Some(Empty));
    }

    #[test]
    fn callbacks_fire_in_order_and_late_callbacks_run_immediately() {
        let (cell, exchange) = standalone::<Point>(45, Duration::from_secs(5));
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        exchange.on_failed(move |_| l.lock().push("failed"));
        let l = log.clone();
        exchange.on_succeeded(move |_| l.lock().push("succeeded"));
        let l = log.clone();
        exchange.on_completed(move |_| l.lock().push("completed"));

        cell.complete_from(&Message::response(45, 2, true, None, None), Utc::now());
        assert_eq!(*log.lock(), vec!["completed", "succeeded"]);

        let late = Arc::new(AtomicUsize::new(0));
        let counter = late.clone();
        exchange.on_completed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = late.clone();
        exchange.on_failed(move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_times_out_without_traffic() {
        let (_cell, exchange) = standalone::<Point>(46, Duration::from_millis(20));
        let outcome = exchange.wait().await;
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert!(exchange.is_complete());
    }

    #[tokio::test]
    async fn wait_resumes_on_completion() {
        let (cell, exchange) = standalone::<Point>(47, Duration::from_secs(5));
        let completer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cell.complete_from(
                &Message::response(47, 2, true, None, Some("{\"x\":3}".into())),
                Utc::now(),
            );
        });
        let outcome = exchange.wait().await;
        completer.await.expect("completer task");
        assert!(outcome.success);
        assert_eq!(outcome.data, Some(Point { x: 3 }));
    }
}
