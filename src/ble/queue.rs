//! Transaction queue serializing link operations.
//!
//! The transport accepts one GATT request at a time and silently drops or
//! corrupts overlapping ones. The queue keeps a FIFO backlog and issues the
//! next operation only after the previous one has resolved by completion,
//! failure, or timeout.
//!
//! The queue is plain state owned by a single session loop. It never spawns
//! tasks; the loop feeds it completions and deadline expiries.

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::operation::{Operation, OperationKind, OperationOutcome};
use crate::ble::transport::{
    CompletionKind, GattStatus, LinkPlatform, OperationId, PeripheralHandle,
};
use crate::ble::uuids::CharacteristicRole;
use crate::config::RetryPolicy;
use crate::error::{Error, Result};

/// Counters describing what a queue has done during its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Requests handed to the platform, including retries.
    pub issued: u64,
    /// Operations resolved as success.
    pub succeeded: u64,
    /// Operations resolved as failure.
    pub failed: u64,
    /// Operations resolved as timed out.
    pub timed_out: u64,
    /// Timed-out attempts that were re-queued.
    pub retried: u64,
    /// Operations resolved as cancelled.
    pub cancelled: u64,
    /// Completions discarded because they did not match the in-flight request.
    pub discarded: u64,
}

/// A successfully completed operation, reported back to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completed {
    /// A read returned a value.
    Read {
        /// Characteristic role read.
        role: CharacteristicRole,
        /// Raw value.
        value: Bytes,
    },
    /// A write was acknowledged.
    Write {
        /// Characteristic role written.
        role: CharacteristicRole,
        /// Payload that was written.
        payload: Bytes,
    },
    /// Notifications were enabled.
    Subscribe {
        /// Characteristic role subscribed.
        role: CharacteristicRole,
    },
}

/// Completion signal as reported by the transport.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    /// Identity of the answered request.
    pub id: OperationId,
    /// Kind of the answered request.
    pub kind: CompletionKind,
    /// Characteristic the request targeted.
    pub characteristic: Uuid,
    /// Result status.
    pub status: GattStatus,
    /// Value read, empty otherwise.
    pub value: Bytes,
}

struct Entry {
    operation: Operation,
    attempt: u32,
}

struct InFlight {
    id: OperationId,
    entry: Entry,
    deadline: Instant,
}

/// FIFO queue allowing at most one operation in flight.
pub struct TransactionQueue {
    backlog: VecDeque<Entry>,
    in_flight: Option<InFlight>,
    next_id: u64,
    default_timeout: Duration,
    retry: RetryPolicy,
    closed: bool,
    stats: QueueStats,
}

impl TransactionQueue {
    /// Create an empty queue.
    pub fn new(default_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            backlog: VecDeque::new(),
            in_flight: None,
            next_id: 1,
            default_timeout,
            retry,
            closed: false,
            stats: QueueStats::default(),
        }
    }

    /// Start numbering requests at `first`.
    ///
    /// Sessions use disjoint ranges so a late completion from an earlier
    /// session can never match a request of the current one.
    pub fn starting_at(mut self, first: u64) -> Self {
        self.next_id = first;
        self
    }

    /// Append an operation to the backlog.
    ///
    /// A closed queue cancels the operation immediately.
    pub fn enqueue(&mut self, mut operation: Operation) {
        if self.closed {
            debug!(
                "Queue closed, cancelling {} on {}",
                operation.kind.label(),
                operation.role
            );
            operation.resolve(OperationOutcome::Cancelled);
            self.stats.cancelled += 1;
            return;
        }

        trace!(
            "Enqueued {} on {} (backlog {})",
            operation.kind.label(),
            operation.role,
            self.backlog.len() + 1
        );
        self.backlog.push_back(Entry {
            operation,
            attempt: 0,
        });
    }

    /// Issue the next backlog entry if nothing is in flight.
    ///
    /// Entries the platform refuses outright resolve as failures and the next
    /// entry is tried.
    pub async fn pump<P>(&mut self, platform: &P, peripheral: &PeripheralHandle)
    where
        P: LinkPlatform + ?Sized,
    {
        while self.in_flight.is_none() {
            let Some(entry) = self.backlog.pop_front() else {
                return;
            };

            let id = OperationId(self.next_id);
            self.next_id += 1;
            self.stats.issued += 1;

            let operation = &entry.operation;
            debug!(
                "Issuing {} {} on {} (attempt {})",
                id,
                operation.kind.label(),
                operation.role,
                entry.attempt + 1
            );

            match Self::issue(platform, peripheral, operation, id).await {
                Ok(()) => {
                    let timeout = operation.timeout.unwrap_or(self.default_timeout);
                    self.in_flight = Some(InFlight {
                        id,
                        entry,
                        deadline: Instant::now() + timeout,
                    });
                }
                Err(e) => {
                    warn!(
                        "Platform rejected {} on {}: {}",
                        entry.operation.kind.label(),
                        entry.operation.role,
                        e
                    );
                    self.finish(entry, OperationOutcome::Failure(e));
                }
            }
        }
    }

    async fn issue<P>(
        platform: &P,
        peripheral: &PeripheralHandle,
        operation: &Operation,
        id: OperationId,
    ) -> Result<()>
    where
        P: LinkPlatform + ?Sized,
    {
        let characteristic = operation.role.uuid();
        match &operation.kind {
            OperationKind::Read => {
                platform
                    .read_characteristic(peripheral, characteristic, id)
                    .await
            }
            OperationKind::Write(payload) => {
                platform
                    .write_characteristic(peripheral, characteristic, payload.clone(), id)
                    .await
            }
            OperationKind::SubscribeNotify => {
                platform
                    .enable_notifications(peripheral, characteristic, id)
                    .await
            }
        }
    }

    /// Match a transport completion against the in-flight operation.
    ///
    /// Completions that do not match the in-flight request's identity are
    /// logged and discarded. Returns the completed operation on success.
    pub fn on_completion(&mut self, signal: CompletionSignal) -> Option<Completed> {
        let matches = self.in_flight.as_ref().is_some_and(|flight| {
            flight.id == signal.id
                && flight.entry.operation.kind.completion_kind() == signal.kind
                && flight.entry.operation.role.uuid() == signal.characteristic
        });

        if !matches {
            warn!(
                "Discarding unsolicited {:?} completion {} for {} (in flight: {:?})",
                signal.kind,
                signal.id,
                signal.characteristic,
                self.in_flight.as_ref().map(|f| f.id)
            );
            self.stats.discarded += 1;
            return None;
        }

        let flight = self.in_flight.take()?;
        let entry = flight.entry;
        let role = entry.operation.role;

        if !signal.status.is_success() {
            debug!(
                "{} {} on {} failed with status {:#04x}",
                flight.id,
                entry.operation.kind.label(),
                role,
                signal.status.0
            );
            self.finish(
                entry,
                OperationOutcome::Failure(Error::OperationFailed {
                    status: signal.status.0,
                }),
            );
            return None;
        }

        let completed = match &entry.operation.kind {
            OperationKind::Read => Completed::Read {
                role,
                value: signal.value.clone(),
            },
            OperationKind::Write(payload) => Completed::Write {
                role,
                payload: payload.clone(),
            },
            OperationKind::SubscribeNotify => Completed::Subscribe { role },
        };

        let value = matches!(completed, Completed::Read { .. }).then_some(signal.value);
        self.finish(entry, OperationOutcome::Success(value));

        Some(completed)
    }

    /// Deadline of the in-flight operation, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|flight| flight.deadline)
    }

    /// Resolve the in-flight operation if its deadline has passed.
    ///
    /// Reads and subscribes are re-queued at the front while retries remain;
    /// writes are surfaced as timed out unless the policy allows retrying them.
    pub fn expire(&mut self, now: Instant) {
        let expired = self
            .in_flight
            .as_ref()
            .is_some_and(|flight| flight.deadline <= now);
        if !expired {
            return;
        }

        let Some(flight) = self.in_flight.take() else {
            return;
        };
        let mut entry = flight.entry;

        if self.may_retry(&entry) {
            warn!(
                "{} {} on {} timed out, retrying",
                flight.id,
                entry.operation.kind.label(),
                entry.operation.role
            );
            entry.attempt += 1;
            self.stats.retried += 1;
            self.backlog.push_front(entry);
        } else {
            warn!(
                "{} {} on {} timed out",
                flight.id,
                entry.operation.kind.label(),
                entry.operation.role
            );
            self.finish(entry, OperationOutcome::TimedOut);
        }
    }

    fn may_retry(&self, entry: &Entry) -> bool {
        let retryable = match entry.operation.kind {
            OperationKind::Read | OperationKind::SubscribeNotify => true,
            OperationKind::Write(_) => self.retry.retry_writes,
        };
        retryable && entry.attempt < self.retry.max_retries
    }

    /// Cancel the in-flight operation and the whole backlog, and close the queue.
    ///
    /// Returns how many operations were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        self.closed = true;

        let mut cancelled = 0;
        if let Some(flight) = self.in_flight.take() {
            self.finish(flight.entry, OperationOutcome::Cancelled);
            cancelled += 1;
        }
        while let Some(entry) = self.backlog.pop_front() {
            self.finish(entry, OperationOutcome::Cancelled);
            cancelled += 1;
        }

        if cancelled > 0 {
            debug!("Cancelled {} pending operations", cancelled);
        }
        cancelled
    }

    fn finish(&mut self, mut entry: Entry, outcome: OperationOutcome) {
        match &outcome {
            OperationOutcome::Success(_) => self.stats.succeeded += 1,
            OperationOutcome::Failure(_) => self.stats.failed += 1,
            OperationOutcome::TimedOut => self.stats.timed_out += 1,
            OperationOutcome::Cancelled => self.stats.cancelled += 1,
        }
        trace!(
            "{} on {} resolved: {}",
            entry.operation.kind.label(),
            entry.operation.role,
            outcome.label()
        );
        entry.operation.resolve(outcome);
    }

    /// Number of operations in flight (zero or one).
    pub fn in_flight_count(&self) -> usize {
        usize::from(self.in_flight.is_some())
    }

    /// Number of unresolved operations, including the one in flight.
    pub fn len(&self) -> usize {
        self.backlog.len() + self.in_flight_count()
    }

    /// Check if there is nothing pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been closed by [`TransactionQueue::cancel_all`].
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Counters for this queue.
    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}
