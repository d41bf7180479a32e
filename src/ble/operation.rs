//! Link operations and their outcomes.
//!
//! An [`Operation`] is one unit of link work submitted to the
//! [`TransactionQueue`](crate::ble::queue::TransactionQueue). Its outcome is
//! delivered exactly once through the paired [`OperationTicket`].

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::ble::transport::CompletionKind;
use crate::ble::uuids::CharacteristicRole;
use crate::error::{Error, Result};
use crate::protocol::HeaterState;

/// The work an operation performs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OperationKind {
    /// Read the characteristic value.
    Read,
    /// Write the payload with response.
    Write(Bytes),
    /// Enable notifications for the characteristic.
    SubscribeNotify,
}

impl OperationKind {
    /// The completion kind the transport reports for this operation.
    pub fn completion_kind(&self) -> CompletionKind {
        match self {
            Self::Read => CompletionKind::Read,
            Self::Write(_) => CompletionKind::Write,
            Self::SubscribeNotify => CompletionKind::Subscribe,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write(_) => "write",
            Self::SubscribeNotify => "subscribe",
        }
    }
}

/// Declarative description of an operation, used for the setup sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OperationSpec {
    /// What to do.
    pub kind: OperationKind,
    /// Which characteristic to do it on.
    pub role: CharacteristicRole,
    /// Override of the queue's default timeout.
    pub timeout: Option<Duration>,
}

impl OperationSpec {
    /// Read a characteristic.
    pub fn read(role: CharacteristicRole) -> Self {
        Self {
            kind: OperationKind::Read,
            role,
            timeout: None,
        }
    }

    /// Write a raw payload to a characteristic.
    pub fn write(role: CharacteristicRole, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: OperationKind::Write(payload.into()),
            role,
            timeout: None,
        }
    }

    /// Write a heater state to the heater characteristic.
    pub fn heater(state: HeaterState) -> Self {
        Self::write(
            CharacteristicRole::HeaterWrite,
            Bytes::copy_from_slice(&state.encode()),
        )
    }

    /// Enable notifications on a characteristic.
    pub fn subscribe(role: CharacteristicRole) -> Self {
        Self {
            kind: OperationKind::SubscribeNotify,
            role,
            timeout: None,
        }
    }

    /// Set a per-operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Turn the description into a live operation and the ticket for its outcome.
    pub fn into_operation(self) -> (Operation, OperationTicket) {
        Operation::new(self)
    }
}

/// The setup sequence run after every successful service discovery.
///
/// Heater control goes to the heater characteristic only.
pub fn default_setup_sequence() -> Vec<OperationSpec> {
    vec![
        OperationSpec::read(CharacteristicRole::HumidityReadNotify),
        OperationSpec::read(CharacteristicRole::TemperatureReadNotify),
        OperationSpec::heater(HeaterState::Off),
        OperationSpec::subscribe(CharacteristicRole::HumidityReadNotify),
        OperationSpec::subscribe(CharacteristicRole::TemperatureReadNotify),
    ]
}

/// Final result of an operation.
#[derive(Debug)]
pub enum OperationOutcome {
    /// Completed; carries the value for reads, `None` otherwise.
    Success(Option<Bytes>),
    /// The transport rejected or failed the request.
    Failure(Error),
    /// No completion arrived within the timeout (after any retry).
    TimedOut,
    /// The session ended before the operation completed.
    Cancelled,
}

impl OperationOutcome {
    /// Check for success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Convert into a `Result`, mapping timeouts and cancellation to errors.
    pub fn into_result(self) -> Result<Option<Bytes>> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(err) => Err(err),
            Self::TimedOut => Err(Error::TimedOut),
            Self::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::TimedOut => "timed out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A live operation owned by the transaction queue until it resolves.
#[derive(Debug)]
pub struct Operation {
    /// What to do.
    pub kind: OperationKind,
    /// Which characteristic to do it on.
    pub role: CharacteristicRole,
    /// Per-operation timeout override.
    pub timeout: Option<Duration>,
    /// When the operation was created.
    pub issued_at: Instant,
    completion: Option<oneshot::Sender<OperationOutcome>>,
}

impl Operation {
    /// Create an operation and the ticket that will receive its outcome.
    pub fn new(spec: OperationSpec) -> (Self, OperationTicket) {
        let (tx, rx) = oneshot::channel();
        let operation = Self {
            kind: spec.kind,
            role: spec.role,
            timeout: spec.timeout,
            issued_at: Instant::now(),
            completion: Some(tx),
        };
        (operation, OperationTicket { rx })
    }

    /// Deliver the outcome. Later calls are ignored.
    pub(crate) fn resolve(&mut self, outcome: OperationOutcome) {
        if let Some(tx) = self.completion.take() {
            // The caller may have dropped the ticket; the outcome is still delivered once.
            let _ = tx.send(outcome);
        }
    }

    /// Whether the outcome has been delivered.
    pub fn is_resolved(&self) -> bool {
        self.completion.is_none()
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.resolve(OperationOutcome::Cancelled);
    }
}

/// Future resolving to an operation's outcome.
///
/// If the operation is dropped without resolving (for example because the
/// session ended before it was enqueued) the ticket resolves to
/// [`OperationOutcome::Cancelled`].
#[derive(Debug)]
pub struct OperationTicket {
    rx: oneshot::Receiver<OperationOutcome>,
}

impl Future for OperationTicket {
    type Output = OperationOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(OperationOutcome::Cancelled))
    }
}
