//! Single-shot result handle for emitted events.
//!
//! Every `emit` returns an [`EmitHandle`]; the matching [`Settlement`] is
//! carried through the queue and the ack tracker and is settled exactly
//! once. Consuming `self` on settlement makes double-settlement
//! unrepresentable.

use tokio::sync::oneshot;

use crate::core::error::{DropReason, EmitError};

/// Create a settlement and the handle observing it.
pub fn settlement() -> (Settlement, EmitHandle) {
    let (tx, rx) = oneshot::channel();
    (Settlement { tx }, EmitHandle { rx })
}

/// The write side of an emit result; settled exactly once.
#[derive(Debug)]
pub struct Settlement {
    tx: oneshot::Sender<Result<(), EmitError>>,
}

impl Settlement {
    /// Settle with the given result.
    ///
    /// The outcome is ignored if the caller dropped its handle.
    pub fn settle(self, result: Result<(), EmitError>) {
        let _ = self.tx.send(result);
    }

    /// Settle as delivered.
    pub fn deliver(self) {
        self.settle(Ok(()));
    }

    /// Settle as failed.
    pub fn reject(self, error: EmitError) {
        self.settle(Err(error));
    }
}

/// The caller-facing side of an emit result.
#[derive(Debug)]
pub struct EmitHandle {
    rx: oneshot::Receiver<Result<(), EmitError>>,
}

impl EmitHandle {
    /// Wait for the event's final outcome.
    ///
    /// A settlement lost to client teardown reports the event as dropped
    /// by shutdown.
    pub async fn wait(self) -> Result<(), EmitError> {
        self.rx
            .await
            .unwrap_or(Err(EmitError::Dropped(DropReason::Shutdown)))
    }

    /// Non-blocking check for an already-settled result.
    pub fn try_result(&mut self) -> Option<Result<(), EmitError>> {
        self.rx.try_recv().ok()
    }
}
