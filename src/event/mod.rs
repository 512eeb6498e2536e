//! Event pipeline: result handles, the send queue, ack tracking and the
//! chunk-send retry policy.

pub mod ack;
pub mod handle;
pub mod queue;
pub mod retry;

pub use ack::AckTracker;
pub use handle::{settlement, EmitHandle, Settlement};
pub use queue::{FlushHint, PoppedChunk, PushOutcome, QueueLimits, SendQueue, SizeLimit};
pub use retry::{ErrorHook, RetryDecision, RetryOptions};
