//! The transport seam: per-call operation batches and their callbacks.
//!
//! The channel core never touches wire framing; it expresses work on a call
//! as [`StreamOpBatch`] values handed to a [`TransportCall`]. The transport
//! may complete ops in any order relative to other batches, but each callback
//! fires exactly once, and a successfully completed `recv_trailing_metadata`
//! always carries a `grpc-status` entry.

use std::time::Instant;

use bytes::Bytes;

use crate::bytestream::ByteStream;
use crate::error::{ChannelError, Result};
use crate::metadata::Metadata;

/// Initial-metadata flag: the call wants to wait for a READY subchannel
/// rather than fail on transient failure.
pub const WAIT_FOR_READY: u32 = 1 << 3;
/// Initial-metadata flag: the wait-for-ready bit was set explicitly by the
/// caller and must not be overridden by the service config.
pub const WAIT_FOR_READY_EXPLICITLY_SET: u32 = 1 << 4;

/// Number of slots in a call's pending-batches array: one per batch kind,
/// plus one for `cancel_stream`.
pub const MAX_PENDING_BATCHES: usize = 7;

/// Send-side initial metadata with its flags.
#[derive(Debug, Clone, Default)]
pub struct SendInitialMetadata {
    /// The metadata to send.
    pub metadata: Metadata,
    /// `WAIT_FOR_READY*` flag bits.
    pub flags: u32,
}

/// Initial metadata delivered by the transport.
#[derive(Debug, Clone, Default)]
pub struct RecvInitialMetadata {
    /// The received metadata.
    pub metadata: Metadata,
    /// True when the response is Trailers-Only: headers and trailers arrive
    /// together with a non-OK status and no message.
    pub trailers_only: bool,
}

/// Callback for an intercepted or surface `recv_initial_metadata` op.
pub type RecvInitialMetadataReady =
    Box<dyn FnOnce(Result<RecvInitialMetadata>) + Send + 'static>;

/// Callback for a `recv_message` op; `None` means end of stream.
pub type RecvMessageReady = Box<dyn FnOnce(Result<Option<Bytes>>) + Send + 'static>;

/// Terminal result of a batch.
#[derive(Debug, Default)]
pub struct BatchResult {
    /// The batch-level error, if the batch failed.
    pub error: Option<ChannelError>,
    /// Trailing metadata, present iff the batch included
    /// `recv_trailing_metadata` and completed successfully.
    pub trailing_metadata: Option<Metadata>,
}

impl BatchResult {
    /// A successful result with no trailing metadata.
    pub fn ok() -> BatchResult {
        BatchResult::default()
    }

    /// A failed result.
    pub fn failed(error: ChannelError) -> BatchResult {
        BatchResult {
            error: Some(error),
            trailing_metadata: None,
        }
    }
}

/// Callback invoked once when every op in the batch has completed.
pub type OnComplete = Box<dyn FnOnce(BatchResult) + Send + 'static>;

/// A set of per-call operations submitted together.
///
/// Each directional op is present at most once. The surface and the retry
/// orchestrator both speak this type; the orchestrator intercepts the recv
/// callbacks and `on_complete` when retries are live.
#[derive(Default)]
pub struct StreamOpBatch {
    /// Send initial metadata.
    pub send_initial_metadata: Option<SendInitialMetadata>,
    /// Send one message.
    pub send_message: Option<Box<dyn ByteStream>>,
    /// Send trailing metadata, half-closing the send side.
    pub send_trailing_metadata: Option<Metadata>,
    /// Receive initial metadata.
    pub recv_initial_metadata: Option<RecvInitialMetadataReady>,
    /// Receive one message.
    pub recv_message: Option<RecvMessageReady>,
    /// Receive trailing metadata; the result arrives via `on_complete`.
    pub recv_trailing_metadata: bool,
    /// Cancel the stream with the given error.
    pub cancel_stream: Option<ChannelError>,
    /// Completion callback for the batch as a whole.
    pub on_complete: Option<OnComplete>,
}

impl StreamOpBatch {
    /// The pending-batches slot this batch occupies, keyed by its first op in
    /// the fixed op order.
    pub fn slot(&self) -> usize {
        if self.send_initial_metadata.is_some() {
            0
        } else if self.send_message.is_some() {
            1
        } else if self.send_trailing_metadata.is_some() {
            2
        } else if self.recv_initial_metadata.is_some() {
            3
        } else if self.recv_message.is_some() {
            4
        } else if self.recv_trailing_metadata {
            5
        } else {
            debug_assert!(self.cancel_stream.is_some());
            6
        }
    }

    /// Whether the batch carries no ops at all.
    pub fn is_empty(&self) -> bool {
        self.send_initial_metadata.is_none()
            && self.send_message.is_none()
            && self.send_trailing_metadata.is_none()
            && self.recv_initial_metadata.is_none()
            && self.recv_message.is_none()
            && !self.recv_trailing_metadata
            && self.cancel_stream.is_none()
    }

    /// Fails the batch: fires each per-op recv callback and `on_complete`
    /// exactly once with `error`.
    pub fn finish_with_failure(mut self, error: ChannelError) {
        if let Some(ready) = self.recv_initial_metadata.take() {
            ready(Err(error.clone()));
        }
        if let Some(ready) = self.recv_message.take() {
            ready(Err(error.clone()));
        }
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(BatchResult::failed(error));
        }
    }
}

impl std::fmt::Debug for StreamOpBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOpBatch")
            .field("send_initial_metadata", &self.send_initial_metadata.is_some())
            .field("send_message", &self.send_message.is_some())
            .field(
                "send_trailing_metadata",
                &self.send_trailing_metadata.is_some(),
            )
            .field("recv_initial_metadata", &self.recv_initial_metadata.is_some())
            .field("recv_message", &self.recv_message.is_some())
            .field("recv_trailing_metadata", &self.recv_trailing_metadata)
            .field("cancel_stream", &self.cancel_stream.is_some())
            .finish()
    }
}

/// Arguments for creating a transport-level call.
#[derive(Debug, Clone)]
pub struct TransportCallArgs {
    /// Full request path, `/Service/Method`.
    pub path: String,
    /// Call start time.
    pub start_time: Instant,
    /// Absolute deadline, if any.
    pub deadline: Option<Instant>,
}

/// One live call on a transport connection.
pub trait TransportCall: Send + Sync {
    /// Submits a batch of ops. Callbacks may fire before this returns.
    fn start_batch(&self, batch: StreamOpBatch);
}

/// A live connection to one backend, able to create calls.
pub trait Transport: Send + Sync {
    /// Creates a call on this connection.
    fn create_call(&self, args: &TransportCallArgs) -> Result<Box<dyn TransportCall>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_slot_assignment_follows_op_order() {
        let mut batch = StreamOpBatch::default();
        batch.recv_trailing_metadata = true;
        assert_eq!(batch.slot(), 5);
        batch.recv_message = Some(Box::new(|_| {}));
        assert_eq!(batch.slot(), 4);
        batch.recv_initial_metadata = Some(Box::new(|_| {}));
        assert_eq!(batch.slot(), 3);
        batch.send_trailing_metadata = Some(Metadata::new());
        assert_eq!(batch.slot(), 2);
        batch.send_initial_metadata = Some(SendInitialMetadata::default());
        assert_eq!(batch.slot(), 0);

        let cancel = StreamOpBatch {
            cancel_stream: Some(ChannelError::Cancelled("x".into())),
            ..Default::default()
        };
        assert_eq!(cancel.slot(), 6);
    }

    #[test]
    fn test_finish_with_failure_fires_each_callback_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f1 = Arc::clone(&fired);
        let f2 = Arc::clone(&fired);
        let f3 = Arc::clone(&fired);
        let batch = StreamOpBatch {
            recv_initial_metadata: Some(Box::new(move |result| {
                assert!(result.is_err());
                f1.fetch_add(1, Ordering::SeqCst);
            })),
            recv_message: Some(Box::new(move |result| {
                assert!(result.is_err());
                f2.fetch_add(1, Ordering::SeqCst);
            })),
            recv_trailing_metadata: true,
            on_complete: Some(Box::new(move |result| {
                assert!(result.error.is_some());
                f3.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        batch.finish_with_failure(ChannelError::Unavailable("gone".into()));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
