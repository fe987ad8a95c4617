//! Endpoint transport capability and the bulk transfer-request lifecycle.
//!
//! The transport is the hardware half of the stack: it programs endpoint
//! registers, moves bytes, and signals completion. This crate only sees it
//! through [`EndpointTransport`].
//!
//! A [`TransferRequest`] is owned by exactly one party at a time. `submit`
//! consumes it; the transport hands it back exactly once, either inside the
//! [`Completion`] delivered to the registered [`CompletionTarget`] or inside
//! the [`SubmitError`] of a submission that never queued. There is no handle
//! to double-release or to touch after completion.

use std::sync::Arc;

use thiserror::Error;

use crate::descriptor::EndpointDescriptor;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint is not enabled")]
    NotEnabled,
    #[error("controller rejected the operation: {0}")]
    Rejected(String),
}

/// Buffer allocation failure, surfaced immediately with no partial state.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("out of memory allocating a {requested}-byte transfer buffer")]
pub struct OutOfMemory {
    pub requested: usize,
}

/// A submission that was refused before being queued. The request rides along
/// so the buffer is released (or reused) by the caller, never leaked inside
/// the transport.
#[derive(Debug, Error)]
#[error("transfer submission failed: {kind}")]
pub struct SubmitError {
    pub request: TransferRequest,
    #[source]
    pub kind: TransportError,
}

/// Final status of a submitted transfer, delivered exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// The host sent exactly the requested length.
    Completed { actual: usize },
    /// The host sent less than requested. A normal terminal condition, not an
    /// error.
    ShortRead { actual: usize },
    /// Explicit cancel or endpoint reset.
    Aborted,
    /// The host went away.
    Disconnected,
    /// The host sent more than the buffer could hold; the excess is lost and
    /// must be reported, never silently folded into a short read.
    Overflowed,
}

/// An owned bulk-transfer buffer plus its requested length.
#[derive(Debug)]
pub struct TransferRequest {
    buf: Vec<u8>,
}

impl TransferRequest {
    pub fn allocate(length: usize) -> Result<Self, OutOfMemory> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(length)
            .map_err(|_| OutOfMemory { requested: length })?;
        buf.resize(length, 0);
        Ok(Self { buf })
    }

    pub fn requested_len(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Filled by the transport as data arrives.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Completion notification for one submitted request. Owning the request here
/// is what releases it: every status outcome runs the same drop path.
#[derive(Debug)]
pub struct Completion {
    pub request: TransferRequest,
    pub status: TransferStatus,
}

/// Invoked by the transport on its completion context, exactly once per
/// submitted request. Implementations must not block; they run on an
/// interrupt-like execution context.
pub trait CompletionTarget: Send + Sync {
    fn complete(&self, completion: Completion);
}

/// Capability exposed by the hardware transport layer.
pub trait EndpointTransport: Send + Sync {
    /// Human-readable controller name, used for the bind-time manufacturer
    /// string.
    fn controller_name(&self) -> &str;

    /// Controller revision tag mixed into `bcdDevice`, when the controller is
    /// recognized.
    fn controller_tag(&self) -> Option<u8>;

    /// Maximum packet size of the control endpoint.
    fn ep0_max_packet(&self) -> u8;

    /// Activates the data endpoint described by `endpoint`.
    fn enable(&self, endpoint: &EndpointDescriptor) -> Result<(), TransportError>;

    /// Deactivates the data endpoint. Blocks until any in-flight request has
    /// been quiesced: the transport delivers an `Aborted` completion for it
    /// before this returns.
    fn disable(&self);

    /// Queues `request` against the enabled data endpoint. On success the
    /// transport owns the request until it delivers the completion to
    /// `target`; on failure the request is handed straight back.
    fn submit(
        &self,
        request: TransferRequest,
        target: Arc<dyn CompletionTarget>,
    ) -> Result<(), SubmitError>;

    /// Queues a control-endpoint response. `zlp` asks for a zero-length
    /// packet after the payload to terminate a short transfer.
    fn submit_control(&self, data: &[u8], zlp: bool) -> Result<(), TransportError>;
}
