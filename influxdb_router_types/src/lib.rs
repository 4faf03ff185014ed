//! Types shared between the HTTP frontend and the forwarding stage of the router.
//!
//! The frontend produces [`Batch`]es onto an [`IncomingQueue`], the forwarding stage drains
//! them through a [`QueueConsumer`]. Requests are authenticated against a [`TenantRegistry`],
//! and startup is sequenced with [`readiness_handshake`].

mod batch;
pub mod queue;
pub mod readiness;
pub mod tenant;

pub use batch::Batch;
pub use queue::{
    EnqueueError, IncomingQueue, MAX_QUEUE_CAPACITY, QueueConsumer, incoming_queue,
};
pub use readiness::{ReadinessError, ReadySignal, ReadyWaiter, readiness_handshake};
pub use tenant::{Tenant, TenantError, TenantRegistry, mask};
