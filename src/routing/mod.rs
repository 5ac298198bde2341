//! Message routing and store-and-forward queueing.

mod queue;
mod router;

pub use queue::{ForwardQueue, QueuedEntry, RequeueResult};
pub use router::{Disposition, DropReason, RouteOrigin, Router};
