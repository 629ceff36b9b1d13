//! The session's long-running tasks.
//!
//! - [`ReadWorker`]: pulls stanzas off the open connection and dispatches them
//! - [`WriteWorker`]: drains the outbound queue through the writer slot
//! - [`KeepAliveWorker`]: periodically writes a whitespace ping
//!
//! Each worker runs until the supervisor's cancellation token fires.

mod keep_alive;
mod read;
mod write;

pub use keep_alive::KeepAliveWorker;
pub use read::{ClosedFn, DispatchFn, ReadWorker};
pub use write::WriteWorker;
