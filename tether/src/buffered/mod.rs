//! Buffered messaging: the resilience layer.
//!
//! Wraps a raw duplex channel so that transient connectivity loss,
//! out-of-order startup, and slow peers never surface as lost messages or
//! application-visible failures. [`BufferedOutputChannel`] queues outgoing
//! messages and reconnects in the background; [`BufferedInputChannel`]
//! buffers responses per receiver identity until that identity (re)connects.
//!
//! Both wrappers implement the same traits as the raw channels they wrap,
//! so they substitute one-for-one.

use tokio::task::JoinHandle;

use crate::provider::TimeProvider;

mod config;
mod input;
mod output;

pub use config::BufferConfig;
pub use input::BufferedInputChannel;
pub use output::BufferedOutputChannel;

/// Wait for a background task to finish, bounded by `timeout`.
///
/// A task that overruns the bound is aborted so a wedged transport call
/// cannot leave its one-active-task flag stuck for the next open cycle.
async fn join_bounded<T: TimeProvider>(
    time: &T,
    timeout: std::time::Duration,
    name: &str,
    mut handle: JoinHandle<()>,
) {
    if time.timeout(timeout, &mut handle).await.is_err() {
        tracing::warn!("{} task did not stop within {:?}, aborting it", name, timeout);
        handle.abort();
    }
}
