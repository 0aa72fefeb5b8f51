//! Forwarding from a readable stream into its pipe target.
//!
//! The readable holds its target weakly and the target never refers back to
//! the readable: a forward waiting for capacity captures only a weak handle
//! to its source. The caller must not tear the target down mid-forward.

use tracing::trace;

use crate::readable::ReadableStream;
use crate::writable::WritableStream;

/// Forward a freshly pushed item.
///
/// Writes straight through when the target has capacity and no earlier
/// forward is still waiting; otherwise queues a one-shot forward behind the
/// ones already waiting so pushes reach the target in order.
pub(crate) fn forward_pushed<T: Clone + 'static>(
    source: &ReadableStream<T>,
    target: &WritableStream<T>,
    item: T,
) {
    if target.is_writable() && !target.has_deferred() {
        forward(source, target, item);
        return;
    }

    trace!(
        stream = source.id(),
        target = target.id(),
        "pipe target not writable, deferring forward"
    );
    let source = source.downgrade();
    target.when_writable(move |target| match source.upgrade() {
        Some(source) => forward(&source, target, item),
        None => {
            target.write(item);
        }
    });
}

// The readable notification fires even though the item went to the target.
fn forward<T: Clone + 'static>(source: &ReadableStream<T>, target: &WritableStream<T>, item: T) {
    target.write(item);
    source.notify_readable();
}
