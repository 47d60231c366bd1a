//!
//! The writer loop: batches queued requests into single socket writes.
//!

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::Shared;
use crate::error::{Error, ErrorKind};

/// Runs until a write fails. Parks on the writer wake signal whenever the
/// queue has nothing sendable; `enqueue` and the reader raise that signal.
///
/// One batch is in flight at most: the next `coalesce` yields nothing until
/// the previous batch's responses are fully drained, which keeps wire order
/// identical to queue order.
pub(crate) async fn writer_loop<W: AsyncWrite + Unpin>(
    shared: &Shared,
    io: &mut W,
    coalesce_requests: bool,
) -> crate::Result<()> {
    loop {
        loop {
            let batch = {
                let mut queue = shared.queue.lock().unwrap();
                queue.coalesce(coalesce_requests)
            };
            let Some((payload, ids)) = batch else { break };

            io.write_all(&payload)
                .await
                .map_err(|err| Error::io(ErrorKind::WriteError, &err))?;
            io.flush()
                .await
                .map_err(|err| Error::io(ErrorKind::WriteError, &err))?;
            debug!(bytes = payload.len(), requests = ids.len(), "wrote batch");

            shared.queue.lock().unwrap().on_write(&ids);
        }

        shared.writer_wake.notified().await;
    }
}
