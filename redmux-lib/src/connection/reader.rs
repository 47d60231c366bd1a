//!
//! The reader loop: drives the parser across socket reads and routes every
//! top-level response to the front of the request queue or to a push
//! consumer.
//!

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::Shared;
use crate::error::{Error, ErrorKind};
use crate::parser::{Parser, Step};
use crate::resp3::Node;

const BUF_SIZE: usize = 4 * 1024;

/// What one fully parsed top-level response amounted to.
pub(crate) struct ReadSummary {
    /// Bytes the response occupied on the wire.
    pub bytes: u64,
    /// The payload of an error reply at the root, when the response was one.
    pub server_error: Option<String>,
}

/// Buffered reading plus incremental parsing over the read half.
///
/// `buf[..pos]` holds the parsed prefix of the response in flight; it is
/// released in one step when the response completes, so node payloads can
/// borrow into it until then.
pub(crate) struct SocketReader<R> {
    io: R,
    buf: BytesMut,
    pos: usize,
    parser: Parser,
    max_read_size: usize,
}

impl<R: AsyncRead + Unpin> SocketReader<R> {
    pub(crate) fn new(io: R, max_read_size: usize, max_nesting: usize) -> SocketReader<R> {
        SocketReader {
            io,
            buf: BytesMut::with_capacity(BUF_SIZE),
            pos: 0,
            parser: Parser::new(max_nesting),
            max_read_size,
        }
    }

    /// Reads at least one byte from the socket into the buffer, which is
    /// never grown past `max_read_size`.
    async fn fill(&mut self, shared: &Shared) -> crate::Result<()> {
        let room = self.max_read_size.saturating_sub(self.buf.len());
        if room == 0 {
            return Err(Error::with_detail(
                ErrorKind::ResponseTooLarge,
                format!("response exceeds {} bytes", self.max_read_size),
            ));
        }
        let n = (&mut self.io)
            .take(room as u64)
            .read_buf(&mut self.buf)
            .await
            .map_err(|err| Error::io(ErrorKind::ReadError, &err))?;
        if n == 0 {
            return Err(Error::with_detail(
                ErrorKind::ReadError,
                "connection reset by peer",
            ));
        }
        shared.touch_last_data();
        Ok(())
    }

    /// Waits until the unparsed region holds at least one header line, so
    /// the next response's kind byte can be inspected.
    pub(crate) async fn fill_line(&mut self, shared: &Shared) -> crate::Result<()> {
        while !contains_crlf(&self.buf[self.pos..]) {
            self.fill(shared).await?;
        }
        Ok(())
    }

    /// The marker byte of the next element.
    pub(crate) fn peek_byte(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Parses exactly one top-level response, feeding each node to `sink`.
    /// The parsed bytes are released from the buffer when the response
    /// completes.
    pub(crate) async fn read_response(
        &mut self,
        shared: &Shared,
        sink: &mut (dyn FnMut(&Node<'_>) -> crate::Result<()> + Send),
    ) -> crate::Result<ReadSummary> {
        let mut bytes = 0u64;
        let mut server_error = None;
        loop {
            let parsed = {
                match self.parser.step(&self.buf[self.pos..])? {
                    Step::Incomplete => None,
                    Step::Item {
                        consumed,
                        node,
                        end_of_response,
                    } => {
                        if let Some(node) = node {
                            if node.depth == 0 && node.kind.is_error() && server_error.is_none() {
                                server_error =
                                    Some(String::from_utf8_lossy(node.data).into_owned());
                            }
                            sink(&node)?;
                        }
                        Some((consumed, end_of_response))
                    }
                }
            };
            match parsed {
                None => self.fill(shared).await?,
                Some((consumed, end_of_response)) => {
                    self.pos += consumed;
                    bytes += consumed as u64;
                    if end_of_response {
                        self.buf.advance(self.pos);
                        self.pos = 0;
                        return Ok(ReadSummary {
                            bytes,
                            server_error,
                        });
                    }
                }
            }
        }
    }
}

/// Runs until the socket fails, the stream violates the protocol, or a
/// response outgrows the configured limit.
pub(crate) async fn reader_loop<R: AsyncRead + Unpin>(
    shared: &Shared,
    reader: &mut SocketReader<R>,
) -> crate::Result<()> {
    loop {
        reader.fill_line(shared).await?;

        // A push, anything arriving with no request in flight, and anything
        // arriving for a request that expects no response all go out of
        // band. Everything else belongs to the front of the queue.
        let head = {
            let mut queue = shared.queue.lock().unwrap();
            if reader.peek_byte() == Some(b'>') {
                None
            } else {
                queue.take_head_adapter()
            }
        };

        match head {
            Some((id, mut adapter)) => {
                let summary = reader
                    .read_response(shared, &mut |node| adapter.on_node(node))
                    .await?;
                let wake_writer = {
                    let mut queue = shared.queue.lock().unwrap();
                    queue.on_head_response(id, adapter, summary.bytes, summary.server_error)
                };
                if wake_writer {
                    shared.writer_wake.notify_one();
                }
            }
            None => deliver_push(shared, reader).await?,
        }
    }
}

/// Hands one push to a `receive_push` caller. With no consumer pending the
/// reader stops here, the socket stops being drained, and TCP backpressure
/// reaches the server; a consumer that never shows up ends in the idle
/// watchdog firing.
async fn deliver_push<R: AsyncRead + Unpin>(
    shared: &Shared,
    reader: &mut SocketReader<R>,
) -> crate::Result<()> {
    debug!("delivering server push");
    let mut waiter = loop {
        let candidate = {
            let mut waiters = shared.push_waiters.lock().unwrap();
            loop {
                match waiters.pop_front() {
                    Some(waiter) if waiter.abandoned() => {}
                    other => break other,
                }
            }
        };
        if let Some(waiter) = candidate {
            break waiter;
        }
        shared.push_arrived.notified().await;
    };

    let result = reader
        .read_response(shared, &mut |node| waiter.adapter.on_node(node))
        .await;
    match result {
        Ok(summary) => {
            waiter.complete(Ok(summary.bytes));
            Ok(())
        }
        Err(err) => {
            waiter.complete(Err(err.clone()));
            Err(err)
        }
    }
}

fn contains_crlf(buf: &[u8]) -> bool {
    buf.windows(2).any(|window| window == b"\r\n")
}
