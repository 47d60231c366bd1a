//!
//! The request queue: every submitted request lives here from `exec` until
//! its last response (or its failure).
//!
//! Ordering is the whole contract: entries leave for the wire strictly from
//! the front, and responses complete entries strictly from the front. The
//! writer and reader touch disjoint parts of each entry (payload and
//! `written` versus `n_cmds` and `bytes_read`), synchronized by the one lock
//! around the queue.
//!

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::adapter::DynAdapter;
use crate::error::{Error, ErrorKind};
use crate::request::Request;

/// What a submitter receives when its request finishes, one way or the
/// other. The adapter rides along so the submitter gets its storage back.
pub(crate) struct Completion {
    pub result: crate::Result<u64>,
    pub adapter: Option<Box<dyn DynAdapter>>,
}

pub(crate) struct RequestEntry {
    id: u64,
    payload: Bytes,
    /// Responses still owed to this entry.
    n_cmds: usize,
    bytes_read: u64,
    written: bool,
    close_on_connection_lost: bool,
    /// First server error reply seen for this entry; reported once the whole
    /// batch is drained.
    first_error: Option<Error>,
    adapter: Option<Box<dyn DynAdapter>>,
    done: Option<oneshot::Sender<Completion>>,
}

impl RequestEntry {
    fn complete(&mut self, result: crate::Result<u64>) {
        let adapter = self.adapter.take();
        if let Some(done) = self.done.take() {
            let _ = done.send(Completion { result, adapter });
        }
    }

    /// The submitter dropped its wakeup receiver; nobody is waiting.
    fn submitter_gone(&self) -> bool {
        self.done.as_ref().map_or(true, oneshot::Sender::is_closed)
    }
}

pub(crate) struct Queue {
    entries: VecDeque<RequestEntry>,
    next_id: u64,
    /// Responses still owed for batches already handed to the socket.
    pub cmds: usize,
    /// A socket write is in progress right now.
    pub writing: bool,
}

impl Queue {
    pub fn new() -> Queue {
        Queue {
            entries: VecDeque::new(),
            next_id: 0,
            cmds: 0,
            writing: false,
        }
    }

    fn entry(
        &mut self,
        req: &Request,
        adapter: Box<dyn DynAdapter>,
    ) -> (RequestEntry, oneshot::Receiver<Completion>) {
        let (done, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;
        let entry = RequestEntry {
            id,
            payload: req.to_bytes(),
            n_cmds: req.commands(),
            bytes_read: 0,
            written: false,
            close_on_connection_lost: req.close_on_connection_lost(),
            first_error: None,
            adapter: Some(adapter),
            done: Some(done),
        };
        (entry, rx)
    }

    /// Appends a request. The returned flag asks the caller to wake the
    /// writer: that is only useful when no write is in progress and no
    /// responses are outstanding, otherwise the writer gets to this entry on
    /// its own.
    pub fn push_back(
        &mut self,
        req: &Request,
        adapter: Box<dyn DynAdapter>,
    ) -> (oneshot::Receiver<Completion>, bool) {
        let (entry, rx) = self.entry(req, adapter);
        self.entries.push_back(entry);
        (rx, self.cmds == 0 && !self.writing)
    }

    /// Puts a request ahead of everything queued. Used for the handshake,
    /// which must be the first frame on the wire.
    pub fn push_front(
        &mut self,
        req: &Request,
        adapter: Box<dyn DynAdapter>,
    ) -> oneshot::Receiver<Completion> {
        let (entry, rx) = self.entry(req, adapter);
        self.entries.push_front(entry);
        rx
    }

    /// Assembles the next outbound batch: the payloads of the front `k`
    /// entries (everything when coalescing, one otherwise) and their ids.
    /// Returns `None` while a write is in progress, while responses are
    /// still owed, or when there is nothing to send.
    pub fn coalesce(&mut self, coalesce_requests: bool) -> Option<(Vec<u8>, Vec<u64>)> {
        if self.writing || self.cmds != 0 {
            return None;
        }
        // Unwritten requests whose submitter vanished are never sent.
        self.entries
            .retain(|entry| entry.written || !entry.submitter_gone());
        if self.entries.is_empty() {
            return None;
        }

        let limit = if coalesce_requests {
            self.entries.len()
        } else {
            1
        };
        let mut payload = Vec::new();
        let mut ids = Vec::with_capacity(limit);
        for entry in self
            .entries
            .iter()
            .take(limit)
            .take_while(|entry| !entry.written)
        {
            payload.extend_from_slice(&entry.payload);
            self.cmds += entry.n_cmds;
            ids.push(entry.id);
        }
        self.writing = true;
        Some((payload, ids))
    }

    /// Records a finished socket write. Entries that expect no response are
    /// done now; their wakeups fire here, before the reader can observe a
    /// new queue front.
    pub fn on_write(&mut self, ids: &[u64]) {
        self.writing = false;
        let mut i = 0;
        while i < self.entries.len() {
            let entry = &mut self.entries[i];
            if ids.contains(&entry.id) {
                entry.written = true;
                if entry.n_cmds == 0 {
                    if let Some(mut entry) = self.entries.remove(i) {
                        entry.complete(Ok(0));
                    }
                    continue;
                }
            }
            i += 1;
        }
    }

    /// Detaches the front entry's adapter for the reader, which parses
    /// without holding the queue lock. Returns `None` when the next response
    /// cannot belong to a request (no front, or a front that expects none).
    pub fn take_head_adapter(&mut self) -> Option<(u64, Box<dyn DynAdapter>)> {
        let front = self.entries.front_mut()?;
        if front.n_cmds == 0 {
            return None;
        }
        let adapter = front.adapter.take()?;
        Some((front.id, adapter))
    }

    /// Accounts one fully parsed top-level response against the front entry
    /// and returns whether the writer should be woken for the next batch.
    pub fn on_head_response(
        &mut self,
        id: u64,
        adapter: Box<dyn DynAdapter>,
        bytes: u64,
        server_error: Option<String>,
    ) -> bool {
        self.cmds = self.cmds.saturating_sub(1);

        let mut finished = false;
        if let Some(front) = self.entries.front_mut() {
            // `close` may have swapped the queue out underneath the parse.
            if front.id == id && front.n_cmds > 0 {
                front.bytes_read += bytes;
                if let Some(message) = server_error {
                    if front.first_error.is_none() {
                        front.first_error = Some(Error::with_detail(ErrorKind::ExecError, message));
                    }
                }
                front.adapter = Some(adapter);
                front.n_cmds -= 1;
                finished = front.n_cmds == 0;
            }
        }
        if finished {
            if let Some(mut entry) = self.entries.pop_front() {
                let result = match entry.first_error.take() {
                    Some(err) => Err(err),
                    None => Ok(entry.bytes_read),
                };
                entry.complete(result);
            }
        }

        self.cmds == 0 && !self.entries.is_empty() && !self.writing
    }

    /// Fails and removes every entry. Used by `close`.
    pub fn fail_all(&mut self, err: &Error) {
        for mut entry in self.entries.drain(..) {
            entry.complete(Err(err.clone()));
        }
        self.cmds = 0;
        self.writing = false;
    }

    /// Connection teardown: entries the failed connection owed responses to
    /// (and unwritten ones that opted out of requeueing) fail with the exit
    /// error; the rest stay queued for the next `run`.
    pub fn fail_on_disconnect(&mut self, err: &Error) {
        self.cmds = 0;
        self.writing = false;
        let mut kept = VecDeque::new();
        for mut entry in self.entries.drain(..) {
            if entry.written || entry.close_on_connection_lost {
                entry.complete(Err(err.clone()));
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Ignore;

    fn request(commands: &[&[&str]]) -> Request {
        let mut req = Request::new();
        for cmd in commands {
            req.push(cmd.iter());
        }
        req
    }

    #[test]
    fn coalesce_concatenates_in_submission_order() {
        let mut queue = Queue::new();
        let (_rx1, _) = queue.push_back(&request(&[&["SET", "a", "1"]]), Box::new(Ignore));
        let (_rx2, _) = queue.push_back(&request(&[&["GET", "a"]]), Box::new(Ignore));
        let (payload, ids) = queue.coalesce(true).unwrap();
        assert_eq!(
            payload,
            b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\n"
        );
        assert_eq!(ids.len(), 2);
        assert_eq!(queue.cmds, 2);
        // No second batch while responses are owed.
        assert!(queue.coalesce(true).is_none());
    }

    #[test]
    fn coalesce_disabled_takes_one() {
        let mut queue = Queue::new();
        let (_rx1, _) = queue.push_back(&request(&[&["PING"]]), Box::new(Ignore));
        let (_rx2, _) = queue.push_back(&request(&[&["PING"]]), Box::new(Ignore));
        let (_, ids) = queue.coalesce(false).unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn fire_and_forget_completes_on_write() {
        let mut queue = Queue::new();
        let (mut rx, _) = queue.push_back(&request(&[&["SUBSCRIBE", "foo"]]), Box::new(Ignore));
        let (payload, ids) = queue.coalesce(true).unwrap();
        assert!(!payload.is_empty());
        assert_eq!(queue.cmds, 0);
        assert!(rx.try_recv().is_err());
        queue.on_write(&ids);
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.result.unwrap(), 0);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn head_responses_complete_in_order() {
        let mut queue = Queue::new();
        let (mut rx, _) = queue.push_back(&request(&[&["SET", "a", "1"], &["GET", "a"]]), Box::new(Ignore));
        let (_, ids) = queue.coalesce(true).unwrap();
        queue.on_write(&ids);

        let (id, adapter) = queue.take_head_adapter().unwrap();
        assert!(!queue.on_head_response(id, adapter, 5, None));
        assert!(rx.try_recv().is_err());

        let (id, adapter) = queue.take_head_adapter().unwrap();
        queue.on_head_response(id, adapter, 7, None);
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.result.unwrap(), 12);
    }

    #[test]
    fn server_error_fails_only_that_entry() {
        let mut queue = Queue::new();
        let (mut rx, _) = queue.push_back(&request(&[&["SET"]]), Box::new(Ignore));
        let (_, ids) = queue.coalesce(true).unwrap();
        queue.on_write(&ids);
        let (id, adapter) = queue.take_head_adapter().unwrap();
        queue.on_head_response(id, adapter, 10, Some("ERR wrong number of arguments".into()));
        let completion = rx.try_recv().unwrap();
        let err = completion.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecError);
        assert!(err.detail().unwrap().starts_with("ERR"));
    }

    #[test]
    fn disconnect_keeps_unwritten_entries() {
        let mut queue = Queue::new();
        let (mut written_rx, _) = queue.push_back(&request(&[&["GET", "a"]]), Box::new(Ignore));
        let (_, ids) = queue.coalesce(true).unwrap();
        queue.on_write(&ids);
        let (mut queued_rx, _) = queue.push_back(&request(&[&["GET", "b"]]), Box::new(Ignore));

        queue.fail_on_disconnect(&Error::new(ErrorKind::IdleTimeout));
        assert_eq!(
            written_rx.try_recv().unwrap().result.unwrap_err().kind(),
            ErrorKind::IdleTimeout
        );
        assert!(queued_rx.try_recv().is_err());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn abandoned_unwritten_requests_are_skipped() {
        let mut queue = Queue::new();
        let (rx, _) = queue.push_back(&request(&[&["GET", "a"]]), Box::new(Ignore));
        drop(rx);
        assert!(queue.coalesce(true).is_none());
        assert_eq!(queue.len(), 0);
    }
}
