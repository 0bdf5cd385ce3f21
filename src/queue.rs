//! In-flight request bookkeeping.
//!
//! The queue is a deque of shared entries split by one index into a
//! written prefix (payload flushed, responses pending) and an unwritten
//! tail. Adapters are invoked strictly in queue order; hello-priority
//! requests insert at the written/unwritten boundary so they are the
//! first thing written without overtaking responses already owed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::adapter::ErasedAdapter;
use crate::error::{Error, Result};
use crate::request::{Request, RequestConfig};

/// Interior-mutable bookkeeping of one in-flight entry.
pub(crate) struct EntryState {
    /// Payload fully flushed to the socket, responses pending.
    pub written: bool,
    /// Set by cancellation; the submitter stops waiting.
    pub stop: bool,
    /// Top-level frames still expected.
    pub remaining: usize,
    /// Bytes consumed by this entry's frames so far.
    pub bytes_read: usize,
    /// First adapter error; later frames are consumed without invoking.
    pub first_error: Option<Error>,
    /// The submitter's adapter; taken back on completion.
    pub adapter: Option<Box<dyn ErasedAdapter>>,
    /// Set exactly once when the entry completes or is cancelled.
    pub outcome: Option<Result<usize>>,
}

/// One submitted request, shared between submitter, writer and reader.
///
/// Immutable after enqueue apart from [`EntryState`]; the per-entry
/// [`Notify`] is the submitter's wake primitive.
pub(crate) struct Entry {
    payload: Bytes,
    expected: usize,
    config: RequestConfig,
    hello_priority: bool,
    pub state: Mutex<EntryState>,
    pub wake: Notify,
}

impl Entry {
    pub fn new(request: &Request, adapter: Box<dyn ErasedAdapter>) -> Self {
        Self {
            payload: Bytes::copy_from_slice(request.payload()),
            expected: request.expected_responses(),
            config: *request.config(),
            hello_priority: request.has_hello_priority(),
            state: Mutex::new(EntryState {
                written: false,
                stop: false,
                remaining: request.expected_responses(),
                bytes_read: 0,
                first_error: None,
                adapter: Some(adapter),
                outcome: None,
            }),
            wake: Notify::new(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Top-level frames this entry produces in total.
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap()
    }

    /// Record the outcome (first writer wins) and wake the submitter.
    pub fn complete(&self, outcome: Result<usize>) {
        {
            let mut state = self.lock();
            if state.outcome.is_none() {
                state.outcome = Some(outcome);
            }
        }
        self.wake.notify_one();
    }

    /// Cancel: mark stopped and complete with `OperationAborted`.
    /// Idempotent; a second abort wakes nothing.
    pub fn abort(&self) {
        {
            let mut state = self.lock();
            if state.stop {
                return;
            }
            state.stop = true;
        }
        self.complete(Err(Error::OperationAborted));
    }
}

/// Ordered in-flight entries with a written/unwritten boundary.
pub(crate) struct Queue {
    entries: VecDeque<Arc<Entry>>,
    /// `entries[..written]` have been flushed to the socket.
    written: usize,
}

impl Queue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            written: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn has_unwritten(&self) -> bool {
        self.entries.len() > self.written
    }

    /// Append an entry, or insert it at the written boundary when the
    /// request carries hello priority.
    pub fn push(&mut self, entry: Arc<Entry>) {
        if entry.hello_priority {
            self.entries.insert(self.written, entry);
        } else {
            self.entries.push_back(entry);
        }
    }

    /// Concatenate unwritten payloads into `out`, marking them written.
    ///
    /// Always includes the first unwritten entry; keeps walking while
    /// both the global `coalesce_requests` switch and the entry's own
    /// `coalesce` flag allow it. Returns the sum of expected responses
    /// of the included entries.
    pub fn coalesce(&mut self, coalesce_requests: bool, out: &mut Vec<u8>) -> usize {
        let mut added = 0;
        let mut included = 0;
        while let Some(entry) = self.entries.get(self.written) {
            let batchable = coalesce_requests && entry.config.coalesce;
            if included > 0 && !batchable {
                break;
            }
            out.extend_from_slice(entry.payload());
            entry.lock().written = true;
            added += entry.expected;
            self.written += 1;
            included += 1;
            if !batchable {
                break;
            }
        }
        added
    }

    /// The written head entry currently owed responses, completing and
    /// dropping any written entries that expect none (subscribe style).
    pub fn response_head(&mut self) -> Option<Arc<Entry>> {
        while self.written > 0 {
            let head = self.entries.front().cloned()?;
            if head.expected == 0 {
                self.entries.pop_front();
                self.written -= 1;
                head.complete(Ok(0));
                continue;
            }
            return Some(head);
        }
        None
    }

    /// Remove the head entry after its last frame was dispatched.
    pub fn pop_head(&mut self) {
        if self.entries.pop_front().is_some() && self.written > 0 {
            self.written -= 1;
        }
    }

    /// Complete written entries that expect no responses. Called after
    /// each flush and again at run teardown.
    pub fn complete_written_pushes(&mut self) {
        let mut index = 0;
        while index < self.entries.len() {
            let entry = &self.entries[index];
            let done = entry.expected == 0 && entry.lock().written;
            if done {
                let entry = self.entries.remove(index).expect("index in bounds");
                if index < self.written {
                    self.written -= 1;
                }
                entry.complete(Ok(0));
            } else {
                index += 1;
            }
        }
    }

    /// `cancel(Operation::Exec)`: stop and wake every entry, clear the
    /// queue, report how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.abort();
        }
        self.written = 0;
        count
    }

    /// `cancel(Operation::Run)`: drop entries tied to the current run.
    pub fn drop_run_scoped(&mut self) {
        let mut kept = VecDeque::with_capacity(self.entries.len());
        let mut kept_written = 0;
        for (index, entry) in self.entries.drain(..).enumerate() {
            if entry.config.close_on_run_completion {
                entry.abort();
            } else {
                if index < self.written {
                    kept_written += 1;
                }
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        self.written = kept_written;
    }

    /// Apply the connection-lost policy at run teardown.
    ///
    /// Entries with `cancel_on_connection_lost` fail, written entries
    /// without `retry_on_connection_lost` fail, everything else is reset
    /// to unwritten for the next connection, preserving relative order.
    pub fn on_disconnect(&mut self) {
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            let retain = {
                let mut state = entry.lock();
                if entry.config.cancel_on_connection_lost {
                    false
                } else if state.written && !entry.config.retry_on_connection_lost {
                    false
                } else {
                    state.written = false;
                    state.remaining = entry.expected;
                    state.bytes_read = 0;
                    true
                }
            };
            if retain {
                kept.push_back(entry);
            } else {
                tracing::debug!("dropping request on connection loss");
                entry.abort();
            }
        }
        self.entries = kept;
        self.written = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Ignore;

    fn entry(configure: impl FnOnce(&mut RequestConfig), commands: &[&str]) -> Arc<Entry> {
        let mut req = Request::new();
        configure(req.config_mut());
        for name in commands {
            req.push(name);
        }
        Arc::new(Entry::new(&req, Box::new(Ignore)))
    }

    fn plain(commands: &[&str]) -> Arc<Entry> {
        entry(|_| {}, commands)
    }

    #[test]
    fn test_coalesce_batches_consecutive() {
        let mut queue = Queue::new();
        queue.push(plain(&["PING"]));
        queue.push(plain(&["PING", "PING"]));

        let mut out = Vec::new();
        let added = queue.coalesce(true, &mut out);
        assert_eq!(added, 3);
        assert!(!queue.has_unwritten());
        assert_eq!(
            out.iter().filter(|&&b| b == b'*').count(),
            3,
            "three commands flushed"
        );
    }

    #[test]
    fn test_coalesce_stops_at_non_coalescing_entry() {
        let mut queue = Queue::new();
        queue.push(plain(&["PING"]));
        queue.push(entry(|c| c.coalesce = false, &["PING"]));
        queue.push(plain(&["PING"]));

        let mut out = Vec::new();
        assert_eq!(queue.coalesce(true, &mut out), 1);

        out.clear();
        // The non-coalescing entry writes alone.
        assert_eq!(queue.coalesce(true, &mut out), 1);
        out.clear();
        assert_eq!(queue.coalesce(true, &mut out), 1);
        assert!(!queue.has_unwritten());
    }

    #[test]
    fn test_global_coalesce_off_writes_one_at_a_time() {
        let mut queue = Queue::new();
        queue.push(plain(&["PING"]));
        queue.push(plain(&["PING"]));

        let mut out = Vec::new();
        assert_eq!(queue.coalesce(false, &mut out), 1);
        assert!(queue.has_unwritten());
    }

    #[test]
    fn test_hello_priority_inserts_at_boundary() {
        let mut queue = Queue::new();
        queue.push(plain(&["PING"]));

        let mut out = Vec::new();
        queue.coalesce(true, &mut out);

        queue.push(plain(&["GET"]));

        let mut hello_req = Request::new();
        hello_req.push_args("HELLO", &["3"]);
        let hello = Arc::new(Entry::new(&hello_req, Box::new(Ignore)));
        queue.push(hello.clone());

        // Written PING stays first; HELLO lands before the GET.
        out.clear();
        queue.coalesce(true, &mut out);
        assert!(out.starts_with(b"*2\r\n$5\r\nHELLO\r\n"));
    }

    #[test]
    fn test_response_head_skips_zero_expected() {
        let mut queue = Queue::new();
        let sub = entry(|_| {}, &["SUBSCRIBE"]);
        assert_eq!(sub.expected(), 0);
        queue.push(sub.clone());
        let ping = plain(&["PING"]);
        queue.push(ping.clone());

        let mut out = Vec::new();
        queue.coalesce(true, &mut out);

        let head = queue.response_head().expect("ping entry owed a frame");
        assert!(Arc::ptr_eq(&head, &ping));
        // The subscribe entry completed with success.
        assert!(matches!(sub.lock().outcome, Some(Ok(0))));
    }

    #[test]
    fn test_cancel_all_is_idempotent() {
        let mut queue = Queue::new();
        let e = plain(&["PING"]);
        queue.push(e.clone());

        assert_eq!(queue.cancel_all(), 1);
        assert_eq!(queue.cancel_all(), 0);
        assert!(matches!(e.lock().outcome, Some(Err(Error::OperationAborted))));
        assert!(e.lock().stop);
    }

    #[test]
    fn test_disconnect_policy() {
        let mut queue = Queue::new();
        let cancel = entry(|c| c.cancel_on_connection_lost = true, &["BLPOP"]);
        let fail = entry(
            |c| {
                c.cancel_on_connection_lost = false;
                c.retry_on_connection_lost = false;
            },
            &["PING"],
        );
        let retry = entry(
            |c| {
                c.cancel_on_connection_lost = false;
                c.retry_on_connection_lost = true;
            },
            &["PING"],
        );
        queue.push(cancel.clone());
        queue.push(fail.clone());
        queue.push(retry.clone());

        let mut out = Vec::new();
        queue.coalesce(true, &mut out);
        queue.on_disconnect();

        assert!(matches!(cancel.lock().outcome, Some(Err(Error::OperationAborted))));
        assert!(matches!(fail.lock().outcome, Some(Err(Error::OperationAborted))));
        assert!(retry.lock().outcome.is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.has_unwritten(), "retained entry reset to unwritten");
        assert!(!retry.lock().written);
    }

    #[test]
    fn test_unwritten_survive_disconnect() {
        let mut queue = Queue::new();
        let pending = entry(|c| c.cancel_on_connection_lost = false, &["PING"]);
        queue.push(pending.clone());

        queue.on_disconnect();
        assert_eq!(queue.len(), 1);
        assert!(pending.lock().outcome.is_none());
    }

    #[test]
    fn test_drop_run_scoped() {
        let mut queue = Queue::new();
        let ping = entry(|c| c.close_on_run_completion = true, &["PING"]);
        let user = entry(|c| c.cancel_on_connection_lost = false, &["GET"]);
        queue.push(ping.clone());
        queue.push(user.clone());

        queue.drop_run_scoped();
        assert_eq!(queue.len(), 1);
        assert!(matches!(ping.lock().outcome, Some(Err(Error::OperationAborted))));
        assert!(user.lock().outcome.is_none());
    }
}
