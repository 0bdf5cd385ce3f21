//! Request construction.
//!
//! A [`Request`] accumulates commands into one pre-serialized payload
//! buffer plus the count of top-level response frames the server will
//! send back. Commands answered by a push frame (the subscribe family)
//! add no expected response; their confirmations reach the push
//! rendezvous instead of the submitter's adapter.
//!
//! The payload is immutable once the request is submitted; the same
//! request value can be submitted any number of times.

use crate::resp3::encode;

/// Per-request policy flags.
#[derive(Debug, Clone, Copy)]
pub struct RequestConfig {
    /// May be batched with neighboring requests into a single write.
    pub coalesce: bool,
    /// Fail the request with `OperationAborted` when the connection is
    /// lost before its response arrives.
    pub cancel_on_connection_lost: bool,
    /// When lost while written but unanswered, re-enqueue on the next
    /// successful connection instead of failing.
    pub retry_on_connection_lost: bool,
    /// Fail immediately with `NotConnected` when submitted while the
    /// connection is down.
    pub cancel_if_not_connected: bool,
    /// When the request starts with HELLO, enqueue it ahead of every
    /// not-yet-written entry (never ahead of written ones).
    pub hello_with_priority: bool,
    /// Tie the request's lifetime to the current run: `cancel(Run)`
    /// drops it with `OperationAborted`. Used by the internal health
    /// ping.
    pub close_on_run_completion: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            coalesce: true,
            cancel_on_connection_lost: true,
            retry_on_connection_lost: false,
            cancel_if_not_connected: false,
            hello_with_priority: true,
            close_on_run_completion: false,
        }
    }
}

/// An ordered list of commands with one serialized payload.
#[derive(Debug, Clone, Default)]
pub struct Request {
    config: RequestConfig,
    payload: Vec<u8>,
    commands: usize,
    expected_responses: usize,
    starts_with_hello: bool,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RequestConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// The policy flags of this request.
    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RequestConfig {
        &mut self.config
    }

    /// Append a command with no arguments.
    pub fn push(&mut self, name: &str) {
        self.push_args::<&str>(name, &[]);
    }

    /// Append a command with arguments. Non-string arguments are
    /// stringified by the caller.
    pub fn push_args<A: AsRef<[u8]>>(&mut self, name: &str, args: &[A]) {
        encode::write_header(&mut self.payload, 1 + args.len());
        encode::write_bulk(&mut self.payload, name.as_bytes());
        for arg in args {
            encode::write_bulk(&mut self.payload, arg.as_ref());
        }
        self.note_command(name);
    }

    /// Append a command whose arguments are key-value pairs, each
    /// expanding to two bulks (HSET style).
    pub fn push_pairs<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        name: &str,
        key: &str,
        pairs: &[(K, V)],
    ) {
        encode::write_header(&mut self.payload, 2 + 2 * pairs.len());
        encode::write_bulk(&mut self.payload, name.as_bytes());
        encode::write_bulk(&mut self.payload, key.as_bytes());
        for (k, v) in pairs {
            encode::write_bulk(&mut self.payload, k.as_ref());
            encode::write_bulk(&mut self.payload, v.as_ref());
        }
        self.note_command(name);
    }

    fn note_command(&mut self, name: &str) {
        if self.commands == 0 {
            self.starts_with_hello = name.eq_ignore_ascii_case("HELLO");
        }
        self.commands += 1;
        if !has_push_response(name) {
            self.expected_responses += 1;
        }
    }

    /// The serialized wire bytes of every pushed command.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Commands pushed so far.
    pub fn command_count(&self) -> usize {
        self.commands
    }

    /// Top-level response frames the server will send for this request.
    pub fn expected_responses(&self) -> usize {
        self.expected_responses
    }

    /// Drop all commands, keeping the allocation and the config.
    pub fn clear(&mut self) {
        self.payload.clear();
        self.commands = 0;
        self.expected_responses = 0;
        self.starts_with_hello = false;
    }

    /// Whether this request jumps the unwritten part of the queue.
    pub(crate) fn has_hello_priority(&self) -> bool {
        self.config.hello_with_priority && self.starts_with_hello
    }
}

/// Whether a command's confirmation arrives as a push frame rather than
/// an ordinary response.
fn has_push_response(name: &str) -> bool {
    name.eq_ignore_ascii_case("SUBSCRIBE")
        || name.eq_ignore_ascii_case("PSUBSCRIBE")
        || name.eq_ignore_ascii_case("UNSUBSCRIBE")
        || name.eq_ignore_ascii_case("PUNSUBSCRIBE")
}
