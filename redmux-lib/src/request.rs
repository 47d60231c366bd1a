//!
//! Building pipelined command payloads.
//!

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::Config;

/// A batch of commands, serialized up front and sent as one unit.
///
/// Commands are appended with [`push`](Request::push); the request tracks how
/// many responses the batch will produce. Subscription commands are
/// acknowledged through server pushes rather than replies, so they add
/// nothing to that count.
///
/// ```
/// use redmux_lib::Request;
///
/// let mut req = Request::new();
/// req.push(["SET", "key", "value"]);
/// req.push(["GET", "key"]);
/// assert_eq!(req.commands(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Request {
    buf: BytesMut,
    n_cmds: usize,
    close_on_connection_lost: bool,
}

impl Request {
    /// Creates an empty request.
    pub fn new() -> Request {
        Request::default()
    }

    /// Appends one command. The first element is the command name, the rest
    /// are its arguments.
    pub fn push<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
        I::Item: AsRef<[u8]>,
    {
        let args = args.into_iter();
        let len = args.len();
        if len == 0 {
            return;
        }

        self.buf.put_u8(b'*');
        put_decimal(&mut self.buf, len as u64);
        let mut expects_response = true;
        for (i, arg) in args.enumerate() {
            let arg = arg.as_ref();
            self.buf.put_u8(b'$');
            put_decimal(&mut self.buf, arg.len() as u64);
            self.buf.extend_from_slice(arg);
            self.buf.extend_from_slice(b"\r\n");
            if i == 0 {
                expects_response = command_expects_response(arg);
            }
        }

        if expects_response {
            self.n_cmds += 1;
        }
    }

    /// The number of responses this request expects.
    pub fn commands(&self) -> usize {
        self.n_cmds
    }

    /// The serialized payload size in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// `true` when no command has been appended.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Removes every command, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.n_cmds = 0;
    }

    /// When set, the request fails with the connection error instead of
    /// staying queued for the next `run`, and submitting it while
    /// disconnected fails immediately with `NotConnected`.
    pub fn set_close_on_connection_lost(&mut self, close: bool) {
        self.close_on_connection_lost = close;
    }

    /// See [`set_close_on_connection_lost`](Request::set_close_on_connection_lost).
    pub fn close_on_connection_lost(&self) -> bool {
        self.close_on_connection_lost
    }

    /// The serialized payload.
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    /// The protocol handshake sent first on every connection.
    pub(crate) fn hello(config: &Config) -> Request {
        let mut args: Vec<Vec<u8>> = vec![b"HELLO".to_vec(), b"3".to_vec()];
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            args.push(b"AUTH".to_vec());
            args.push(username.clone().into_bytes());
            args.push(password.clone().into_bytes());
        }
        if let Some(name) = &config.clientname {
            args.push(b"SETNAME".to_vec());
            args.push(name.clone().into_bytes());
        }

        let mut req = Request::new();
        req.push(args);
        // A stale handshake must never survive into the next connection.
        req.set_close_on_connection_lost(true);
        req
    }

    /// The health check ping.
    pub(crate) fn ping(health_check_id: &str) -> Request {
        let mut req = Request::new();
        if health_check_id.is_empty() {
            req.push([b"PING".as_ref()]);
        } else {
            req.push([b"PING".as_ref(), health_check_id.as_bytes()]);
        }
        req
    }
}

/// Writes `val` in decimal ASCII.
fn put_decimal(buf: &mut BytesMut, val: u64) {
    let mut tmp = [0u8; 20];
    let mut pos = tmp.len();
    let mut val = val;
    loop {
        pos -= 1;
        tmp[pos] = b'0' + (val % 10) as u8;
        val /= 10;
        if val == 0 {
            break;
        }
    }
    buf.extend_from_slice(&tmp[pos..]);
    buf.extend_from_slice(b"\r\n");
}

/// Subscription commands are confirmed through pushes, not replies.
fn command_expects_response(command: &[u8]) -> bool {
    const NO_RESPONSE: &[&[u8]] = &[
        b"SUBSCRIBE",
        b"UNSUBSCRIBE",
        b"PSUBSCRIBE",
        b"PUNSUBSCRIBE",
        b"SSUBSCRIBE",
        b"SUNSUBSCRIBE",
    ];
    !NO_RESPONSE
        .iter()
        .any(|name| command.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_bulk_arrays() {
        let mut req = Request::new();
        req.push(["SET", "a", "1"]);
        req.push(["GET", "a"]);
        assert_eq!(
            req.payload(),
            b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\n"
        );
        assert_eq!(req.commands(), 2);
    }

    #[test]
    fn subscribe_expects_no_response() {
        let mut req = Request::new();
        req.push(["SUBSCRIBE", "foo", "bar"]);
        assert_eq!(req.commands(), 0);
        req.push(["psubscribe", "news.*"]);
        assert_eq!(req.commands(), 0);
        req.push(["PING"]);
        assert_eq!(req.commands(), 1);
    }

    #[test]
    fn hello_carries_auth_and_name() {
        let mut config = Config::default();
        config.username = Some("user".into());
        config.password = Some("pass".into());
        config.clientname = Some("demo".into());
        let req = Request::hello(&config);
        assert_eq!(
            req.payload(),
            b"*7\r\n$5\r\nHELLO\r\n$1\r\n3\r\n$4\r\nAUTH\r\n$4\r\nuser\r\n$4\r\npass\r\n$7\r\nSETNAME\r\n$4\r\ndemo\r\n"
        );
        assert_eq!(req.commands(), 1);
        assert!(req.close_on_connection_lost());
    }

    #[test]
    fn payload_reparses_to_an_isomorphic_tree() {
        use crate::parser::{Parser, Step};
        use crate::resp3::Kind;

        let mut req = Request::new();
        req.push(["SET", "key", "value"]);

        let mut parser = Parser::new(16);
        let mut buf = req.payload();
        let mut shape = Vec::new();
        loop {
            match parser.step(buf).unwrap() {
                Step::Item {
                    consumed,
                    node,
                    end_of_response,
                } => {
                    let node = node.unwrap();
                    shape.push((node.kind, node.depth, node.data.to_vec()));
                    buf = &buf[consumed..];
                    if end_of_response {
                        break;
                    }
                }
                Step::Incomplete => panic!("own payload must parse"),
            }
        }
        assert_eq!(
            shape,
            vec![
                (Kind::Array, 0, Vec::new()),
                (Kind::BlobString, 1, b"SET".to_vec()),
                (Kind::BlobString, 1, b"key".to_vec()),
                (Kind::BlobString, 1, b"value".to_vec()),
            ]
        );
    }

    #[test]
    fn clear_resets_counts() {
        let mut req = Request::new();
        req.push(["PING"]);
        req.clear();
        assert!(req.is_empty());
        assert_eq!(req.commands(), 0);
    }
}
