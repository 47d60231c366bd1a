//!
//! Incremental RESP3 decoder.
//!
//! The parser consumes one wire element per [`Parser::step`] call and keeps a
//! stack of open aggregates, so it can resume after a buffer refill at any
//! element boundary. When the buffer ends in the middle of an element nothing
//! is consumed and [`Step::Incomplete`] asks the caller for more bytes.
//!

use atoi::atoi;
use std::fmt;

use crate::error::{Error, ErrorKind};
use crate::resp3::{Kind, Node};

/// Framing violations the parser can detect.
///
/// These are all fatal to the connection; an incomplete buffer is reported
/// through [`Step::Incomplete`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseError {
    /// The element started with a byte that maps to no kind.
    BadKindByte(u8),
    /// A length, count, or numeric header did not parse.
    BadLength,
    /// An inline header was not valid UTF-8.
    BadUtf8InInlineHeader,
    /// Aggregate nesting exceeded the configured bound.
    ProtocolNesting,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::BadKindByte(byte) => write!(f, "invalid kind byte 0x{byte:02x}"),
            ParseError::BadLength => f.write_str("invalid length or numeric header"),
            ParseError::BadUtf8InInlineHeader => f.write_str("inline header is not valid utf-8"),
            ParseError::ProtocolNesting => f.write_str("aggregate nesting too deep"),
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Error {
        Error::with_detail(ErrorKind::ProtocolError, err.to_string())
    }
}

/// Outcome of one [`Parser::step`] call.
#[derive(Debug)]
pub(crate) enum Step<'a> {
    /// The buffer ends mid-element; nothing was consumed.
    Incomplete,
    /// One element was consumed.
    Item {
        /// Bytes consumed from the front of the buffer.
        consumed: usize,
        /// The decoded node. `None` for the streamed-aggregate end marker,
        /// which closes a frame without being a value itself.
        node: Option<Node<'a>>,
        /// `true` when this element completed a top-level response.
        end_of_response: bool,
    },
}

/// The incremental decoder. One instance per connection; state survives
/// buffer refills.
pub(crate) struct Parser {
    /// One slot per open aggregate: the children still expected, or `None`
    /// for a streamed aggregate, which is closed by the `.` marker instead
    /// of a count.
    stack: Vec<Option<u64>>,
    max_nesting: usize,
    /// Kind byte of the element that opened the current top-level tree.
    root: Option<Kind>,
    /// An attribute tree completed at depth 0; the next value still belongs
    /// to the same top-level response.
    attribute_pending: bool,
}

impl Parser {
    pub(crate) fn new(max_nesting: usize) -> Parser {
        Parser {
            stack: Vec::new(),
            max_nesting,
            root: None,
            attribute_pending: false,
        }
    }

    /// `true` while a top-level response is partially decoded.
    #[allow(dead_code)]
    pub(crate) fn in_response(&self) -> bool {
        !self.stack.is_empty() || self.attribute_pending
    }

    /// Decodes the next element from the front of `buf`.
    pub(crate) fn step<'a>(&mut self, buf: &'a [u8]) -> Result<Step<'a>, ParseError> {
        let Some(&marker) = buf.first() else {
            return Ok(Step::Incomplete);
        };
        // The header line always ends in CRLF; blob payloads follow it.
        let Some(line_end) = find_crlf(buf) else {
            return Ok(Step::Incomplete);
        };
        if line_end == 0 {
            return Err(ParseError::BadKindByte(b'\r'));
        }
        let header = &buf[1..line_end];
        let line_len = line_end + 2;
        let depth = self.stack.len();

        // End marker of a streamed aggregate.
        if marker == b'.' {
            match self.stack.last() {
                Some(None) => {
                    if !header.is_empty() {
                        return Err(ParseError::BadLength);
                    }
                    self.stack.pop();
                    let end_of_response = self.complete_child();
                    return Ok(Step::Item {
                        consumed: line_len,
                        node: None,
                        end_of_response,
                    });
                }
                _ => return Err(ParseError::BadKindByte(b'.')),
            }
        }

        let kind = Kind::from_byte(marker).ok_or(ParseError::BadKindByte(marker))?;
        if depth == 0 {
            self.root = Some(kind);
        }

        if kind.is_aggregate() {
            return self.step_aggregate(kind, header, line_len, depth);
        }

        match kind {
            Kind::BlobString | Kind::BlobError | Kind::VerbatimString => {
                self.step_blob(kind, buf, header, line_len, depth)
            }
            _ => self.step_inline(kind, header, line_len, depth),
        }
    }

    fn step_inline<'a>(
        &mut self,
        kind: Kind,
        header: &'a [u8],
        line_len: usize,
        depth: usize,
    ) -> Result<Step<'a>, ParseError> {
        match kind {
            Kind::SimpleString | Kind::SimpleError | Kind::BigNumber => {
                if std::str::from_utf8(header).is_err() {
                    return Err(ParseError::BadUtf8InInlineHeader);
                }
            }
            Kind::Number => {
                if atoi::<i64>(header).is_none() {
                    return Err(ParseError::BadLength);
                }
            }
            Kind::Double => {
                let text =
                    std::str::from_utf8(header).map_err(|_| ParseError::BadUtf8InInlineHeader)?;
                if text.parse::<f64>().is_err() {
                    return Err(ParseError::BadLength);
                }
            }
            Kind::Boolean => {
                if header != b"t" && header != b"f" {
                    return Err(ParseError::BadLength);
                }
            }
            Kind::Null => {
                if !header.is_empty() {
                    return Err(ParseError::BadLength);
                }
            }
            _ => {}
        }

        let end_of_response = self.complete_child();
        Ok(Step::Item {
            consumed: line_len,
            node: Some(Node {
                kind,
                aggregate_size: 1,
                depth,
                data: header,
            }),
            end_of_response,
        })
    }

    fn step_blob<'a>(
        &mut self,
        kind: Kind,
        buf: &'a [u8],
        header: &'a [u8],
        line_len: usize,
        depth: usize,
    ) -> Result<Step<'a>, ParseError> {
        // A null blob carries no payload and decodes as a Null leaf.
        if header == b"-1" {
            let end_of_response = self.complete_child();
            return Ok(Step::Item {
                consumed: line_len,
                node: Some(Node {
                    kind: Kind::Null,
                    aggregate_size: 1,
                    depth,
                    data: &[],
                }),
                end_of_response,
            });
        }
        // Chunked strings are not produced for any command this client
        // sends; reject the header instead of guessing.
        let len = atoi::<u64>(header).ok_or(ParseError::BadLength)?;
        let len = usize::try_from(len).map_err(|_| ParseError::BadLength)?;
        let total = line_len
            .checked_add(len)
            .and_then(|t| t.checked_add(2))
            .ok_or(ParseError::BadLength)?;
        if buf.len() < total {
            return Ok(Step::Incomplete);
        }
        if &buf[line_len + len..total] != b"\r\n" {
            return Err(ParseError::BadLength);
        }

        let end_of_response = self.complete_child();
        Ok(Step::Item {
            consumed: total,
            node: Some(Node {
                kind,
                aggregate_size: 1,
                depth,
                data: &buf[line_len..line_len + len],
            }),
            end_of_response,
        })
    }

    fn step_aggregate<'a>(
        &mut self,
        kind: Kind,
        header: &'a [u8],
        line_len: usize,
        depth: usize,
    ) -> Result<Step<'a>, ParseError> {
        // A null aggregate decodes as a Null leaf and opens no frame.
        if header == b"-1" {
            let end_of_response = self.complete_child();
            return Ok(Step::Item {
                consumed: line_len,
                node: Some(Node {
                    kind: Kind::Null,
                    aggregate_size: 1,
                    depth,
                    data: &[],
                }),
                end_of_response,
            });
        }

        if header == b"?" {
            if self.stack.len() >= self.max_nesting {
                return Err(ParseError::ProtocolNesting);
            }
            self.stack.push(None);
            return Ok(Step::Item {
                consumed: line_len,
                node: Some(Node {
                    kind,
                    aggregate_size: 0,
                    depth,
                    data: &[],
                }),
                end_of_response: false,
            });
        }

        let count = atoi::<u64>(header).ok_or(ParseError::BadLength)?;
        // Maps and attributes announce pairs; each pair is two child nodes.
        let children = if matches!(kind, Kind::Map | Kind::Attribute) {
            count.checked_mul(2).ok_or(ParseError::BadLength)?
        } else {
            count
        };

        let end_of_response = if children == 0 {
            self.complete_child()
        } else {
            if self.stack.len() >= self.max_nesting {
                return Err(ParseError::ProtocolNesting);
            }
            self.stack.push(Some(children));
            false
        };

        Ok(Step::Item {
            consumed: line_len,
            node: Some(Node {
                kind,
                aggregate_size: count,
                depth,
                data: &[],
            }),
            end_of_response,
        })
    }

    /// Records that one child value completed, popping every frame this
    /// fills up. Returns `true` when a top-level response finished.
    fn complete_child(&mut self) -> bool {
        while let Some(frame) = self.stack.last_mut() {
            match frame {
                // Streamed aggregates close on their end marker only.
                None => return false,
                Some(remaining) => {
                    *remaining -= 1;
                    if *remaining != 0 {
                        return false;
                    }
                    self.stack.pop();
                }
            }
        }

        // Back at depth 0. An attribute tree annotates the next value, so it
        // does not end the response on its own.
        if self.root == Some(Kind::Attribute) {
            self.attribute_pending = true;
            false
        } else {
            self.attribute_pending = false;
            true
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp3::OwnedNode;

    /// Feeds the whole buffer through the parser, collecting nodes until one
    /// top-level response completes. Panics on `Incomplete`.
    fn parse_one(parser: &mut Parser, mut buf: &[u8]) -> Vec<OwnedNode> {
        let mut nodes = Vec::new();
        loop {
            match parser.step(buf).unwrap() {
                Step::Incomplete => panic!("unexpected Incomplete with {buf:?} left"),
                Step::Item {
                    consumed,
                    node,
                    end_of_response,
                } => {
                    if let Some(node) = node {
                        nodes.push(node.to_owned());
                    }
                    buf = &buf[consumed..];
                    if end_of_response {
                        assert!(!parser.in_response());
                        return nodes;
                    }
                }
            }
        }
    }

    #[test]
    fn simple_string() {
        let mut parser = Parser::new(16);
        let nodes = parse_one(&mut parser, b"+OK\r\n");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, Kind::SimpleString);
        assert_eq!(&nodes[0].data[..], b"OK");
        assert_eq!(nodes[0].depth, 0);
        assert_eq!(nodes[0].aggregate_size, 1);
    }

    #[test]
    fn nested_array_depths() {
        let mut parser = Parser::new(16);
        let nodes = parse_one(&mut parser, b"*2\r\n*1\r\n:7\r\n+ok\r\n");
        let shape: Vec<(Kind, u64, usize)> = nodes
            .iter()
            .map(|n| (n.kind, n.aggregate_size, n.depth))
            .collect();
        assert_eq!(
            shape,
            vec![
                (Kind::Array, 2, 0),
                (Kind::Array, 1, 1),
                (Kind::Number, 1, 2),
                (Kind::SimpleString, 1, 1),
            ]
        );
    }

    #[test]
    fn map_counts_pairs() {
        let mut parser = Parser::new(16);
        let nodes = parse_one(&mut parser, b"%1\r\n+key\r\n:1\r\n");
        assert_eq!(nodes[0].kind, Kind::Map);
        assert_eq!(nodes[0].aggregate_size, 1);
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn blob_string_payload() {
        let mut parser = Parser::new(16);
        let nodes = parse_one(&mut parser, b"$10\r\nhello\r\nxyz\r\n");
        assert_eq!(nodes[0].kind, Kind::BlobString);
        assert_eq!(&nodes[0].data[..], b"hello\r\nxyz");
    }

    #[test]
    fn null_aggregate_is_a_null_leaf() {
        let mut parser = Parser::new(16);
        let nodes = parse_one(&mut parser, b"*-1\r\n");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, Kind::Null);
        let nodes = parse_one(&mut parser, b"$-1\r\n");
        assert_eq!(nodes[0].kind, Kind::Null);
    }

    #[test]
    fn empty_aggregate_completes_response() {
        let mut parser = Parser::new(16);
        let nodes = parse_one(&mut parser, b"*0\r\n");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].aggregate_size, 0);
    }

    #[test]
    fn streamed_aggregate_ends_on_marker() {
        let mut parser = Parser::new(16);
        let nodes = parse_one(&mut parser, b"*?\r\n:1\r\n:2\r\n.\r\n");
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].kind, Kind::Array);
        assert_eq!(nodes[1].depth, 1);
    }

    #[test]
    fn attribute_precedes_its_value() {
        let mut parser = Parser::new(16);
        let mut buf: &[u8] = b"|1\r\n+ttl\r\n:3600\r\n+value\r\n";
        let mut nodes = Vec::new();
        let mut ends = Vec::new();
        while !buf.is_empty() {
            match parser.step(buf).unwrap() {
                Step::Item {
                    consumed,
                    node,
                    end_of_response,
                } => {
                    nodes.push(node.unwrap().to_owned());
                    ends.push(end_of_response);
                    buf = &buf[consumed..];
                }
                Step::Incomplete => panic!("incomplete"),
            }
        }
        // The attribute tree does not end the response; the value does.
        assert_eq!(ends, vec![false, false, false, true]);
        assert_eq!(nodes[3].kind, Kind::SimpleString);
        assert_eq!(nodes[3].depth, 0);
    }

    #[test]
    fn resumes_across_refills() {
        let mut parser = Parser::new(16);
        let wire = b"*2\r\n$3\r\nfoo\r\n:42\r\n";
        // Any split point must yield Incomplete, never an error, and the
        // reassembled input must parse to the same nodes.
        for split in 0..wire.len() {
            let mut parser = Parser::new(16);
            let mut nodes = Vec::new();
            let mut buf = Vec::from(&wire[..split]);
            let mut rest = &wire[split..];
            loop {
                match parser.step(&buf).unwrap() {
                    Step::Incomplete => {
                        assert!(!rest.is_empty(), "complete input reported Incomplete");
                        buf.extend_from_slice(rest);
                        rest = &[];
                    }
                    Step::Item {
                        consumed,
                        node,
                        end_of_response,
                    } => {
                        if let Some(node) = node {
                            nodes.push(node.to_owned());
                        }
                        buf.drain(..consumed);
                        if end_of_response {
                            break;
                        }
                    }
                }
            }
            assert_eq!(nodes.len(), 3);
            assert_eq!(&nodes[1].data[..], b"foo");
        }
        let _ = parser;
    }

    #[test]
    fn nesting_bound_is_enforced() {
        let mut parser = Parser::new(2);
        let mut buf: &[u8] = b"*1\r\n*1\r\n*1\r\n:1\r\n";
        let mut result = Ok(());
        while !buf.is_empty() {
            match parser.step(buf) {
                Ok(Step::Item { consumed, .. }) => buf = &buf[consumed..],
                Ok(Step::Incomplete) => panic!("incomplete"),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        assert_eq!(result, Err(ParseError::ProtocolNesting));
    }

    #[test]
    fn rejects_unknown_kind_byte() {
        let mut parser = Parser::new(16);
        assert_eq!(
            parser.step(b"@oops\r\n").unwrap_err(),
            ParseError::BadKindByte(b'@')
        );
    }

    #[test]
    fn rejects_garbage_lengths() {
        let mut parser = Parser::new(16);
        assert_eq!(parser.step(b"$abc\r\n").unwrap_err(), ParseError::BadLength);
        let mut parser = Parser::new(16);
        assert_eq!(parser.step(b":1a\r\n").unwrap_err(), ParseError::BadLength);
    }

    #[test]
    fn rejects_stray_end_marker() {
        let mut parser = Parser::new(16);
        assert_eq!(
            parser.step(b".\r\n").unwrap_err(),
            ParseError::BadKindByte(b'.')
        );
    }

    #[test]
    fn incomplete_blob_consumes_nothing() {
        let mut parser = Parser::new(16);
        assert!(matches!(
            parser.step(b"$10\r\nhel").unwrap(),
            Step::Incomplete
        ));
        assert!(!parser.in_response());
    }

    #[test]
    fn boolean_and_null_validation() {
        let mut parser = Parser::new(16);
        let nodes = parse_one(&mut parser, b"#t\r\n");
        assert_eq!(nodes[0].kind, Kind::Boolean);
        assert_eq!(parser.step(b"#x\r\n").unwrap_err(), ParseError::BadLength);
        assert_eq!(parser.step(b"_x\r\n").unwrap_err(), ParseError::BadLength);
    }

    #[test]
    fn push_parses_like_an_aggregate() {
        let mut parser = Parser::new(16);
        let nodes = parse_one(&mut parser, b">2\r\n+pubsub\r\n+hi\r\n");
        assert_eq!(nodes[0].kind, Kind::Push);
        assert_eq!(nodes[0].aggregate_size, 2);
        assert_eq!(nodes[1].depth, 1);
        assert_eq!(nodes[2].depth, 1);
    }
}
