//!
//! RESP3 data model: kinds and response nodes.
//!
//! A server reply is a tree. The parser flattens it into a pre-order
//! sequence of [`Node`]s; aggregate nodes carry their child count and leaves
//! carry their payload. Reassembling a tree (or any user container) from the
//! sequence is the adapter's job.
//!

use bytes::Bytes;

/// The RESP3 data kinds, one per wire marker byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// `+` a short line of text.
    SimpleString,
    /// `-` a short error line.
    SimpleError,
    /// `:` a signed 64 bit integer.
    Number,
    /// `$` a length prefixed binary string.
    BlobString,
    /// `*` a heterogeneous sequence.
    Array,
    /// `_` the absence of a value.
    Null,
    /// `,` a double precision float.
    Double,
    /// `#` `t` or `f`.
    Boolean,
    /// `!` a length prefixed error string.
    BlobError,
    /// `=` a blob carrying a three letter format prefix.
    VerbatimString,
    /// `(` an integer of arbitrary precision, transmitted as text.
    BigNumber,
    /// `%` a sequence of key value pairs.
    Map,
    /// `~` an unordered sequence.
    Set,
    /// `|` auxiliary data attached to the next value.
    Attribute,
    /// `>` a server initiated message, not tied to any request.
    Push,
}

impl Kind {
    /// Maps a wire marker byte to its kind.
    pub fn from_byte(byte: u8) -> Option<Kind> {
        match byte {
            b'+' => Some(Kind::SimpleString),
            b'-' => Some(Kind::SimpleError),
            b':' => Some(Kind::Number),
            b'$' => Some(Kind::BlobString),
            b'*' => Some(Kind::Array),
            b'_' => Some(Kind::Null),
            b',' => Some(Kind::Double),
            b'#' => Some(Kind::Boolean),
            b'!' => Some(Kind::BlobError),
            b'=' => Some(Kind::VerbatimString),
            b'(' => Some(Kind::BigNumber),
            b'%' => Some(Kind::Map),
            b'~' => Some(Kind::Set),
            b'|' => Some(Kind::Attribute),
            b'>' => Some(Kind::Push),
            _ => None,
        }
    }

    /// The wire marker byte of this kind.
    pub fn to_byte(self) -> u8 {
        match self {
            Kind::SimpleString => b'+',
            Kind::SimpleError => b'-',
            Kind::Number => b':',
            Kind::BlobString => b'$',
            Kind::Array => b'*',
            Kind::Null => b'_',
            Kind::Double => b',',
            Kind::Boolean => b'#',
            Kind::BlobError => b'!',
            Kind::VerbatimString => b'=',
            Kind::BigNumber => b'(',
            Kind::Map => b'%',
            Kind::Set => b'~',
            Kind::Attribute => b'|',
            Kind::Push => b'>',
        }
    }

    /// `true` for kinds that contain child values.
    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            Kind::Array | Kind::Map | Kind::Set | Kind::Attribute | Kind::Push
        )
    }

    /// `true` for the two error kinds.
    pub fn is_error(self) -> bool {
        matches!(self, Kind::SimpleError | Kind::BlobError)
    }
}

/// One element of a reply, in pre-order.
///
/// `data` borrows the connection's read buffer and is only valid for the
/// duration of the adapter callback; copy it before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node<'a> {
    /// The RESP3 kind of this element.
    pub kind: Kind,
    /// The announced child count for aggregate kinds, 1 for leaves.
    pub aggregate_size: u64,
    /// Depth within the reply tree; the root sits at 0.
    pub depth: usize,
    /// The payload for leaves; empty for aggregates.
    pub data: &'a [u8],
}

impl Node<'_> {
    /// Copies the node payload out of the read buffer.
    pub fn to_owned(&self) -> OwnedNode {
        OwnedNode {
            kind: self.kind,
            aggregate_size: self.aggregate_size,
            depth: self.depth,
            data: Bytes::copy_from_slice(self.data),
        }
    }
}

/// An owning [`Node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedNode {
    /// The RESP3 kind of this element.
    pub kind: Kind,
    /// The announced child count for aggregate kinds, 1 for leaves.
    pub aggregate_size: u64,
    /// Depth within the reply tree; the root sits at 0.
    pub depth: usize,
    /// The payload for leaves; empty for aggregates.
    pub data: Bytes,
}
