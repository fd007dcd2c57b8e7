//! HTTP/2 wire pieces: the 9-byte frame header codec, HPACK static
//! table and Huffman coding (RFC 7541 Appendices A and B), prefix
//! integer chains, and a callback-driven frame reader.
//!
//! The dynamic HPACK table is deliberately not implemented: any
//! incremental-indexing literal or non-zero table-size update surfaces
//! [`http_message::HttpError::UnsupportedData`], which should be
//! treated as terminal for the connection.

mod frame;
mod hpack;
mod huffman;
mod reader;
mod static_table;

pub use frame::{FrameHdr, FrameType, SettingType, StreamId};
pub use hpack::{
    decode_number_chain, decode_string, decode_string_alloc, decode_string_length,
    encode_header, encode_number_chain, encode_string, HpackHeaderEncoding,
};
pub use huffman::{decode_huffman, encode_huffman};
pub use reader::{
    DataFrame, GoawayFrame, HeaderPriority, Http2Reader, Http2Visitor, Setting, PRI_STR,
};
pub use static_table::static_table_lookup;

use netbuf::Buf;

/// Append the client connection preface.
pub fn write_pri_str(buf: &mut Buf) {
    buf.add_bytes(PRI_STR);
}
