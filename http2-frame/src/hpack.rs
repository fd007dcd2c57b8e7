use netbuf::{Buf, Parser};

use crate::{
    huffman::{decode_huffman, encode_huffman},
    static_table::STATIC_TABLE,
};

/// The HPACK header field representations, named for their RFC 7541
/// sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpackHeaderEncoding {
    /// §6.1 indexed key and value.
    Indexed,
    /// §6.2.1 literal with incremental indexing, new key and value.
    LiteralIncrementalKeyValue,
    /// §6.2.1 literal with incremental indexing, indexed key.
    LiteralIncrementalIndexed,
    /// §6.2.2 literal without indexing, new key and value.
    LiteralKeyValue,
    /// §6.2.2 literal without indexing, indexed key.
    LiteralIndexed,
    /// §6.2.3 literal never indexed, new key and value.
    NeverIndexedKeyValue,
    /// §6.2.3 literal never indexed, indexed key.
    NeverIndexedIndexed,
    /// §6.3 dynamic table size update.
    DynamicTableSize,
}

impl HpackHeaderEncoding {
    /// Classify the first byte of a header block entry.
    pub fn classify(byte: u8) -> HpackHeaderEncoding {
        if byte & 0x80 == 0x80 {
            return HpackHeaderEncoding::Indexed;
        }
        if byte == 0x40 {
            return HpackHeaderEncoding::LiteralIncrementalKeyValue;
        }
        if byte & 0xc0 == 0x40 {
            return HpackHeaderEncoding::LiteralIncrementalIndexed;
        }
        if byte == 0x00 {
            return HpackHeaderEncoding::LiteralKeyValue;
        }
        if byte & 0xf0 == 0x00 {
            return HpackHeaderEncoding::LiteralIndexed;
        }
        if byte == 0x10 {
            return HpackHeaderEncoding::NeverIndexedKeyValue;
        }
        if byte & 0xf0 == 0x10 {
            return HpackHeaderEncoding::NeverIndexedIndexed;
        }
        // Remaining pattern is (byte & 0xe0) == 0x20.
        HpackHeaderEncoding::DynamicTableSize
    }
}

/// Append the 7-bit-per-byte continuation encoding of `num`.
pub fn encode_number_chain(mut num: u64, buf: &mut Buf) {
    loop {
        let byte = (num & 0x7f) as u8;
        num >>= 7;
        if num > 0 {
            buf.add_byte(0x80 | byte);
        } else {
            buf.add_byte(byte);
            break;
        }
    }
}

/// Accumulate a continuation chain, least-significant group first (the
/// RFC 7541 §5.1 direction, matching [`encode_number_chain`]). `None`
/// when the parser runs dry first or the value overflows 64 bits.
pub fn decode_number_chain(parser: &mut Parser<'_>) -> Option<u64> {
    let mut num: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = parser.read_byte()?;
        if shift >= 64 {
            return None;
        }
        num |= u64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Some(num);
        }
    }
}

/// Read a string length prefix: high bit = Huffman flag, low 7 bits the
/// length, with `0x7F` extended by a number chain.
pub fn decode_string_length(parser: &mut Parser<'_>) -> Option<(u64, bool)> {
    const MASK: u8 = 0x7f;
    let byte = parser.read_byte()?;
    let is_huffman = byte & 0x80 != 0;
    let low = byte & MASK;
    if low != MASK {
        return Some((u64::from(low), is_huffman));
    }
    let ext = decode_number_chain(parser)?;
    Some((ext + u64::from(MASK), is_huffman))
}

/// Decode a length-prefixed (possibly Huffman-coded) string into `buf`.
pub fn decode_string(parser: &mut Parser<'_>, buf: &mut Buf) -> bool {
    let (len, is_huffman) = match decode_string_length(parser) {
        Some(v) => v,
        None => return false,
    };
    let len = len as usize;
    if parser.len() < len {
        return false;
    }
    if is_huffman {
        let ok = {
            let bytes = &parser.peek()[..len];
            decode_huffman(bytes, buf)
        };
        if !ok {
            return false;
        }
        parser.consume(len);
        return true;
    }
    let bytes = parser.read_bytes(len).expect("length checked");
    buf.add_bytes(bytes);
    true
}

/// Decode a string as owned UTF-8 (lossy for non-UTF-8 octets).
pub fn decode_string_alloc(parser: &mut Parser<'_>) -> Option<String> {
    let mut buf = Buf::new();
    if !decode_string(parser, &mut buf) {
        return None;
    }
    Some(String::from_utf8_lossy(buf.peek()).to_string())
}

/// Append a Huffman-coded, length-prefixed string. The empty string is
/// the single byte `0x80`.
pub fn encode_string(s: &str, buf: &mut Buf) {
    if s.is_empty() {
        buf.add_byte(0x80);
        return;
    }
    let mut encoded = Buf::new();
    encode_huffman(s.as_bytes(), &mut encoded);
    let len = encoded.len();
    if len < 0x7f {
        buf.add_byte(0x80 | len as u8);
    } else {
        buf.add_byte(0xff);
        encode_number_chain(len as u64 - 0x7f, buf);
    }
    buf.add_bytes(encoded.peek());
}

/// Append one header field, preferring the static table: a full match
/// emits the §6.1 indexed form, a key-only match the §6.2.2 indexed-key
/// literal, anything else the §6.2.2 key-value literal.
pub fn encode_header(key: &str, value: &str, buf: &mut Buf) {
    for (idx, (tkey, tval)) in STATIC_TABLE.iter().enumerate().skip(1) {
        if *tkey != key {
            continue;
        }
        if *tval == Some(value) {
            buf.add_byte(0x80 | idx as u8);
            return;
        }
        if tval.is_none() {
            if idx < 0x0f {
                buf.add_byte(idx as u8);
            } else {
                buf.add_byte(0x0f);
                encode_number_chain(idx as u64 - 0x0f, buf);
            }
            encode_string(value, buf);
            return;
        }
    }
    buf.add_byte(0x00);
    encode_string(key, buf);
    encode_string(value, buf);
}
