use std::convert::TryFrom;

use http_message::HttpError;
use netbuf::Parser;

use crate::{
    frame::{FrameHdr, FrameType, SettingType, StreamId},
    hpack::{decode_number_chain, decode_string_alloc, HpackHeaderEncoding},
    static_table::static_table_lookup,
};

/// The client connection preface, recognised (and emitted) verbatim.
pub const PRI_STR: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// One DATA frame's payload.
pub struct DataFrame<'a> {
    pub hdr: &'a FrameHdr,
    pub data: &'a [u8],
    pub pad: &'a [u8],
    pub pad_len: u8,
}

/// One SETTINGS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub ty: SettingType,
    pub value: u32,
}

/// A GOAWAY frame.
pub struct GoawayFrame<'a> {
    pub hdr: &'a FrameHdr,
    pub stream: StreamId,
    pub errcode: u32,
    pub debug_data: &'a [u8],
}

/// The priority block of a HEADERS frame (flag 0x20).
#[derive(Debug, Clone, Copy)]
pub struct HeaderPriority {
    pub stream: StreamId,
    pub weight: u8,
}

/// Callbacks driven by [`Http2Reader::read`]. Every method defaults to
/// "accept and ignore"; implement what you care about. Returning an
/// error from any callback stops the reader, which reports it to the
/// driver and to [`Http2Visitor::error`].
pub trait Http2Visitor {
    fn frame_begin(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        Ok(())
    }

    fn frame_end(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        Ok(())
    }

    fn data(&mut self, _data: &DataFrame<'_>) -> Result<(), HttpError> {
        Ok(())
    }

    fn settings_begin(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        Ok(())
    }

    fn setting(&mut self, _setting: Setting) -> Result<(), HttpError> {
        Ok(())
    }

    fn settings_end(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        Ok(())
    }

    fn headers_begin(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        Ok(())
    }

    fn header_priority(&mut self, _priority: &HeaderPriority) -> Result<(), HttpError> {
        Ok(())
    }

    /// One decoded header field. `value` is `None` for an indexed
    /// lookup of a key-only static entry.
    fn header(&mut self, _key: &str, _value: Option<&str>) -> Result<(), HttpError> {
        Ok(())
    }

    fn headers_end(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        Ok(())
    }

    fn goaway(&mut self, _goaway: &GoawayFrame<'_>) -> Result<(), HttpError> {
        Ok(())
    }

    /// The client connection preface was recognised.
    fn pri_str(&mut self) -> Result<(), HttpError> {
        Ok(())
    }

    /// A failure stopped the reader; `msg` is the reader's description
    /// of where. Not invoked for `MoreData`.
    fn error(&mut self, _err: &HttpError, _msg: &str) {}
}

/// Incremental HTTP/2 frame reader over the static HPACK table.
///
/// Feed byte chunks to [`Http2Reader::read`]; the visitor sees each
/// frame exactly once. On [`HttpError::MoreData`] no state past the
/// last completely parsed frame is advanced, so the caller re-feeds the
/// unconsumed tail plus whatever arrived since.
pub struct Http2Reader {
    errmsg: String,
}

impl Default for Http2Reader {
    fn default() -> Http2Reader {
        Http2Reader::new()
    }
}

impl Http2Reader {
    pub fn new() -> Http2Reader {
        Http2Reader {
            errmsg: String::new(),
        }
    }

    /// Description of the last failure, for diagnostics.
    pub fn error_message(&self) -> &str {
        &self.errmsg
    }

    /// Parse as many complete frames from `data` as possible. Returns
    /// the number of bytes consumed and the first failure, if any.
    pub fn read<V: Http2Visitor>(
        &mut self,
        visitor: &mut V,
        data: &[u8],
    ) -> (usize, Result<(), HttpError>) {
        let mut parser = Parser::from_slice(data);
        let skipped = parser.consume_whitespace();

        let res = self.read_frames(visitor, &mut parser);
        let len_read = parser.consumed() - skipped;

        if let Err(err) = &res {
            if *err != HttpError::MoreData {
                visitor.error(err, &self.errmsg);
            }
        }
        (len_read, res)
    }

    fn read_frames<V: Http2Visitor>(
        &mut self,
        visitor: &mut V,
        parser: &mut Parser<'_>,
    ) -> Result<(), HttpError> {
        if parser.peek().starts_with(PRI_STR) {
            visitor.pri_str()?;
            parser.consume(PRI_STR.len());
        }

        loop {
            // Peek the header: an oversized or partial frame must not
            // consume anything.
            parser.mark();
            let hdr = match FrameHdr::decode(parser) {
                Ok(Some(hdr)) => hdr,
                Ok(None) => {
                    parser.clear_mark();
                    return Ok(());
                }
                Err(err) => {
                    parser.rewind_to_mark();
                    self.errmsg = "invalid frame type".to_string();
                    return Err(err);
                }
            };
            if hdr.length as usize > parser.len() {
                parser.rewind_to_mark();
                return Err(HttpError::MoreData);
            }
            parser.clear_mark();

            visitor.frame_begin(&hdr)?;

            parser.mark();
            let res = match hdr.ty {
                FrameType::Data => self.read_data(visitor, &hdr, parser),
                FrameType::Headers => self.read_headers(visitor, &hdr, parser),
                FrameType::Settings => self.read_settings(visitor, &hdr, parser),
                FrameType::Goaway => self.read_goaway(visitor, &hdr, parser),
                other => {
                    self.errmsg = format!("unsupported frame type: {}", other.name());
                    Err(HttpError::UnsupportedData(other.name().to_string()))
                }
            };
            // Body readers leave the cursor wherever they stopped; the
            // frame header's length is authoritative.
            parser.rewind_to_mark();
            res?;
            parser.consume(hdr.length as usize);
            visitor.frame_end(&hdr)?;
        }
    }

    fn read_data<V: Http2Visitor>(
        &mut self,
        visitor: &mut V,
        hdr: &FrameHdr,
        parser: &mut Parser<'_>,
    ) -> Result<(), HttpError> {
        let is_padded = hdr.flags & 0x8 != 0;
        let mut pad_len: u8 = 0;
        if is_padded {
            pad_len = match parser.read_byte() {
                Some(b) => b,
                None => {
                    self.errmsg = "failed reading 1 byte into pad length".to_string();
                    return Err(HttpError::Internal);
                }
            };
        }
        let body_len = (hdr.length as usize)
            .saturating_sub(if is_padded { 1 } else { 0 })
            .saturating_sub(pad_len as usize);
        let payload = parser.peek();
        if payload.len() < body_len + pad_len as usize {
            self.errmsg = "pad length exceeds frame length".to_string();
            return Err(HttpError::ProtoFormat("bad DATA padding".to_string()));
        }
        let frame = DataFrame {
            hdr,
            data: &payload[..body_len],
            pad: &payload[body_len..body_len + pad_len as usize],
            pad_len,
        };
        visitor.data(&frame)
    }

    fn read_settings<V: Http2Visitor>(
        &mut self,
        visitor: &mut V,
        hdr: &FrameHdr,
        parser: &mut Parser<'_>,
    ) -> Result<(), HttpError> {
        visitor.settings_begin(hdr)?;

        let is_ack = hdr.flags & 0x1 != 0;
        if is_ack && hdr.length != 0 {
            self.errmsg = "settings ACK with non-zero length".to_string();
            return Err(HttpError::MisalignedSettings);
        }

        let mut len = hdr.length as usize;
        while len >= 6 {
            let ty_raw = match parser.read_be_u16() {
                Some(v) => v,
                None => {
                    self.errmsg = "read settings type failed".to_string();
                    return Err(HttpError::Internal);
                }
            };
            let ty = match SettingType::try_from(ty_raw) {
                Ok(ty) => ty,
                Err(err) => {
                    self.errmsg = format!("invalid setting type: {}", ty_raw);
                    return Err(err);
                }
            };
            let value = match parser.read_be_u32() {
                Some(v) => v,
                None => {
                    self.errmsg = "read settings value failed".to_string();
                    return Err(HttpError::Internal);
                }
            };
            visitor.setting(Setting { ty, value })?;
            len -= 6;
        }

        if len != 0 {
            self.errmsg = format!("settings misaligned, {} trailing bytes", len);
            return Err(HttpError::MisalignedSettings);
        }

        visitor.settings_end(hdr)
    }

    fn read_goaway<V: Http2Visitor>(
        &mut self,
        visitor: &mut V,
        hdr: &FrameHdr,
        parser: &mut Parser<'_>,
    ) -> Result<(), HttpError> {
        if hdr.length < 8 {
            self.errmsg = "goaway frame shorter than 8 bytes".to_string();
            return Err(HttpError::ProtoFormat("short GOAWAY".to_string()));
        }
        let stream = match StreamId::decode(parser) {
            Some(s) => s,
            None => {
                self.errmsg = "failed reading goaway stream".to_string();
                return Err(HttpError::Internal);
            }
        };
        let errcode = match parser.read_be_u32() {
            Some(v) => v,
            None => {
                self.errmsg = "failed reading goaway error code".to_string();
                return Err(HttpError::Internal);
            }
        };
        let debug_len = hdr.length as usize - 8;
        let frame = GoawayFrame {
            hdr,
            stream,
            errcode,
            debug_data: &parser.peek()[..debug_len],
        };
        visitor.goaway(&frame)
    }

    fn read_headers<V: Http2Visitor>(
        &mut self,
        visitor: &mut V,
        hdr: &FrameHdr,
        parser: &mut Parser<'_>,
    ) -> Result<(), HttpError> {
        visitor.headers_begin(hdr)?;

        let is_padded = hdr.flags & 0x8 != 0;
        let is_prioritized = hdr.flags & 0x20 != 0;
        let mut len = hdr.length as usize;
        let mut pad_len: u8 = 0;

        if is_padded {
            pad_len = match parser.read_byte() {
                Some(b) => b,
                None => {
                    self.errmsg = "failed reading 1 byte into pad length".to_string();
                    return Err(HttpError::Internal);
                }
            };
            len = len.saturating_sub(1);
        }

        if is_prioritized {
            let stream = match StreamId::decode(parser) {
                Some(s) => s,
                None => {
                    self.errmsg = "failed reading 4 bytes into priority stream".to_string();
                    return Err(HttpError::Internal);
                }
            };
            let weight = match parser.read_byte() {
                Some(b) => b,
                None => {
                    self.errmsg = "failed reading 1 byte into priority weight".to_string();
                    return Err(HttpError::Internal);
                }
            };
            visitor.header_priority(&HeaderPriority { stream, weight })?;
            len = len.saturating_sub(5);
        }

        while len > pad_len as usize {
            let before = parser.len();
            let byte = match parser.read_byte() {
                Some(b) => b,
                None => {
                    self.errmsg = "failed reading 1 byte into next header entry".to_string();
                    return Err(HttpError::Internal);
                }
            };
            let encoding = HpackHeaderEncoding::classify(byte);
            match encoding {
                HpackHeaderEncoding::Indexed => {
                    let idx = self.read_prefix_index(parser, byte, 0x7f, "6.1")?;
                    let (key, value) = self.table_lookup(idx)?;
                    visitor.header(key, value)?;
                }
                HpackHeaderEncoding::LiteralIncrementalKeyValue
                | HpackHeaderEncoding::LiteralKeyValue
                | HpackHeaderEncoding::NeverIndexedKeyValue => {
                    let key = match decode_string_alloc(parser) {
                        Some(k) => k,
                        None => {
                            self.errmsg = "failed reading header key".to_string();
                            return Err(HttpError::Internal);
                        }
                    };
                    let value = match decode_string_alloc(parser) {
                        Some(v) => v,
                        None => {
                            self.errmsg = "failed reading header value".to_string();
                            return Err(HttpError::Internal);
                        }
                    };
                    visitor.header(&key, Some(&value))?;
                    if encoding == HpackHeaderEncoding::LiteralIncrementalKeyValue {
                        return self.reject_dynamic_entry();
                    }
                }
                HpackHeaderEncoding::LiteralIncrementalIndexed
                | HpackHeaderEncoding::LiteralIndexed
                | HpackHeaderEncoding::NeverIndexedIndexed => {
                    let mask = if encoding == HpackHeaderEncoding::LiteralIncrementalIndexed {
                        0x3f
                    } else {
                        0x0f
                    };
                    let idx = self.read_prefix_index(parser, byte, mask, "6.2")?;
                    let (key, _) = self.table_lookup(idx)?;
                    let value = match decode_string_alloc(parser) {
                        Some(v) => v,
                        None => {
                            self.errmsg = "failed reading header value".to_string();
                            return Err(HttpError::Internal);
                        }
                    };
                    visitor.header(key, Some(&value))?;
                    if encoding == HpackHeaderEncoding::LiteralIncrementalIndexed {
                        return self.reject_dynamic_entry();
                    }
                }
                HpackHeaderEncoding::DynamicTableSize => {
                    let size = self.read_prefix_index(parser, byte, 0x1f, "6.3")?;
                    // A zero-size update is a no-op; anything else
                    // needs the dynamic table we do not keep.
                    if size != 0 {
                        self.errmsg = "unsupported dynamic table size > 0".to_string();
                        return Err(HttpError::UnsupportedData(
                            "dynamic table size".to_string(),
                        ));
                    }
                }
            }
            len = len.saturating_sub(before - parser.len());
        }

        visitor.headers_end(hdr)
    }

    fn read_prefix_index(
        &mut self,
        parser: &mut Parser<'_>,
        byte: u8,
        mask: u8,
        section: &str,
    ) -> Result<u64, HttpError> {
        let low = byte & mask;
        if low != mask {
            return Ok(u64::from(low));
        }
        match decode_number_chain(parser) {
            Some(ext) => Ok(u64::from(mask) + ext),
            None => {
                self.errmsg = format!("failed to read number chain (header type {})", section);
                Err(HttpError::Internal)
            }
        }
    }

    fn table_lookup(
        &mut self,
        idx: u64,
    ) -> Result<(&'static str, Option<&'static str>), HttpError> {
        if idx == 0 {
            self.errmsg = "table index must be > 0".to_string();
            return Err(HttpError::InvalidTableIndex);
        }
        match static_table_lookup(idx as usize) {
            Some(entry) => Ok(entry),
            None => {
                self.errmsg = format!("no static table entry at index {}", idx);
                Err(HttpError::InvalidTableIndex)
            }
        }
    }

    fn reject_dynamic_entry(&mut self) -> Result<(), HttpError> {
        // The header was already delivered; the stream is still
        // poisoned because we keep no dynamic table to honor the
        // insert. Terminal for this connection.
        self.errmsg = "unsupported dynamic table entries".to_string();
        Err(HttpError::UnsupportedData("dynamic table entry".to_string()))
    }
}
