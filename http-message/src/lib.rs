//! HTTP/1.1 message model: case-preserving header multimap, request and
//! response types, a simple writer producing RFC 7230 framing, and a
//! resumable pull parser that never consumes bytes it has not fully
//! understood.

mod error;
mod headers;
mod message;
mod method;
mod read;
mod textcodec;
mod write;

pub use error::HttpError;
pub use headers::{HeaderValue, Headers};
pub use message::{HttpMessage, Request, Response};
pub use method::Method;
pub use read::{read_message, ReadResult};
pub use textcodec::TextCodec;
pub use write::{write_request, write_response, WriteRequest, WriteResponse};
