use crate::{Headers, Method, TextCodec};

/// Parsed request: the target plus enough connection metadata to
/// reissue it.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub host: String,
    /// 0 when the `Host` header carried no explicit port.
    pub port: u16,
    pub uri: String,
    pub user_agent: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Either side of an HTTP/1.1 exchange.
#[derive(Debug, Clone)]
pub enum HttpMessage {
    Request(Request),
    Response(Response),
}

impl HttpMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            HttpMessage::Request(r) => &r.headers,
            HttpMessage::Response(r) => &r.headers,
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            HttpMessage::Request(r) => &r.body,
            HttpMessage::Response(r) => &r.body,
        }
    }

    pub fn content_type(&self) -> Option<String> {
        self.headers().content_type()
    }

    pub fn charset(&self) -> Option<String> {
        self.headers().charset()
    }

    pub fn codec(&self) -> TextCodec {
        self.headers().codec()
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            HttpMessage::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            HttpMessage::Request(r) => Some(r),
            _ => None,
        }
    }
}
