use chrono::Utc;

use crate::{Headers, HttpError, Method};

/// Parameters for [`write_request`]. Empty strings mean "not provided";
/// anything not provided is either defaulted or taken from `headers`.
pub struct WriteRequest<'a> {
    pub method: Method,
    pub host: &'a str,
    /// Elided from the `Host` header when 0 or 80.
    pub port: u16,
    /// Defaults to `/`.
    pub uri: &'a str,
    pub user_agent: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub headers: Option<&'a Headers>,
    pub body: Option<&'a [u8]>,
    /// Declared length when the body bytes are sent separately.
    pub body_len: Option<u64>,
    pub charset: Option<&'a str>,
}

impl<'a> Default for WriteRequest<'a> {
    fn default() -> WriteRequest<'a> {
        WriteRequest {
            method: Method::Get,
            host: "",
            port: 0,
            uri: "",
            user_agent: None,
            content_type: None,
            headers: None,
            body: None,
            body_len: None,
            charset: None,
        }
    }
}

/// Parameters for [`write_response`].
pub struct WriteResponse<'a> {
    pub status: u16,
    /// Defaults to the standard phrase for `status`, or `Generic`.
    pub reason: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub headers: Option<&'a Headers>,
    pub body: Option<&'a [u8]>,
    pub body_len: Option<u64>,
    pub charset: Option<&'a str>,
}

impl<'a> Default for WriteResponse<'a> {
    fn default() -> WriteResponse<'a> {
        WriteResponse {
            status: 200,
            reason: None,
            content_type: None,
            headers: None,
            body: None,
            body_len: None,
            charset: None,
        }
    }
}

fn nonempty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn default_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Generic",
    }
}

struct BodyPlan<'a> {
    bytes: &'a [u8],
    declared_len: u64,
    /// A caller-supplied Content-Length header survives only when no
    /// body (bytes or declared length) was given.
    keep_custom_len: bool,
}

fn plan_body<'a>(
    headers: &Headers,
    body: Option<&'a [u8]>,
    body_len: Option<u64>,
) -> BodyPlan<'a> {
    let bytes = body.unwrap_or(&[]);
    if !bytes.is_empty() {
        return BodyPlan {
            bytes,
            declared_len: bytes.len() as u64,
            keep_custom_len: false,
        };
    }
    match body_len {
        Some(len) => BodyPlan {
            bytes: &[],
            declared_len: len,
            keep_custom_len: false,
        },
        None => BodyPlan {
            bytes: &[],
            declared_len: 0,
            keep_custom_len: headers.contains("Content-Length"),
        },
    }
}

/// The generated Content-Type value, or `None` when the caller's own
/// header should stand.
fn plan_content_type(
    headers: &Headers,
    content_type: Option<&str>,
    charset: Option<&str>,
) -> Option<String> {
    let base = match content_type {
        Some(ct) => ct.to_string(),
        None => {
            if headers.contains("Content-Type") {
                return None;
            }
            if charset.is_some() {
                "text/plain".to_string()
            } else {
                "application/octet-stream".to_string()
            }
        }
    };
    match charset {
        Some(cs) => Some(format!("{}; charset={}", base, cs)),
        None => Some(base),
    }
}

fn emit_headers(out: &mut Vec<u8>, headers: &Headers) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

fn emit_line(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Serialize a request. Caller headers come first in insertion order,
/// then the generated defaults (`Host`, `User-Agent`, `Content-Length`,
/// `Content-Type`, `Date`) for whatever the caller did not provide.
pub fn write_request(req: &WriteRequest<'_>) -> Result<Vec<u8>, HttpError> {
    let mut headers = req.headers.cloned().unwrap_or_default();

    let host = nonempty(Some(req.host));
    let user_agent = nonempty(req.user_agent);
    let content_type = nonempty(req.content_type);
    let charset = nonempty(req.charset);

    // A request without any host cannot be framed.
    if host.is_none() && !headers.contains("Host") {
        return Err(HttpError::InvalidUse);
    }

    // Parameters win over caller headers for the fields they cover.
    if host.is_some() {
        headers.remove("Host");
    }
    if user_agent.is_some() {
        headers.remove("User-Agent");
    }
    if content_type.is_some() {
        headers.remove("Content-Type");
    }

    let body = plan_body(&headers, req.body, req.body_len);
    if !body.keep_custom_len {
        headers.remove("Content-Length");
    }
    let gen_ct = plan_content_type(&headers, content_type, charset);

    let mut out = Vec::new();
    out.extend_from_slice(req.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(if req.uri.is_empty() {
        &b"/"[..]
    } else {
        req.uri.as_bytes()
    });
    out.extend_from_slice(b" HTTP/1.1\r\n");

    let has_date = headers.contains("Date");
    emit_headers(&mut out, &headers);

    if let Some(host) = host {
        if req.port == 0 || req.port == 80 {
            emit_line(&mut out, "Host", host);
        } else {
            emit_line(&mut out, "Host", &format!("{}:{}", host, req.port));
        }
    }
    if let Some(ua) = user_agent {
        emit_line(&mut out, "User-Agent", ua);
    }
    if !body.keep_custom_len {
        emit_line(&mut out, "Content-Length", &body.declared_len.to_string());
    }
    if let Some(ct) = &gen_ct {
        emit_line(&mut out, "Content-Type", ct);
    }
    if !has_date {
        emit_line(&mut out, "Date", &http_date());
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body.bytes);
    Ok(out)
}

/// Serialize a response; same header discipline as [`write_request`],
/// minus `Host` and `User-Agent`.
pub fn write_response(rsp: &WriteResponse<'_>) -> Result<Vec<u8>, HttpError> {
    let mut headers = rsp.headers.cloned().unwrap_or_default();

    let content_type = nonempty(rsp.content_type);
    let charset = nonempty(rsp.charset);
    if content_type.is_some() {
        headers.remove("Content-Type");
    }

    let body = plan_body(&headers, rsp.body, rsp.body_len);
    if !body.keep_custom_len {
        headers.remove("Content-Length");
    }
    let gen_ct = plan_content_type(&headers, content_type, charset);

    let mut out = Vec::new();
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(rsp.status.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(
        nonempty(rsp.reason)
            .unwrap_or_else(|| default_reason(rsp.status))
            .as_bytes(),
    );
    out.extend_from_slice(b"\r\n");

    let has_date = headers.contains("Date");
    emit_headers(&mut out, &headers);

    if !body.keep_custom_len {
        emit_line(&mut out, "Content-Length", &body.declared_len.to_string());
    }
    if let Some(ct) = &gen_ct {
        emit_line(&mut out, "Content-Type", ct);
    }
    if !has_date {
        emit_line(&mut out, "Date", &http_date());
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body.bytes);
    Ok(out)
}
