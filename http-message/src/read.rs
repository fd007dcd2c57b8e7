use nom::{
    branch::alt,
    bytes::streaming::{tag, take_till, take_till1, take_while, take_while1},
    character::streaming::char,
    combinator::{map, opt},
    sequence::{preceded, terminated, tuple},
    IResult,
};

use netbuf::Parser;

use crate::{Headers, HttpError, HttpMessage, Method, Request, Response};

/// Outcome of one [`read_message`] attempt.
pub enum ReadResult {
    /// A complete message; its bytes were consumed from the parser.
    Success(HttpMessage),
    /// Not enough bytes yet. Nothing was consumed; append more wire
    /// data and call again.
    MoreData,
    /// A syntactically complete message with no `Content-Length` and no
    /// chunked framing: the body is everything received so far, but
    /// only a disconnect proves it is whole. Nothing was consumed, so
    /// a later call (with more data appended) re-parses seamlessly.
    SuccessMorePossible(HttpMessage),
}

enum StartLine {
    Request { method: Method, target: String },
    Response { status: u16, reason: String },
}

fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

// Serializers emit CRLF; the reader also tolerates bare LF.
fn eol(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((tag("\r\n"), tag("\n")))(i)
}

fn till_eol(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_till(|c| c == b'\r' || c == b'\n')(i)
}

fn sp(i: &[u8]) -> IResult<&[u8], ()> {
    map(take_while1(|c| c == b' '), |_| ())(i)
}

fn ascii_u16(i: &[u8]) -> IResult<&[u8], u16> {
    let (i, digits) = take_while1(|c: u8| c.is_ascii_digit())(i)?;
    let mut n: u32 = 0;
    for &d in digits {
        n = n.saturating_mul(10) + u32::from(d - b'0');
    }
    if n > u32::from(u16::MAX) {
        return Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    Ok((i, n as u16))
}

fn http_version(i: &[u8]) -> IResult<&[u8], ()> {
    map(
        tuple((tag("HTTP/1."), take_while1(|c: u8| c.is_ascii_digit()))),
        |_| (),
    )(i)
}

fn response_line(i: &[u8]) -> IResult<&[u8], StartLine> {
    map(
        terminated(
            tuple((
                http_version,
                preceded(sp, ascii_u16),
                opt(preceded(sp, till_eol)),
            )),
            eol,
        ),
        |(_, status, reason)| StartLine::Response {
            status,
            reason: reason
                .map(|r| String::from_utf8_lossy(r).trim().to_string())
                .unwrap_or_default(),
        },
    )(i)
}

fn request_line(i: &[u8]) -> IResult<&[u8], StartLine> {
    let (i, method) = take_while1(is_token_char)(i)?;
    let method = match std::str::from_utf8(method)
        .ok()
        .and_then(|m| m.parse::<Method>().ok())
    {
        Some(m) => m,
        None => {
            return Err(nom::Err::Error(nom::error::Error::new(
                i,
                nom::error::ErrorKind::Tag,
            )))
        }
    };
    map(
        terminated(
            tuple((
                preceded(sp, take_till1(|c| c == b' ')),
                preceded(sp, http_version),
            )),
            eol,
        ),
        move |(target, _)| StartLine::Request {
            method,
            target: String::from_utf8_lossy(target).to_string(),
        },
    )(i)
}

fn start_line(i: &[u8]) -> IResult<&[u8], StartLine> {
    alt((response_line, request_line))(i)
}

fn header_line(i: &[u8]) -> IResult<&[u8], (String, String)> {
    map(
        terminated(
            tuple((
                take_while1(is_token_char),
                preceded(
                    tuple((char(':'), take_while(|c| c == b' ' || c == b'\t'))),
                    till_eol,
                ),
            )),
            eol,
        ),
        |(name, value)| {
            (
                String::from_utf8_lossy(name).to_string(),
                String::from_utf8_lossy(value).trim_end().to_string(),
            )
        },
    )(i)
}

fn head(i: &[u8]) -> IResult<&[u8], (StartLine, Vec<(String, String)>)> {
    tuple((start_line, nom::multi::many_till(header_line, eol)))(i)
        .map(|(rest, (start, (headers, _)))| (rest, (start, headers)))
}

enum ChunkErr {
    More,
    Bad(&'static str),
}

/// Decode a chunked body. Returns (bytes consumed from `input`,
/// assembled body) once the terminating chunk and trailers are whole.
fn parse_chunked(input: &[u8]) -> Result<(usize, Vec<u8>), ChunkErr> {
    let mut pos = 0;
    let mut body = Vec::new();

    fn take_line(input: &[u8], pos: &mut usize) -> Result<Vec<u8>, ChunkErr> {
        let rest = &input[*pos..];
        match memchr::memchr(b'\n', rest) {
            Some(nl) => {
                let mut line = &rest[..nl];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                *pos += nl + 1;
                Ok(line.to_vec())
            }
            None => Err(ChunkErr::More),
        }
    }

    loop {
        let size_line = take_line(input, &mut pos)?;
        // Chunk extensions after ';' are ignored.
        let size_str = size_line.split(|&c| c == b';').next().unwrap_or(&[]);
        let size_str = std::str::from_utf8(size_str)
            .map_err(|_| ChunkErr::Bad("chunk size not ascii"))?
            .trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ChunkErr::Bad("invalid chunk size"))?;

        if size == 0 {
            // Trailer section: lines until a blank one.
            loop {
                let line = take_line(input, &mut pos)?;
                if line.is_empty() {
                    return Ok((pos, body));
                }
            }
        }

        if input.len() - pos < size {
            return Err(ChunkErr::More);
        }
        body.extend_from_slice(&input[pos..pos + size]);
        pos += size;

        let sep = take_line(input, &mut pos)?;
        if !sep.is_empty() {
            return Err(ChunkErr::Bad("chunk data not terminated"));
        }
    }
}

fn split_host_port(host: &str) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((h, p)) => match p.parse::<u16>() {
            Ok(port) => (h.to_string(), port),
            Err(_) => (host.to_string(), 0),
        },
        None => (host.to_string(), 0),
    }
}

fn build(start: StartLine, headers: Headers, body: Vec<u8>) -> HttpMessage {
    match start {
        StartLine::Request { method, target } => {
            let (host, port) = headers
                .get("Host")
                .map(|h| split_host_port(&h))
                .unwrap_or_default();
            let user_agent = headers.get("User-Agent");
            HttpMessage::Request(Request {
                method,
                host,
                port,
                uri: target,
                user_agent,
                headers,
                body,
            })
        }
        StartLine::Response { status, reason } => HttpMessage::Response(Response {
            status,
            reason,
            headers,
            body,
        }),
    }
}

/// Pull one message out of `parser`.
///
/// Feeding partial bytes is always safe: on [`ReadResult::MoreData`]
/// and [`ReadResult::SuccessMorePossible`] nothing is consumed, so the
/// caller appends more wire data and calls again. Only a
/// [`ReadResult::Success`] consumes the message's bytes.
pub fn read_message(parser: &mut Parser<'_>) -> Result<ReadResult, HttpError> {
    let consumed_total;
    let result = {
        let input = parser.peek();
        let (rest, (start, raw_headers)) = match head(input) {
            Ok(v) => v,
            Err(nom::Err::Incomplete(_)) => return Ok(ReadResult::MoreData),
            Err(_) => {
                return Err(HttpError::ProtoFormat("malformed message head".to_string()))
            }
        };
        let head_len = input.len() - rest.len();

        let mut headers = Headers::new();
        for (name, value) in &raw_headers {
            headers.add(name, value);
        }

        let content_length = headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let chunked = headers
            .get("Transfer-Encoding")
            .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"));

        if chunked {
            match parse_chunked(rest) {
                Ok((chunk_len, body)) => {
                    consumed_total = head_len + chunk_len;
                    build(start, headers, body)
                }
                Err(ChunkErr::More) => return Ok(ReadResult::MoreData),
                Err(ChunkErr::Bad(msg)) => {
                    return Err(HttpError::ProtoFormat(msg.to_string()))
                }
            }
        } else if let Some(len) = content_length {
            let len = len as usize;
            if rest.len() < len {
                return Ok(ReadResult::MoreData);
            }
            consumed_total = head_len + len;
            build(start, headers, rest[..len].to_vec())
        } else {
            // No framing information: tentatively complete.
            let msg = build(start, headers, rest.to_vec());
            return Ok(ReadResult::SuccessMorePossible(msg));
        }
    };
    parser.consume(consumed_total);
    Ok(ReadResult::Success(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(bytes: &[u8]) -> ReadResult {
        let mut parser = Parser::new();
        parser.append(bytes);
        read_message(&mut parser).unwrap()
    }

    #[test]
    fn request_with_content_length() {
        let wire = b"GET /cgi/bin/blah HTTP/1.1\r\n\
            Host: example.com\r\n\
            User-Agent: simple-writer\r\n\
            Content-Length: 26\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            This is\ndata\n\n\nThat I have";
        match parse_all(wire) {
            ReadResult::Success(HttpMessage::Request(req)) => {
                assert_eq!(req.method, Method::Get);
                assert_eq!(req.host, "example.com");
                assert_eq!(req.port, 0);
                assert_eq!(req.uri, "/cgi/bin/blah");
                assert_eq!(req.user_agent.as_deref(), Some("simple-writer"));
                assert_eq!(req.body, b"This is\ndata\n\n\nThat I have");
                assert_eq!(req.headers.content_type().unwrap(), "text/plain");
            }
            _ => panic!("expected complete request"),
        }
    }

    #[test]
    fn partial_input_consumes_nothing() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel";
        let mut parser = Parser::new();
        parser.append(wire);
        match read_message(&mut parser).unwrap() {
            ReadResult::MoreData => {}
            _ => panic!("expected MoreData"),
        }
        assert_eq!(parser.len(), wire.len());
        parser.append(b"lo");
        match read_message(&mut parser).unwrap() {
            ReadResult::Success(HttpMessage::Response(rsp)) => {
                assert_eq!(rsp.status, 200);
                assert_eq!(rsp.reason, "OK");
                assert_eq!(rsp.body, b"hello");
            }
            _ => panic!("expected complete response"),
        }
        assert_eq!(parser.len(), 0);
    }

    #[test]
    fn no_framing_is_tentative() {
        let wire = b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\npartial body";
        let mut parser = Parser::new();
        parser.append(wire);
        match read_message(&mut parser).unwrap() {
            ReadResult::SuccessMorePossible(HttpMessage::Response(rsp)) => {
                assert_eq!(rsp.body, b"partial body");
            }
            _ => panic!("expected SuccessMorePossible"),
        }
        // Nothing consumed: more data extends the same message.
        parser.append(b" grows");
        match read_message(&mut parser).unwrap() {
            ReadResult::SuccessMorePossible(HttpMessage::Response(rsp)) => {
                assert_eq!(rsp.body, b"partial body grows");
            }
            _ => panic!("expected SuccessMorePossible"),
        }
    }

    #[test]
    fn chunked_body_reassembles() {
        let wire = b"HTTP/1.1 200 OK\r\n\
            Transfer-Encoding: chunked\r\n\
            \r\n\
            4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\ntrailing-garbage";
        let mut parser = Parser::new();
        parser.append(wire);
        match read_message(&mut parser).unwrap() {
            ReadResult::Success(HttpMessage::Response(rsp)) => {
                assert_eq!(rsp.body, b"Wikipedia");
            }
            _ => panic!("expected complete response"),
        }
        assert_eq!(parser.peek(), b"trailing-garbage");
    }

    #[test]
    fn bare_lf_tolerated() {
        let wire = b"HTTP/1.1 404 Not Found\nContent-Length: 0\n\n";
        match parse_all(wire) {
            ReadResult::Success(HttpMessage::Response(rsp)) => {
                assert_eq!(rsp.status, 404);
                assert_eq!(rsp.reason, "Not Found");
            }
            _ => panic!("expected complete response"),
        }
    }

    #[test]
    fn malformed_head_is_format_error() {
        let mut parser = Parser::new();
        parser.append(b"NOT A VALID START LINE\x01\r\n\r\n");
        assert!(read_message(&mut parser).is_err());
    }

    #[test]
    fn host_port_split() {
        let wire = b"GET / HTTP/1.1\r\nHost: example2.com:443\r\nContent-Length: 0\r\n\r\n";
        match parse_all(wire) {
            ReadResult::Success(HttpMessage::Request(req)) => {
                assert_eq!(req.host, "example2.com");
                assert_eq!(req.port, 443);
            }
            _ => panic!("expected request"),
        }
    }
}
