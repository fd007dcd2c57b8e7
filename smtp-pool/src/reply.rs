use nom::{
    branch::alt,
    bytes::streaming::{tag, take_till},
    IResult,
};

use netbuf::Parser;

/// A complete (possibly multi-line) ESMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

/// Coarse classification by the reply code's first digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// 2xx
    PositiveCompletion,
    /// 3xx
    PositiveIntermediate,
    /// 4xx
    TransientNegative,
    /// 5xx
    PermanentNegative,
    Other,
}

impl Reply {
    pub fn kind(&self) -> ReplyKind {
        match self.code / 100 {
            2 => ReplyKind::PositiveCompletion,
            3 => ReplyKind::PositiveIntermediate,
            4 => ReplyKind::TransientNegative,
            5 => ReplyKind::PermanentNegative,
            _ => ReplyKind::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ReplyKind::TransientNegative
    }

    pub fn is_permanent(&self) -> bool {
        self.kind() == ReplyKind::PermanentNegative
    }

    /// Single-line rendering for diagnostics and failure callbacks.
    pub fn to_message(&self) -> String {
        format!("{} {}", self.code, self.lines.join(" / "))
    }

    /// How long a queue should park a message that this reply bounced.
    /// Classic greylisting codes get the long wait.
    pub fn reschedule_wait_secs(&self) -> u64 {
        match self.code {
            421 | 450 => 300,
            _ => 60,
        }
    }
}

fn eol(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((tag("\r\n"), tag("\n")))(i)
}

fn reply_line(i: &[u8]) -> IResult<&[u8], (u16, bool, String)> {
    let (i, digits) = nom::bytes::streaming::take_while_m_n(3, 3, |c: u8| c.is_ascii_digit())(i)?;
    let code = digits
        .iter()
        .fold(0u16, |acc, &d| acc * 10 + u16::from(d - b'0'));
    let (i, sep) = nom::character::streaming::one_of(" -\r\n")(i)?;
    if sep == '\r' || sep == '\n' {
        // A bare "250\r\n" reply; the separator was the terminator.
        let (i, _) = if sep == '\r' { tag("\n")(i)? } else { (i, &b""[..]) };
        return Ok((i, (code, true, String::new())));
    }
    let (i, text) = take_till(|c| c == b'\r' || c == b'\n')(i)?;
    let (i, _) = eol(i)?;
    Ok((
        i,
        (
            code,
            sep == ' ',
            String::from_utf8_lossy(text).trim_end().to_string(),
        ),
    ))
}

/// Parse one complete reply from `parser`, consuming it. `Ok(None)`
/// when more bytes are needed (nothing consumed). A multi-line reply
/// must repeat the same code on every line.
pub fn parse_reply(parser: &mut Parser<'_>) -> Result<Option<Reply>, String> {
    let consumed;
    let reply = {
        let mut input = parser.peek();
        let total = input.len();
        let mut code: Option<u16> = None;
        let mut lines = Vec::new();
        loop {
            match reply_line(input) {
                Ok((rest, (line_code, is_last, text))) => {
                    match code {
                        Some(c) if c != line_code => {
                            return Err(format!(
                                "reply code changed mid-reply: {} then {}",
                                c, line_code
                            ));
                        }
                        _ => code = Some(line_code),
                    }
                    lines.push(text);
                    input = rest;
                    if is_last {
                        consumed = total - input.len();
                        break;
                    }
                }
                Err(nom::Err::Incomplete(_)) => return Ok(None),
                Err(_) => {
                    return Err(format!(
                        "syntax error parsing reply: {:?}",
                        String::from_utf8_lossy(&input[..input.len().min(64)])
                    ))
                }
            }
        }
        Reply {
            code: code.unwrap_or(0),
            lines,
        }
    };
    parser.consume(consumed);
    Ok(Some(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(bytes: &[u8]) -> Result<Option<Reply>, String> {
        let mut parser = Parser::new();
        parser.append(bytes);
        parse_reply(&mut parser)
    }

    #[test]
    fn single_line() {
        let reply = feed(b"220 mail.example.com ESMTP ready\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines, vec!["mail.example.com ESMTP ready"]);
        assert_eq!(reply.kind(), ReplyKind::PositiveCompletion);
    }

    #[test]
    fn multi_line_ehlo() {
        let reply = feed(b"250-mail.example.com\r\n250-STARTTLS\r\n250 AUTH PLAIN LOGIN\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(
            reply.lines,
            vec!["mail.example.com", "STARTTLS", "AUTH PLAIN LOGIN"]
        );
    }

    #[test]
    fn partial_consumes_nothing() {
        let mut parser = Parser::new();
        parser.append(b"250-mail.example.com\r\n250 ");
        assert!(parse_reply(&mut parser).unwrap().is_none());
        assert_eq!(parser.len(), 26);
        parser.append(b"DSN\r\n");
        let reply = parse_reply(&mut parser).unwrap().unwrap();
        assert_eq!(reply.lines.len(), 2);
        assert!(parser.is_empty());
    }

    #[test]
    fn mismatched_codes_rejected() {
        assert!(feed(b"250-one\r\n550 two\r\n").is_err());
    }

    #[test]
    fn greylist_waits() {
        let grey = feed(b"450 4.2.0 greylisted, try again later\r\n")
            .unwrap()
            .unwrap();
        assert!(grey.is_transient());
        assert_eq!(grey.reschedule_wait_secs(), 300);

        let other = feed(b"451 4.3.0 local error\r\n").unwrap().unwrap();
        assert_eq!(other.reschedule_wait_secs(), 60);
    }

    #[test]
    fn bare_code_line() {
        let reply = feed(b"250\r\n").unwrap().unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines, vec![""]);
    }
}
