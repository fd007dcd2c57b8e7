use http_message::Headers;

/// Metadata pulled out of a raw message so callbacks can identify it
/// and the session knows the envelope to use.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    pub headers: Headers,
    pub from: Option<String>,
    pub rcpts: Vec<String>,
}

/// Extract an addr-spec from a header value: the `<...>` form when
/// present, otherwise the first token containing an `@`.
fn extract_addr(value: &str) -> Option<String> {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            let addr = value[start + 1..end].trim();
            if !addr.is_empty() {
                return Some(addr.to_string());
            }
        }
    }
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .find(|tok| tok.contains('@'))
        .map(|tok| tok.trim_matches(|c| c == '"' || c == ';').to_string())
}

fn extract_addrs(value: &str, out: &mut Vec<String>) {
    for part in value.split(',') {
        if let Some(addr) = extract_addr(part) {
            if !out.iter().any(|a| a.eq_ignore_ascii_case(&addr)) {
                out.push(addr);
            }
        }
    }
}

/// Parse the header block of a raw RFC 5322 message. Tolerates bare LF
/// line endings and folded header continuation lines.
pub fn parse_meta(raw: &str) -> MessageMeta {
    let mut meta = MessageMeta::default();
    let mut last_name: Option<String> = None;

    for line in raw.lines() {
        if line.is_empty() {
            break; // end of the header block
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation; append to the previous header.
            if let Some(name) = &last_name {
                let existing = meta.headers.get(name).unwrap_or_default();
                meta.headers
                    .set(name, &format!("{} {}", existing, line.trim()));
            }
            continue;
        }
        let (name, value) = match line.split_once(':') {
            Some(nv) => nv,
            None => continue,
        };
        let name = name.trim();
        let value = value.trim();
        meta.headers.add(name, value);
        last_name = Some(name.to_string());
    }

    if let Some(from) = meta.headers.get("From") {
        meta.from = extract_addr(&from);
    }
    for field in &["To", "Cc", "Bcc"] {
        if let Some(value) = meta.headers.get(field) {
            let mut rcpts = std::mem::take(&mut meta.rcpts);
            extract_addrs(&value, &mut rcpts);
            meta.rcpts = rcpts;
        }
    }

    meta
}

/// Prepare a raw message body for the DATA phase: normalize line
/// endings to CRLF, escape leading dots, and terminate with
/// `CRLF . CRLF`.
pub fn dot_stuff(raw: &str) -> Vec<u8> {
    let mut lines: Vec<&str> = raw.split('\n').collect();
    if raw.ends_with('\n') {
        lines.pop();
    }
    let mut out = Vec::with_capacity(raw.len() + 8);
    for line in lines {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push(b'.');
        }
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_extraction() {
        let raw = "From: Alice Example <alice@example.com>\r\n\
                   To: bob@example.net, \"C\" <carol@example.org>\r\n\
                   Subject: hello\r\n\
                   Message-Id: <abc@example.com>\r\n\
                   \r\n\
                   body\r\n";
        let meta = parse_meta(raw);
        assert_eq!(meta.from.as_deref(), Some("alice@example.com"));
        assert_eq!(meta.rcpts, vec!["bob@example.net", "carol@example.org"]);
        assert_eq!(meta.headers.get("Subject").unwrap(), "hello");
    }

    #[test]
    fn folded_headers() {
        let raw = "Subject: a very\r\n long subject\r\n\r\n";
        let meta = parse_meta(raw);
        assert_eq!(meta.headers.get("Subject").unwrap(), "a very long subject");
    }

    #[test]
    fn dot_stuffing() {
        let out = dot_stuff("line one\n.hidden\nlast");
        assert_eq!(out, b"line one\r\n..hidden\r\nlast\r\n.\r\n".to_vec());
    }

    #[test]
    fn dot_stuffing_trailing_newline() {
        let out = dot_stuff("msg\r\n");
        assert_eq!(out, b"msg\r\n.\r\n".to_vec());
    }
}
