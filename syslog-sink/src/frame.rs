use chrono::Local;

/// Syslog facility codes (RFC 3164 §4.1.1, divided by 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facility {
    Kern = 0,
    User = 1,
    Mail = 2,
    Daemon = 3,
    Auth = 4,
    Syslog = 5,
    Lpr = 6,
    News = 7,
    Uucp = 8,
    Cron = 9,
    AuthPriv = 10,
    Local0 = 16,
    Local1 = 17,
    Local2 = 18,
    Local3 = 19,
    Local4 = 20,
    Local5 = 21,
    Local6 = 22,
    Local7 = 23,
}

/// Syslog severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

/// Upper bound on one syslog payload.
pub(crate) const MAX_CHARS: usize = 1024;

/// Tabs are not allowed in the payload; the replacement must contain
/// no CR, LF, or NUL.
pub(crate) const TAB_REPLACE: &str = "    ";

pub(crate) const LINE_END: &str = "\n";

fn truncate_at_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Build one RFC 3164 payload with RFC 6587 octet-count framing:
/// `<len> SP <pri+header+msg>`.
///
/// The header formatting is strict per RFC 3164 pages 7-10: `Mmm dd`
/// with a space-padded day, then `hh:mm:ss host product: `.
pub(crate) fn frame_message(
    msg: &str,
    facility: Facility,
    priority: Priority,
    src_host: &str,
    product: &str,
) -> Vec<u8> {
    let pri = (facility as u8) * 8 + (priority as u8);
    let product: String = product.chars().take(32).collect();
    let mut payload = format!(
        "<{}>{} {} {}: ",
        pri,
        Local::now().format("%b %e %H:%M:%S"),
        src_host,
        product
    );
    payload.push_str(&msg.replace('\t', TAB_REPLACE));
    if !payload.ends_with(LINE_END) {
        payload.push_str(LINE_END);
    }

    if payload.len() > MAX_CHARS {
        truncate_at_boundary(&mut payload, MAX_CHARS - LINE_END.len());
        payload.push_str(LINE_END);
    }

    let mut framed = format!("{} ", payload.len()).into_bytes();
    framed.extend_from_slice(payload.as_bytes());
    framed
}
