//! HPACK static header table, RFC 7541 Appendix A. Index 0 is reserved
//! and never matches.

pub(crate) const STATIC_TABLE: [(&str, Option<&str>); 62] = [
    ("", None), // index 0 reserved
    (":authority", None),
    (":method", Some("GET")),
    (":method", Some("POST")),
    (":path", Some("/")),
    (":path", Some("/index.html")),
    (":scheme", Some("http")),
    (":scheme", Some("https")),
    (":status", Some("200")),
    (":status", Some("204")),
    (":status", Some("206")),
    (":status", Some("304")),
    (":status", Some("400")),
    (":status", Some("404")),
    (":status", Some("500")),
    ("accept-charset", None),
    ("accept-encoding", Some("gzip, deflate")),
    ("accept-language", None),
    ("accept-ranges", None),
    ("accept", None),
    ("access-control-allow-origin", None),
    ("age", None),
    ("allow", None),
    ("authorization", None),
    ("cache-control", None),
    ("content-disposition", None),
    ("content-encoding", None),
    ("content-language", None),
    ("content-length", None),
    ("content-location", None),
    ("content-range", None),
    ("content-type", None),
    ("cookie", None),
    ("date", None),
    ("etag", None),
    ("expect", None),
    ("expires", None),
    ("from", None),
    ("host", None),
    ("if-match", None),
    ("if-modified-since", None),
    ("if-none-match", None),
    ("if-range", None),
    ("if-unmodified-since", None),
    ("last-modified", None),
    ("link", None),
    ("location", None),
    ("max-forwards", None),
    ("proxy-authenticate", None),
    ("proxy-authorization", None),
    ("range", None),
    ("referer", None),
    ("refresh", None),
    ("retry-after", None),
    ("server", None),
    ("set-cookie", None),
    ("strict-transport-security", None),
    ("transfer-encoding", None),
    ("user-agent", None),
    ("vary", None),
    ("via", None),
    ("www-authenticate", None),
];

/// Borrowed `(key, value)` for a static table index; `None` for the
/// reserved index 0 and anything past the table.
pub fn static_table_lookup(idx: usize) -> Option<(&'static str, Option<&'static str>)> {
    if idx == 0 || idx >= STATIC_TABLE.len() {
        return None;
    }
    Some(STATIC_TABLE[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_and_bounds() {
        assert!(static_table_lookup(0).is_none());
        assert!(static_table_lookup(62).is_none());
        assert_eq!(static_table_lookup(2), Some((":method", Some("GET"))));
        assert_eq!(static_table_lookup(61), Some(("www-authenticate", None)));
    }
}
