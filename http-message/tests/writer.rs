use http_message::{
    read_message, write_request, write_response, Headers, HttpMessage, Method, ReadResult,
    WriteRequest, WriteResponse,
};
use netbuf::Parser;
use quickcheck_macros::quickcheck;

const BODY: &[u8] = b"This is\ndata\n\n\nThat I have";

/// Blank out the generated Date value so fixed expectations can match.
fn elide_date(out: &[u8]) -> String {
    let text = String::from_utf8_lossy(out).to_string();
    match text.find("Date: ") {
        Some(start) => {
            let value_start = start + "Date: ".len();
            let value_end = text[value_start..].find("\r\n").unwrap() + value_start;
            format!("{}{}", &text[..value_start - 1], &text[value_end..])
        }
        None => text,
    }
}

#[test]
fn get_request_with_body() {
    let out = write_request(&WriteRequest {
        method: Method::Get,
        host: "example.com",
        port: 0,
        uri: "/cgi/bin/blah",
        user_agent: Some("simple-writer"),
        content_type: Some("text/plain"),
        body: Some(BODY),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        elide_date(&out),
        "GET /cgi/bin/blah HTTP/1.1\r\n\
         Host: example.com\r\n\
         User-Agent: simple-writer\r\n\
         Content-Length: 26\r\n\
         Content-Type: text/plain\r\n\
         Date:\r\n\
         \r\n\
         This is\ndata\n\n\nThat I have"
    );
}

#[test]
fn empty_body_and_charset_defaults() {
    // No body, no charset: zero length, opaque content type default.
    let out = write_request(&WriteRequest {
        method: Method::Get,
        host: "example.com",
        port: 0,
        uri: "/cgi/bin/blah",
        user_agent: Some("simple-writer"),
        ..Default::default()
    })
    .unwrap();
    assert!(elide_date(&out).contains("Content-Length: 0\r\nContent-Type: application/octet-stream\r\n"));

    // A charset without a content type defaults to text/plain.
    let out = write_request(&WriteRequest {
        method: Method::Get,
        host: "example.com",
        port: 0,
        uri: "/cgi/bin/blah",
        user_agent: Some("simple-writer"),
        charset: Some("utf-8"),
        ..Default::default()
    })
    .unwrap();
    assert!(elide_date(&out).contains("Content-Type: text/plain; charset=utf-8\r\n"));
}

#[test]
fn host_port_elision() {
    // 0 and 80 are elided; anything else is printed.
    for (port, expect) in [
        (0u16, "Host: example2.com\r\n"),
        (80, "Host: example2.com\r\n"),
        (443, "Host: example2.com:443\r\n"),
        (7000, "Host: example2.com:7000\r\n"),
    ] {
        let out = write_request(&WriteRequest {
            method: Method::Post,
            host: "example2.com",
            port,
            uri: "/",
            ..Default::default()
        })
        .unwrap();
        assert!(
            elide_date(&out).contains(expect),
            "port {} should yield {:?}",
            port,
            expect
        );
    }
}

#[test]
fn user_agent_only_when_given() {
    let out = write_request(&WriteRequest {
        method: Method::Delete,
        host: "e.com",
        port: 7000,
        ..Default::default()
    })
    .unwrap();
    assert!(!elide_date(&out).contains("User-Agent"));
}

#[test]
fn request_without_any_host_fails() {
    assert!(write_request(&WriteRequest {
        method: Method::Options,
        uri: "/did",
        ..Default::default()
    })
    .is_err());
}

#[test]
fn caller_headers_lead_and_merge() {
    let mut headers = Headers::new();
    headers.add("ABC", "XYZ");
    headers.add("Val", "123");
    headers.add("val", "456");
    headers.add("C-V", "This is a test");

    let out = write_request(&WriteRequest {
        method: Method::Get,
        host: "localhost",
        port: 443,
        uri: "/",
        user_agent: Some("test"),
        content_type: Some("t"),
        headers: Some(&headers),
        body: Some(BODY),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        elide_date(&out),
        "GET / HTTP/1.1\r\n\
         ABC: XYZ\r\n\
         Val: 123, 456\r\n\
         C-V: This is a test\r\n\
         Host: localhost:443\r\n\
         User-Agent: test\r\n\
         Content-Length: 26\r\n\
         Content-Type: t\r\n\
         Date:\r\n\
         \r\n\
         This is\ndata\n\n\nThat I have"
    );
}

#[test]
fn caller_host_is_overridden_by_parameter() {
    let mut headers = Headers::new();
    headers.add("Host", "1.2");
    let out = write_request(&WriteRequest {
        method: Method::Get,
        host: "localhost",
        port: 443,
        uri: "/",
        headers: Some(&headers),
        ..Default::default()
    })
    .unwrap();
    let text = elide_date(&out);
    assert!(text.contains("Host: localhost:443\r\n"));
    assert!(!text.contains("Host: 1.2"));
}

#[test]
fn caller_headers_can_supply_the_defaults() {
    let mut headers = Headers::new();
    headers.add("ABC", "XYZ");
    headers.add("val", "123");
    headers.add("val", "456");
    headers.add("Val", "456");
    headers.add("Val", "789");
    headers.add("user-agent", "The checker");
    headers.add("Content-TYPe", "application/json");
    headers.add("Host", "l.internal:8080");

    let out = write_request(&WriteRequest {
        method: Method::Get,
        uri: "/",
        headers: Some(&headers),
        body: Some(BODY),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        elide_date(&out),
        "GET / HTTP/1.1\r\n\
         ABC: XYZ\r\n\
         val: 123, 456, 789\r\n\
         user-agent: The checker\r\n\
         Content-TYPe: application/json\r\n\
         Host: l.internal:8080\r\n\
         Content-Length: 26\r\n\
         Date:\r\n\
         \r\n\
         This is\ndata\n\n\nThat I have"
    );
}

#[test]
fn caller_content_length_wins_without_a_body() {
    let mut headers = Headers::new();
    headers.add("Content-Length", "9430");
    let out = write_request(&WriteRequest {
        method: Method::Get,
        host: "localhost",
        port: 443,
        uri: "/",
        user_agent: Some("test"),
        content_type: Some("t"),
        headers: Some(&headers),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        elide_date(&out),
        "GET / HTTP/1.1\r\n\
         Content-Length: 9430\r\n\
         Host: localhost:443\r\n\
         User-Agent: test\r\n\
         Content-Type: t\r\n\
         Date:\r\n\
         \r\n"
    );
}

#[test]
fn modifier_merging_in_caller_headers() {
    let mut headers = Headers::new();
    headers.add("Accept-Language", "en, mi");
    headers.add(
        "Modifiers",
        "text/*; q=0.3; m=9, text/html; q=0.7, text/html; level=1, text/html; level=2; q=0.4, */*; q=0.5",
    );
    let out = write_request(&WriteRequest {
        method: Method::Get,
        host: "localhost",
        port: 443,
        uri: "/",
        headers: Some(&headers),
        ..Default::default()
    })
    .unwrap();
    let text = elide_date(&out);
    assert!(text.contains("Accept-Language: en, mi\r\n"));
    assert!(text.contains("Modifiers: text/*; q=0.3; m=9, text/html; q=0.4; level=2, */*; q=0.5\r\n"));
}

#[test]
fn response_with_reason_defaults() {
    let out = write_response(&WriteResponse {
        status: 200,
        content_type: Some("application/json"),
        body: Some(BODY),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        elide_date(&out),
        "HTTP/1.1 200 OK\r\n\
         Content-Length: 26\r\n\
         Content-Type: application/json\r\n\
         Date:\r\n\
         \r\n\
         This is\ndata\n\n\nThat I have"
    );

    let out = write_response(&WriteResponse {
        status: 400,
        content_type: Some("text/plain"),
        charset: Some("utf-8"),
        ..Default::default()
    })
    .unwrap();
    assert!(elide_date(&out).starts_with("HTTP/1.1 400 Bad Request\r\n"));

    let out = write_response(&WriteResponse {
        status: 600,
        charset: Some("utf-8"),
        body: Some(b"x"),
        ..Default::default()
    })
    .unwrap();
    assert!(elide_date(&out).starts_with("HTTP/1.1 600 Generic\r\n"));

    let out = write_response(&WriteResponse {
        status: 201,
        reason: Some("OMG"),
        ..Default::default()
    })
    .unwrap();
    assert!(elide_date(&out).starts_with("HTTP/1.1 201 OMG\r\n"));
}

#[test]
fn declared_length_without_body_bytes() {
    let out = write_response(&WriteResponse {
        status: 200,
        body_len: Some(102),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        elide_date(&out),
        "HTTP/1.1 200 OK\r\n\
         Content-Length: 102\r\n\
         Content-Type: application/octet-stream\r\n\
         Date:\r\n\
         \r\n"
    );
}

#[quickcheck]
fn any_body_survives_serialization(body: Vec<u8>) -> bool {
    let out = write_request(&WriteRequest {
        method: Method::Put,
        host: "example.com",
        port: 0,
        uri: "/upload",
        body: Some(&body),
        ..Default::default()
    })
    .unwrap();
    let mut parser = Parser::new();
    parser.append(&out);
    match read_message(&mut parser).unwrap() {
        ReadResult::Success(HttpMessage::Request(req)) => req.body == body,
        _ => false,
    }
}

#[test]
fn serialized_request_parses_back_identically() {
    let mut headers = Headers::new();
    headers.add("X-Trace", "abc");
    let out = write_request(&WriteRequest {
        method: Method::Post,
        host: "example2.com",
        port: 443,
        uri: "/submit?q=1",
        user_agent: Some("swriter"),
        content_type: Some("application/json"),
        charset: Some("utf-8"),
        headers: Some(&headers),
        body: Some(BODY),
        ..Default::default()
    })
    .unwrap();

    let mut parser = Parser::new();
    parser.append(&out);
    let req = match read_message(&mut parser).unwrap() {
        ReadResult::Success(HttpMessage::Request(req)) => req,
        _ => panic!("expected a complete request"),
    };
    assert_eq!(req.method, Method::Post);
    assert_eq!(req.host, "example2.com");
    assert_eq!(req.port, 443);
    assert_eq!(req.uri, "/submit?q=1");
    assert_eq!(req.user_agent.as_deref(), Some("swriter"));
    assert_eq!(req.body, BODY);
    assert_eq!(req.headers.get("X-Trace").unwrap(), "abc");
    assert_eq!(req.headers.content_type().unwrap(), "application/json");
    assert_eq!(req.headers.charset().unwrap(), "utf-8");
    // The generated Date is present after serialization even though
    // the input had none.
    assert!(req.headers.contains("Date"));
}
