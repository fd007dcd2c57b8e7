use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use event_io::{net, Dns, EventLoop, EventType, RunOutcome};
use http_client::{ClientError, HttpSimpleClient, NetError};
use http_message::{Method, Response};

type Outcome = Arc<Mutex<Option<Result<Response, ClientError>>>>;

fn make_client(el: &EventLoop) -> (HttpSimpleClient, Outcome) {
    let outcome: Outcome = Arc::new(Mutex::new(None));
    let outcome2 = outcome.clone();
    let handle = el.handle();
    let done_handle = el.handle();
    let client = HttpSimpleClient::new(
        handle,
        Dns::new().unwrap(),
        Box::new(move |result| {
            *outcome2.lock().unwrap() = Some(result);
            done_handle.return_early();
        }),
    );
    (client, outcome)
}

/// Register a canned-response server on the loop. Every connection
/// gets `response` once a blank line has been seen, then a disconnect.
fn serve_canned(el: &EventLoop, response: Vec<u8>, accepts: Arc<AtomicUsize>) -> SocketAddr {
    let listener = net::server_create("127.0.0.1:0").unwrap();
    let addr = net::local_addr(&listener).unwrap();
    let response = Arc::new(response);
    el.add(
        &listener,
        Box::new(move |el, etype, io| {
            if etype != EventType::Accept {
                return;
            }
            accepts.fetch_add(1, Ordering::SeqCst);
            let conn = net::accept(io).unwrap();
            let response = response.clone();
            let request = Arc::new(Mutex::new(Vec::new()));
            el.add(
                &conn,
                Box::new(move |_el, etype, io| {
                    if etype != EventType::Read {
                        return;
                    }
                    let mut buf = [0u8; 4096];
                    loop {
                        match io.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => request.lock().unwrap().extend_from_slice(&buf[..n]),
                            Err(_) => break,
                        }
                    }
                    let seen = request.lock().unwrap();
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        let _ = io.write(&response);
                        io.disconnect();
                    }
                }),
            );
        }),
    );
    addr
}

#[test]
fn get_roundtrip() {
    let _ = tracing_subscriber::fmt::try_init();
    let el = EventLoop::new().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let addr = serve_canned(
        &el,
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\n\r\nhello".to_vec(),
        accepts.clone(),
    );

    let (client, outcome) = make_client(&el);
    client.set_message(Method::Get, Some("test-agent"), None, None, None, b"");
    assert!(client.send(&format!("http://127.0.0.1:{}/x", addr.port())));

    assert_eq!(el.run(Some(Duration::from_secs(5))), RunOutcome::ReturnedEarly);
    let rsp = outcome.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(rsp.status, 200);
    assert_eq!(rsp.reason, "OK");
    assert_eq!(rsp.body, b"hello");
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[test]
fn response_without_length_finalizes_on_disconnect() {
    let el = EventLoop::new().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let addr = serve_canned(
        &el,
        b"HTTP/1.1 200 OK\r\nServer: canned\r\n\r\nstream until close".to_vec(),
        accepts.clone(),
    );

    let (client, outcome) = make_client(&el);
    assert!(client.send(&format!("http://127.0.0.1:{}/", addr.port())));

    assert_eq!(el.run(Some(Duration::from_secs(5))), RunOutcome::ReturnedEarly);
    let rsp = outcome.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(rsp.body, b"stream until close");
}

#[test]
fn redirect_loop_hits_limit_after_k_plus_one_attempts() {
    let el = EventLoop::new().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    // The Location points back at the same server, forever.
    let listener = net::server_create("127.0.0.1:0").unwrap();
    let addr = net::local_addr(&listener).unwrap();
    let response = Arc::new(format!(
        "HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:{}/again\r\nContent-Length: 0\r\n\r\n",
        addr.port()
    ).into_bytes());
    {
        let accepts = accepts.clone();
        el.add(
            &listener,
            Box::new(move |el, etype, io| {
                if etype != EventType::Accept {
                    return;
                }
                accepts.fetch_add(1, Ordering::SeqCst);
                let conn = net::accept(io).unwrap();
                let response = response.clone();
                el.add(
                    &conn,
                    Box::new(move |_el, etype, io| {
                        if etype == EventType::Read {
                            let mut buf = [0u8; 4096];
                            while let Ok(n) = io.read(&mut buf) {
                                if n == 0 {
                                    break;
                                }
                            }
                            let _ = io.write(&response);
                            io.disconnect();
                        }
                    }),
                );
            }),
        );
    }

    let (client, outcome) = make_client(&el);
    client.set_max_redirects(3);
    assert!(client.send(&format!("http://127.0.0.1:{}/", addr.port())));

    assert_eq!(el.run(Some(Duration::from_secs(10))), RunOutcome::ReturnedEarly);
    let err = outcome.lock().unwrap().take().unwrap().unwrap_err();
    assert_eq!(err.net, NetError::RedirectLimit);
    // redirect_max = k means k + 1 connections: the original plus k
    // followed redirects.
    assert_eq!(accepts.load(Ordering::SeqCst), 4);
}

#[test]
fn receive_cap_aborts_oversized_response() {
    let el = EventLoop::new().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let mut response = b"HTTP/1.1 200 OK\r\nContent-Length: 4096\r\n\r\n".to_vec();
    response.extend(std::iter::repeat(b'x').take(4096));
    let addr = serve_canned(&el, response, accepts.clone());

    let (client, outcome) = make_client(&el);
    client.set_max_receive_size(128);
    assert!(client.send(&format!("http://127.0.0.1:{}/big", addr.port())));

    assert_eq!(el.run(Some(Duration::from_secs(5))), RunOutcome::ReturnedEarly);
    let err = outcome.lock().unwrap().take().unwrap().unwrap_err();
    assert_eq!(err.net, NetError::OverLimit);
}

#[test]
fn stalled_server_trips_stall_timeout() {
    let el = EventLoop::new().unwrap();

    // Accepts and then goes silent.
    let listener = net::server_create("127.0.0.1:0").unwrap();
    let addr = net::local_addr(&listener).unwrap();
    el.add(
        &listener,
        Box::new(move |el, etype, io| {
            if etype == EventType::Accept {
                let conn = net::accept(io).unwrap();
                el.add(&conn, Box::new(|_el, _etype, _io| {}));
            }
        }),
    );

    let (client, outcome) = make_client(&el);
    client.set_timeouts(0, 300, 0);
    assert!(client.send(&format!("http://127.0.0.1:{}/", addr.port())));

    assert_eq!(el.run(Some(Duration::from_secs(5))), RunOutcome::ReturnedEarly);
    let err = outcome.lock().unwrap().take().unwrap().unwrap_err();
    assert_eq!(err.net, NetError::TimeoutStall);
}

#[test]
fn connect_timeout_reports_timeout_connect() {
    let el = EventLoop::new().unwrap();
    let (client, outcome) = make_client(&el);
    client.set_timeouts(500, 0, 0);

    let start = Instant::now();
    // RFC 5737 TEST-NET-1: unroutable.
    assert!(client.send("http://192.0.2.1:81/"));

    assert_eq!(el.run(Some(Duration::from_secs(5))), RunOutcome::ReturnedEarly);
    let elapsed = start.elapsed();
    let err = outcome.lock().unwrap().take().unwrap().unwrap_err();
    assert_eq!(err.net, NetError::TimeoutConnect);
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed <= Duration::from_millis(1500));
}

#[test]
fn https_without_tls_ctx_fails_fast() {
    let el = EventLoop::new().unwrap();
    let (client, _outcome) = make_client(&el);
    assert!(!client.send("https://127.0.0.1:4433/"));
    drop(el);
}
