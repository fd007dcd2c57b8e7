use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use event_io::{net, Dns, EventLoop, EventType, RunOutcome};
use syslog_sink::{Facility, Priority, SyslogSink};

/// Collect everything arriving on a TCP port; invoke `on_bytes` with
/// the accumulated buffer after every read.
fn spawn_collector(
    el: &EventLoop,
    collected: Arc<Mutex<Vec<u8>>>,
    on_bytes: Arc<dyn Fn(&EventLoop, &[u8]) + Send + Sync>,
) -> SocketAddr {
    let listener = net::server_create("127.0.0.1:0").unwrap();
    let addr = net::local_addr(&listener).unwrap();
    el.add(
        &listener,
        Box::new(move |el, etype, io| {
            if etype != EventType::Accept {
                return;
            }
            let conn = net::accept(io).unwrap();
            let collected = collected.clone();
            let on_bytes = on_bytes.clone();
            el.add(
                &conn,
                Box::new(move |el, etype, io| {
                    if etype != EventType::Read {
                        return;
                    }
                    let mut chunk = [0u8; 4096];
                    loop {
                        match io.read(&mut chunk) {
                            Ok(0) => break,
                            Ok(n) => collected.lock().unwrap().extend_from_slice(&chunk[..n]),
                            Err(_) => break,
                        }
                    }
                    let buf = collected.lock().unwrap();
                    on_bytes(el, &buf);
                }),
            );
        }),
    );
    addr
}

/// Split an octet-count framed stream into payloads.
fn deframe(mut bytes: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    loop {
        let sp = match bytes.iter().position(|&b| b == b' ') {
            Some(sp) => sp,
            None => break,
        };
        let len: usize = match std::str::from_utf8(&bytes[..sp]).ok().and_then(|s| s.parse().ok()) {
            Some(len) => len,
            None => break,
        };
        if bytes.len() < sp + 1 + len {
            break;
        }
        out.push(String::from_utf8_lossy(&bytes[sp + 1..sp + 1 + len]).to_string());
        bytes = &bytes[sp + 1 + len..];
    }
    out
}

#[test]
fn frames_arrive_octet_counted() {
    let _ = tracing_subscriber::fmt::try_init();
    let el = EventLoop::new().unwrap();
    let collected = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_collector(
        &el,
        collected.clone(),
        Arc::new(|el, bytes| {
            if deframe(bytes).len() >= 2 {
                el.return_early();
            }
        }),
    );

    let sink = SyslogSink::new(
        "testprod",
        Facility::Local0,
        "127.0.0.1",
        addr.port(),
        el.handle(),
        Dns::new().unwrap(),
        64 * 1024,
    )
    .unwrap();

    sink.log("first message", Priority::Info);
    sink.log("second\tmessage", Priority::Warning);

    assert_eq!(el.run(Some(Duration::from_secs(5))), RunOutcome::ReturnedEarly);
    let payloads = deframe(&collected.lock().unwrap());
    assert_eq!(payloads.len(), 2);
    assert!(payloads[0].contains("testprod: first message"));
    // local0.info = 128+6
    assert!(payloads[0].starts_with("<134>"));
    // tabs replaced before framing
    assert!(payloads[1].contains("second    message"));
    assert!(!payloads[1].contains('\t'));
}

#[test]
fn destroy_with_flush_drains_the_queue() {
    let el = EventLoop::new().unwrap();
    let collected = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_collector(&el, collected.clone(), Arc::new(|_el, _bytes| {}));

    let sink = SyslogSink::new(
        "flusher",
        Facility::User,
        "127.0.0.1",
        addr.port(),
        el.handle(),
        Dns::new().unwrap(),
        64 * 1024,
    )
    .unwrap();

    for i in 0..3 {
        sink.log(&format!("queued {}", i), Priority::Info);
    }
    sink.destroy(true);

    // Once the sink disconnects and tears down, only the listener
    // remains; cap the run and inspect what arrived.
    el.run(Some(Duration::from_secs(3)));
    let payloads = deframe(&collected.lock().unwrap());
    assert_eq!(payloads.len(), 3);
    for i in 0..3 {
        assert!(payloads[i].contains(&format!("queued {}", i)));
    }
}

#[test]
fn suspend_parks_messages_until_resume() {
    let el = EventLoop::new().unwrap();
    let collected = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_collector(
        &el,
        collected.clone(),
        Arc::new(|el, bytes| {
            if deframe(bytes).iter().any(|p| p.contains("parked")) {
                el.return_early();
            }
        }),
    );

    let sink = SyslogSink::new(
        "parker",
        Facility::User,
        "127.0.0.1",
        addr.port(),
        el.handle(),
        Dns::new().unwrap(),
        64 * 1024,
    )
    .unwrap();

    sink.suspend();
    // Queued while there is no connection at all.
    sink.log("parked message", Priority::Notice);
    assert!(sink.queued_bytes() > 0);

    let sink2 = sink.clone();
    let handle = el.handle();
    el.timer_oneshot(
        Duration::from_millis(50),
        true,
        Box::new(move |_el| {
            let _ = sink2.resume(handle.clone());
        }),
    );

    assert_eq!(el.run(Some(Duration::from_secs(5))), RunOutcome::ReturnedEarly);
    let payloads = deframe(&collected.lock().unwrap());
    assert!(payloads.iter().any(|p| p.contains("parked message")));
}
