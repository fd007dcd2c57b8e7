use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use event_io::{net, EventLoop, EventType, IoError, LoopHandle, RunOutcome};
use http_message::Headers;
use smtp_pool::{PoolMode, SmtpEvents, SmtpPool};

/// Minimal ESMTP responder used as a delivery target. Accepts every
/// recipient unless `refuse_rcpt` is set, in which case RCPT gets a
/// permanent 550.
struct FakeSmtp {
    refuse_rcpt: bool,
    received: Arc<Mutex<Vec<String>>>,
}

fn spawn_fake_smtp(el: &EventLoop, cfg: FakeSmtp) -> SocketAddr {
    let listener = net::server_create("127.0.0.1:0").unwrap();
    let addr = net::local_addr(&listener).unwrap();
    let cfg = Arc::new(cfg);
    el.add(
        &listener,
        Box::new(move |el, etype, io| {
            if etype != EventType::Accept {
                return;
            }
            let conn = net::accept(io).unwrap();
            let cfg = cfg.clone();
            let buffer = Arc::new(Mutex::new(Vec::<u8>::new()));
            let in_data = Arc::new(Mutex::new(false));
            el.add(
                &conn,
                Box::new(move |_el, etype, io| match etype {
                    EventType::Connected => {
                        let _ = io.write(b"220 fake ESMTP ready\r\n");
                    }
                    EventType::Read => {
                        let mut chunk = [0u8; 4096];
                        loop {
                            match io.read(&mut chunk) {
                                Ok(0) => break,
                                Ok(n) => buffer.lock().unwrap().extend_from_slice(&chunk[..n]),
                                Err(_) => break,
                            }
                        }
                        loop {
                            let line = {
                                let mut buf = buffer.lock().unwrap();
                                match buf.iter().position(|&b| b == b'\n') {
                                    Some(nl) => {
                                        let line: Vec<u8> = buf.drain(..=nl).collect();
                                        String::from_utf8_lossy(&line).trim_end().to_string()
                                    }
                                    None => break,
                                }
                            };
                            let mut data_mode = in_data.lock().unwrap();
                            if *data_mode {
                                if line == "." {
                                    *data_mode = false;
                                    let _ = io.write(b"250 2.0.0 accepted\r\n");
                                } else {
                                    let mut received = cfg.received.lock().unwrap();
                                    let last = received.last_mut().unwrap();
                                    last.push_str(&line);
                                    last.push('\n');
                                }
                                continue;
                            }
                            let upper = line.to_ascii_uppercase();
                            if upper.starts_with("EHLO") {
                                let _ = io.write(b"250-fake greets you\r\n250 8BITMIME\r\n");
                            } else if upper.starts_with("MAIL") {
                                let _ = io.write(b"250 2.1.0 ok\r\n");
                            } else if upper.starts_with("RCPT") {
                                if cfg.refuse_rcpt {
                                    let _ = io.write(b"550 5.1.1 no such user\r\n");
                                } else {
                                    let _ = io.write(b"250 2.1.5 ok\r\n");
                                }
                            } else if upper.starts_with("DATA") {
                                cfg.received.lock().unwrap().push(String::new());
                                *data_mode = true;
                                let _ = io.write(b"354 go ahead\r\n");
                            } else if upper.starts_with("RSET") {
                                let _ = io.write(b"250 2.0.0 flushed\r\n");
                            } else if upper.starts_with("QUIT") {
                                let _ = io.write(b"221 2.0.0 bye\r\n");
                                io.disconnect();
                            } else if !line.is_empty() {
                                let _ = io.write(b"250 2.0.0 ok\r\n");
                            }
                        }
                    }
                    _ => {}
                }),
            );
        }),
    );
    addr
}

#[derive(Default)]
struct Counters {
    sent: AtomicUsize,
    failed: AtomicUsize,
    connect_fails: AtomicUsize,
    last_failed_can_requeue: Mutex<Option<bool>>,
    last_failed_attempt: AtomicUsize,
    sent_subjects: Mutex<Vec<String>>,
}

struct TestEvents {
    counters: Arc<Counters>,
    handle: LoopHandle,
    stop_after_sent: usize,
    stop_after_failed: usize,
    requeue: bool,
}

impl SmtpEvents for TestEvents {
    fn sent(&mut self, headers: &Headers) {
        self.counters
            .sent_subjects
            .lock()
            .unwrap()
            .push(headers.get("Subject").unwrap_or_default());
        let n = self.counters.sent.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stop_after_sent > 0 && n >= self.stop_after_sent {
            self.handle.return_early();
        }
    }

    fn send_failed(
        &mut self,
        _headers: &Headers,
        _error: &str,
        attempt: usize,
        can_requeue: bool,
    ) -> bool {
        *self.counters.last_failed_can_requeue.lock().unwrap() = Some(can_requeue);
        self.counters
            .last_failed_attempt
            .store(attempt, Ordering::SeqCst);
        let n = self.counters.failed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stop_after_failed > 0 && n >= self.stop_after_failed {
            self.handle.return_early();
        }
        self.requeue
    }

    fn connect_fail(
        &mut self,
        _address: &str,
        _port: u16,
        _err: IoError,
        _error: &str,
    ) -> bool {
        self.counters.connect_fails.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn processing_halted(&mut self, _no_endpoints: bool) -> u64 {
        1
    }
}

fn message(subject: &str) -> String {
    format!(
        "From: sender@example.com\r\nTo: rcpt@example.net\r\nSubject: {}\r\n\r\nbody of {}\r\n",
        subject, subject
    )
}

#[test]
fn delivers_queued_messages() {
    let _ = tracing_subscriber::fmt::try_init();
    let el = EventLoop::new().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_fake_smtp(
        &el,
        FakeSmtp {
            refuse_rcpt: false,
            received: received.clone(),
        },
    );

    let counters = Arc::new(Counters::default());
    let pool = SmtpPool::new(
        el.handle(),
        Box::new(TestEvents {
            counters: counters.clone(),
            handle: el.handle(),
            stop_after_sent: 2,
            stop_after_failed: 0,
            requeue: true,
        }),
    );
    pool.setup_tcp(event_io::Dns::new().unwrap(), None);
    pool.set_ehlo_host("tester.local");
    assert!(pool.add_endpoint_tcp("127.0.0.1", addr.port(), false, None, None, 1));

    assert!(pool.queue_message(&message("one")));
    assert!(pool.queue_message(&message("two")));

    assert_eq!(el.run(Some(Duration::from_secs(10))), RunOutcome::ReturnedEarly);
    assert_eq!(counters.sent.load(Ordering::SeqCst), 2);
    assert_eq!(counters.failed.load(Ordering::SeqCst), 0);

    let bodies = received.lock().unwrap();
    assert_eq!(bodies.len(), 2);
    assert!(bodies.iter().any(|b| b.contains("body of one")));
    assert!(bodies.iter().any(|b| b.contains("body of two")));

    let subjects = counters.sent_subjects.lock().unwrap();
    assert!(subjects.contains(&"one".to_string()));
    assert!(subjects.contains(&"two".to_string()));
}

#[test]
fn permanent_refusal_reports_failure_without_requeue() {
    let el = EventLoop::new().unwrap();
    let addr = spawn_fake_smtp(
        &el,
        FakeSmtp {
            refuse_rcpt: true,
            received: Arc::new(Mutex::new(Vec::new())),
        },
    );

    let counters = Arc::new(Counters::default());
    let pool = SmtpPool::new(
        el.handle(),
        Box::new(TestEvents {
            counters: counters.clone(),
            handle: el.handle(),
            stop_after_sent: 0,
            stop_after_failed: 1,
            requeue: true,
        }),
    );
    pool.setup_tcp(event_io::Dns::new().unwrap(), None);
    assert!(pool.add_endpoint_tcp("127.0.0.1", addr.port(), false, None, None, 1));
    assert!(pool.queue_message(&message("doomed")));

    assert_eq!(el.run(Some(Duration::from_secs(10))), RunOutcome::ReturnedEarly);
    assert_eq!(counters.failed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.sent.load(Ordering::SeqCst), 0);
    // A 5xx is permanent: the message may not be requeued.
    assert_eq!(
        *counters.last_failed_can_requeue.lock().unwrap(),
        Some(false)
    );
    assert_eq!(counters.last_failed_attempt.load(Ordering::SeqCst), 1);
}

#[test]
fn failover_moves_to_the_next_endpoint() {
    let el = EventLoop::new().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let good = spawn_fake_smtp(
        &el,
        FakeSmtp {
            refuse_rcpt: false,
            received: received.clone(),
        },
    );

    // A dead endpoint: bind a listener and drop it so the port refuses.
    let dead_port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let counters = Arc::new(Counters::default());
    let pool = SmtpPool::new(
        el.handle(),
        Box::new(TestEvents {
            counters: counters.clone(),
            handle: el.handle(),
            stop_after_sent: 1,
            stop_after_failed: 0,
            requeue: true,
        }),
    );
    pool.setup_tcp(event_io::Dns::new().unwrap(), None);
    pool.set_mode(PoolMode::Failover);
    pool.setup_tcp_timeouts(1000, 0, 0);
    assert!(pool.add_endpoint_tcp("127.0.0.1", dead_port, false, None, None, 1));
    assert!(pool.add_endpoint_tcp("127.0.0.1", good.port(), false, None, None, 1));
    assert!(pool.queue_message(&message("persistent")));

    assert_eq!(el.run(Some(Duration::from_secs(15))), RunOutcome::ReturnedEarly);
    assert_eq!(counters.sent.load(Ordering::SeqCst), 1);
    assert!(counters.connect_fails.load(Ordering::SeqCst) >= 1);
    assert!(received.lock().unwrap()[0].contains("body of persistent"));
}

#[test]
fn process_endpoint_consumes_messages() {
    let el = EventLoop::new().unwrap();
    let counters = Arc::new(Counters::default());
    let pool = SmtpPool::new(
        el.handle(),
        Box::new(TestEvents {
            counters: counters.clone(),
            handle: el.handle(),
            stop_after_sent: 1,
            stop_after_failed: 0,
            requeue: true,
        }),
    );
    assert!(pool.add_endpoint_process("cat", &[], None, 5000));
    assert!(pool.queue_message(&message("piped")));

    assert_eq!(el.run(Some(Duration::from_secs(10))), RunOutcome::ReturnedEarly);
    assert_eq!(counters.sent.load(Ordering::SeqCst), 1);
}

#[test]
fn external_queue_feeds_and_reschedules() {
    let el = EventLoop::new().unwrap();
    let addr = spawn_fake_smtp(
        &el,
        FakeSmtp {
            refuse_rcpt: true,
            received: Arc::new(Mutex::new(Vec::new())),
        },
    );

    struct ExtEvents {
        handle: LoopHandle,
        rescheduled: Arc<Mutex<Vec<(String, u64)>>>,
    }
    impl SmtpEvents for ExtEvents {
        fn reschedule(&mut self, msg: &str, wait_sec: u64) {
            self.rescheduled
                .lock()
                .unwrap()
                .push((msg.to_string(), wait_sec));
            self.handle.return_early();
        }
    }

    let rescheduled = Arc::new(Mutex::new(Vec::new()));
    let pool = SmtpPool::new(
        el.handle(),
        Box::new(ExtEvents {
            handle: el.handle(),
            rescheduled: rescheduled.clone(),
        }),
    );
    pool.setup_tcp(event_io::Dns::new().unwrap(), None);
    assert!(pool.add_endpoint_tcp("127.0.0.1", addr.port(), false, None, None, 1));

    let supply = Arc::new(Mutex::new(vec![message("external")]));
    let supply2 = supply.clone();
    assert!(pool.use_external_queue(Box::new(move || supply2.lock().unwrap().pop())));
    pool.external_queue_have_messages();

    assert_eq!(el.run(Some(Duration::from_secs(10))), RunOutcome::ReturnedEarly);
    let rescheduled = rescheduled.lock().unwrap();
    assert_eq!(rescheduled.len(), 1);
    assert!(rescheduled[0].0.contains("body of external"));
    assert_eq!(rescheduled[0].1, 60);
}

#[test]
fn status_reflects_lifecycle() {
    let el = EventLoop::new().unwrap();
    let counters = Arc::new(Counters::default());
    let pool = SmtpPool::new(
        el.handle(),
        Box::new(TestEvents {
            counters,
            handle: el.handle(),
            stop_after_sent: 0,
            stop_after_failed: 0,
            requeue: true,
        }),
    );
    assert_eq!(pool.status(), smtp_pool::PoolStatus::NoEndpoints);
    assert!(pool.add_endpoint_process("cat", &[], None, 1000));
    assert_eq!(pool.status(), smtp_pool::PoolStatus::Idle);
    pool.pause();
    assert_eq!(pool.status(), smtp_pool::PoolStatus::Stopped);
    assert!(pool.resume());
}
