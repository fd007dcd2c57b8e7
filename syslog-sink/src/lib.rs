//! Remote syslog sink: RFC 3164 messages, octet-count framed per
//! RFC 6587, carried over a TCP connection driven by the event loop.
//!
//! Producers enqueue from any thread; the queue is byte-bounded and
//! drops oldest-first, remembering how many were lost so a synthetic
//! warning precedes the next delivered message. A dead connection is
//! recreated after a fixed one-second delay. The [`SyslogSink::emergency`]
//! path writes straight to the connected socket without taking locks or
//! allocating, so it is callable from a signal handler.

mod frame;
mod queue;

pub use frame::{Facility, Priority};

use std::{
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tracing::{debug, warn};

use event_io::{net, Dns, EventType, Io, IoError, IoState, LoopHandle, Trigger};
use netbuf::Buf;

use frame::frame_message;
use queue::FramedQueue;

const RETRY_DELAY: Duration = Duration::from_millis(1000);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(4);
const DEFAULT_KEEPALIVE_RETRY: Duration = Duration::from_secs(15);
const DEFAULT_KEEPALIVE_COUNT: u32 = 3;

struct SinkState {
    product: String,
    facility: Facility,
    src_host: String,
    dest_host: String,
    port: u16,

    handle: Option<LoopHandle>,
    dns: Dns,
    io: Option<Io>,
    trigger: Option<Trigger>,

    connect_timeout: Duration,
    keepalive_idle: Duration,
    keepalive_retry: Duration,
    keepalive_count: u32,

    queue: FramedQueue,
    /// Bytes of the message currently being written to the stream.
    msg_buf: Buf,
    /// Disconnect once the current message finishes.
    stop_flag: bool,
    /// The next stop must drain the whole queue first.
    flush_flag: bool,
    /// Do not reconnect; wait for `resume`.
    suspend_flag: bool,
    /// Do not reconnect; tear everything down.
    exit_flag: bool,
}

struct SinkShared {
    state: Mutex<SinkState>,
    /// Raw fd of the connected socket, for the emergency path only.
    /// -1 while not connected.
    emergency_fd: AtomicI32,
}

impl SinkShared {
    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to a remote syslog sink. Clones share the sink.
#[derive(Clone)]
pub struct SyslogSink {
    shared: Arc<SinkShared>,
}

fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "-".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}

impl SyslogSink {
    /// Create the sink and start connecting to `host:port` on the
    /// loop behind `handle`.
    pub fn new(
        product: &str,
        facility: Facility,
        host: &str,
        port: u16,
        handle: LoopHandle,
        dns: Dns,
        max_queue_bytes: usize,
    ) -> Result<SyslogSink, IoError> {
        if host.is_empty() || max_queue_bytes == 0 {
            return Err(IoError::Invalid);
        }

        let shared = Arc::new(SinkShared {
            state: Mutex::new(SinkState {
                product: if product.is_empty() {
                    // NILVALUE from RFC 5424: no product name set.
                    "-".to_string()
                } else {
                    product.to_string()
                },
                facility,
                src_host: local_hostname(),
                dest_host: host.to_string(),
                port,
                handle: Some(handle.clone()),
                dns,
                io: None,
                trigger: None,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                keepalive_idle: DEFAULT_KEEPALIVE_IDLE,
                keepalive_retry: DEFAULT_KEEPALIVE_RETRY,
                keepalive_count: DEFAULT_KEEPALIVE_COUNT,
                queue: FramedQueue::new(max_queue_bytes),
                msg_buf: Buf::new(),
                stop_flag: false,
                flush_flag: false,
                suspend_flag: false,
                exit_flag: false,
            }),
            emergency_fd: AtomicI32::new(-1),
        });

        let trigger_shared = shared.clone();
        let trigger = handle.trigger_add(Box::new(move |_el| {
            pump(&trigger_shared);
        }));
        shared.state().trigger = Some(trigger);

        if let Err(err) = reconnect(&shared) {
            if let Some(trigger) = shared.state().trigger.take() {
                trigger.remove();
            }
            return Err(err);
        }
        Ok(SyslogSink { shared })
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        let mut state = self.shared.state();
        state.connect_timeout = timeout;
        if let Some(io) = &state.io {
            io.set_connect_timeout(timeout);
        }
    }

    pub fn set_keepalives(&self, idle: Duration, retry: Duration, count: u32) {
        let mut state = self.shared.state();
        state.keepalive_idle = idle;
        state.keepalive_retry = retry;
        state.keepalive_count = count;
        if let Some(io) = &state.io {
            let _ = net::set_keepalives(io, idle, retry, count);
        }
    }

    /// Frame and enqueue one log line. Callable from any thread.
    pub fn log(&self, msg: &str, priority: Priority) {
        let mut state = self.shared.state();

        // While a flush-to-destroy drains the queue, new messages
        // would make the flush chase its own tail.
        if state.flush_flag {
            return;
        }

        let framed = frame_message(
            msg,
            state.facility,
            priority,
            &state.src_host,
            &state.product,
        );
        state.queue.push(framed);

        if !state.suspend_flag && !state.stop_flag {
            if let Some(trigger) = &state.trigger {
                trigger.signal();
            }
        }
    }

    /// Disconnect cleanly (after the in-flight message) and reconnect.
    pub fn reopen(&self) -> bool {
        let state = self.shared.state();
        if state.suspend_flag {
            return false;
        }
        let mut state = state;
        state.stop_flag = true;
        if state.msg_buf.is_empty() {
            if let Some(io) = &state.io {
                io.disconnect();
            }
        }
        true
    }

    /// Disconnect and stop reconnecting until [`SyslogSink::resume`].
    pub fn suspend(&self) {
        let mut state = self.shared.state();
        state.suspend_flag = true;
        if let Some(trigger) = state.trigger.take() {
            trigger.remove();
        }
        self.shared.emergency_fd.store(-1, Ordering::SeqCst);
        let io_taken = state.io.take();
        if let (Some(handle), Some(io)) = (&state.handle, io_taken) {
            handle.destroy_io(&io);
        }
        state.handle = None;
    }

    /// Rebind to a (possibly different) event loop and reconnect.
    pub fn resume(&self, handle: LoopHandle) -> Result<(), IoError> {
        {
            let mut state = self.shared.state();
            state.suspend_flag = false;
            state.handle = Some(handle.clone());
            let trigger_shared = self.shared.clone();
            state.trigger = Some(handle.trigger_add(Box::new(move |_el| {
                pump(&trigger_shared);
            })));
        }
        reconnect(&self.shared)
    }

    /// Tear down. With `flush`, every queued message is written before
    /// the disconnect; otherwise only the in-flight one finishes.
    pub fn destroy(&self, flush: bool) {
        let mut state = self.shared.state();
        state.stop_flag = true;
        state.flush_flag = flush;
        state.exit_flag = true;
        let idle = state.msg_buf.is_empty() && (!flush || state.queue.is_empty());
        if idle {
            if let Some(io) = &state.io {
                io.disconnect();
            }
        } else if let Some(trigger) = &state.trigger {
            trigger.signal();
        }
    }

    /// Best-effort single write of `msg` to the connected socket.
    ///
    /// Intended for signal handlers: no locks, no allocation, no
    /// framing, no buffering. Silently does nothing when the sink is
    /// not currently connected.
    pub fn emergency(&self, msg: &str) {
        let fd = self.shared.emergency_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return;
        }
        let bytes = msg.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            let rc = unsafe {
                libc::write(
                    fd,
                    bytes[written..].as_ptr() as *const libc::c_void,
                    bytes.len() - written,
                )
            };
            if rc <= 0 {
                return;
            }
            written += rc as usize;
        }
    }

    /// Queue depth in bytes, for diagnostics.
    pub fn queued_bytes(&self) -> usize {
        self.shared.state().queue.stored_bytes()
    }
}

fn reconnect(shared: &Arc<SinkShared>) -> Result<(), IoError> {
    let (handle, dns, host, port, connect_timeout, idle, retry, count) = {
        let state = shared.state();
        let handle = match &state.handle {
            Some(h) => h.clone(),
            None => return Err(IoError::Invalid),
        };
        (
            handle,
            state.dns.clone(),
            state.dest_host.clone(),
            state.port,
            state.connect_timeout,
            state.keepalive_idle,
            state.keepalive_retry,
            state.keepalive_count,
        )
    };

    debug!(%host, port, "connecting syslog sink");
    let io = net::client_create(&dns, &host, port)?;
    io.set_connect_timeout(connect_timeout);
    let _ = net::set_keepalives(&io, idle, retry, count);

    shared.state().io = Some(io.clone());

    let cb_shared = shared.clone();
    handle.add(
        &io,
        Box::new(move |_el, etype, io| {
            io_event(&cb_shared, etype, io);
        }),
    );
    Ok(())
}

/// Write as much of the queue as the connection will take. Runs for
/// Connected, Write, and trigger wakeups.
fn pump(shared: &Arc<SinkShared>) {
    let mut state = shared.state();
    let io = match &state.io {
        Some(io) => io.clone(),
        None => return,
    };
    if io.state() != IoState::Connected {
        return;
    }

    loop {
        if state.msg_buf.is_empty() {
            // With a stop requested, the current message boundary is
            // where the disconnect happens (after a full drain when
            // flushing).
            if state.stop_flag && (!state.flush_flag || state.queue.is_empty()) {
                state.flush_flag = false;
                io.disconnect();
                return;
            }
            let mut buf = std::mem::replace(&mut state.msg_buf, Buf::new());
            let facility = state.facility;
            let src_host = state.src_host.clone();
            let product = state.product.clone();
            if !state
                .queue
                .fill_next(&mut buf, facility, &src_host, &product)
            {
                state.msg_buf = buf;
                return;
            }
            state.msg_buf = buf;
        }

        match io.write_from_buf(&mut state.msg_buf) {
            Ok(_) => {}
            Err(err) if err.is_wouldblock() => return,
            Err(err) => {
                debug!(%err, "syslog write failed; waiting for error event");
                return;
            }
        }
    }
}

fn io_event(shared: &Arc<SinkShared>, etype: EventType, io: &Io) {
    match etype {
        EventType::Connected => {
            if let Some(fd) = io_fd(io) {
                shared.emergency_fd.store(fd, Ordering::SeqCst);
            }
            pump(shared);
        }
        EventType::Write | EventType::Other => pump(shared),
        EventType::Read => {
            // Syslog over TCP is write-only; drain and ignore.
            let mut sink = [0u8; 512];
            while let Ok(n) = io.read(&mut sink) {
                if n == 0 {
                    break;
                }
            }
        }
        EventType::Disconnected | EventType::Error => {
            shared.emergency_fd.store(-1, Ordering::SeqCst);
            let mut state = shared.state();
            state.stop_flag = false;
            if state.exit_flag {
                if let Some(trigger) = state.trigger.take() {
                    trigger.remove();
                }
                if let Some(old) = state.io.take() {
                    old.destroy();
                }
                debug!("syslog sink torn down");
            } else if state.suspend_flag {
                if let Some(old) = state.io.take() {
                    old.destroy();
                }
            } else {
                if let Some(old) = state.io.take() {
                    old.destroy();
                }
                // Wait a beat, then rebuild the connection.
                if etype == EventType::Error {
                    warn!(error = %io.error_message(), "syslog connection error, reconnecting");
                }
                drop(state);
                schedule_reconnect(shared, RETRY_DELAY);
            }
        }
        EventType::Accept => {}
    }
}

/// Arm a one-shot reconnect; a failed attempt re-arms itself so the
/// sink keeps trying until suspended or destroyed.
fn schedule_reconnect(shared: &Arc<SinkShared>, delay: Duration) {
    let handle = match shared.state().handle.clone() {
        Some(h) => h,
        None => return,
    };
    let cb_shared = shared.clone();
    handle.timer_oneshot(
        delay,
        true,
        Box::new(move |_el| {
            if let Err(err) = reconnect(&cb_shared) {
                warn!(%err, "syslog reconnect failed, retrying");
                schedule_reconnect(&cb_shared, RETRY_DELAY);
            }
        }),
    );
}

fn io_fd(io: &Io) -> Option<i32> {
    io.raw_fd()
}
