//! SMTP sender pool: deliver a stream of messages through a set of TCP
//! or process endpoints, with bounded queueing, retries with backoff,
//! failover or round-robin endpoint selection, and optional external
//! queueing.
//!
//! The pool is driven by an event loop ([`event_io::EventLoop`]) and is
//! safe to feed from any thread: producers only touch the queue mutex
//! and signal a loop trigger. All delivery work and every
//! [`SmtpEvents`] callback runs on the loop thread.

mod endpoint;
mod message;
mod process;
mod queue;
mod reply;
mod session;

pub use endpoint::{Endpoint, EndpointKind, PoolMode};
pub use message::{parse_meta, MessageMeta};
pub use queue::{BoundedQueue, QueuedMessage};
pub use reply::{Reply, ReplyKind};

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use tracing::{debug, info, trace, warn};

use event_io::{net, tls, Dns, EventType, IoError, LoopHandle, Timer, TlsClientCtx, Trigger};
use http_message::Headers;

use session::{Session, SessionEvent};

/// Default cap on the internal queue, in bytes.
pub const DEFAULT_MAX_QUEUE_BYTES: usize = 16 * 1024 * 1024;

/// Default number of delivery attempts per message.
pub const DEFAULT_NUM_ATTEMPTS: usize = 3;

/// Current processing status of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// Up and able to process, nothing in flight.
    Idle,
    /// Messages are queued or being delivered.
    Processing,
    /// Paused (or halted until `resume`).
    Stopped,
    /// No endpoints configured; the queue is parked.
    NoEndpoints,
    /// Destroy in progress: in-flight messages finish, nothing new
    /// starts.
    Stopping,
}

/// Pool lifecycle and delivery callbacks. Every method has a neutral
/// default so implementors only override what they observe. Callbacks
/// run on the loop thread (process-endpoint outcomes are reported from
/// their delivery worker thread) and must not re-enter the pool.
#[allow(unused_variables)]
pub trait SmtpEvents: Send {
    /// A TCP endpoint connection was established.
    fn connect(&mut self, address: &str, port: u16) {}

    /// A TCP endpoint could not be reached (or failed pre-greeting).
    /// Return false to remove the endpoint from the pool permanently.
    fn connect_fail(&mut self, address: &str, port: u16, err: IoError, error: &str) -> bool {
        true
    }

    /// A TCP endpoint connection closed. Not an error; connections come
    /// and go as part of normal processing.
    fn disconnect(&mut self, address: &str, port: u16) {}

    /// A process endpoint failed. Return false to remove it.
    fn process_fail(
        &mut self,
        command: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) -> bool {
        true
    }

    /// Every endpoint has failed (`no_endpoints` false), or there are
    /// none configured (true). Return the seconds to wait before
    /// retrying; 0 halts until [`SmtpPool::resume`]. Ignored when
    /// `no_endpoints` is true.
    fn processing_halted(&mut self, no_endpoints: bool) -> u64 {
        300
    }

    /// A message was accepted by an endpoint.
    fn sent(&mut self, headers: &Headers) {}

    /// A message failed. `attempt` is 0 for external-queue messages.
    /// Returning true requeues (internal queue only, and only while
    /// `can_requeue`).
    fn send_failed(
        &mut self,
        headers: &Headers,
        error: &str,
        attempt: usize,
        can_requeue: bool,
    ) -> bool {
        true
    }

    /// External queue only: park `msg` for `wait_sec` seconds before
    /// offering it again.
    fn reschedule(&mut self, msg: &str, wait_sec: u64) {}

    /// Stack extra layers (tracing, shaping) on a fresh connection io.
    /// TLS is handled by the pool and must not be added here.
    fn iocreate(&mut self, io: &event_io::Io, error: &mut String) -> bool {
        true
    }
}

/// Supplier for [`SmtpPool::use_external_queue`]: return the next raw
/// message, or `None` when the external queue is empty.
pub type GetCb = Box<dyn FnMut() -> Option<String> + Send>;

struct PoolState {
    handle: LoopHandle,
    dns: Option<Dns>,
    tls: Option<TlsClientCtx>,
    ehlo_host: String,

    endpoints: Vec<Arc<Endpoint>>,
    mode: PoolMode,
    failover_idx: usize,
    rr_next: usize,

    queue: BoundedQueue,
    external: Option<GetCb>,
    num_attempts: usize,

    connect_ms: u64,
    stall_ms: u64,
    idle_ms: u64,

    sessions: HashMap<u64, Arc<Mutex<Session>>>,
    active: HashMap<u64, usize>,
    idle_timers: HashMap<u64, Timer>,
    stall_timers: HashMap<u64, Timer>,
    next_session_id: u64,

    trigger: Option<Trigger>,
    retry_timer: Option<Timer>,

    stopped: bool,
    stopping: bool,
    halted: bool,
    reported_no_endpoints: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
    events: Mutex<Box<dyn SmtpEvents>>,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn events(&self) -> MutexGuard<'_, Box<dyn SmtpEvents>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The SMTP sender pool. Clones share the same pool.
#[derive(Clone)]
pub struct SmtpPool {
    shared: Arc<PoolShared>,
}

impl SmtpPool {
    pub fn new(handle: LoopHandle, events: Box<dyn SmtpEvents>) -> SmtpPool {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                handle: handle.clone(),
                dns: None,
                tls: None,
                ehlo_host: "localhost".to_string(),
                endpoints: Vec::new(),
                mode: PoolMode::Failover,
                failover_idx: 0,
                rr_next: 0,
                queue: BoundedQueue::new(DEFAULT_MAX_QUEUE_BYTES),
                external: None,
                num_attempts: DEFAULT_NUM_ATTEMPTS,
                connect_ms: 0,
                stall_ms: 0,
                idle_ms: 0,
                sessions: HashMap::new(),
                active: HashMap::new(),
                idle_timers: HashMap::new(),
                stall_timers: HashMap::new(),
                next_session_id: 1,
                trigger: None,
                retry_timer: None,
                stopped: false,
                stopping: false,
                halted: false,
                reported_no_endpoints: false,
            }),
            cond: Condvar::new(),
            events: Mutex::new(events),
        });

        let trigger_shared = shared.clone();
        let trigger = handle.trigger_add(Box::new(move |_el| {
            process_queue(&trigger_shared);
        }));
        shared.state().trigger = Some(trigger);

        SmtpPool { shared }
    }

    /// DNS (required for TCP endpoints) and the TLS client context used
    /// for implicit TLS and STARTTLS.
    pub fn setup_tcp(&self, dns: Dns, tls: Option<TlsClientCtx>) {
        let mut state = self.shared.state();
        state.dns = Some(dns);
        state.tls = tls;
    }

    /// Connect, stall, and idle timeouts for TCP endpoints, in
    /// milliseconds. `idle_ms == 0` closes a connection after a single
    /// message.
    pub fn setup_tcp_timeouts(&self, connect_ms: u64, stall_ms: u64, idle_ms: u64) {
        let mut state = self.shared.state();
        state.connect_ms = connect_ms;
        state.stall_ms = stall_ms;
        state.idle_ms = idle_ms;
    }

    /// Hostname presented in EHLO.
    pub fn set_ehlo_host(&self, host: &str) {
        self.shared.state().ehlo_host = host.to_string();
    }

    pub fn set_mode(&self, mode: PoolMode) {
        self.shared.state().mode = mode;
    }

    /// Delivery attempts per message (internal queue only).
    pub fn set_num_attempts(&self, num: usize) {
        self.shared.state().num_attempts = num.max(1);
    }

    /// Byte bound for the internal queue.
    pub fn set_max_queue_bytes(&self, max: usize) {
        self.shared.state().queue.set_max_bytes(max);
    }

    /// Add a TCP endpoint. Fails when [`SmtpPool::setup_tcp`] has not
    /// provided DNS, or when `tls` is requested without a context.
    pub fn add_endpoint_tcp(
        &self,
        address: &str,
        port: u16,
        tls: bool,
        username: Option<&str>,
        password: Option<&str>,
        max_conns: usize,
    ) -> bool {
        let mut state = self.shared.state();
        if state.dns.is_none() {
            return false;
        }
        if tls && state.tls.is_none() {
            return false;
        }
        let endpoint = Arc::new(Endpoint::new(EndpointKind::Tcp {
            address: address.to_string(),
            port: if port == 0 { 25 } else { port },
            tls,
            username: username.map(|s| s.to_string()),
            password: password.map(|s| s.to_string()),
            max_conns: max_conns.max(1),
        }));
        info!(endpoint = %endpoint.describe(), "tcp endpoint added");
        state.endpoints.push(endpoint);
        state.reported_no_endpoints = false;
        kick(&mut state);
        true
    }

    pub fn add_endpoint_process(
        &self,
        command: &str,
        args: &[String],
        env: Option<&HashMap<String, String>>,
        timeout_ms: u64,
    ) -> bool {
        if command.is_empty() {
            return false;
        }
        let mut state = self.shared.state();
        let endpoint = Arc::new(Endpoint::new(EndpointKind::Process {
            command: command.to_string(),
            args: args.to_vec(),
            env: env.cloned(),
            timeout_ms,
        }));
        info!(endpoint = %endpoint.describe(), "process endpoint added");
        state.endpoints.push(endpoint);
        state.reported_no_endpoints = false;
        kick(&mut state);
        true
    }

    /// Queue a raw message on the internal queue.
    pub fn queue_message(&self, raw: &str) -> bool {
        let mut state = self.shared.state();
        if state.external.is_some() || state.stopping {
            return false;
        }
        let accepted = state.queue.push(QueuedMessage::new(raw.to_string()));
        trace!(
            accepted,
            queued = state.queue.len(),
            bytes = state.queue.stored_bytes(),
            "message queued"
        );
        kick(&mut state);
        accepted
    }

    /// Switch to an external queue. Only allowed while the internal
    /// queue is empty; the internal queue is unusable afterwards.
    pub fn use_external_queue(&self, get_cb: GetCb) -> bool {
        let mut state = self.shared.state();
        if !state.queue.is_empty() {
            return false;
        }
        state.external = Some(get_cb);
        true
    }

    /// Tell the pool the external queue has messages to offer.
    pub fn external_queue_have_messages(&self) {
        let state = self.shared.state();
        if let Some(trigger) = &state.trigger {
            trigger.signal();
        }
    }

    /// Drain and return everything still waiting on the internal
    /// queue. In-flight messages are not included.
    pub fn dump_queue(&self) -> Vec<String> {
        self.shared.state().queue.drain()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state();
        if state.stopping {
            PoolStatus::Stopping
        } else if state.stopped {
            PoolStatus::Stopped
        } else if state.endpoints.is_empty() {
            PoolStatus::NoEndpoints
        } else if !state.queue.is_empty() || !state.sessions.is_empty() {
            PoolStatus::Processing
        } else {
            PoolStatus::Idle
        }
    }

    /// Stop processing: disconnect all connections and requeue their
    /// in-flight messages. `resume` starts things back up.
    pub fn pause(&self) {
        let sessions: Vec<(u64, Arc<Mutex<Session>>)> = {
            let mut state = self.shared.state();
            state.stopped = true;
            state.sessions.drain().collect()
        };
        for (sid, session) in sessions {
            let (msg, io) = {
                let mut s = session.lock().unwrap_or_else(|e| e.into_inner());
                (s.take_message(), s.io.clone())
            };
            let mut state = self.shared.state();
            if let Some(msg) = msg {
                state.queue.push_front(msg);
            }
            release_session_timers(&mut state, sid);
            state.handle.destroy_io(&io);
        }
        self.shared.state().active.clear();
        info!("pool paused");
    }

    /// Resume after `pause` or a zero-delay halt. False when no
    /// endpoints are configured.
    pub fn resume(&self) -> bool {
        let mut state = self.shared.state();
        state.stopped = false;
        state.halted = false;
        state.failover_idx = 0;
        let ok = !state.endpoints.is_empty();
        kick(&mut state);
        ok
    }

    /// Tear the pool down. With `flush`, wait (up to `timeout`) for the
    /// queue to drain and in-flight messages to finish first.
    pub fn destroy(&self, flush: bool, timeout: Duration) {
        {
            let mut state = self.shared.state();
            state.stopping = true;
            if !flush {
                state.queue.drain();
            }
            kick(&mut state);
        }

        if flush {
            let deadline = Instant::now() + timeout;
            let mut state = self.shared.state();
            while !(state.queue.is_empty() && state.sessions.is_empty()) {
                let now = Instant::now();
                if now >= deadline {
                    warn!("destroy flush timed out with work remaining");
                    break;
                }
                let (guard, _) = self
                    .shared
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(|e| e.into_inner());
                state = guard;
            }
        }

        self.pause();
        let mut state = self.shared.state();
        if let Some(trigger) = state.trigger.take() {
            trigger.remove();
        }
        if let Some(timer) = state.retry_timer.take() {
            timer.remove();
        }
    }
}

fn kick(state: &mut PoolState) {
    if let Some(trigger) = &state.trigger {
        trigger.signal();
    }
}

fn release_session_timers(state: &mut PoolState, sid: u64) {
    if let Some(t) = state.idle_timers.remove(&sid) {
        t.remove();
    }
    if let Some(t) = state.stall_timers.remove(&sid) {
        t.remove();
    }
}

/// Take the next deliverable message, arming the retry timer when only
/// parked messages remain.
fn next_message(shared: &Arc<PoolShared>, state: &mut PoolState) -> Option<QueuedMessage> {
    if state.external.is_some() {
        let raw = (state.external.as_mut().unwrap())()?;
        return Some(QueuedMessage::new(raw));
    }
    let now = Instant::now();
    match state.queue.pop(now) {
        Some(msg) => Some(msg),
        None => {
            if let Some(wait) = state.queue.next_ready_in(now) {
                arm_retry_timer(shared, state, wait);
            }
            None
        }
    }
}

fn arm_retry_timer(shared: &Arc<PoolShared>, state: &mut PoolState, delay: Duration) {
    match &state.retry_timer {
        Some(t) => t.reset(delay),
        None => {
            let cb_shared = shared.clone();
            let timer = state.handle.timer_oneshot(
                delay,
                false,
                Box::new(move |_el| {
                    {
                        let mut state = cb_shared.state();
                        state.halted = false;
                    }
                    process_queue(&cb_shared);
                }),
            );
            state.retry_timer = Some(timer);
        }
    }
}

/// Endpoint selection per the pool mode. Returns an endpoint with
/// spare connection capacity, or None.
fn pick_endpoint(state: &mut PoolState) -> Option<Arc<Endpoint>> {
    if state.endpoints.is_empty() {
        return None;
    }
    match state.mode {
        PoolMode::Failover => {
            let ep = state.endpoints.get(state.failover_idx)?.clone();
            let active = *state.active.get(&ep.id).unwrap_or(&0);
            if ep.in_backoff() || active >= ep.max_conns() {
                return None;
            }
            Some(ep)
        }
        PoolMode::RoundRobin => {
            let n = state.endpoints.len();
            for i in 0..n {
                let idx = (state.rr_next + i) % n;
                let ep = state.endpoints[idx].clone();
                let active = *state.active.get(&ep.id).unwrap_or(&0);
                if !ep.in_backoff() && active < ep.max_conns() {
                    state.rr_next = (idx + 1) % n;
                    return Some(ep);
                }
            }
            None
        }
    }
}

/// The trigger callback: start as many deliveries as pending work and
/// endpoint capacity allow.
fn process_queue(shared: &Arc<PoolShared>) {
    loop {
        // Feed idle sessions before opening new connections.
        let idle = {
            let state = shared.state();
            if state.stopped || state.stopping || state.halted {
                drop(state);
                drain_stopping(shared);
                return;
            }
            state
                .sessions
                .iter()
                .find(|(_, s)| {
                    s.try_lock()
                        .map(|s| s.is_idle())
                        .unwrap_or(false)
                })
                .map(|(sid, s)| (*sid, s.clone()))
        };
        if let Some((sid, session)) = idle {
            let msg = {
                let mut state = shared.state();
                release_session_timers(&mut state, sid);
                next_message(shared, &mut state)
            };
            match msg {
                Some(msg) => {
                    let events = {
                        let mut s = session.lock().unwrap_or_else(|e| e.into_inner());
                        let mut events = Vec::new();
                        s.give_message(msg, &mut events);
                        events
                    };
                    handle_session_events(shared, sid, &session, events);
                    continue;
                }
                None => {
                    park_idle_session(shared, sid, &session);
                    return;
                }
            }
        }
        break;
    }

    // Open new lanes while there is unclaimed work and capacity.
    loop {
        let endpoint = {
            let mut state = shared.state();
            if state.stopped || state.stopping || state.halted {
                return;
            }
            let pending = if state.external.is_some() {
                1
            } else {
                state.queue.len()
            };
            if pending == 0 {
                report_drained(shared, &mut state);
                return;
            }
            if state.endpoints.is_empty() {
                if !state.reported_no_endpoints {
                    state.reported_no_endpoints = true;
                    drop(state);
                    debug!("queue has work but no endpoints are configured");
                    shared.events().processing_halted(true);
                }
                return;
            }
            // Sessions that have not claimed a message yet will absorb
            // pending work; only open lanes beyond that.
            let unclaimed: usize = state
                .sessions
                .values()
                .filter(|s| s.try_lock().map(|s| !s.has_message()).unwrap_or(true))
                .count();
            if pending <= unclaimed {
                return;
            }
            match pick_endpoint(&mut state) {
                Some(ep) => ep,
                None => {
                    // Backoff or full lanes: try again shortly.
                    arm_retry_timer(shared, &mut state, Duration::from_secs(1));
                    return;
                }
            }
        };

        match &endpoint.kind {
            EndpointKind::Tcp { .. } => {
                if !start_tcp_session(shared, endpoint) {
                    return;
                }
            }
            EndpointKind::Process { .. } => {
                if !start_process_delivery(shared, endpoint) {
                    return;
                }
            }
        }
    }
}

fn report_drained(shared: &Arc<PoolShared>, state: &mut PoolState) {
    if state.queue.is_empty() && state.sessions.is_empty() {
        shared.cond.notify_all();
    }
}

fn drain_stopping(shared: &Arc<PoolShared>) {
    let mut state = shared.state();
    if state.stopping {
        report_drained(shared, &mut state);
    }
}

fn park_idle_session(shared: &Arc<PoolShared>, sid: u64, session: &Arc<Mutex<Session>>) {
    let mut state = shared.state();
    if state.idle_ms == 0 {
        drop(state);
        let events = {
            let mut s = session.lock().unwrap_or_else(|e| e.into_inner());
            let mut events = Vec::new();
            s.quit(&mut events);
            events
        };
        handle_session_events(shared, sid, session, events);
        return;
    }
    if state.idle_timers.contains_key(&sid) {
        return;
    }
    let cb_shared = shared.clone();
    let cb_session = session.clone();
    let delay = Duration::from_millis(state.idle_ms);
    let timer = state.handle.timer_oneshot(
        delay,
        true,
        Box::new(move |_el| {
            cb_shared.state().idle_timers.remove(&sid);
            let events = {
                let mut s = cb_session.lock().unwrap_or_else(|e| e.into_inner());
                let mut events = Vec::new();
                s.quit(&mut events);
                events
            };
            handle_session_events(&cb_shared, sid, &cb_session, events);
        }),
    );
    state.idle_timers.insert(sid, timer);
}

/// Open a connection to a TCP endpoint and register its session.
/// Returns false when the connect attempt failed synchronously (the
/// failure has been routed through the usual endpoint handling).
fn start_tcp_session(shared: &Arc<PoolShared>, endpoint: Arc<Endpoint>) -> bool {
    let (address, port, implicit_tls) = match &endpoint.kind {
        EndpointKind::Tcp {
            address, port, tls, ..
        } => (address.clone(), *port, *tls),
        _ => return false,
    };

    let (dns, tls_ctx, ehlo_host, connect_ms, handle, sid) = {
        let mut state = shared.state();
        let dns = match &state.dns {
            Some(dns) => dns.clone(),
            None => return false,
        };
        let sid = state.next_session_id;
        state.next_session_id += 1;
        (
            dns,
            state.tls.clone(),
            state.ehlo_host.clone(),
            state.connect_ms,
            state.handle.clone(),
            sid,
        )
    };

    debug!(endpoint = %endpoint.describe(), sid, "opening smtp connection");
    let io = match net::client_create(&dns, &address, port) {
        Ok(io) => io,
        Err(err) => {
            on_endpoint_connect_failure(shared, &endpoint, err, &err.to_string());
            return false;
        }
    };

    if implicit_tls {
        let ctx = tls_ctx.clone().expect("checked when endpoint was added");
        if let Err(err) = tls::client_add(&io, &ctx, &address) {
            io.destroy();
            on_endpoint_connect_failure(shared, &endpoint, err, "TLS layer setup failed");
            return false;
        }
    }

    {
        let mut errmsg = String::new();
        if !shared.events().iocreate(&io, &mut errmsg) {
            io.destroy();
            on_endpoint_connect_failure(shared, &endpoint, IoError::Invalid, &errmsg);
            return false;
        }
    }

    if connect_ms > 0 {
        io.set_connect_timeout(Duration::from_millis(connect_ms));
    }

    let session = Arc::new(Mutex::new(Session::new(
        endpoint.clone(),
        io.clone(),
        ehlo_host,
        implicit_tls,
    )));

    {
        let mut state = shared.state();
        state.sessions.insert(sid, session.clone());
        *state.active.entry(endpoint.id).or_insert(0) += 1;
    }

    let cb_shared = shared.clone();
    let cb_session = session.clone();
    handle.add(
        &io,
        Box::new(move |_el, etype, _io| {
            session_io_event(&cb_shared, sid, &cb_session, etype);
        }),
    );
    true
}

fn session_io_event(
    shared: &Arc<PoolShared>,
    sid: u64,
    session: &Arc<Mutex<Session>>,
    etype: EventType,
) {
    // Grab loop-shared config before touching the session; the state
    // lock is never held together with a session lock.
    let (tls_ctx, stall_ms) = {
        let state = shared.state();
        (state.tls.clone(), state.stall_ms)
    };

    if matches!(etype, EventType::Read | EventType::Write) && stall_ms > 0 {
        arm_stall_timer(shared, sid, session, stall_ms);
    }

    if etype == EventType::Connected {
        let (address, port, fresh) = {
            let s = session.lock().unwrap_or_else(|e| e.into_inner());
            match &s.endpoint.kind {
                EndpointKind::Tcp { address, port, .. } => {
                    (address.clone(), *port, s.awaiting_banner())
                }
                _ => (String::new(), 0, false),
            }
        };
        if fresh {
            shared.events().connect(&address, port);
        }
    }

    let events = {
        let mut s = session.lock().unwrap_or_else(|e| e.into_inner());
        s.handle_event(etype, tls_ctx.as_ref())
    };
    handle_session_events(shared, sid, session, events);
}

fn arm_stall_timer(
    shared: &Arc<PoolShared>,
    sid: u64,
    session: &Arc<Mutex<Session>>,
    stall_ms: u64,
) {
    let delay = Duration::from_millis(stall_ms);
    let mut state = shared.state();
    if let Some(t) = state.stall_timers.get(&sid) {
        t.reset(delay);
        return;
    }
    let cb_shared = shared.clone();
    let cb_session = session.clone();
    let timer = state.handle.timer_oneshot(
        delay,
        false,
        Box::new(move |_el| {
            debug!(sid, "smtp connection stalled");
            let events = {
                let mut s = cb_session.lock().unwrap_or_else(|e| e.into_inner());
                s.handle_event(EventType::Error, None)
            };
            handle_session_events(&cb_shared, sid, &cb_session, events);
        }),
    );
    state.stall_timers.insert(sid, timer);
}

/// Endpoint-level connect/greeting failure: backoff or removal, plus
/// failover-cycle accounting.
fn on_endpoint_connect_failure(
    shared: &Arc<PoolShared>,
    endpoint: &Arc<Endpoint>,
    err: IoError,
    error: &str,
) {
    let (address, port) = match &endpoint.kind {
        EndpointKind::Tcp { address, port, .. } => (address.clone(), *port),
        EndpointKind::Process { command, .. } => (command.clone(), 0),
    };

    warn!(endpoint = %endpoint.describe(), %err, error, "endpoint failure");
    let keep = shared.events().connect_fail(&address, port, err, error);

    let mut state = shared.state();
    if !keep {
        info!(endpoint = %endpoint.describe(), "endpoint removed from pool");
        state.endpoints.retain(|ep| ep.id != endpoint.id);
        state.failover_idx = state.failover_idx.min(state.endpoints.len().saturating_sub(1));
        if state.endpoints.is_empty() {
            state.reported_no_endpoints = false;
        }
        return;
    }

    let backoff = endpoint.note_failure();

    if state.mode == PoolMode::Failover {
        state.failover_idx += 1;
        if state.failover_idx >= state.endpoints.len() {
            // Every endpoint has had its turn: the cycle failed.
            state.failover_idx = 0;
            drop(state);
            let delay = shared.events().processing_halted(false);
            let mut state = shared.state();
            if delay == 0 {
                info!("processing halted until resume");
                state.stopped = true;
            } else {
                state.halted = true;
                arm_retry_timer(shared, &mut state, Duration::from_secs(delay));
            }
            return;
        }
        kick(&mut state);
    } else {
        arm_retry_timer(shared, &mut state, backoff);
    }
}

/// Apply a batch of session events to the pool.
fn handle_session_events(
    shared: &Arc<PoolShared>,
    sid: u64,
    session: &Arc<Mutex<Session>>,
    events: Vec<SessionEvent>,
) {
    let mut work: std::collections::VecDeque<SessionEvent> = events.into();

    while let Some(event) = work.pop_front() {
        match event {
            SessionEvent::NeedNextMessage => {
                let stopping = shared.state().stopping;
                if stopping {
                    let mut quit_events = Vec::new();
                    {
                        let mut s = session.lock().unwrap_or_else(|e| e.into_inner());
                        s.quit(&mut quit_events);
                    }
                    work.extend(quit_events);
                    continue;
                }
                let msg = {
                    let mut state = shared.state();
                    release_session_timers(&mut state, sid);
                    next_message(shared, &mut state)
                };
                match msg {
                    Some(msg) => {
                        let mut give_events = Vec::new();
                        {
                            let mut s = session.lock().unwrap_or_else(|e| e.into_inner());
                            s.give_message(msg, &mut give_events);
                        }
                        work.extend(give_events);
                    }
                    None => park_idle_session(shared, sid, session),
                }
            }
            SessionEvent::Sent(msg) => {
                if !msg.synthetic {
                    debug!(from = ?msg.meta.from, "message sent");
                    shared.events().sent(&msg.meta.headers);
                }
                let mut state = shared.state();
                report_drained(shared, &mut state);
            }
            SessionEvent::Failed {
                msg,
                reply: _,
                error,
                transient,
                wait_secs,
            } => {
                on_message_failed(shared, msg, &error, transient, wait_secs);
            }
            SessionEvent::ConnectFailed { error, err } => {
                let endpoint = session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .endpoint
                    .clone();
                on_endpoint_connect_failure(shared, &endpoint, err, &error);
            }
            SessionEvent::Closed => {
                let (address, port) = {
                    let s = session.lock().unwrap_or_else(|e| e.into_inner());
                    match &s.endpoint.kind {
                        EndpointKind::Tcp { address, port, .. } => (address.clone(), *port),
                        _ => (String::new(), 0),
                    }
                };
                shared.events().disconnect(&address, port);
            }
        }
    }

    // A session that died (for any reason) is cleaned up once its
    // event batch has been applied.
    let closed = session
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .is_closed();
    if closed {
        cleanup_session(shared, sid, session);
    }
}

fn cleanup_session(shared: &Arc<PoolShared>, sid: u64, session: &Arc<Mutex<Session>>) {
    let (endpoint, io) = {
        let s = session.lock().unwrap_or_else(|e| e.into_inner());
        (s.endpoint.clone(), s.io.clone())
    };
    let more = {
        let mut state = shared.state();
        state.sessions.remove(&sid);
        release_session_timers(&mut state, sid);
        if let Some(n) = state.active.get_mut(&endpoint.id) {
            *n = n.saturating_sub(1);
        }
        state.handle.destroy_io(&io);
        report_drained(shared, &mut state);
        !state.queue.is_empty()
    };
    if more {
        process_queue(shared);
    }
}

fn on_message_failed(
    shared: &Arc<PoolShared>,
    mut msg: QueuedMessage,
    error: &str,
    transient: bool,
    wait_secs: u64,
) {
    if msg.synthetic {
        return;
    }

    let external = shared.state().external.is_some();
    if external {
        shared
            .events()
            .send_failed(&msg.meta.headers, error, 0, false);
        shared.events().reschedule(&msg.raw, wait_secs);
        return;
    }

    let (attempt, can_requeue) = {
        let state = shared.state();
        let attempt = msg.attempts + 1;
        (attempt, transient && attempt < state.num_attempts)
    };
    let requeue = shared
        .events()
        .send_failed(&msg.meta.headers, error, attempt, can_requeue);

    let mut state = shared.state();
    if requeue && can_requeue {
        msg.attempts = attempt;
        msg.not_before = Instant::now() + Duration::from_secs(wait_secs);
        if state.queue.push_front(msg) {
            arm_retry_timer(shared, &mut state, Duration::from_secs(wait_secs));
        }
    } else {
        debug!(attempt, "message dropped after failure");
        report_drained(shared, &mut state);
    }
}

/// Lease one message for a process endpoint and deliver it on a worker
/// thread. Returns false when no message was available.
fn start_process_delivery(shared: &Arc<PoolShared>, endpoint: Arc<Endpoint>) -> bool {
    let msg = {
        let mut state = shared.state();
        match next_message(shared, &mut state) {
            Some(msg) => {
                *state.active.entry(endpoint.id).or_insert(0) += 1;
                msg
            }
            None => return false,
        }
    };

    let (command, args, env, timeout_ms) = match &endpoint.kind {
        EndpointKind::Process {
            command,
            args,
            env,
            timeout_ms,
        } => (command.clone(), args.clone(), env.clone(), *timeout_ms),
        _ => return false,
    };

    let cb_shared = shared.clone();
    std::thread::spawn(move || {
        let outcome = process::deliver(&command, &args, env.as_ref(), timeout_ms, &msg.raw);
        {
            let mut state = cb_shared.state();
            if let Some(n) = state.active.get_mut(&endpoint.id) {
                *n = n.saturating_sub(1);
            }
        }
        match outcome {
            Ok(outcome) if outcome.success => {
                endpoint.note_success();
                if !msg.synthetic {
                    cb_shared.events().sent(&msg.meta.headers);
                }
                let mut state = cb_shared.state();
                report_drained(&cb_shared, &mut state);
                kick(&mut state);
            }
            Ok(outcome) => {
                let keep = cb_shared.events().process_fail(
                    &command,
                    outcome.exit_code,
                    &outcome.stdout,
                    &outcome.stderr,
                );
                if !keep {
                    let mut state = cb_shared.state();
                    state.endpoints.retain(|ep| ep.id != endpoint.id);
                }
                endpoint.note_failure();
                on_message_failed(
                    &cb_shared,
                    msg,
                    &format!("process exited with code {}", outcome.exit_code),
                    true,
                    60,
                );
                let mut state = cb_shared.state();
                kick(&mut state);
            }
            Err(err) => {
                let keep = cb_shared
                    .events()
                    .process_fail(&command, -1, "", &err.to_string());
                if !keep {
                    let mut state = cb_shared.state();
                    state.endpoints.retain(|ep| ep.id != endpoint.id);
                }
                endpoint.note_failure();
                on_message_failed(&cb_shared, msg, &err.to_string(), true, 60);
                let mut state = cb_shared.state();
                kick(&mut state);
            }
        }
    });
    true
}
