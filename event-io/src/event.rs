use std::{
    cell::RefCell,
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tracing::{trace, warn};

use crate::{
    io::{Io, SoftDir},
    EventType, IoError, IoState,
};

/// How a call to [`EventLoop::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing left to wait on: no ios, timers, or triggers.
    Done,
    /// Someone called [`EventLoop::return_early`] / [`LoopHandle::return_early`].
    ReturnedEarly,
    /// The run timeout elapsed.
    Timeout,
    /// The loop was already running on another call frame.
    Misuse,
}

pub type IoCallback = Box<dyn FnMut(&EventLoop, EventType, &Io) + Send>;
pub type TimerCallback = Box<dyn FnMut(&EventLoop) + Send>;
pub type TriggerCallback = Box<dyn FnMut(&EventLoop) + Send>;

enum Command {
    AddIo(Io, IoCallback),
    EditIoCb(Io, IoCallback),
    DestroyIo(Io),
    AddTimer(Arc<TimerInner>, TimerCallback, Option<Duration>, bool),
    ResetTimer(Arc<TimerInner>, Duration),
    StopTimer(Arc<TimerInner>),
    RemoveTimer(Arc<TimerInner>),
    AddTrigger(Arc<TriggerInner>, TriggerCallback),
    RemoveTrigger(Arc<TriggerInner>),
}

struct Shared {
    poller: polling::Poller,
    commands: Mutex<Vec<Command>>,
    running: AtomicBool,
    return_early: AtomicBool,
    next_id: AtomicUsize,
}

impl Shared {
    fn push(&self, cmd: Command) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cmd);
        let _ = self.poller.notify();
    }

    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub(crate) struct TimerInner {
    id: usize,
    armed: AtomicBool,
    gen: AtomicU64,
    shared: Arc<Shared>,
}

/// Handle to a timer registered on a loop. Fires on the thread running
/// [`EventLoop::run`]. Once removed (or after an autoremove fire) it
/// never fires again, even if a deadline was already due.
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// (Re-)arm the timer `delay` from now, cancelling any pending fire.
    pub fn reset(&self, delay: Duration) {
        self.inner.gen.fetch_add(1, Ordering::SeqCst);
        self.inner.armed.store(true, Ordering::SeqCst);
        self.inner
            .shared
            .push(Command::ResetTimer(self.inner.clone(), delay));
    }

    /// Disarm without unregistering; `reset` can re-arm later.
    pub fn stop(&self) {
        self.inner.gen.fetch_add(1, Ordering::SeqCst);
        self.inner.armed.store(false, Ordering::SeqCst);
        self.inner.shared.push(Command::StopTimer(self.inner.clone()));
    }

    /// Unregister entirely. The callback will not run afterwards.
    pub fn remove(&self) {
        self.inner.gen.fetch_add(1, Ordering::SeqCst);
        self.inner.armed.store(false, Ordering::SeqCst);
        self.inner
            .shared
            .push(Command::RemoveTimer(self.inner.clone()));
    }

    /// Whether the timer is currently armed.
    pub fn status(&self) -> bool {
        self.inner.armed.load(Ordering::SeqCst)
    }
}

pub(crate) struct TriggerInner {
    id: usize,
    fired: AtomicBool,
    shared: Arc<Shared>,
}

/// Cross-thread wakeup: [`Trigger::signal`] queues an
/// [`EventType::Other`] callback on the owning loop's next tick. Safe to
/// call from any thread, does not allocate, coalesces repeated signals.
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

impl Trigger {
    pub fn signal(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        let _ = self.inner.shared.poller.notify();
    }

    /// Unregister from the loop.
    pub fn remove(&self) {
        self.inner
            .shared
            .push(Command::RemoveTrigger(self.inner.clone()));
    }
}

impl Clone for Trigger {
    fn clone(&self) -> Trigger {
        Trigger {
            inner: self.inner.clone(),
        }
    }
}

struct IoReg {
    io: Io,
    cb: Option<IoCallback>,
    fd: i32,
}

struct TimerReg {
    inner: Arc<TimerInner>,
    cb: TimerCallback,
    gen: u64,
    autoremove: bool,
}

struct TriggerReg {
    inner: Arc<TriggerInner>,
    cb: TriggerCallback,
}

struct Local {
    ios: HashMap<usize, IoReg>,
    timers: HashMap<usize, TimerReg>,
    timer_heap: BinaryHeap<Reverse<(Instant, usize, u64)>>,
    triggers: HashMap<usize, TriggerReg>,
    pending: VecDeque<(usize, EventType)>,
}

/// Single-threaded readiness loop driving a set of [`Io`]s, timers, and
/// triggers. Callbacks for everything registered here run serialized on
/// the thread that calls [`EventLoop::run`].
///
/// Registration is allowed from any thread through a [`LoopHandle`];
/// the loop drains those registrations at the top of every tick.
pub struct EventLoop {
    shared: Arc<Shared>,
    local: RefCell<Local>,
}

/// Clonable, `Send` handle for registering work on an [`EventLoop`] from
/// other threads.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl EventLoop {
    pub fn new() -> std::io::Result<EventLoop> {
        Ok(EventLoop {
            shared: Arc::new(Shared {
                poller: polling::Poller::new()?,
                commands: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                return_early: AtomicBool::new(false),
                next_id: AtomicUsize::new(1),
            }),
            local: RefCell::new(Local {
                ios: HashMap::new(),
                timers: HashMap::new(),
                timer_heap: BinaryHeap::new(),
                triggers: HashMap::new(),
                pending: VecDeque::new(),
            }),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Register `io`, taking joint ownership. Events are delivered to
    /// `cb` until the loop exits or the io is destroyed.
    pub fn add(&self, io: &Io, cb: IoCallback) -> bool {
        self.handle().add(io, cb)
    }

    /// Atomically swap the callback registered for `io`.
    pub fn edit_io_cb(&self, io: &Io, cb: IoCallback) {
        self.handle().edit_io_cb(io, cb)
    }

    /// Unregister and tear down `io` on the next tick.
    pub fn destroy_io(&self, io: &Io) {
        self.handle().destroy_io(io)
    }

    /// A timer that fires once, `delay` from now. With `autoremove` the
    /// registration disappears after the fire; otherwise `Timer::reset`
    /// re-arms it.
    pub fn timer_oneshot(&self, delay: Duration, autoremove: bool, cb: TimerCallback) -> Timer {
        self.handle().timer_oneshot(delay, autoremove, cb)
    }

    /// An unarmed timer; arm it with [`Timer::reset`].
    pub fn timer_add(&self, cb: TimerCallback) -> Timer {
        self.handle().timer_add(cb)
    }

    pub fn trigger_add(&self, cb: TriggerCallback) -> Trigger {
        self.handle().trigger_add(cb)
    }

    /// Make the current (or next) `run` return `ReturnedEarly`.
    pub fn return_early(&self) {
        self.handle().return_early()
    }

    /// Drive the loop. `None` runs until nothing is left registered.
    pub fn run(&self, timeout: Option<Duration>) -> RunOutcome {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return RunOutcome::Misuse;
        }
        let outcome = self.run_inner(timeout);
        self.shared.running.store(false, Ordering::SeqCst);
        outcome
    }

    fn run_inner(&self, timeout: Option<Duration>) -> RunOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = Vec::new();

        loop {
            self.drain_commands();
            self.deliver_pending();

            if self.shared.return_early.swap(false, Ordering::SeqCst) {
                return RunOutcome::ReturnedEarly;
            }
            if self.is_drained() {
                return RunOutcome::Done;
            }

            let now = Instant::now();
            if let Some(d) = deadline {
                if now >= d {
                    return RunOutcome::Timeout;
                }
            }

            let mut wait = deadline.map(|d| d - now);
            if let Some(t) = self.next_deadline() {
                let until = t.saturating_duration_since(now);
                wait = Some(wait.map_or(until, |w| w.min(until)));
            }

            events.clear();
            if let Err(err) = self.shared.poller.wait(&mut events, wait) {
                if err.kind() != std::io::ErrorKind::Interrupted {
                    warn!(error = %err, "poller wait failed");
                    return RunOutcome::Done;
                }
            }

            for ev in events.iter() {
                self.dispatch_io(ev.key, ev.readable, ev.writable);
            }
            self.fire_timers();
            self.fire_triggers();
            self.check_connect_deadlines();
        }
    }

    fn is_drained(&self) -> bool {
        let local = self.local.borrow();
        local.ios.is_empty()
            && local.timers.is_empty()
            && local.triggers.is_empty()
            && local.pending.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        let local = self.local.borrow();
        let mut next = local.timer_heap.peek().map(|Reverse((at, _, _))| *at);
        for reg in local.ios.values() {
            if let Some(d) = reg.io.acquire().connect_deadline {
                next = Some(next.map_or(d, |n: Instant| n.min(d)));
            }
        }
        next
    }

    fn drain_commands(&self) {
        let cmds = {
            let mut guard = self
                .shared
                .commands
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for cmd in cmds {
            match cmd {
                Command::AddIo(io, cb) => self.register_io(io, cb),
                Command::EditIoCb(io, cb) => {
                    let key = io.acquire().loop_key;
                    if let Some(key) = key {
                        if let Some(reg) = self.local.borrow_mut().ios.get_mut(&key) {
                            reg.cb = Some(cb);
                        }
                    }
                }
                Command::DestroyIo(io) => {
                    if let Some(key) = io.acquire().loop_key {
                        self.unregister_io(key);
                    } else {
                        io.destroy();
                    }
                }
                Command::AddTimer(inner, cb, delay, autoremove) => {
                    let id = inner.id;
                    let gen = inner.gen.load(Ordering::SeqCst);
                    let mut local = self.local.borrow_mut();
                    if let Some(delay) = delay {
                        let at = Instant::now() + delay;
                        local.timer_heap.push(Reverse((at, id, gen)));
                    }
                    local.timers.insert(
                        id,
                        TimerReg {
                            inner,
                            cb,
                            gen,
                            autoremove,
                        },
                    );
                }
                Command::ResetTimer(inner, delay) => {
                    let gen = inner.gen.load(Ordering::SeqCst);
                    let mut local = self.local.borrow_mut();
                    if let Some(reg) = local.timers.get_mut(&inner.id) {
                        reg.gen = gen;
                    }
                    let at = Instant::now() + delay;
                    local.timer_heap.push(Reverse((at, inner.id, gen)));
                }
                Command::StopTimer(inner) => {
                    let gen = inner.gen.load(Ordering::SeqCst);
                    if let Some(reg) = self.local.borrow_mut().timers.get_mut(&inner.id) {
                        reg.gen = gen;
                    }
                }
                Command::RemoveTimer(inner) => {
                    self.local.borrow_mut().timers.remove(&inner.id);
                }
                Command::AddTrigger(inner, cb) => {
                    let id = inner.id;
                    self.local
                        .borrow_mut()
                        .triggers
                        .insert(id, TriggerReg { inner, cb });
                }
                Command::RemoveTrigger(inner) => {
                    self.local.borrow_mut().triggers.remove(&inner.id);
                }
            }
        }
    }

    fn register_io(&self, io: Io, cb: IoCallback) {
        let key = self.shared.next_id();
        let mut core = io.acquire();
        if let Err(err) = core.init_layers() {
            warn!(error = %err, "io layer init failed at registration");
            core.last_error = Some(err);
        }
        core.loop_key = Some(key);
        if let Some(t) = core.connect_timeout {
            if core.state() == IoState::Connecting {
                core.connect_deadline = Some(Instant::now() + t);
            }
        }
        let fd = match core.source() {
            Some(fd) => fd,
            None => {
                drop(core);
                warn!("io has no pollable source; dropping registration");
                return;
            }
        };
        let state = core.state();
        let interest = polling::Event {
            key,
            readable: true,
            writable: state == IoState::Connecting || core.want_write,
        };
        if let Err(err) = self.shared.poller.add(fd, interest) {
            warn!(error = %err, "poller add failed");
        }
        drop(core);
        let mut local = self.local.borrow_mut();
        local.ios.insert(
            key,
            IoReg {
                io,
                cb: Some(cb),
                fd,
            },
        );
        // An io that is already usable announces itself on the first
        // tick (in-process pipes, accepted sockets).
        if state == IoState::Connected {
            local.pending.push_back((key, EventType::Connected));
        }
    }

    fn unregister_io(&self, key: usize) {
        let reg = self.local.borrow_mut().ios.remove(&key);
        if let Some(reg) = reg {
            let _ = self.shared.poller.delete(reg.fd);
            let mut core = reg.io.acquire();
            core.loop_key = None;
            core.destroy();
            drop(core);
            reg.io.shared.cond.notify_all();
        }
    }

    fn dispatch_io(&self, key: usize, readable: bool, writable: bool) {
        let io = match self.local.borrow().ios.get(&key) {
            Some(reg) => reg.io.clone(),
            None => return,
        };

        let mut deliver: Vec<EventType> = Vec::new();
        {
            let mut core = io.acquire();
            if writable {
                core.want_write = false;
                if let Some(ev) = core.filter_event(EventType::Write) {
                    deliver.push(ev);
                }
            }
            if readable {
                if let Some(ev) = core.filter_event(EventType::Read) {
                    deliver.push(ev);
                }
            }
            // Soft events queued by layers during filtering.
            while let Some(soft) = core.soft.pop_front() {
                match soft.dir {
                    SoftDir::Up => {
                        if let Some(ev) = core.filter_event(soft.event) {
                            deliver.push(ev);
                        }
                    }
                    SoftDir::Down => {
                        core.filter_event(soft.event);
                    }
                }
            }
        }

        for ev in deliver {
            self.run_io_cb(key, ev, &io);
        }
        self.collect_soft(key, &io);
        self.rearm(key, &io);
        io.shared.cond.notify_all();
    }

    /// Move soft events queued by layers (during callback-driven reads
    /// and writes) into the pending queue for next-tick delivery.
    fn collect_soft(&self, key: usize, io: &Io) {
        let mut filtered = Vec::new();
        {
            let mut core = io.acquire();
            while let Some(soft) = core.soft.pop_front() {
                match soft.dir {
                    SoftDir::Up => {
                        if let Some(ev) = core.filter_event(soft.event) {
                            filtered.push(ev);
                        }
                    }
                    SoftDir::Down => {
                        core.filter_event(soft.event);
                    }
                }
            }
        }
        let mut local = self.local.borrow_mut();
        for ev in filtered {
            local.pending.push_back((key, ev));
        }
    }

    fn run_io_cb(&self, key: usize, ev: EventType, io: &Io) {
        trace!(key, event = ?ev, "delivering io event");
        // The callback is moved out while it runs so re-entrant loop
        // calls cannot alias it; registration commands queue instead.
        let cb = match self.local.borrow_mut().ios.get_mut(&key) {
            Some(reg) => reg.cb.take(),
            None => None,
        };
        let mut cb = match cb {
            Some(cb) => cb,
            None => return,
        };
        cb(self, ev, io);
        if let Some(reg) = self.local.borrow_mut().ios.get_mut(&key) {
            if reg.cb.is_none() {
                reg.cb = Some(cb);
            }
        }
        self.drain_commands();
        if matches!(ev, EventType::Disconnected | EventType::Error) {
            // Terminal events: the io is done from the loop's point of
            // view unless the callback re-registered it elsewhere.
            if io.acquire().state().is_terminal() {
                self.unregister_io(key);
            }
        }
    }

    fn rearm(&self, key: usize, io: &Io) {
        let local = self.local.borrow();
        let reg = match local.ios.get(&key) {
            Some(reg) => reg,
            None => return,
        };
        let core = io.acquire();
        if core.destroyed {
            return;
        }
        let state = core.state();
        if state.is_terminal() {
            return;
        }
        let interest = polling::Event {
            key,
            readable: true,
            writable: state == IoState::Connecting || core.want_write,
        };
        if let Err(err) = self.shared.poller.modify(reg.fd, interest) {
            warn!(error = %err, "poller modify failed");
        }
    }

    fn deliver_pending(&self) {
        loop {
            let next = self.local.borrow_mut().pending.pop_front();
            let (key, ev) = match next {
                Some(p) => p,
                None => break,
            };
            let io = match self.local.borrow().ios.get(&key) {
                Some(reg) => reg.io.clone(),
                None => continue,
            };
            self.run_io_cb(key, ev, &io);
            self.collect_soft(key, &io);
            self.rearm(key, &io);
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut local = self.local.borrow_mut();
                match local.timer_heap.peek() {
                    Some(Reverse((at, _, _))) if *at <= now => {
                        let Reverse((_, id, gen)) = local.timer_heap.pop().unwrap();
                        Some((id, gen))
                    }
                    _ => None,
                }
            };
            let (id, gen) = match due {
                Some(d) => d,
                None => break,
            };
            // Stale heap entries (reset/stopped since scheduling) are
            // skipped: gen mismatch means cancellation won the race.
            let cb = {
                let mut local = self.local.borrow_mut();
                match local.timers.get_mut(&id) {
                    Some(reg)
                        if reg.gen == gen && reg.inner.gen.load(Ordering::SeqCst) == gen =>
                    {
                        reg.inner.armed.store(false, Ordering::SeqCst);
                        let autoremove = reg.autoremove;
                        if autoremove {
                            local.timers.remove(&id).map(|r| r.cb)
                        } else {
                            None
                        }
                    }
                    _ => continue,
                }
            };
            match cb {
                Some(mut cb) => cb(self),
                None => {
                    // Non-autoremove timer: borrow the callback for the call.
                    let cb_opt = {
                        let mut local = self.local.borrow_mut();
                        local.timers.remove(&id)
                    };
                    if let Some(mut reg) = cb_opt {
                        (reg.cb)(self);
                        let mut local = self.local.borrow_mut();
                        local.timers.entry(id).or_insert(reg);
                    }
                }
            }
            self.drain_commands();
        }
    }

    fn fire_triggers(&self) {
        let ids: Vec<usize> = {
            let local = self.local.borrow();
            local
                .triggers
                .iter()
                .filter(|(_, reg)| reg.inner.fired.swap(false, Ordering::SeqCst))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            let reg = self.local.borrow_mut().triggers.remove(&id);
            if let Some(mut reg) = reg {
                (reg.cb)(self);
                self.local.borrow_mut().triggers.entry(id).or_insert(reg);
            }
            self.drain_commands();
        }
    }

    fn check_connect_deadlines(&self) {
        let now = Instant::now();
        let keys: Vec<usize> = {
            let local = self.local.borrow();
            local
                .ios
                .iter()
                .filter(|(_, reg)| {
                    let core = reg.io.acquire();
                    core.state() == IoState::Connecting
                        && core.connect_deadline.map_or(false, |d| d <= now)
                })
                .map(|(k, _)| *k)
                .collect()
        };
        for key in keys {
            let io = match self.local.borrow().ios.get(&key) {
                Some(reg) => reg.io.clone(),
                None => continue,
            };
            {
                let mut core = io.acquire();
                core.connect_deadline = None;
                core.last_error = Some(IoError::TimedOut);
                core.filter_event(EventType::Error);
            }
            self.run_io_cb(key, EventType::Error, &io);
            io.shared.cond.notify_all();
        }
    }
}

impl LoopHandle {
    pub fn add(&self, io: &Io, cb: IoCallback) -> bool {
        if io.acquire().loop_key.is_some() {
            return false;
        }
        self.shared.push(Command::AddIo(io.clone(), cb));
        true
    }

    pub fn edit_io_cb(&self, io: &Io, cb: IoCallback) {
        self.shared.push(Command::EditIoCb(io.clone(), cb));
    }

    pub fn destroy_io(&self, io: &Io) {
        self.shared.push(Command::DestroyIo(io.clone()));
    }

    pub fn timer_oneshot(&self, delay: Duration, autoremove: bool, cb: TimerCallback) -> Timer {
        let inner = Arc::new(TimerInner {
            id: self.shared.next_id(),
            armed: AtomicBool::new(true),
            gen: AtomicU64::new(0),
            shared: self.shared.clone(),
        });
        self.shared
            .push(Command::AddTimer(inner.clone(), cb, Some(delay), autoremove));
        Timer { inner }
    }

    pub fn timer_add(&self, cb: TimerCallback) -> Timer {
        let inner = Arc::new(TimerInner {
            id: self.shared.next_id(),
            armed: AtomicBool::new(false),
            gen: AtomicU64::new(0),
            shared: self.shared.clone(),
        });
        self.shared
            .push(Command::AddTimer(inner.clone(), cb, None, false));
        Timer { inner }
    }

    pub fn trigger_add(&self, cb: TriggerCallback) -> Trigger {
        let inner = Arc::new(TriggerInner {
            id: self.shared.next_id(),
            fired: AtomicBool::new(false),
            shared: self.shared.clone(),
        });
        self.shared.push(Command::AddTrigger(inner.clone(), cb));
        Trigger { inner }
    }

    pub fn return_early(&self) {
        self.shared.return_early.store(true, Ordering::SeqCst);
        let _ = self.shared.poller.notify();
    }
}
