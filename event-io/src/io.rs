use std::{
    collections::VecDeque,
    os::unix::io::RawFd,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use netbuf::Buf;

use crate::{EventType, IoError, IoState};

/// Where a layer-queued soft event is headed.
///
/// `Up` events are filtered through the layer stack and then delivered to
/// the io's registered callback on the next loop tick; `Down` events stop
/// at the layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftDir {
    Up,
    Down,
}

pub(crate) struct SoftEvent {
    pub event: EventType,
    pub dir: SoftDir,
}

/// One element of an [`Io`]'s stack.
///
/// Layer 0 is the OS resource; every layer above it reads and writes
/// through [`LayerCtx::read_lower`] / [`LayerCtx::write_lower`]. Events
/// propagate bottom-up through [`IoLayer::process_event`]; a layer that
/// returns true consumes the event and stops the propagation.
pub trait IoLayer: Send {
    fn name(&self) -> &'static str;

    /// Called once when the io is registered with an event loop.
    fn init(&mut self, _ctx: &mut LayerCtx<'_>) -> Result<(), IoError> {
        Ok(())
    }

    fn read(&mut self, ctx: &mut LayerCtx<'_>, buf: &mut [u8]) -> Result<usize, IoError>;

    fn write(&mut self, ctx: &mut LayerCtx<'_>, buf: &[u8]) -> Result<usize, IoError>;

    /// Filter an event on its way up the stack. Return true to consume.
    fn process_event(&mut self, _ctx: &mut LayerCtx<'_>, _event: EventType) -> bool {
        false
    }

    /// This layer's view of the io state, or `None` to defer to the
    /// layer below (pass-through layers like tracing defer).
    fn state(&self) -> Option<IoState> {
        None
    }

    /// Append a human-readable error description. Return true if this
    /// layer had anything to say.
    fn error_message(&self, _out: &mut String) -> bool {
        false
    }

    /// Begin a graceful disconnect. Return true when the request should
    /// keep propagating to the layer below.
    fn disconnect(&mut self, _ctx: &mut LayerCtx<'_>) -> bool {
        true
    }

    /// The pollable OS handle, for layer 0 only.
    fn source(&self) -> Option<RawFd> {
        None
    }

    /// Release OS resources. Must be idempotent.
    fn destroy(&mut self) {}
}

/// Borrowed view a layer gets of everything beneath it for the duration
/// of one call. Layers never hold a reference back to their io; this is
/// the only channel between a layer and the rest of the stack.
pub struct LayerCtx<'a> {
    lower: &'a mut [Box<dyn IoLayer>],
    soft: &'a mut VecDeque<SoftEvent>,
    want_write: &'a mut bool,
}

impl<'a> LayerCtx<'a> {
    pub fn read_lower(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        match self.lower.split_last_mut() {
            Some((top, rest)) => top.read(
                &mut LayerCtx {
                    lower: rest,
                    soft: self.soft,
                    want_write: self.want_write,
                },
                buf,
            ),
            None => Err(IoError::Internal),
        }
    }

    pub fn write_lower(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        match self.lower.split_last_mut() {
            Some((top, rest)) => top.write(
                &mut LayerCtx {
                    lower: rest,
                    soft: self.soft,
                    want_write: self.want_write,
                },
                buf,
            ),
            None => Err(IoError::Internal),
        }
    }

    pub fn disconnect_lower(&mut self) -> bool {
        match self.lower.split_last_mut() {
            Some((top, rest)) => top.disconnect(&mut LayerCtx {
                lower: rest,
                soft: self.soft,
                want_write: self.want_write,
            }),
            None => true,
        }
    }

    /// State reported by the stack beneath this layer.
    pub fn lower_state(&self) -> IoState {
        for layer in self.lower.iter().rev() {
            if let Some(st) = layer.state() {
                return st;
            }
        }
        IoState::Init
    }

    /// Queue a soft event for delivery after the current event finishes
    /// processing.
    pub fn queue_soft_event(&mut self, event: EventType, dir: SoftDir) {
        self.soft.push_back(SoftEvent { event, dir });
    }

    /// Ask the loop to re-arm write interest; the next writability of
    /// the OS resource will be delivered as a `Write` event.
    pub fn request_write(&mut self) {
        *self.want_write = true;
    }
}

pub(crate) struct IoCore {
    pub layers: Vec<Box<dyn IoLayer>>,
    pub soft: VecDeque<SoftEvent>,
    pub want_write: bool,
    pub last_error: Option<IoError>,
    pub connect_deadline: Option<Instant>,
    pub connect_timeout: Option<Duration>,
    pub loop_key: Option<usize>,
    pub destroyed: bool,
}

impl IoCore {
    fn new(layers: Vec<Box<dyn IoLayer>>) -> IoCore {
        IoCore {
            layers,
            soft: VecDeque::new(),
            want_write: false,
            last_error: None,
            connect_deadline: None,
            connect_timeout: None,
            loop_key: None,
            destroyed: false,
        }
    }

    pub fn state(&self) -> IoState {
        if self.destroyed {
            return IoState::Disconnected;
        }
        for layer in self.layers.iter().rev() {
            if let Some(st) = layer.state() {
                return st;
            }
        }
        IoState::Init
    }

    pub fn source(&self) -> Option<RawFd> {
        self.layers.first().and_then(|l| l.source())
    }

    fn with_top<R>(
        &mut self,
        f: impl FnOnce(&mut dyn IoLayer, &mut LayerCtx<'_>) -> R,
    ) -> Result<R, IoError> {
        let (top, rest) = match self.layers.split_last_mut() {
            Some(split) => split,
            None => return Err(IoError::Invalid),
        };
        let mut ctx = LayerCtx {
            lower: rest,
            soft: &mut self.soft,
            want_write: &mut self.want_write,
        };
        Ok(f(top.as_mut(), &mut ctx))
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let res = self.with_top(|top, ctx| top.read(ctx, buf))?;
        if let Err(err) = &res {
            self.note_error(*err);
        }
        res
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        let res = self.with_top(|top, ctx| top.write(ctx, buf))?;
        if let Err(err) = &res {
            self.note_error(*err);
        }
        res
    }

    fn note_error(&mut self, err: IoError) {
        if !err.is_wouldblock() {
            self.last_error = Some(err);
        }
    }

    /// Run an event up the stack. Returns the event to hand to the
    /// user's callback, or `None` if a layer consumed it.
    pub fn filter_event(&mut self, event: EventType) -> Option<EventType> {
        for i in 0..self.layers.len() {
            let (below, above) = self.layers.split_at_mut(i);
            let layer = &mut above[0];
            let mut ctx = LayerCtx {
                lower: below,
                soft: &mut self.soft,
                want_write: &mut self.want_write,
            };
            if layer.process_event(&mut ctx, event) {
                return None;
            }
        }
        Some(event)
    }

    pub fn init_layers(&mut self) -> Result<(), IoError> {
        for i in 0..self.layers.len() {
            let (below, above) = self.layers.split_at_mut(i);
            let layer = &mut above[0];
            let mut ctx = LayerCtx {
                lower: below,
                soft: &mut self.soft,
                want_write: &mut self.want_write,
            };
            layer.init(&mut ctx)?;
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        for i in (0..self.layers.len()).rev() {
            let (below, above) = self.layers.split_at_mut(i);
            let layer = &mut above[0];
            let mut ctx = LayerCtx {
                lower: below,
                soft: &mut self.soft,
                want_write: &mut self.want_write,
            };
            if !layer.disconnect(&mut ctx) {
                break;
            }
        }
    }

    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for layer in self.layers.iter_mut().rev() {
            layer.destroy();
        }
        self.destroyed = true;
    }

    pub fn error_message(&self) -> String {
        let mut out = String::new();
        for layer in self.layers.iter().rev() {
            if layer.error_message(&mut out) {
                return out;
            }
        }
        if let Some(err) = &self.last_error {
            out.push_str(&err.to_string());
        }
        out
    }
}

/// A stacked non-blocking byte channel: an ordered set of
/// [`IoLayer`]s over one OS resource.
///
/// `Io` is a shared handle; the event loop holds a clone while the io is
/// registered. All access to internal state goes through the io's lock
/// (see [`Io::acquire`]); the loop never runs two callbacks for the same
/// io concurrently.
#[derive(Clone)]
pub struct Io {
    pub(crate) shared: Arc<IoShared>,
}

pub(crate) struct IoShared {
    pub core: Mutex<IoCore>,
    /// Signaled by the loop after every state change, so blocking
    /// helpers can park without spinning.
    pub cond: Condvar,
}

impl Io {
    /// Build an io from an ordered layer stack, layer 0 first.
    pub fn from_layers(layers: Vec<Box<dyn IoLayer>>) -> Io {
        Io {
            shared: Arc::new(IoShared {
                core: Mutex::new(IoCore::new(layers)),
                cond: Condvar::new(),
            }),
        }
    }

    /// Push a layer on top of the stack. Before registration this is
    /// always safe; on a registered io it must only be called from that
    /// io's own callback (the loop holds no layer borrow while
    /// callbacks run), which is how STARTTLS restacks a connection.
    pub fn add_layer(&self, layer: Box<dyn IoLayer>) -> Result<(), IoError> {
        let mut core = self.acquire();
        if core.destroyed {
            return Err(IoError::Invalid);
        }
        core.layers.push(layer);
        Ok(())
    }

    pub(crate) fn acquire(&self) -> MutexGuard<'_, IoCore> {
        self.shared.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> IoState {
        self.acquire().state()
    }

    /// Raw fd of the underlying OS resource, while one exists. For
    /// diagnostics and emergency direct-write paths.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.acquire().source()
    }

    pub fn last_error(&self) -> Option<IoError> {
        self.acquire().last_error
    }

    pub fn error_message(&self) -> String {
        self.acquire().error_message()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        self.acquire().read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, IoError> {
        self.acquire().write(buf)
    }

    /// Drain as much of `buf` as the stack will take, removing written
    /// bytes from its front. `Err(WouldBlock)` means "partial progress,
    /// wait for the next Write event".
    pub fn write_from_buf(&self, buf: &mut Buf) -> Result<usize, IoError> {
        let mut total = 0;
        let mut core = self.acquire();
        while !buf.is_empty() {
            match core.write(buf.peek()) {
                Ok(0) => break,
                Ok(n) => {
                    buf.drop_front(n);
                    total += n;
                }
                Err(err) => {
                    if err.is_wouldblock() && total > 0 {
                        return Err(IoError::WouldBlock);
                    }
                    return Err(err);
                }
            }
        }
        Ok(total)
    }

    /// Append everything currently readable into `parser`. Returns the
    /// number of bytes appended; `Ok(0)` simply means nothing was ready.
    pub fn read_into_parser(&self, parser: &mut netbuf::Parser<'static>) -> Result<usize, IoError> {
        let mut chunk = [0u8; 16 * 1024];
        let mut total = 0;
        let mut core = self.acquire();
        loop {
            match core.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    parser.append(&chunk[..n]);
                    total += n;
                }
                Err(IoError::WouldBlock) => break,
                Err(err) => {
                    if total > 0 {
                        break;
                    }
                    return Err(err);
                }
            }
        }
        Ok(total)
    }

    /// Request a graceful disconnect; the callback will see a
    /// `Disconnected` event once the stack has wound down.
    pub fn disconnect(&self) {
        self.acquire().disconnect();
    }

    /// Queue a soft event as if a layer had produced it. Used by
    /// protocol drivers that restack layers mid-connection (STARTTLS):
    /// queueing `Connected` re-runs the connected handling through the
    /// new stack on the next loop tick.
    pub fn queue_event(&self, event: EventType) {
        self.acquire().soft.push_back(SoftEvent {
            event,
            dir: SoftDir::Up,
        });
    }

    /// Tear down all layers immediately. Idempotent.
    pub fn destroy(&self) {
        self.acquire().destroy();
        self.shared.cond.notify_all();
    }

    /// Cap on how long a `Connecting` io may take before the loop fails
    /// it with `TimedOut`.
    pub fn set_connect_timeout(&self, timeout: Duration) {
        let mut core = self.acquire();
        core.connect_timeout = Some(timeout);
        if core.state() == IoState::Connecting {
            core.connect_deadline = Some(Instant::now() + timeout);
        }
    }

    /// Park until the io reaches `target` (or any terminal state), with
    /// a bound on the wait. The io lock is released for the duration of
    /// the wait and reacquired before returning. Returns the state seen
    /// last.
    pub fn wait_state(&self, target: IoState, timeout: Duration) -> IoState {
        let deadline = Instant::now() + timeout;
        let mut core = self.acquire();
        loop {
            let st = core.state();
            if st == target || st.is_terminal() {
                return st;
            }
            let now = Instant::now();
            if now >= deadline {
                return st;
            }
            let (guard, _res) = self
                .shared
                .cond
                .wait_timeout(core, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            core = guard;
        }
    }

    pub(crate) fn same_io(&self, other: &Io) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.acquire();
        let names = core
            .layers
            .iter()
            .map(|l| l.name())
            .collect::<Vec<_>>()
            .join("/");
        write!(f, "Io[{}] {:?}", names, core.state())
    }
}
