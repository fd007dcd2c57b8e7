//! Readiness-driven event loop with stacked non-blocking I/O layers.
//!
//! An [`Io`] is an ordered stack of [`IoLayer`]s over one OS resource:
//! socket at the bottom, then optionally TLS, tracing, or user layers.
//! An [`EventLoop`] drives any number of ios on one thread, delivering
//! `Connected`/`Read`/`Write`/`Disconnected`/`Error`/`Accept` events to
//! per-io callbacks, plus timers and cross-thread [`Trigger`] wakeups.
//!
//! ```no_run
//! use event_io::{net, Dns, EventLoop, EventType};
//!
//! let el = EventLoop::new().unwrap();
//! let dns = Dns::new().unwrap();
//! let io = net::client_create(&dns, "example.com", 80).unwrap();
//! el.add(&io, Box::new(|_el, event, io| {
//!     if event == EventType::Connected {
//!         let _ = io.write(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
//!     }
//! }));
//! el.run(None);
//! ```

mod error;
mod event;
mod io;
pub mod net;
pub mod pipe;
pub mod tls;
pub mod trace;

pub use error::{EventType, IoError, IoState};
pub use event::{
    EventLoop, IoCallback, LoopHandle, RunOutcome, Timer, TimerCallback, Trigger, TriggerCallback,
};
pub use io::{Io, IoLayer, LayerCtx, SoftDir};
pub use net::Dns;
pub use tls::TlsClientCtx;
