use crate::{
    io::{Io, IoLayer, LayerCtx},
    EventType, IoError,
};

/// Which side of the wire a traced chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDir {
    /// Bytes read from the layer below (inbound).
    Read,
    /// Bytes written to the layer below (outbound).
    Write,
}

pub type TraceCb = Box<dyn FnMut(TraceDir, &[u8]) + Send>;

/// Stack a trace layer on `io`; `cb` observes every chunk crossing this
/// point of the stack. The callback runs on the loop that drives the io
/// and must not block.
pub fn add(io: &Io, cb: TraceCb) -> Result<(), IoError> {
    io.add_layer(Box::new(TraceLayer { cb }))
}

struct TraceLayer {
    cb: TraceCb,
}

impl IoLayer for TraceLayer {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn read(&mut self, ctx: &mut LayerCtx<'_>, buf: &mut [u8]) -> Result<usize, IoError> {
        let n = ctx.read_lower(buf)?;
        (self.cb)(TraceDir::Read, &buf[..n]);
        Ok(n)
    }

    fn write(&mut self, ctx: &mut LayerCtx<'_>, buf: &[u8]) -> Result<usize, IoError> {
        let n = ctx.write_lower(buf)?;
        (self.cb)(TraceDir::Write, &buf[..n]);
        Ok(n)
    }

    fn process_event(&mut self, _ctx: &mut LayerCtx<'_>, _event: EventType) -> bool {
        false
    }
}
