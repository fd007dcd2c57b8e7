use std::{
    io::{Read, Write},
    net::{IpAddr, Shutdown, SocketAddr, TcpStream},
    os::unix::io::{AsRawFd, RawFd},
    os::unix::net::UnixStream,
    sync::Arc,
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::trace;

use crate::{
    io::{Io, IoLayer, LayerCtx, SoftDir},
    EventType, IoError, IoState,
};

/// Shared DNS handle. Clones are cheap; the underlying resolver is
/// reference-counted so it can outlive any io that borrowed it.
#[derive(Clone)]
pub struct Dns {
    resolver: Arc<trust_dns_resolver::Resolver>,
}

impl Dns {
    /// Resolver configured from the system (`/etc/resolv.conf`), with a
    /// fallback to the library defaults on hosts without one.
    pub fn new() -> Result<Dns, IoError> {
        let resolver = trust_dns_resolver::Resolver::from_system_conf()
            .or_else(|_| {
                trust_dns_resolver::Resolver::new(Default::default(), Default::default())
            })
            .map_err(|_| IoError::NotFound)?;
        Ok(Dns {
            resolver: Arc::new(resolver),
        })
    }

    pub fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, IoError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let lookup = self.resolver.lookup_ip(host).map_err(|_| IoError::NotFound)?;
        let ips: Vec<IpAddr> = lookup.iter().collect();
        if ips.is_empty() {
            return Err(IoError::NotFound);
        }
        Ok(ips)
    }
}

pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => (&*s).read(buf),
            Stream::Unix(s) => (&*s).read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => (&*s).write(buf),
            Stream::Unix(s) => (&*s).write(buf),
        }
    }

    fn shutdown_write(&self) {
        let _ = match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Write),
            Stream::Unix(s) => s.shutdown(Shutdown::Write),
        };
    }

    fn take_error(&self) -> Option<std::io::Error> {
        match self {
            Stream::Tcp(s) => s.take_error().ok().flatten(),
            Stream::Unix(s) => s.take_error().ok().flatten(),
        }
    }

    fn fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// Layer 0 over a stream socket: non-blocking reads/writes, connect
/// completion, EOF and error detection.
pub(crate) struct NetLayer {
    stream: Stream,
    state: IoState,
    peer: Option<SocketAddr>,
    err: Option<IoError>,
}

impl NetLayer {
    pub(crate) fn connected(stream: Stream) -> NetLayer {
        NetLayer {
            stream,
            state: IoState::Connected,
            peer: None,
            err: None,
        }
    }

    fn fail(&mut self, ctx: &mut LayerCtx<'_>, err: IoError) -> IoError {
        self.state = IoState::Error;
        self.err = Some(err);
        ctx.queue_soft_event(EventType::Error, SoftDir::Up);
        err
    }
}

impl IoLayer for NetLayer {
    fn name(&self) -> &'static str {
        "net"
    }

    fn read(&mut self, ctx: &mut LayerCtx<'_>, buf: &mut [u8]) -> Result<usize, IoError> {
        if self.state == IoState::Disconnected {
            return Err(IoError::Disconnect);
        }
        if self.state != IoState::Connected && self.state != IoState::Disconnecting {
            return Err(IoError::WouldBlock);
        }
        match self.stream.read(buf) {
            Ok(0) => {
                if buf.is_empty() {
                    return Ok(0);
                }
                self.state = IoState::Disconnected;
                ctx.queue_soft_event(EventType::Disconnected, SoftDir::Up);
                Err(IoError::Disconnect)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                let err = IoError::from_io(&e);
                if err.is_wouldblock() {
                    return Err(err);
                }
                if err == IoError::Disconnect {
                    self.state = IoState::Disconnected;
                    ctx.queue_soft_event(EventType::Disconnected, SoftDir::Up);
                    return Err(err);
                }
                Err(self.fail(ctx, err))
            }
        }
    }

    fn write(&mut self, ctx: &mut LayerCtx<'_>, buf: &[u8]) -> Result<usize, IoError> {
        if self.state != IoState::Connected {
            return Err(IoError::WouldBlock);
        }
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let err = IoError::from_io(&e);
                if err.is_wouldblock() {
                    ctx.request_write();
                    return Err(err);
                }
                if err == IoError::Disconnect {
                    self.state = IoState::Disconnected;
                    ctx.queue_soft_event(EventType::Disconnected, SoftDir::Up);
                    return Err(err);
                }
                Err(self.fail(ctx, err))
            }
        }
    }

    fn process_event(&mut self, ctx: &mut LayerCtx<'_>, event: EventType) -> bool {
        match (self.state, event) {
            (IoState::Connecting, EventType::Write) => {
                // Writability while connecting is the connect verdict.
                match self.stream.take_error() {
                    Some(e) => {
                        self.fail(ctx, IoError::from_io(&e));
                    }
                    None => {
                        trace!(peer = ?self.peer, "socket connected");
                        self.state = IoState::Connected;
                        ctx.queue_soft_event(EventType::Connected, SoftDir::Up);
                    }
                }
                true
            }
            (IoState::Connecting, EventType::Read) => true,
            (_, EventType::Error) => {
                if self.state != IoState::Disconnected {
                    self.state = IoState::Error;
                }
                false
            }
            _ => false,
        }
    }

    fn state(&self) -> Option<IoState> {
        Some(self.state)
    }

    fn error_message(&self, out: &mut String) -> bool {
        match &self.err {
            Some(err) => {
                out.push_str(&err.to_string());
                true
            }
            None => false,
        }
    }

    fn disconnect(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        if self.state == IoState::Connected {
            self.state = IoState::Disconnecting;
            self.stream.shutdown_write();
            ctx.queue_soft_event(EventType::Disconnected, SoftDir::Up);
            self.state = IoState::Disconnected;
        }
        false
    }

    fn source(&self) -> Option<RawFd> {
        Some(self.stream.fd())
    }

    fn destroy(&mut self) {
        self.state = IoState::Disconnected;
    }
}

/// Create a client io connecting to `host:port`. Resolution happens up
/// front through `dns`; the connect itself is non-blocking and completes
/// on the event loop (callback sees `Connected` or `Error`).
pub fn client_create(dns: &Dns, host: &str, port: u16) -> Result<Io, IoError> {
    let ips = dns.resolve(host)?;
    let ip = ips[0];
    let addr = SocketAddr::new(ip, port);

    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| IoError::from_io(&e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| IoError::from_io(&e))?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(IoError::from_io(&e)),
    }

    trace!(%host, port, ip = %ip, "starting non-blocking connect");

    let stream: TcpStream = socket.into();
    let layer = NetLayer {
        stream: Stream::Tcp(stream),
        state: IoState::Connecting,
        peer: Some(addr),
        err: None,
    };
    Ok(Io::from_layers(vec![Box::new(layer)]))
}

/// Set TCP keepalive parameters on a client io whose base layer is a TCP
/// socket.
pub fn set_keepalives(
    io: &Io,
    idle: Duration,
    interval: Duration,
    retries: u32,
) -> Result<(), IoError> {
    let core = io.acquire();
    let fd = core.source().ok_or(IoError::Invalid)?;
    let sock = socket2::SockRef::from(&fd);
    let ka = TcpKeepalive::new()
        .with_time(idle)
        .with_interval(interval)
        .with_retries(retries);
    sock.set_tcp_keepalive(&ka).map_err(|e| IoError::from_io(&e))
}

/// Listening socket layer; readability is surfaced as `Accept` events.
struct ListenerLayer {
    listener: std::net::TcpListener,
    state: IoState,
}

impl IoLayer for ListenerLayer {
    fn name(&self) -> &'static str {
        "net-listener"
    }

    fn read(&mut self, _ctx: &mut LayerCtx<'_>, _buf: &mut [u8]) -> Result<usize, IoError> {
        Err(IoError::Invalid)
    }

    fn write(&mut self, _ctx: &mut LayerCtx<'_>, _buf: &[u8]) -> Result<usize, IoError> {
        Err(IoError::Invalid)
    }

    fn process_event(&mut self, ctx: &mut LayerCtx<'_>, event: EventType) -> bool {
        if event == EventType::Read {
            ctx.queue_soft_event(EventType::Accept, SoftDir::Up);
            return true;
        }
        false
    }

    fn state(&self) -> Option<IoState> {
        Some(self.state)
    }

    fn source(&self) -> Option<RawFd> {
        Some(self.listener.as_raw_fd())
    }

    fn destroy(&mut self) {
        self.state = IoState::Disconnected;
    }
}

/// Bind a listening io on `addr` (e.g. `"127.0.0.1:0"`).
pub fn server_create(addr: &str) -> Result<Io, IoError> {
    let listener = std::net::TcpListener::bind(addr).map_err(|e| IoError::from_io(&e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| IoError::from_io(&e))?;
    Ok(Io::from_layers(vec![Box::new(ListenerLayer {
        listener,
        state: IoState::Listening,
    })]))
}

/// The local address a listener io is bound to.
pub fn local_addr(io: &Io) -> Result<SocketAddr, IoError> {
    let core = io.acquire();
    let fd = core.source().ok_or(IoError::Invalid)?;
    let sock = socket2::SockRef::from(&fd);
    let addr = sock.local_addr().map_err(|e| IoError::from_io(&e))?;
    addr.as_socket().ok_or(IoError::Invalid)
}

/// Accept one pending connection from a listening io, as a fresh
/// connected client io ready to be registered.
pub fn accept(io: &Io) -> Result<Io, IoError> {
    let core = io.acquire();
    let fd = core.source().ok_or(IoError::Invalid)?;
    let sock = socket2::SockRef::from(&fd);
    let (socket, peer) = sock.accept().map_err(|e| IoError::from_io(&e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| IoError::from_io(&e))?;
    trace!(peer = ?peer.as_socket(), "accepted connection");
    let stream: TcpStream = socket.into();
    let mut layer = NetLayer::connected(Stream::Tcp(stream));
    layer.peer = peer.as_socket();
    Ok(Io::from_layers(vec![Box::new(layer)]))
}
