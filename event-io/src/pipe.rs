use std::os::unix::net::UnixStream;

use crate::{
    io::Io,
    net::{NetLayer, Stream},
    IoError,
};

/// An in-process connected io pair (backed by a unix socketpair), used
/// to exercise layer stacks and protocol readers without touching the
/// network. Both ends start `Connected`; each one delivers a
/// `Connected` event on its first loop tick.
pub fn pair() -> Result<(Io, Io), IoError> {
    let (a, b) = UnixStream::pair().map_err(|e| IoError::from_io(&e))?;
    a.set_nonblocking(true).map_err(|e| IoError::from_io(&e))?;
    b.set_nonblocking(true).map_err(|e| IoError::from_io(&e))?;
    Ok((
        Io::from_layers(vec![Box::new(NetLayer::connected(Stream::Unix(a)))]),
        Io::from_layers(vec![Box::new(NetLayer::connected(Stream::Unix(b)))]),
    ))
}
