use std::{convert::TryFrom, io, sync::Arc, time::SystemTime};

use rustls::{ClientConfig, ClientConnection, OwnedTrustAnchor, RootCertStore, ServerName};
use tracing::{debug, trace};

use crate::{
    io::{Io, IoLayer, LayerCtx, SoftDir},
    EventType, IoError, IoState,
};

/// Shared TLS client context. Reference-counted so it can outlive any io
/// that was built from it.
#[derive(Clone)]
pub struct TlsClientCtx {
    config: Arc<ClientConfig>,
}

impl TlsClientCtx {
    /// Context trusting the bundled webpki roots.
    pub fn new() -> TlsClientCtx {
        let mut roots = RootCertStore::empty();
        roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsClientCtx {
            config: Arc::new(config),
        }
    }

    /// Context that skips server certificate verification. For test rigs
    /// and closed networks only.
    pub fn insecure() -> TlsClientCtx {
        struct NoCertVerifier;
        impl rustls::client::ServerCertVerifier for NoCertVerifier {
            fn verify_server_cert(
                &self,
                _end_entity: &rustls::Certificate,
                _intermediates: &[rustls::Certificate],
                _server_name: &ServerName,
                _scts: &mut dyn Iterator<Item = &[u8]>,
                _ocsp_response: &[u8],
                _now: SystemTime,
            ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
                Ok(rustls::client::ServerCertVerified::assertion())
            }
        }
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth();
        TlsClientCtx {
            config: Arc::new(config),
        }
    }

    pub fn from_config(config: Arc<ClientConfig>) -> TlsClientCtx {
        TlsClientCtx { config }
    }
}

impl Default for TlsClientCtx {
    fn default() -> TlsClientCtx {
        TlsClientCtx::new()
    }
}

/// Stack a TLS client layer on top of `io`. The handshake starts when
/// the layer below reports `Connected`; the layer swallows events until
/// the handshake finishes and then surfaces its own `Connected`.
pub fn client_add(io: &Io, ctx: &TlsClientCtx, server_name: &str) -> Result<(), IoError> {
    let name = ServerName::try_from(server_name).map_err(|_| IoError::TlsSetupFailure)?;
    let conn = ClientConnection::new(ctx.config.clone(), name)
        .map_err(|_| IoError::TlsSetupFailure)?;
    io.add_layer(Box::new(TlsLayer {
        conn,
        state: IoState::Init,
        err: None,
        errmsg: None,
    }))
}

struct TlsLayer {
    conn: ClientConnection,
    state: IoState,
    err: Option<IoError>,
    errmsg: Option<String>,
}

// io::Read/Write adapters so rustls can move TLS records through the
// layers beneath this one.
struct LowerIo<'a, 'b> {
    ctx: &'a mut LayerCtx<'b>,
}

impl io::Read for LowerIo<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.ctx.read_lower(buf) {
            Ok(n) => Ok(n),
            Err(IoError::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Err(IoError::Disconnect) => Ok(0),
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err.to_string())),
        }
    }
}

impl io::Write for LowerIo<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.ctx.write_lower(buf) {
            Ok(n) => Ok(n),
            Err(IoError::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err.to_string())),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TlsLayer {
    fn fail(&mut self, ctx: &mut LayerCtx<'_>, err: IoError, msg: String) -> IoError {
        debug!(error = %msg, "tls failure");
        self.state = IoState::Error;
        self.err = Some(err);
        self.errmsg = Some(msg);
        ctx.queue_soft_event(EventType::Error, SoftDir::Up);
        err
    }

    /// Move pending TLS records in both directions; returns false on a
    /// fatal TLS error.
    fn pump(&mut self, ctx: &mut LayerCtx<'_>) -> Result<(), IoError> {
        loop {
            let mut progressed = false;

            while self.conn.wants_write() {
                match self.conn.write_tls(&mut LowerIo { ctx }) {
                    Ok(0) => break,
                    Ok(_) => progressed = true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        ctx.request_write();
                        break;
                    }
                    Err(e) => {
                        return Err(self.fail(ctx, IoError::from_io(&e), e.to_string()));
                    }
                }
            }

            if self.conn.wants_read() {
                match self.conn.read_tls(&mut LowerIo { ctx }) {
                    Ok(0) => {
                        // Clean EOF below us; nothing more will arrive.
                    }
                    Ok(_) => {
                        progressed = true;
                        if let Err(e) = self.conn.process_new_packets() {
                            let msg = e.to_string();
                            let kind = if self.conn.is_handshaking() {
                                IoError::TlsSetupFailure
                            } else {
                                IoError::Invalid
                            };
                            return Err(self.fail(ctx, kind, msg));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        return Err(self.fail(ctx, IoError::from_io(&e), e.to_string()));
                    }
                }
            }

            if !progressed {
                return Ok(());
            }

            if self.state == IoState::Connecting && !self.conn.is_handshaking() {
                trace!("tls handshake complete");
                self.state = IoState::Connected;
                ctx.queue_soft_event(EventType::Connected, SoftDir::Up);
            }
        }
    }
}

impl IoLayer for TlsLayer {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn read(&mut self, ctx: &mut LayerCtx<'_>, buf: &mut [u8]) -> Result<usize, IoError> {
        if self.state != IoState::Connected {
            return Err(IoError::WouldBlock);
        }
        match io::Read::read(&mut self.conn.reader(), buf) {
            Ok(0) => Err(IoError::Disconnect), // close_notify or EOF
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // No plaintext buffered; pull more records up, then
                // retry once. The pump runs until it stops progressing,
                // so this cannot spin.
                self.pump(ctx)?;
                match io::Read::read(&mut self.conn.reader(), buf) {
                    Ok(0) => Err(IoError::Disconnect),
                    Ok(n) => Ok(n),
                    Err(_) => Err(IoError::WouldBlock),
                }
            }
            Err(e) => Err(self.fail(ctx, IoError::Invalid, e.to_string())),
        }
    }

    fn write(&mut self, ctx: &mut LayerCtx<'_>, buf: &[u8]) -> Result<usize, IoError> {
        if self.state != IoState::Connected {
            return Err(IoError::WouldBlock);
        }
        let n = io::Write::write(&mut self.conn.writer(), buf)
            .map_err(|e| self.fail(ctx, IoError::Invalid, e.to_string()))?;
        self.pump(ctx)?;
        Ok(n)
    }

    fn process_event(&mut self, ctx: &mut LayerCtx<'_>, event: EventType) -> bool {
        match event {
            EventType::Connected => {
                // Transport is up: run the handshake from here on.
                self.state = IoState::Connecting;
                let _ = self.pump(ctx);
                true
            }
            EventType::Read | EventType::Write if self.state == IoState::Connecting => {
                let _ = self.pump(ctx);
                true
            }
            EventType::Write if self.state == IoState::Connected && self.conn.wants_write() => {
                let _ = self.pump(ctx);
                false
            }
            EventType::Disconnected => {
                if self.state != IoState::Error {
                    self.state = IoState::Disconnected;
                }
                false
            }
            EventType::Error => {
                if self.state != IoState::Disconnected {
                    self.state = IoState::Error;
                }
                false
            }
            _ => false,
        }
    }

    fn state(&self) -> Option<IoState> {
        match self.state {
            // Before the lower transport connects we defer, so the io
            // reports Connecting/Init from the socket layer.
            IoState::Init => None,
            st => Some(st),
        }
    }

    fn error_message(&self, out: &mut String) -> bool {
        match &self.errmsg {
            Some(msg) => {
                out.push_str(msg);
                true
            }
            None => false,
        }
    }

    fn disconnect(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        if self.state == IoState::Connected {
            self.conn.send_close_notify();
            let _ = self.pump(ctx);
        }
        true
    }
}
