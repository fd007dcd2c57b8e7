use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, trace};

use event_io::{tls, EventType, Io, IoError, TlsClientCtx};
use netbuf::{Buf, Parser};

use crate::{
    endpoint::{Endpoint, EndpointKind},
    message::dot_stuff,
    queue::QueuedMessage,
    reply::{parse_reply, Reply, ReplyKind},
};

bitflags! {
    pub struct Extensions: u8 {
        const STARTTLS   = 0b0001;
        const AUTH_PLAIN = 0b0010;
        const AUTH_LOGIN = 0b0100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Banner,
    EhloSent,
    StartTlsSent,
    TlsHandshake,
    AuthPlainSent,
    AuthLoginSent,
    AuthLoginUserSent,
    AuthLoginPassSent,
    Ready,
    MailSent,
    RcptSent,
    DataSent,
    BodySent,
    QuitSent,
    Closed,
}

/// What the dialogue produced; the pool turns these into queue and
/// callback activity.
pub enum SessionEvent {
    /// The session is connected, authenticated, and between messages.
    NeedNextMessage,
    /// The current message was accepted by the server.
    Sent(QueuedMessage),
    /// The current message was refused or the connection died under it.
    Failed {
        msg: QueuedMessage,
        reply: Option<Reply>,
        error: String,
        transient: bool,
        wait_secs: u64,
    },
    /// The connection could not be established or died before any
    /// message was owned.
    ConnectFailed { error: String, err: IoError },
    /// Clean end of the session.
    Closed,
}

/// One ESMTP client dialogue over one io: banner, EHLO, opportunistic
/// STARTTLS, AUTH, then MAIL/RCPT/DATA per message until the pool runs
/// out of work and asks for QUIT.
pub struct Session {
    pub endpoint: Arc<Endpoint>,
    pub io: Io,
    phase: Phase,
    parser: Parser<'static>,
    outbuf: Buf,
    msg: Option<QueuedMessage>,
    exts: Extensions,
    ehlo_host: String,
    did_tls: bool,
    rcpt_idx: usize,
}

impl Session {
    pub fn new(endpoint: Arc<Endpoint>, io: Io, ehlo_host: String, implicit_tls: bool) -> Session {
        Session {
            endpoint,
            io,
            phase: Phase::Banner,
            parser: Parser::new(),
            outbuf: Buf::new(),
            msg: None,
            exts: Extensions::empty(),
            ehlo_host,
            did_tls: implicit_tls,
            rcpt_idx: 0,
        }
    }

    pub fn has_message(&self) -> bool {
        self.msg.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Ready && self.msg.is_none()
    }

    /// Still waiting for the server greeting (nothing spoken yet).
    pub fn awaiting_banner(&self) -> bool {
        self.phase == Phase::Banner
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Take back the in-flight message, e.g. when the pool pauses.
    pub fn take_message(&mut self) -> Option<QueuedMessage> {
        self.msg.take()
    }

    fn creds(&self) -> Option<(&str, &str)> {
        match &self.endpoint.kind {
            EndpointKind::Tcp {
                username: Some(u),
                password: Some(p),
                ..
            } => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    fn command(&mut self, line: &str) {
        trace!(endpoint = %self.endpoint.describe(), cmd = line, "sending command");
        self.outbuf.add_str(line);
        self.outbuf.add_str("\r\n");
    }

    fn flush(&mut self, events: &mut Vec<SessionEvent>) {
        match self.io.write_from_buf(&mut self.outbuf) {
            Ok(_) => {}
            Err(err) if err.is_wouldblock() => {}
            Err(err) => self.fail_connection(err, events),
        }
    }

    fn fail_connection(&mut self, err: IoError, events: &mut Vec<SessionEvent>) {
        let error = {
            let msg = self.io.error_message();
            if msg.is_empty() {
                err.to_string()
            } else {
                msg
            }
        };
        self.phase = Phase::Closed;
        match self.msg.take() {
            Some(msg) => events.push(SessionEvent::Failed {
                msg,
                reply: None,
                error,
                transient: true,
                wait_secs: 60,
            }),
            None => events.push(SessionEvent::ConnectFailed { error, err }),
        }
    }

    /// Start delivering `msg`; only valid when [`Session::is_idle`].
    pub fn give_message(&mut self, msg: QueuedMessage, events: &mut Vec<SessionEvent>) {
        debug_assert!(self.is_idle());
        let from = msg.meta.from.clone().unwrap_or_default();
        self.msg = Some(msg);
        self.rcpt_idx = 0;
        self.command(&format!("MAIL FROM:<{}>", from));
        self.phase = Phase::MailSent;
        self.flush(events);
    }

    /// Ask the session to wind down once the current message (if any)
    /// completes.
    pub fn quit(&mut self, events: &mut Vec<SessionEvent>) {
        if self.phase == Phase::Ready && self.msg.is_none() {
            self.command("QUIT");
            self.phase = Phase::QuitSent;
            self.flush(events);
        }
    }

    /// Drive the dialogue from an io event. `tls_ctx` is needed to
    /// stack the TLS layer when the server accepts STARTTLS.
    pub fn handle_event(
        &mut self,
        etype: EventType,
        tls_ctx: Option<&TlsClientCtx>,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        match etype {
            EventType::Connected => {
                if self.phase == Phase::TlsHandshake {
                    // STARTTLS finished; the server identity must be
                    // re-learned over the secure channel.
                    self.did_tls = true;
                    self.exts = Extensions::empty();
                    self.command(&format!("EHLO {}", self.ehlo_host));
                    self.phase = Phase::EhloSent;
                }
                self.flush(&mut events);
            }
            EventType::Read => {
                let mut parser = std::mem::take(&mut self.parser);
                let res = self.io.read_into_parser(&mut parser);
                self.parser = parser;
                if let Err(err) = res {
                    if err != IoError::Disconnect {
                        self.fail_connection(err, &mut events);
                        return events;
                    }
                }
                loop {
                    let mut parser = std::mem::take(&mut self.parser);
                    let parsed = parse_reply(&mut parser);
                    self.parser = parser;
                    match parsed {
                        Ok(Some(reply)) => {
                            self.on_reply(reply, tls_ctx, &mut events);
                            if self.phase == Phase::Closed {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            debug!(%error, "unparseable reply");
                            self.fail_connection(IoError::Invalid, &mut events);
                            break;
                        }
                    }
                }
            }
            EventType::Write => self.flush(&mut events),
            EventType::Disconnected => {
                if self.phase == Phase::QuitSent {
                    self.phase = Phase::Closed;
                    events.push(SessionEvent::Closed);
                } else if self.phase != Phase::Closed {
                    self.fail_connection(IoError::Disconnect, &mut events);
                }
            }
            EventType::Error => {
                let err = self.io.last_error().unwrap_or(IoError::Internal);
                self.fail_connection(err, &mut events);
            }
            EventType::Accept | EventType::Other => {}
        }
        events
    }

    fn fail_message(&mut self, reply: Reply, events: &mut Vec<SessionEvent>) {
        if let Some(msg) = self.msg.take() {
            let transient = !reply.is_permanent();
            let wait_secs = reply.reschedule_wait_secs();
            let error = reply.to_message();
            events.push(SessionEvent::Failed {
                msg,
                reply: Some(reply),
                error,
                transient,
                wait_secs,
            });
            // The server refused the message, not the connection; reset
            // the transaction and offer to take another.
            self.command("RSET");
            self.phase = Phase::Ready;
            self.flush(events);
            events.push(SessionEvent::NeedNextMessage);
        }
    }

    fn on_reply(
        &mut self,
        reply: Reply,
        tls_ctx: Option<&TlsClientCtx>,
        events: &mut Vec<SessionEvent>,
    ) {
        trace!(code = reply.code, phase = ?self.phase, "reply");
        match self.phase {
            Phase::Banner => {
                if reply.kind() != ReplyKind::PositiveCompletion {
                    return self.refuse(reply, events);
                }
                self.command(&format!("EHLO {}", self.ehlo_host));
                self.phase = Phase::EhloSent;
                self.flush(events);
            }
            Phase::EhloSent => {
                if reply.kind() != ReplyKind::PositiveCompletion {
                    return self.refuse(reply, events);
                }
                for line in reply.lines.iter().skip(1) {
                    let upper = line.to_ascii_uppercase();
                    if upper == "STARTTLS" {
                        self.exts.insert(Extensions::STARTTLS);
                    } else if let Some(mechs) = upper.strip_prefix("AUTH ") {
                        for mech in mechs.split_whitespace() {
                            match mech {
                                "PLAIN" => self.exts.insert(Extensions::AUTH_PLAIN),
                                "LOGIN" => self.exts.insert(Extensions::AUTH_LOGIN),
                                _ => {}
                            }
                        }
                    }
                }
                if !self.did_tls
                    && self.exts.contains(Extensions::STARTTLS)
                    && tls_ctx.is_some()
                {
                    self.command("STARTTLS");
                    self.phase = Phase::StartTlsSent;
                    self.flush(events);
                } else {
                    self.after_greeting(events);
                }
            }
            Phase::StartTlsSent => {
                if reply.kind() == ReplyKind::PositiveCompletion {
                    let ctx = tls_ctx.expect("STARTTLS only sent with a context");
                    let host = match &self.endpoint.kind {
                        EndpointKind::Tcp { address, .. } => address.clone(),
                        _ => String::new(),
                    };
                    if let Err(err) = tls::client_add(&self.io, ctx, &host) {
                        return self.fail_connection(err, events);
                    }
                    // Kick the TLS layer exactly as a fresh transport
                    // connect would.
                    self.io.queue_event(EventType::Connected);
                    self.phase = Phase::TlsHandshake;
                } else {
                    // Server refused STARTTLS; carry on in the clear.
                    debug!(endpoint = %self.endpoint.describe(), "STARTTLS refused, continuing without");
                    self.after_greeting(events);
                }
            }
            Phase::TlsHandshake => {
                // Replies are not expected mid-handshake; ignore.
            }
            Phase::AuthPlainSent => {
                if reply.kind() != ReplyKind::PositiveCompletion {
                    return self.refuse(reply, events);
                }
                self.ready(events);
            }
            Phase::AuthLoginSent => {
                if reply.code != 334 {
                    return self.refuse(reply, events);
                }
                let user = self.creds().map(|(u, _)| u.to_string()).unwrap_or_default();
                self.command(&base64::encode(user));
                self.phase = Phase::AuthLoginUserSent;
                self.flush(events);
            }
            Phase::AuthLoginUserSent => {
                if reply.code != 334 {
                    return self.refuse(reply, events);
                }
                let pass = self.creds().map(|(_, p)| p.to_string()).unwrap_or_default();
                self.command(&base64::encode(pass));
                self.phase = Phase::AuthLoginPassSent;
                self.flush(events);
            }
            Phase::AuthLoginPassSent => {
                if reply.kind() != ReplyKind::PositiveCompletion {
                    return self.refuse(reply, events);
                }
                self.ready(events);
            }
            Phase::Ready => {
                // Unsolicited reply (e.g. RSET acknowledgement); drop.
            }
            Phase::MailSent => {
                if reply.kind() != ReplyKind::PositiveCompletion {
                    return self.fail_message(reply, events);
                }
                self.send_next_rcpt(events);
            }
            Phase::RcptSent => {
                if reply.kind() != ReplyKind::PositiveCompletion {
                    return self.fail_message(reply, events);
                }
                self.send_next_rcpt(events);
            }
            Phase::DataSent => {
                if reply.kind() != ReplyKind::PositiveIntermediate {
                    return self.fail_message(reply, events);
                }
                let body = dot_stuff(&self.msg.as_ref().expect("in transaction").raw);
                self.outbuf.add_bytes(&body);
                self.phase = Phase::BodySent;
                self.flush(events);
            }
            Phase::BodySent => {
                if reply.kind() != ReplyKind::PositiveCompletion {
                    return self.fail_message(reply, events);
                }
                let msg = self.msg.take().expect("in transaction");
                self.endpoint.note_success();
                self.phase = Phase::Ready;
                events.push(SessionEvent::Sent(msg));
                events.push(SessionEvent::NeedNextMessage);
            }
            Phase::QuitSent => {
                self.phase = Phase::Closed;
                self.io.disconnect();
                events.push(SessionEvent::Closed);
            }
            Phase::Closed => {}
        }
    }

    /// A pre-transaction refusal: the connection is unusable.
    fn refuse(&mut self, reply: Reply, events: &mut Vec<SessionEvent>) {
        let err = if reply.is_permanent() {
            IoError::ProtoNotSupported
        } else {
            IoError::Disconnect
        };
        self.phase = Phase::Closed;
        self.io.disconnect();
        match self.msg.take() {
            Some(msg) => {
                let wait_secs = reply.reschedule_wait_secs();
                let error = reply.to_message();
                let transient = !reply.is_permanent();
                events.push(SessionEvent::Failed {
                    msg,
                    reply: Some(reply),
                    error,
                    transient,
                    wait_secs,
                });
            }
            None => events.push(SessionEvent::ConnectFailed {
                error: reply.to_message(),
                err,
            }),
        }
    }

    fn after_greeting(&mut self, events: &mut Vec<SessionEvent>) {
        let creds = self
            .creds()
            .map(|(u, p)| (u.to_string(), p.to_string()));
        if let Some((user, pass)) = creds {
            if self.exts.contains(Extensions::AUTH_PLAIN) || !self.exts.contains(Extensions::AUTH_LOGIN) {
                let token = base64::encode(format!("\0{}\0{}", user, pass));
                self.command(&format!("AUTH PLAIN {}", token));
                self.phase = Phase::AuthPlainSent;
            } else {
                self.command("AUTH LOGIN");
                self.phase = Phase::AuthLoginSent;
            }
            self.flush(events);
            return;
        }
        self.ready(events);
    }

    fn ready(&mut self, events: &mut Vec<SessionEvent>) {
        self.phase = Phase::Ready;
        events.push(SessionEvent::NeedNextMessage);
    }

    fn send_next_rcpt(&mut self, events: &mut Vec<SessionEvent>) {
        let rcpts = &self.msg.as_ref().expect("in transaction").meta.rcpts;
        if self.rcpt_idx < rcpts.len() {
            let rcpt = rcpts[self.rcpt_idx].clone();
            self.rcpt_idx += 1;
            self.command(&format!("RCPT TO:<{}>", rcpt));
            self.phase = Phase::RcptSent;
        } else {
            self.command("DATA");
            self.phase = Phase::DataSent;
        }
        self.flush(events);
    }
}
