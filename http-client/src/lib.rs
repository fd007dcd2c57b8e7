//! One-shot HTTP client over the event loop: issue a request, follow
//! redirects, enforce connect/stall/overall timeouts and a receive-size
//! cap, and deliver the parsed response through a single `done`
//! callback.
//!
//! The client owns nothing after completion: `done` fires exactly once
//! and all connection state is torn down before it runs. Cancelling
//! tears down without firing `done`.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};
use url::Url;

use event_io::{net, tls, Dns, EventType, Io, IoError, LoopHandle, Timer, TlsClientCtx};
use http_message::{
    read_message, write_request, Headers, HttpError, HttpMessage, Method, ReadResult, Response,
    WriteRequest,
};
use netbuf::{Buf, Parser};

/// Network-level failure classification reported through `done`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    #[error("could not create connection")]
    Create,

    #[error("connection refused")]
    ConnRefused,

    #[error("host not found")]
    NotFound,

    #[error("destination unreachable")]
    Unreachable,

    #[error("peer disconnected")]
    Disconnect,

    #[error("overall timeout exceeded")]
    Timeout,

    #[error("stalled: no read or write progress")]
    TimeoutStall,

    #[error("connection could not be established in time")]
    TimeoutConnect,

    #[error("TLS required but no client context configured")]
    TlsRequired,

    #[error("TLS setup failure")]
    TlsSetupFailure,

    #[error("wire data violates HTTP framing")]
    ProtoFormat,

    #[error("invalid redirect")]
    Redirect,

    #[error("maximum redirects reached")]
    RedirectLimit,

    #[error("response exceeded the receive size limit")]
    OverLimit,

    #[error("internal error")]
    Internal,
}

fn io_to_net_error(err: IoError) -> NetError {
    match err {
        IoError::ConnRefused => NetError::ConnRefused,
        IoError::NotFound => NetError::NotFound,
        IoError::Unreachable => NetError::Unreachable,
        IoError::Disconnect => NetError::Disconnect,
        IoError::TimedOut => NetError::Timeout,
        IoError::TlsRequired => NetError::TlsRequired,
        IoError::TlsSetupFailure => NetError::TlsSetupFailure,
        _ => NetError::Internal,
    }
}

/// What `done` receives on failure.
#[derive(Debug, Clone)]
pub struct ClientError {
    pub net: NetError,
    pub http: Option<HttpError>,
    pub message: String,
}

pub type DoneCb = Box<dyn FnOnce(Result<Response, ClientError>) + Send>;

/// Hook to stack extra layers (tracing, shaping) on each connection's
/// io before it is registered. Return false (with a message) to abort.
pub type IoCreateCb = Box<dyn FnMut(&Io, &mut String) -> bool + Send>;

const DEFAULT_USER_AGENT: &str = concat!("netweave-http-client/", env!("CARGO_PKG_VERSION"));

struct ClientInner {
    handle: LoopHandle,
    dns: Dns,
    tls: Option<TlsClientCtx>,

    redirect_max: u64,
    redirect_cnt: u64,
    receive_max: u64,

    timeout_connect_ms: u64,
    timeout_stall_ms: u64,
    timeout_overall_ms: u64,
    timer_stall: Option<Timer>,
    timer_overall: Option<Timer>,

    io: Option<Io>,
    read_parser: Parser<'static>,
    header_buf: Buf,

    proxy_server: Option<String>,
    proxy_auth: Option<String>,

    method: Method,
    user_agent: String,
    content_type: Option<String>,
    charset: Option<String>,
    headers: Option<Headers>,
    message: Vec<u8>,
    message_pos: usize,

    current_url: Option<Url>,
    connected: bool,
    finished: bool,

    neterr: NetError,
    httperr: Option<HttpError>,
    error: String,

    done: Option<DoneCb>,
    iocreate: Option<IoCreateCb>,
}

/// A single HTTP request in flight (or about to be).
///
/// Configure, call [`HttpSimpleClient::send`], and run the loop; the
/// `done` callback fires exactly once with either the final parsed
/// response (redirects already followed) or a [`ClientError`].
#[derive(Clone)]
pub struct HttpSimpleClient {
    inner: Arc<Mutex<ClientInner>>,
}

impl HttpSimpleClient {
    pub fn new(handle: LoopHandle, dns: Dns, done: DoneCb) -> HttpSimpleClient {
        HttpSimpleClient {
            inner: Arc::new(Mutex::new(ClientInner {
                handle,
                dns,
                tls: None,
                redirect_max: 16,
                redirect_cnt: 0,
                receive_max: 1024 * 1024 * 50,
                timeout_connect_ms: 0,
                timeout_stall_ms: 0,
                timeout_overall_ms: 0,
                timer_stall: None,
                timer_overall: None,
                io: None,
                read_parser: Parser::new(),
                header_buf: Buf::new(),
                proxy_server: None,
                proxy_auth: None,
                method: Method::Get,
                user_agent: DEFAULT_USER_AGENT.to_string(),
                content_type: None,
                charset: None,
                headers: None,
                message: Vec::new(),
                message_pos: 0,
                current_url: None,
                connected: false,
                finished: false,
                neterr: NetError::Internal,
                httperr: None,
                error: String::new(),
                done: Some(done),
                iocreate: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_tls_ctx(&self, ctx: TlsClientCtx) {
        self.lock().tls = Some(ctx);
    }

    pub fn set_proxy(&self, server: &str) {
        self.lock().proxy_server = Some(server.to_string());
    }

    pub fn set_proxy_authentication(&self, user: &str, pass: &str) {
        let creds = base64::encode(format!("{}:{}", user, pass));
        self.lock().proxy_auth = Some(format!("Basic {}", creds));
    }

    /// Timeouts in milliseconds; 0 disables the corresponding timer.
    pub fn set_timeouts(&self, connect_ms: u64, stall_ms: u64, overall_ms: u64) {
        let mut inner = self.lock();
        inner.timeout_connect_ms = connect_ms;
        inner.timeout_stall_ms = stall_ms;
        inner.timeout_overall_ms = overall_ms;
    }

    pub fn set_max_redirects(&self, max: u64) {
        self.lock().redirect_max = max;
    }

    pub fn set_max_receive_size(&self, max: u64) {
        self.lock().receive_max = max;
    }

    pub fn set_iocreate(&self, cb: IoCreateCb) {
        self.lock().iocreate = Some(cb);
    }

    /// Configure the request to send. Replaces anything set earlier.
    pub fn set_message(
        &self,
        method: Method,
        user_agent: Option<&str>,
        content_type: Option<&str>,
        charset: Option<&str>,
        headers: Option<&Headers>,
        body: &[u8],
    ) {
        let mut inner = self.lock();
        inner.method = method;
        inner.user_agent = user_agent
            .filter(|ua| !ua.is_empty())
            .unwrap_or(DEFAULT_USER_AGENT)
            .to_string();
        inner.content_type = content_type
            .filter(|ct| !ct.is_empty())
            .map(|ct| ct.to_string());
        inner.charset = charset.filter(|cs| !cs.is_empty()).map(|cs| cs.to_string());
        inner.headers = headers.cloned();
        inner.message = body.to_vec();
        inner.message_pos = 0;
    }

    /// Issue (or reissue) the request. Returns false when the URL or
    /// connection setup is unusable; the `done` callback has not fired
    /// in that case and the error fields describe why.
    pub fn send(&self, url: &str) -> bool {
        let mut inner = self.lock();
        send_locked(&mut inner, &self.inner, url)
    }

    /// Abort and tear down without invoking `done`.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        inner.finished = true;
        teardown(&mut inner);
        inner.done = None;
    }
}

fn teardown(inner: &mut ClientInner) {
    if let Some(t) = inner.timer_stall.take() {
        t.remove();
    }
    if let Some(t) = inner.timer_overall.take() {
        t.remove();
    }
    if let Some(io) = inner.io.take() {
        inner.handle.destroy_io(&io);
    }
}

/// Invoke `done` exactly once, after all state is torn down. The inner
/// lock is released across the user callback.
fn call_done(client: &Arc<Mutex<ClientInner>>, response: Option<Response>) {
    let (done, result) = {
        let mut inner = client.lock().unwrap_or_else(|e| e.into_inner());
        if inner.finished {
            return;
        }
        inner.finished = true;
        teardown(&mut inner);
        let result = match response {
            Some(rsp) => Ok(rsp),
            None => Err(ClientError {
                net: inner.neterr,
                http: inner.httperr.clone(),
                message: inner.error.clone(),
            }),
        };
        (inner.done.take(), result)
    };
    if let Some(done) = done {
        done(result);
    }
}

fn ready_send(inner: &mut ClientInner) {
    inner.header_buf = Buf::new();
    inner.read_parser = Parser::new();
    inner.message_pos = 0;
    inner.connected = false;
    if let Some(io) = inner.io.take() {
        inner.handle.destroy_io(&io);
    }
}

fn split_target(url: &Url) -> (String, u16) {
    let host = url.host_str().unwrap_or("").to_string();
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "http" { 80 } else { 443 });
    (host, port)
}

fn request_uri(url: &Url) -> String {
    let mut uri = url.path().to_string();
    if let Some(q) = url.query() {
        uri.push('?');
        uri.push_str(q);
    }
    uri
}

fn send_locked(inner: &mut ClientInner, client: &Arc<Mutex<ClientInner>>, url: &str) -> bool {
    let url = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => {
            inner.neterr = NetError::Create;
            inner.error = format!("invalid url: {}", url);
            return false;
        }
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        inner.neterr = NetError::Create;
        inner.error = format!("unsupported scheme: {}", url.scheme());
        return false;
    }

    ready_send(inner);

    // Dial the proxy when one is configured, the origin otherwise.
    let (dial_host, dial_port) = match &inner.proxy_server {
        Some(proxy) => match Url::parse(proxy) {
            Ok(p) => split_target(&p),
            Err(_) => {
                inner.neterr = NetError::Create;
                inner.error = format!("invalid proxy: {}", proxy);
                return false;
            }
        },
        None => split_target(&url),
    };

    let io = match net::client_create(&inner.dns, &dial_host, dial_port) {
        Ok(io) => io,
        Err(err) => {
            inner.neterr = NetError::Create;
            inner.error = format!("failed to create network client: {}", err);
            return false;
        }
    };

    if url.scheme() == "https" {
        let ctx = match &inner.tls {
            Some(ctx) => ctx.clone(),
            None => {
                inner.neterr = NetError::TlsRequired;
                inner.error = "https requested but no TLS client context set".to_string();
                io.destroy();
                return false;
            }
        };
        let (origin_host, _) = split_target(&url);
        if let Err(err) = tls::client_add(&io, &ctx, &origin_host) {
            inner.neterr = NetError::TlsSetupFailure;
            inner.error = format!("failed to add TLS client layer: {}", err);
            io.destroy();
            return false;
        }
    }

    if let Some(iocreate) = &mut inner.iocreate {
        let mut errmsg = String::new();
        if !iocreate(&io, &mut errmsg) {
            inner.neterr = NetError::Create;
            inner.error = if errmsg.is_empty() {
                "iocreate generic failure".to_string()
            } else {
                errmsg
            };
            io.destroy();
            return false;
        }
    }

    // Serialize the head; the body is drained separately from
    // `message` so large payloads are not copied again.
    let (host, port) = split_target(&url);
    let mut headers = inner.headers.clone().unwrap_or_default();
    let target;
    if inner.proxy_server.is_some() {
        target = url.as_str().to_string();
        if let Some(auth) = &inner.proxy_auth {
            headers.set("Proxy-Authorization", auth);
        }
    } else {
        target = request_uri(&url);
    }
    let head = match write_request(&WriteRequest {
        method: inner.method,
        host: &host,
        port,
        uri: &target,
        user_agent: Some(&inner.user_agent),
        content_type: inner.content_type.as_deref(),
        headers: Some(&headers),
        body: None,
        body_len: Some(inner.message.len() as u64),
        charset: inner.charset.as_deref(),
    }) {
        Ok(head) => head,
        Err(err) => {
            inner.neterr = NetError::Create;
            inner.error = format!("could not serialize request: {}", err);
            io.destroy();
            return false;
        }
    };
    inner.header_buf.add_bytes(&head);

    if inner.timeout_connect_ms > 0 {
        io.set_connect_timeout(std::time::Duration::from_millis(inner.timeout_connect_ms));
    }
    start_stall_timer(inner, client);
    start_overall_timer(inner, client);

    trace!(url = %url, "sending request");
    inner.current_url = Some(url);
    inner.io = Some(io.clone());

    let cb_client = client.clone();
    inner.handle.add(
        &io,
        Box::new(move |_el, etype, io| {
            io_event(&cb_client, etype, io);
        }),
    );
    true
}

fn start_stall_timer(inner: &mut ClientInner, client: &Arc<Mutex<ClientInner>>) {
    if inner.timeout_stall_ms == 0 {
        return;
    }
    let delay = std::time::Duration::from_millis(inner.timeout_stall_ms);
    match &inner.timer_stall {
        Some(t) => t.reset(delay),
        None => {
            let cb_client = client.clone();
            let timer = inner.handle.timer_oneshot(
                delay,
                false,
                Box::new(move |_el| {
                    {
                        let mut inner = cb_client.lock().unwrap_or_else(|e| e.into_inner());
                        inner.neterr = NetError::TimeoutStall;
                        inner.error = "Timeout: Stall".to_string();
                    }
                    call_done(&cb_client, None);
                }),
            );
            inner.timer_stall = Some(timer);
        }
    }
}

fn start_overall_timer(inner: &mut ClientInner, client: &Arc<Mutex<ClientInner>>) {
    if inner.timeout_overall_ms == 0 {
        return;
    }
    // The overall budget covers the whole exchange including every
    // redirect hop; it is armed once and never reset.
    if inner.timer_overall.is_some() {
        return;
    }
    let cb_client = client.clone();
    let timer = inner.handle.timer_oneshot(
        std::time::Duration::from_millis(inner.timeout_overall_ms),
        false,
        Box::new(move |_el| {
            {
                let mut inner = cb_client.lock().unwrap_or_else(|e| e.into_inner());
                inner.neterr = NetError::Timeout;
                inner.error = "Timeout".to_string();
            }
            call_done(&cb_client, None);
        }),
    );
    inner.timer_overall = Some(timer);
}

/// Push out as much of the head buffer, then the body, as the io will
/// take. False means a hard failure was recorded.
fn write_data(inner: &mut ClientInner, io: &Io) -> bool {
    if !inner.header_buf.is_empty() {
        match io.write_from_buf(&mut inner.header_buf) {
            Ok(_) => {}
            Err(err) if err.is_wouldblock() => return true,
            Err(err) => {
                inner.neterr = io_to_net_error(err);
                inner.error = io.error_message();
                return false;
            }
        }
        if !inner.header_buf.is_empty() {
            return true;
        }
    }

    while inner.message_pos < inner.message.len() {
        match io.write(&inner.message[inner.message_pos..]) {
            Ok(n) => inner.message_pos += n,
            Err(err) if err.is_wouldblock() => return true,
            Err(err) => {
                inner.neterr = io_to_net_error(err);
                inner.error = io.error_message();
                return false;
            }
        }
    }
    true
}

fn handle_redirect(client: &Arc<Mutex<ClientInner>>, response: Response) {
    let location = response.headers.get("Location");
    let mut inner = client.lock().unwrap_or_else(|e| e.into_inner());

    let location = match location.filter(|l| !l.is_empty()) {
        Some(l) => l,
        None => {
            inner.neterr = NetError::Redirect;
            inner.error = "invalid redirect: Location missing".to_string();
            drop(inner);
            call_done(client, None);
            return;
        }
    };

    inner.redirect_cnt += 1;
    if inner.redirect_cnt > inner.redirect_max {
        inner.neterr = NetError::RedirectLimit;
        inner.error = "maximum redirects limit reached".to_string();
        drop(inner);
        call_done(client, None);
        return;
    }

    // Relative Location values resolve against the URL that issued
    // the redirect.
    let next = match &inner.current_url {
        Some(base) => base.join(&location).map(|u| u.to_string()),
        None => Url::parse(&location).map(|u| u.to_string()),
    };
    let next = match next {
        Ok(n) => n,
        Err(_) => {
            inner.neterr = NetError::Redirect;
            inner.error = format!("invalid redirect location: {}", location);
            drop(inner);
            call_done(client, None);
            return;
        }
    };

    debug!(location = %next, count = inner.redirect_cnt, "following redirect");
    if !send_locked(&mut inner, client, &next) {
        drop(inner);
        call_done(client, None);
    }
}

fn process_response(client: &Arc<Mutex<ClientInner>>, response: Response) {
    if (300..=399).contains(&response.status) {
        handle_redirect(client, response);
        return;
    }
    call_done(client, Some(response));
}

fn fail_io(inner: &mut ClientInner, io: &Io) {
    let err = io.last_error().unwrap_or(IoError::Internal);
    inner.neterr = match io_to_net_error(err) {
        // A timeout before the transport came up is a connect timeout.
        NetError::Timeout if !inner.connected => NetError::TimeoutConnect,
        other => other,
    };
    inner.error = io.error_message();
}

fn io_event(client: &Arc<Mutex<ClientInner>>, etype: EventType, io: &Io) {
    match etype {
        EventType::Connected => {
            let mut inner = client.lock().unwrap_or_else(|e| e.into_inner());
            inner.connected = true;
            if !write_data(&mut inner, io) {
                drop(inner);
                call_done(client, None);
            }
        }
        EventType::Read => {
            let outcome = {
                let mut inner = client.lock().unwrap_or_else(|e| e.into_inner());
                match read_step(&mut inner, io, client) {
                    ReadStep::Wait => return,
                    other => other,
                }
            };
            match outcome {
                ReadStep::Complete(rsp) => process_response(client, rsp),
                ReadStep::Fail => call_done(client, None),
                ReadStep::Wait => {}
            }
        }
        EventType::Write => {
            let mut inner = client.lock().unwrap_or_else(|e| e.into_inner());
            start_stall_timer(&mut inner, client);
            if !write_data(&mut inner, io) {
                drop(inner);
                call_done(client, None);
            }
        }
        EventType::Disconnected => {
            let outcome = {
                let mut inner = client.lock().unwrap_or_else(|e| e.into_inner());
                match read_message(&mut inner.read_parser) {
                    Ok(ReadResult::Success(HttpMessage::Response(rsp)))
                    | Ok(ReadResult::SuccessMorePossible(HttpMessage::Response(rsp))) => {
                        ReadStep::Complete(rsp)
                    }
                    _ => {
                        inner.neterr = NetError::Disconnect;
                        inner.error = io.error_message();
                        ReadStep::Fail
                    }
                }
            };
            match outcome {
                ReadStep::Complete(rsp) => process_response(client, rsp),
                _ => call_done(client, None),
            }
        }
        EventType::Error => {
            {
                let mut inner = client.lock().unwrap_or_else(|e| e.into_inner());
                fail_io(&mut inner, io);
            }
            call_done(client, None);
        }
        EventType::Accept | EventType::Other => {}
    }
}

enum ReadStep {
    Wait,
    Fail,
    Complete(Response),
}

fn read_step(
    inner: &mut ClientInner,
    io: &Io,
    client: &Arc<Mutex<ClientInner>>,
) -> ReadStep {
    let mut parser = std::mem::take(&mut inner.read_parser);
    let read = io.read_into_parser(&mut parser);
    inner.read_parser = parser;
    if let Err(err) = read {
        if err != IoError::Disconnect {
            inner.neterr = io_to_net_error(err);
            inner.error = io.error_message();
            return ReadStep::Fail;
        }
        // EOF surfaces as a Disconnected event next tick.
    }

    if inner.receive_max != 0 && inner.read_parser.len() as u64 > inner.receive_max {
        inner.neterr = NetError::OverLimit;
        inner.error = "exceeded maximum receive data size limit".to_string();
        return ReadStep::Fail;
    }

    let mut parser = std::mem::take(&mut inner.read_parser);
    let parsed = read_message(&mut parser);
    inner.read_parser = parser;
    match parsed {
        Ok(ReadResult::Success(HttpMessage::Response(rsp))) => ReadStep::Complete(rsp),
        Ok(ReadResult::Success(HttpMessage::Request(_))) => {
            inner.neterr = NetError::ProtoFormat;
            inner.error = "peer sent a request, expected a response".to_string();
            ReadStep::Fail
        }
        Ok(ReadResult::MoreData) | Ok(ReadResult::SuccessMorePossible(_)) => {
            // Keep waiting; a disconnect will finalize the tentative
            // case.
            start_stall_timer(inner, client);
            ReadStep::Wait
        }
        Err(err) => {
            inner.neterr = NetError::ProtoFormat;
            inner.error = format!("format error: {}", err);
            inner.httperr = Some(err);
            ReadStep::Fail
        }
    }
}
