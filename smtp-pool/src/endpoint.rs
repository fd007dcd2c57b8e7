use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// How the pool walks its endpoint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Use one endpoint until it fails, then move to the next for
    /// good. A failure of the whole cycle halts (or schedules a retry
    /// of) processing.
    Failover,
    /// Spread connections across all endpoints, scaling each up to its
    /// `max_conns` as queue pressure rises.
    RoundRobin,
}

/// One delivery target.
#[derive(Debug)]
pub enum EndpointKind {
    Tcp {
        address: String,
        port: u16,
        /// Stack TLS immediately on connect (implicit TLS). STARTTLS
        /// is attempted opportunistically either way when the server
        /// offers it and a client context is configured.
        tls: bool,
        username: Option<String>,
        password: Option<String>,
        max_conns: usize,
    },
    Process {
        command: String,
        args: Vec<String>,
        env: Option<HashMap<String, String>>,
        timeout_ms: u64,
    },
}

/// Endpoint configuration plus its failure-backoff state. Shared via
/// `Arc`; the pool's endpoint list itself is copy-on-write, so a
/// config can outlive its removal from the pool while a session still
/// holds it.
pub struct Endpoint {
    pub id: u64,
    pub kind: EndpointKind,
    failures: AtomicU64,
    /// Monotonic millis (from `base`) until which the endpoint should
    /// not be offered new work.
    backoff_until_ms: AtomicU64,
    base: Instant,
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

impl Endpoint {
    pub fn new(kind: EndpointKind) -> Endpoint {
        Endpoint {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            failures: AtomicU64::new(0),
            backoff_until_ms: AtomicU64::new(0),
            base: Instant::now(),
        }
    }

    pub fn max_conns(&self) -> usize {
        match &self.kind {
            EndpointKind::Tcp { max_conns, .. } => (*max_conns).max(1),
            EndpointKind::Process { .. } => 1,
        }
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            EndpointKind::Tcp { address, port, .. } => format!("{}:{}", address, port),
            EndpointKind::Process { command, .. } => command.clone(),
        }
    }

    /// Exponential backoff, capped at one minute.
    pub fn note_failure(&self) -> Duration {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        let secs = 1u64 << failures.min(6);
        let delay = Duration::from_secs(secs.min(60));
        let until = self.base.elapsed() + delay;
        self.backoff_until_ms
            .store(until.as_millis() as u64, Ordering::SeqCst);
        delay
    }

    pub fn note_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.backoff_until_ms.store(0, Ordering::SeqCst);
    }

    pub fn in_backoff(&self) -> bool {
        let until = self.backoff_until_ms.load(Ordering::SeqCst);
        (self.base.elapsed().as_millis() as u64) < until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_resets() {
        let ep = Endpoint::new(EndpointKind::Tcp {
            address: "mail.example.com".to_string(),
            port: 25,
            tls: false,
            username: None,
            password: None,
            max_conns: 2,
        });
        assert!(!ep.in_backoff());
        assert_eq!(ep.note_failure(), Duration::from_secs(2));
        assert_eq!(ep.note_failure(), Duration::from_secs(4));
        assert!(ep.in_backoff());
        ep.note_success();
        assert!(!ep.in_backoff());
        assert_eq!(ep.note_failure(), Duration::from_secs(2));
    }

    #[test]
    fn process_endpoints_are_single_lane() {
        let ep = Endpoint::new(EndpointKind::Process {
            command: "/usr/sbin/sendmail".to_string(),
            args: vec!["-t".to_string()],
            env: None,
            timeout_ms: 0,
        });
        assert_eq!(ep.max_conns(), 1);
    }
}
