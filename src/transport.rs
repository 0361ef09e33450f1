use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use rand::Rng;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Error as WsError, Message, WebSocket};

use crate::config::ReconnectPolicy;

/// Poll interval for the link worker: the socket read timeout doubles as
/// the tick for draining outbound messages and control commands.
const READ_TICK_MS: u64 = 25;

/// Events surfaced by a transport, in the order they occurred.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Link established for the first time in this connect cycle.
    Connect,
    /// Link re-established after an unexpected drop.
    Reconnect,
    Disconnect { reason: String },
    ReconnectAttempt { attempt: u32 },
    /// Retry budget exhausted; the transport stays down until reopened.
    ReconnectFailed { error: String },
    /// A single dial failed (the transport keeps retrying on its own).
    Error { error: String },
    Message { text: String },
}

/// Opaque connection capability. Implementations own their reconnection
/// timers and threads; callers only open/close, push text, and poll events.
pub trait Transport {
    /// Begin connecting. Idempotent; a nudge while connected is ignored.
    fn open(&mut self);
    /// Tear the link down. Unconditional and immediate for the caller.
    fn close(&mut self);
    /// Drop the current link (if any) and redial immediately, skipping any
    /// backoff wait in progress.
    fn force_reconnect(&mut self);
    /// Best-effort send; returns false when the link is not writable and
    /// the message was dropped.
    fn send(&mut self, text: &str) -> bool;
    /// Non-blocking event poll.
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

enum Ctrl {
    Open,
    Close,
    ForceReconnect,
}

/// Websocket transport. A single worker thread dials, reads, writes, and
/// sleeps out backoff delays; the owning thread talks to it through
/// channels, so no core operation ever blocks.
pub struct WsTransport {
    ctrl_tx: Sender<Ctrl>,
    out_tx: Sender<String>,
    event_rx: Receiver<TransportEvent>,
    writable: Arc<AtomicBool>,
}

impl WsTransport {
    pub fn new(url: String, policy: ReconnectPolicy) -> Self {
        let (ctrl_tx, ctrl_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let writable = Arc::new(AtomicBool::new(false));
        let flag = writable.clone();
        thread::spawn(move || worker(&url, &policy, &ctrl_rx, &out_rx, &event_tx, &flag));
        Self { ctrl_tx, out_tx, event_rx, writable }
    }
}

impl Transport for WsTransport {
    fn open(&mut self) {
        let _ = self.ctrl_tx.send(Ctrl::Open);
    }

    fn close(&mut self) {
        self.writable.store(false, Ordering::Release);
        let _ = self.ctrl_tx.send(Ctrl::Close);
    }

    fn force_reconnect(&mut self) {
        let _ = self.ctrl_tx.send(Ctrl::ForceReconnect);
    }

    fn send(&mut self, text: &str) -> bool {
        if !self.writable.load(Ordering::Acquire) {
            return false;
        }
        self.out_tx.send(text.to_string()).is_ok()
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.event_rx.try_recv().ok()
    }
}

type Ws = WebSocket<MaybeTlsStream<TcpStream>>;

fn worker(
    url: &str,
    policy: &ReconnectPolicy,
    ctrl_rx: &Receiver<Ctrl>,
    out_rx: &Receiver<String>,
    event_tx: &Sender<TransportEvent>,
    writable: &AtomicBool,
) {
    loop {
        // Parked until the client asks for a link.
        match ctrl_rx.recv() {
            Ok(Ctrl::Open) | Ok(Ctrl::ForceReconnect) => {}
            Ok(Ctrl::Close) => continue,
            Err(_) => return,
        }
        if !run_link(url, policy, ctrl_rx, out_rx, event_tx, writable) {
            return;
        }
    }
}

/// Dial-and-serve loop for one connect cycle. Returns false when the owning
/// side is gone and the worker should exit.
fn run_link(
    url: &str,
    policy: &ReconnectPolicy,
    ctrl_rx: &Receiver<Ctrl>,
    out_rx: &Receiver<String>,
    event_tx: &Sender<TransportEvent>,
    writable: &AtomicBool,
) -> bool {
    let mut ever_connected = false;
    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            if event_tx.send(TransportEvent::ReconnectAttempt { attempt }).is_err() {
                return false;
            }
            match ctrl_rx.recv_timeout(backoff_delay(policy, attempt)) {
                Ok(Ctrl::Close) => return true,
                // Manual retry cuts the backoff wait short.
                Ok(Ctrl::ForceReconnect) | Ok(Ctrl::Open) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        match tungstenite::connect(url) {
            Ok((mut ws, _response)) => {
                set_read_timeout(&mut ws, Duration::from_millis(READ_TICK_MS));
                // Messages queued while the link was down are dropped, not
                // replayed: replay semantics belong to the protocol layer.
                while out_rx.try_recv().is_ok() {}
                writable.store(true, Ordering::Release);
                let up = if ever_connected { TransportEvent::Reconnect } else { TransportEvent::Connect };
                if event_tx.send(up).is_err() {
                    return false;
                }
                ever_connected = true;
                attempt = 0;
                let served = serve(&mut ws, ctrl_rx, out_rx, event_tx);
                writable.store(false, Ordering::Release);
                let _ = ws.close(None);
                match served {
                    Served::ClientClose => {
                        let _ = event_tx.send(TransportEvent::Disconnect { reason: "client disconnect".into() });
                        return true;
                    }
                    Served::ForceReconnect => {
                        let _ = event_tx.send(TransportEvent::Disconnect { reason: "client reconnect".into() });
                        attempt = 1;
                    }
                    Served::Dropped(reason) => {
                        let _ = event_tx.send(TransportEvent::Disconnect { reason });
                        attempt = 1;
                    }
                    Served::OwnerGone => return false,
                }
            }
            Err(e) => {
                let error = e.to_string();
                if event_tx.send(TransportEvent::Error { error: error.clone() }).is_err() {
                    return false;
                }
                attempt += 1;
                if attempt > policy.max_attempts {
                    let _ = event_tx.send(TransportEvent::ReconnectFailed { error });
                    return true;
                }
            }
        }
    }
}

enum Served {
    ClientClose,
    ForceReconnect,
    Dropped(String),
    OwnerGone,
}

fn serve(ws: &mut Ws, ctrl_rx: &Receiver<Ctrl>, out_rx: &Receiver<String>, event_tx: &Sender<TransportEvent>) -> Served {
    loop {
        match ctrl_rx.try_recv() {
            Ok(Ctrl::Close) => return Served::ClientClose,
            Ok(Ctrl::ForceReconnect) => return Served::ForceReconnect,
            Ok(Ctrl::Open) => {}
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Served::OwnerGone,
        }
        loop {
            match out_rx.try_recv() {
                Ok(text) => {
                    if let Err(e) = ws.send(Message::text(text)) {
                        return Served::Dropped(e.to_string());
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Served::OwnerGone,
            }
        }
        // The read timeout on the socket is the loop tick.
        match ws.read() {
            Ok(Message::Text(text)) => {
                if event_tx.send(TransportEvent::Message { text: text.as_str().to_string() }).is_err() {
                    return Served::OwnerGone;
                }
            }
            Ok(Message::Ping(payload)) => {
                if let Err(e) = ws.send(Message::Pong(payload)) {
                    return Served::Dropped(e.to_string());
                }
            }
            Ok(Message::Close(_)) => return Served::Dropped("server closed connection".into()),
            Ok(_) => {}
            Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                return Served::Dropped("connection closed".into());
            }
            Err(e) => return Served::Dropped(e.to_string()),
        }
    }
}

fn set_read_timeout(ws: &mut Ws, dur: Duration) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(Some(dur));
        }
        _ => {}
    }
}

/// Capped exponential backoff with ±jitter.
fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = policy.base_delay_ms.saturating_mul(1u64 << exp);
    let capped = base.min(policy.max_delay_ms).max(1);
    let jitter = (capped as f64 * policy.jitter).round() as i64;
    let offset = if jitter > 0 { rand::thread_rng().gen_range(-jitter..=jitter) } else { 0 };
    Duration::from_millis((capped as i64 + offset).max(1) as u64)
}

#[cfg(test)]
pub mod fake {
    use std::collections::VecDeque;

    use super::{Transport, TransportEvent};

    /// Scriptable in-memory transport for state-machine and protocol tests.
    /// Tests push the events a real link would emit and inspect what the
    /// client sent.
    pub struct FakeTransport {
        pub sent: Vec<String>,
        pub opened: u32,
        pub closed: u32,
        pub cycles: u32,
        connected: bool,
        events: VecDeque<TransportEvent>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self { sent: Vec::new(), opened: 0, closed: 0, cycles: 0, connected: false, events: VecDeque::new() }
        }

        /// Script an event; the fake's writability tracks connect/disconnect
        /// the way the real worker flips its flag.
        pub fn push(&mut self, event: TransportEvent) {
            match &event {
                TransportEvent::Connect | TransportEvent::Reconnect => self.connected = true,
                TransportEvent::Disconnect { .. }
                | TransportEvent::ReconnectFailed { .. }
                | TransportEvent::Error { .. } => self.connected = false,
                _ => {}
            }
            self.events.push_back(event);
        }
    }

    impl Transport for FakeTransport {
        fn open(&mut self) {
            self.opened += 1;
        }

        fn close(&mut self) {
            self.closed += 1;
            self.connected = false;
        }

        fn force_reconnect(&mut self) {
            self.cycles += 1;
        }

        fn send(&mut self, text: &str) -> bool {
            if !self.connected {
                return false;
            }
            self.sent.push(text.to_string());
            true
        }

        fn poll_event(&mut self) -> Option<TransportEvent> {
            self.events.pop_front()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> ReconnectPolicy {
        ReconnectPolicy { max_attempts: 5, base_delay_ms: 100, max_delay_ms: 1000, jitter }
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let p = policy(0.0);
        assert_eq!(backoff_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&p, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&p, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(&p, 5), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&p, 12), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_jitter_stays_in_range() {
        let p = policy(0.25);
        for attempt in 1..=8 {
            let capped = (p.base_delay_ms << (attempt - 1)).min(p.max_delay_ms);
            let d = backoff_delay(&p, attempt as u32).as_millis() as u64;
            let spread = (capped as f64 * p.jitter).round() as u64;
            assert!(d >= capped.saturating_sub(spread) && d <= capped + spread, "attempt {}: {}ms", attempt, d);
        }
    }

    #[test]
    fn fake_drops_sends_while_down() {
        let mut t = fake::FakeTransport::new();
        assert!(!t.send("lost"));
        t.push(TransportEvent::Connect);
        assert!(t.send("kept"));
        t.push(TransportEvent::Disconnect { reason: "drop".into() });
        assert!(!t.send("lost too"));
        assert_eq!(t.sent, vec!["kept".to_string()]);
    }
}
