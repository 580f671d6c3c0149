//! [`ProcessMonitor`] composes the connector socket, the codec, and the
//! per-kind channels:
//! - `connect` opens and binds the socket and sends the subscription,
//! - `listen_events` hands out the channel bundle and starts the receive
//!   loop on a dedicated thread (blocking syscalls stay off the runtime),
//! - `close` closes the socket to unblock the in-flight recv and lets
//!   the listener drain out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::channels::{self, EventChannels, EventSenders};
use crate::codec::{self, DecodeError, EncodeError, McastOp};
use crate::socket::{ConnectorSocket, TransportError, RECV_BUFFER_SIZE};

const DEFAULT_CHANNEL_CAPACITY: usize = 512;

/// Close gives the listener this long to observe the dead socket before
/// the channels are treated as quiescent.
const CLOSE_GRACE: Duration = Duration::from_millis(10);

/// Errors surfaced on the [`EventChannels::error`] channel.
///
/// A transport error is fatal: it is the final message before the
/// channels stop receiving. A decode error is not; the listener keeps
/// going, since one malformed datagram must not silence the monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[derive(Error, Debug)]
pub enum ListenError {
    #[error("event listener already started")]
    AlreadyListening,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Bound of every delivery channel. The listener blocks once a
    /// channel fills up, so this is the slack a slow consumer gets.
    pub channel_capacity: usize,
    /// Forward unrecognized event kinds (ptrace, comm, coredump, newer
    /// ABI growth) on the `other` channel instead of dropping them.
    pub keep_unknown: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            keep_unknown: false,
        }
    }
}

impl MonitorConfig {
    fn effective_capacity(&self) -> usize {
        if self.channel_capacity == 0 {
            log::warn!(
                "invalid channel_capacity 0, using the default {DEFAULT_CHANNEL_CAPACITY}"
            );
            return DEFAULT_CHANNEL_CAPACITY;
        }
        self.channel_capacity
    }
}

/// A subscription to the kernel's process-events stream.
///
/// Lifecycle: `connect` → `listen_events` (at most once) → `close`.
/// Dropping the monitor closes it.
pub struct ProcessMonitor {
    socket: Arc<ConnectorSocket>,
    stop: Arc<AtomicBool>,
    channels: Option<(EventSenders, EventChannels)>,
    // Owned but never joined: close() only signals; the thread drains and
    // exits on its own once the dead socket surfaces.
    _listener: Option<thread::JoinHandle<()>>,
    keep_unknown: bool,
}

impl ProcessMonitor {
    /// Open the connector socket, bind it, and subscribe to process
    /// events. Requires CAP_NET_ADMIN.
    pub fn connect(config: MonitorConfig) -> Result<Self, ConnectError> {
        let capacity = config.effective_capacity();
        let pid = std::process::id();
        let socket = ConnectorSocket::open()?;
        socket.bind(pid)?;
        let request = codec::subscription(McastOp::Listen, pid)?;
        socket.send(&request)?;
        Ok(Self {
            socket: Arc::new(socket),
            stop: Arc::new(AtomicBool::new(false)),
            channels: Some(channels::bounded(capacity)),
            _listener: None,
            keep_unknown: config.keep_unknown,
        })
    }

    /// Start the receive loop and hand out the event channels. Returns
    /// immediately; the loop runs until [`close`](Self::close). The
    /// channel bundle exists exactly once, so a second call fails.
    pub fn listen_events(&mut self) -> Result<EventChannels, ListenError> {
        let (senders, receivers) = self.channels.take().ok_or(ListenError::AlreadyListening)?;
        let socket = Arc::clone(&self.socket);
        let stop = Arc::clone(&self.stop);
        let keep_unknown = self.keep_unknown;
        self._listener = Some(thread::spawn(move || {
            listener_loop(socket, stop, senders, keep_unknown);
        }));
        Ok(receivers)
    }

    /// Stop the listener and close the socket. Idempotent. After the
    /// grace period no new events appear on the channels.
    ///
    /// No `PROC_CN_MCAST_IGNORE` is sent: the kernel acknowledges that op
    /// like the subscription itself, and the extra ack would race the
    /// socket teardown. Closing the socket drops the membership anyway.
    pub fn close(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.socket.close();
        thread::sleep(CLOSE_GRACE);
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

/// The receive loop: recv → decode → deliver, until the socket dies.
/// Decode errors are forwarded and the loop keeps going; a transport
/// error is forwarded once (unless we are stopping) and ends the loop.
fn listener_loop(
    socket: Arc<ConnectorSocket>,
    stop: Arc<AtomicBool>,
    senders: EventSenders,
    keep_unknown: bool,
) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    loop {
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(err) => {
                if !stop.load(Ordering::SeqCst) {
                    senders.deliver_error(MonitorError::Transport(err));
                }
                break;
            }
        };
        match codec::decode(&buf[..len], keep_unknown) {
            Ok(Some(event)) => senders.deliver(event),
            Ok(None) => {}
            Err(err) => senders.deliver_error(MonitorError::Decode(err)),
        }
    }
    log::debug!("process-events listener stopped");
}
