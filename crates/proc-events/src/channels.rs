//! Fan-out of the single decoded event stream onto one bounded queue per
//! event kind, plus the error queue. The listener thread is the sole
//! producer; a full queue blocks it, so consumers control the pace and
//! per-kind ordering is preserved.

use tokio::sync::mpsc;

use crate::codec::DecodedEvent;
use crate::event::{
    EventAck, EventExec, EventExit, EventFork, EventGid, EventOther, EventSid, EventUid, ProcEvent,
};
use crate::monitor::MonitorError;

/// Sending halves, kept inside the monitor.
pub(crate) struct EventSenders {
    ack: mpsc::Sender<EventAck>,
    fork: mpsc::Sender<EventFork>,
    exec: mpsc::Sender<EventExec>,
    uid: mpsc::Sender<EventUid>,
    gid: mpsc::Sender<EventGid>,
    sid: mpsc::Sender<EventSid>,
    exit: mpsc::Sender<EventExit>,
    other: mpsc::Sender<EventOther>,
    error: mpsc::Sender<MonitorError>,
}

/// Receiving halves, handed to the consumer by
/// [`crate::ProcessMonitor::listen_events`]. Every decoded event lands on
/// exactly the channel matching its variant.
pub struct EventChannels {
    pub ack: mpsc::Receiver<EventAck>,
    pub fork: mpsc::Receiver<EventFork>,
    pub exec: mpsc::Receiver<EventExec>,
    pub uid: mpsc::Receiver<EventUid>,
    pub gid: mpsc::Receiver<EventGid>,
    pub sid: mpsc::Receiver<EventSid>,
    pub exit: mpsc::Receiver<EventExit>,
    pub other: mpsc::Receiver<EventOther>,
    pub error: mpsc::Receiver<MonitorError>,
}

pub(crate) fn bounded(capacity: usize) -> (EventSenders, EventChannels) {
    let (tx_ack, rx_ack) = mpsc::channel(capacity);
    let (tx_fork, rx_fork) = mpsc::channel(capacity);
    let (tx_exec, rx_exec) = mpsc::channel(capacity);
    let (tx_uid, rx_uid) = mpsc::channel(capacity);
    let (tx_gid, rx_gid) = mpsc::channel(capacity);
    let (tx_sid, rx_sid) = mpsc::channel(capacity);
    let (tx_exit, rx_exit) = mpsc::channel(capacity);
    let (tx_other, rx_other) = mpsc::channel(capacity);
    let (tx_error, rx_error) = mpsc::channel(capacity);
    (
        EventSenders {
            ack: tx_ack,
            fork: tx_fork,
            exec: tx_exec,
            uid: tx_uid,
            gid: tx_gid,
            sid: tx_sid,
            exit: tx_exit,
            other: tx_other,
            error: tx_error,
        },
        EventChannels {
            ack: rx_ack,
            fork: rx_fork,
            exec: rx_exec,
            uid: rx_uid,
            gid: rx_gid,
            sid: rx_sid,
            exit: rx_exit,
            other: rx_other,
            error: rx_error,
        },
    )
}

impl EventSenders {
    /// Route one decoded event to the queue of its kind. Must be called
    /// from the listener thread: the send blocks when the queue is full.
    pub(crate) fn deliver(&self, event: DecodedEvent) {
        log::trace!(
            target: "proc-events",
            "cpu {} t {}ns {}",
            event.cpu,
            event.timestamp_ns,
            event.payload
        );
        let kind = event.payload.kind();
        let delivered = match event.payload {
            ProcEvent::Ack(e) => self.ack.blocking_send(e).is_ok(),
            ProcEvent::Fork(e) => self.fork.blocking_send(e).is_ok(),
            ProcEvent::Exec(e) => self.exec.blocking_send(e).is_ok(),
            ProcEvent::Uid(e) => self.uid.blocking_send(e).is_ok(),
            ProcEvent::Gid(e) => self.gid.blocking_send(e).is_ok(),
            ProcEvent::Sid(e) => self.sid.blocking_send(e).is_ok(),
            ProcEvent::Exit(e) => self.exit.blocking_send(e).is_ok(),
            ProcEvent::Other(e) => self.other.blocking_send(e).is_ok(),
        };
        if !delivered {
            log::warn!("dropping {kind} event: consumer gone");
        }
    }

    pub(crate) fn deliver_error(&self, error: MonitorError) {
        if self.error.blocking_send(error).is_err() {
            log::warn!("dropping monitor error: consumer gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DecodeError;
    use std::time::Duration;

    fn decoded(payload: ProcEvent) -> DecodedEvent {
        DecodedEvent {
            cpu: 0,
            timestamp_ns: 0,
            payload,
        }
    }

    fn fork_of(child_pid: u32) -> DecodedEvent {
        decoded(ProcEvent::Fork(EventFork {
            parent_pid: 1,
            parent_tid: 1,
            child_pid,
            child_tid: child_pid,
        }))
    }

    #[tokio::test]
    async fn each_variant_reaches_its_own_channel() {
        let (senders, mut channels) = bounded(16);
        std::thread::spawn(move || {
            senders.deliver(decoded(ProcEvent::Ack(EventAck { no: 0 })));
            senders.deliver(fork_of(2));
            senders.deliver(decoded(ProcEvent::Exec(EventExec { pid: 3, tid: 3 })));
            senders.deliver(decoded(ProcEvent::Uid(EventUid {
                pid: 4,
                tid: 4,
                ruid: 1000,
                euid: 1000,
            })));
            senders.deliver(decoded(ProcEvent::Gid(EventGid {
                pid: 5,
                tid: 5,
                rgid: 100,
                egid: 100,
            })));
            senders.deliver(decoded(ProcEvent::Sid(EventSid { pid: 6, tid: 6 })));
            senders.deliver(decoded(ProcEvent::Exit(EventExit {
                pid: 7,
                tid: 7,
                code: 0,
                signal: 0,
            })));
            senders.deliver(decoded(ProcEvent::Other(EventOther {
                what: 0x100,
                payload: vec![1, 2],
            })));
        })
        .join()
        .unwrap();

        assert_eq!(channels.ack.recv().await, Some(EventAck { no: 0 }));
        assert_eq!(channels.fork.recv().await.unwrap().child_pid, 2);
        assert_eq!(channels.exec.recv().await.unwrap().pid, 3);
        assert_eq!(channels.uid.recv().await.unwrap().pid, 4);
        assert_eq!(channels.gid.recv().await.unwrap().pid, 5);
        assert_eq!(channels.sid.recv().await.unwrap().pid, 6);
        assert_eq!(channels.exit.recv().await.unwrap().pid, 7);
        assert_eq!(channels.other.recv().await.unwrap().what, 0x100);
        // Nothing cross-delivered.
        assert!(channels.ack.try_recv().is_err());
        assert!(channels.fork.try_recv().is_err());
        assert!(channels.error.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_channel_blocks_and_preserves_order() {
        let (senders, mut channels) = bounded(1);
        let producer = std::thread::spawn(move || {
            for pid in 0..32 {
                senders.deliver(fork_of(pid));
            }
        });
        // Let the producer hit the bound before draining.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for pid in 0..32 {
            assert_eq!(channels.fork.recv().await.unwrap().child_pid, pid);
        }
        producer.join().unwrap();
    }

    #[tokio::test]
    async fn decode_error_does_not_interrupt_delivery() {
        let (senders, mut channels) = bounded(8);
        std::thread::spawn(move || {
            senders.deliver_error(MonitorError::Decode(DecodeError::Short { len: 3 }));
            senders.deliver(fork_of(9));
        })
        .join()
        .unwrap();

        assert!(matches!(
            channels.error.recv().await,
            Some(MonitorError::Decode(DecodeError::Short { len: 3 }))
        ));
        assert_eq!(channels.fork.recv().await.unwrap().child_pid, 9);
        assert!(channels.error.try_recv().is_err());
    }
}
