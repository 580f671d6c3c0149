//! Wire codec for the process-events connector protocol.
//!
//! Every datagram carries a fixed three-layer header stack (netlink
//! `nlmsghdr`, connector `cn_msg`, then the `proc_event` header) followed
//! by an event-kind specific payload. The layout is ABI-stable but not
//! self-describing, and the connector uses host byte order on every
//! supported architecture, so all fields are read and written native-endian.

use std::mem;

use thiserror::Error;

use crate::event::{
    EventAck, EventExec, EventExit, EventFork, EventGid, EventOther, EventSid, EventUid, ProcEvent,
};

/// Netlink message type used by the connector, for both directions.
pub const NLMSG_DONE: u16 = 0x3;

/// Connector index of the process-events sub-channel. Doubles as the
/// multicast group the subscriber binds to.
pub const CN_IDX_PROC: u32 = 0x1;
pub const CN_VAL_PROC: u32 = 0x1;

/// Control words accepted by the process-events connector.
pub const PROC_CN_MCAST_LISTEN: u32 = 0x1;
pub const PROC_CN_MCAST_IGNORE: u32 = 0x2;

/// Event kinds from the kernel's process-event ABI.
pub const PROC_EVENT_NONE: u32 = 0x0000_0000;
pub const PROC_EVENT_FORK: u32 = 0x0000_0001;
pub const PROC_EVENT_EXEC: u32 = 0x0000_0002;
pub const PROC_EVENT_UID: u32 = 0x0000_0004;
pub const PROC_EVENT_GID: u32 = 0x0000_0040;
pub const PROC_EVENT_SID: u32 = 0x0000_0080;
pub const PROC_EVENT_PTRACE: u32 = 0x0000_0100;
pub const PROC_EVENT_COMM: u32 = 0x0000_0200;
pub const PROC_EVENT_COREDUMP: u32 = 0x4000_0000;
pub const PROC_EVENT_EXIT: u32 = 0x8000_0000;

/// struct nlmsghdr: len, type, flags, seq, pid.
pub const NLMSG_HDR_LEN: usize = 16;
/// struct cn_msg: idx, val, seq, ack, len, flags.
pub const CN_MSG_LEN: usize = 20;
/// struct proc_event up to the payload union: what, cpu, timestamp_ns.
pub const EVENT_HDR_LEN: usize = 16;
/// The full header stack every event datagram starts with.
pub const HEADER_STACK_LEN: usize = NLMSG_HDR_LEN + CN_MSG_LEN + EVENT_HDR_LEN;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("message length {0} exceeds the header length field")]
    Oversize(usize),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("datagram too short for the header stack ({len} bytes)")]
    Short { len: usize },
    #[error("truncated payload for event {what:#010x} ({len} of {need} bytes)")]
    Truncated { what: u32, len: usize, need: usize },
}

/// Multicast membership operations encoded by [`subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McastOp {
    Listen,
    Ignore,
}

impl McastOp {
    fn word(self) -> u32 {
        match self {
            McastOp::Listen => PROC_CN_MCAST_LISTEN,
            McastOp::Ignore => PROC_CN_MCAST_IGNORE,
        }
    }
}

/// A decoded event datagram. `cpu` and `timestamp_ns` come from the
/// proc_event header; the per-kind channels carry only the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub cpu: u32,
    pub timestamp_ns: u64,
    pub payload: ProcEvent,
}

/// Encode the multicast subscription control message: the same header
/// stack minus the proc_event header, carrying a single op word.
pub fn subscription(op: McastOp, pid: u32) -> Result<Vec<u8>, EncodeError> {
    let op_len = mem::size_of::<u32>();
    let total = NLMSG_HDR_LEN + CN_MSG_LEN + op_len;
    let nlmsg_len = u32::try_from(total).map_err(|_| EncodeError::Oversize(total))?;
    let data_len = u16::try_from(op_len).map_err(|_| EncodeError::Oversize(op_len))?;

    let mut buf = Vec::with_capacity(total);
    // nlmsghdr
    buf.extend_from_slice(&nlmsg_len.to_ne_bytes());
    buf.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes()); // flags
    buf.extend_from_slice(&0u32.to_ne_bytes()); // seq
    buf.extend_from_slice(&pid.to_ne_bytes());
    // cn_msg
    buf.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    buf.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // seq
    buf.extend_from_slice(&0u32.to_ne_bytes()); // ack
    buf.extend_from_slice(&data_len.to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes()); // flags
    // payload
    buf.extend_from_slice(&op.word().to_ne_bytes());
    Ok(buf)
}

/// Decode one received datagram.
///
/// Returns `Ok(None)` for datagrams which are not process events at all
/// (foreign netlink types, other connector sub-channels) and for event
/// kinds this crate does not model, unless `keep_unknown` maps the latter
/// to [`ProcEvent::Other`]. Payloads longer than the modeled struct are
/// accepted and the extra bytes ignored, so newer kernels which grow the
/// ABI keep decoding.
pub fn decode(datagram: &[u8], keep_unknown: bool) -> Result<Option<DecodedEvent>, DecodeError> {
    if datagram.len() < HEADER_STACK_LEN {
        return Err(DecodeError::Short {
            len: datagram.len(),
        });
    }
    if u16_at(datagram, 4) != NLMSG_DONE {
        return Ok(None);
    }
    if u32_at(datagram, NLMSG_HDR_LEN) != CN_IDX_PROC
        || u32_at(datagram, NLMSG_HDR_LEN + 4) != CN_VAL_PROC
    {
        return Ok(None);
    }

    let what = u32_at(datagram, NLMSG_HDR_LEN + CN_MSG_LEN);
    let cpu = u32_at(datagram, NLMSG_HDR_LEN + CN_MSG_LEN + 4);
    let timestamp_ns = u64_at(datagram, NLMSG_HDR_LEN + CN_MSG_LEN + 8);
    let payload = &datagram[HEADER_STACK_LEN..];

    let event = match what {
        PROC_EVENT_NONE => {
            let [no] = words::<1>(what, payload)?;
            ProcEvent::Ack(EventAck { no })
        }
        // The connector reports the per-task id first and the thread-group
        // id second; pid is the tgid word, so it stays the process id even
        // for events raised by a secondary thread.
        PROC_EVENT_FORK => {
            let [parent_tid, parent_pid, child_tid, child_pid] = words::<4>(what, payload)?;
            ProcEvent::Fork(EventFork {
                parent_pid,
                parent_tid,
                child_pid,
                child_tid,
            })
        }
        PROC_EVENT_EXEC => {
            let [tid, pid] = words::<2>(what, payload)?;
            ProcEvent::Exec(EventExec { pid, tid })
        }
        PROC_EVENT_UID => {
            let [tid, pid, ruid, euid] = words::<4>(what, payload)?;
            ProcEvent::Uid(EventUid {
                pid,
                tid,
                ruid,
                euid,
            })
        }
        PROC_EVENT_GID => {
            let [tid, pid, rgid, egid] = words::<4>(what, payload)?;
            ProcEvent::Gid(EventGid {
                pid,
                tid,
                rgid,
                egid,
            })
        }
        PROC_EVENT_SID => {
            let [tid, pid] = words::<2>(what, payload)?;
            ProcEvent::Sid(EventSid { pid, tid })
        }
        PROC_EVENT_EXIT => {
            // The status word is kept as reported: the low bits are the
            // terminating signal, zero for a normal exit. The fourth word
            // (the signal delivered to the parent) is not surfaced.
            let [tid, pid, code, _parent_signal] = words::<4>(what, payload)?;
            ProcEvent::Exit(EventExit {
                pid,
                tid,
                code,
                signal: code & 0x7f,
            })
        }
        _ if keep_unknown => ProcEvent::Other(EventOther {
            what,
            payload: payload.to_vec(),
        }),
        _ => return Ok(None),
    };

    Ok(Some(DecodedEvent {
        cpu,
        timestamp_ns,
        payload: event,
    }))
}

/// Field-wise copy of the first `N` u32 words of an event payload.
fn words<const N: usize>(what: u32, payload: &[u8]) -> Result<[u32; N], DecodeError> {
    let need = N * mem::size_of::<u32>();
    if payload.len() < need {
        return Err(DecodeError::Truncated {
            what,
            len: payload.len(),
            need,
        });
    }
    let mut out = [0; N];
    for (i, word) in out.iter_mut().enumerate() {
        *word = u32_at(payload, i * 4);
    }
    Ok(out)
}

fn array_at<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut bytes = [0; N];
    bytes.copy_from_slice(&buf[offset..offset + N]);
    bytes
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes(array_at(buf, offset))
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(array_at(buf, offset))
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(array_at(buf, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an event datagram the way the kernel does.
    fn datagram(what: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let total = (HEADER_STACK_LEN + payload.len()) as u32;
        buf.extend_from_slice(&total.to_ne_bytes());
        buf.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
        buf.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
        buf.extend_from_slice(&7u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&((EVENT_HDR_LEN + payload.len()) as u16).to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&what.to_ne_bytes());
        buf.extend_from_slice(&3u32.to_ne_bytes()); // cpu
        buf.extend_from_slice(&112_233u64.to_ne_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn payload(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }

    fn decode_one(buf: &[u8]) -> ProcEvent {
        decode(buf, false).unwrap().unwrap().payload
    }

    #[test]
    fn subscription_message_is_wire_exact() {
        let pid = 4242;
        let buf = subscription(McastOp::Listen, pid).unwrap();
        assert_eq!(buf.len(), 40);
        assert_eq!(u32_at(&buf, 0), 40); // nlmsg_len
        assert_eq!(u16_at(&buf, 4), NLMSG_DONE);
        assert_eq!(u16_at(&buf, 6), 0); // flags
        assert_eq!(u32_at(&buf, 8), 0); // seq
        assert_eq!(u32_at(&buf, 12), pid);
        assert_eq!(u32_at(&buf, 16), CN_IDX_PROC);
        assert_eq!(u32_at(&buf, 20), CN_VAL_PROC);
        assert_eq!(u32_at(&buf, 24), 0); // seq
        assert_eq!(u32_at(&buf, 28), 0); // ack
        assert_eq!(u16_at(&buf, 32), 4); // payload length
        assert_eq!(u16_at(&buf, 34), 0); // flags
        assert_eq!(u32_at(&buf, 36), PROC_CN_MCAST_LISTEN);
    }

    #[test]
    fn unsubscribe_flips_only_the_op_word() {
        let listen = subscription(McastOp::Listen, 1).unwrap();
        let ignore = subscription(McastOp::Ignore, 1).unwrap();
        assert_eq!(listen[..36], ignore[..36]);
        assert_eq!(u32_at(&ignore, 36), PROC_CN_MCAST_IGNORE);
    }

    #[test]
    fn decodes_ack() {
        let buf = datagram(PROC_EVENT_NONE, &payload(&[0]));
        assert_eq!(decode_one(&buf), ProcEvent::Ack(EventAck { no: 0 }));
    }

    #[test]
    fn decodes_fork() {
        // Wire order is (task id, tgid) per process; pid is the tgid word.
        let buf = datagram(PROC_EVENT_FORK, &payload(&[200, 100, 201, 101]));
        let decoded = decode(&buf, false).unwrap().unwrap();
        assert_eq!(decoded.cpu, 3);
        assert_eq!(decoded.timestamp_ns, 112_233);
        assert_eq!(
            decoded.payload,
            ProcEvent::Fork(EventFork {
                parent_pid: 100,
                parent_tid: 200,
                child_pid: 101,
                child_tid: 201,
            })
        );
    }

    #[test]
    fn decodes_exec_and_sid() {
        let buf = datagram(PROC_EVENT_EXEC, &payload(&[56, 55]));
        assert_eq!(
            decode_one(&buf),
            ProcEvent::Exec(EventExec { pid: 55, tid: 56 })
        );
        let buf = datagram(PROC_EVENT_SID, &payload(&[56, 55]));
        assert_eq!(
            decode_one(&buf),
            ProcEvent::Sid(EventSid { pid: 55, tid: 56 })
        );
    }

    #[test]
    fn decodes_credential_changes() {
        let buf = datagram(PROC_EVENT_UID, &payload(&[11, 10, 1000, 1000]));
        assert_eq!(
            decode_one(&buf),
            ProcEvent::Uid(EventUid {
                pid: 10,
                tid: 11,
                ruid: 1000,
                euid: 1000,
            })
        );
        let buf = datagram(PROC_EVENT_GID, &payload(&[11, 10, 65534, 65534]));
        assert_eq!(
            decode_one(&buf),
            ProcEvent::Gid(EventGid {
                pid: 10,
                tid: 11,
                rgid: 65534,
                egid: 65534,
            })
        );
    }

    #[test]
    fn exit_keeps_the_raw_status_word() {
        // Normal exit: status word zero, no signal.
        let buf = datagram(PROC_EVENT_EXIT, &payload(&[78, 77, 0, 17]));
        assert_eq!(
            decode_one(&buf),
            ProcEvent::Exit(EventExit {
                pid: 77,
                tid: 78,
                code: 0,
                signal: 0,
            })
        );
        // exit(1): shifted status, still no signal.
        let buf = datagram(PROC_EVENT_EXIT, &payload(&[78, 77, 0x100, 17]));
        assert_eq!(
            decode_one(&buf),
            ProcEvent::Exit(EventExit {
                pid: 77,
                tid: 78,
                code: 0x100,
                signal: 0,
            })
        );
        // SIGTERM death: the signal number is the status word.
        let buf = datagram(PROC_EVENT_EXIT, &payload(&[78, 77, 15, 17]));
        assert_eq!(
            decode_one(&buf),
            ProcEvent::Exit(EventExit {
                pid: 77,
                tid: 78,
                code: 15,
                signal: 15,
            })
        );
    }

    #[test]
    fn short_datagram_is_an_error() {
        let buf = datagram(PROC_EVENT_FORK, &payload(&[1, 1, 2, 2]));
        assert!(matches!(
            decode(&buf[..HEADER_STACK_LEN - 1], false),
            Err(DecodeError::Short { len }) if len == HEADER_STACK_LEN - 1
        ));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let buf = datagram(PROC_EVENT_FORK, &payload(&[1, 1]));
        assert!(matches!(
            decode(&buf, false),
            Err(DecodeError::Truncated {
                what: PROC_EVENT_FORK,
                len: 8,
                need: 16,
            })
        ));
    }

    #[test]
    fn oversize_payload_is_accepted() {
        // A kernel with a grown fork struct: extra trailing words ignored.
        let buf = datagram(PROC_EVENT_FORK, &payload(&[1, 1, 2, 2, 9, 9]));
        assert_eq!(
            decode_one(&buf),
            ProcEvent::Fork(EventFork {
                parent_pid: 1,
                parent_tid: 1,
                child_pid: 2,
                child_tid: 2,
            })
        );
    }

    #[test]
    fn foreign_netlink_type_is_dropped() {
        let mut buf = datagram(PROC_EVENT_FORK, &payload(&[1, 1, 2, 2]));
        buf[4..6].copy_from_slice(&0x2u16.to_ne_bytes()); // NLMSG_ERROR
        assert!(decode(&buf, false).unwrap().is_none());
    }

    #[test]
    fn foreign_connector_channel_is_dropped() {
        let mut buf = datagram(PROC_EVENT_FORK, &payload(&[1, 1, 2, 2]));
        buf[16..20].copy_from_slice(&9u32.to_ne_bytes()); // not CN_IDX_PROC
        assert!(decode(&buf, false).unwrap().is_none());
    }

    #[test]
    fn unknown_kind_is_dropped_by_default() {
        let buf = datagram(PROC_EVENT_COMM, &payload(&[1, 1, 2, 2]));
        assert!(decode(&buf, false).unwrap().is_none());
    }

    #[test]
    fn unknown_kind_is_kept_on_request() {
        let body = payload(&[1, 1, 2, 2]);
        let buf = datagram(PROC_EVENT_COMM, &body);
        assert_eq!(
            decode(&buf, true).unwrap().unwrap().payload,
            ProcEvent::Other(EventOther {
                what: PROC_EVENT_COMM,
                payload: body,
            })
        );
    }
}
