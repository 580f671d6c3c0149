//! Typed process lifecycle events, one struct per connector event kind.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Confirmation that the kernel accepted the subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAck {
    pub no: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFork {
    pub parent_pid: u32,
    pub parent_tid: u32,
    pub child_pid: u32,
    pub child_tid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventExec {
    pub pid: u32,
    pub tid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventUid {
    pub pid: u32,
    pub tid: u32,
    pub ruid: u32,
    pub euid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventGid {
    pub pid: u32,
    pub tid: u32,
    pub rgid: u32,
    pub egid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSid {
    pub pid: u32,
    pub tid: u32,
}

/// `code` is the raw exit status word reported by the kernel: the shifted
/// exit status for a normal exit, the signal number for a signal death.
/// `signal` is the low-order signal bits of that same word, so a normal
/// exit carries `signal == 0` and a signal death `code == signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventExit {
    pub pid: u32,
    pub tid: u32,
    pub code: u32,
    pub signal: u32,
}

/// An event kind this crate does not model (ptrace, comm, coredump, or
/// anything newer). Only produced when [`crate::MonitorConfig::keep_unknown`]
/// is set; dropped silently otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOther {
    pub what: u32,
    pub payload: Vec<u8>,
}

/// A process lifecycle event reported by the kernel connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcEvent {
    Ack(EventAck),
    Fork(EventFork),
    Exec(EventExec),
    Uid(EventUid),
    Gid(EventGid),
    Sid(EventSid),
    Exit(EventExit),
    Other(EventOther),
}

impl ProcEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcEvent::Ack(_) => "ack",
            ProcEvent::Fork(_) => "fork",
            ProcEvent::Exec(_) => "exec",
            ProcEvent::Uid(_) => "uid",
            ProcEvent::Gid(_) => "gid",
            ProcEvent::Sid(_) => "sid",
            ProcEvent::Exit(_) => "exit",
            ProcEvent::Other(_) => "other",
        }
    }
}

impl fmt::Display for ProcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcEvent::Ack(e) => write!(f, "ack no={}", e.no),
            ProcEvent::Fork(e) => write!(
                f,
                "fork {}/{} -> {}/{}",
                e.parent_pid, e.parent_tid, e.child_pid, e.child_tid
            ),
            ProcEvent::Exec(e) => write!(f, "exec {}/{}", e.pid, e.tid),
            ProcEvent::Uid(e) => write!(
                f,
                "uid {}/{} ruid={} euid={}",
                e.pid, e.tid, e.ruid, e.euid
            ),
            ProcEvent::Gid(e) => write!(
                f,
                "gid {}/{} rgid={} egid={}",
                e.pid, e.tid, e.rgid, e.egid
            ),
            ProcEvent::Sid(e) => write!(f, "sid {}/{}", e.pid, e.tid),
            ProcEvent::Exit(e) => write!(
                f,
                "exit {}/{} code={} signal={}",
                e.pid, e.tid, e.code, e.signal
            ),
            ProcEvent::Other(e) => {
                write!(f, "other what={:#010x} ({} bytes)", e.what, e.payload.len())
            }
        }
    }
}
