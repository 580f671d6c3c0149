//! Live end-to-end scenarios against the real kernel connector.
//! Run as root through the `test-suite` crate.

use std::process::Command;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, setsid, ForkResult, Pid};

use crate::test_runner::{TestCase, TestRunner, TestSuite};
use crate::{EventAck, MonitorConfig, ProcEvent};

pub fn tests() -> TestSuite {
    TestSuite {
        name: "proc-events",
        tests: vec![
            ack_on_connect(),
            fork_session_and_ids(),
            exec_and_exit_success(),
            exec_and_exit_by_signal(),
        ],
    }
}

/// Connect and close: the subscription is acknowledged exactly once.
fn ack_on_connect() -> TestCase {
    TestCase::new("ack_on_connect", async {
        let runner = TestRunner::start(MonitorConfig::default()).unwrap();
        runner
            .run(|| {})
            .await
            .expect_exactly("subscription ack", 1, |event| {
                matches!(event, ProcEvent::Ack(EventAck { no: 0 }))
            })
            .report()
    })
}

/// Fork a child which starts a session and drops its ids, and check that
/// every transition shows up: fork, sid, gid, uid, clean exit.
fn fork_session_and_ids() -> TestCase {
    TestCase::new("fork_session_and_ids", async {
        let parent_pid = std::process::id();
        let child_gid = 65534;
        let child_uid = 1000;
        let runner = TestRunner::start(MonitorConfig::default()).unwrap();
        let mut child_pid = 0;
        let result = runner
            .run(|| {
                match unsafe { fork() }.expect("fork failed") {
                    ForkResult::Parent { child } => {
                        child_pid = child.as_raw() as u32;
                        waitpid(child, None).expect("waitpid failed");
                    }
                    ForkResult::Child => {
                        // Only async-signal-safe calls until _exit.
                        let ok = setsid().is_ok()
                            && unsafe { libc::setregid(child_gid, child_gid) == 0 }
                            && unsafe { libc::setreuid(child_uid, child_uid) == 0 };
                        thread::sleep(Duration::from_millis(100));
                        unsafe { libc::_exit(i32::from(!ok)) }
                    }
                }
            })
            .await;
        result
            .expect("fork from the test process", move |event| {
                matches!(event, ProcEvent::Fork(f)
                    if f.parent_pid == parent_pid && f.child_pid == child_pid)
            })
            .expect("new session in the child", move |event| {
                matches!(event, ProcEvent::Sid(s) if s.pid == child_pid)
            })
            .expect("gid change in the child", move |event| {
                matches!(event, ProcEvent::Gid(g)
                    if g.pid == child_pid && g.rgid == child_gid && g.egid == child_gid)
            })
            .expect("uid change in the child", move |event| {
                matches!(event, ProcEvent::Uid(u)
                    if u.pid == child_pid && u.ruid == child_uid && u.euid == child_uid)
            })
            .expect("clean exit of the child", move |event| {
                matches!(event, ProcEvent::Exit(x)
                    if x.pid == child_pid && x.code == 0 && x.signal == 0)
            })
            .report()
    })
}

/// Spawn a short-lived command: exec and a clean exit are reported.
fn exec_and_exit_success() -> TestCase {
    TestCase::new("exec_and_exit_success", async {
        let runner = TestRunner::start(MonitorConfig::default()).unwrap();
        let mut child_pid = 0;
        let result = runner
            .run(|| {
                let mut child = Command::new("sleep")
                    .arg("0.1")
                    .spawn()
                    .expect("spawning sleep failed");
                child_pid = child.id();
                let status = child.wait().expect("waiting for sleep failed");
                assert!(status.success());
            })
            .await;
        result
            .expect("exec of the child", move |event| {
                matches!(event, ProcEvent::Exec(e) if e.pid == child_pid)
            })
            .expect("clean exit of the child", move |event| {
                matches!(event, ProcEvent::Exit(x)
                    if x.pid == child_pid && x.code == 0 && x.signal == 0)
            })
            .report()
    })
}

/// Terminate a spawned command with SIGTERM: the exit event carries the
/// signal number as the status word.
fn exec_and_exit_by_signal() -> TestCase {
    TestCase::new("exec_and_exit_by_signal", async {
        let runner = TestRunner::start(MonitorConfig::default()).unwrap();
        let mut child_pid = 0;
        let result = runner
            .run(|| {
                let mut child = Command::new("sleep")
                    .arg("100")
                    .spawn()
                    .expect("spawning sleep failed");
                child_pid = child.id();
                // Give the child a moment to finish its exec.
                thread::sleep(Duration::from_millis(50));
                kill(Pid::from_raw(child_pid as i32), Signal::SIGTERM).expect("kill failed");
                let _ = child.wait();
            })
            .await;
        let signal = Signal::SIGTERM as u32;
        result
            .expect("exec of the child", move |event| {
                matches!(event, ProcEvent::Exec(e) if e.pid == child_pid)
            })
            .expect("signal-terminated exit of the child", move |event| {
                matches!(event, ProcEvent::Exit(x)
                    if x.pid == child_pid && x.code == signal && x.signal == signal)
            })
            .report()
    })
}
