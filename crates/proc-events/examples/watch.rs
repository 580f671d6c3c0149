//! Print every process event on the host. Requires CAP_NET_ADMIN:
//!
//!     sudo cargo run --example watch

use proc_events::{MonitorConfig, ProcessMonitor};

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut monitor = ProcessMonitor::connect(MonitorConfig::default())
        .expect("connect failed (CAP_NET_ADMIN required)");
    let mut events = monitor.listen_events().expect("listener already running");
    log::info!("watching process events, Ctrl-C to exit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(ack) = events.ack.recv() => log::info!("ack no={}", ack.no),
            Some(fork) = events.fork.recv() => log::info!(
                "fork {} -> {}", fork.parent_pid, fork.child_pid
            ),
            Some(exec) = events.exec.recv() => log::info!("exec {}", exec.pid),
            Some(uid) = events.uid.recv() => log::info!(
                "uid {} ruid={} euid={}", uid.pid, uid.ruid, uid.euid
            ),
            Some(gid) = events.gid.recv() => log::info!(
                "gid {} rgid={} egid={}", gid.pid, gid.rgid, gid.egid
            ),
            Some(sid) = events.sid.recv() => log::info!("sid {} (new session)", sid.pid),
            Some(exit) = events.exit.recv() => log::info!(
                "exit {} code={} signal={}", exit.pid, exit.code, exit.signal
            ),
            Some(error) = events.error.recv() => {
                proc_events::log_error("monitor error", error);
                break;
            }
        }
    }
    monitor.close();
}
