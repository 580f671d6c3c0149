//! Runs the live process-events scenarios against the real kernel.
//! Needs CAP_NET_ADMIN: build, then `sudo ./test-suite`.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use libtest_mimic::{Arguments, Trial};
use proc_events::test_runner::TestReport;
use tokio::sync::mpsc;

fn main() {
    let mut args = Arguments::from_args();
    // Every scenario observes the same kernel-wide event stream, so they
    // must not overlap.
    args.test_threads = Some(1);

    // Writing to stdout would mess libtest-mimic's output; intercept logs
    // and panics on a channel and show them only for failed tests.
    let (tx_log, rx_log) = mpsc::unbounded_channel();
    install_log_interceptor(tx_log.clone());
    install_panic_interceptor(tx_log);
    let rx_log = Arc::new(Mutex::new(rx_log));

    let suite = proc_events::test_suite::tests();
    let trials = suite
        .tests
        .into_iter()
        .map(|case| {
            let name = format!("{}::{}", suite.name, case.name);
            let rx_log = Arc::clone(&rx_log);
            Trial::test(name, move || {
                let rt = tokio::runtime::Runtime::new().expect("tokio runtime init failed");
                let TestReport { success, mut lines } = rt
                    .block_on(AssertUnwindSafe(case.test).catch_unwind())
                    .unwrap_or(TestReport {
                        success: false,
                        lines: vec![],
                    });
                while let Ok(line) = rx_log.lock().unwrap().try_recv() {
                    lines.push(line);
                }
                if success {
                    Ok(())
                } else {
                    Err(lines.join("\n").into())
                }
            })
        })
        .collect();

    libtest_mimic::run(&args, trials).exit();
}

/// Forward library logs over a channel instead of stdout.
fn install_log_interceptor(tx_log: mpsc::UnboundedSender<String>) {
    struct ChannelLogger(mpsc::UnboundedSender<String>);

    impl log::Log for ChannelLogger {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }
        fn log(&self, record: &log::Record) {
            let _ = self.0.send(format!(
                "{}:{} -- {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }
        fn flush(&self) {}
    }

    log::set_boxed_logger(Box::new(ChannelLogger(tx_log)))
        .map(|()| log::set_max_level(log::LevelFilter::Debug))
        .expect("initializing logger failed");
}

/// Panics inside a scenario end up in its failure report too.
fn install_panic_interceptor(tx_log: mpsc::UnboundedSender<String>) {
    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(msg) = panic_info.payload().downcast_ref::<&str>() {
            msg.to_string()
        } else if let Some(msg) = panic_info.payload().downcast_ref::<String>() {
            msg.to_string()
        } else {
            "unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown location".to_string());
        let _ = tx_log.send(format!("panic: {message}\n  | at {location}"));
    }));
}
