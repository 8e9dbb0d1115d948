//! Dedicated host thread for the standalone server.
//!
//! Embedded in a real content-creation application, [`Scheduler::tick`] is
//! called from that application's own timer. The standalone binary has no such
//! timer, so [`HostLoop`] provides one: a named OS thread that owns the
//! scheduler and ticks it at a fixed interval.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use super::HostOperations;
use crate::bridge::HostEnd;
use crate::config::SchedulerConfig;
use crate::registry::ToolRegistry;
use crate::scheduler::{DrainReport, Scheduler};

/// Handle to a running host thread.
#[derive(Debug)]
pub struct HostLoop {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<DrainReport>,
}

impl HostLoop {
    /// Starts the host thread.
    ///
    /// `host` runs on the new thread and builds the host implementation there,
    /// so the implementation itself never has to be `Send`. Returning `None`
    /// runs the scheduler without a host.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<F>(
        host: F,
        registry: Arc<ToolRegistry>,
        bridge: HostEnd,
        config: SchedulerConfig,
        grace: Duration,
    ) -> io::Result<Self>
    where
        F: FnOnce() -> Option<Box<dyn HostOperations>> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("host".to_string())
            .spawn(move || {
                let mut scheduler = Scheduler::new(registry, bridge, &config);
                if let Some(host) = host() {
                    scheduler = scheduler.with_host(host);
                }
                let interval = config.tick_interval();
                info!(
                    tick_ms = interval.as_millis(),
                    per_tick = config.max_calls_per_tick,
                    "host loop started"
                );

                while !flag.load(Ordering::Acquire) {
                    let report = scheduler.tick();
                    if report.disconnected {
                        info!("bridge closed, host loop stopping");
                        break;
                    }
                    // A full batch means more is queued; tick again at once.
                    if report.executed < config.max_calls_per_tick {
                        thread::sleep(interval);
                    }
                }

                let report = scheduler.drain(grace);
                info!(
                    executed = report.executed,
                    abandoned = report.abandoned,
                    "host loop stopped"
                );
                report
            })?;

        Ok(Self { stop, thread })
    }

    /// Stops ticking, drains queued calls for the grace period, and waits for
    /// the thread to exit.
    pub fn shutdown(self) -> DrainReport {
        self.stop.store(true, Ordering::Release);
        match self.thread.join() {
            Ok(report) => report,
            Err(_) => {
                error!("host thread panicked");
                DrainReport::default()
            }
        }
    }
}
