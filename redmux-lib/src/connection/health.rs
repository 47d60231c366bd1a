//!
//! Liveness: the health ping loop and the idle watchdog.
//!
//! The ping exists only to make a healthy server produce traffic; deciding
//! whether traffic stopped is entirely the watchdog's job.
//!

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time;
use tracing::debug;

use super::Shared;
use crate::adapter::Ignore;
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::request::Request;

/// Enqueues a ping every `ping_interval`, discarding the response. The loop
/// never waits for a reply, so its cadence holds even against a server that
/// stopped answering.
pub(crate) async fn health_loop(shared: &Shared, config: &Config) -> crate::Result<()> {
    let mut in_flight = None;
    loop {
        time::sleep(config.ping_interval).await;
        debug!("sending health ping");
        let req = Request::ping(&config.health_check_id);
        let (rx, wake_writer) = {
            let mut queue = shared.queue.lock().unwrap();
            queue.push_back(&req, Box::new(Ignore))
        };
        // Only the newest receiver is kept. A previous ping that never made
        // it to the wire loses its submitter here and is pruned from the
        // queue instead of piling up behind a stalled batch.
        drop(in_flight.replace(rx));
        if wake_writer {
            shared.writer_wake.notify_one();
        }
        // Same sweep as `exec`: a close racing the enqueue must not leave a
        // queued entry behind.
        if shared.closed.load(Ordering::SeqCst) {
            shared.queue.lock().unwrap().fail_all(&Error::aborted());
        }
    }
}

/// Fails the connection when no bytes arrived for twice the ping interval.
pub(crate) async fn idle_loop(shared: &Shared, ping_interval: Duration) -> crate::Result<()> {
    loop {
        time::sleep(ping_interval).await;
        let idle = shared.last_data.lock().unwrap().elapsed();
        if idle > ping_interval * 2 {
            return Err(Error::with_detail(
                ErrorKind::IdleTimeout,
                format!("no data received for {}ms", idle.as_millis()),
            ));
        }
    }
}
