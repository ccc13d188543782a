//! Shuts the hub down when the process is asked to stop.
//!
//! A single background task waits for **CTRL+C** or **SIGHUP** and calls
//! [Hub::terminate](crate::hub::Hub::terminate), which stops the shrinkers and the
//! config monitor on their next wakeup.
use std::sync::Arc;

use tokio::signal::unix::SignalKind;

use crate::hub::Hub;

/// Spawns the task which listens for termination signals on behalf of the given hub.
///
/// The [Builder](crate::builder::Builder) calls this by default, use
/// [disable_signals](crate::builder::Builder::disable_signals) to opt out.
pub fn install(hub: Arc<Hub>) {
    crate::spawn!(async move {
        let mut hangup = match tokio::signal::unix::signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(error) => {
                log::error!("Failed to install the SIGHUP handler: {}", error);
                return;
            }
        };

        let signal = tokio::select! {
            _ = tokio::signal::ctrl_c() => "CTRL-C",
            _ = hangup.recv() => "SIGHUP",
        };

        log::info!("Received {}. Shutting down...", signal);
        hub.terminate();
    });
}
