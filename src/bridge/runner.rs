//! Tokio runner driving the control tick.

use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bridge::service::Bridge;
use crate::core::traits::{MessageProcessor, Transport};

/// Handle to a spawned bridge task. Dropping it signals shutdown; use
/// [`shutdown`](BridgeHandle::shutdown) to also wait for the task to finish.
pub struct BridgeHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Run a bridge on a fixed-rate control tick inside a tokio task.
///
/// The tick fires at the configured control sync rate. Missed ticks are
/// delayed rather than burst, so a stalled executor does not produce a run
/// of back-to-back frames.
pub fn spawn<T, P>(mut bridge: Bridge<T, P>) -> BridgeHandle
where
    T: Transport + Send + 'static,
    P: MessageProcessor + Send + 'static,
{
    let period = Duration::from_secs_f32(1.0 / bridge.config().control_sync_rate_hz);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => bridge.tick(),
                _ = &mut shutdown_rx => {
                    debug!("bridge runner shutting down");
                    bridge.shutdown();
                    break;
                }
            }
        }
    });
    BridgeHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}

impl BridgeHandle {
    /// Signal shutdown and wait for the tick task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::BridgeConfig;
    use serde_json::Value;

    struct NullTransport;

    impl Transport for NullTransport {
        fn open(&mut self, _url: &str) {}
        fn send(&mut self, _text: &str) -> bool {
            true
        }
        fn close(&mut self) {}
    }

    struct NullProcessor;

    impl MessageProcessor for NullProcessor {
        fn process(&mut self, _raw: &str, _parsed: Option<&Value>) {}
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_advance_the_frame_counter() {
        let bridge = Bridge::new(BridgeConfig::default(), NullTransport, NullProcessor).unwrap();
        let inbound = bridge.inbound();
        let handle = spawn(bridge);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(inbound.current_frame() >= 5);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_the_task() {
        let bridge = Bridge::new(BridgeConfig::default(), NullTransport, NullProcessor).unwrap();
        let inbound = bridge.inbound();
        let handle = spawn(bridge);
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frame = inbound.current_frame();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(inbound.current_frame(), frame);
    }
}
