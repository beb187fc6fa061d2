//! Connectivity tracking.
//!
//! The platform feeds raw online/offline signals in; the monitor debounces
//! them and publishes exactly one [`NetworkEvent`] per genuine transition.
//! A state must hold for the full debounce window before it is committed,
//! so a flapping link emits nothing until it settles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkEvent {
    Online,
    Offline,
}

/// Debounced connectivity monitor. Carries no business data, only the
/// binary link state.
#[derive(Clone)]
pub struct NetworkMonitor {
    online: Arc<AtomicBool>,
    raw_tx: Arc<watch::Sender<bool>>,
    event_tx: Arc<broadcast::Sender<NetworkEvent>>,
    debounce_window: Duration,
    started: Arc<AtomicBool>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .field("debounce_window", &self.debounce_window)
            .finish()
    }
}

impl NetworkMonitor {
    pub fn new(debounce_window: Duration, initially_online: bool) -> Self {
        let (raw_tx, _) = watch::channel(initially_online);
        let (event_tx, _) = broadcast::channel(64);
        Self {
            online: Arc::new(AtomicBool::new(initially_online)),
            raw_tx: Arc::new(raw_tx),
            event_tx: Arc::new(event_tx),
            debounce_window,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the debounce task. Must run inside a Tokio runtime; calling it
    /// twice is a no-op. The task exits when the monitor is dropped.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut raw_rx = self.raw_tx.subscribe();
        let online = self.online.clone();
        let event_tx = self.event_tx.clone();
        let window = self.debounce_window;

        tokio::spawn(async move {
            loop {
                if raw_rx.changed().await.is_err() {
                    break;
                }
                let mut candidate = *raw_rx.borrow_and_update();

                // Wait for the signal to stay put for a full window; every
                // flap restarts the wait with the newest value.
                loop {
                    match tokio::time::timeout(window, raw_rx.changed()).await {
                        Ok(Ok(())) => candidate = *raw_rx.borrow_and_update(),
                        Ok(Err(_)) => return,
                        Err(_) => break,
                    }
                }

                let previous = online.swap(candidate, Ordering::SeqCst);
                if previous != candidate {
                    let event = if candidate {
                        NetworkEvent::Online
                    } else {
                        NetworkEvent::Offline
                    };
                    tracing::info!(
                        "Network is {}",
                        if candidate { "online" } else { "offline" }
                    );
                    let _ = event_tx.send(event);
                }
            }
        });
    }

    /// Raw signal from the platform: the link looks up.
    pub fn report_online(&self) {
        self.raw_tx.send_replace(true);
    }

    /// Raw signal from the platform: the link looks down.
    pub fn report_offline(&self) {
        self.raw_tx.send_replace(false);
    }

    /// Debounced snapshot.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// One event per committed transition.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.event_tx.subscribe()
    }
}
