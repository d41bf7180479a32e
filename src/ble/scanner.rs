//! Peripheral discovery.
//!
//! Provides the locator that runs a time-bounded, service-filtered scan and
//! hands back the first matching peripheral.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{LinkEvent, LinkPlatform, PeripheralHandle};
use crate::error::{Error, Result};

/// Finds the first peripheral advertising a service.
///
/// Each [`locate`](PeripheralLocator::locate) call is an independent scan
/// window. The scan is always stopped before `locate` returns, whether it
/// matched, timed out, or was stopped.
pub struct PeripheralLocator<P: LinkPlatform + ?Sized> {
    /// Platform to scan with.
    platform: Arc<P>,
    /// Whether a scan started by this locator is running.
    is_scanning: Arc<AtomicBool>,
    /// Stop requests; bumping the generation cancels the running scan.
    stop_tx: watch::Sender<u64>,
}

impl<P: LinkPlatform + ?Sized> PeripheralLocator<P> {
    /// Create a locator on a platform.
    pub fn new(platform: Arc<P>) -> Self {
        let (stop_tx, _) = watch::channel(0);

        Self {
            platform,
            is_scanning: Arc::new(AtomicBool::new(false)),
            stop_tx,
        }
    }

    /// Scan for up to `window` and return the first peripheral advertising `service`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if nothing matched within the window.
    /// - [`Error::Cancelled`] if [`stop`](Self::stop) was called.
    /// - Any error from starting the scan.
    pub async fn locate(&self, service: Uuid, window: Duration) -> Result<PeripheralHandle> {
        let deadline = Instant::now() + window;

        // Subscribe before starting so the first advertisement is not missed.
        let mut events = self.platform.events();
        let mut stop_rx = self.stop_tx.subscribe();
        stop_rx.borrow_and_update();

        info!("Scanning for service {} ({:?} window)", service, window);
        self.platform.start_scan(service).await?;
        self.is_scanning.store(true, Ordering::SeqCst);
        let guard = ScanGuard {
            platform: self.platform.clone(),
            is_scanning: self.is_scanning.clone(),
            armed: true,
        };

        let outcome = tokio::select! {
            found = tokio::time::timeout_at(deadline, Self::first_match(&mut events, service)) => {
                match found {
                    Ok(Some(peripheral)) => {
                        info!("Found peripheral {}", peripheral);
                        Ok(peripheral)
                    }
                    Ok(None) => Err(Error::Internal("platform event stream closed".to_string())),
                    Err(_) => {
                        debug!("Scan window elapsed without a match");
                        Err(Error::NotFound {
                            service: service.to_string(),
                        })
                    }
                }
            }
            _ = stop_rx.changed() => {
                debug!("Scan stopped on request");
                Err(Error::Cancelled)
            }
        };

        guard.stop().await;
        outcome
    }

    /// Stop a running [`locate`](Self::locate); it resolves to [`Error::Cancelled`].
    pub fn stop(&self) {
        self.stop_tx.send_modify(|generation| *generation += 1);
    }

    /// Check if a scan started by this locator is running.
    pub fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    async fn first_match(
        events: &mut broadcast::Receiver<LinkEvent>,
        service: Uuid,
    ) -> Option<PeripheralHandle> {
        loop {
            match events.recv().await {
                Ok(LinkEvent::Discovered {
                    peripheral,
                    services,
                }) => {
                    if services.contains(&service) {
                        return Some(peripheral);
                    }
                    trace!("Ignoring advertisement from {} without service", peripheral);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Scan missed {} platform events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Stops the scan when `locate` finishes or its future is dropped mid-scan.
struct ScanGuard<P: LinkPlatform + ?Sized> {
    platform: Arc<P>,
    is_scanning: Arc<AtomicBool>,
    armed: bool,
}

impl<P: LinkPlatform + ?Sized> ScanGuard<P> {
    async fn stop(mut self) {
        self.armed = false;
        self.is_scanning.store(false, Ordering::SeqCst);
        if let Err(e) = self.platform.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
    }
}

impl<P: LinkPlatform + ?Sized> Drop for ScanGuard<P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.is_scanning.store(false, Ordering::SeqCst);
        let platform = self.platform.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = platform.stop_scan().await {
                    warn!("Failed to stop abandoned scan: {}", e);
                }
            });
        }
    }
}
