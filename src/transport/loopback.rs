//! In-memory accessory.
//!
//! [`LoopbackCentral`] hands out a single [`LoopbackDevice`] that records
//! every packet written to it and interprets them like the firmware does.
//! Used by tests and by `imagi packets` to show exactly what would go over
//! the air.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use super::{Central, DeviceFilter, Peripheral, TransportError};
use crate::codec::{decode_packet, DecodedPacket};
use crate::constants::{SERVICE_UUID, WRITE_CHARACTERISTIC_UUID};

/// A fake accessory that records writes.
pub struct LoopbackDevice {
    name: String,
    services: Vec<Uuid>,
    writes: Mutex<Vec<Vec<u8>>>,
    link: watch::Sender<bool>,
}

impl std::fmt::Debug for LoopbackDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackDevice")
            .field("name", &self.name)
            .field("linked", &*self.link.borrow())
            .field("write_count", &self.writes().len())
            .finish_non_exhaustive()
    }
}

impl LoopbackDevice {
    /// Accessory advertising `name` and the imagiCharm service.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_services(name, vec![SERVICE_UUID])
    }

    /// Accessory advertising arbitrary services.
    #[must_use]
    pub fn with_services(name: impl Into<String>, services: Vec<Uuid>) -> Arc<Self> {
        let (link, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            services,
            writes: Mutex::new(Vec::new()),
            link,
        })
    }

    /// Every packet written so far, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Writes as the firmware would interpret them; unknown packets skipped.
    #[must_use]
    pub fn decoded(&self) -> Vec<DecodedPacket> {
        self.writes()
            .iter()
            .filter_map(|packet| decode_packet(packet))
            .collect()
    }

    /// Whether a link is open.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        *self.link.borrow()
    }

    /// Simulate the accessory going out of range.
    pub fn drop_link(&self) {
        log::debug!("{}: simulating link drop", self.name);
        self.link.send_replace(false);
    }

    fn open_link(&self) {
        self.link.send_replace(true);
    }
}

#[async_trait]
impl Peripheral for LoopbackDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn write(&self, characteristic: Uuid, packet: &[u8]) -> Result<(), TransportError> {
        if !self.is_linked() {
            return Err(TransportError::SendFailed("link is down".to_string()));
        }
        if characteristic != WRITE_CHARACTERISTIC_UUID {
            return Err(TransportError::SendFailed(format!(
                "characteristic {characteristic} is not writable"
            )));
        }
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet.to_vec());
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn disconnect(&self) {
        self.link.send_replace(false);
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }
}

/// A radio that always finds the same loopback accessory.
#[derive(Debug)]
pub struct LoopbackCentral {
    device: Arc<LoopbackDevice>,
    cancel_next: AtomicBool,
    /// While `true`, discovery waits as if the chooser were still open.
    held: watch::Sender<bool>,
}

impl LoopbackCentral {
    /// Radio that will offer `device`.
    #[must_use]
    pub fn new(device: Arc<LoopbackDevice>) -> Arc<Self> {
        let (held, _) = watch::channel(false);
        Arc::new(Self {
            device,
            cancel_next: AtomicBool::new(false),
            held,
        })
    }

    /// Make the next discovery behave as if the user dismissed the chooser.
    pub fn cancel_next_request(&self) {
        self.cancel_next.store(true, Ordering::SeqCst);
    }

    /// Keep discovery pending until [`LoopbackCentral::release_requests`],
    /// like a chooser the user has not answered yet.
    pub fn hold_requests(&self) {
        self.held.send_replace(true);
    }

    /// Let held and future discoveries finish.
    pub fn release_requests(&self) {
        self.held.send_replace(false);
    }

    /// The accessory this radio offers.
    #[must_use]
    pub fn device(&self) -> &Arc<LoopbackDevice> {
        &self.device
    }
}

#[async_trait]
impl Central for LoopbackCentral {
    async fn request_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn Peripheral>, TransportError> {
        let mut held = self.held.subscribe();
        if held.wait_for(|held| !*held).await.is_err() {
            return Err(TransportError::ConnectionFailed("radio closed".to_string()));
        }
        if self.cancel_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Cancelled);
        }
        if !filter.matches(&self.device.name, &self.device.services) {
            return Err(TransportError::ConnectionFailed(format!(
                "no device named {}* offers service {}",
                filter.name_prefix, filter.service
            )));
        }
        self.device.open_link();
        Ok(Arc::clone(&self.device) as Arc<dyn Peripheral>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NOTIFY_CHARACTERISTIC_UUID;

    #[tokio::test]
    async fn test_write_requires_link() {
        let device = LoopbackDevice::new("imagiCharm-1");
        let err = device
            .write(WRITE_CHARACTERISTIC_UUID, &[0x11])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
    }

    #[tokio::test]
    async fn test_notify_characteristic_not_writable() {
        let device = LoopbackDevice::new("imagiCharm-1");
        device.open_link();
        assert!(device.write(NOTIFY_CHARACTERISTIC_UUID, &[1]).await.is_err());
        assert!(device.writes().is_empty());
    }

    #[tokio::test]
    async fn test_filter_mismatch() {
        let central = LoopbackCentral::new(LoopbackDevice::new("SomethingElse"));
        let err = central
            .request_device(&DeviceFilter::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
