//! Wireless transport to the imagiCharm accessory.
//!
//! The platform radio sits behind the [`Central`]/[`Peripheral`] traits so
//! the client logic (state machine, ordered writes, drop detection) is the
//! same for every backend. [`loopback`] provides an in-memory accessory that
//! decodes packets the way the firmware does.
//!
//! # Architecture
//!
//! ```text
//! ImagiClient
//!     │  connect() ──► Central::request_device(filter) ──► Peripheral
//!     │  send_animation() ──► codec ──► Peripheral::write (one packet at a time)
//!     │
//!     └── monitor task: Peripheral::link_state() goes false
//!             └──► Disconnected + on_disconnect callback
//! ```
//!
//! # State Machine
//!
//! `Disconnected → Connecting → Connected → Disconnected`. The link itself is
//! never retried here: a drop lands in `Disconnected` and the caller decides
//! what to do.

pub mod loopback;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::{
    build_animation_footer, build_frame_packet, build_scrolling_text_packet, ScrollingTextOptions,
};
use crate::constants::{DEVICE_NAME_PREFIX, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID};
use crate::matrix::Frame;
use crate::sandbox::Render;

/// What discovery looks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Advertised name prefix.
    pub name_prefix: String,
    /// Required GATT service.
    pub service: Uuid,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
            service: SERVICE_UUID,
        }
    }
}

impl DeviceFilter {
    /// Filter with a custom name prefix and the standard service.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Whether an advertisement matches.
    #[must_use]
    pub fn matches(&self, name: &str, services: &[Uuid]) -> bool {
        name.starts_with(&self.name_prefix) && services.contains(&self.service)
    }
}

/// Connection state of the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Discovery or pairing in progress.
    Connecting,
    /// Link up; writes allowed.
    Connected,
}

/// Errors surfaced by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A send was attempted without a link.
    NotConnected,
    /// The host has no wireless capability.
    Unsupported,
    /// Discovery or pairing failed.
    ConnectionFailed(String),
    /// The user dismissed the device chooser, or `disconnect` raced `connect`.
    Cancelled,
    /// A packet write failed.
    SendFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected to imagiCharm."),
            Self::Unsupported => write!(f, "Wireless connections are not supported here."),
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::Cancelled => write!(f, "Connection cancelled."),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// The host's radio: finds and opens a link to one accessory.
#[async_trait]
pub trait Central: Send + Sync {
    /// Discover a device matching `filter` and open a link to it.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Cancelled` if the user dismisses the chooser
    /// and `TransportError::ConnectionFailed` if no link could be opened.
    async fn request_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn Peripheral>, TransportError>;
}

/// An open link to one accessory.
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// Advertised device name.
    fn name(&self) -> String;

    /// Write one packet and wait for the write to complete.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::SendFailed` if the write fails.
    async fn write(&self, characteristic: Uuid, packet: &[u8]) -> Result<(), TransportError>;

    /// Close the link. Safe to call on a closed link.
    async fn disconnect(&self);

    /// Link liveness; flips to `false` (or closes) when the link drops.
    fn link_state(&self) -> watch::Receiver<bool>;
}

/// Called when the link drops without `disconnect` being asked for.
pub type DisconnectCallback = Box<dyn FnMut() + Send>;

struct Link {
    state: ConnectionState,
    peripheral: Option<Arc<dyn Peripheral>>,
    /// Bumped by every connect and disconnect so stale tasks can tell they
    /// no longer own the link.
    generation: u64,
    monitor: Option<JoinHandle<()>>,
}

type SharedLink = Arc<Mutex<Link>>;

fn lock(link: &SharedLink) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client for one imagiCharm accessory.
pub struct ImagiClient {
    central: Option<Arc<dyn Central>>,
    filter: DeviceFilter,
    link: SharedLink,
    /// Held for a whole animation or text send.
    write_lock: tokio::sync::Mutex<()>,
    on_disconnect: Arc<Mutex<Option<DisconnectCallback>>>,
}

impl std::fmt::Debug for ImagiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagiClient")
            .field("supported", &self.central.is_some())
            .field("filter", &self.filter)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ImagiClient {
    /// Client backed by `central`, looking for the standard accessory.
    #[must_use]
    pub fn new(central: Arc<dyn Central>) -> Self {
        Self::with_filter(Some(central), DeviceFilter::default())
    }

    /// Client on a host without wireless support; `connect` always fails
    /// with `TransportError::Unsupported`.
    #[must_use]
    pub fn unsupported() -> Self {
        Self::with_filter(None, DeviceFilter::default())
    }

    /// Client with an explicit filter.
    #[must_use]
    pub fn with_filter(central: Option<Arc<dyn Central>>, filter: DeviceFilter) -> Self {
        Self {
            central,
            filter,
            link: Arc::new(Mutex::new(Link {
                state: ConnectionState::Disconnected,
                peripheral: None,
                generation: 0,
                monitor: None,
            })),
            write_lock: tokio::sync::Mutex::new(()),
            on_disconnect: Arc::new(Mutex::new(None)),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.link).state
    }

    /// Whether writes are allowed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Name of the connected device.
    #[must_use]
    pub fn device_name(&self) -> Option<String> {
        lock(&self.link).peripheral.as_ref().map(|p| p.name())
    }

    /// Register the callback fired when the link drops unexpectedly.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        if let Ok(mut slot) = self.on_disconnect.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Discover and connect to an accessory, returning its name.
    ///
    /// Already connected: returns the current device's name without doing
    /// anything.
    ///
    /// # Errors
    ///
    /// - `TransportError::Unsupported` without a radio
    /// - `TransportError::ConnectionFailed` if discovery fails or another
    ///   connect is in progress
    /// - `TransportError::Cancelled` if the chooser was dismissed or
    ///   `disconnect` was called meanwhile
    pub async fn connect(&self) -> Result<String, TransportError> {
        let central = self.central.as_ref().ok_or(TransportError::Unsupported)?;

        let generation = {
            let mut link = lock(&self.link);
            match link.state {
                ConnectionState::Connected => {
                    if let Some(peripheral) = &link.peripheral {
                        return Ok(peripheral.name());
                    }
                }
                ConnectionState::Connecting => {
                    return Err(TransportError::ConnectionFailed(
                        "a connection attempt is already in progress".to_string(),
                    ));
                }
                ConnectionState::Disconnected => {}
            }
            link.state = ConnectionState::Connecting;
            link.generation += 1;
            link.generation
        };

        log::info!("Looking for {}* devices", self.filter.name_prefix);
        let peripheral = match central.request_device(&self.filter).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                let mut link = lock(&self.link);
                if link.generation == generation {
                    link.state = ConnectionState::Disconnected;
                }
                log::warn!("Connection failed: {e}");
                return Err(e);
            }
        };

        let name = peripheral.name();
        let superseded = {
            let mut link = lock(&self.link);
            if link.generation == generation {
                link.state = ConnectionState::Connected;
                link.peripheral = Some(Arc::clone(&peripheral));
                link.monitor = Some(self.spawn_monitor(&peripheral, generation));
                false
            } else {
                true
            }
        };

        if superseded {
            peripheral.disconnect().await;
            return Err(TransportError::Cancelled);
        }

        log::info!("Connected to {name}");
        Ok(name)
    }

    /// Close the link. Idempotent; does not fire the disconnect callback.
    pub async fn disconnect(&self) {
        let peripheral = {
            let mut link = lock(&self.link);
            link.generation += 1;
            link.state = ConnectionState::Disconnected;
            if let Some(monitor) = link.monitor.take() {
                monitor.abort();
            }
            link.peripheral.take()
        };

        if let Some(peripheral) = peripheral {
            peripheral.disconnect().await;
            log::info!("Disconnected from {}", peripheral.name());
        }
    }

    fn connected_peripheral(&self) -> Result<Arc<dyn Peripheral>, TransportError> {
        let link = lock(&self.link);
        match (&link.state, &link.peripheral) {
            (ConnectionState::Connected, Some(peripheral)) => Ok(Arc::clone(peripheral)),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Send frames followed by the footer that starts playback.
    ///
    /// Packets go out strictly in order, each write awaited before the next.
    /// An empty frame list sends nothing.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotConnected` before any packet is written
    /// when there is no link, or `TransportError::SendFailed` if a write
    /// fails part way.
    pub async fn send_animation(
        &self,
        frames: &[Frame],
        loop_count: u32,
        outdoor_mode: bool,
    ) -> Result<(), TransportError> {
        let peripheral = self.connected_peripheral()?;
        if frames.is_empty() {
            log::debug!("Skipping send of empty animation");
            return Ok(());
        }

        let _writing = self.write_lock.lock().await;
        for (index, frame) in frames.iter().enumerate() {
            let packet =
                build_frame_packet(index, frame.snapshot(), frame.duration_ms(), outdoor_mode);
            peripheral.write(WRITE_CHARACTERISTIC_UUID, &packet).await?;
        }
        let footer = build_animation_footer(frames.len(), loop_count);
        peripheral.write(WRITE_CHARACTERISTIC_UUID, &footer).await?;

        log::debug!("Sent {} frame(s), loop {loop_count}", frames.len());
        Ok(())
    }

    /// Send a sandbox render.
    ///
    /// # Errors
    ///
    /// Same as [`ImagiClient::send_animation`].
    pub async fn send_render(&self, render: &Render) -> Result<(), TransportError> {
        self.send_animation(&render.frames, render.loop_count, render.outdoor_mode)
            .await
    }

    /// Ask the firmware to scroll text on its own.
    ///
    /// # Errors
    ///
    /// Same connection contract as [`ImagiClient::send_animation`].
    pub async fn send_scrolling_text(
        &self,
        opts: &ScrollingTextOptions,
    ) -> Result<(), TransportError> {
        let peripheral = self.connected_peripheral()?;
        let _writing = self.write_lock.lock().await;
        peripheral
            .write(WRITE_CHARACTERISTIC_UUID, &build_scrolling_text_packet(opts))
            .await
    }

    /// Watch the link and fall back to `Disconnected` when it drops.
    fn spawn_monitor(&self, peripheral: &Arc<dyn Peripheral>, generation: u64) -> JoinHandle<()> {
        let mut link_state = peripheral.link_state();
        let link = Arc::clone(&self.link);
        let on_disconnect = Arc::clone(&self.on_disconnect);

        tokio::spawn(async move {
            loop {
                if !*link_state.borrow_and_update() {
                    break;
                }
                if link_state.changed().await.is_err() {
                    break;
                }
            }

            let dropped = {
                let mut link = lock(&link);
                if link.generation == generation && link.state == ConnectionState::Connected {
                    link.state = ConnectionState::Disconnected;
                    link.peripheral = None;
                    link.monitor = None;
                    true
                } else {
                    false
                }
            };

            if dropped {
                log::warn!("imagiCharm link dropped");
                if let Ok(mut slot) = on_disconnect.lock() {
                    if let Some(callback) = slot.as_mut() {
                        callback();
                    }
                }
            }
        })
    }
}

impl Drop for ImagiClient {
    fn drop(&mut self) {
        if let Some(monitor) = lock(&self.link).monitor.take() {
            monitor.abort();
        }
    }
}
