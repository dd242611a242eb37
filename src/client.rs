//! BLE power station client
//!
//! A single-flight request/response engine over the write/notify
//! characteristic pair. The client owns the device handle, the notification
//! stream and the session crypto state; at most one request is in flight per
//! client and every public operation runs under one deadline that covers
//! reconnection and the command itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::cipher::{self, CipherKey};
use crate::codec::ModbusCodec;
use crate::config::ClientConfig;
use crate::constants::{DEFAULT_TIMEOUT_MS, ENCRYPTION_WINDOW_MS};
use crate::error::{BleError, BleResult};
use crate::handshake::{Handshake, HandshakeRole};
use crate::keys::KeyBundle;
use crate::pdu::ModbusFrame;
use crate::transport::{GattTransport, LinkStats, TransportEvent};
use crate::utils::format_hex_pretty;

struct ClientInner {
    transport: Box<dyn GattTransport>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    session_key: Option<CipherKey>,
    ever_connected: bool,
    stats: LinkStats,
}

/// Client for one BLE power station
pub struct StationClient {
    inner: Mutex<ClientInner>,
    device_id: String,
    device_name: String,
    keys: Option<KeyBundle>,
    connected: AtomicBool,
    encrypted: AtomicBool,
    response_timeout: Duration,
    encryption_window: Duration,
}

impl std::fmt::Debug for StationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationClient")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("connected", &self.is_connected())
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl StationClient {
    /// Create a detached client around a selected device
    ///
    /// Supplying a key bundle arms encryption auto-detection: if the device
    /// opens with a handshake challenge after connect, the session is
    /// negotiated; otherwise the link stays plaintext.
    pub fn new(transport: Box<dyn GattTransport>, keys: Option<KeyBundle>) -> Self {
        let device_id = transport.id().to_string();
        let device_name = transport.name().to_string();
        Self {
            inner: Mutex::new(ClientInner {
                transport,
                events: None,
                session_key: None,
                ever_connected: false,
                stats: LinkStats::new(),
            }),
            device_id,
            device_name,
            keys,
            connected: AtomicBool::new(false),
            encrypted: AtomicBool::new(false),
            response_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            encryption_window: Duration::from_millis(ENCRYPTION_WINDOW_MS),
        }
    }

    /// Create a client with timeouts and key material from configuration
    pub fn with_config(transport: Box<dyn GattTransport>, config: &ClientConfig) -> BleResult<Self> {
        let keys = config.key_bundle()?;
        let mut client = Self::new(transport, keys);
        client.response_timeout = config.response_timeout();
        client.encryption_window = config.encryption_window();
        Ok(client)
    }

    /// Stable device identifier
    pub fn id(&self) -> &str {
        &self.device_id
    }

    /// Advertised device name
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Whether the GATT link is currently held
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Whether an encrypted session is established
    pub fn is_encrypted(&self) -> bool {
        self.encrypted.load(Ordering::Relaxed)
    }

    /// Snapshot of the link statistics
    pub async fn stats(&self) -> LinkStats {
        self.inner.lock().await.stats.clone()
    }

    /// Connect, subscribe to notifications and negotiate encryption if the
    /// device asks for it
    pub async fn connect(&self, timeout: Option<Duration>) -> BleResult<()> {
        let deadline = self.deadline(timeout);
        let mut inner = self.inner.try_lock().map_err(|_| BleError::Concurrency)?;
        self.drain_stale_events(&mut inner);
        self.ensure_connected(&mut inner, deadline).await
    }

    /// Drop the GATT link; the device handle is retained for reconnection
    pub async fn disconnect(&self) -> BleResult<()> {
        let mut inner = self.inner.lock().await;
        self.clear_link_state(&mut inner);
        inner
            .transport
            .disconnect()
            .await
            .map_err(BleError::from)?;
        info!("disconnected from {}", self.device_name);
        Ok(())
    }

    /// Read `count` holding registers starting at `start`
    ///
    /// Returns `2 * count` big-endian bytes. `count` is capped at 7 so the
    /// response fits the 20-byte GATT payload; larger requests fail with
    /// [`BleError::PacketTooLarge`] before any I/O.
    pub async fn read_registers(
        &self,
        start: u16,
        count: u16,
        timeout: Option<Duration>,
    ) -> BleResult<Vec<u8>> {
        let frame = ModbusCodec::build_read_holding(start, count)?;
        self.execute(frame, timeout).await
    }

    /// Write registers starting at `start`
    ///
    /// `data` must be non-empty, of even length and small enough for the
    /// command frame to fit the MTU. A single register rides the shorter
    /// FC06 frame; anything larger uses FC16.
    pub async fn write_registers(
        &self,
        start: u16,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> BleResult<()> {
        let frame = if data.len() == 2 {
            ModbusCodec::build_write_single(start, [data[0], data[1]])?
        } else {
            ModbusCodec::build_write_multiple(start, data)?
        };
        self.execute(frame, timeout).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Request pipeline
    // ------------------------------------------------------------------

    async fn execute(&self, frame: ModbusFrame, timeout: Option<Duration>) -> BleResult<Vec<u8>> {
        let deadline = self.deadline(timeout);
        let mut inner = self.inner.try_lock().map_err(|_| BleError::Concurrency)?;

        let result = self.execute_locked(&mut inner, frame, deadline).await;
        match &result {
            Ok(_) => {}
            Err(BleError::Timeout) => inner.stats.record_timeout(),
            Err(_) => inner.stats.record_error(),
        }
        result
    }

    async fn execute_locked(
        &self,
        inner: &mut ClientInner,
        frame: ModbusFrame,
        deadline: Instant,
    ) -> BleResult<Vec<u8>> {
        self.drain_stale_events(inner);
        self.ensure_connected(inner, deadline).await?;

        let request_fc = frame
            .function_code()
            .ok_or_else(|| BleError::invalid_argument("empty request frame"))?;
        let expected_size = ModbusCodec::expected_response_size(&frame);

        let wire = match &inner.session_key {
            Some(key) => cipher::encrypt_frame(frame.as_slice(), key, None)?,
            None => frame.as_slice().to_vec(),
        };

        trace!("TX {}", format_hex_pretty(&wire));
        self.write_with_deadline(inner, &wire, deadline).await?;
        inner.stats.record_request(wire.len());

        let notification = self.await_response(inner, deadline).await?;
        trace!("RX {}", format_hex_pretty(&notification));

        let response = match &inner.session_key {
            Some(key) => cipher::decrypt_frame(&notification, key, None)?,
            None => notification,
        };

        let payload = ModbusCodec::parse_response(&response, request_fc, expected_size)?;
        inner.stats.record_response(response.len());
        Ok(payload)
    }

    /// Wait for exactly one notification within the deadline
    async fn await_response(
        &self,
        inner: &mut ClientInner,
        deadline: Instant,
    ) -> BleResult<Vec<u8>> {
        match Self::recv_event(inner, deadline).await? {
            Some(TransportEvent::Notification(data)) => Ok(data),
            Some(TransportEvent::Disconnected) => {
                self.clear_link_state(inner);
                Err(BleError::Disconnected)
            }
            None => Err(BleError::Timeout),
        }
    }

    /// Receive one transport event, `None` when `until` passes first
    async fn recv_event(
        inner: &mut ClientInner,
        until: Instant,
    ) -> BleResult<Option<TransportEvent>> {
        let events = inner.events.as_mut().ok_or(BleError::Disconnected)?;
        match timeout_at(until, events.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(BleError::Disconnected),
            Ok(Some(event)) => Ok(Some(event)),
        }
    }

    async fn write_with_deadline(
        &self,
        inner: &mut ClientInner,
        data: &[u8],
        deadline: Instant,
    ) -> BleResult<()> {
        match timeout_at(deadline, inner.transport.write(data)).await {
            Err(_) => Err(BleError::Timeout),
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                let err = BleError::from(e);
                if matches!(err, BleError::Disconnected) {
                    self.clear_link_state(inner);
                }
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Reconnect on demand under the caller's deadline
    async fn ensure_connected(&self, inner: &mut ClientInner, deadline: Instant) -> BleResult<()> {
        if self.is_connected() && inner.events.is_some() {
            return Ok(());
        }

        if inner.ever_connected {
            inner.stats.record_reconnect();
            debug!("reconnecting to {}", self.device_name);
        }

        match timeout_at(deadline, inner.transport.connect()).await {
            Err(_) => return Err(BleError::Timeout),
            Ok(result) => result.map_err(BleError::from)?,
        }
        let events = match timeout_at(deadline, inner.transport.subscribe()).await {
            Err(_) => return Err(BleError::Timeout),
            Ok(result) => result.map_err(BleError::from)?,
        };
        inner.events = Some(events);
        inner.ever_connected = true;
        self.connected.store(true, Ordering::Relaxed);
        info!("connected to {} ({})", self.device_name, self.device_id);

        if let Some(bundle) = self.keys.clone() {
            self.detect_encryption(inner, deadline, bundle).await?;
        }
        Ok(())
    }

    /// Wait briefly for an unsolicited handshake challenge
    ///
    /// Silence within the window means the device speaks plaintext.
    async fn detect_encryption(
        &self,
        inner: &mut ClientInner,
        deadline: Instant,
        bundle: KeyBundle,
    ) -> BleResult<()> {
        let window = Instant::now() + self.encryption_window;
        let window = window.min(deadline);

        match Self::recv_event(inner, window).await? {
            None => {
                debug!("no challenge within the detection window; plaintext session");
                Ok(())
            }
            Some(TransportEvent::Disconnected) => {
                self.clear_link_state(inner);
                Err(BleError::Disconnected)
            }
            Some(TransportEvent::Notification(challenge)) => {
                self.run_handshake(inner, challenge, deadline, bundle).await
            }
        }
    }

    /// Drive the responder side of the handshake to completion
    async fn run_handshake(
        &self,
        inner: &mut ClientInner,
        first_frame: Vec<u8>,
        deadline: Instant,
        bundle: KeyBundle,
    ) -> BleResult<()> {
        info!("encrypted device detected, negotiating session");
        let mut handshake = Handshake::new(HandshakeRole::Responder, bundle);
        let mut incoming = Some(first_frame);

        while !handshake.is_complete() {
            let frame = match incoming.take() {
                Some(frame) => frame,
                None => match Self::recv_event(inner, deadline).await? {
                    Some(TransportEvent::Notification(data)) => data,
                    Some(TransportEvent::Disconnected) => {
                        self.clear_link_state(inner);
                        return Err(BleError::Disconnected);
                    }
                    None => return Err(BleError::Timeout),
                },
            };

            if let Some(reply) = handshake.advance(Some(&frame))? {
                self.write_with_deadline(inner, &reply, deadline).await?;
            }
        }

        inner.session_key = handshake.session_key();
        self.encrypted
            .store(inner.session_key.is_some(), Ordering::Relaxed);
        info!("encrypted session established");
        Ok(())
    }

    /// Consume events left over from a previous exchange
    ///
    /// A response that arrived after its request timed out must not be
    /// mistaken for the next response, and an idle-time disconnect must be
    /// noticed before reusing the link.
    fn drain_stale_events(&self, inner: &mut ClientInner) {
        let mut lost = false;
        if let Some(events) = inner.events.as_mut() {
            loop {
                match events.try_recv() {
                    Ok(TransportEvent::Notification(data)) => {
                        warn!("dropping stale notification of {} bytes", data.len());
                    }
                    Ok(TransportEvent::Disconnected) => {
                        debug!("disconnect observed while idle");
                        lost = true;
                        break;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        lost = true;
                        break;
                    }
                }
            }
        }
        if lost {
            self.clear_link_state(inner);
        }
    }

    /// Forget subscription and session state after link loss or disconnect
    fn clear_link_state(&self, inner: &mut ClientInner) {
        inner.events = None;
        inner.session_key = None;
        self.connected.store(false, Ordering::Relaxed);
        self.encrypted.store(false, Ordering::Relaxed);
    }

    fn deadline(&self, timeout: Option<Duration>) -> Instant {
        Instant::now() + timeout.unwrap_or(self.response_timeout)
    }
}
