//! In-process mock power station
//!
//! Exposes the same GATT surface as a real device (connect/disconnect,
//! write-with-response, notifications) over an in-memory MODBUS server with
//! a sparse register map, readable/writable range tables and a FIFO queue of
//! injected failures. Configured with a key bundle it plays the handshake
//! initiator, opening with the unsolicited challenge shortly after
//! notification subscription.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::cipher::{self, CipherKey};
use crate::constants::{
    FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, GATT_MTU,
    SLAVE_ADDRESS,
};
use crate::crc::{append_crc, verify_crc};
use crate::error::BleResult;
use crate::handshake::{Handshake, HandshakeRole};
use crate::keys::KeyBundle;
use crate::transport::{GattTransport, TransportError, TransportEvent};

/// One queued failure override, consumed by at most one matching exchange
#[derive(Debug, Clone)]
pub enum FailureInjection {
    /// Suppress the response entirely
    Timeout,
    /// Corrupt the response CRC
    CrcError,
    /// Drop the connection instead of answering
    ConnectionError,
    /// Replace the response with fixed bytes
    CannedResponse(Vec<u8>),
}

/// Mock device configuration
#[derive(Debug, Clone)]
pub struct MockStationConfig {
    /// Stable device identifier
    pub id: String,
    /// Advertised name
    pub name: String,
    /// Address ranges that answer reads
    pub readable: Vec<Range<u16>>,
    /// Address ranges that accept writes
    pub writable: Vec<Range<u16>>,
    /// Present = the device requires an encrypted session
    pub keys: Option<KeyBundle>,
    /// Delay before the unsolicited handshake challenge
    pub challenge_delay: Duration,
    /// Notification latency
    pub response_delay: Duration,
}

impl Default for MockStationConfig {
    fn default() -> Self {
        Self {
            id: "mock-station-01".to_string(),
            name: "MOCK-PS2000".to_string(),
            readable: vec![0..1024],
            writable: vec![0..1024],
            keys: None,
            challenge_delay: Duration::from_millis(20),
            response_delay: Duration::from_millis(1),
        }
    }
}

#[derive(Default)]
struct MockState {
    connected: bool,
    registers: HashMap<u16, u16>,
    injections: VecDeque<FailureInjection>,
    notify: Option<mpsc::UnboundedSender<TransportEvent>>,
    handshake: Option<Handshake>,
    session_key: Option<CipherKey>,
}

/// Mock power station implementing [`GattTransport`]
///
/// Clones share the same device state, so tests can keep a control handle
/// after boxing one clone into a client.
#[derive(Clone)]
pub struct MockStation {
    config: MockStationConfig,
    state: Arc<Mutex<MockState>>,
}

impl MockStation {
    /// Create a mock with the given configuration
    pub fn new(config: MockStationConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Create a plaintext mock with default ranges
    pub fn plaintext() -> Self {
        Self::new(MockStationConfig::default())
    }

    /// Create an encrypted mock using the given bundle
    pub fn encrypted(keys: KeyBundle) -> Self {
        Self::new(MockStationConfig {
            keys: Some(keys),
            ..MockStationConfig::default()
        })
    }

    /// Preload one register (for tests)
    pub async fn set_register(&self, address: u16, value: u16) {
        self.state.lock().await.registers.insert(address, value);
    }

    /// Read back one register (for tests); unset registers read as zero
    pub async fn register(&self, address: u16) -> u16 {
        self.state
            .lock()
            .await
            .registers
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Queue a failure override
    pub async fn inject(&self, failure: FailureInjection) {
        self.state.lock().await.injections.push_back(failure);
    }

    /// Simulate an OS-level disconnect while idle
    pub async fn force_disconnect(&self) {
        let mut state = self.state.lock().await;
        Self::drop_link(&mut state);
    }

    fn drop_link(state: &mut MockState) {
        state.connected = false;
        state.handshake = None;
        state.session_key = None;
        if let Some(notify) = state.notify.take() {
            let _ = notify.send(TransportEvent::Disconnected);
        }
    }

    /// Deliver notifications after the configured latency, preserving order
    fn schedule_notifications(
        &self,
        tx: mpsc::UnboundedSender<TransportEvent>,
        payloads: Vec<Vec<u8>>,
    ) {
        let delay = self.config.response_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for payload in payloads {
                if tx.send(TransportEvent::Notification(payload)).is_err() {
                    break;
                }
            }
        });
    }

    /// Feed a write into the handshake engine, returning frames to notify
    fn advance_handshake(state: &mut MockState, data: &[u8]) -> BleResult<Vec<Vec<u8>>> {
        let mut replies = Vec::new();
        if let Some(handshake) = state.handshake.as_mut() {
            if let Some(reply) = handshake.advance(Some(data))? {
                replies.push(reply);
            }
            // The initiator may owe an unsolicited follow-up (its public key
            // right after the challenge verdict)
            if let Some(next) = handshake.advance(None)? {
                replies.push(next);
            }
            if handshake.is_complete() {
                state.session_key = handshake.session_key();
                state.handshake = None;
                debug!("mock: encrypted session established");
            }
        }
        Ok(replies)
    }

    /// Pop composable overrides off the queue front
    ///
    /// Returns (timeout, crc, connection, canned). Timeout and CRC compose on
    /// one exchange; a connection error or canned response is exclusive.
    fn take_overrides(
        injections: &mut VecDeque<FailureInjection>,
    ) -> (bool, bool, bool, Option<Vec<u8>>) {
        let mut timeout = false;
        let mut crc = false;

        loop {
            match injections.front() {
                Some(FailureInjection::Timeout) if !timeout => {
                    timeout = true;
                    injections.pop_front();
                }
                Some(FailureInjection::CrcError) if !crc => {
                    crc = true;
                    injections.pop_front();
                }
                Some(FailureInjection::ConnectionError) if !timeout && !crc => {
                    injections.pop_front();
                    return (false, false, true, None);
                }
                Some(FailureInjection::CannedResponse(_)) if !timeout && !crc => {
                    if let Some(FailureInjection::CannedResponse(bytes)) = injections.pop_front() {
                        return (false, false, false, Some(bytes));
                    }
                }
                _ => break,
            }
        }
        (timeout, crc, false, None)
    }

    /// Execute one MODBUS request against the register map
    fn process_request(&self, state: &mut MockState, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < 4 || !verify_crc(frame) {
            warn!("mock: dropping malformed frame of {} bytes", frame.len());
            return None;
        }
        if frame[0] != SLAVE_ADDRESS {
            return None;
        }

        let function = frame[1];
        match function {
            FC_READ_HOLDING_REGISTERS => {
                if frame.len() != 8 {
                    return Some(exception(function, 0x03));
                }
                let address = u16::from_be_bytes([frame[2], frame[3]]);
                let quantity = u16::from_be_bytes([frame[4], frame[5]]);
                if quantity == 0 || 2 * quantity as usize + 5 > GATT_MTU {
                    return Some(exception(function, 0x03));
                }
                if !self.covers(&self.config.readable, address, quantity) {
                    return Some(exception(function, 0x02));
                }

                let mut response = vec![SLAVE_ADDRESS, function, (2 * quantity) as u8];
                for offset in 0..quantity {
                    let value = state
                        .registers
                        .get(&(address + offset))
                        .copied()
                        .unwrap_or(0);
                    response.extend_from_slice(&value.to_be_bytes());
                }
                append_crc(&mut response);
                Some(response)
            }
            FC_WRITE_SINGLE_REGISTER => {
                if frame.len() != 8 {
                    return Some(exception(function, 0x03));
                }
                let address = u16::from_be_bytes([frame[2], frame[3]]);
                if !self.covers(&self.config.writable, address, 1) {
                    return Some(exception(function, 0x02));
                }
                let value = u16::from_be_bytes([frame[4], frame[5]]);
                state.registers.insert(address, value);
                // Response echoes the request
                Some(frame.to_vec())
            }
            FC_WRITE_MULTIPLE_REGISTERS => {
                if frame.len() < 9 {
                    return Some(exception(function, 0x03));
                }
                let address = u16::from_be_bytes([frame[2], frame[3]]);
                let quantity = u16::from_be_bytes([frame[4], frame[5]]);
                let byte_count = frame[6] as usize;
                if byte_count != 2 * quantity as usize || frame.len() != 9 + byte_count {
                    return Some(exception(function, 0x03));
                }
                if !self.covers(&self.config.writable, address, quantity) {
                    return Some(exception(function, 0x02));
                }

                for offset in 0..quantity as usize {
                    let value =
                        u16::from_be_bytes([frame[7 + 2 * offset], frame[8 + 2 * offset]]);
                    state.registers.insert(address + offset as u16, value);
                }

                let mut response = vec![SLAVE_ADDRESS, function];
                response.extend_from_slice(&address.to_be_bytes());
                response.extend_from_slice(&quantity.to_be_bytes());
                append_crc(&mut response);
                Some(response)
            }
            _ => Some(exception(function, 0x01)),
        }
    }

    fn covers(&self, ranges: &[Range<u16>], start: u16, quantity: u16) -> bool {
        (0..quantity).all(|offset| {
            let address = start.wrapping_add(offset);
            ranges.iter().any(|range| range.contains(&address))
        })
    }
}

/// Build an exception response for `function` with `code`
fn exception(function: u8, code: u8) -> Vec<u8> {
    let mut response = vec![SLAVE_ADDRESS, function | 0x80, code];
    append_crc(&mut response);
    response
}

#[async_trait]
impl GattTransport for MockStation {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.connected = true;
        state.handshake = None;
        state.session_key = None;
        debug!("mock: connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.notify = None;
        state.handshake = None;
        state.session_key = None;
        debug!("mock: disconnected");
        Ok(())
    }

    async fn subscribe(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(TransportError::SubscribeFailed("not connected".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.notify = Some(tx.clone());

        if let Some(bundle) = &self.config.keys {
            let mut handshake = Handshake::new(HandshakeRole::Initiator, bundle.clone());
            let challenge = handshake
                .advance(None)
                .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
            state.handshake = Some(handshake);

            if let Some(frame) = challenge {
                let delay = self.config.challenge_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(TransportEvent::Notification(frame));
                });
            }
        }
        Ok(rx)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(TransportError::WriteFailed("not connected".into()));
        }
        let Some(tx) = state.notify.clone() else {
            return Err(TransportError::WriteFailed("not subscribed".into()));
        };

        // Handshake phase: every write is a handshake frame
        if state.handshake.is_some() {
            match Self::advance_handshake(&mut state, data) {
                Ok(replies) => self.schedule_notifications(tx, replies),
                Err(e) => {
                    // Handshake errors are terminal for the connection
                    warn!("mock: handshake failed: {e}");
                    Self::drop_link(&mut state);
                }
            }
            return Ok(());
        }

        // Decrypt under the session key when encrypted
        let request = match &state.session_key {
            Some(key) => match cipher::decrypt_frame(data, key, None) {
                Ok(plain) => plain,
                Err(e) => {
                    warn!("mock: undecryptable frame: {e}");
                    return Ok(());
                }
            },
            None => data.to_vec(),
        };

        let (timeout, crc, connection, canned) = Self::take_overrides(&mut state.injections);

        if connection {
            debug!("mock: injected connection error");
            Self::drop_link(&mut state);
            return Ok(());
        }

        let mut response = match canned {
            Some(bytes) => Some(bytes),
            None => self.process_request(&mut state, &request),
        };

        if crc {
            if let Some(bytes) = response.as_mut() {
                if let Some(last) = bytes.last_mut() {
                    *last ^= 0xFF;
                }
                debug!("mock: injected CRC corruption");
            }
        }

        if timeout {
            debug!("mock: injected timeout, suppressing response");
            response = None;
        }

        if let Some(plain) = response {
            let wire = match &state.session_key {
                Some(key) => match cipher::encrypt_frame(&plain, key, None) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("mock: failed to encrypt response: {e}");
                        return Ok(());
                    }
                },
                None => plain,
            };
            self.schedule_notifications(tx, vec![wire]);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }
}
