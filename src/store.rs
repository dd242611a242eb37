//! Scan result persistence
//!
//! Results are keyed by `(device_id, register)`. A register once proven
//! readable is never downgraded by a later failed probe; the store keeps the
//! better outcome. Per-register upserts are atomic; nothing is promised
//! across registers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::BleResult;

/// Outcome of probing one register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterScanResult {
    /// Whether the device answered a read covering this register
    pub readable: bool,
    /// When the determination was made
    pub scanned_at: DateTime<Utc>,
    /// The register's big-endian contents, when readable
    pub value: Option<[u8; 2]>,
}

impl RegisterScanResult {
    /// A readable register with its observed contents
    pub fn readable(value: [u8; 2]) -> Self {
        Self {
            readable: true,
            scanned_at: Utc::now(),
            value: Some(value),
        }
    }

    /// An unreadable register
    pub fn unreadable() -> Self {
        Self {
            readable: false,
            scanned_at: Utc::now(),
            value: None,
        }
    }
}

/// Device identity record, written by the device recognizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub protocol_version: u32,
    pub device_type: String,
}

/// Persistence seam for scan results
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Record one register's outcome
    ///
    /// Implementations must not overwrite a stored `readable = true` with a
    /// later `readable = false` for the same key.
    async fn upsert(
        &self,
        device_id: &str,
        register: u16,
        result: RegisterScanResult,
    ) -> BleResult<()>;

    /// Fetch one register's stored outcome
    async fn get(&self, device_id: &str, register: u16) -> BleResult<Option<RegisterScanResult>>;

    /// All registers with a stored outcome for a device, ascending
    async fn scanned_registers(&self, device_id: &str) -> BleResult<Vec<u16>>;
}

/// In-memory [`ResultStore`]
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    entries: DashMap<(String, u16), RegisterScanResult>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all devices
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn upsert(
        &self,
        device_id: &str,
        register: u16,
        result: RegisterScanResult,
    ) -> BleResult<()> {
        let key = (device_id.to_string(), register);
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                // Keep the better outcome
                if !(occupied.get().readable && !result.readable) {
                    occupied.insert(result);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(result);
            }
        }
        Ok(())
    }

    async fn get(&self, device_id: &str, register: u16) -> BleResult<Option<RegisterScanResult>> {
        Ok(self
            .entries
            .get(&(device_id.to_string(), register))
            .map(|entry| entry.value().clone()))
    }

    async fn scanned_registers(&self, device_id: &str) -> BleResult<Vec<u16>> {
        let mut registers: Vec<u16> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == device_id)
            .map(|entry| entry.key().1)
            .collect();
        registers.sort_unstable();
        Ok(registers)
    }
}
