//! Adaptive register scanner
//!
//! Discovers which holding registers a device answers to. Ranges are probed
//! in chunks of up to seven registers; a failed chunk is bisected until the
//! failure is localized to single registers. Healthy contiguous regions cost
//! one read per seven registers, while each unreadable boundary costs a
//! logarithmic number of extra probes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::StationClient;
use crate::constants::MAX_REGISTERS_PER_READ;
use crate::error::{BleError, BleResult};
use crate::store::{RegisterScanResult, ResultStore};

/// Half-open range of register addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRange {
    pub start: u16,
    pub end: u16,
}

impl ScanRange {
    /// Create a range; `end` must not precede `start` (empty is permitted)
    pub fn new(start: u16, end: u16) -> BleResult<Self> {
        if end < start {
            return Err(BleError::invalid_argument(format!(
                "range end {end} precedes start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Scan progress snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Registers fully resolved so far
    pub scanned: usize,
    /// Sum of the original range sizes
    pub total: usize,
}

/// The register-map discoverer for one device
pub struct RegisterScanner {
    client: Arc<StationClient>,
    store: Arc<dyn ResultStore>,
    stack: Vec<ScanRange>,
    scanned: usize,
    total: usize,
    progress_tx: watch::Sender<ScanProgress>,
}

impl RegisterScanner {
    /// Plan a scan over `ranges`
    pub fn new(
        client: Arc<StationClient>,
        ranges: &[ScanRange],
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let total = ranges.iter().map(ScanRange::len).sum();
        let stack = plan_chunks(ranges);
        let (progress_tx, _) = watch::channel(ScanProgress { scanned: 0, total });
        Self {
            client,
            store,
            stack,
            scanned: 0,
            total,
            progress_tx,
        }
    }

    /// Subscribe to progress events
    pub fn progress(&self) -> watch::Receiver<ScanProgress> {
        self.progress_tx.subscribe()
    }

    /// Whether every chunk has been resolved
    pub fn is_finished(&self) -> bool {
        self.stack.is_empty()
    }

    /// Run the scan to completion or cancellation
    pub async fn run(&mut self, abort: Option<&CancellationToken>) -> BleResult<()> {
        info!(
            "scanning {} registers on {}",
            self.total,
            self.client.device_name()
        );
        while self.step(abort).await? {}
        info!("scan complete: {}/{} registers", self.scanned, self.total);
        Ok(())
    }

    /// Resolve one chunk; returns whether work remains
    ///
    /// Cancellation is checked before the chunk is read, so a cancelled scan
    /// never loses already-persisted results.
    pub async fn step(&mut self, abort: Option<&CancellationToken>) -> BleResult<bool> {
        if abort.map(CancellationToken::is_cancelled).unwrap_or(false) {
            self.emit_progress();
            debug!("scan cancelled at {}/{}", self.scanned, self.total);
            return Err(BleError::Cancelled);
        }

        let chunk = loop {
            match self.stack.pop() {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => break chunk,
                None => return Ok(false),
            }
        };

        let count = chunk.len() as u16;
        match self
            .client
            .read_registers(chunk.start, count, None)
            .await
        {
            Ok(data) => {
                for offset in 0..count {
                    let at = 2 * offset as usize;
                    let value = [data[at], data[at + 1]];
                    self.store
                        .upsert(
                            self.client.id(),
                            chunk.start + offset,
                            RegisterScanResult::readable(value),
                        )
                        .await?;
                }
                self.scanned += count as usize;
                self.emit_progress();
            }
            Err(error) if count == 1 => {
                // A lone register that will not read is recorded as such;
                // transient faults are indistinguishable here and a rescan
                // of pending ranges can upgrade the entry later.
                debug!("register {} unreadable: {error}", chunk.start);
                self.store
                    .upsert(
                        self.client.id(),
                        chunk.start,
                        RegisterScanResult::unreadable(),
                    )
                    .await?;
                self.scanned += 1;
                self.emit_progress();
            }
            Err(error) => {
                debug!(
                    "chunk {}..{} failed ({error}), bisecting",
                    chunk.start, chunk.end
                );
                let mid = chunk.start + count / 2;
                // The lower half is processed next
                self.stack.push(ScanRange {
                    start: mid,
                    end: chunk.end,
                });
                self.stack.push(ScanRange {
                    start: chunk.start,
                    end: mid,
                });
            }
        }

        Ok(!self.stack.is_empty())
    }

    fn emit_progress(&self) {
        let _ = self.progress_tx.send(ScanProgress {
            scanned: self.scanned,
            total: self.total,
        });
    }
}

/// Split ranges into protocol-sized chunks, stacked so that popping yields
/// them in address order
fn plan_chunks(ranges: &[ScanRange]) -> Vec<ScanRange> {
    let mut stack = Vec::new();
    for range in ranges.iter().rev() {
        let mut chunks = Vec::new();
        let mut start = range.start;
        while start < range.end {
            let end = range.end.min(start + MAX_REGISTERS_PER_READ);
            chunks.push(ScanRange { start, end });
            start = end;
        }
        for chunk in chunks.into_iter().rev() {
            stack.push(chunk);
        }
    }
    stack
}

/// Default scan span for a protocol generation
pub fn default_range(protocol_version: u32) -> ScanRange {
    if protocol_version < 2000 {
        ScanRange {
            start: 0,
            end: 8000,
        }
    } else {
        ScanRange {
            start: 0,
            end: 20000,
        }
    }
}

/// Minimal contiguous ranges within `[start, end)` not covered by
/// `scanned_sorted` (ascending, duplicates allowed)
pub fn calculate_pending_ranges(start: u16, end: u16, scanned_sorted: &[u16]) -> Vec<ScanRange> {
    let mut pending = Vec::new();
    let mut cursor = start;

    for &address in scanned_sorted {
        if address < cursor || address >= end {
            continue;
        }
        if address > cursor {
            pending.push(ScanRange {
                start: cursor,
                end: address,
            });
        }
        cursor = address + 1;
    }

    if cursor < end {
        pending.push(ScanRange { start: cursor, end });
    }
    pending
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn range(start: u16, end: u16) -> ScanRange {
        ScanRange { start, end }
    }

    #[test]
    fn test_range_invariant() {
        assert!(ScanRange::new(5, 4).is_err());
        assert!(ScanRange::new(5, 5).unwrap().is_empty());
        assert_eq!(ScanRange::new(0, 10).unwrap().len(), 10);
    }

    #[test]
    fn test_plan_chunks_pops_in_address_order() {
        let mut stack = plan_chunks(&[range(0, 16), range(100, 103)]);
        let mut popped = Vec::new();
        while let Some(chunk) = stack.pop() {
            popped.push(chunk);
        }
        assert_eq!(
            popped,
            vec![range(0, 7), range(7, 14), range(14, 16), range(100, 103)]
        );
    }

    #[test]
    fn test_plan_chunks_skips_empty_ranges() {
        let stack = plan_chunks(&[range(10, 10)]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_default_range_by_protocol_version() {
        assert_eq!(default_range(1932), range(0, 8000));
        assert_eq!(default_range(1999), range(0, 8000));
        assert_eq!(default_range(2000), range(0, 20000));
        assert_eq!(default_range(2113), range(0, 20000));
    }

    #[test]
    fn test_pending_ranges_nothing_scanned() {
        assert_eq!(calculate_pending_ranges(0, 10, &[]), vec![range(0, 10)]);
    }

    #[test]
    fn test_pending_ranges_fully_scanned() {
        assert_eq!(calculate_pending_ranges(0, 5, &[0, 1, 2, 3, 4]), vec![]);
    }

    #[test]
    fn test_pending_ranges_with_gaps() {
        assert_eq!(
            calculate_pending_ranges(0, 10, &[2, 5, 6, 7]),
            vec![range(0, 2), range(3, 5), range(8, 10)]
        );
    }

    #[test]
    fn test_pending_ranges_resume_tail() {
        assert_eq!(
            calculate_pending_ranges(0, 10, &[0, 1, 2, 3, 4]),
            vec![range(5, 10)]
        );
    }

    #[test]
    fn test_pending_ranges_ignores_out_of_window_addresses() {
        assert_eq!(
            calculate_pending_ranges(5, 10, &[0, 1, 7, 20]),
            vec![range(5, 7), range(8, 10)]
        );
    }
}
