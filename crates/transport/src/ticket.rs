//! Process-wide ring of TLS session tickets.
//!
//! Single writer, many readers, no locks on the read path. Each slot is a
//! seqlock: the writer stores epoch 0 (busy), writes the payload, then
//! publishes the new epoch with release ordering; readers load the epoch
//! with acquire ordering before and after copying the payload and retry if
//! the two observations differ. Workers forked from one master share the
//! ring through shared memory semantics of the parent mapping; within a
//! process the `global()` instance is the shared ring.
//!
//! Entries larger than [`MAX_TICKET_LEN`] are rejected at ingress. The ring
//! wraps: a `put` overwrites the slot `epoch % capacity`, dropping the
//! oldest entry. The on-disk snapshot uses the in-memory layout per entry:
//! `epoch u64 LE, len u32 LE, data[len]`.

use std::cell::UnsafeCell;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::error::{TransportError, TransportErrorKind, TransportResult};

/// Tickets are opaque blobs of at most 512 bytes.
pub const MAX_TICKET_LEN: usize = 512;

/// Default ring capacity; about 128 KiB of slot payload.
pub const DEFAULT_CAPACITY: usize = 120;

/// How often a reader retries a torn slot before giving up on it.
const READ_RETRIES: usize = 8;

/// A consistent `(epoch, payload)` snapshot read from the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketEntry {
    pub epoch: u64,
    pub data: Vec<u8>,
}

struct Slot {
    /// 0 while empty or mid-write; otherwise the publishing epoch.
    epoch: AtomicU64,
    len: AtomicU32,
    data: UnsafeCell<[u8; MAX_TICKET_LEN]>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            len: AtomicU32::new(0),
            data: UnsafeCell::new([0u8; MAX_TICKET_LEN]),
        }
    }
}

pub struct TicketStore {
    slots: Box<[Slot]>,
    next_epoch: AtomicU64,
    /// Serializes producers; readers never touch it.
    writer: Mutex<()>,
}

// Safety: the payload cell is only written between the epoch-invalidate and
// epoch-publish stores of the single writer, and readers validate the epoch
// around their copy, discarding torn reads.
unsafe impl Sync for TicketStore {}
unsafe impl Send for TicketStore {}

impl TicketStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| Slot::empty()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            next_epoch: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// The process-wide ring.
    pub fn global() -> &'static TicketStore {
        static GLOBAL: OnceLock<TicketStore> = OnceLock::new();
        GLOBAL.get_or_init(TicketStore::with_default_capacity)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Epoch of the most recently published entry, 0 if none yet.
    pub fn latest_epoch(&self) -> u64 {
        self.next_epoch.load(Ordering::Acquire)
    }

    /// Publish a ticket. Returns the epoch it was published under.
    pub fn put(&self, ticket: &[u8]) -> TransportResult<u64> {
        if ticket.len() > MAX_TICKET_LEN {
            return Err(TransportError::new(
                TransportErrorKind::TlsTicketRejected,
                format!("ticket of {} bytes exceeds {MAX_TICKET_LEN}", ticket.len()),
            ));
        }

        let _guard = self.writer.lock().expect("ticket writer lock poisoned");
        let epoch = self.next_epoch.load(Ordering::Relaxed) + 1;
        let slot = &self.slots[(epoch as usize) % self.slots.len()];

        // Invalidate before touching the payload so a concurrent reader can
        // never pair the new epoch with the old bytes.
        slot.epoch.store(0, Ordering::Release);
        unsafe {
            let dst = slot.data.get() as *mut u8;
            std::ptr::copy_nonoverlapping(ticket.as_ptr(), dst, ticket.len());
        }
        slot.len.store(ticket.len() as u32, Ordering::Release);
        slot.epoch.store(epoch, Ordering::Release);
        self.next_epoch.store(epoch, Ordering::Release);
        Ok(epoch)
    }

    fn read_slot(&self, slot: &Slot) -> Option<TicketEntry> {
        for _ in 0..READ_RETRIES {
            let before = slot.epoch.load(Ordering::Acquire);
            if before == 0 {
                return None;
            }
            let len = slot.len.load(Ordering::Acquire) as usize;
            if len > MAX_TICKET_LEN {
                return None;
            }
            let mut data = vec![0u8; len];
            unsafe {
                let src = slot.data.get() as *const u8;
                std::ptr::copy_nonoverlapping(src, data.as_mut_ptr(), len);
            }
            let after = slot.epoch.load(Ordering::Acquire);
            if before == after {
                return Some(TicketEntry {
                    epoch: before,
                    data,
                });
            }
            // Torn: the writer lapped us mid-copy. Retry against the newer
            // entry now occupying the slot.
        }
        None
    }

    /// Read the entry published under `epoch`, if it is still resident.
    pub fn snapshot(&self, epoch: u64) -> Option<TicketEntry> {
        if epoch == 0 {
            return None;
        }
        let slot = &self.slots[(epoch as usize) % self.slots.len()];
        self.read_slot(slot).filter(|entry| entry.epoch == epoch)
    }

    /// The newest published entry, if any.
    pub fn latest(&self) -> Option<TicketEntry> {
        loop {
            let epoch = self.latest_epoch();
            if epoch == 0 {
                return None;
            }
            if let Some(entry) = self.snapshot(epoch) {
                return Some(entry);
            }
            // The newest slot is mid-overwrite; a newer epoch must exist by
            // now, try again with it.
            if self.latest_epoch() == epoch {
                return None;
            }
        }
    }

    /// Write every resident entry, oldest first, in the wire layout.
    pub fn save(&self, path: &Path) -> std::io::Result<usize> {
        let mut entries: Vec<TicketEntry> = self
            .slots
            .iter()
            .filter_map(|slot| self.read_slot(slot))
            .collect();
        entries.sort_by_key(|entry| entry.epoch);

        let mut file = std::fs::File::create(path)?;
        for entry in &entries {
            file.write_all(&entry.epoch.to_le_bytes())?;
            file.write_all(&(entry.data.len() as u32).to_le_bytes())?;
            file.write_all(&entry.data)?;
        }
        Ok(entries.len())
    }

    /// Re-publish entries from a snapshot file, oldest first. Fresh epochs
    /// are assigned; the snapshot's epochs only provide ordering.
    pub fn restore(&self, path: &Path) -> std::io::Result<usize> {
        let mut file = std::fs::File::open(path)?;
        let mut restored = 0usize;
        loop {
            let mut epoch_bytes = [0u8; 8];
            match file.read_exact(&mut epoch_bytes) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err),
            }
            let mut len_bytes = [0u8; 4];
            file.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_TICKET_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("snapshot entry of {len} bytes exceeds {MAX_TICKET_LEN}"),
                ));
            }
            let mut data = vec![0u8; len];
            file.read_exact(&mut data)?;
            // Ingress validation already happened via the length check.
            let _ = self.put(&data);
            restored += 1;
        }
        Ok(restored)
    }
}
