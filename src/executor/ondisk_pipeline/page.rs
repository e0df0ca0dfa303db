// Append only key/value page
//
// Page layout:
// 2 byte: total bytes used (PAGE_HEADER_SIZE + slots + records)
// 2 byte: slot count
// 2 byte: record start offset
// slots grow forward from the header, records grow backward from the end.
//
// Sort buffers keep their records in these pages, and spilled runs are
// written as a sequence of whole pages so a reader can iterate them without
// any further framing.

use crate::mem_pool::{Page, PAGE_SIZE};

pub(crate) mod slot {
    pub const SLOT_SIZE: usize = 6;

    pub struct Slot {
        offset: u16,
        key_size: u16,
        val_size: u16,
    }

    impl Slot {
        pub fn from_bytes(bytes: &[u8; SLOT_SIZE]) -> Self {
            Slot {
                offset: u16::from_be_bytes([bytes[0], bytes[1]]),
                key_size: u16::from_be_bytes([bytes[2], bytes[3]]),
                val_size: u16::from_be_bytes([bytes[4], bytes[5]]),
            }
        }

        pub fn to_bytes(&self) -> [u8; SLOT_SIZE] {
            let mut bytes = [0; SLOT_SIZE];
            bytes[0..2].copy_from_slice(&self.offset.to_be_bytes());
            bytes[2..4].copy_from_slice(&self.key_size.to_be_bytes());
            bytes[4..6].copy_from_slice(&self.val_size.to_be_bytes());
            bytes
        }

        pub fn new(offset: u16, key_size: u16, val_size: u16) -> Self {
            Slot {
                offset,
                key_size,
                val_size,
            }
        }

        pub fn offset(&self) -> u16 {
            self.offset
        }

        pub fn key_size(&self) -> u16 {
            self.key_size
        }

        pub fn val_size(&self) -> u16 {
            self.val_size
        }

        pub fn size(&self) -> u16 {
            self.key_size + self.val_size
        }
    }
}

use slot::*;

pub const PAGE_HEADER_SIZE: usize = 6;

/// Largest key + value that fits in an empty page.
pub const fn max_kv_size() -> usize {
    PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_SIZE
}

/// Bytes a record occupies inside a page, slot included. This is the size
/// used for buffer capacity accounting.
pub const fn record_size(key_len: usize, val_len: usize) -> usize {
    SLOT_SIZE + key_len + val_len
}

pub trait AppendOnlyKVPage {
    fn init(&mut self);

    // Header operations
    fn total_bytes_used(&self) -> u16;
    fn total_free_space(&self) -> u16 {
        PAGE_SIZE as u16 - self.total_bytes_used()
    }
    fn set_total_bytes_used(&mut self, total_bytes_used: u16);
    fn slot_count(&self) -> u16;
    fn set_slot_count(&mut self, slot_count: u16);
    fn increment_slot_count(&mut self) {
        let slot_count = self.slot_count();
        self.set_slot_count(slot_count + 1);
    }
    fn rec_start_offset(&self) -> u16;
    fn set_rec_start_offset(&mut self, rec_start_offset: u16);

    // Helpers
    fn slot_offset(&self, slot_id: u16) -> usize {
        PAGE_HEADER_SIZE + slot_id as usize * SLOT_SIZE
    }
    fn slot(&self, slot_id: u16) -> Option<Slot>;

    // Only call this when there is room for the slot and its record.
    fn append_slot(&mut self, slot: &Slot);

    /// Appends a key/value pair. Returns false and leaves the page untouched
    /// if the pair does not fit.
    fn append(&mut self, key: &[u8], val: &[u8]) -> bool;

    /// Panics on an invalid slot id.
    fn get_key(&self, slot_id: u16) -> &[u8];

    /// Panics on an invalid slot id.
    fn get_val(&self, slot_id: u16) -> &[u8];
}

impl AppendOnlyKVPage for Page {
    fn init(&mut self) {
        self.set_total_bytes_used(PAGE_HEADER_SIZE as u16);
        self.set_slot_count(0);
        self.set_rec_start_offset(PAGE_SIZE as u16);
    }

    fn total_bytes_used(&self) -> u16 {
        u16::from_be_bytes([self[0], self[1]])
    }

    fn set_total_bytes_used(&mut self, total_bytes_used: u16) {
        self[0..2].copy_from_slice(&total_bytes_used.to_be_bytes());
    }

    fn slot_count(&self) -> u16 {
        u16::from_be_bytes([self[2], self[3]])
    }

    fn set_slot_count(&mut self, slot_count: u16) {
        self[2..4].copy_from_slice(&slot_count.to_be_bytes());
    }

    fn rec_start_offset(&self) -> u16 {
        u16::from_be_bytes([self[4], self[5]])
    }

    fn set_rec_start_offset(&mut self, rec_start_offset: u16) {
        self[4..6].copy_from_slice(&rec_start_offset.to_be_bytes());
    }

    fn slot(&self, slot_id: u16) -> Option<Slot> {
        if slot_id < self.slot_count() {
            let offset = self.slot_offset(slot_id);
            let mut bytes = [0u8; SLOT_SIZE];
            bytes.copy_from_slice(&self[offset..offset + SLOT_SIZE]);
            Some(Slot::from_bytes(&bytes))
        } else {
            None
        }
    }

    fn append_slot(&mut self, slot: &Slot) {
        let slot_id = self.slot_count();
        self.increment_slot_count();

        let slot_offset = self.slot_offset(slot_id);
        self[slot_offset..slot_offset + SLOT_SIZE].copy_from_slice(&slot.to_bytes());

        let offset = self.rec_start_offset().min(slot.offset());
        self.set_rec_start_offset(offset);
    }

    fn append(&mut self, key: &[u8], value: &[u8]) -> bool {
        let needed = record_size(key.len(), value.len());
        if (self.total_free_space() as usize) < needed {
            return false;
        }
        let start = self.rec_start_offset() as usize - key.len() - value.len();
        self[start..start + key.len()].copy_from_slice(key);
        self[start + key.len()..start + key.len() + value.len()].copy_from_slice(value);
        let slot = Slot::new(start as u16, key.len() as u16, value.len() as u16);
        self.append_slot(&slot);

        self.set_total_bytes_used(self.total_bytes_used() + needed as u16);
        true
    }

    fn get_key(&self, slot_id: u16) -> &[u8] {
        let slot = match self.slot(slot_id) {
            Some(slot) => slot,
            None => panic!("slot {} out of range", slot_id),
        };
        let offset = slot.offset() as usize;
        &self[offset..offset + slot.key_size() as usize]
    }

    fn get_val(&self, slot_id: u16) -> &[u8] {
        let slot = match self.slot(slot_id) {
            Some(slot) => slot,
            None => panic!("slot {} out of range", slot_id),
        };
        let offset = slot.offset() as usize + slot.key_size() as usize;
        &self[offset..offset + slot.val_size() as usize]
    }
}
