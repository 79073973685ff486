//! One erase block of NOR flash holding a single checksummed record
//!
//! Layout, little endian: magic (4), payload length (2), two pad bytes,
//! payload, CRC32 over everything before it. The rest of the record is
//! padded with the erased value 0xFF.

use crate::BoardError;
use alloc::vec::Vec;
use crc32fast::Hasher;
use embedded_storage::nor_flash::NorFlash;
use log::{error, info, warn};

const MAGIC: u32 = 0x4346_4757; // 'WGFC'
const HEADER_SIZE: usize = 4 + 2 + 2;
const CRC_SIZE: usize = 4;
pub const MAX_PAYLOAD_SIZE: usize = 256;
/// Whole record, rounded up so any read/write granule up to 16 bytes divides it
const RECORD_SIZE: usize = (HEADER_SIZE + MAX_PAYLOAD_SIZE + CRC_SIZE).next_multiple_of(16);

pub struct FlashBlock<F> {
    flash: F,
    offset: u32,
}

impl<F> FlashBlock<F>
where
    F: NorFlash,
{
    /// `offset` must start an erase block inside the device
    pub fn new(flash: F, offset: u32) -> Result<Self, BoardError> {
        let aligned = offset as usize % F::ERASE_SIZE == 0
            && RECORD_SIZE % F::WRITE_SIZE == 0
            && RECORD_SIZE % F::READ_SIZE == 0
            && RECORD_SIZE <= F::ERASE_SIZE;
        let fits = (offset as usize)
            .checked_add(F::ERASE_SIZE)
            .is_some_and(|end| end <= flash.capacity());
        if !aligned || !fits {
            error!("[FLASH] Unusable block at 0x{:X}", offset);
            return Err(BoardError::ConfigError);
        }
        Ok(Self { flash, offset })
    }

    /// Stored payload, `None` for an erased or foreign block
    pub fn load(&mut self) -> Result<Option<Vec<u8>>, BoardError> {
        let mut record = [0u8; RECORD_SIZE];
        self.flash.read(self.offset, &mut record).map_err(|e| {
            error!("[FLASH] Read at 0x{:X} failed: {:?}", self.offset, e);
            BoardError::StorageError
        })?;

        let magic = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        if magic != MAGIC {
            info!("[FLASH] No record at 0x{:X}", self.offset);
            return Ok(None);
        }

        let len = usize::from(u16::from_le_bytes([record[4], record[5]]));
        if len > MAX_PAYLOAD_SIZE {
            warn!("[FLASH] Bad record length {}", len);
            return Err(BoardError::StorageError);
        }

        let crc_at = HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            record[crc_at],
            record[crc_at + 1],
            record[crc_at + 2],
            record[crc_at + 3],
        ]);
        if stored != checksum(&record[..crc_at]) {
            warn!("[FLASH] CRC mismatch at 0x{:X}", self.offset);
            return Err(BoardError::StorageError);
        }

        Ok(Some(record[HEADER_SIZE..crc_at].to_vec()))
    }

    pub fn save(&mut self, payload: &[u8]) -> Result<(), BoardError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            error!("[FLASH] Payload of {} bytes does not fit", payload.len());
            return Err(BoardError::StorageError);
        }

        let mut record = [0xFFu8; RECORD_SIZE];
        record[..4].copy_from_slice(&MAGIC.to_le_bytes());
        record[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        record[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
        let crc_at = HEADER_SIZE + payload.len();
        let crc = checksum(&record[..crc_at]);
        record[crc_at..crc_at + CRC_SIZE].copy_from_slice(&crc.to_le_bytes());

        self.erase()?;
        self.flash.write(self.offset, &record).map_err(|e| {
            error!("[FLASH] Write at 0x{:X} failed: {:?}", self.offset, e);
            BoardError::StorageError
        })?;
        info!("[FLASH] Saved {} bytes at 0x{:X}", payload.len(), self.offset);
        Ok(())
    }

    pub fn clear(&mut self) -> Result<(), BoardError> {
        self.erase()?;
        info!("[FLASH] Cleared 0x{:X}", self.offset);
        Ok(())
    }

    fn erase(&mut self) -> Result<(), BoardError> {
        let end = self.offset + F::ERASE_SIZE as u32;
        self.flash.erase(self.offset, end).map_err(|e| {
            error!("[FLASH] Erase at 0x{:X} failed: {:?}", self.offset, e);
            BoardError::StorageError
        })
    }
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
