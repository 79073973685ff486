//! RAM-backed volumes
//!
//! Stand in for the mass-storage filesystem on targets without one.
//! [`FlashBackedVolume`] additionally keeps one file in a flash block so it
//! survives power loss.

use crate::BoardError;
use crate::flash_block::FlashBlock;
use crate::hal::{FileSystem, MountStatus};
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use embedded_storage::nor_flash::NorFlash;
use log::{debug, info, warn};

#[derive(Debug, Default)]
pub struct RamVolume {
    files: BTreeMap<String, Vec<u8>>,
    label: String,
    mounted: bool,
    formatted: bool,
}

impl RamVolume {
    /// A volume that already carries a filesystem
    pub fn new() -> Self {
        Self {
            formatted: true,
            ..Self::default()
        }
    }

    /// A blank medium that reports "no filesystem" until formatted
    pub fn blank() -> Self {
        Self::default()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    fn check_mounted(&self) -> Result<(), BoardError> {
        if self.mounted {
            Ok(())
        } else {
            Err(BoardError::StorageError)
        }
    }
}

impl FileSystem for RamVolume {
    fn poll_mount(&mut self) -> MountStatus {
        if !self.formatted {
            return MountStatus::NoFilesystem;
        }
        self.mounted = true;
        MountStatus::Mounted
    }

    fn format(&mut self) -> Result<(), BoardError> {
        self.files.clear();
        self.label.clear();
        self.formatted = true;
        self.mounted = true;
        debug!("[VOL] formatted");
        Ok(())
    }

    fn set_label(&mut self, label: &str) -> Result<(), BoardError> {
        self.check_mounted()?;
        self.label = label.to_string();
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.mounted && self.files.contains_key(path)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), BoardError> {
        self.check_mounted()?;
        self.files.insert(path.to_string(), data.to_vec());
        debug!("[VOL] wrote {} ({} bytes)", path, data.len());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, BoardError> {
        self.check_mounted()?;
        self.files.get(path).cloned().ok_or(BoardError::StorageError)
    }

    fn remove(&mut self, path: &str) -> Result<(), BoardError> {
        self.check_mounted()?;
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or(BoardError::StorageError)
    }

    fn unmount(&mut self) -> Result<(), BoardError> {
        self.check_mounted()?;
        self.mounted = false;
        Ok(())
    }
}

/// RAM volume whose file at `path` is mirrored into a flash block
pub struct FlashBackedVolume<F> {
    inner: RamVolume,
    block: FlashBlock<F>,
    path: &'static str,
}

impl<F> FlashBackedVolume<F>
where
    F: NorFlash,
{
    /// Restores the mirrored file, if the block holds one
    pub fn new(mut block: FlashBlock<F>, path: &'static str) -> Self {
        let mut inner = RamVolume::new();
        match block.load() {
            Ok(Some(saved)) => {
                inner.poll_mount();
                match inner.write(path, &saved) {
                    Ok(()) => info!("[VOL] Restored {} from flash", path),
                    Err(e) => warn!("[VOL] Restore of {} failed: {:?}", path, e),
                }
            }
            Ok(None) => {}
            Err(e) => warn!("[VOL] Flash copy of {} unreadable: {:?}", path, e),
        }
        Self { inner, block, path }
    }
}

impl<F> FileSystem for FlashBackedVolume<F>
where
    F: NorFlash,
{
    fn poll_mount(&mut self) -> MountStatus {
        self.inner.poll_mount()
    }

    fn format(&mut self) -> Result<(), BoardError> {
        self.block.clear()?;
        self.inner.format()
    }

    fn set_label(&mut self, label: &str) -> Result<(), BoardError> {
        self.inner.set_label(label)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), BoardError> {
        if path == self.path {
            self.inner.check_mounted()?;
            let unchanged = self.inner.files.get(path).is_some_and(|old| old == data);
            if !unchanged {
                self.block.save(data)?;
            }
        }
        self.inner.write(path, data)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, BoardError> {
        self.inner.read(path)
    }

    fn remove(&mut self, path: &str) -> Result<(), BoardError> {
        self.inner.remove(path)?;
        if path == self.path {
            self.block.clear()?;
        }
        Ok(())
    }

    fn unmount(&mut self) -> Result<(), BoardError> {
        self.inner.unmount()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFlash;

    fn flash_volume(flash: &MockFlash) -> FlashBackedVolume<MockFlash> {
        FlashBackedVolume::new(FlashBlock::new(flash.clone(), 0).unwrap(), "WIFI.CFG")
    }

    #[test]
    fn blank_volume_needs_format() {
        let mut volume = RamVolume::blank();
        assert_eq!(volume.poll_mount(), MountStatus::NoFilesystem);
        volume.format().unwrap();
        assert_eq!(volume.poll_mount(), MountStatus::Mounted);
    }

    #[test]
    fn files_survive_remount() {
        let mut volume = RamVolume::new();
        volume.poll_mount();
        volume.write("WIFI.CFG", b"apply,a,1").unwrap();
        volume.unmount().unwrap();
        assert!(!volume.exists("WIFI.CFG"));
        assert_eq!(volume.read("WIFI.CFG"), Err(BoardError::StorageError));

        volume.poll_mount();
        assert_eq!(volume.read("WIFI.CFG").unwrap(), b"apply,a,1");
    }

    #[test]
    fn format_wipes_files_and_label() {
        let mut volume = RamVolume::new();
        volume.poll_mount();
        volume.set_label("CURIOSITY").unwrap();
        volume.write("cloud.json", b"{}").unwrap();
        volume.format().unwrap();
        assert_eq!(volume.file_names().count(), 0);
        assert_eq!(volume.label(), "");
    }

    #[test]
    fn removing_missing_file_fails() {
        let mut volume = RamVolume::new();
        volume.poll_mount();
        assert_eq!(volume.remove("FILE.txt"), Err(BoardError::StorageError));
    }

    #[test]
    fn mirrored_file_survives_power_loss() {
        let flash = MockFlash::new();
        {
            let mut volume = flash_volume(&flash);
            volume.poll_mount();
            volume.write("WIFI.CFG", b"apply,Lab,2,pw").unwrap();
            volume.write("cloud.json", b"{}").unwrap();
        }

        let mut volume = flash_volume(&flash);
        volume.poll_mount();
        assert_eq!(volume.read("WIFI.CFG").unwrap(), b"apply,Lab,2,pw");
        assert!(!volume.exists("cloud.json"));
    }

    #[test]
    fn identical_rewrite_leaves_flash_alone() {
        let flash = MockFlash::new();
        let mut volume = flash_volume(&flash);
        volume.poll_mount();
        volume.write("WIFI.CFG", b"apply,Lab,2,pw").unwrap();
        volume.write("WIFI.CFG", b"apply,Lab,2,pw").unwrap();
        assert_eq!(flash.state().erases, 1);
        volume.write("cloud.json", b"{}").unwrap();
        assert_eq!(flash.state().erases, 1);
    }

    #[test]
    fn remove_and_format_clear_the_flash_copy() {
        let flash = MockFlash::new();
        let mut volume = flash_volume(&flash);
        volume.poll_mount();
        volume.write("WIFI.CFG", b"apply,Lab,2,pw").unwrap();
        volume.remove("WIFI.CFG").unwrap();
        let mut reopened = flash_volume(&flash);
        reopened.poll_mount();
        assert!(!reopened.exists("WIFI.CFG"));

        volume.write("WIFI.CFG", b"apply,Lab,2,pw").unwrap();
        volume.format().unwrap();
        reopened = flash_volume(&flash);
        reopened.poll_mount();
        assert!(!reopened.exists("WIFI.CFG"));
    }

    #[test]
    fn failed_flash_write_leaves_file_untouched() {
        let flash = MockFlash::new();
        let mut volume = flash_volume(&flash);
        volume.poll_mount();
        flash.state().write_fails = true;
        assert_eq!(
            volume.write("WIFI.CFG", b"apply,Lab,2,pw"),
            Err(BoardError::StorageError)
        );
        assert!(!volume.exists("WIFI.CFG"));
    }

    #[test]
    fn unmounted_volume_does_not_touch_flash() {
        let flash = MockFlash::new();
        let mut volume = flash_volume(&flash);
        assert_eq!(
            volume.write("WIFI.CFG", b"x"),
            Err(BoardError::StorageError)
        );
        assert_eq!(flash.state().erases, 0);
    }
}
