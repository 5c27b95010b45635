// The persistent disk: a fixed 1 MiB image with a boot region, a directory
// of fixed-size file entries and 1 KiB content slots. Every transfer goes
// through a single resident write-back block; errors land in a status
// register the guest reads through the firmware instead of aborting anything.

use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

pub const DISK_SIZE: u32 = 1 << 20;
pub const BLOCK_SIZE: usize = 4096;
pub const DIR_OFFSET: u32 = 1024;
pub const MAX_FILES: usize = 128;
pub const MAX_FILENAME: usize = 64;
pub const FILE_ENTRY_SIZE: usize = MAX_FILENAME + 8;
pub const SLOT_SIZE: u32 = 1024;
const DIR_END: u32 = DIR_OFFSET + (MAX_FILES * FILE_ENTRY_SIZE) as u32;

pub const STATUS_OK: u16 = 0;
pub const STATUS_IO: u16 = 1;
pub const STATUS_DIR_FULL: u16 = 2;
pub const STATUS_NOT_FOUND: u16 = 3;

/// A decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub start_addr: u32,
    pub size: u32,
}

pub struct Disk {
    file: File,
    block: Vec<u8>,
    block_addr: u32,
    resident: bool,
    dirty: bool,
    last_error: u16,
}

impl Disk {
    /// Opens the backing image, creating it zero-filled on first use.
    pub fn open(path: &Path) -> io::Result<Disk> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(_) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)?;
                file.set_len(DISK_SIZE as u64)?;
                debug!(path = %path.display(), "created blank disk image");
                file
            }
        };
        Ok(Disk {
            file,
            block: vec![0; BLOCK_SIZE],
            block_addr: 0,
            resident: false,
            dirty: false,
            last_error: STATUS_OK,
        })
    }

    /// Last error code; cleared by the next successful operation.
    pub fn status(&self) -> u16 {
        self.last_error
    }

    pub fn read(&mut self, addr: u32, out: &mut [u8]) -> u16 {
        if addr as u64 + out.len() as u64 > DISK_SIZE as u64 {
            warn!(addr, len = out.len(), "disk read past end of image");
            self.last_error = STATUS_IO;
            return self.last_error;
        }
        match self.read_blocks(addr, out) {
            Ok(()) => self.last_error = STATUS_OK,
            Err(err) => {
                warn!(%err, addr, "disk read failed");
                self.last_error = STATUS_IO;
            }
        }
        self.last_error
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> u16 {
        if addr as u64 + data.len() as u64 > DISK_SIZE as u64 {
            warn!(addr, len = data.len(), "disk write past end of image");
            self.last_error = STATUS_IO;
            return self.last_error;
        }
        match self.write_blocks(addr, data) {
            Ok(()) => self.last_error = STATUS_OK,
            Err(err) => {
                warn!(%err, addr, "disk write failed");
                self.last_error = STATUS_IO;
            }
        }
        self.last_error
    }

    /// Claims the first empty directory slot for `name` (truncated to 63
    /// bytes) and assigns it the slot's fixed content region.
    pub fn create_file(&mut self, name: &str) -> u16 {
        let result = self.create_inner(name);
        self.settle("create", result)
    }

    pub fn delete_file(&mut self, name: &str) -> u16 {
        let result = self.delete_inner(name);
        self.settle("delete", result)
    }

    /// Directory lookup by name, for hosts that want the content region.
    pub fn file_entry(&mut self, name: &str) -> Option<FileEntry> {
        match self.find_inner(name) {
            Ok(found) => found.map(|(_, entry)| entry),
            Err(_) => None,
        }
    }

    /// Writes back the resident block, if dirty.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.block_addr as u64))?;
        self.file.write_all(&self.block)?;
        self.file.flush()?;
        self.dirty = false;
        Ok(())
    }

    fn settle(&mut self, what: &str, result: io::Result<u16>) -> u16 {
        self.last_error = match result {
            Ok(status) => status,
            Err(err) => {
                warn!(%err, "disk {what} failed");
                STATUS_IO
            }
        };
        self.last_error
    }

    fn create_inner(&mut self, name: &str) -> io::Result<u16> {
        let mut entry = [0u8; FILE_ENTRY_SIZE];
        for slot in 0..MAX_FILES {
            let entry_addr = DIR_OFFSET + (slot * FILE_ENTRY_SIZE) as u32;
            self.read_blocks(entry_addr, &mut entry)?;
            if entry[0] != 0 {
                continue;
            }
            entry.fill(0);
            let count = name.len().min(MAX_FILENAME - 1);
            entry[..count].copy_from_slice(&name.as_bytes()[..count]);
            let start_addr = DIR_END + slot as u32 * SLOT_SIZE;
            LittleEndian::write_u32(&mut entry[MAX_FILENAME..MAX_FILENAME + 4], start_addr);
            LittleEndian::write_u32(&mut entry[MAX_FILENAME + 4..], 0);
            self.write_blocks(entry_addr, &entry)?;
            // Directory mutations are persisted immediately so a crash
            // cannot lose the entry.
            self.flush()?;
            debug!(name, slot, start_addr, "file created");
            return Ok(STATUS_OK);
        }
        Ok(STATUS_DIR_FULL)
    }

    fn delete_inner(&mut self, name: &str) -> io::Result<u16> {
        let Some((slot, _)) = self.find_inner(name)? else {
            return Ok(STATUS_NOT_FOUND);
        };
        let entry_addr = DIR_OFFSET + (slot * FILE_ENTRY_SIZE) as u32;
        let entry = [0u8; FILE_ENTRY_SIZE];
        self.write_blocks(entry_addr, &entry)?;
        self.flush()?;
        debug!(name, slot, "file deleted");
        Ok(STATUS_OK)
    }

    fn find_inner(&mut self, name: &str) -> io::Result<Option<(usize, FileEntry)>> {
        let mut entry = [0u8; FILE_ENTRY_SIZE];
        for slot in 0..MAX_FILES {
            let entry_addr = DIR_OFFSET + (slot * FILE_ENTRY_SIZE) as u32;
            self.read_blocks(entry_addr, &mut entry)?;
            if entry[0] == 0 {
                continue;
            }
            let stored = entry_name(&entry);
            if stored == name {
                return Ok(Some((
                    slot,
                    FileEntry {
                        name: stored.to_string(),
                        start_addr: LittleEndian::read_u32(&entry[MAX_FILENAME..]),
                        size: LittleEndian::read_u32(&entry[MAX_FILENAME + 4..]),
                    },
                )));
            }
        }
        Ok(None)
    }

    // A request may span blocks; each iteration services the part that
    // falls inside one resident block.

    fn read_blocks(&mut self, addr: u32, out: &mut [u8]) -> io::Result<()> {
        let mut done = 0;
        while done < out.len() {
            let at = addr + done as u32;
            let offset = (at % BLOCK_SIZE as u32) as usize;
            let count = (BLOCK_SIZE - offset).min(out.len() - done);
            self.make_resident(at - offset as u32)?;
            out[done..done + count].copy_from_slice(&self.block[offset..offset + count]);
            done += count;
        }
        Ok(())
    }

    fn write_blocks(&mut self, addr: u32, data: &[u8]) -> io::Result<()> {
        let mut done = 0;
        while done < data.len() {
            let at = addr + done as u32;
            let offset = (at % BLOCK_SIZE as u32) as usize;
            let count = (BLOCK_SIZE - offset).min(data.len() - done);
            self.make_resident(at - offset as u32)?;
            self.block[offset..offset + count].copy_from_slice(&data[done..done + count]);
            self.dirty = true;
            done += count;
        }
        Ok(())
    }

    fn make_resident(&mut self, block_addr: u32) -> io::Result<()> {
        if self.resident && self.block_addr == block_addr {
            return Ok(());
        }
        self.flush()?;
        self.file.seek(SeekFrom::Start(block_addr as u64))?;
        self.file.read_exact(&mut self.block)?;
        self.block_addr = block_addr;
        self.resident = true;
        Ok(())
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(%err, "disk flush on teardown failed");
        }
    }
}

fn entry_name(entry: &[u8]) -> &str {
    let end = entry[..MAX_FILENAME].iter().position(|&b| b == 0).unwrap_or(MAX_FILENAME);
    std::str::from_utf8(&entry[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scratch_disk(dir: &tempfile::TempDir) -> Disk {
        Disk::open(&dir.path().join("disk.img")).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let mut disk = scratch_disk(&dir);
        assert_eq!(disk.write(20_000, b"hello"), STATUS_OK);
        let mut back = [0u8; 5];
        assert_eq!(disk.read(20_000, &mut back), STATUS_OK);
        assert_eq!(&back, b"hello");
        assert_eq!(disk.status(), STATUS_OK);
    }

    #[test]
    fn transfers_span_block_boundaries() {
        let dir = tempdir().unwrap();
        let mut disk = scratch_disk(&dir);
        let data: Vec<u8> = (0..=255).cycle().take(3 * BLOCK_SIZE / 2).collect();
        let addr = BLOCK_SIZE as u32 - 100;
        assert_eq!(disk.write(addr, &data), STATUS_OK);
        let mut back = vec![0u8; data.len()];
        assert_eq!(disk.read(addr, &mut back), STATUS_OK);
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_range_access_sets_io_error_and_next_success_clears_it() {
        let dir = tempdir().unwrap();
        let mut disk = scratch_disk(&dir);
        let mut buf = [0u8; 8];
        assert_eq!(disk.read(DISK_SIZE - 4, &mut buf), STATUS_IO);
        assert_eq!(disk.status(), STATUS_IO);
        assert_eq!(disk.read(0, &mut buf), STATUS_OK);
        assert_eq!(disk.status(), STATUS_OK);
    }

    #[test]
    fn created_files_get_fixed_slots_in_insertion_order() {
        let dir = tempdir().unwrap();
        let mut disk = scratch_disk(&dir);
        assert_eq!(disk.create_file("a"), STATUS_OK);
        assert_eq!(disk.create_file("b"), STATUS_OK);
        let a = disk.file_entry("a").unwrap();
        let b = disk.file_entry("b").unwrap();
        assert_eq!(a.start_addr, DIR_END);
        assert_eq!(b.start_addr, DIR_END + SLOT_SIZE);
        assert_eq!(a.size, 0);
    }

    #[test]
    fn long_names_are_truncated_to_sixty_three_bytes() {
        let dir = tempdir().unwrap();
        let mut disk = scratch_disk(&dir);
        let long = "x".repeat(100);
        assert_eq!(disk.create_file(&long), STATUS_OK);
        let entry = disk.file_entry(&long[..MAX_FILENAME - 1]).unwrap();
        assert_eq!(entry.name.len(), MAX_FILENAME - 1);
    }

    #[test]
    fn delete_clears_the_slot_and_missing_names_report_not_found() {
        let dir = tempdir().unwrap();
        let mut disk = scratch_disk(&dir);
        disk.create_file("gone");
        assert_eq!(disk.delete_file("gone"), STATUS_OK);
        assert!(disk.file_entry("gone").is_none());
        assert_eq!(disk.delete_file("gone"), STATUS_NOT_FOUND);
        assert_eq!(disk.status(), STATUS_NOT_FOUND);
    }

    #[test]
    fn directory_full_after_all_slots_are_claimed() {
        let dir = tempdir().unwrap();
        let mut disk = scratch_disk(&dir);
        for index in 0..MAX_FILES {
            assert_eq!(disk.create_file(&format!("f{index}")), STATUS_OK);
        }
        assert_eq!(disk.create_file("overflow"), STATUS_DIR_FULL);
    }

    #[test]
    fn data_survives_reopening_the_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        {
            let mut disk = Disk::open(&path).unwrap();
            assert_eq!(disk.create_file("a"), STATUS_OK);
            let start = disk.file_entry("a").unwrap().start_addr;
            assert_eq!(disk.write(start, &[1, 2, 3, 4]), STATUS_OK);
        }
        let mut disk = Disk::open(&path).unwrap();
        let start = disk.file_entry("a").unwrap().start_addr;
        let mut back = [0u8; 4];
        assert_eq!(disk.read(start, &mut back), STATUS_OK);
        assert_eq!(back, [1, 2, 3, 4]);
        assert_eq!(disk.status(), STATUS_OK);
    }
}
