//! Mount/unmount lifecycle, the memory-mapped FAT array, free-block search,
//! chain free, and root-directory scan/extend (spec §4.3).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;

use crate::error::KernelErrorKind;
use crate::fat::layout::{
    decode_config, encode_config, DirEntry, NameStatus, DIR_ENTRY_SIZE, FAT_EOC, FAT_FREE,
    MAX_FAT_BLOCKS, MIN_FAT_BLOCKS, ROOT_FIRST_BLOCK,
};

/// Creates a fresh backing file (spec §4.3 `mkfs`).
pub fn mkfs(path: &Path, fat_blocks: u16, block_size_index: u8) -> Result<(), KernelErrorKind> {
    if !(MIN_FAT_BLOCKS..=MAX_FAT_BLOCKS).contains(&fat_blocks) {
        return Err(KernelErrorKind::InvalidArgument);
    }
    let block_size = *crate::fat::layout::BLOCK_SIZES
        .get(block_size_index as usize)
        .ok_or(KernelErrorKind::InvalidArgument)?;

    let fat_size_bytes = fat_blocks as u64 * block_size as u64;
    let mut num_entries = fat_size_bytes / 2;
    if num_entries == 65536 {
        num_entries = 65535;
    }
    let data_blocks = num_entries.saturating_sub(1);
    let total_size = fat_size_bytes + data_blocks * block_size as u64;

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|_| KernelErrorKind::Io)?;

    file.set_len(total_size).map_err(|_| KernelErrorKind::Io)?;

    // Entry 0: config word.
    let mut entry0 = [0u8; 2];
    LittleEndian::write_u16(&mut entry0, encode_config(fat_blocks, block_size_index));
    file.write_at(&entry0, 0).map_err(|_| KernelErrorKind::Io)?;

    // Entry 1 (block 1, the root directory's first block): end-of-chain.
    let mut entry1 = [0u8; 2];
    LittleEndian::write_u16(&mut entry1, FAT_EOC);
    file.write_at(&entry1, 2).map_err(|_| KernelErrorKind::Io)?;

    // Entries 2.. are already zero (free) from set_len's zero-fill; the
    // data region is likewise zero-filled by set_len.
    file.flush().map_err(|_| KernelErrorKind::Io)?;
    Ok(())
}

/// An open, mounted FAT filesystem. Owns the backing file and the
/// memory-mapped FAT region.
pub struct FatFilesystem {
    file: File,
    fat_map: MmapMut,
    pub fat_blocks: u16,
    pub block_size: u32,
    pub num_entries: u32,
    pub fat_size_bytes: u64,
    path: PathBuf,
}

impl FatFilesystem {
    /// `mount(path)` (spec §4.3): open, read entry 0, validate, mmap the
    /// FAT region read/write, compute derived metadata.
    pub fn mount(path: &Path) -> Result<FatFilesystem, KernelErrorKind> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| KernelErrorKind::Io)?;

        let mut entry0 = [0u8; 2];
        file.seek(SeekFrom::Start(0)).map_err(|_| KernelErrorKind::Io)?;
        file.read_exact(&mut entry0).map_err(|_| KernelErrorKind::Io)?;
        let (fat_blocks, block_size_index) = decode_config(LittleEndian::read_u16(&entry0));
        if !(MIN_FAT_BLOCKS..=MAX_FAT_BLOCKS).contains(&fat_blocks) {
            return Err(KernelErrorKind::Io);
        }
        let block_size = *crate::fat::layout::BLOCK_SIZES
            .get(block_size_index as usize)
            .ok_or(KernelErrorKind::Io)?;

        let fat_size_bytes = fat_blocks as u64 * block_size as u64;
        let mut num_entries = (fat_size_bytes / 2) as u32;
        if num_entries == 65536 {
            num_entries = 65535;
        }

        let fat_map = unsafe {
            MmapMut::map_mut(&file).map_err(|_| KernelErrorKind::Io)?
        };

        Ok(FatFilesystem {
            file,
            fat_map,
            fat_blocks,
            block_size,
            num_entries,
            fat_size_bytes,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fat_get(&self, index: u32) -> u16 {
        let offset = (index as usize) * 2;
        LittleEndian::read_u16(&self.fat_map[offset..offset + 2])
    }

    fn fat_set(&mut self, index: u32, value: u16) {
        let offset = (index as usize) * 2;
        LittleEndian::write_u16(&mut self.fat_map[offset..offset + 2], value);
    }

    pub fn flush(&self) -> Result<(), KernelErrorKind> {
        self.fat_map.flush().map_err(|_| KernelErrorKind::Io)
    }

    /// Byte offset of block `i` (i >= 1) in the backing file.
    pub fn block_offset(&self, index: u16) -> u64 {
        self.fat_size_bytes + (index as u64 - 1) * self.block_size as u64
    }

    pub fn read_block(&self, index: u16, buf: &mut [u8]) -> Result<usize, KernelErrorKind> {
        let offset = self.block_offset(index);
        self.file.read_at(buf, offset).map_err(|_| KernelErrorKind::Io)
    }

    pub fn write_block(&self, index: u16, buf: &[u8]) -> Result<usize, KernelErrorKind> {
        let offset = self.block_offset(index);
        self.file.write_at(buf, offset).map_err(|_| KernelErrorKind::Io)
    }

    pub fn zero_block(&self, index: u16) -> Result<(), KernelErrorKind> {
        let zeros = vec![0u8; self.block_size as usize];
        self.write_block(index, &zeros)?;
        Ok(())
    }

    /// `find_free_block`: linear scan for the first 0x0000 entry at index
    /// >= 1. Returns 0 if none (spec §4.3).
    pub fn find_free_block(&self) -> u16 {
        for i in 1..self.num_entries {
            if self.fat_get(i) == FAT_FREE {
                return i as u16;
            }
        }
        0
    }

    pub fn allocate_block(&mut self) -> Option<u16> {
        let block = self.find_free_block();
        if block == 0 {
            return None;
        }
        self.fat_set(block as u32, FAT_EOC);
        Some(block)
    }

    pub fn chain_next(&self, index: u16) -> u16 {
        self.fat_get(index as u32)
    }

    pub fn chain_set_next(&mut self, index: u16, next: u16) {
        self.fat_set(index as u32, next);
    }

    /// `free_chain(first)`: walk next-pointers, writing 0x0000 into each,
    /// until 0xFFFF.
    pub fn free_chain(&mut self, first: u16) {
        let mut current = first;
        while current != 0 && current != FAT_EOC {
            let next = self.fat_get(current as u32);
            self.fat_set(current as u32, FAT_FREE);
            current = next;
        }
    }

    /// Length, in blocks, of the chain starting at `first` (0 if `first`
    /// is 0). Used by invariant checks (spec §8: size <= chain_len * block_size).
    pub fn chain_length(&self, first: u16) -> u32 {
        let mut len = 0u32;
        let mut current = first;
        while current != 0 && current != FAT_EOC {
            len += 1;
            current = self.fat_get(current as u32);
        }
        if current == FAT_EOC && first != 0 {
            len += 1;
        }
        len
    }

    fn read_dir_entry(&self, offset: u64) -> Result<DirEntry, KernelErrorKind> {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        self.file.read_at(&mut buf, offset).map_err(|_| KernelErrorKind::Io)?;
        Ok(DirEntry::from_bytes(&buf))
    }

    pub fn write_dir_entry(&self, offset: u64, entry: &DirEntry) -> Result<(), KernelErrorKind> {
        let bytes = entry.to_bytes();
        self.file.write_at(&bytes, offset).map_err(|_| KernelErrorKind::Io)?;
        Ok(())
    }

    /// Walks the root directory's block chain, slot by slot, classifying
    /// the first name byte per spec §4.3. Returns the offset of the
    /// terminating end-of-directory slot, if the scan reaches one without
    /// being stopped early (`None` means every already-allocated slot in
    /// the chain holds a live entry).
    fn for_each_dir_slot<F>(&self, mut visit: F) -> Result<Option<u64>, KernelErrorKind>
    where
        F: FnMut(u64, &DirEntry) -> DirScanControl,
    {
        let mut block = ROOT_FIRST_BLOCK;
        let entries_per_block = self.block_size as usize / DIR_ENTRY_SIZE;
        loop {
            for slot in 0..entries_per_block {
                let offset = self.block_offset(block) + (slot * DIR_ENTRY_SIZE) as u64;
                let entry = self.read_dir_entry(offset)?;
                if entry.status() == NameStatus::EndOfDirectory {
                    return Ok(Some(offset));
                }
                match visit(offset, &entry) {
                    DirScanControl::Continue => {}
                    DirScanControl::Stop => return Ok(None),
                }
            }
            let next = self.chain_next(block);
            if next == FAT_EOC || next == 0 {
                return Ok(None);
            }
            block = next;
        }
    }

    /// `find_file(name) -> (found, offset)` (spec §4.3). When not found,
    /// `offset` names where a new entry should land: a reused `Deleted`
    /// slot, else the chain's end-of-directory slot, else -1 when the
    /// allocated chain is completely full and the caller must
    /// [`FatFilesystem::extend_root`].
    pub fn find_file(&self, name: &str) -> Result<(bool, i64), KernelErrorKind> {
        let mut found_offset: Option<u64> = None;
        let mut reusable_offset: Option<u64> = None;
        let end_of_directory = self.for_each_dir_slot(|offset, entry| {
            if entry.matches_name(name) {
                found_offset = Some(offset);
                DirScanControl::Stop
            } else {
                if reusable_offset.is_none() && matches!(entry.status(), NameStatus::Deleted) {
                    reusable_offset = Some(offset);
                }
                DirScanControl::Continue
            }
        })?;

        if let Some(offset) = found_offset {
            return Ok((true, offset as i64));
        }
        let landing = reusable_offset.or(end_of_directory);
        Ok((false, landing.map(|o| o as i64).unwrap_or(-1)))
    }

    pub fn read_entry_at(&self, offset: u64) -> Result<DirEntry, KernelErrorKind> {
        self.read_dir_entry(offset)
    }

    /// Every `Active` entry in the root directory, in on-disk order (spec
    /// §4.3/§6 `ls`). Tombstoned and Deleted slots are skipped.
    pub fn list_active_entries(&self) -> Result<Vec<DirEntry>, KernelErrorKind> {
        let mut entries = Vec::new();
        self.for_each_dir_slot(|_offset, entry| {
            if entry.status() == NameStatus::Active {
                entries.push(entry.clone());
            }
            DirScanControl::Continue
        })?;
        Ok(entries)
    }

    /// `extend_root`: append a newly-allocated free block to the root
    /// chain, zero it, and return the byte offset of its first slot.
    pub fn extend_root(&mut self) -> Result<u64, KernelErrorKind> {
        let new_block = self.allocate_block().ok_or(KernelErrorKind::NoSpace)?;
        self.zero_block(new_block)?;

        let mut block = ROOT_FIRST_BLOCK;
        loop {
            let next = self.chain_next(block);
            if next == FAT_EOC {
                self.chain_set_next(block, new_block);
                break;
            }
            block = next;
        }
        Ok(self.block_offset(new_block))
    }

    /// `unmount`: unmap the FAT region and drop the backing file handle.
    /// The GDT is cleaned by the caller ([`crate::context::Kernel::unmount`])
    /// since it is not owned by this struct.
    pub fn unmount(self) -> Result<(), KernelErrorKind> {
        self.flush()
    }
}

enum DirScanControl {
    Continue,
    Stop,
}
