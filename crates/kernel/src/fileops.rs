//! open/read/write/close/seek/unlink/chmod/rename over the FAT and GDT
//! (spec §4.4 "Open-file state machine").

use crate::error::KernelErrorKind;
use crate::fat::core::FatFilesystem;
use crate::fat::layout::{
    apply_chmod, DirEntry, NameStatus, DIR_NAME_LEN, FILE_TYPE_REGULAR, PERM_READ, PERM_WRITE,
};
use crate::gdt::{AccessMode, Gdt, GdtKey, OpenFileEntry};

fn now_mtime() -> i64 {
    chrono::Utc::now().timestamp()
}

fn validate_name(name: &str) -> Result<(), KernelErrorKind> {
    if name.is_empty() || name.len() >= DIR_NAME_LEN {
        return Err(KernelErrorKind::NameTooLong);
    }
    if name.as_bytes()[0] <= 2 {
        return Err(KernelErrorKind::InvalidArgument);
    }
    Ok(())
}

/// `open(name, mode)` (spec §4.4).
pub fn open(
    fs: &mut FatFilesystem,
    gdt: &mut Gdt,
    name: &str,
    access: AccessMode,
) -> Result<GdtKey, KernelErrorKind> {
    validate_name(name)?;

    let (found, offset) = fs.find_file(name)?;

    match access {
        AccessMode::Read => {
            if !found {
                return Err(KernelErrorKind::NoSuchFile);
            }
            let entry = fs.read_entry_at(offset as u64)?;
            if !entry.is_regular_file() {
                return Err(KernelErrorKind::IsDirectory);
            }
            if !entry.can_read() {
                return Err(KernelErrorKind::PermissionDenied);
            }
            gdt.insert(OpenFileEntry {
                filename: name.to_string(),
                size: entry.size,
                perm: entry.perm,
                first_block: entry.first_block,
                dir_entry_offset: offset as u64,
                cursor: 0,
                access,
            })
        }
        AccessMode::Write | AccessMode::Append => {
            if gdt.has_writer(name, None) {
                return Err(KernelErrorKind::FileInUse);
            }

            let (entry, entry_offset) = if found {
                let existing = fs.read_entry_at(offset as u64)?;
                if !existing.is_regular_file() {
                    return Err(KernelErrorKind::IsDirectory);
                }
                if !existing.can_write() {
                    return Err(KernelErrorKind::PermissionDenied);
                }
                (existing, offset as u64)
            } else {
                let dest_offset = if offset >= 0 {
                    offset as u64
                } else {
                    fs.extend_root()?
                };
                let mut fresh = DirEntry::end_of_directory();
                fresh.set_name(name);
                fresh.file_type = FILE_TYPE_REGULAR;
                fresh.perm = PERM_READ | PERM_WRITE;
                fresh.size = 0;
                fresh.first_block = 0;
                fresh.mtime = now_mtime();
                fs.write_dir_entry(dest_offset, &fresh)?;
                (fresh, dest_offset)
            };

            let (first_block, size, cursor) = match access {
                AccessMode::Write => {
                    // Truncate: free the chain if there was one, zero size.
                    if entry.size > 0 && entry.first_block != 0 {
                        fs.free_chain(entry.first_block);
                    }
                    let mut truncated = entry.clone();
                    truncated.size = 0;
                    truncated.first_block = 0;
                    truncated.mtime = now_mtime();
                    fs.write_dir_entry(entry_offset, &truncated)?;
                    (0u16, 0u32, 0u32)
                }
                AccessMode::Append => (entry.first_block, entry.size, entry.size),
                AccessMode::Read => unreachable!(),
            };

            gdt.insert(OpenFileEntry {
                filename: name.to_string(),
                size,
                perm: entry.perm,
                first_block,
                dir_entry_offset: entry_offset,
                cursor,
                access,
            })
        }
    }
}

/// `read(key, n, buffer)` (spec §4.4).
pub fn read(
    fs: &FatFilesystem,
    gdt: &mut Gdt,
    key: GdtKey,
    n: usize,
) -> Result<Vec<u8>, KernelErrorKind> {
    let entry = gdt.get(key).ok_or(KernelErrorKind::BadFd)?;
    let size = entry.size;
    let cursor = entry.cursor;
    // "past size -> EOF" (spec §9 open question resolution): a cursor
    // beyond the cached size (possible after a WRITE/APPEND seek) reads
    // zero bytes rather than erroring.
    if cursor >= size {
        return Ok(Vec::new());
    }
    let remaining = (size - cursor) as usize;
    let to_read = n.min(remaining);
    if to_read == 0 {
        return Ok(Vec::new());
    }

    let block_size = fs.block_size as usize;
    let mut blocks_to_skip = cursor as usize / block_size;
    let mut block = entry.first_block;
    while blocks_to_skip > 0 {
        if block == 0 || block == crate::fat::layout::FAT_EOC {
            return Err(KernelErrorKind::InvalidArgument);
        }
        block = fs.chain_next(block);
        blocks_to_skip -= 1;
    }
    if block == 0 {
        return Err(KernelErrorKind::InvalidArgument);
    }

    let mut out = Vec::with_capacity(to_read);
    let mut offset_in_block = cursor as usize % block_size;
    let mut remaining_to_read = to_read;
    let mut current_block = block;

    while remaining_to_read > 0 {
        if current_block == 0 || current_block == crate::fat::layout::FAT_EOC {
            break;
        }
        let mut buf = vec![0u8; block_size];
        fs.read_block(current_block, &mut buf)?;
        let available = block_size - offset_in_block;
        let take = available.min(remaining_to_read);
        out.extend_from_slice(&buf[offset_in_block..offset_in_block + take]);
        remaining_to_read -= take;
        offset_in_block = 0;
        current_block = fs.chain_next(current_block);
    }

    let actually_read = out.len();
    if let Some(entry) = gdt.get_mut(key) {
        entry.cursor += actually_read as u32;
    }
    Ok(out)
}

/// `write(key, bytes, n)` (spec §4.4).
pub fn write(
    fs: &mut FatFilesystem,
    gdt: &mut Gdt,
    key: GdtKey,
    bytes: &[u8],
) -> Result<usize, KernelErrorKind> {
    let (mut cursor, mut first_block, dir_offset, access) = {
        let entry = gdt.get(key).ok_or(KernelErrorKind::BadFd)?;
        (entry.cursor, entry.first_block, entry.dir_entry_offset, entry.access)
    };
    if !access.can_write() {
        return Err(KernelErrorKind::PermissionDenied);
    }

    let block_size = fs.block_size as usize;
    let mut written = 0usize;
    let mut first_block_changed = false;

    // Walk (or start) the chain to the block containing `cursor`, allocating
    // chain-prefix blocks as needed — including the very first block when
    // the file is still empty (`first_block == 0`) and `cursor` was raised
    // past the start by a prior `seek`. Mirrors `read()`'s unconditional
    // skip-walk: a fresh file is just a chain of length zero, not a reason
    // to skip the walk.
    let blocks_to_skip = cursor as usize / block_size;
    let mut current_block = first_block;
    let mut out_of_space = false;
    for _ in 0..blocks_to_skip {
        if current_block == 0 {
            match fs.allocate_block() {
                Some(new_block) => {
                    first_block = new_block;
                    first_block_changed = true;
                    current_block = new_block;
                }
                None => {
                    out_of_space = true;
                    break;
                }
            }
            continue;
        }
        let next = fs.chain_next(current_block);
        if next == 0 || next == crate::fat::layout::FAT_EOC {
            // Chain ends before the cursor: allocate forward.
            match fs.allocate_block() {
                Some(new_block) => {
                    fs.chain_set_next(current_block, new_block);
                    current_block = new_block;
                }
                None => {
                    out_of_space = true;
                    break;
                }
            }
        } else {
            current_block = next;
        }
    }

    while !out_of_space && written < bytes.len() {
        if current_block == 0 {
            match fs.allocate_block() {
                Some(new_block) => {
                    current_block = new_block;
                    first_block = new_block;
                    first_block_changed = true;
                }
                None => break,
            }
        }

        let offset_in_block = cursor as usize % block_size;
        let mut buf = vec![0u8; block_size];
        fs.read_block(current_block, &mut buf)?;
        let space = block_size - offset_in_block;
        let take = space.min(bytes.len() - written);
        buf[offset_in_block..offset_in_block + take].copy_from_slice(&bytes[written..written + take]);
        fs.write_block(current_block, &buf)?;
        written += take;
        cursor += take as u32;

        if written == bytes.len() {
            break;
        }

        // Need another block: allocate and splice onto the chain.
        let next = fs.chain_next(current_block);
        if next == 0 || next == crate::fat::layout::FAT_EOC {
            match fs.allocate_block() {
                Some(new_block) => {
                    fs.chain_set_next(current_block, new_block);
                    current_block = new_block;
                }
                None => break,
            }
        } else {
            current_block = next;
        }
    }

    let entry = gdt.get_mut(key).ok_or(KernelErrorKind::BadFd)?;
    entry.cursor = cursor;
    if first_block_changed {
        entry.first_block = first_block;
    }
    let size_grew = cursor > entry.size;
    if size_grew {
        entry.size = cursor;
    }

    if first_block_changed || size_grew {
        let mut dir_entry = fs.read_entry_at(dir_offset)?;
        dir_entry.first_block = first_block;
        dir_entry.size = cursor.max(dir_entry.size);
        dir_entry.mtime = now_mtime();
        fs.write_dir_entry(dir_offset, &dir_entry)?;
    }

    Ok(written)
}

/// `close(key)` (spec §4.4).
pub fn close(fs: &mut FatFilesystem, gdt: &mut Gdt, key: GdtKey) -> Result<(), KernelErrorKind> {
    if key.is_standard_stream() {
        gdt.free(key);
        return Ok(());
    }

    let entry = gdt.get(key).ok_or(KernelErrorKind::BadFd)?.clone();
    let mut dir_entry = fs.read_entry_at(entry.dir_entry_offset)?;

    if entry.access.can_write() {
        dir_entry.size = entry.size;
        dir_entry.first_block = entry.first_block;
        dir_entry.mtime = now_mtime();
    }

    if dir_entry.status() == NameStatus::Tombstoned && !gdt.references_offset(entry.dir_entry_offset, Some(key)) {
        fs.free_chain(dir_entry.first_block);
        dir_entry.name[0] = 1; // Deleted
        dir_entry.first_block = 0;
        dir_entry.size = 0;
    }

    fs.write_dir_entry(entry.dir_entry_offset, &dir_entry)?;
    gdt.free(key);
    Ok(())
}

/// `unlink(name)` (spec §4.4).
pub fn unlink(fs: &mut FatFilesystem, gdt: &mut Gdt, name: &str) -> Result<(), KernelErrorKind> {
    let (found, offset) = fs.find_file(name)?;
    if !found {
        return Err(KernelErrorKind::NoSuchFile);
    }
    let offset = offset as u64;
    let mut entry = fs.read_entry_at(offset)?;
    if !entry.is_regular_file() {
        return Err(KernelErrorKind::IsDirectory);
    }

    if gdt.references_offset(offset, None) {
        entry.name[0] = 2; // Tombstoned
        fs.write_dir_entry(offset, &entry)?;
    } else {
        fs.free_chain(entry.first_block);
        entry.name[0] = 1; // Deleted
        entry.first_block = 0;
        entry.size = 0;
        fs.write_dir_entry(offset, &entry)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// `seek(key, offset, whence)` (spec §4.4).
pub fn seek(gdt: &mut Gdt, key: GdtKey, offset: i64, whence: Whence) -> Result<u32, KernelErrorKind> {
    let entry = gdt.get(key).ok_or(KernelErrorKind::BadFd)?;
    let base = match whence {
        Whence::Set => 0i64,
        Whence::Cur => entry.cursor as i64,
        Whence::End => entry.size as i64,
    };
    let new_pos = base + offset;
    if new_pos < 0 {
        return Err(KernelErrorKind::InvalidArgument);
    }
    let new_pos = new_pos as u32;

    let entry = gdt.get_mut(key).ok_or(KernelErrorKind::BadFd)?;
    entry.cursor = new_pos;
    if entry.access.can_write() && new_pos > entry.size {
        entry.size = new_pos;
    }
    Ok(new_pos)
}

/// `chmod(name, mode_word)` (spec §4.4).
pub fn chmod(fs: &mut FatFilesystem, name: &str, mode_word: u8) -> Result<(), KernelErrorKind> {
    let (found, offset) = fs.find_file(name)?;
    if !found {
        return Err(KernelErrorKind::NoSuchFile);
    }
    let mut entry = fs.read_entry_at(offset as u64)?;
    entry.perm = apply_chmod(entry.perm, mode_word);
    entry.mtime = now_mtime();
    fs.write_dir_entry(offset as u64, &entry)?;
    Ok(())
}

/// `rename(src, dst)` (spec §4.4).
pub fn rename(fs: &mut FatFilesystem, gdt: &mut Gdt, src: &str, dst: &str) -> Result<(), KernelErrorKind> {
    validate_name(dst)?;
    let (src_found, src_offset) = fs.find_file(src)?;
    if !src_found {
        return Err(KernelErrorKind::NoSuchFile);
    }
    let mut src_entry = fs.read_entry_at(src_offset as u64)?;
    if !src_entry.can_read() {
        return Err(KernelErrorKind::PermissionDenied);
    }

    let (dst_found, dst_offset) = fs.find_file(dst)?;
    if dst_found {
        let dst_entry = fs.read_entry_at(dst_offset as u64)?;
        if !dst_entry.can_write() {
            return Err(KernelErrorKind::PermissionDenied);
        }
        unlink(fs, gdt, dst)?;
    }

    src_entry.set_name(dst);
    src_entry.mtime = now_mtime();
    fs.write_dir_entry(src_offset as u64, &src_entry)?;
    Ok(())
}
