//! Global descriptor table (spec §3 "Open-file entry", §4.4): the
//! kernel-wide table of open-file entries, fingerprinted by directory-entry
//! offset for the deferred-delete bookkeeping in [`crate::fileops`].

use crate::error::KernelErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GdtKey(pub usize);

impl GdtKey {
    pub const STDIN: GdtKey = GdtKey(0);
    pub const STDOUT: GdtKey = GdtKey(1);
    pub const STDERR: GdtKey = GdtKey(2);

    pub fn is_standard_stream(self) -> bool {
        self.0 < 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Append,
}

impl AccessMode {
    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::Append)
    }
}

#[derive(Debug, Clone)]
pub struct OpenFileEntry {
    pub filename: String,
    pub size: u32,
    pub perm: u8,
    pub first_block: u16,
    /// Acts as the file's stable identity for deferred-delete bookkeeping
    /// (spec §3). Standard streams use 0 (never matched against a real
    /// directory entry).
    pub dir_entry_offset: u64,
    pub cursor: u32,
    pub access: AccessMode,
}

pub struct Gdt {
    slots: Vec<Option<OpenFileEntry>>,
    capacity: usize,
}

impl Gdt {
    pub fn new(capacity: usize) -> Gdt {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Gdt { slots, capacity }
    }

    /// Installs GDT slots 0/1/2 as standard streams with flags READ,
    /// WRITE, WRITE respectively (spec §4.3 `mount`).
    pub fn install_standard_streams(&mut self) {
        self.slots[0] = Some(OpenFileEntry {
            filename: "stdin".into(),
            size: 0,
            perm: 0,
            first_block: 0,
            dir_entry_offset: 0,
            cursor: 0,
            access: AccessMode::Read,
        });
        self.slots[1] = Some(OpenFileEntry {
            filename: "stdout".into(),
            size: 0,
            perm: 0,
            first_block: 0,
            dir_entry_offset: 0,
            cursor: 0,
            access: AccessMode::Write,
        });
        self.slots[2] = Some(OpenFileEntry {
            filename: "stderr".into(),
            size: 0,
            perm: 0,
            first_block: 0,
            dir_entry_offset: 0,
            cursor: 0,
            access: AccessMode::Write,
        });
    }

    pub fn insert(&mut self, entry: OpenFileEntry) -> Result<GdtKey, KernelErrorKind> {
        for (i, slot) in self.slots.iter_mut().enumerate().skip(3) {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(GdtKey(i));
            }
        }
        if self.slots.len() < self.capacity {
            self.slots.push(Some(entry));
            return Ok(GdtKey(self.slots.len() - 1));
        }
        Err(KernelErrorKind::TableFull)
    }

    pub fn get(&self, key: GdtKey) -> Option<&OpenFileEntry> {
        self.slots.get(key.0)?.as_ref()
    }

    pub fn get_mut(&mut self, key: GdtKey) -> Option<&mut OpenFileEntry> {
        self.slots.get_mut(key.0)?.as_mut()
    }

    pub fn free(&mut self, key: GdtKey) {
        if let Some(slot) = self.slots.get_mut(key.0) {
            *slot = None;
        }
    }

    /// spec §3 single-writer invariant: at most one GDT slot with a given
    /// name holds WRITE or APPEND.
    pub fn has_writer(&self, filename: &str, excluding: Option<GdtKey>) -> bool {
        self.slots.iter().enumerate().any(|(i, slot)| {
            if Some(GdtKey(i)) == excluding {
                return false;
            }
            slot.as_ref()
                .map(|e| e.filename == filename && e.access.can_write())
                .unwrap_or(false)
        })
    }

    /// Any GDT slot (other than `excluding`) referencing the same
    /// directory-entry offset — used by `close`/`unlink`'s deferred-delete
    /// reference counting (spec §4.4).
    pub fn references_offset(&self, offset: u64, excluding: Option<GdtKey>) -> bool {
        self.slots.iter().enumerate().any(|(i, slot)| {
            if Some(GdtKey(i)) == excluding {
                return false;
            }
            slot.as_ref().map(|e| e.dir_entry_offset == offset).unwrap_or(false)
        })
    }

    /// Frees every non-null slot (spec §4.3 `unmount`).
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(filename: &str, access: AccessMode, offset: u64) -> OpenFileEntry {
        OpenFileEntry {
            filename: filename.into(),
            size: 0,
            perm: 0b110,
            first_block: 0,
            dir_entry_offset: offset,
            cursor: 0,
            access,
        }
    }

    #[test]
    fn standard_streams_occupy_slots_zero_through_two() {
        let mut gdt = Gdt::new(8);
        gdt.install_standard_streams();
        assert!(gdt.get(GdtKey::STDIN).is_some());
        assert_eq!(gdt.get(GdtKey::STDOUT).unwrap().access, AccessMode::Write);
    }

    #[test]
    fn has_writer_detects_single_writer_violation() {
        let mut gdt = Gdt::new(8);
        gdt.install_standard_streams();
        let key = gdt.insert(sample_entry("a.txt", AccessMode::Write, 64)).unwrap();
        assert!(gdt.has_writer("a.txt", None));
        assert!(!gdt.has_writer("a.txt", Some(key)));
    }

    #[test]
    fn references_offset_counts_other_slots_only() {
        let mut gdt = Gdt::new(8);
        gdt.install_standard_streams();
        let a = gdt.insert(sample_entry("a.txt", AccessMode::Read, 64)).unwrap();
        let b = gdt.insert(sample_entry("a.txt", AccessMode::Read, 64)).unwrap();
        assert!(gdt.references_offset(64, Some(a)));
        gdt.free(b);
        assert!(!gdt.references_offset(64, Some(a)));
    }

    #[test]
    fn clear_frees_every_slot() {
        let mut gdt = Gdt::new(8);
        gdt.install_standard_streams();
        gdt.insert(sample_entry("a.txt", AccessMode::Read, 64)).unwrap();
        gdt.clear();
        assert!(gdt.get(GdtKey::STDIN).is_none());
    }
}
