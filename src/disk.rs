//! In-memory archive engine — deserialize a whole archive, mutate it
//! through the entry map, re-serialize it.
//!
//! ```no_run
//! use tevd::{Disk, Entry};
//!
//! let mut disk = Disk::new(1 << 20, b"scratch");
//! let handle = disk.generate_unique_handle();
//! disk.insert(Entry::file(handle, 0, b"readme", b"hi".to_vec(), 0));
//! disk.link_child(0, handle)?;
//!
//! let bytes = disk.save()?;
//! let again = Disk::load(&bytes)?;
//! assert!(again.get(handle).is_some());
//! # Ok::<(), tevd::TevdError>(())
//! ```

use std::collections::HashMap;
use std::io::{self, Cursor};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::LargeBuffer;
use crate::entry::{Entry, Handle, Payload, MAX_CHILDREN, RESERVED_HANDLE, ROOT_HANDLE};
use crate::error::{Result, TevdError};
use crate::header::{DiskHeader, EOF_MARK, FOOTER_FRAMING_SIZE, FOOTER_SENTINEL, HEADER_SIZE};
use crate::wire;

// ── Disk ──────────────────────────────────────────────────────────────────────

/// A whole archive held in memory.  The entry map owns every entry;
/// parent/child links are by handle only.
pub struct Disk {
    pub capacity: u64,
    pub disk_name: Vec<u8>,
    /// Variable-length trailer; byte 0 bit 0 is the read-only flag.
    pub footer: Vec<u8>,
    entries: HashMap<Handle, Entry>,
    rng: StdRng,
}

impl Disk {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// A fresh disk containing only the root directory.
    pub fn new(capacity: u64, disk_name: &[u8]) -> Self {
        Self::with_rng(capacity, disk_name, StdRng::from_entropy())
    }

    /// Deterministic handle generation for tests.
    pub fn new_seeded(capacity: u64, disk_name: &[u8], seed: u64) -> Self {
        Self::with_rng(capacity, disk_name, StdRng::seed_from_u64(seed))
    }

    fn with_rng(capacity: u64, disk_name: &[u8], rng: StdRng) -> Self {
        let now = Utc::now().timestamp() as u64;
        let mut entries = HashMap::new();
        entries.insert(ROOT_HANDLE, Entry::directory(ROOT_HANDLE, ROOT_HANDLE, b"", now));
        Self {
            capacity,
            disk_name: disk_name.to_vec(),
            footer: vec![0],
            entries,
            rng,
        }
    }

    // ── Load / save ──────────────────────────────────────────────────────────

    /// Streaming parse of a complete archive image.  Per-entry CRCs, the
    /// archive CRC, and the parent graph (root with parent 0, every other
    /// parent an existing directory) are verified; corruption is reported,
    /// never tolerated.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + FOOTER_FRAMING_SIZE {
            return Err(TevdError::Malformed("archive shorter than its framing"));
        }

        let mut cursor = Cursor::new(bytes);
        let header = DiskHeader::read(&mut cursor)?;

        let mut entries = HashMap::new();
        loop {
            let word = cursor
                .read_u32::<BigEndian>()
                .map_err(TevdError::from_read)?;
            if word == FOOTER_SENTINEL {
                break;
            }
            let entry = Entry::read_after_handle(word as Handle, &mut cursor)?;
            if entries.insert(entry.handle, entry).is_some() {
                return Err(TevdError::Malformed("duplicate entry handle"));
            }
        }

        let rest = &bytes[cursor.position() as usize..];
        if rest.len() < 2 || rest[rest.len() - 2..] != EOF_MARK {
            return Err(TevdError::Malformed("missing end-of-file mark"));
        }
        let footer = rest[..rest.len() - 2].to_vec();

        match entries.get(&ROOT_HANDLE) {
            Some(root) if matches!(root.payload, Payload::Directory(_)) => {
                if root.parent != ROOT_HANDLE {
                    return Err(TevdError::Malformed("root directory has a non-root parent"));
                }
            }
            _ => return Err(TevdError::Malformed("missing root directory")),
        }
        for entry in entries.values() {
            if entry.handle == ROOT_HANDLE {
                continue;
            }
            match entries.get(&entry.parent) {
                Some(parent) if matches!(parent.payload, Payload::Directory(_)) => {}
                Some(_) => return Err(TevdError::Malformed("entry parent is not a directory")),
                None => return Err(TevdError::Malformed("entry parent does not exist")),
            }
        }

        let mut crcs = Vec::with_capacity(entries.len());
        for entry in entries.values() {
            crcs.push(entry.payload_crc()?);
        }
        if wire::archive_crc(&crcs) != header.crc {
            return Err(TevdError::ArchiveCorrupt);
        }

        Ok(Self {
            capacity: header.capacity,
            disk_name: header.disk_name,
            footer,
            entries,
            rng: StdRng::from_entropy(),
        })
    }

    /// Serialize into a pre-sized buffer.  Entries are written in ascending
    /// unsigned-handle order so output is deterministic.
    pub fn save(&self) -> Result<Vec<u8>> {
        let mut handles: Vec<Handle> = self.entries.keys().copied().collect();
        handles.sort_unstable_by_key(|h| *h as u32);

        let mut buf = LargeBuffer::with_capacity(self.used_bytes());
        self.header()?.write(&mut buf)?;
        for handle in &handles {
            self.entries[handle].write(&mut buf)?;
        }
        buf.write_u32::<BigEndian>(FOOTER_SENTINEL)?;
        buf.append_slice(&self.footer);
        buf.append_slice(&EOF_MARK);
        Ok(buf.into_vec())
    }

    fn header(&self) -> Result<DiskHeader> {
        Ok(DiskHeader {
            capacity: self.capacity,
            disk_name: self.disk_name.clone(),
            crc: self.archive_crc()?,
        })
    }

    // ── Entry map ────────────────────────────────────────────────────────────

    pub fn insert(&mut self, entry: Entry) {
        self.entries.insert(entry.handle, entry);
    }

    /// Removing the root is refused; every archive keeps its root directory.
    pub fn remove(&mut self, handle: Handle) -> Option<Entry> {
        if handle == ROOT_HANDLE {
            return None;
        }
        self.entries.remove(&handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&Entry> {
        self.entries.get(&handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        self.entries.get_mut(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.entries.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn children_of(&self, handle: Handle) -> Result<&[Handle]> {
        match self.entries.get(&handle) {
            Some(entry) => match &entry.payload {
                Payload::Directory(children) => Ok(children),
                _ => Err(TevdError::NotADirectory(format!("entry {handle}"))),
            },
            None => Err(TevdError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("entry {handle} not found"),
            ))),
        }
    }

    /// Add `child` to `parent`'s child list and point the child's parent
    /// field back, when the child is present in the map.
    pub fn link_child(&mut self, parent: Handle, child: Handle) -> Result<()> {
        match self.entries.get_mut(&parent) {
            Some(entry) => match &mut entry.payload {
                Payload::Directory(children) => {
                    if !children.contains(&child) {
                        if children.len() >= MAX_CHILDREN {
                            return Err(TevdError::DirectoryFull);
                        }
                        children.push(child);
                    }
                }
                _ => return Err(TevdError::NotADirectory(format!("entry {parent}"))),
            },
            None => {
                return Err(TevdError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("entry {parent} not found"),
                )))
            }
        }
        if let Some(entry) = self.entries.get_mut(&child) {
            entry.parent = parent;
        }
        Ok(())
    }

    pub fn unlink_child(&mut self, parent: Handle, child: Handle) -> Result<()> {
        match self.entries.get_mut(&parent) {
            Some(entry) => match &mut entry.payload {
                Payload::Directory(children) => {
                    children.retain(|&c| c != child);
                    Ok(())
                }
                _ => Err(TevdError::NotADirectory(format!("entry {parent}"))),
            },
            None => Err(TevdError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("entry {parent} not found"),
            ))),
        }
    }

    /// Rejection-sampled random handle.  The address space dwarfs any real
    /// entry count, so this terminates with overwhelming probability.
    pub fn generate_unique_handle(&mut self) -> Handle {
        loop {
            let word = self.rng.gen::<u32>();
            if word == RESERVED_HANDLE || word == 0 {
                continue;
            }
            let handle = word as Handle;
            if !self.entries.contains_key(&handle) {
                return handle;
            }
        }
    }

    // ── Archive-level accounting ─────────────────────────────────────────────

    pub fn archive_crc(&self) -> Result<u32> {
        let mut crcs = Vec::with_capacity(self.entries.len());
        for entry in self.entries.values() {
            crcs.push(entry.payload_crc()?);
        }
        Ok(wire::archive_crc(&crcs))
    }

    /// Exact serialized length of the archive.
    pub fn used_bytes(&self) -> u64 {
        let entry_bytes: u64 = self.entries.values().map(Entry::serialized_size).sum();
        HEADER_SIZE as u64 + entry_bytes + FOOTER_FRAMING_SIZE as u64 + self.footer.len() as u64
    }

    pub fn is_read_only(&self) -> bool {
        self.capacity == 0 || self.footer.first().map_or(false, |b| b & 1 == 1)
    }

    /// Sets or clears bit 0 of the footer's flag byte; other bits are kept.
    pub fn set_read_only(&mut self, read_only: bool) {
        if self.footer.is_empty() {
            self.footer.push(0);
        }
        if read_only {
            self.footer[0] |= 1;
        } else {
            self.footer[0] &= !1;
        }
    }
}
