//! Streaming skimmer engine — targeted reads and temp-file edits over an
//! archive that never fully enters memory.
//!
//! # Index build
//! [`Skimmer::open`] walks the entry stream once, reading only each entry's
//! handle, kind byte, and size prefix, and records the absolute offset of
//! every entry header plus the position of the footer sentinel.  The footer
//! region (sentinel through EOF mark) is buffered verbatim so edits can
//! replay it untouched.
//!
//! # Reads
//! [`Skimmer::fetch`] seeks straight to the recorded offset and materializes
//! one entry.  The file is opened on demand inside each call and closed on
//! every exit path, so several skimmers may read the same archive.
//!
//! # Edits
//! `append`, `delete`, and `create_path` all funnel through a single
//! rewrite pass: survivors are copied (or replaced) into `<file>_tmp` in
//! file order with the root first, new entries land at the end, the footer
//! is replayed, and the archive CRC is re-derived and patched into the
//! header.  Directory child lists are maintained transactionally in the
//! same pass, and the temp file is swapped in by the commit protocol.
//! On any failure the in-memory index is left untouched.
//!
//! # Endianness
//! All binary I/O is strictly big-endian; see `entry.rs` and `header.rs`
//! for field-level documentation.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::Utc;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::commit;
use crate::entry::{
    Entry, Handle, Payload, ENTRY_HEADER_SIZE, MAX_CHILDREN, RESERVED_HANDLE, ROOT_HANDLE,
};
use crate::error::{Result, TevdError};
use crate::header::{DiskHeader, CRC_FIELD_OFFSET, EOF_MARK, FOOTER_SENTINEL, HEADER_SIZE};
use crate::wire;

// ── Name rendering ────────────────────────────────────────────────────────────

/// Character-set decoder supplied by the embedding application.  Names stay
/// raw bytes in the format; decoding is display-only.
pub trait NameCodec {
    fn decode(&self, raw: &[u8]) -> String;
}

/// Default decoder: UTF-8 with replacement characters.
pub struct Utf8Lossy;

impl NameCodec for Utf8Lossy {
    fn decode(&self, raw: &[u8]) -> String {
        String::from_utf8_lossy(raw).into_owned()
    }
}

// ── Rewrite plan ──────────────────────────────────────────────────────────────

/// One temp-file pass: drop these handles, swap these entries in place of
/// their old blocks, append these at the end.
#[derive(Default)]
struct Rewrite {
    replace: HashMap<Handle, Entry>,
    drop: HashSet<Handle>,
    append: Vec<Entry>,
}

impl Rewrite {
    fn is_empty(&self) -> bool {
        self.replace.is_empty() && self.drop.is_empty() && self.append.is_empty()
    }
}

// ── Skimmer ───────────────────────────────────────────────────────────────────

pub struct Skimmer {
    path: PathBuf,
    header: DiskHeader,
    /// handle → absolute offset of the entry header.
    offsets: HashMap<Handle, u64>,
    /// Absolute offset of the footer sentinel.
    footer_position: u64,
    /// Raw footer region, sentinel through EOF mark, replayed verbatim.
    footer: Vec<u8>,
    charset: Box<dyn NameCodec>,
    rng: StdRng,
}

impl Skimmer {
    // ── Open ─────────────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P, charset: Box<dyn NameCodec>) -> Result<Self> {
        Self::open_inner(path.as_ref(), charset, StdRng::from_entropy())
    }

    /// Deterministic handle generation for tests.
    pub fn open_seeded<P: AsRef<Path>>(
        path: P,
        charset: Box<dyn NameCodec>,
        seed: u64,
    ) -> Result<Self> {
        Self::open_inner(path.as_ref(), charset, StdRng::seed_from_u64(seed))
    }

    fn open_inner(path: &Path, charset: Box<dyn NameCodec>, rng: StdRng) -> Result<Self> {
        commit::sweep(path);

        let mut file = BufReader::new(File::open(path)?);
        let header = DiskHeader::read(&mut file)?;

        let mut offsets = HashMap::new();
        let footer_position;
        loop {
            let pos = file.stream_position()?;
            let word = file
                .read_u32::<BigEndian>()
                .map_err(TevdError::from_read)?;
            if word == FOOTER_SENTINEL {
                footer_position = pos;
                break;
            }
            file.seek(SeekFrom::Current(4))?; // parent
            let kind = file.read_u8().map_err(TevdError::from_read)?;
            file.seek(SeekFrom::Current(272))?; // name + timestamps + entry CRC
            let (_, trailing) = payload_extent(kind, &mut file)?;
            file.seek(SeekFrom::Current(trailing as i64))?;
            if offsets.insert(word as Handle, pos).is_some() {
                return Err(TevdError::Malformed("duplicate entry handle"));
            }
        }

        file.seek(SeekFrom::Start(footer_position))?;
        let mut footer = Vec::new();
        file.read_to_end(&mut footer)?;
        if footer.len() < 6 || footer[footer.len() - 2..] != EOF_MARK {
            return Err(TevdError::Malformed("missing end-of-file mark"));
        }

        debug!(
            "indexed {} entries in {}, footer at {footer_position}",
            offsets.len(),
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            header,
            offsets,
            footer_position,
            footer,
            charset,
            rng,
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    pub fn disk_name(&self) -> &[u8] {
        &self.header.disk_name
    }

    pub fn offsets(&self) -> &HashMap<Handle, u64> {
        &self.offsets
    }

    pub fn footer_position(&self) -> u64 {
        self.footer_position
    }

    /// The trailer payload between the sentinel and the EOF mark.
    pub fn footer_bytes(&self) -> &[u8] {
        &self.footer[4..self.footer.len() - 2]
    }

    pub fn is_read_only(&self) -> bool {
        self.header.capacity == 0
            || self.footer_bytes().first().map_or(false, |b| b & 1 == 1)
    }

    pub fn display_name(&self, entry: &Entry) -> String {
        self.charset.decode(&entry.name)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(TevdError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "archive is read-only",
            )));
        }
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Materialize one entry, or nothing for an unknown handle.
    pub fn fetch(&self, handle: Handle) -> Result<Option<Entry>> {
        let Some(&offset) = self.offsets.get(&handle) else {
            return Ok(None);
        };
        let mut file = BufReader::new(File::open(&self.path)?);
        file.seek(SeekFrom::Start(offset + 4))?;
        let entry = Entry::read_after_handle(handle, &mut file)?;
        Ok(Some(entry))
    }

    /// Total serialized length of an entry, header included, read from the
    /// kind byte and size prefix alone.
    pub fn entry_block_size(&self, handle: Handle) -> Result<Option<u64>> {
        let Some(&offset) = self.offsets.get(&handle) else {
            return Ok(None);
        };
        let mut file = File::open(&self.path)?;
        Ok(Some(probe_block_size(&mut file, offset)?))
    }

    // ── Edits ────────────────────────────────────────────────────────────────

    /// Write new entries at the end of the entry stream, extending each
    /// existing parent directory's child list in the same pass.  Entries
    /// whose handle is already present are replaced (old block dropped, new
    /// bytes at the end).  Parents that are themselves part of the batch
    /// must arrive pre-linked.
    pub fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        self.ensure_writable()?;
        if entries.is_empty() {
            return Ok(());
        }

        let batch: HashSet<Handle> = entries.iter().map(|e| e.handle).collect();
        if batch.len() != entries.len() {
            return Err(TevdError::Malformed("duplicate handle in append batch"));
        }
        let mut plan = Rewrite::default();
        for entry in &entries {
            if entry.handle == ROOT_HANDLE || entry.handle as u32 == RESERVED_HANDLE {
                return Err(TevdError::Malformed("reserved handle in append"));
            }
            if self.offsets.contains_key(&entry.handle) {
                plan.drop.insert(entry.handle);
            }
            if batch.contains(&entry.parent) {
                continue;
            }
            let mut parent = match plan.replace.remove(&entry.parent) {
                Some(p) => p,
                None => self
                    .fetch(entry.parent)?
                    .ok_or_else(|| missing_entry(entry.parent))?,
            };
            match &mut parent.payload {
                Payload::Directory(children) => {
                    if !children.contains(&entry.handle) {
                        if children.len() >= MAX_CHILDREN {
                            return Err(TevdError::DirectoryFull);
                        }
                        children.push(entry.handle);
                    }
                }
                _ => return Err(TevdError::NotADirectory(format!("entry {}", entry.parent))),
            }
            plan.replace.insert(entry.parent, parent);
        }
        plan.append = entries;
        self.apply(plan)
    }

    /// Remove entries, pruning each surviving parent directory's child list
    /// in the same pass.  The root cannot be deleted; unknown handles are
    /// ignored.  Orphaned descendants are the caller's responsibility.
    pub fn delete(&mut self, handles: &[Handle]) -> Result<()> {
        self.ensure_writable()?;

        let mut plan = Rewrite::default();
        for &handle in handles {
            if handle == ROOT_HANDLE {
                warn!("refusing to delete the root directory");
                continue;
            }
            if self.offsets.contains_key(&handle) {
                plan.drop.insert(handle);
            }
        }
        if plan.drop.is_empty() {
            return Ok(());
        }

        let mut dead_by_parent: HashMap<Handle, Vec<Handle>> = HashMap::new();
        for &handle in &plan.drop {
            let entry = self.fetch(handle)?.ok_or_else(|| missing_entry(handle))?;
            dead_by_parent.entry(entry.parent).or_default().push(handle);
        }
        for (parent, dead) in dead_by_parent {
            if plan.drop.contains(&parent) {
                continue;
            }
            let mut entry = self.fetch(parent)?.ok_or_else(|| missing_entry(parent))?;
            if let Payload::Directory(children) = &mut entry.payload {
                children.retain(|c| !dead.contains(c));
                plan.replace.insert(parent, entry);
            }
        }
        self.apply(plan)
    }

    /// Create a file at `path`, minting any missing intermediate
    /// directories, in one temp-file pass.  Returns the file's handle.
    ///
    /// With `overwrite`, an existing regular file at the full path has its
    /// payload replaced (same handle, `created_at` preserved); a directory
    /// or symlink there is refused.  Without it the call fails whenever the
    /// full path exists.
    pub fn create_path(&mut self, path: &str, bytes: &[u8], overwrite: bool) -> Result<Handle> {
        self.ensure_writable()?;

        let segments: Vec<&[u8]> = path
            .split(['/', '\\'])
            .filter(|s| !s.is_empty())
            .map(str::as_bytes)
            .collect();
        if segments.is_empty() {
            return Err(TevdError::AlreadyExists(path.to_string()));
        }

        // Longest existing prefix determines the append point.
        let mut cursor = ROOT_HANDLE;
        let mut depth = 0;
        'walk: while depth < segments.len() {
            let dir = self.fetch(cursor)?.ok_or_else(|| missing_entry(cursor))?;
            let children = match &dir.payload {
                Payload::Directory(children) => children.clone(),
                _ => return Err(TevdError::NotADirectory(self.charset.decode(&dir.name))),
            };
            let mut matched = None;
            for child in children {
                if let Some(entry) = self.fetch(child)? {
                    if entry.name == segments[depth] {
                        matched = Some(entry);
                        break;
                    }
                }
            }
            let Some(entry) = matched else { break 'walk };
            depth += 1;
            if depth == segments.len() {
                if !overwrite {
                    return Err(TevdError::AlreadyExists(path.to_string()));
                }
                match entry.payload {
                    Payload::File(_) => {
                        let handle = entry.handle;
                        let mut plan = Rewrite::default();
                        plan.drop.insert(handle);
                        plan.append.push(Entry {
                            handle,
                            parent: entry.parent,
                            name: entry.name,
                            created_at: entry.created_at,
                            modified_at: Utc::now().timestamp() as u64,
                            payload: Payload::File(bytes.to_vec()),
                        });
                        self.apply(plan)?;
                        return Ok(handle);
                    }
                    _ => return Err(TevdError::AlreadyExists(path.to_string())),
                }
            }
            match entry.payload {
                Payload::Directory(_) => cursor = entry.handle,
                _ => {
                    return Err(TevdError::NotADirectory(
                        self.charset.decode(segments[depth - 1]),
                    ))
                }
            }
        }

        // Mint handles for the missing suffix.
        let mut used: HashSet<Handle> = self.offsets.keys().copied().collect();
        let mut minted = Vec::with_capacity(segments.len() - depth);
        for _ in depth..segments.len() {
            let handle = loop {
                let word = self.rng.gen::<u32>();
                if word == RESERVED_HANDLE || word == 0 || used.contains(&(word as Handle)) {
                    continue;
                }
                break word as Handle;
            };
            used.insert(handle);
            minted.push(handle);
        }

        let now = Utc::now().timestamp() as u64;
        let mut plan = Rewrite::default();

        let mut anchor = self.fetch(cursor)?.ok_or_else(|| missing_entry(cursor))?;
        match &mut anchor.payload {
            Payload::Directory(children) => {
                if children.len() >= MAX_CHILDREN {
                    return Err(TevdError::DirectoryFull);
                }
                children.push(minted[0]);
            }
            _ => return Err(TevdError::NotADirectory(self.charset.decode(&anchor.name))),
        }
        anchor.modified_at = now;
        plan.replace.insert(cursor, anchor);

        // Chain of directories ending in the file itself.
        let mut parent = cursor;
        for (i, &handle) in minted.iter().enumerate() {
            let payload = if i == minted.len() - 1 {
                Payload::File(bytes.to_vec())
            } else {
                Payload::Directory(vec![minted[i + 1]])
            };
            plan.append.push(Entry {
                handle,
                parent,
                name: segments[depth + i].to_vec(),
                created_at: now,
                modified_at: now,
                payload,
            });
            parent = handle;
        }

        let file_handle = minted[minted.len() - 1];
        self.apply(plan)?;
        Ok(file_handle)
    }

    /// Compatibility repair tool: recompute every directory's child list
    /// from the parent census of all non-root entries and rewrite the
    /// archive.  The transactional edit paths keep child lists correct on
    /// their own; this exists for archives written by older tooling.
    pub fn rebuild_child_lists(&mut self) -> Result<()> {
        self.ensure_writable()?;

        let mut order: Vec<(Handle, u64)> = self.offsets.iter().map(|(&h, &o)| (h, o)).collect();
        order.sort_unstable_by_key(|&(_, offset)| offset);

        let mut census: HashMap<Handle, Vec<Handle>> = HashMap::new();
        {
            let mut file = File::open(&self.path)?;
            for &(handle, offset) in &order {
                if handle == ROOT_HANDLE {
                    continue;
                }
                file.seek(SeekFrom::Start(offset + 4))?;
                let parent = file.read_i32::<BigEndian>().map_err(TevdError::from_read)?;
                census.entry(parent).or_default().push(handle);
            }
        }

        let mut plan = Rewrite::default();
        for &(handle, _) in &order {
            let Some(mut entry) = self.fetch(handle)? else { continue };
            if !matches!(entry.payload, Payload::Directory(_)) {
                continue;
            }
            let children = census.remove(&handle).unwrap_or_default();
            if children.len() > MAX_CHILDREN {
                return Err(TevdError::DirectoryFull);
            }
            entry.payload = Payload::Directory(children);
            plan.replace.insert(handle, entry);
        }
        self.apply(plan)
    }

    // ── Rewrite pass ─────────────────────────────────────────────────────────

    fn apply(&mut self, plan: Rewrite) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        let tmp = commit::sibling(&self.path, commit::TMP_SUFFIX);
        let staged = self.write_rewrite(&tmp, &plan)?;
        commit::commit(&self.path, &tmp)?;
        self.offsets = staged.offsets;
        self.footer_position = staged.footer_position;
        self.header.crc = staged.crc;
        Ok(())
    }

    /// Stream the next archive state into `tmp`.  Survivors keep file
    /// order with the root first; replacements are re-serialized in place;
    /// appended entries follow; the buffered footer is replayed verbatim.
    /// The archive CRC is patched into the header once all entry CRCs are
    /// known.
    fn write_rewrite(&self, tmp: &Path, plan: &Rewrite) -> Result<Staged> {
        let mut src = BufReader::new(File::open(&self.path)?);
        let mut dst = BufWriter::new(File::create(tmp)?);

        let mut header = self.header.clone();
        header.crc = 0;
        header.write(&mut dst)?;

        let mut order: Vec<(Handle, u64)> = self.offsets.iter().map(|(&h, &o)| (h, o)).collect();
        order.sort_unstable_by_key(|&(_, offset)| offset);
        if let Some(i) = order.iter().position(|&(h, _)| h == ROOT_HANDLE) {
            let root = order.remove(i);
            order.insert(0, root);
        }

        let mut offsets = HashMap::new();
        let mut crcs = Vec::new();
        let mut cursor = HEADER_SIZE as u64;

        for (handle, old_offset) in order {
            if plan.drop.contains(&handle) {
                continue;
            }
            if let Some(entry) = plan.replace.get(&handle) {
                let bytes = entry.to_bytes()?;
                crcs.push(entry.payload_crc()?);
                dst.write_all(&bytes)?;
                offsets.insert(handle, cursor);
                cursor += bytes.len() as u64;
            } else {
                let size = probe_block_size(&mut src, old_offset)?;
                src.seek(SeekFrom::Start(old_offset + 277))?;
                crcs.push(src.read_u32::<BigEndian>().map_err(TevdError::from_read)?);
                src.seek(SeekFrom::Start(old_offset))?;
                let copied = io::copy(&mut src.by_ref().take(size), &mut dst)?;
                if copied != size {
                    return Err(TevdError::Malformed("entry extends past end of archive"));
                }
                offsets.insert(handle, cursor);
                cursor += size;
            }
        }

        for entry in &plan.append {
            let bytes = entry.to_bytes()?;
            crcs.push(entry.payload_crc()?);
            dst.write_all(&bytes)?;
            offsets.insert(entry.handle, cursor);
            cursor += bytes.len() as u64;
        }

        let footer_position = cursor;
        dst.write_all(&self.footer)?;
        dst.flush()?;

        let crc = wire::archive_crc(&crcs);
        let mut file = dst
            .into_inner()
            .map_err(|e| TevdError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(CRC_FIELD_OFFSET))?;
        file.write_u32::<BigEndian>(crc)?;

        Ok(Staged {
            offsets,
            footer_position,
            crc,
        })
    }
}

/// Index state produced by a rewrite, installed only after the commit
/// succeeds.
struct Staged {
    offsets: HashMap<Handle, u64>,
    footer_position: u64,
    crc: u32,
}

// ── Parsing helpers ───────────────────────────────────────────────────────────

/// Read the kind-specific size prefix and return `(prefix_len,
/// trailing_len)`: bytes consumed and bytes still to skip.
fn payload_extent<R: Read>(kind: u8, reader: &mut R) -> Result<(u64, u64)> {
    match kind {
        0x01 => {
            let len = reader.read_uint::<BigEndian>(6).map_err(TevdError::from_read)?;
            Ok((6, len))
        }
        // Stored length, then the 6-byte uncompressed-size field, then the
        // stored bytes.
        0x11 => {
            let len = reader.read_uint::<BigEndian>(6).map_err(TevdError::from_read)?;
            Ok((6, len + 6))
        }
        0x02 => {
            let count = reader.read_u16::<BigEndian>().map_err(TevdError::from_read)?;
            Ok((2, 4 * count as u64))
        }
        0x03 => Ok((0, 4)),
        other => Err(TevdError::UnknownEntryKind(other)),
    }
}

/// Total serialized entry length at `offset`, probing only the kind byte
/// and size prefix.
fn probe_block_size<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<u64> {
    reader.seek(SeekFrom::Start(offset + 8))?;
    let kind = reader.read_u8().map_err(TevdError::from_read)?;
    reader.seek(SeekFrom::Current(272))?;
    let (prefix, trailing) = payload_extent(kind, reader)?;
    Ok(ENTRY_HEADER_SIZE as u64 + prefix + trailing)
}

fn missing_entry(handle: Handle) -> TevdError {
    TevdError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("entry {handle} not found"),
    ))
}
