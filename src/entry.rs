use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::io::{Read, Write};

use crate::error::{Result, TevdError};
use crate::wire::{self, MAX_U48};

/// Signed 32-bit entry identifier.  Compared as an unsigned bit pattern
/// internally; signed only at the API boundary.
pub type Handle = i32;

/// Handle 0 is always the root directory.
pub const ROOT_HANDLE: Handle = 0;
/// Bit pattern reserved for the footer sentinel; never assigned.
pub const RESERVED_HANDLE: u32 = 0xFEFE_FEFE;

/// Fixed entry header: handle(4) parent(4) kind(1) name(256)
/// created(6) modified(6) crc(4).
pub const ENTRY_HEADER_SIZE: usize = 281;
pub const NAME_LEN: usize = 256;
pub const MAX_CHILDREN: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File = 0x01,
    Directory = 0x02,
    Symlink = 0x03,
    CompressedFile = 0x11,
}

impl EntryKind {
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(EntryKind::File),
            0x02 => Ok(EntryKind::Directory),
            0x03 => Ok(EntryKind::Symlink),
            0x11 => Ok(EntryKind::CompressedFile),
            other => Err(TevdError::UnknownEntryKind(other)),
        }
    }
}

/// The four payload kinds are a closed set; dispatch is a single match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    File(Vec<u8>),
    CompressedFile { stored: Vec<u8>, uncompressed_len: u64 },
    Directory(Vec<Handle>),
    Symlink(Handle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub handle: Handle,
    pub parent: Handle,
    /// Raw unpadded name bytes; rendering is the caller's concern.
    pub name: Vec<u8>,
    /// 48-bit seconds, epoch-agnostic; round-tripped verbatim.
    pub created_at: u64,
    pub modified_at: u64,
    pub payload: Payload,
}

impl Entry {
    pub fn file(handle: Handle, parent: Handle, name: &[u8], data: Vec<u8>, now: u64) -> Self {
        Self {
            handle,
            parent,
            name: name.to_vec(),
            created_at: now,
            modified_at: now,
            payload: Payload::File(data),
        }
    }

    pub fn directory(handle: Handle, parent: Handle, name: &[u8], now: u64) -> Self {
        Self {
            handle,
            parent,
            name: name.to_vec(),
            created_at: now,
            modified_at: now,
            payload: Payload::Directory(Vec::new()),
        }
    }

    pub fn symlink(handle: Handle, parent: Handle, name: &[u8], target: Handle, now: u64) -> Self {
        Self {
            handle,
            parent,
            name: name.to_vec(),
            created_at: now,
            modified_at: now,
            payload: Payload::Symlink(target),
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self.payload {
            Payload::File(_) => EntryKind::File,
            Payload::CompressedFile { .. } => EntryKind::CompressedFile,
            Payload::Directory(_) => EntryKind::Directory,
            Payload::Symlink(_) => EntryKind::Symlink,
        }
    }

    /// Total on-disk length, header included.
    pub fn serialized_size(&self) -> u64 {
        let payload = match &self.payload {
            Payload::File(data) => 6 + data.len() as u64,
            Payload::CompressedFile { stored, .. } => 12 + stored.len() as u64,
            Payload::Directory(children) => 2 + 4 * children.len() as u64,
            Payload::Symlink(_) => 4,
        };
        ENTRY_HEADER_SIZE as u64 + payload
    }

    /// Serialize the kind-dependent payload region, length fields included.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match &self.payload {
            Payload::File(data) => {
                if data.len() as u64 > MAX_U48 {
                    return Err(TevdError::PayloadTooLarge);
                }
                out.extend_from_slice(&wire::u48_to_be(data.len() as u64));
                out.extend_from_slice(data);
            }
            Payload::CompressedFile { stored, uncompressed_len } => {
                if stored.len() as u64 > MAX_U48 || *uncompressed_len > MAX_U48 {
                    return Err(TevdError::PayloadTooLarge);
                }
                out.extend_from_slice(&wire::u48_to_be(stored.len() as u64));
                out.extend_from_slice(&wire::u48_to_be(*uncompressed_len));
                out.extend_from_slice(stored);
            }
            Payload::Directory(children) => {
                if children.len() > MAX_CHILDREN {
                    return Err(TevdError::DirectoryFull);
                }
                out.extend_from_slice(&(children.len() as u16).to_be_bytes());
                for child in children {
                    out.extend_from_slice(&child.to_be_bytes());
                }
            }
            Payload::Symlink(target) => {
                out.extend_from_slice(&target.to_be_bytes());
            }
        }
        Ok(out)
    }

    /// CRC-32 over the serialized payload region.
    pub fn payload_crc(&self) -> Result<u32> {
        Ok(wire::crc_of(&self.payload_bytes()?))
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let payload = self.payload_bytes()?;
        let crc = wire::crc_of(&payload);
        writer.write_i32::<BigEndian>(self.handle)?;
        writer.write_i32::<BigEndian>(self.parent)?;
        writer.write_u8(self.kind().byte())?;
        writer.write_all(&wire::pad_name(&self.name, NAME_LEN))?;
        writer.write_uint::<BigEndian>(self.created_at & MAX_U48, 6)?;
        writer.write_uint::<BigEndian>(self.modified_at & MAX_U48, 6)?;
        writer.write_u32::<BigEndian>(crc)?;
        writer.write_all(&payload)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.serialized_size() as usize);
        self.write(&mut out)?;
        Ok(out)
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let handle = reader.read_i32::<BigEndian>().map_err(TevdError::from_read)?;
        Self::read_after_handle(handle, reader)
    }

    /// Parse an entry whose 4-byte handle has already been consumed (the
    /// skimmer reads the handle to test for the footer sentinel).
    pub fn read_after_handle<R: Read>(handle: Handle, reader: &mut R) -> Result<Self> {
        let parent = reader.read_i32::<BigEndian>().map_err(TevdError::from_read)?;
        let kind = EntryKind::from_byte(reader.read_u8().map_err(TevdError::from_read)?)?;

        let mut name_field = [0u8; NAME_LEN];
        reader.read_exact(&mut name_field).map_err(TevdError::from_read)?;
        let name = wire::unpad_name(&name_field).to_vec();

        let created_at = reader.read_uint::<BigEndian>(6).map_err(TevdError::from_read)?;
        let modified_at = reader.read_uint::<BigEndian>(6).map_err(TevdError::from_read)?;
        let stored_crc = reader.read_u32::<BigEndian>().map_err(TevdError::from_read)?;

        let mut hasher = Hasher::new();
        let payload = match kind {
            EntryKind::File => {
                let mut len_field = [0u8; 6];
                reader.read_exact(&mut len_field).map_err(TevdError::from_read)?;
                hasher.update(&len_field);
                let mut data = vec![0u8; wire::u48_from_be(&len_field) as usize];
                reader.read_exact(&mut data).map_err(TevdError::from_read)?;
                hasher.update(&data);
                Payload::File(data)
            }
            EntryKind::CompressedFile => {
                let mut len_field = [0u8; 6];
                reader.read_exact(&mut len_field).map_err(TevdError::from_read)?;
                hasher.update(&len_field);
                let stored_len = wire::u48_from_be(&len_field);
                let mut unc_field = [0u8; 6];
                reader.read_exact(&mut unc_field).map_err(TevdError::from_read)?;
                hasher.update(&unc_field);
                let mut stored = vec![0u8; stored_len as usize];
                reader.read_exact(&mut stored).map_err(TevdError::from_read)?;
                hasher.update(&stored);
                Payload::CompressedFile {
                    stored,
                    uncompressed_len: wire::u48_from_be(&unc_field),
                }
            }
            EntryKind::Directory => {
                let mut count_field = [0u8; 2];
                reader.read_exact(&mut count_field).map_err(TevdError::from_read)?;
                hasher.update(&count_field);
                let count = u16::from_be_bytes(count_field) as usize;
                let mut raw = vec![0u8; count * 4];
                reader.read_exact(&mut raw).map_err(TevdError::from_read)?;
                hasher.update(&raw);
                let children = raw
                    .chunks_exact(4)
                    .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Payload::Directory(children)
            }
            EntryKind::Symlink => {
                let mut target_field = [0u8; 4];
                reader.read_exact(&mut target_field).map_err(TevdError::from_read)?;
                hasher.update(&target_field);
                Payload::Symlink(i32::from_be_bytes(target_field))
            }
        };

        if hasher.finalize() != stored_crc {
            return Err(TevdError::EntryCorrupt(handle));
        }

        Ok(Self {
            handle,
            parent,
            name,
            created_at,
            modified_at,
            payload,
        })
    }
}
