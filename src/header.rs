use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Result, TevdError};
use crate::wire::{self, MAX_U48};

pub const MAGIC: &[u8; 4] = b"TEVd";
pub const SPEC_VERSION: u8 = 0x03;

/// magic(4) capacity(6) disk_name(32) archive-crc(4) version(1).
pub const HEADER_SIZE: usize = 47;
pub const DISK_NAME_LEN: usize = 32;
/// Byte offset of the archive CRC field, for patching in place.
pub const CRC_FIELD_OFFSET: u64 = 42;

/// Terminates the entry stream; doubles as a reserved handle value.
pub const FOOTER_SENTINEL: u32 = 0xFEFE_FEFE;
pub const EOF_MARK: [u8; 2] = [0xFF, 0x19];
/// Sentinel plus EOF mark.
pub const FOOTER_FRAMING_SIZE: usize = 6;

#[derive(Debug, Clone)]
pub struct DiskHeader {
    /// 48-bit byte count; zero marks the whole archive read-only.
    pub capacity: u64,
    /// Raw unpadded disk name, at most 32 bytes.
    pub disk_name: Vec<u8>,
    /// CRC-32 over the sorted per-entry CRCs.
    pub crc: u32,
}

impl DiskHeader {
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_uint::<BigEndian>(self.capacity & MAX_U48, 6)?;
        writer.write_all(&wire::pad_name(&self.disk_name, DISK_NAME_LEN))?;
        writer.write_u32::<BigEndian>(self.crc)?;
        writer.write_u8(SPEC_VERSION)?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(TevdError::from_read)?;
        if &magic != MAGIC {
            return Err(TevdError::BadMagic);
        }
        let capacity = reader.read_uint::<BigEndian>(6).map_err(TevdError::from_read)?;
        let mut name_field = [0u8; DISK_NAME_LEN];
        reader.read_exact(&mut name_field).map_err(TevdError::from_read)?;
        let crc = reader.read_u32::<BigEndian>().map_err(TevdError::from_read)?;
        let version = reader.read_u8().map_err(TevdError::from_read)?;
        if version != SPEC_VERSION {
            return Err(TevdError::Malformed("unsupported spec version"));
        }
        Ok(Self {
            capacity,
            disk_name: wire::unpad_name(&name_field).to_vec(),
            crc,
        })
    }
}
