//! The 512-byte sparse extent header: codec plus the flag/geometry rules
//! that decide whether a header is valid.

use crate::byteorder::{get_u16_le, get_u32_le, get_u64_le, put_u16_le, put_u32_le, put_u64_le};
use crate::error::{Error, Result};

pub const SECTOR_SIZE: u64 = 512;
pub const HEADER_SIZE: usize = 512;

/// `"VMDK"` as a little-endian u32, i.e. the on-disk bytes `K D M V`.
pub const MAGIC: u32 = 0x564D_444B;

/// Highest version this codec understands; also the version the writer
/// stamps on files it produces.
pub const MAX_VERSION: u32 = 3;

pub const FLAG_VALID_NEWLINE_DETECTOR: u32 = 1 << 0;
pub const FLAG_COMPRESSED: u32 = 1 << 16;
pub const FLAG_EMBEDDED_LBA: u32 = 1 << 17;

/// Flags 16-31 are the incompat range: a reader that doesn't recognize a set
/// bit there must refuse the file rather than silently mis-read it. Flags
/// 0-15 are compat and never block opening.
const INCOMPAT_MASK: u32 = 0xFFFF_0000;
const KNOWN_INCOMPAT_FLAGS: u32 = FLAG_COMPRESSED | FLAG_EMBEDDED_LBA;

pub const COMPRESS_ALGORITHM_DEFLATE: u16 = 1;

const NEWLINE_DETECTOR: [u8; 4] = [b'\n', b' ', b'\r', b'\n'];

/// Sentinel `gdOffset` meaning "the directory lives wherever the final
/// footer says it does" — unused by this writer (which always knows its
/// layout up front) but accepted when reading third-party files.
pub const GD_OFFSET_AT_END: u64 = 0xFFFF_FFFF_FFFF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub flags: u32,
    pub capacity: u64,
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    pub rgd_offset: u64,
    pub gd_offset: u64,
    pub overhead: u64,
    pub unclean_shutdown: u8,
    pub compress_algorithm: u16,
}

impl Header {
    /// Builds the header this crate's writer always produces: streamOptimized,
    /// DEFLATE-compressed, embedded-LBA, 128-sector grains, 512 GTEs/GT.
    pub fn for_new_disk(capacity_bytes: u64) -> Self {
        Self {
            version: MAX_VERSION,
            flags: FLAG_VALID_NEWLINE_DETECTOR | FLAG_COMPRESSED | FLAG_EMBEDDED_LBA,
            capacity: capacity_bytes.div_ceil(SECTOR_SIZE),
            grain_size: 128,
            descriptor_offset: 0,
            descriptor_size: 20,
            num_gtes_per_gt: 512,
            rgd_offset: 0,
            gd_offset: 0,
            overhead: 0,
            unclean_shutdown: 0,
            compress_algorithm: COMPRESS_ALGORITHM_DEFLATE,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn is_embedded_lba(&self) -> bool {
        self.flags & FLAG_EMBEDDED_LBA != 0
    }

    pub fn has_valid_newline_detector_flag(&self) -> bool {
        self.flags & FLAG_VALID_NEWLINE_DETECTOR != 0
    }

    /// Parses and validates a 512-byte on-disk header.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::invalid_header("header shorter than 512 bytes"));
        }

        let magic = get_u32_le(bytes, 0);
        if magic != MAGIC {
            return Err(Error::invalid_header(format!(
                "bad magic: expected 0x{:08X}, got 0x{:08X}",
                MAGIC, magic
            )));
        }

        let version = get_u32_le(bytes, 4);
        if version > MAX_VERSION {
            return Err(Error::invalid_header(format!(
                "unsupported version {} (max {})",
                version, MAX_VERSION
            )));
        }

        let flags = get_u32_le(bytes, 8);
        if flags & INCOMPAT_MASK & !KNOWN_INCOMPAT_FLAGS != 0 {
            return Err(Error::invalid_header(format!(
                "unrecognized incompat flags in 0x{:08X}",
                flags
            )));
        }
        if flags & FLAG_VALID_NEWLINE_DETECTOR != 0 {
            let detector = [bytes[73], bytes[74], bytes[75], bytes[76]];
            if detector != NEWLINE_DETECTOR {
                return Err(Error::invalid_header("newline detector bytes mismatch"));
            }
        }
        if flags & FLAG_EMBEDDED_LBA != 0 && flags & FLAG_COMPRESSED == 0 {
            return Err(Error::invalid_header(
                "EMBEDDED_LBA set without COMPRESSED",
            ));
        }

        Ok(Self {
            version,
            flags,
            capacity: get_u64_le(bytes, 12),
            grain_size: get_u64_le(bytes, 20),
            descriptor_offset: get_u64_le(bytes, 28),
            descriptor_size: get_u64_le(bytes, 36),
            num_gtes_per_gt: get_u32_le(bytes, 44),
            rgd_offset: get_u64_le(bytes, 48),
            gd_offset: get_u64_le(bytes, 56),
            overhead: get_u64_le(bytes, 64),
            unclean_shutdown: bytes[72],
            compress_algorithm: get_u16_le(bytes, 77),
        })
    }

    /// Serializes to exactly 512 bytes. `provisional` selects the lowercase
    /// ("vmdk") vs. uppercase ("VMDK") magic used for the two-phase commit.
    pub fn to_bytes(&self, provisional: bool) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        let magic = if provisional { MAGIC ^ 0x2020_2020 } else { MAGIC };
        put_u32_le(&mut buf, 0, magic);
        put_u32_le(&mut buf, 4, self.version);
        put_u32_le(&mut buf, 8, self.flags);
        put_u64_le(&mut buf, 12, self.capacity);
        put_u64_le(&mut buf, 20, self.grain_size);
        put_u64_le(&mut buf, 28, self.descriptor_offset);
        put_u64_le(&mut buf, 36, self.descriptor_size);
        put_u32_le(&mut buf, 44, self.num_gtes_per_gt);
        put_u64_le(&mut buf, 48, self.rgd_offset);
        put_u64_le(&mut buf, 56, self.gd_offset);
        put_u64_le(&mut buf, 64, self.overhead);
        buf[72] = self.unclean_shutdown;
        buf[73] = NEWLINE_DETECTOR[0];
        buf[74] = NEWLINE_DETECTOR[1];
        buf[75] = NEWLINE_DETECTOR[2];
        buf[76] = NEWLINE_DETECTOR[3];
        put_u16_le(&mut buf, 77, self.compress_algorithm);

        buf
    }
}
