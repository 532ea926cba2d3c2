//! Per-grain compression/decompression and the sequential writer's
//! scratch-buffer state machine (fill/flush).

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::byteorder::{get_u32_le, get_u64_le, put_u32_le, put_u64_le};
use crate::error::{Error, Result};
use crate::header::SECTOR_SIZE;
use crate::layout::{Directory, Layout};

/// Bytes of the embedded-LBA header prefixed to every compressed grain frame:
/// `lba: u64` then `cmpSize: u32`.
pub const FRAME_HEADER_LEN: usize = 12;

pub const GRAIN_MARKER_EOS: u32 = 0;

/// Computes an upper bound on the compressed size of `len` bytes of input,
/// the way zlib's `deflateBound` does. `flate2` does not expose that
/// function directly, so this mirrors its published formula.
pub fn deflate_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

fn round_up_to_sector(n: usize) -> usize {
    let sector = SECTOR_SIZE as usize;
    (n + sector - 1) / sector * sector
}

/// A persistent, resettable raw-deflate encoder for one writer session.
///
/// Reused across every grain rather than rebuilt, since the scratch buffer
/// sizing and the reset-between-grains behavior both assume one long-lived
/// stream.
pub struct GrainCompressor {
    compress: Compress,
    output: Vec<u8>,
    level: u32,
}

impl GrainCompressor {
    pub fn new(level: u32, grain_bytes: usize) -> Self {
        let capacity = round_up_to_sector(deflate_bound(grain_bytes) + FRAME_HEADER_LEN);
        Self {
            compress: Compress::new(Compression::new(level), false),
            output: vec![0u8; capacity],
            level,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Compresses `grain` into a full on-disk frame: 12-byte LBA header
    /// followed by the raw deflate stream, zero-padded to a sector boundary.
    /// Returns the number of bytes actually used (header + compressed data,
    /// pre-padding), callers round that up to sectors themselves via
    /// [`Self::frame_sectors`].
    pub fn compress_frame(&mut self, grain: &[u8], lba: u64) -> Result<usize> {
        self.compress
            .reset();

        self.output.iter_mut().for_each(|b| *b = 0);
        let before_in = self.compress.total_in();
        let before_out = self.compress.total_out();

        let status = self
            .compress
            .compress(
                grain,
                &mut self.output[FRAME_HEADER_LEN..],
                FlushCompress::Finish,
            )
            .map_err(|e| Error::codec_failure(format!("deflate failed: {}", e)))?;

        if status != Status::StreamEnd {
            return Err(Error::codec_failure(
                "deflate did not reach stream end within the reserved output buffer",
            ));
        }

        let consumed_in = (self.compress.total_in() - before_in) as usize;
        if consumed_in != grain.len() {
            return Err(Error::codec_failure(
                "deflate did not consume the entire grain",
            ));
        }
        let produced = (self.compress.total_out() - before_out) as usize;

        put_u64_le(&mut self.output, 0, lba);
        put_u32_le(&mut self.output, 8, produced as u32);

        Ok(FRAME_HEADER_LEN + produced)
    }

    /// Sector-aligned length of the frame currently in [`Self::output`].
    pub fn frame_sectors(&self, used_len: usize) -> usize {
        round_up_to_sector(used_len)
    }

    pub fn frame_bytes(&self, used_len: usize) -> &[u8] {
        &self.output[..self.frame_sectors(used_len)]
    }
}

/// A persistent, resettable raw-deflate decoder for one reader session.
pub struct GrainDecompressor {
    decompress: Decompress,
}

impl GrainDecompressor {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(false),
        }
    }

    /// Inflates `compressed` into `out`, requiring the result to fill at
    /// least `min_len` bytes of `out`.
    pub fn inflate(&mut self, compressed: &[u8], out: &mut [u8], min_len: usize) -> Result<usize> {
        self.decompress.reset(false);
        let before_out = self.decompress.total_out();

        let status = self
            .decompress
            .decompress(compressed, out, FlushDecompress::Finish)
            .map_err(|e| Error::codec_failure(format!("inflate failed: {}", e)))?;

        let produced = (self.decompress.total_out() - before_out) as usize;
        if status != Status::StreamEnd && produced < min_len {
            return Err(Error::codec_failure(
                "inflate ended before reaching the expected grain length",
            ));
        }
        if produced < min_len {
            return Err(Error::codec_failure(format!(
                "inflated {} bytes, expected at least {}",
                produced, min_len
            )));
        }

        Ok(produced)
    }
}

impl Default for GrainDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a 12-byte embedded-LBA grain frame header.
pub fn parse_frame_header(bytes: &[u8]) -> (u64, u32) {
    (get_u64_le(bytes, 0), get_u32_le(bytes, 8))
}

/// The sequential writer's one-grain scratch buffer: tracks which grain it
/// currently holds and which byte range within it has been written.
pub struct GrainBuffer {
    data: Vec<u8>,
    /// Grain number the buffer holds, or `None` if empty.
    grain_nr: Option<u64>,
    valid_start: usize,
    valid_end: usize,
}

impl GrainBuffer {
    pub fn new(grain_bytes: usize) -> Self {
        Self {
            data: vec![0u8; grain_bytes],
            grain_nr: None,
            valid_start: 0,
            valid_end: 0,
        }
    }

    pub fn grain_nr(&self) -> Option<u64> {
        self.grain_nr
    }

    pub fn has_pending_data(&self) -> bool {
        self.grain_nr.is_some() && self.valid_end != 0
    }

    /// Discards any buffered content and starts tracking `grain_nr`.
    pub fn reset_to(&mut self, grain_nr: u64) {
        self.grain_nr = Some(grain_nr);
        self.valid_start = 0;
        self.valid_end = 0;
    }

    /// Copies `src` into the buffer at `offset`, extending the valid range
    /// to the union of the existing range and `[offset, offset+src.len())`.
    /// Callers must call [`Self::fill`] first if the new range is disjoint
    /// from the existing one, per the writer's buffering rules.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        self.data[offset..offset + src.len()].copy_from_slice(src);
        if self.valid_end == self.valid_start {
            self.valid_start = offset;
            self.valid_end = offset + src.len();
        } else {
            self.valid_start = self.valid_start.min(offset);
            self.valid_end = self.valid_end.max(offset + src.len());
        }
    }

    pub fn is_range_disjoint(&self, update_start: usize, update_end: usize) -> bool {
        self.valid_end != self.valid_start
            && (update_end < self.valid_start || update_start > self.valid_end)
    }

    /// Zero-fills the holes around the valid range so the whole
    /// `effective_len` bytes are well-defined, then marks the whole range
    /// valid. Checks that the grain's table entry is still unwritten.
    pub fn fill(&mut self, directory: &Directory, effective_len: usize) -> Result<()> {
        let grain_nr = self.grain_nr.expect("fill called with no grain loaded");

        if directory.gt_value(grain_nr) != 0 {
            return Err(Error::overwrite_forbidden(grain_nr));
        }

        if self.valid_end == self.valid_start {
            self.data[..effective_len].iter_mut().for_each(|b| *b = 0);
        } else {
            self.data[..self.valid_start].iter_mut().for_each(|b| *b = 0);
            self.data[self.valid_end..effective_len]
                .iter_mut()
                .for_each(|b| *b = 0);
        }
        self.valid_start = 0;
        self.valid_end = effective_len;
        Ok(())
    }

    pub fn is_all_zero(&self, len: usize) -> bool {
        // The original checks 8 bytes at a time; chunking by u64 here gets
        // the same effect and lets the compiler vectorize the comparison.
        self.data[..len]
            .chunks(8)
            .all(|chunk| chunk.iter().all(|&b| b == 0))
    }

    pub fn data(&self, len: usize) -> &[u8] {
        &self.data[..len]
    }
}

/// Resolves the bookkeeping a grain-touching write needs: the effective
/// on-disk length of `grain_nr`, failing if it is past the end of the disk.
pub fn effective_len_or_out_of_range(layout: &Layout, grain_nr: u64) -> Result<usize> {
    layout
        .effective_grain_len(grain_nr)
        .map(|len| len as usize)
        .ok_or_else(|| {
            Error::out_of_range(format!(
                "grain {} is beyond the last grain of the disk",
                grain_nr
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;

    #[test]
    fn compress_then_inflate_roundtrips() {
        let grain = vec![0xAB; 64 * 1024];
        let mut compressor = GrainCompressor::new(6, grain.len());
        let used = compressor.compress_frame(&grain, 42).unwrap();
        let frame = compressor.frame_bytes(used).to_vec();

        let (lba, cmp_size) = parse_frame_header(&frame);
        assert_eq!(lba, 42);

        let mut decompressor = GrainDecompressor::new();
        let mut out = vec![0u8; grain.len()];
        let produced = decompressor
            .inflate(
                &frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + cmp_size as usize],
                &mut out,
                grain.len(),
            )
            .unwrap();
        assert_eq!(produced, grain.len());
        assert_eq!(out, grain);
    }

    #[test]
    fn frame_is_sector_aligned() {
        let grain = vec![0u8; 64 * 1024];
        let mut compressor = GrainCompressor::new(6, grain.len());
        let used = compressor.compress_frame(&grain, 0).unwrap();
        assert_eq!(compressor.frame_sectors(used) % SECTOR_SIZE as usize, 0);
    }

    #[test]
    fn buffer_fill_rejects_already_written_grain() {
        let mut header = Header::for_new_disk(0);
        header.capacity = 256;
        let layout = Layout::from_header(&header).unwrap();
        let directory = Directory::new(layout);
        directory.set_gt_value(0, 99);

        let mut buffer = GrainBuffer::new(layout.grain_bytes() as usize);
        buffer.reset_to(0);
        buffer.write_at(0, b"hi");

        assert!(matches!(
            buffer.fill(&directory, layout.grain_bytes() as usize),
            Err(Error::OverwriteForbidden { grain: 0 })
        ));
    }

    #[test]
    fn buffer_fill_zeroes_the_gaps() {
        let mut header = Header::for_new_disk(0);
        header.capacity = 256;
        let layout = Layout::from_header(&header).unwrap();
        let directory = Directory::new(layout);

        let mut buffer = GrainBuffer::new(layout.grain_bytes() as usize);
        buffer.reset_to(0);
        buffer.write_at(10, &[1, 2, 3]);
        buffer.fill(&directory, layout.grain_bytes() as usize).unwrap();

        let data = buffer.data(layout.grain_bytes() as usize);
        assert!(data[..10].iter().all(|&b| b == 0));
        assert_eq!(&data[10..13], &[1, 2, 3]);
        assert!(data[13..].iter().all(|&b| b == 0));
    }

    #[test]
    fn is_all_zero_detects_nonzero_tail() {
        let mut buffer = GrainBuffer::new(16);
        buffer.reset_to(0);
        assert!(buffer.is_all_zero(16));
        buffer.write_at(15, &[1]);
        assert!(!buffer.is_all_zero(16));
    }
}
