//! The streamOptimized reader: random-offset decode and sparse-region
//! enumeration over an already-closed file.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::byteorder::{get_u32_le, get_u64_le};
use crate::error::{Error, Result};
use crate::grain::GrainDecompressor;
use crate::header::{Header, SECTOR_SIZE};
use crate::layout::{Directory, Layout};
use crate::pread_source::{CoalescedPreader, PreadSource};

/// Grain-table value meaning "not present".
const GTE_UNALLOCATED: u32 = 0;
/// Grain-table value meaning "present as all-zero" (no frame on disk).
const GTE_ZERO: u32 = 1;

/// Opens a streamOptimized sparse VMDK file for random-offset reads and
/// allocated-region enumeration.
pub struct Reader {
    file: File,
    path: PathBuf,
    header: Header,
    layout: Layout,
    directory: Directory,
    decompressor: GrainDecompressor,
    /// One grain plus a sector, matching the original's `readBuf` sizing: a
    /// compressed frame's header plus payload can spill one sector past the
    /// grain's own uncompressed size before `cmpSize` is bounds-checked.
    read_buf: Vec<u8>,
}

impl Reader {
    /// Opens `path`, validates its header, and loads the grain directory and
    /// every grain table it points at — coalescing adjacent table reads into
    /// as few `pread` syscalls as the on-disk layout allows.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::io_read(e, path.clone()))?;

        let mut header_bytes = [0u8; 512];
        file.pread_exact(&mut header_bytes, 0)?;
        let header = Header::parse(&header_bytes)?;
        let layout = Layout::from_header(&header)?;

        let mut dir_bytes = vec![0u8; layout.directory_sectors() as usize * SECTOR_SIZE as usize];
        let gd_base = header.gd_offset * SECTOR_SIZE;
        file.pread_exact(
            &mut dir_bytes[..layout.gd_sectors as usize * SECTOR_SIZE as usize],
            gd_base,
        )?;
        let directory = Directory::from_bytes(layout, &dir_bytes)?;

        let gt_base_offset = layout.gd_sectors as usize * SECTOR_SIZE as usize;
        let gt_table_bytes = layout.gt_sectors as usize * SECTOR_SIZE as usize;
        {
            let mut coalescer = CoalescedPreader::new(&file);
            for i in 0..layout.gts as u64 {
                let sector = directory.gd_value(i);
                if sector == 0 {
                    continue;
                }
                let dst_offset = gt_base_offset + i as usize * gt_table_bytes;
                coalescer.append(
                    &mut dir_bytes,
                    dst_offset,
                    gt_table_bytes,
                    sector as u64 * SECTOR_SIZE,
                )?;
            }
            coalescer.flush(&mut dir_bytes)?;
        }
        let directory = Directory::from_bytes(layout, &dir_bytes)?;

        let read_buf_sectors = layout.grain_size + 1;
        Ok(Self {
            file,
            path,
            header,
            layout,
            directory,
            decompressor: GrainDecompressor::new(),
            read_buf: vec![0u8; read_buf_sectors as usize * SECTOR_SIZE as usize],
        })
    }

    /// Logical capacity of the virtual disk, in bytes.
    pub fn capacity(&self) -> u64 {
        self.header.capacity * SECTOR_SIZE
    }

    /// Advances `(pos, end)` to describe the next non-hole run at or after
    /// `end`: the smallest `[pos, end)` covering a contiguous run of
    /// allocated grains, preserving any sub-grain offset on the first grain.
    /// Fails with [`Error::NoMoreData`] if no allocated grain remains.
    pub fn next_data(&self, _pos: u64, end: u64) -> Result<(u64, u64)> {
        let grain_bytes = self.layout.grain_bytes();
        let mut grain_nr = end / grain_bytes;

        while grain_nr < self.layout.gtes as u64 && self.directory.gt_value(grain_nr) == GTE_UNALLOCATED {
            grain_nr += 1;
        }
        if grain_nr >= self.layout.gtes as u64 {
            return Err(Error::NoMoreData);
        }

        let new_pos = if grain_nr == end / grain_bytes {
            grain_nr * grain_bytes + (end % grain_bytes)
        } else {
            grain_nr * grain_bytes
        };

        let mut new_end;
        loop {
            grain_nr += 1;
            if grain_nr >= self.layout.gtes as u64 {
                new_end = self.layout.last_grain_nr * grain_bytes
                    + self.layout.last_grain_size_bytes as u64;
                break;
            }
            if self.directory.gt_value(grain_nr) == GTE_UNALLOCATED {
                new_end = grain_nr * grain_bytes;
                break;
            }
        }

        Ok((new_pos, new_end))
    }

    /// Reads `len` bytes starting at byte offset `pos` into `buf[..len]`,
    /// decoding (or zero-filling) one grain at a time.
    pub fn pread(&mut self, buf: &mut [u8], len: usize, pos: u64) -> Result<usize> {
        let grain_bytes = self.layout.grain_bytes();
        let mut remaining = len;
        let mut cur_pos = pos;
        let mut written = 0usize;

        while remaining > 0 {
            let grain_nr = cur_pos / grain_bytes;

            // Past the last grain of the disk, or past the trailing partial
            // grain's effective length: the original's SparsePread just
            // breaks out of its read loop here and returns the partial byte
            // count already written, it does not fail the whole read.
            let effective_len = match self.layout.effective_grain_len(grain_nr) {
                Some(len) => len as usize,
                None => break,
            };
            let in_grain_offset = (cur_pos % grain_bytes) as usize;
            if in_grain_offset >= effective_len {
                break;
            }

            let read_len = (effective_len - in_grain_offset).min(remaining);
            let dst = &mut buf[written..written + read_len];

            let sector = self.directory.gt_value(grain_nr);
            if sector == GTE_UNALLOCATED || sector == GTE_ZERO {
                dst.iter_mut().for_each(|b| *b = 0);
            } else if self.header.is_compressed() {
                self.read_compressed_grain(sector as u64, grain_nr, effective_len)?;
                dst.copy_from_slice(&self.read_buf[in_grain_offset..in_grain_offset + read_len]);
            } else {
                let file_pos = sector as u64 * SECTOR_SIZE + in_grain_offset as u64;
                self.file.pread_exact(dst, file_pos)?;
            }

            written += read_len;
            remaining -= read_len;
            cur_pos += read_len as u64;
        }

        Ok(written)
    }

    /// Reads and inflates the compressed frame for `grain_nr` at `sector`
    /// into `self.read_buf[..effective_len]`, validating the embedded LBA
    /// when the file carries one.
    fn read_compressed_grain(&mut self, sector: u64, grain_nr: u64, effective_len: usize) -> Result<()> {
        let hdr_len = if self.header.is_embedded_lba() { 12 } else { 4 };

        let mut head = [0u8; SECTOR_SIZE as usize];
        self.file.pread_exact(&mut head, sector * SECTOR_SIZE)?;

        let cmp_size = if self.header.is_embedded_lba() {
            let lba = get_u64_le(&head, 0);
            if lba != grain_nr * self.layout.grain_size {
                return Err(Error::frame_corrupt(format!(
                    "embedded LBA mismatch: frame claims grain {}, expected {}",
                    lba / self.layout.grain_size.max(1),
                    grain_nr
                )));
            }
            get_u32_le(&head, 8) as usize
        } else {
            get_u32_le(&head, 0) as usize
        };

        if cmp_size + hdr_len > self.read_buf.len() {
            return Err(Error::frame_corrupt(format!(
                "compressed size {} exceeds reader scratch capacity",
                cmp_size
            )));
        }

        let total_frame_bytes = hdr_len + cmp_size;
        let compressed = if total_frame_bytes <= head.len() {
            head[hdr_len..hdr_len + cmp_size].to_vec()
        } else {
            let tail_start = head.len();
            let tail_sectors_end = round_up_sector(total_frame_bytes);
            let mut tail = vec![0u8; tail_sectors_end - tail_start];
            self.file
                .pread_exact(&mut tail, sector * SECTOR_SIZE + tail_start as u64)?;
            let mut compressed = Vec::with_capacity(cmp_size);
            compressed.extend_from_slice(&head[hdr_len..]);
            compressed.extend_from_slice(&tail);
            compressed.truncate(cmp_size);
            compressed
        };

        let mut out = std::mem::take(&mut self.read_buf);
        let result = self.decompressor.inflate(&compressed, &mut out, effective_len);
        self.read_buf = out;
        result.map(|_| ())
    }

    /// Closes the reader, releasing its file descriptor.
    pub fn close(self) -> Result<()> {
        drop(self.file);
        Ok(())
    }
}

fn round_up_sector(n: usize) -> usize {
    let sector = SECTOR_SIZE as usize;
    (n + sector - 1) / sector * sector
}
