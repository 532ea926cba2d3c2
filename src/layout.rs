//! Grain directory/table size computation and in-memory allocation.
//!
//! The directory and every grain table it points at are preallocated as one
//! zeroed block before any grain is written, and grain-table entries are
//! filled in as grains land. Because the parallel copy engine stores into
//! disjoint table entries from multiple threads, the tables are backed by
//! `AtomicU32` rather than a `Vec<u32>` behind a lock.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::byteorder::{get_u32_le, put_u32_le};
use crate::error::{Error, Result};
use crate::header::{Header, SECTOR_SIZE};

/// Derived geometry: table/directory sizes and last-grain bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub grain_size: u64,
    pub num_gtes_per_gt: u32,
    pub last_grain_nr: u64,
    pub last_grain_size_bytes: u32,
    pub gtes: u32,
    pub gts: u32,
    pub gd_sectors: u32,
    pub gt_sectors: u32,
}

impl Layout {
    pub fn from_header(header: &Header) -> Result<Self> {
        let grain_size = header.grain_size;
        let num_gtes_per_gt = header.num_gtes_per_gt;

        if grain_size == 0 || grain_size > 128 || !grain_size.is_power_of_two() {
            return Err(Error::invalid_geometry(format!(
                "grainSize {} must be a power of two in [1, 128]",
                grain_size
            )));
        }
        if num_gtes_per_gt < 128 || !num_gtes_per_gt.is_power_of_two() {
            return Err(Error::invalid_geometry(format!(
                "numGTEsPerGT {} must be a power of two >= 128",
                num_gtes_per_gt
            )));
        }

        let last_grain_nr = header.capacity / grain_size;
        // Preserved from the original: correct only because grain_size is a
        // power of two, so `& (grain_size - 1)` is equivalent to `% grain_size`.
        let last_grain_size_bytes = ((header.capacity & (grain_size - 1)) * SECTOR_SIZE) as u32;

        let gtes = last_grain_nr
            .checked_add(if last_grain_size_bytes != 0 { 1 } else { 0 })
            .ok_or_else(|| Error::invalid_geometry("GTEs overflowed u64"))?;
        let gtes: u32 = gtes
            .try_into()
            .map_err(|_| Error::invalid_geometry("GTEs overflowed u32"))?;

        let gts = gtes.div_ceil(num_gtes_per_gt);
        let gd_sectors = ceil_div_u32(gts.checked_mul(4).ok_or_else(|| {
            Error::invalid_geometry("grain directory size overflowed u32")
        })?, SECTOR_SIZE as u32);
        let gt_sectors = ceil_div_u32(
            num_gtes_per_gt
                .checked_mul(4)
                .ok_or_else(|| Error::invalid_geometry("grain table size overflowed u32"))?,
            SECTOR_SIZE as u32,
        );

        Ok(Self {
            grain_size,
            num_gtes_per_gt,
            last_grain_nr,
            last_grain_size_bytes,
            gtes,
            gts,
            gd_sectors,
            gt_sectors,
        })
    }

    pub fn grain_bytes(&self) -> u64 {
        self.grain_size * SECTOR_SIZE
    }

    /// Effective (post-trim) byte length of grain `grain_nr`, or `None` if
    /// `grain_nr` is beyond the end of the disk.
    pub fn effective_grain_len(&self, grain_nr: u64) -> Option<u32> {
        if grain_nr < self.last_grain_nr {
            Some(self.grain_bytes() as u32)
        } else if grain_nr == self.last_grain_nr && self.last_grain_size_bytes != 0 {
            Some(self.last_grain_size_bytes)
        } else {
            None
        }
    }

    /// Total size in sectors of the directory plus all grain tables.
    pub fn directory_sectors(&self) -> u64 {
        self.gd_sectors as u64 + self.gt_sectors as u64 * self.gts as u64
    }
}

fn ceil_div_u32(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// The preallocated, zero-initialized grain directory and its grain tables.
///
/// `gt` is stored flat: entry `j` of grain table `i` lives at
/// `i * num_gtes_per_gt + j`.
pub struct Directory {
    layout: Layout,
    gd: Vec<AtomicU32>,
    gt: Vec<AtomicU32>,
}

impl Directory {
    pub fn new(layout: Layout) -> Self {
        let gd = (0..layout.gts).map(|_| AtomicU32::new(0)).collect();
        let gt_len = layout.gts as usize * layout.num_gtes_per_gt as usize;
        let gt = (0..gt_len).map(|_| AtomicU32::new(0)).collect();
        Self { layout, gd, gt }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Writes `gd[i] = base_sector + i * gt_sectors` for every table; returns
    /// the first sector past the whole directory+tables block.
    pub fn prefill_directory(&self, base_sector: u64) -> u64 {
        for i in 0..self.gd.len() {
            let sector = base_sector + i as u64 * self.layout.gt_sectors as u64;
            self.gd[i].store(sector as u32, Ordering::Relaxed);
        }
        base_sector + self.layout.gts as u64 * self.layout.gt_sectors as u64
    }

    pub fn gt_entry(&self, grain_nr: u64) -> Option<&AtomicU32> {
        self.gt.get(grain_nr as usize)
    }

    pub fn gt_value(&self, grain_nr: u64) -> u32 {
        self.gt[grain_nr as usize].load(Ordering::Relaxed)
    }

    pub fn set_gt_value(&self, grain_nr: u64, sector: u32) {
        self.gt[grain_nr as usize].store(sector, Ordering::Relaxed);
    }

    pub fn gd_value(&self, table_nr: u64) -> u32 {
        self.gd[table_nr as usize].load(Ordering::Relaxed)
    }

    /// Serializes the directory followed by all grain tables, as one
    /// contiguous block ready to be written at `gdOffset*512`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.layout.directory_sectors() as usize * SECTOR_SIZE as usize];

        for (i, entry) in self.gd.iter().enumerate() {
            put_u32_le(&mut buf, i * 4, entry.load(Ordering::Relaxed));
        }

        let gt_base = self.layout.gd_sectors as usize * SECTOR_SIZE as usize;
        for (i, entry) in self.gt.iter().enumerate() {
            put_u32_le(&mut buf, gt_base + i * 4, entry.load(Ordering::Relaxed));
        }

        buf
    }

    /// Rebuilds a directory from an on-disk block previously produced by
    /// [`Directory::to_bytes`], used when opening an existing file for
    /// reading.
    pub fn from_bytes(layout: Layout, bytes: &[u8]) -> Result<Self> {
        let expected = layout.directory_sectors() as usize * SECTOR_SIZE as usize;
        if bytes.len() < expected {
            return Err(Error::invalid_geometry(format!(
                "directory block too short: expected {} bytes, got {}",
                expected,
                bytes.len()
            )));
        }

        let gd = (0..layout.gts as usize)
            .map(|i| AtomicU32::new(get_u32_le(bytes, i * 4)))
            .collect();

        let gt_base = layout.gd_sectors as usize * SECTOR_SIZE as usize;
        let gt_len = layout.gts as usize * layout.num_gtes_per_gt as usize;
        let gt = (0..gt_len)
            .map(|i| AtomicU32::new(get_u32_le(bytes, gt_base + i * 4)))
            .collect();

        Ok(Self { layout, gd, gt })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(capacity_sectors: u64) -> Header {
        let mut header = Header::for_new_disk(0);
        header.capacity = capacity_sectors;
        header
    }

    #[test]
    fn exact_multiple_of_grain_size_has_no_trailing_partial_grain() {
        let header = header_for(256); // 2 grains of 128 sectors
        let layout = Layout::from_header(&header).unwrap();
        assert_eq!(layout.last_grain_nr, 2);
        assert_eq!(layout.last_grain_size_bytes, 0);
        assert_eq!(layout.gtes, 2);
    }

    #[test]
    fn partial_last_grain_adds_one_gte() {
        let header = header_for(192); // 1.5 grains
        let layout = Layout::from_header(&header).unwrap();
        assert_eq!(layout.last_grain_nr, 1);
        assert_eq!(layout.last_grain_size_bytes, 64 * 512);
        assert_eq!(layout.gtes, 2);
        assert_eq!(layout.effective_grain_len(0), Some(128 * 512));
        assert_eq!(layout.effective_grain_len(1), Some(64 * 512));
        assert_eq!(layout.effective_grain_len(2), None);
    }

    #[test]
    fn rejects_non_power_of_two_grain_size() {
        let mut header = header_for(256);
        header.grain_size = 100;
        assert!(Layout::from_header(&header).is_err());
    }

    #[test]
    fn rejects_small_num_gtes_per_gt() {
        let mut header = header_for(256);
        header.num_gtes_per_gt = 64;
        assert!(Layout::from_header(&header).is_err());
    }

    #[test]
    fn prefill_directory_is_monotone_and_returns_next_sector() {
        let mut header = header_for(128 * 1200); // forces multiple GTs
        header.num_gtes_per_gt = 128;
        let layout = Layout::from_header(&header).unwrap();
        assert!(layout.gts > 1, "test needs multiple grain tables");

        let dir = Directory::new(layout);
        let next = dir.prefill_directory(10);
        for i in 0..layout.gts as u64 {
            assert_eq!(dir.gd_value(i), 10 + i * layout.gt_sectors as u64);
        }
        assert_eq!(next, 10 + layout.gts as u64 * layout.gt_sectors as u64);
    }

    #[test]
    fn roundtrips_through_bytes() {
        let header = header_for(256);
        let layout = Layout::from_header(&header).unwrap();
        let dir = Directory::new(layout);
        dir.prefill_directory(30);
        dir.set_gt_value(0, 99);
        dir.set_gt_value(1, 100);

        let bytes = dir.to_bytes();
        let restored = Directory::from_bytes(layout, &bytes).unwrap();
        assert_eq!(restored.gt_value(0), 99);
        assert_eq!(restored.gt_value(1), 100);
        assert_eq!(restored.gd_value(0), dir.gd_value(0));
    }
}
