//! Integration tests for the streamOptimized writer/reader pair: full
//! round-trips through an on-disk file, last-grain trimming, and the
//! parallel copy engine.

use svmdk::error::Error;
use svmdk::pread_source::SourceDisk;
use svmdk::reader::Reader;
use svmdk::writer::Writer;
use tempfile::NamedTempFile;

const GRAIN_BYTES: u64 = 128 * 512;

/// A tiny splitmix64-derived byte source, so tests can compare a source disk
/// against what the writer/reader pair round-trips without depending on
/// external randomness.
fn pseudo_random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed ^ 0x9E37_79B9_7F4A_7C15;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        out.extend_from_slice(&z.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[test]
fn random_buffer_round_trips_exactly() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    let capacity = 2 * 1024 * 1024;
    let data = pseudo_random_bytes(100, capacity);

    let mut writer = Writer::create_with_seed(&path, capacity as u64, 6, 100).unwrap();
    writer.pwrite_at(&data, 0).unwrap();
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let mut out = vec![0u8; capacity];
    reader.pread(&mut out, capacity, 0).unwrap();
    assert_eq!(out, data);
}

#[test]
fn all_zero_buffer_elides_every_grain() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    let capacity = 1024 * 1024;

    let mut writer = Writer::create_with_seed(&path, capacity, 6, 101).unwrap();
    writer.pwrite_at(&vec![0u8; capacity as usize], 0).unwrap();
    writer.close().unwrap();

    let reader = Reader::open(&path).unwrap();
    assert!(matches!(reader.next_data(0, 0), Err(Error::NoMoreData)));
}

#[test]
fn last_grain_is_trimmed_to_its_effective_size() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    // 1.5 grains: the trailing half-grain's effective length is 32 KiB, not
    // a full 64 KiB grain.
    let capacity = GRAIN_BYTES + GRAIN_BYTES / 2;

    let mut writer = Writer::create_with_seed(&path, capacity, 6, 102).unwrap();
    writer.pwrite_at(&vec![0xAAu8; capacity as usize], 0).unwrap();

    let err = writer.pwrite_at(&[1u8], capacity).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { .. }));

    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let mut out = vec![0u8; capacity as usize];
    reader.pread(&mut out, capacity as usize, 0).unwrap();
    assert!(out.iter().all(|&b| b == 0xAA));
}

/// An in-memory source disk with deterministic pseudo-random content, for
/// exercising the parallel copy engine against a reference buffer.
struct MemSource {
    data: Vec<u8>,
}

impl SourceDisk for MemSource {
    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    fn pread(&self, buf: &mut [u8], len: usize, pos: u64) -> svmdk::error::Result<()> {
        let start = pos as usize;
        if start + len > self.data.len() {
            return Err(Error::short_transfer(len, self.data.len() - start));
        }
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(())
    }
}

#[test]
fn parallel_copy_matches_sequential_write_of_the_same_source() {
    let capacity = 16 * 1024 * 1024usize;
    let mut data = pseudo_random_bytes(7, capacity);
    // Zero out a few grains so the sparse-elision guarantee is exercised
    // alongside the data path.
    for grain in [0usize, 5, 9] {
        let start = grain * GRAIN_BYTES as usize;
        data[start..start + GRAIN_BYTES as usize].fill(0);
    }
    let source = MemSource { data: data.clone() };

    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    let mut writer = Writer::create_with_seed(&path, capacity as u64, 6, 103).unwrap();
    let copied = writer.copy(&source, 4).unwrap();
    assert_eq!(copied, capacity as u64);
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let mut out = vec![0u8; capacity];
    reader.pread(&mut out, capacity, 0).unwrap();
    assert_eq!(out, data);

    // Grain 0, 5, 9 were all-zero in the source and must read back as holes
    // even though they sit between allocated grains.
    let (pos, _) = reader.next_data(0, 0).unwrap();
    assert_ne!(pos, 0, "first grain was all-zero and should be a hole");
}

#[test]
fn reopening_a_file_with_flipped_magic_is_rejected() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    let writer = Writer::create_with_seed(&path, 1024 * 1024, 6, 104).unwrap();
    writer.close().unwrap();

    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        // Lowercase magic: the provisional-write state, recognizably invalid.
        file.write_all(b"vmdk").unwrap();
    }

    assert!(matches!(Reader::open(&path), Err(Error::InvalidHeader { .. })));
}
