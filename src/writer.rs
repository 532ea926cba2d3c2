//! The streamOptimized writer: sequential `pwrite`, the parallel copy
//! engine, and the multi-phase `close`/`abort` finalizer.

use std::fs::{File, OpenOptions};
use std::io::Seek;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::descriptor;
use crate::entropy::Rng;
use crate::error::{Error, Result};
use crate::grain::{
    effective_len_or_out_of_range, GrainBuffer, GrainCompressor, GRAIN_MARKER_EOS,
};
use crate::header::{Header, SECTOR_SIZE};
use crate::layout::{Directory, Layout};
use crate::pread_source::SourceDisk;

/// Default open-vm-tools-style version string this crate stamps into
/// `ddb.toolsVersion`. This crate has no tools installation to introspect;
/// callers producing disks for a specific appliance should override it.
pub const DEFAULT_TOOLS_VERSION: &str = "0";

/// A positioned-write-exact helper over `std::os::unix::fs::FileExt`,
/// reported through this crate's error type.
fn pwrite_exact(file: &File, buf: &[u8], pos: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, pos).map_err(Error::io_write_simple)
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum CopyState {
    Running = 0,
    Done = 1,
    Failed = 2,
}

/// Sequentially writes a linear byte stream into a streamOptimized sparse
/// VMDK file, or hands the whole job to the parallel copy engine.
pub struct Writer {
    file: File,
    path: PathBuf,
    header: Header,
    layout: Layout,
    directory: Directory,
    buffer: GrainBuffer,
    compressor: GrainCompressor,
    cur_sp: u64,
    rng: Rng,
    tools_version: String,
}

impl Writer {
    /// Creates and truncates the output file, seeded from process-scoped
    /// randomness for the CID and descriptor fields.
    pub fn create(path: impl AsRef<Path>, capacity_bytes: u64, compression_level: u32) -> Result<Self> {
        Self::create_with_rng(path, capacity_bytes, compression_level, Rng::from_os())
    }

    /// As [`Self::create`], but with an explicitly seeded RNG so tests get
    /// deterministic CIDs and descriptor identifiers.
    pub fn create_with_seed(
        path: impl AsRef<Path>,
        capacity_bytes: u64,
        compression_level: u32,
        seed: u64,
    ) -> Result<Self> {
        Self::create_with_rng(path, capacity_bytes, compression_level, Rng::seeded(seed))
    }

    fn create_with_rng(
        path: impl AsRef<Path>,
        capacity_bytes: u64,
        compression_level: u32,
        rng: Rng,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut header = Header::for_new_disk(capacity_bytes);
        let layout = Layout::from_header(&header)?;

        header.overhead = 1; // the header's own sector
        header.descriptor_offset = header.overhead;
        header.overhead += header.descriptor_size;
        header.gd_offset = header.overhead;
        header.overhead += layout.gd_sectors as u64;

        let directory = Directory::new(layout);
        header.overhead = directory.prefill_directory(header.overhead);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io_write(e, path.clone()))?;

        let cur_sp = header.overhead;
        file.set_len(cur_sp * SECTOR_SIZE)
            .map_err(|e| Error::io_write(e, path.clone()))?;
        (&file)
            .seek(std::io::SeekFrom::Start(cur_sp * SECTOR_SIZE))
            .map_err(|e| Error::io_write(e, path.clone()))?;

        let grain_bytes = layout.grain_bytes() as usize;
        Ok(Self {
            file,
            path,
            header,
            layout,
            directory,
            buffer: GrainBuffer::new(grain_bytes),
            compressor: GrainCompressor::new(compression_level, grain_bytes),
            cur_sp,
            rng,
            tools_version: DEFAULT_TOOLS_VERSION.to_string(),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.header.capacity * SECTOR_SIZE
    }

    pub fn set_tools_version(&mut self, version: impl Into<String>) {
        self.tools_version = version.into();
    }

    /// Writes `buf` at byte offset `pos`, buffering and compressing grains
    /// as their ranges fill.
    pub fn pwrite(&mut self, buf: &[u8]) -> Result<usize> {
        self.pwrite_at(buf, 0)
    }

    /// Writes `buf` at absolute byte offset `pos`.
    pub fn pwrite_at(&mut self, buf: &[u8], pos: u64) -> Result<usize> {
        let grain_bytes = self.layout.grain_bytes();
        let mut grain_nr = pos / grain_bytes;
        let mut update_start = (pos % grain_bytes) as usize;
        let mut remaining = buf;
        let mut written = 0usize;

        while !remaining.is_empty() {
            self.prepare_grain(grain_nr)?;

            // Bounds-check against the grain's *effective* (post-trim) length,
            // not its full allocated size: the last grain of the disk may be
            // shorter than grain_bytes, and a write landing past that point
            // must be rejected even though it targets a grain that otherwise
            // exists.
            let effective_len = effective_len_or_out_of_range(&self.layout, grain_nr)?;
            if update_start >= effective_len {
                return Err(Error::out_of_range(format!(
                    "offset within grain {} is beyond its effective length of {} bytes",
                    grain_nr, effective_len
                )));
            }

            let update_len = (effective_len - update_start).min(remaining.len());
            let update_end = update_start + update_len;

            if self.buffer.is_range_disjoint(update_start, update_end) {
                self.buffer.fill(&self.directory, effective_len)?;
            }

            self.buffer.write_at(update_start, &remaining[..update_len]);

            remaining = &remaining[update_len..];
            written += update_len;
            grain_nr += 1;
            update_start = 0;
        }

        Ok(written)
    }

    fn prepare_grain(&mut self, grain_nr: u64) -> Result<()> {
        if self.buffer.grain_nr() != Some(grain_nr) {
            self.flush_grain()?;
            self.buffer.reset_to(grain_nr);
        }
        Ok(())
    }

    /// Fills, validates, compresses (if non-zero) and appends the current
    /// grain; no-op if the buffer is empty.
    fn flush_grain(&mut self) -> Result<()> {
        let grain_nr = match self.buffer.grain_nr() {
            Some(g) if self.buffer.has_pending_data() => g,
            _ => return Ok(()),
        };

        let effective_len = effective_len_or_out_of_range(&self.layout, grain_nr)?;
        self.buffer.fill(&self.directory, effective_len)?;

        if self.directory.gt_value(grain_nr) != 0 {
            return Err(Error::overwrite_forbidden(grain_nr));
        }

        if !self.buffer.is_all_zero(effective_len) {
            let used = self
                .compressor
                .compress_frame(self.buffer.data(effective_len), grain_nr * self.layout.grain_size)?;
            let frame_sectors = self.compressor.frame_sectors(used) as u64 / SECTOR_SIZE;
            let sp = self.cur_sp;
            pwrite_exact(&self.file, self.compressor.frame_bytes(used), sp * SECTOR_SIZE)?;
            self.directory.set_gt_value(grain_nr, sp as u32);
            self.cur_sp += frame_sectors;
        }

        Ok(())
    }

    /// Parallel copy from a full source disk, using `num_threads` workers.
    /// Returns the number of bytes copied (the source's capacity on
    /// success).
    pub fn copy(&mut self, src: &dyn SourceDisk, num_threads: usize) -> Result<u64> {
        let capacity = src.capacity();
        let grain_bytes = self.layout.grain_bytes();

        let read_pos = AtomicU64::new(0);
        let write_sp = AtomicU64::new(self.cur_sp);
        let state = AtomicU8::new(CopyState::Running as u8);
        // Serializes the (compress-then-pwrite) half of the critical path;
        // sp reservation under write_sp happens before this, matching the
        // source's writeSPMutex-then-unlocked-pwrite ordering but kept
        // simple as one lock since this crate's File isn't Sync-safe for
        // unsynchronized concurrent write_all_at on overlapping regions.
        let write_lock = Mutex::new(());

        let directory = &self.directory;
        let layout = &self.layout;
        let file = &self.file;
        let level = self.compressor_level();

        rayon::scope(|scope| {
            for _ in 0..num_threads {
                let read_pos = &read_pos;
                let write_sp = &write_sp;
                let state = &state;
                let write_lock = &write_lock;
                scope.spawn(move |_| {
                    let mut grain = GrainBuffer::new(grain_bytes as usize);
                    let mut compressor = GrainCompressor::new(level, grain_bytes as usize);
                    let mut scratch = vec![0u8; grain_bytes as usize];

                    loop {
                        if state.load(Ordering::Acquire) == CopyState::Failed as u8 {
                            return;
                        }

                        let my_pos = read_pos.fetch_update(Ordering::AcqRel, Ordering::Acquire, |pos| {
                            if pos >= capacity {
                                None
                            } else {
                                let read_len = grain_bytes.min(capacity - pos);
                                Some(pos + read_len)
                            }
                        });

                        let my_pos = match my_pos {
                            Ok(pos) => pos,
                            Err(_) => {
                                state
                                    .compare_exchange(
                                        CopyState::Running as u8,
                                        CopyState::Done as u8,
                                        Ordering::AcqRel,
                                        Ordering::Acquire,
                                    )
                                    .ok();
                                return;
                            }
                        };

                        let read_len = (grain_bytes.min(capacity - my_pos)) as usize;
                        let grain_nr = my_pos / grain_bytes;

                        grain.reset_to(grain_nr);
                        if src.pread(&mut scratch[..read_len], read_len, my_pos).is_err() {
                            state.store(CopyState::Failed as u8, Ordering::Release);
                            return;
                        }
                        grain.write_at(0, &scratch[..read_len]);

                        if grain.is_all_zero(read_len) {
                            continue;
                        }

                        let used = match compressor.compress_frame(grain.data(read_len), grain_nr * layout.grain_size) {
                            Ok(used) => used,
                            Err(_) => {
                                state.store(CopyState::Failed as u8, Ordering::Release);
                                return;
                            }
                        };
                        let frame_sectors = compressor.frame_sectors(used) as u64 / SECTOR_SIZE;

                        let sp = {
                            let _guard = write_lock.lock().unwrap();
                            let sp = write_sp.fetch_add(frame_sectors, Ordering::AcqRel);
                            if pwrite_exact(file, compressor.frame_bytes(used), sp * SECTOR_SIZE).is_err() {
                                state.store(CopyState::Failed as u8, Ordering::Release);
                                return;
                            }
                            sp
                        };

                        if let Some(entry) = directory.gt_entry(grain_nr) {
                            entry.store(sp as u32, Ordering::Relaxed);
                        } else {
                            state.store(CopyState::Failed as u8, Ordering::Release);
                            return;
                        }
                    }
                });
            }
        });

        if state.load(Ordering::Acquire) != CopyState::Done as u8 {
            return Err(Error::codec_failure("parallel copy engine failed"));
        }

        self.cur_sp = write_sp.load(Ordering::Acquire);
        Ok(read_pos.load(Ordering::Acquire))
    }

    fn compressor_level(&self) -> u32 {
        self.compressor.level()
    }

    fn write_eos(&mut self) -> Result<()> {
        let mut marker = [0u8; SECTOR_SIZE as usize];
        marker[8..12].copy_from_slice(&GRAIN_MARKER_EOS.to_le_bytes());
        pwrite_exact(&self.file, &marker, self.cur_sp * SECTOR_SIZE)
    }

    /// Finalizes the file: flush, EOS marker, directory, descriptor, then
    /// the two-phase lowercase-then-uppercase header commit with `fsync`
    /// between them. Internally calls [`Self::abort`] on any failure.
    pub fn close(mut self) -> Result<()> {
        match self.close_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn close_inner(&mut self) -> Result<()> {
        self.flush_grain()?;
        self.write_eos()?;

        let directory_bytes = self.directory.to_bytes();
        pwrite_exact(&self.file, &directory_bytes, self.header.gd_offset * SECTOR_SIZE)?;

        let cid = descriptor::random_cid(&mut self.rng);
        let filename = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("disk.vmdk")
            .to_string();
        let text = descriptor::build(
            self.header.capacity,
            cid,
            &mut self.rng,
            &filename,
            &self.tools_version,
        );
        pwrite_exact(
            &self.file,
            text.as_bytes(),
            self.header.descriptor_offset * SECTOR_SIZE,
        )?;

        pwrite_exact(&self.file, &self.header.to_bytes(true), 0)?;
        self.file.sync_all().map_err(Error::io_write_simple)?;

        pwrite_exact(&self.file, &self.header.to_bytes(false), 0)?;
        self.file.sync_all().map_err(Error::io_write_simple)?;

        Ok(())
    }

    /// Releases resources without finishing the commit sequence, leaving
    /// whatever was already written on disk (recognizably invalid, since the
    /// header never reaches the uppercase-magic final state).
    pub fn abort(self) {
        // Dropping `self` closes the file descriptor without running any of
        // the finalize steps, leaving whatever was already written on disk.
    }
}
