//! The storage engine: crash-recovering open, append, read, stats,
//! timestamp search, rollback, and purge over a `<name>.dat` / `<name>.idx`
//! file pair.

use std::fs::{self, File, OpenOptions as FsOpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::format::{compute_checksum, idx_pos, DatHeader, DatRecordHeader, IdxHeader, IdxRecord};
use crate::state::{Entry, SearchMode, State, Stats};

const MILESTONE_OFFSET: u64 = 8 + 4 + 4 + crate::format::BANNER_LEN as u64;

fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    file.read_exact_at(buf, offset)
}

fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    file.write_all_at(buf, offset)
}

fn current_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_valid_path(path: &str) -> bool {
    path.is_empty() || Path::new(path).is_dir()
}

fn create_file_dat(path: &Path) -> Result<()> {
    let file = FsOpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(StoreError::OpenData)?;
    file.write_all_at(&DatHeader::new().to_bytes(), 0).map_err(StoreError::WriteData)
}

fn create_file_idx(path: &Path) -> Result<()> {
    let file = FsOpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(StoreError::OpenIndex)?;
    file.write_all_at(&IdxHeader::new().to_bytes(), 0).map_err(StoreError::WriteIndex)
}

struct Handles {
    dat: File,
    idx: File,
}

/// Builder gathering the store's construction parameters: directory,
/// name, whether to run a full forward scan on open, and whether flushes
/// additionally request a durable fsync.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    check: bool,
    force_fsync: bool,
}

impl OpenOptions {
    #[must_use]
    pub fn new() -> Self {
        Self { check: false, force_fsync: false }
    }

    /// Run a full forward validation scan of the data file during open,
    /// instead of trusting the index's tail position.
    #[must_use]
    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Request an OS-level durability sync after every flush.
    #[must_use]
    pub fn force_fsync(mut self, force_fsync: bool) -> Self {
        self.force_fsync = force_fsync;
        self
    }

    pub fn open(self, path: &str, name: &str) -> Result<Store> {
        Store::open_with(path, name, self.check, self.force_fsync)
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// An open append-only record store.
pub struct Store {
    dat_path: PathBuf,
    idx_path: PathBuf,
    dir: PathBuf,
    name: String,
    force_fsync: bool,
    state: Mutex<State>,
    handles: RwLock<Handles>,
}

struct DatScan {
    milestone: u64,
    first_seqnum: u64,
    first_timestamp: u64,
}

impl Store {
    /// Crate version string, mirroring `CARGO_PKG_VERSION`.
    #[must_use]
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn open_with(path: &str, name: &str, check: bool, force_fsync: bool) -> Result<Self> {
        if !is_valid_path(path) {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        if !is_valid_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }

        let dir = if path.is_empty() { PathBuf::from(".") } else { PathBuf::from(path) };
        let dat_path = dir.join(format!("{name}.dat"));
        let idx_path = dir.join(format!("{name}.idx"));

        if !dat_path.exists() {
            let _ = fs::remove_file(&idx_path);
            create_file_dat(&dat_path)?;
        }
        if !idx_path.exists() {
            create_file_idx(&idx_path)?;
        }

        let (dat_file, scan) = Self::open_file_dat(&dat_path, check)?;

        let rebuild = |dat_file: &File| -> Result<(File, State)> {
            create_file_idx(&idx_path)?;
            Self::open_file_idx(&idx_path, dat_file, &scan, check)
        };

        let (idx_file, state) = match Self::open_file_idx(&idx_path, &dat_file, &scan, check) {
            Ok(ok) => ok,
            Err(StoreError::ReadIndex(_) | StoreError::WriteIndex(_) | StoreError::BadIndexFormat) => {
                warn!(name, "index file is missing or inconsistent; rebuilding from data file");
                let _ = fs::remove_file(&idx_path);
                rebuild(&dat_file)?
            }
            Err(other) => return Err(other),
        };

        info!(
            name,
            seqnum1 = state.seqnum1,
            seqnum2 = state.seqnum2,
            checked = check,
            "store opened"
        );

        Ok(Self {
            dat_path,
            idx_path,
            dir,
            name: name.to_string(),
            force_fsync,
            state: Mutex::new(state),
            handles: RwLock::new(Handles { dat: dat_file, idx: idx_file }),
        })
    }

    fn open_file_dat(path: &Path, check: bool) -> Result<(File, DatScan)> {
        let file = FsOpenOptions::new().read(true).write(true).open(path).map_err(StoreError::OpenData)?;
        let len = file.metadata().map_err(StoreError::ReadData)?.len();

        let mut header_buf = vec![0u8; DatHeader::SIZE];
        read_exact_at(&file, 0, &mut header_buf).map_err(|_| StoreError::BadDataFormat)?;
        let header = DatHeader::from_bytes(&header_buf)?;

        let mut pos = DatHeader::SIZE as u64;
        let mut first_seqnum = 0u64;
        let mut first_timestamp = 0u64;
        let mut first_record = DatRecordHeader::default();

        if pos == len {
            // no records at all
        } else if pos + DatRecordHeader::SIZE as u64 > len {
            file.set_len(pos).map_err(StoreError::WriteData)?;
        } else {
            let mut rec_buf = [0u8; DatRecordHeader::SIZE];
            read_exact_at(&file, pos, &mut rec_buf).map_err(StoreError::ReadData)?;
            let record = DatRecordHeader::from_bytes(&rec_buf).ok_or(StoreError::BadDataFormat)?;

            if record.is_empty_slot() {
                file.set_len(pos).map_err(StoreError::WriteData)?;
            } else {
                let end = pos + DatRecordHeader::SIZE as u64 + u64::from(record.metadata_len) + u64::from(record.data_len);

                if end > len {
                    file.set_len(pos).map_err(StoreError::WriteData)?;
                } else if !Self::verify_payload_checksum(&file, pos, &record)? {
                    file.set_len(pos).map_err(StoreError::WriteData)?;
                } else {
                    first_seqnum = record.seqnum;
                    first_timestamp = record.timestamp;
                    first_record = record;
                    pos = end;
                }
            }
        }

        if !check {
            return Ok((file, DatScan { milestone: header.milestone, first_seqnum, first_timestamp }));
        }

        let mut last_seqnum = first_record.seqnum;
        let mut last_timestamp = first_record.timestamp;

        loop {
            if first_seqnum == 0 || pos + DatRecordHeader::SIZE as u64 > len {
                break;
            }

            let mut rec_buf = [0u8; DatRecordHeader::SIZE];
            read_exact_at(&file, pos, &mut rec_buf).map_err(StoreError::ReadData)?;
            let record = DatRecordHeader::from_bytes(&rec_buf).ok_or(StoreError::BadDataFormat)?;

            if record.is_empty_slot() {
                break;
            }
            if record.seqnum != last_seqnum + 1 {
                return Err(StoreError::BadDataFormat);
            }
            if record.timestamp < last_timestamp {
                return Err(StoreError::BadDataFormat);
            }

            let end = pos + DatRecordHeader::SIZE as u64 + u64::from(record.metadata_len) + u64::from(record.data_len);

            if end > len || !Self::verify_payload_checksum(&file, pos, &record)? {
                break;
            }

            pos = end;
            last_seqnum = record.seqnum;
            last_timestamp = record.timestamp;
        }

        file.set_len(pos).map_err(StoreError::WriteData)?;

        Ok((file, DatScan { milestone: header.milestone, first_seqnum, first_timestamp }))
    }

    fn verify_payload_checksum(file: &File, pos: u64, record: &DatRecordHeader) -> Result<bool> {
        let mut metadata = vec![0u8; record.metadata_len as usize];
        let mut data = vec![0u8; record.data_len as usize];
        read_exact_at(file, pos + DatRecordHeader::SIZE as u64, &mut metadata).map_err(StoreError::ReadData)?;
        read_exact_at(file, pos + DatRecordHeader::SIZE as u64 + u64::from(record.metadata_len), &mut data)
            .map_err(StoreError::ReadData)?;
        let checksum = compute_checksum(record.seqnum, record.timestamp, record.metadata_len, record.data_len, &metadata, &data);
        Ok(checksum == record.checksum)
    }

    fn open_file_idx(idx_path: &Path, dat_file: &File, scan: &DatScan, check: bool) -> Result<(File, State)> {
        let idx_file = FsOpenOptions::new().read(true).write(true).open(idx_path).map_err(StoreError::OpenIndex)?;
        let len = idx_file.metadata().map_err(StoreError::ReadIndex)?.len();

        let mut header_buf = vec![0u8; IdxHeader::SIZE];
        read_exact_at(&idx_file, 0, &mut header_buf).map_err(|_| StoreError::BadIndexFormat)?;
        IdxHeader::from_bytes(&header_buf)?;

        let mut pos = IdxHeader::SIZE as u64;
        let mut record_0 = IdxRecord::default();

        if pos + IdxRecord::SIZE as u64 <= len {
            let mut buf = [0u8; IdxRecord::SIZE];
            read_exact_at(&idx_file, pos, &mut buf).map_err(StoreError::ReadIndex)?;
            record_0 = IdxRecord::from_bytes(&buf).ok_or(StoreError::BadIndexFormat)?;
            pos += IdxRecord::SIZE as u64;

            if record_0.seqnum != scan.first_seqnum || record_0.timestamp != scan.first_timestamp {
                return Err(StoreError::BadIndexFormat);
            }
            if !record_0.is_empty_slot() && record_0.pos != DatHeader::SIZE as u64 {
                return Err(StoreError::BadIndexFormat);
            }
        }

        let mut record_n = record_0;

        if record_0.is_empty_slot() {
            // nothing to scan
        } else if check {
            let mut aux;
            loop {
                if pos + IdxRecord::SIZE as u64 > len {
                    break;
                }
                let mut buf = [0u8; IdxRecord::SIZE];
                read_exact_at(&idx_file, pos, &mut buf).map_err(StoreError::ReadIndex)?;
                aux = IdxRecord::from_bytes(&buf).ok_or(StoreError::BadIndexFormat)?;
                if aux.is_empty_slot() {
                    break;
                }
                pos += IdxRecord::SIZE as u64;

                if aux.seqnum != record_n.seqnum + 1
                    || aux.timestamp < record_n.timestamp
                    || aux.pos < record_n.pos + DatRecordHeader::SIZE as u64
                {
                    return Err(StoreError::BadIndexFormat);
                }

                let mut rec_buf = [0u8; DatRecordHeader::SIZE];
                read_exact_at(dat_file, aux.pos, &mut rec_buf).map_err(StoreError::ReadIndex)?;
                let dat_record = DatRecordHeader::from_bytes(&rec_buf).ok_or(StoreError::BadIndexFormat)?;

                if aux.seqnum != dat_record.seqnum || aux.timestamp != dat_record.timestamp {
                    return Err(StoreError::BadIndexFormat);
                }

                record_n = aux;
            }
        } else {
            let rem = (len - IdxHeader::SIZE as u64) % IdxRecord::SIZE as u64;
            pos = len - rem;

            while pos > IdxHeader::SIZE as u64 {
                let mut buf = [0u8; IdxRecord::SIZE];
                read_exact_at(&idx_file, pos - IdxRecord::SIZE as u64, &mut buf).map_err(StoreError::ReadIndex)?;
                record_n = IdxRecord::from_bytes(&buf).ok_or(StoreError::BadIndexFormat)?;
                if !record_n.is_empty_slot() {
                    break;
                }
                pos -= IdxRecord::SIZE as u64;
            }
        }

        idx_file.set_len(pos).map_err(StoreError::WriteIndex)?;

        let (mut last_seqnum, mut last_timestamp);

        if record_0.is_empty_slot() {
            if scan.first_seqnum != 0 {
                record_n = IdxRecord { seqnum: scan.first_seqnum, timestamp: scan.first_timestamp, pos: DatHeader::SIZE as u64 };
                write_all_at(&idx_file, pos, &record_n.to_bytes()).map_err(StoreError::WriteIndex)?;
                last_seqnum = scan.first_seqnum;
                last_timestamp = scan.first_timestamp;
            } else {
                last_seqnum = 0;
                last_timestamp = 0;
            }
        } else {
            let diff = record_n.seqnum - record_0.seqnum;

            if record_n.seqnum < record_0.seqnum || record_n.timestamp < record_0.timestamp {
                return Err(StoreError::BadIndexFormat);
            }
            if pos != IdxHeader::SIZE as u64 + (diff + 1) * IdxRecord::SIZE as u64 {
                return Err(StoreError::BadIndexFormat);
            }
            // `diff` whole records precede record_n, each at least
            // DatRecordHeader::SIZE bytes (payload length is never
            // negative), so record_n cannot start any earlier than that.
            if record_n.pos < DatHeader::SIZE as u64 + diff * DatRecordHeader::SIZE as u64 {
                return Err(StoreError::BadIndexFormat);
            }

            last_seqnum = record_n.seqnum;
            last_timestamp = record_n.timestamp;
        }

        if scan.first_seqnum == 0 {
            return Ok((idx_file, State { milestone: scan.milestone, ..State::empty() }));
        }

        let dat_len = dat_file.metadata().map_err(StoreError::ReadData)?.len();
        let mut dat_pos = record_n.pos;

        if dat_pos + DatRecordHeader::SIZE as u64 > dat_len {
            return Err(StoreError::BadIndexFormat);
        }

        let mut rec_buf = [0u8; DatRecordHeader::SIZE];
        read_exact_at(dat_file, dat_pos, &mut rec_buf).map_err(StoreError::ReadData)?;
        let last_record = DatRecordHeader::from_bytes(&rec_buf).ok_or(StoreError::BadDataFormat)?;

        if last_record.seqnum != record_n.seqnum || last_record.timestamp != record_n.timestamp {
            return Err(StoreError::BadIndexFormat);
        }

        let mut dat_end =
            dat_pos + DatRecordHeader::SIZE as u64 + u64::from(last_record.metadata_len) + u64::from(last_record.data_len);

        if dat_end > dat_len {
            return Err(StoreError::BadIndexFormat);
        }

        dat_pos = dat_end;

        // Pick up data records written but not yet reflected in the index
        // (writer crashed after the data flush but before the index flush).
        loop {
            if dat_pos + DatRecordHeader::SIZE as u64 > dat_len {
                break;
            }
            let mut buf = [0u8; DatRecordHeader::SIZE];
            read_exact_at(dat_file, dat_pos, &mut buf).map_err(StoreError::ReadData)?;
            let record = DatRecordHeader::from_bytes(&buf).ok_or(StoreError::BadDataFormat)?;

            if record.is_empty_slot() {
                break;
            }
            if record.seqnum != last_seqnum + 1 {
                return Err(StoreError::BadDataFormat);
            }
            if record.timestamp < last_timestamp {
                return Err(StoreError::BadDataFormat);
            }

            let end = dat_pos + DatRecordHeader::SIZE as u64 + u64::from(record.metadata_len) + u64::from(record.data_len);

            if end > dat_len || !Self::verify_payload_checksum(dat_file, dat_pos, &record)? {
                break;
            }

            let new_idx = IdxRecord { seqnum: record.seqnum, timestamp: record.timestamp, pos: dat_pos };
            write_all_at(&idx_file, idx_pos(scan.first_seqnum, record.seqnum), &new_idx.to_bytes())
                .map_err(StoreError::WriteIndex)?;

            last_seqnum = record.seqnum;
            last_timestamp = record.timestamp;
            dat_end = end;
            dat_pos = end;
        }

        dat_file.set_len(dat_end).map_err(StoreError::WriteData)?;

        Ok((
            idx_file,
            State {
                seqnum1: scan.first_seqnum,
                timestamp1: scan.first_timestamp,
                seqnum2: last_seqnum,
                timestamp2: last_timestamp,
                milestone: scan.milestone,
                dat_end,
            },
        ))
    }

    /// Appends `entries` in order, assigning seqnum/timestamp for any
    /// entry that supplies 0. Not atomic: on the first failure the prior
    /// entries in the batch are already durable and the error is returned
    /// alongside the count actually written.
    pub fn append(&self, entries: &mut [Entry]) -> (usize, Result<()>) {
        let mut state = *self.state.lock().unwrap();
        let handles = self.handles.read().unwrap();
        let mut written = 0usize;

        let result = (|| -> Result<()> {
            for entry in entries.iter_mut() {
                if entry.seqnum == 0 {
                    entry.seqnum = state.seqnum2 + 1;
                } else if !state.is_empty() && entry.seqnum != state.seqnum2 + 1 {
                    return Err(StoreError::BadEntrySeqnum);
                }

                if entry.timestamp == 0 {
                    entry.timestamp = current_millis().max(state.timestamp2);
                } else if entry.timestamp < state.timestamp2 {
                    return Err(StoreError::BadEntryTimestamp);
                }

                let metadata_len = entry.metadata.len() as u32;
                let data_len = entry.data.len() as u32;
                let checksum = compute_checksum(entry.seqnum, entry.timestamp, metadata_len, data_len, &entry.metadata, &entry.data);

                let header = DatRecordHeader { seqnum: entry.seqnum, timestamp: entry.timestamp, metadata_len, data_len, checksum };
                let pos = state.dat_end;

                write_all_at(&handles.dat, pos, &header.to_bytes()).map_err(StoreError::WriteData)?;
                write_all_at(&handles.dat, pos + DatRecordHeader::SIZE as u64, &entry.metadata).map_err(StoreError::WriteData)?;
                write_all_at(
                    &handles.dat,
                    pos + DatRecordHeader::SIZE as u64 + u64::from(metadata_len),
                    &entry.data,
                )
                .map_err(StoreError::WriteData)?;

                let first_seqnum = if state.is_empty() { entry.seqnum } else { state.seqnum1 };
                let idx_record = IdxRecord { seqnum: entry.seqnum, timestamp: entry.timestamp, pos };
                write_all_at(&handles.idx, idx_pos(first_seqnum, entry.seqnum), &idx_record.to_bytes())
                    .map_err(StoreError::WriteIndex)?;

                if state.is_empty() {
                    state.seqnum1 = entry.seqnum;
                    state.timestamp1 = entry.timestamp;
                }
                state.seqnum2 = entry.seqnum;
                state.timestamp2 = entry.timestamp;
                state.dat_end = pos + DatRecordHeader::SIZE as u64 + u64::from(metadata_len) + u64::from(data_len);

                written += 1;
            }
            Ok(())
        })();

        if written > 0 {
            let flush_result = handles.dat.sync_data().and_then(|()| handles.idx.sync_data());
            if let Err(e) = flush_result {
                drop(handles);
                *self.state.lock().unwrap() = state;
                return (written, result.and(Err(StoreError::WriteData(e))));
            }
            if self.force_fsync {
                let _ = handles.dat.sync_all();
                let _ = handles.idx.sync_all();
            }
        }

        drop(handles);
        *self.state.lock().unwrap() = state;

        (written, result)
    }

    /// Reads up to `entries.len()` consecutive records starting at
    /// `seqnum`, returning how many were filled.
    pub fn read(&self, seqnum: u64, entries: &mut [Entry]) -> Result<usize> {
        let handles = self.handles.read().unwrap();
        let state = *self.state.lock().unwrap();

        if state.is_empty() || seqnum == 0 || seqnum < state.seqnum1 || seqnum > state.seqnum2 {
            return Err(StoreError::NotFound);
        }

        let mut num = 0;
        let mut current = seqnum;

        for slot in entries.iter_mut() {
            if current > state.seqnum2 {
                break;
            }

            let idx_record = self.read_idx_record(&handles.idx, state.seqnum1, current)?;
            let (header, metadata, data) = self.read_dat_record(&handles.dat, idx_record.pos)?;

            if header.seqnum != current {
                return Err(StoreError::Generic);
            }

            slot.seqnum = header.seqnum;
            slot.timestamp = header.timestamp;
            slot.metadata = metadata;
            slot.data = data;

            current += 1;
            num += 1;
        }

        Ok(num)
    }

    fn read_idx_record(&self, idx: &File, first_seqnum: u64, seqnum: u64) -> Result<IdxRecord> {
        let mut buf = [0u8; IdxRecord::SIZE];
        read_exact_at(idx, idx_pos(first_seqnum, seqnum), &mut buf).map_err(StoreError::ReadIndex)?;
        let record = IdxRecord::from_bytes(&buf).ok_or(StoreError::BadIndexFormat)?;
        if record.seqnum != seqnum {
            return Err(StoreError::Generic);
        }
        Ok(record)
    }

    fn read_dat_record(&self, dat: &File, pos: u64) -> Result<(DatRecordHeader, Vec<u8>, Vec<u8>)> {
        let mut header_buf = [0u8; DatRecordHeader::SIZE];
        read_exact_at(dat, pos, &mut header_buf).map_err(StoreError::ReadData)?;
        let header = DatRecordHeader::from_bytes(&header_buf).ok_or(StoreError::BadDataFormat)?;

        let mut metadata = vec![0u8; header.metadata_len as usize];
        let mut data = vec![0u8; header.data_len as usize];
        read_exact_at(dat, pos + DatRecordHeader::SIZE as u64, &mut metadata).map_err(StoreError::ReadData)?;
        read_exact_at(dat, pos + DatRecordHeader::SIZE as u64 + u64::from(header.metadata_len), &mut data)
            .map_err(StoreError::ReadData)?;

        let checksum = compute_checksum(header.seqnum, header.timestamp, header.metadata_len, header.data_len, &metadata, &data);
        if checksum != header.checksum {
            return Err(StoreError::ChecksumMismatch);
        }

        Ok((header, metadata, data))
    }

    /// Aggregate statistics over `[seqnum_lo, seqnum_hi]` (clamped to the
    /// live range); zeroed if the store is empty.
    pub fn stats(&self, seqnum_lo: u64, seqnum_hi: u64) -> Result<Stats> {
        if seqnum_hi < seqnum_lo {
            return Err(StoreError::InvalidArg);
        }

        let handles = self.handles.read().unwrap();
        let state = *self.state.lock().unwrap();
        if state.is_empty() {
            return Ok(Stats::default());
        }

        let lo = seqnum_lo.clamp(state.seqnum1, state.seqnum2);
        let hi = seqnum_hi.clamp(state.seqnum1, state.seqnum2);

        let record1 = self.read_idx_record(&handles.idx, state.seqnum1, lo)?;
        let record2 = self.read_idx_record(&handles.idx, state.seqnum1, hi)?;

        if record2.pos < record1.pos + (record2.seqnum - record1.seqnum) * DatRecordHeader::SIZE as u64 {
            return Err(StoreError::Generic);
        }

        let (header, _, _) = self.read_dat_record(&handles.dat, record2.pos)?;
        if header.seqnum != hi {
            return Err(StoreError::Generic);
        }

        Ok(Stats {
            min_seqnum: record1.seqnum,
            min_timestamp: record1.timestamp,
            max_seqnum: record2.seqnum,
            max_timestamp: record2.timestamp,
            num_entries: hi - lo + 1,
            index_size: (hi - lo + 1) * IdxRecord::SIZE as u64,
            data_size: record2.pos - record1.pos
                + DatRecordHeader::SIZE as u64
                + u64::from(header.metadata_len)
                + u64::from(header.data_len),
        })
    }

    /// Binary search over the index for the smallest seqnum bracketing
    /// `ts` per `mode`.
    pub fn search(&self, ts: u64, mode: SearchMode) -> Result<u64> {
        let handles = self.handles.read().unwrap();
        let state = *self.state.lock().unwrap();

        if state.is_empty() {
            return Err(StoreError::NotFound);
        }
        match mode {
            SearchMode::Lower if ts > state.timestamp2 => return Err(StoreError::NotFound),
            SearchMode::Upper if ts >= state.timestamp2 => return Err(StoreError::NotFound),
            _ => {}
        }
        match mode {
            SearchMode::Lower if ts <= state.timestamp1 => return Ok(state.seqnum1),
            SearchMode::Upper if ts < state.timestamp1 => return Ok(state.seqnum1),
            _ => {}
        }

        let mut sn1 = state.seqnum1;
        let mut sn2 = state.seqnum2;
        let mut ts1 = state.timestamp1;
        let mut ts2 = state.timestamp2;

        while sn1 + 1 < sn2 && ts1 != ts2 {
            let sn = sn1 + (sn2 - sn1) / 2;
            let record = self.read_idx_record(&handles.idx, state.seqnum1, sn)?;
            let found = record.timestamp;

            if found < ts {
                sn1 = sn;
                ts1 = found;
            } else if ts < found || mode == SearchMode::Lower {
                sn2 = sn;
                ts2 = found;
            } else {
                sn1 = sn;
                ts1 = found;
            }
        }

        Ok(sn2)
    }

    /// Removes all records with seqnum greater than `seqnum` (top-trim).
    /// Returns the number of records removed.
    pub fn rollback(&self, seqnum: u64) -> Result<u64> {
        let mut state = *self.state.lock().unwrap();

        if state.seqnum2 <= seqnum {
            return Ok(0);
        }

        let handles = self.handles.write().unwrap();
        let removed = state.seqnum2 - seqnum.max(state.seqnum1.saturating_sub(1));

        let mut new_timestamp2 = 0u64;
        let mut new_dat_end = DatHeader::SIZE as u64;

        if seqnum >= state.seqnum1 {
            let at_seqnum = self.read_idx_record(&handles.idx, state.seqnum1, seqnum)?;
            new_timestamp2 = at_seqnum.timestamp;
            let after = self.read_idx_record(&handles.idx, state.seqnum1, seqnum + 1)?;
            new_dat_end = after.pos;
        }

        let zero = IdxRecord::default();
        let mut csn = state.seqnum2;
        while seqnum < csn && state.seqnum1 <= csn {
            write_all_at(&handles.idx, idx_pos(state.seqnum1, csn), &zero.to_bytes()).map_err(StoreError::WriteIndex)?;
            csn -= 1;
        }
        handles.idx.sync_data().map_err(StoreError::WriteIndex)?;

        if seqnum < state.seqnum1 {
            state.seqnum1 = 0;
            state.timestamp1 = 0;
            state.seqnum2 = 0;
            state.timestamp2 = 0;
            state.dat_end = DatHeader::SIZE as u64;
        } else {
            state.seqnum2 = seqnum;
            state.timestamp2 = new_timestamp2;
            state.dat_end = new_dat_end;
        }

        handles.dat.set_len(state.dat_end).map_err(StoreError::WriteData)?;
        handles.dat.sync_data().map_err(StoreError::WriteData)?;
        if self.force_fsync {
            let _ = handles.dat.sync_all();
            let _ = handles.idx.sync_all();
        }

        drop(handles);
        *self.state.lock().unwrap() = state;

        info!(name = %self.name, removed, new_tail = state.seqnum2, "rollback complete");
        Ok(removed)
    }

    /// Removes all records with seqnum less than `seqnum` (bottom-trim),
    /// rewriting the data file. Returns the number of records removed.
    pub fn purge(&self, seqnum: u64) -> Result<u64> {
        let state = *self.state.lock().unwrap();

        if state.is_empty() || seqnum <= state.seqnum1 {
            return Ok(0);
        }

        let mut handles = self.handles.write().unwrap();

        if state.seqnum2 < seqnum {
            let removed = state.seqnum2 - state.seqnum1 + 1;

            drop(fs::remove_file(&self.dat_path));
            drop(fs::remove_file(&self.idx_path));
            create_file_dat(&self.dat_path)?;
            create_file_idx(&self.idx_path)?;

            let (dat_file, scan) = Self::open_file_dat(&self.dat_path, false)?;
            let (idx_file, new_state) = Self::open_file_idx(&self.idx_path, &dat_file, &scan, false)?;

            *handles = Handles { dat: dat_file, idx: idx_file };
            drop(handles);
            *self.state.lock().unwrap() = new_state;

            info!(name = %self.name, removed, "purge removed all records");
            return Ok(removed);
        }

        let removed = seqnum - state.seqnum1;
        let at_seqnum = self.read_idx_record(&handles.idx, state.seqnum1, seqnum)?;
        let (header, _, _) = self.read_dat_record(&handles.dat, at_seqnum.pos)?;
        if header.seqnum != seqnum {
            return Err(StoreError::BadIndexFormat);
        }

        let tmp_path = self.dir.join(format!("{}.tmp", self.name));
        let result = self.purge_rewrite(&handles.dat, &tmp_path, at_seqnum.pos, state.dat_end);

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        fs::rename(&tmp_path, &self.dat_path).map_err(|e| {
            tracing::error!(name = %self.name, error = %e, "purge rename failed, original data file preserved");
            StoreError::TempFile(e)
        })?;

        let _ = fs::remove_file(&self.idx_path);
        create_file_idx(&self.idx_path)?;

        let (dat_file, scan) = Self::open_file_dat(&self.dat_path, false)?;
        let (idx_file, new_state) = Self::open_file_idx(&self.idx_path, &dat_file, &scan, false)?;

        *handles = Handles { dat: dat_file, idx: idx_file };
        drop(handles);
        *self.state.lock().unwrap() = new_state;

        info!(name = %self.name, removed, "purge complete");
        Ok(removed)
    }

    fn purge_rewrite(&self, dat: &File, tmp_path: &Path, from: u64, to: u64) -> Result<()> {
        let tmp = FsOpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)
            .map_err(StoreError::TempFile)?;

        tmp.write_all_at(&DatHeader::new().to_bytes(), 0).map_err(StoreError::TempFile)?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut src = from;
        let mut dst = DatHeader::SIZE as u64;

        while src < to {
            let chunk = buf.len().min((to - src) as usize);
            read_exact_at(dat, src, &mut buf[..chunk]).map_err(StoreError::TempFile)?;
            write_all_at(&tmp, dst, &buf[..chunk]).map_err(StoreError::TempFile)?;
            src += chunk as u64;
            dst += chunk as u64;
        }

        tmp.sync_data().map_err(StoreError::TempFile)?;
        Ok(())
    }

    /// Overwrites the opaque milestone value in the data header.
    pub fn update_milestone(&self, value: u64) -> Result<()> {
        let handles = self.handles.read().unwrap();
        write_all_at(&handles.dat, MILESTONE_OFFSET, &value.to_le_bytes()).map_err(StoreError::WriteData)?;
        handles.dat.sync_data().map_err(StoreError::WriteData)?;
        if self.force_fsync {
            let _ = handles.dat.sync_all();
        }
        drop(handles);

        self.state.lock().unwrap().milestone = value;
        Ok(())
    }

    /// Snapshot of the store's current in-memory state.
    #[must_use]
    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }
}
