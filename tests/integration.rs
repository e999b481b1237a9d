use seqlog::{Entry, OpenOptions, SearchMode, StoreError};
use tempfile::TempDir;
use test_case::test_case;

fn setup() -> (seqlog::Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = OpenOptions::new().open(dir.path().to_str().unwrap(), "t").unwrap();
    (store, dir)
}

fn entry(data: &[u8]) -> Entry {
    Entry::new(Vec::new(), data.to_vec())
}

#[test]
fn empty_open_close_roundtrip() {
    let (store, dir) = setup();
    let state = store.state();
    assert_eq!(state.seqnum1, 0);
    assert_eq!(state.seqnum2, 0);
    drop(store);

    let reopened = OpenOptions::new().open(dir.path().to_str().unwrap(), "t").unwrap();
    assert_eq!(reopened.state(), state);
}

#[test]
fn append_then_read_back() {
    let (store, _dir) = setup();

    let timestamps = [100, 100, 100, 200, 200, 300, 300, 300, 400, 400];
    let mut entries: Vec<Entry> = timestamps
        .iter()
        .enumerate()
        .map(|(i, &ts)| {
            let mut e = entry(format!("rec{i}").as_bytes());
            e.timestamp = ts;
            e
        })
        .collect();

    let (written, result) = store.append(&mut entries);
    result.unwrap();
    assert_eq!(written, 10);

    let state = store.state();
    assert_eq!(state.seqnum1, 1);
    assert_eq!(state.seqnum2, 10);
    assert_eq!(state.timestamp2, 400);

    let mut buf = vec![Entry::new(Vec::new(), Vec::new()); 3];
    let num = store.read(5, &mut buf).unwrap();
    assert_eq!(num, 3);
    assert_eq!(buf[0].seqnum, 5);
    assert_eq!(buf[1].seqnum, 6);
    assert_eq!(buf[2].seqnum, 7);
    assert_eq!(buf[0].data, b"rec4");
}

#[test]
fn read_out_of_range_is_not_found() {
    let (store, _dir) = setup();
    let mut buf = vec![Entry::new(Vec::new(), Vec::new())];
    let err = store.read(1, &mut buf).unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
}

fn seeded_plateau_store() -> (seqlog::Store, TempDir) {
    let (store, dir) = setup();
    let timestamps = [100, 100, 100, 200, 200, 300, 300, 300, 400, 400];
    let mut entries: Vec<Entry> = timestamps
        .iter()
        .map(|&ts| {
            let mut e = entry(b"x");
            e.timestamp = ts;
            e
        })
        .collect();
    store.append(&mut entries).1.unwrap();
    (store, dir)
}

#[test]
fn search_handles_timestamp_plateaus() {
    let (store, _dir) = seeded_plateau_store();

    assert_eq!(store.search(200, SearchMode::Lower).unwrap(), 4);
    assert_eq!(store.search(200, SearchMode::Upper).unwrap(), 6);
    assert_eq!(store.search(350, SearchMode::Lower).unwrap(), 9);
    assert!(matches!(store.search(400, SearchMode::Upper), Err(StoreError::NotFound)));
}

fn seeded_range_store(lo: u64, hi: u64) -> (seqlog::Store, TempDir) {
    let (store, dir) = setup();
    for chunk_start in (lo..=hi).step_by(50) {
        let chunk_end = (chunk_start + 50).min(hi + 1);
        let mut entries: Vec<Entry> = (chunk_start..chunk_end)
            .map(|s| {
                let mut e = entry(b"payload");
                e.seqnum = s;
                e.timestamp = s - (s % 10);
                e
            })
            .collect();
        store.append(&mut entries).1.unwrap();
    }
    (store, dir)
}

#[test]
fn rollback_removes_high_seqnums() {
    let (store, _dir) = seeded_range_store(20, 314);

    let removed = store.rollback(100).unwrap();
    assert_eq!(removed, 214);

    let state = store.state();
    assert_eq!(state.seqnum2, 100);
    assert_eq!(state.timestamp2, 100);

    let mut buf = vec![Entry::new(Vec::new(), Vec::new())];
    assert!(matches!(store.read(101, &mut buf), Err(StoreError::NotFound)));

    assert_eq!(store.read(100, &mut buf).unwrap(), 1);
    assert_eq!(buf[0].seqnum, 100);
}

#[test]
fn purge_removes_low_seqnums() {
    let (store, _dir) = seeded_range_store(20, 314);
    let dat_len_before = std::fs::metadata(store_dat_path(&_dir)).unwrap().len();

    let removed = store.purge(100).unwrap();
    assert_eq!(removed, 80);

    let state = store.state();
    assert_eq!(state.seqnum1, 100);

    let mut buf = vec![Entry::new(Vec::new(), Vec::new())];
    assert!(matches!(store.read(99, &mut buf), Err(StoreError::NotFound)));
    assert_eq!(store.read(100, &mut buf).unwrap(), 1);
    assert_eq!(buf[0].seqnum, 100);

    let dat_len_after = std::fs::metadata(store_dat_path(&_dir)).unwrap().len();
    assert!(dat_len_after < dat_len_before);
}

fn store_dat_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("t.dat")
}

#[test]
fn rollback_everything_empties_the_store() {
    let (store, _dir) = seeded_range_store(1, 5);
    let removed = store.rollback(0).unwrap();
    assert_eq!(removed, 5);
    assert!(store.state().is_empty());
}

#[test]
fn purge_past_the_end_empties_the_store() {
    let (store, _dir) = seeded_range_store(1, 5);
    let removed = store.purge(100).unwrap();
    assert_eq!(removed, 5);
    assert!(store.state().is_empty());
}

#[test]
fn milestone_roundtrips_across_reopen() {
    let (store, dir) = setup();
    store.update_milestone(42).unwrap();
    assert_eq!(store.state().milestone, 42);
    drop(store);

    let reopened = OpenOptions::new().open(dir.path().to_str().unwrap(), "t").unwrap();
    assert_eq!(reopened.state().milestone, 42);
}

#[test]
fn crash_recovery_truncates_partial_tail_and_rebuilds_index() {
    let dir = TempDir::new().unwrap();
    {
        let store = OpenOptions::new().open(dir.path().to_str().unwrap(), "t").unwrap();
        let mut entries: Vec<Entry> = (10..=13)
            .map(|s| {
                let mut e = entry(b"ok");
                e.seqnum = s;
                e.timestamp = s;
                e
            })
            .collect();
        store.append(&mut entries).1.unwrap();
    }

    // Simulate a crash: append a partial record header (no payload) and
    // some trailing garbage bytes past the last complete record.
    let dat_path = dir.path().join("t.dat");
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&dat_path).unwrap();
        file.write_all(&14u64.to_le_bytes()).unwrap(); // seqnum only, header truncated
        file.write_all(&[0xAB; 3]).unwrap();
    }

    let store = OpenOptions::new().check(true).open(dir.path().to_str().unwrap(), "t").unwrap();
    let state = store.state();
    assert_eq!(state.seqnum2, 13);

    let mut entries = vec![Entry::new(Vec::new(), b"next".to_vec())];
    let (written, result) = store.append(&mut entries);
    result.unwrap();
    assert_eq!(written, 1);
    assert_eq!(entries[0].seqnum, 14);
}

#[test]
fn stale_index_tail_is_repaired_from_unindexed_data_records() {
    // One index record is 24 bytes: seqnum (u64) + timestamp (u64) + pos (u64).
    const IDX_RECORD_SIZE: u64 = 24;

    let dir = TempDir::new().unwrap();
    {
        let store = OpenOptions::new().open(dir.path().to_str().unwrap(), "t").unwrap();
        let mut entries: Vec<Entry> = (1..=5).map(|_| entry(b"v")).collect();
        store.append(&mut entries).1.unwrap();
    }

    // Simulate a crash between the data flush and the index flush: the
    // last data record (seqnum 5) is complete and checksummed on disk, but
    // its index entry never made it out. Truncate the .idx file's tail
    // entry to reproduce that state without touching the .dat file at all.
    let idx_path = dir.path().join("t.idx");
    let idx_len = std::fs::metadata(&idx_path).unwrap().len();
    let idx_file = std::fs::OpenOptions::new().write(true).open(&idx_path).unwrap();
    idx_file.set_len(idx_len - IDX_RECORD_SIZE).unwrap();
    drop(idx_file);

    // A default (check=false) reopen trusts the index for ordering but
    // still must pick up any data records written beyond the index's tail.
    let store = OpenOptions::new().open(dir.path().to_str().unwrap(), "t").unwrap();
    let state = store.state();
    assert_eq!(state.seqnum2, 5);

    let mut buf = vec![Entry::new(Vec::new(), Vec::new())];
    assert_eq!(store.read(5, &mut buf).unwrap(), 1);
    assert_eq!(buf[0].seqnum, 5);

    let mut entries = vec![Entry::new(Vec::new(), b"next".to_vec())];
    let (written, result) = store.append(&mut entries);
    result.unwrap();
    assert_eq!(written, 1);
    assert_eq!(entries[0].seqnum, 6);
}

#[test]
fn reopen_without_check_trusts_the_index() {
    let dir = TempDir::new().unwrap();
    {
        let store = OpenOptions::new().open(dir.path().to_str().unwrap(), "t").unwrap();
        let mut entries: Vec<Entry> = (1..=20).map(|_| entry(b"v")).collect();
        store.append(&mut entries).1.unwrap();
    }

    let store = OpenOptions::new().check(false).open(dir.path().to_str().unwrap(), "t").unwrap();
    assert_eq!(store.state().seqnum2, 20);
}

#[test_case("", false; "empty name is rejected")]
#[test_case("events", true; "plain alphanumeric name is accepted")]
#[test_case("events_2024", true; "underscore and digits are accepted")]
#[test_case("events.log", false; "dot is rejected")]
#[test_case("events/log", false; "slash is rejected")]
#[test_case(&"x".repeat(32), true; "32 chars is the max accepted length")]
#[test_case(&"x".repeat(33), false; "33 chars is rejected")]
fn name_validation(name: &str, should_open: bool) {
    let dir = TempDir::new().unwrap();
    let result = OpenOptions::new().open(dir.path().to_str().unwrap(), name);
    assert_eq!(result.is_ok(), should_open, "name {name:?}");
    if !should_open {
        assert!(matches!(result.unwrap_err(), StoreError::InvalidName(_)));
    }
}

#[test]
fn corrupted_checksum_is_detected_on_read() {
    // The first record's checksum is always verified during open (it is
    // how the store learns whether any data exists at all), so corrupt a
    // *second* record instead: a check=false reopen trusts the index for
    // the tail and never re-verifies it, leaving the corruption for
    // `read` to catch.
    let dir = TempDir::new().unwrap();
    let store = OpenOptions::new().open(dir.path().to_str().unwrap(), "t").unwrap();
    let mut entries = vec![entry(b"abc"), entry(b"xyz")];
    store.append(&mut entries).1.unwrap();
    drop(store);

    let dat_path = dir.path().join("t.dat");
    let bytes = std::fs::read(&dat_path).unwrap();
    let payload_offset = bytes.len() - 1;
    let mut corrupted = bytes.clone();
    corrupted[payload_offset] ^= 0xFF;
    std::fs::write(&dat_path, corrupted).unwrap();

    let store = OpenOptions::new().check(false).open(dir.path().to_str().unwrap(), "t").unwrap();
    let mut buf = vec![Entry::new(Vec::new(), Vec::new())];
    let err = store.read(2, &mut buf).unwrap_err();
    assert!(matches!(err, StoreError::ChecksumMismatch));
}
