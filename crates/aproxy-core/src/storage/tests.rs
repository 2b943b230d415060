use super::*;
use std::thread::sleep;

const CS: u64 = 131072;
const URL: &str = "http://api.example.com/tracks/1/stream";

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn resolved(len: u64, etag: Option<&str>) -> ResolvedStream {
    ResolvedStream {
        redirect_url: "http://cdn.example.com/1.mp3".to_string(),
        content_length: len,
        etag: etag.map(str::to_string),
        expires: None,
        bitrate: None,
    }
}

fn chunk_of(body: &[u8], n: u32) -> &[u8] {
    let start = n as usize * CS as usize;
    let end = (start + CS as usize).min(body.len());
    &body[start..end]
}

fn open_with(dir: &Path, len: u64, etag: Option<&str>) -> Store {
    let store = Store::open(dir, CS).unwrap();
    let item = store.get_metadata(URL);
    assert!(store.store_metadata(&item, &resolved(len, etag)));
    store
}

fn wait_assembled(store: &Store) {
    for _ in 0..500 {
        if !store.is_converting(URL) {
            return;
        }
        sleep(Duration::from_millis(10));
    }
    panic!("assembly did not finish");
}

#[test]
fn missing_chunks_for_first_byte() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with(dir.path(), 300000, None);
    let item = store.get_metadata(URL);
    assert_eq!(item.record().number_of_chunks(CS), 3);
    let missing = store.compute_missing_chunks(URL, ByteRange::new(0, 1).chunk_range(CS));
    assert_eq!(missing.iter().collect::<Vec<_>>(), vec![0]);
}

#[test]
fn unknown_length_assumes_everything_missing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), CS).unwrap();
    let missing = store.compute_missing_chunks(URL, ChunkRange::new(4, 3));
    assert_eq!(missing.iter().collect::<Vec<_>>(), vec![4, 5, 6]);
}

#[test]
fn missing_chunks_stop_at_last_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with(dir.path(), 300000, None);
    let missing = store.compute_missing_chunks(URL, ChunkRange::new(1, 5));
    assert_eq!(missing.iter().collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn append_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with(dir.path(), 300000, None);
    let data = body(300000);
    assert!(store.append_chunk(URL, chunk_of(&data, 1), 1));
    assert!(!store.append_chunk(URL, chunk_of(&data, 1), 1));

    let item = store.get_metadata(URL);
    assert_eq!(item.record().downloaded, vec![1]);
    assert_eq!(fs::metadata(store.chunks_path(&item)).unwrap().len(), CS);
    let index = index_file::read(&store.index_path(&item)).unwrap();
    assert_eq!(index.downloaded, vec![1]);

    let missing = store.compute_missing_chunks(URL, ChunkRange::new(0, 3));
    assert_eq!(missing.iter().collect::<Vec<_>>(), vec![0, 2]);
}

#[test]
fn append_rejects_empty_and_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with(dir.path(), 300000, None);
    assert!(!store.append_chunk(URL, &[], 0));
    assert!(!store.append_chunk(URL, b"x", 3));
    assert!(store.get_metadata(URL).record().downloaded.is_empty());
}

#[test]
fn read_from_incomplete_uses_arrival_slots() {
    let dir = tempfile::tempdir().unwrap();
    let len = 5 * CS as usize;
    let store = open_with(dir.path(), len as u64, None);
    let data = body(len);
    for n in [3, 1, 2] {
        assert!(store.append_chunk(URL, chunk_of(&data, n), n));
    }

    // Full single chunk (fast path).
    let got = store.read_bytes(URL, ByteRange::new(CS, CS)).unwrap();
    assert_eq!(got, chunk_of(&data, 1));

    // Unaligned range across three chunks.
    let r = ByteRange::new(CS + 17, 2 * CS);
    let got = store.read_bytes(URL, r).unwrap();
    assert_eq!(got, &data[r.start as usize..r.end() as usize]);

    // Chunk 0 is not there yet.
    assert!(store.read_bytes(URL, ByteRange::new(0, 10)).is_err());
}

#[test]
fn read_clips_to_content_length() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with(dir.path(), 100, None);
    let data = body(100);
    assert!(store.append_chunk(URL, &data, 0));
    wait_assembled(&store);
    let got = store.read_bytes(URL, ByteRange::new(90, CS)).unwrap();
    assert_eq!(got, &data[90..]);
    assert!(store.read_bytes(URL, ByteRange::new(200, 10)).is_err());
}

#[test]
fn in_order_arrival_assembles_exact_length() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with(dir.path(), 300000, None);
    let data = body(300000);
    for n in 0..3 {
        assert!(store.append_chunk(URL, chunk_of(&data, n), n));
    }
    wait_assembled(&store);

    let complete = store.complete_file(URL).expect("complete file");
    assert_eq!(fs::read(&complete).unwrap(), data);
    let item = store.get_metadata(URL);
    assert!(!store.chunks_path(&item).exists());
    assert!(!store.index_path(&item).exists());
    assert!(store.compute_missing_chunks(URL, ChunkRange::new(0, 3)).is_empty());
    assert!(!store.append_chunk(URL, chunk_of(&data, 0), 0));
}

#[test]
fn out_of_order_arrival_assembles_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with(dir.path(), 300000, None);
    let data = body(300000);
    for n in [2, 0, 1] {
        assert!(store.append_chunk(URL, chunk_of(&data, n), n));
    }
    wait_assembled(&store);
    let complete = store.complete_file(URL).expect("complete file");
    assert_eq!(fs::read(&complete).unwrap(), data);
    assert_eq!(
        store.read_bytes(URL, ByteRange::new(299990, 10)).unwrap(),
        &data[299990..]
    );
}

#[test]
fn assembled_etag_mismatch_purges_everything() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with(dir.path(), 1000, Some("\"00000000000000000000000000000000\""));
    assert!(store.append_chunk(URL, &body(1000), 0));
    wait_assembled(&store);
    assert!(store.complete_file(URL).is_none());
    let item = store.get_metadata(URL);
    assert!(!store.chunks_path(&item).exists());
    assert!(item.record().downloaded.is_empty());
}

#[test]
fn assembled_etag_match_keeps_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = body(1000);
    let etag = format!("\"{:x}\"", md5::compute(&data));
    let store = open_with(dir.path(), 1000, Some(&etag));
    assert!(store.append_chunk(URL, &data, 0));
    wait_assembled(&store);
    assert!(store.complete_file(URL).is_some());
}

#[test]
fn changed_etag_purges_cached_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with(dir.path(), 300000, Some("\"v1\""));
    let data = body(300000);
    assert!(store.append_chunk(URL, chunk_of(&data, 0), 0));

    let item = store.get_metadata(URL);
    assert!(store.store_metadata(&item, &resolved(300000, Some("\"v2\""))));
    assert!(item.record().downloaded.is_empty());
    assert_eq!(item.record().etag.as_deref(), Some("\"v2\""));
    assert!(!store.chunks_path(&item).exists());

    // Same etag again: nothing is purged.
    assert!(store.append_chunk(URL, chunk_of(&data, 0), 0));
    assert!(store.store_metadata(&item, &resolved(300000, Some("\"v2\""))));
    assert_eq!(item.record().downloaded, vec![0]);
}

#[test]
fn metadata_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let data = body(300000);
    {
        let store = open_with(dir.path(), 300000, Some("\"e\""));
        assert!(store.append_chunk(URL, chunk_of(&data, 2), 2));
        assert!(store.append_chunk(URL, chunk_of(&data, 0), 0));
    }
    let store = Store::open(dir.path(), CS).unwrap();
    let rec = store.get_metadata(URL).snapshot();
    assert_eq!(rec.content_length, 300000);
    assert_eq!(rec.downloaded, vec![2, 0]);
    assert_eq!(rec.etag.as_deref(), Some("\"e\""));
    assert!(rec.redirect_url.is_none());
    let got = store.read_bytes(URL, ByteRange::new(2 * CS, 300000 - 2 * CS)).unwrap();
    assert_eq!(got, chunk_of(&data, 2));
}

#[test]
fn corrupt_index_is_purged() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), CS).unwrap();
    let hash = checksum::url_hash(URL);
    fs::write(dir.path().join("Incomplete").join(format!("{}.index", hash)), b"\x00\x05ab").unwrap();
    let rec = store.get_metadata(URL).snapshot();
    assert_eq!(rec, ItemRecord::default());
    assert!(!dir.path().join("Incomplete").join(format!("{}.index", hash)).exists());
}

#[test]
fn completed_file_alone_is_fully_present() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), CS).unwrap();
    let data = body(1234);
    fs::write(dir.path().join("Complete").join(checksum::url_hash(URL)), &data).unwrap();
    let item = store.get_metadata(URL);
    assert_eq!(item.content_length(), 1234);
    assert!(store.compute_missing_chunks(URL, ChunkRange::new(0, 1)).is_empty());
    assert_eq!(store.read_bytes(URL, ByteRange::new(1000, 234)).unwrap(), &data[1000..]);

    // Lazy etag from content: a different upstream etag purges the file.
    assert!(store.store_metadata(&item, &resolved(1234, Some("\"other\""))));
    assert!(store.complete_file(URL).is_none());
}

#[test]
fn remove_metadata_forgets_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with(dir.path(), 10, None);
    let a = store.get_metadata(URL);
    assert!(store.remove_metadata(URL));
    assert!(!store.remove_metadata(URL));
    let b = store.get_metadata(URL);
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(b.content_length(), 10);
}
