//! Round-trip and corruption-detection properties of the needle codec.

use std::fs::{File, OpenOptions};
use std::io::Write;

use rand::{Rng, RngCore};
use tempfile::tempdir;

use volstore::needle::{
    FLAG_GZIP, FLAG_HAS_LAST_MODIFIED, FLAG_HAS_MIME, FLAG_HAS_NAME, FLAG_HAS_PAIRS, FLAG_HAS_TTL,
};
use volstore::scan::{scan_data_file, VolumeFileScanner};
use volstore::superblock::{ReplicaPlacement, SuperBlock, Version};
use volstore::{Error, Needle, Result, Ttl};

fn new_data_file(path: &std::path::Path) -> File {
    let sb = SuperBlock::new(ReplicaPlacement::default(), Ttl::NONE);
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .unwrap();
    f.write_all(&sb.bytes()).unwrap();
    f
}

fn needle_with_flags(flag_mask: u8, data: Vec<u8>) -> Needle {
    let mut n = Needle::new(77, 0xfeed_f00d, data);
    if flag_mask & FLAG_HAS_NAME != 0 {
        n.set_name(b"photo_0001.jpg");
    }
    if flag_mask & FLAG_HAS_MIME != 0 {
        n.set_mime(b"image/jpeg");
    }
    if flag_mask & FLAG_HAS_LAST_MODIFIED != 0 {
        n.set_last_modified(1_700_000_000);
    }
    if flag_mask & FLAG_HAS_TTL != 0 {
        n.set_ttl(Ttl::parse("5m").unwrap());
    }
    if flag_mask & FLAG_HAS_PAIRS != 0 {
        n.set_pairs(br#"{"owner":"alice"}"#);
    }
    if flag_mask & FLAG_GZIP != 0 {
        n.set_gzipped();
    }
    n
}

#[test]
fn round_trip_every_flag_subset_every_version() {
    let dir = tempdir().unwrap();
    let mut rng = rand::thread_rng();
    let all_flags = [
        FLAG_HAS_NAME,
        FLAG_HAS_MIME,
        FLAG_HAS_LAST_MODIFIED,
        FLAG_HAS_TTL,
        FLAG_HAS_PAIRS,
        FLAG_GZIP,
    ];

    for version in [Version::V1, Version::V2, Version::V3] {
        for subset in 0u32..(1 << all_flags.len()) {
            let mut mask = 0u8;
            for (bit, flag) in all_flags.iter().enumerate() {
                if subset & (1 << bit) != 0 {
                    mask |= flag;
                }
            }
            let mut data = vec![0u8; rng.gen_range(1..2048)];
            rng.fill_bytes(&mut data);

            let path = dir.path().join(format!("{}_{subset}.dat", version.byte()));
            let mut file = new_data_file(&path);
            let mut written = needle_with_flags(mask, data.clone());
            written.append_at_ns = 123_456_789;
            let (offset, _, actual) = written.append(&mut file, version).unwrap();
            assert_eq!(actual % 8, 0);

            let mut read = Needle::default();
            read.read_data(&file, offset, written.size, version).unwrap();
            assert_eq!(read.id, written.id);
            assert_eq!(read.cookie, written.cookie);
            assert_eq!(read.data, data, "data mismatch v{} mask {mask:#04x}", version.byte());
            assert_eq!(read.checksum, crc32fast::hash(&data));

            if version != Version::V1 {
                assert_eq!(read.flags, written.flags);
                assert_eq!(read.name, written.name);
                assert_eq!(read.mime, written.mime);
                assert_eq!(read.pairs, written.pairs);
                assert_eq!(read.last_modified, written.last_modified);
                assert_eq!(read.ttl, written.ttl);
            }
            if version == Version::V3 {
                assert_eq!(read.append_at_ns, 123_456_789);
            }
        }
    }
}

#[test]
fn flipping_any_single_data_bit_is_detected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crc.dat");
    let data = b"the quick brown fox".to_vec();

    let mut file = new_data_file(&path);
    let mut written = Needle::new(5, 0xabcd, data.clone());
    let (offset, _, _) = written.append(&mut file, Version::V3).unwrap();
    drop(file);

    // The data region starts 4 bytes into the body (after the DataSize
    // field).  Flip each bit of each data byte in turn.
    let data_start = offset as usize + 16 + 4;
    let clean = std::fs::read(&path).unwrap();
    for byte_idx in 0..data.len() {
        for bit in 0..8u8 {
            let mut raw = clean.clone();
            raw[data_start + byte_idx] ^= 1 << bit;
            std::fs::write(&path, &raw).unwrap();

            let file = File::open(&path).unwrap();
            let mut read = Needle::default();
            let err = read
                .read_data(&file, offset, written.size, Version::V3)
                .unwrap_err();
            assert!(
                matches!(err, Error::Corrupted { .. }),
                "bit {bit} of byte {byte_idx} went undetected"
            );
        }
    }
}

struct BodyReader {
    visited: usize,
}

impl VolumeFileScanner for BodyReader {
    fn visit_super_block(&mut self, _super_block: &SuperBlock) -> Result<()> {
        Ok(())
    }
    fn read_needle_body(&self) -> bool {
        true
    }
    fn visit_needle(&mut self, _needle: &Needle, _offset: u64) -> Result<()> {
        self.visited += 1;
        Ok(())
    }
}

#[test]
fn v1_corruption_is_caught_by_body_scans() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v1.dat");

    let mut sb = SuperBlock::new(ReplicaPlacement::default(), Ttl::NONE);
    sb.version = Version::V1;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .unwrap();
    file.write_all(&sb.bytes()).unwrap();
    let mut n = Needle::new(3, 0x33, b"version one payload".to_vec());
    let (offset, _, _) = n.append(&mut file, Version::V1).unwrap();
    drop(file);

    // Clean file scans through.
    let file = File::open(&path).unwrap();
    let mut scanner = BodyReader { visited: 0 };
    scan_data_file(&file, &mut scanner).unwrap();
    assert_eq!(scanner.visited, 1);
    drop(file);

    // The v1 body is raw data right after the header; flip one bit.
    let mut raw = std::fs::read(&path).unwrap();
    raw[offset as usize + 16] ^= 0x40;
    std::fs::write(&path, &raw).unwrap();

    let file = File::open(&path).unwrap();
    let mut scanner = BodyReader { visited: 0 };
    let err = scan_data_file(&file, &mut scanner).unwrap_err();
    match err {
        Error::Corrupted { offset: at, .. } => assert_eq!(at, offset),
        other => panic!("expected corruption, got {other:?}"),
    }
    assert_eq!(scanner.visited, 0);

    // The direct read path agrees.
    let mut read = Needle::default();
    assert!(matches!(
        read.read_data(&file, offset, n.size, Version::V1),
        Err(Error::Corrupted { .. })
    ));
}

#[test]
fn v2_attribute_needle_has_documented_footprint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v2.dat");

    // Hand-built v2 superblock: the on-disk version is authoritative.
    let mut sb = SuperBlock::new(ReplicaPlacement::default(), Ttl::NONE);
    sb.version = Version::V2;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .unwrap();
    file.write_all(&sb.bytes()).unwrap();

    let mut n = Needle::new(1, 0x1, b"hello".to_vec());
    n.set_name(b"name");
    n.set_mime(b"text");
    n.set_last_modified(1_700_000_000);
    n.set_ttl(Ttl::parse("5m").unwrap());
    let (offset, _, actual) = n.append(&mut file, Version::V2).unwrap();

    // Body = 4 + 5 + 1 + 1 + 4 + 1 + 4 + 5 + 2 = 27; 16 + 27 + 4 = 47,
    // padded to 48.
    assert_eq!(n.size, 27);
    assert_eq!(actual, 48);
    assert_eq!(file.metadata().unwrap().len(), 8 + 48);

    let mut read = Needle::default();
    read.read_data(&file, offset, n.size, Version::V2).unwrap();
    assert_eq!(read.data, b"hello");
    assert_eq!(read.name, b"name");
    assert_eq!(read.mime, b"text");
    assert_eq!(read.ttl, Ttl::parse("5m").unwrap());
}

#[test]
fn size_mismatch_reads_as_not_found() {
    let dir = tempdir().unwrap();
    let mut file = new_data_file(&dir.path().join("m.dat"));
    let mut n = Needle::new(9, 0x9, vec![0u8; 50]);
    let (offset, _, _) = n.append(&mut file, Version::V3).unwrap();

    // A smaller claimed size still reads cleanly off disk, but the header
    // disagrees — the entry points at something else.
    let mut read = Needle::default();
    let err = read
        .read_data(&file, offset, n.size - 8, Version::V3)
        .unwrap_err();
    assert!(matches!(err, Error::NotFound));
}
