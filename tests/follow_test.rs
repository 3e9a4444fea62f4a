//! Follower replication: binary search over append timestamps, incremental
//! byte streaming, rollback, and revision fencing.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use tempfile::tempdir;

use volstore::index::IndexFile;
use volstore::needle_map::NeedleMapKind;
use volstore::scan::record_span;
use volstore::superblock::{ReplicaPlacement, SuperBlock, Version};
use volstore::volume::{volume_base_name, Volume};
use volstore::{Error, Needle, Offset, Store, StoreOptions, Ttl};

fn open_store(dir: &std::path::Path) -> Store {
    Store::new(StoreOptions {
        dir: dir.to_owned(),
        needle_map_kind: None,
        volume_size_limit: 0,
    })
    .unwrap()
}

/// Build a v3 volume by hand with `count` needles whose append timestamps
/// are exactly `10^9 * i` for i in 1..=count, all with `payload_len` data
/// bytes.  Returns the per-record span.
fn build_timestamped_volume(
    dir: &std::path::Path,
    id: u32,
    count: u64,
    payload_len: usize,
) -> u64 {
    let base = volume_base_name(dir, "", id);
    let sb = SuperBlock::new(ReplicaPlacement::default(), Ttl::NONE);
    let mut dat = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(base.with_extension("dat"))
        .unwrap();
    dat.write_all(&sb.bytes()).unwrap();
    let mut idx = IndexFile::open(&base.with_extension("idx")).unwrap();

    for i in 1..=count {
        let mut n = Needle::new(i, 0x7700 + i as u32, vec![i as u8; payload_len]);
        n.append_at_ns = 1_000_000_000 * i;
        let (offset, _, _) = n.append(&mut dat, Version::V3).unwrap();
        idx.append(n.id, Offset::from_actual(offset), n.size).unwrap();
    }
    idx.flush().unwrap();
    record_span(4 + payload_len as u32 + 1, Version::V3)
}

#[test]
fn binary_search_finds_first_entry_after_timestamp() {
    let dir = tempdir().unwrap();
    let span = build_timestamped_volume(dir.path(), 21, 1024, 100);

    let volume = Volume::open(
        dir.path(),
        "",
        21,
        NeedleMapKind::Compact,
        None,
        None,
        0,
    )
    .unwrap();

    // T = 10^9 * 500: the 501st entry is the first strictly newer one.
    let (offset, is_last) = volume.binary_search_by_append_at_ns(500_000_000_000).unwrap();
    assert!(!is_last);
    assert_eq!(offset.to_actual(), 8 + 500 * span);

    // T = 0 finds the very first entry.
    let (offset, is_last) = volume.binary_search_by_append_at_ns(0).unwrap();
    assert!(!is_last);
    assert_eq!(offset.to_actual(), 8);

    // T at or past the newest entry: nothing newer exists.
    let (_, is_last) = volume.binary_search_by_append_at_ns(1024_000_000_000).unwrap();
    assert!(is_last);
    let (_, is_last) = volume.binary_search_by_append_at_ns(u64::MAX).unwrap();
    assert!(is_last);

    // Mid-gap timestamps round up to the next entry.
    let (offset, is_last) = volume.binary_search_by_append_at_ns(500_500_000_000).unwrap();
    assert!(!is_last);
    assert_eq!(offset.to_actual(), 8 + 500 * span);
    volume.close().unwrap();
}

#[test]
fn last_append_at_ns_tracks_the_newest_entry() {
    let dir = tempdir().unwrap();
    build_timestamped_volume(dir.path(), 22, 17, 32);
    let volume = Volume::open(dir.path(), "", 22, NeedleMapKind::Compact, None, None, 0).unwrap();
    assert_eq!(volume.find_last_append_at_ns().unwrap(), 17_000_000_000);
    volume.close().unwrap();

    let empty_dir = tempdir().unwrap();
    let volume = Volume::open(
        empty_dir.path(),
        "",
        23,
        NeedleMapKind::Compact,
        Some(ReplicaPlacement::default()),
        Some(Ttl::NONE),
        0,
    )
    .unwrap();
    assert_eq!(volume.find_last_append_at_ns().unwrap(), 0);
    volume.close().unwrap();
}

fn serve(store: Arc<Store>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        let _ = store.serve_follow(listener);
    });
    addr
}

#[test]
fn follower_catches_up_incrementally_and_matches_leader() {
    let leader_dir = tempdir().unwrap();
    let follower_dir = tempdir().unwrap();

    let leader = Arc::new(open_store(leader_dir.path()));
    leader
        .allocate_volume(31, "", ReplicaPlacement::default(), Ttl::NONE, 0)
        .unwrap();
    for key in 1..=100u64 {
        let mut n = Needle::new(key, 0x5000 + key as u32, vec![key as u8; 90]);
        leader.write(31, &mut n).unwrap();
    }
    let addr = serve(Arc::clone(&leader));

    let follower = open_store(follower_dir.path());
    follower
        .allocate_volume(31, "", ReplicaPlacement::default(), Ttl::NONE, 0)
        .unwrap();

    // First follow: full tail.
    follower.follow(31, &addr).unwrap();
    let lv = leader.volume(31).unwrap();
    let fv = follower.volume(31).unwrap();
    assert_eq!(fv.size(), lv.size());
    assert_eq!(fv.file_count(), lv.file_count());

    // Leader moves ahead: 300 more writes and a deletion.
    for key in 101..=400u64 {
        let mut n = Needle::new(key, 0x5000 + key as u32, vec![key as u8; 90]);
        leader.write(31, &mut n).unwrap();
    }
    leader.delete(31, 50).unwrap();

    // Second follow picks up only the new tail.
    follower.follow(31, &addr).unwrap();
    assert_eq!(fv.size(), lv.size());
    assert_eq!(fv.file_count(), lv.file_count());

    // Byte-for-byte identical volumes.
    let l_dat = volume_base_name(leader_dir.path(), "", 31).with_extension("dat");
    let f_dat = volume_base_name(follower_dir.path(), "", 31).with_extension("dat");
    assert_eq!(std::fs::read(&l_dat).unwrap(), std::fs::read(&f_dat).unwrap());

    // And the rebuilt map agrees with the leader's.
    for key in [1u64, 50, 100, 101, 250, 400] {
        match leader.read(31, key) {
            Ok(needle) => {
                assert_eq!(follower.read(31, key).unwrap().data, needle.data, "key {key}");
            }
            Err(Error::NotFound) => {
                assert!(matches!(follower.read(31, key), Err(Error::NotFound)), "key {key}");
            }
            Err(other) => panic!("leader read {key}: {other}"),
        }
    }

    // Already caught up: a third follow transfers nothing and changes
    // nothing.
    let before = fv.size();
    follower.follow(31, &addr).unwrap();
    assert_eq!(fv.size(), before);
}

#[test]
fn revision_mismatch_demands_full_copy() {
    let leader_dir = tempdir().unwrap();
    let follower_dir = tempdir().unwrap();

    let leader = Arc::new(open_store(leader_dir.path()));
    leader
        .allocate_volume(32, "", ReplicaPlacement::default(), Ttl::NONE, 0)
        .unwrap();
    let mut n = Needle::new(1, 0x1, vec![1u8; 10]);
    leader.write(32, &mut n).unwrap();
    leader.compact_volume(32).unwrap();
    assert_eq!(leader.volume(32).unwrap().compact_revision(), 1);

    let addr = serve(Arc::clone(&leader));

    let follower = open_store(follower_dir.path());
    follower
        .allocate_volume(32, "", ReplicaPlacement::default(), Ttl::NONE, 0)
        .unwrap();
    match follower.follow(32, &addr) {
        Err(Error::FollowMismatch { local, remote }) => {
            assert_eq!(local, 0);
            assert_eq!(remote, 1);
        }
        other => panic!("expected revision mismatch, got {other:?}"),
    }
    // The refused follow left the follower untouched.
    assert_eq!(follower.volume(32).unwrap().size(), 8);
}

#[test]
fn unknown_volume_is_refused() {
    let leader_dir = tempdir().unwrap();
    let follower_dir = tempdir().unwrap();
    let leader = Arc::new(open_store(leader_dir.path()));
    let addr = serve(Arc::clone(&leader));

    let follower = open_store(follower_dir.path());
    follower
        .allocate_volume(33, "", ReplicaPlacement::default(), Ttl::NONE, 0)
        .unwrap();
    assert!(matches!(
        follower.follow(33, &addr),
        Err(Error::VolumeNotFound(33))
    ));
}

#[test]
fn deletes_replicate_through_the_byte_stream() {
    let leader_dir = tempdir().unwrap();
    let follower_dir = tempdir().unwrap();

    let leader = Arc::new(open_store(leader_dir.path()));
    leader
        .allocate_volume(34, "", ReplicaPlacement::default(), Ttl::NONE, 0)
        .unwrap();
    for key in 1..=5u64 {
        let mut n = Needle::new(key, key as u32, vec![key as u8; 30]);
        leader.write(34, &mut n).unwrap();
    }
    let addr = serve(Arc::clone(&leader));

    let follower = open_store(follower_dir.path());
    follower
        .allocate_volume(34, "", ReplicaPlacement::default(), Ttl::NONE, 0)
        .unwrap();
    follower.follow(34, &addr).unwrap();
    assert!(follower.read(34, 3).is_ok());

    // A delete on the leader is just another appended record.
    leader.delete(34, 3).unwrap();
    follower.follow(34, &addr).unwrap();
    assert!(matches!(follower.read(34, 3), Err(Error::NotFound)));
    assert_eq!(
        follower.volume(34).unwrap().file_count(),
        leader.volume(34).unwrap().file_count()
    );
}
