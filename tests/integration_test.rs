use std::fs;
use std::path::{Path, PathBuf};

use tempfile::tempdir;
use tevd::{Disk, Entry, Payload, Skimmer, TevdError, Utf8Lossy};

fn open(path: &Path) -> Skimmer {
    Skimmer::open(path, Box::new(Utf8Lossy)).unwrap()
}

/// Root plus one file named "readme" with payload "hi" at handle 42.
fn single_file_disk() -> Disk {
    let mut disk = Disk::new_seeded(1024, b"hello", 1);
    disk.insert(Entry::file(42, 0, b"readme", b"hi".to_vec(), 7_000));
    disk.link_child(0, 42).unwrap();
    disk
}

fn write_disk(dir: &Path, name: &str, disk: &Disk) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, disk.save().unwrap()).unwrap();
    path
}

#[test]
fn empty_archive_roundtrip() {
    let disk = Disk::new_seeded(1024, b"hello", 0);
    let bytes = disk.save().unwrap();

    assert_eq!(&bytes[..4], &[0x54, 0x45, 0x56, 0x64]); // "TEVd"
    assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0x19]);
    assert_eq!(bytes.len() as u64, disk.used_bytes());

    let again = Disk::load(&bytes).unwrap();
    assert_eq!(again.capacity, 1024);
    assert_eq!(again.disk_name, b"hello");
    assert_eq!(again.len(), 1);
    assert_eq!(again.children_of(0).unwrap(), &[] as &[i32]);
}

#[test]
fn single_file_roundtrip_and_entry_crc() {
    let disk = single_file_disk();
    let bytes = disk.save().unwrap();
    assert_eq!(bytes.len() as u64, disk.used_bytes());

    let again = Disk::load(&bytes).unwrap();
    let file = again.get(42).unwrap();
    assert_eq!(file.payload, Payload::File(b"hi".to_vec()));
    assert_eq!(file.name, b"readme");
    assert_eq!(again.children_of(0).unwrap(), &[42]);

    // Entry CRC covers the payload region: 6-byte length, then the bytes.
    let expected = tevd::wire::crc_of(&[0, 0, 0, 0, 0, 2, b'h', b'i']);
    assert_eq!(file.payload_crc().unwrap(), expected);
}

#[test]
fn deserialized_entries_match_originals() {
    let now = 123_456;
    let originals = vec![
        Entry::file(5, 0, b"empty", Vec::new(), now),
        Entry::file(6, 0, b"data", vec![1, 2, 3], now),
        Entry::symlink(7, 0, b"link", 6, now),
        Entry {
            handle: 8,
            parent: 0,
            name: b"dir".to_vec(),
            created_at: now,
            modified_at: now + 1,
            payload: Payload::Directory(vec![5, 6, 7]),
        },
        Entry {
            handle: 9,
            parent: 8,
            name: b"packed".to_vec(),
            created_at: now,
            modified_at: now,
            payload: Payload::CompressedFile {
                stored: vec![0xAB; 10],
                uncompressed_len: 64,
            },
        },
    ];
    for original in originals {
        let bytes = original.to_bytes().unwrap();
        assert_eq!(bytes.len() as u64, original.serialized_size());
        let parsed = Entry::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, original);
    }
}

#[test]
fn skim_and_fetch() {
    let dir = tempdir().unwrap();
    let disk = single_file_disk();
    let path = write_disk(dir.path(), "a.tevd", &disk);

    let skimmer = open(&path);
    // Entries are written in ascending handle order: root first at 47.
    assert_eq!(skimmer.offsets()[&0], 47);
    let root_size = disk.get(0).unwrap().serialized_size();
    assert_eq!(skimmer.offsets()[&42], 47 + root_size);

    let file = skimmer.fetch(42).unwrap().unwrap();
    assert_eq!(file.name, b"readme");
    assert_eq!(file.payload, Payload::File(b"hi".to_vec()));
    assert!(skimmer.fetch(9999).unwrap().is_none());
}

#[test]
fn entry_block_size_matches_serialized_size() {
    let dir = tempdir().unwrap();
    let mut disk = single_file_disk();
    disk.insert(Entry::symlink(7, 0, b"link", 42, 7_000));
    disk.link_child(0, 7).unwrap();
    disk.insert(Entry {
        handle: 9,
        parent: 0,
        name: b"packed".to_vec(),
        created_at: 7_000,
        modified_at: 7_000,
        payload: Payload::CompressedFile {
            stored: vec![3; 5],
            uncompressed_len: 99,
        },
    });
    disk.link_child(0, 9).unwrap();
    let path = write_disk(dir.path(), "a.tevd", &disk);

    let skimmer = open(&path);
    for handle in [0, 42, 7, 9] {
        assert_eq!(
            skimmer.entry_block_size(handle).unwrap().unwrap(),
            disk.get(handle).unwrap().serialized_size(),
        );
    }
    assert!(skimmer.entry_block_size(1234).unwrap().is_none());
}

#[test]
fn skimmer_append_then_delete_restores_bytes() {
    let dir = tempdir().unwrap();
    let disk = single_file_disk();
    let path = write_disk(dir.path(), "a.tevd", &disk);
    let original = fs::read(&path).unwrap();

    {
        let mut skimmer = open(&path);
        skimmer
            .append(vec![Entry::symlink(7, 0, b"link", 42, 7_000)])
            .unwrap();

        let link = skimmer.fetch(7).unwrap().unwrap();
        assert_eq!(link.payload, Payload::Symlink(42));
        let file = skimmer.fetch(42).unwrap().unwrap();
        assert_eq!(file.payload, Payload::File(b"hi".to_vec()));
        // Parent child list was extended in the same pass.
        let root = skimmer.fetch(0).unwrap().unwrap();
        assert_eq!(root.payload, Payload::Directory(vec![42, 7]));
    }

    // Reopen from disk: the index must rebuild to the same state.
    {
        let mut skimmer = open(&path);
        assert!(skimmer.fetch(7).unwrap().is_some());
        skimmer.delete(&[7]).unwrap();
        assert!(skimmer.fetch(7).unwrap().is_none());
        let root = skimmer.fetch(0).unwrap().unwrap();
        assert_eq!(root.payload, Payload::Directory(vec![42]));
    }

    // Appending then deleting the same entry leaves the file byte-identical.
    assert_eq!(fs::read(&path).unwrap(), original);
}

#[test]
fn reopened_index_matches_live_state() {
    let dir = tempdir().unwrap();
    let disk = single_file_disk();
    let path = write_disk(dir.path(), "a.tevd", &disk);

    let mut skimmer = open(&path);
    skimmer
        .append(vec![
            Entry::file(100, 0, b"one", vec![1; 300], 7_000),
            Entry::file(101, 0, b"two", vec![2; 7], 7_000),
        ])
        .unwrap();
    skimmer.delete(&[42]).unwrap();

    let reopened = open(&path);
    assert_eq!(reopened.offsets(), skimmer.offsets());
    assert_eq!(reopened.footer_position(), skimmer.footer_position());
}

#[test]
fn create_path_builds_missing_directories() {
    let dir = tempdir().unwrap();
    let disk = Disk::new_seeded(4096, b"tree", 3);
    let path = write_disk(dir.path(), "a.tevd", &disk);

    let mut skimmer = Skimmer::open_seeded(&path, Box::new(Utf8Lossy), 11).unwrap();
    let file = skimmer.create_path("a/b/c.txt", &[0xAA], false).unwrap();

    let skimmer = open(&path);
    let root = skimmer.fetch(0).unwrap().unwrap();
    let Payload::Directory(children) = root.payload else { panic!("root is not a directory") };
    assert_eq!(children.len(), 1);
    let a = skimmer.fetch(children[0]).unwrap().unwrap();
    assert_eq!(a.name, b"a");
    let Payload::Directory(children) = a.payload else { panic!("a is not a directory") };
    assert_eq!(children.len(), 1);
    let b = skimmer.fetch(children[0]).unwrap().unwrap();
    assert_eq!(b.name, b"b");
    let Payload::Directory(children) = b.payload.clone() else { panic!("b is not a directory") };
    assert_eq!(children, vec![file]);
    let c = skimmer.fetch(file).unwrap().unwrap();
    assert_eq!(c.name, b"c.txt");
    assert_eq!(c.parent, b.handle);
    assert_eq!(c.payload, Payload::File(vec![0xAA]));
}

#[test]
fn create_path_overwrite_semantics() {
    let dir = tempdir().unwrap();
    let disk = Disk::new_seeded(4096, b"tree", 4);
    let path = write_disk(dir.path(), "a.tevd", &disk);

    let mut skimmer = Skimmer::open_seeded(&path, Box::new(Utf8Lossy), 12).unwrap();
    let first = skimmer.create_path("docs/readme", b"v1", false).unwrap();

    match skimmer.create_path("docs/readme", b"v2", false) {
        Err(TevdError::AlreadyExists(p)) => assert_eq!(p, "docs/readme"),
        other => panic!("expected AlreadyExists, got {other:?}"),
    }

    let created = skimmer.fetch(first).unwrap().unwrap().created_at;
    let second = skimmer.create_path("docs/readme", b"v2", true).unwrap();
    assert_eq!(second, first);
    let entry = skimmer.fetch(first).unwrap().unwrap();
    assert_eq!(entry.payload, Payload::File(b"v2".to_vec()));
    assert_eq!(entry.created_at, created);

    // Overwriting a directory is refused.
    match skimmer.create_path("docs", b"x", true) {
        Err(TevdError::AlreadyExists(_)) => {}
        other => panic!("expected AlreadyExists, got {other:?}"),
    }
}

#[test]
fn create_path_through_a_file_fails() {
    let dir = tempdir().unwrap();
    let disk = single_file_disk();
    let path = write_disk(dir.path(), "a.tevd", &disk);

    let mut skimmer = Skimmer::open_seeded(&path, Box::new(Utf8Lossy), 13).unwrap();
    match skimmer.create_path("readme/below", b"x", false) {
        Err(TevdError::NotADirectory(name)) => assert_eq!(name, "readme"),
        other => panic!("expected NotADirectory, got {other:?}"),
    }
}

#[test]
fn full_width_names_roundtrip() {
    let dir = tempdir().unwrap();
    let name = [b'x'; 256];
    let mut disk = Disk::new_seeded(4096, b"names", 5);
    disk.insert(Entry::file(10, 0, &name, b"payload".to_vec(), 1));
    disk.link_child(0, 10).unwrap();
    let bytes = disk.save().unwrap();

    let again = Disk::load(&bytes).unwrap();
    assert_eq!(again.get(10).unwrap().name, name);

    let path = dir.path().join("a.tevd");
    fs::write(&path, &bytes).unwrap();
    assert_eq!(open(&path).fetch(10).unwrap().unwrap().name, name);
}

#[test]
fn handles_adjacent_to_the_sentinel() {
    let dir = tempdir().unwrap();
    let below = 0xFEFE_FEFDu32 as i32;
    let above = 0xFEFE_FEFFu32 as i32;
    let mut disk = Disk::new_seeded(4096, b"edges", 6);
    disk.insert(Entry::file(below, 0, b"below", vec![1], 1));
    disk.insert(Entry::file(above, 0, b"above", vec![2], 1));
    disk.link_child(0, below).unwrap();
    disk.link_child(0, above).unwrap();
    let bytes = disk.save().unwrap();

    let again = Disk::load(&bytes).unwrap();
    assert!(again.get(below).is_some());
    assert!(again.get(above).is_some());

    let path = dir.path().join("a.tevd");
    fs::write(&path, &bytes).unwrap();
    let skimmer = open(&path);
    assert_eq!(
        skimmer.fetch(below).unwrap().unwrap().payload,
        Payload::File(vec![1])
    );
    assert_eq!(
        skimmer.fetch(above).unwrap().unwrap().payload,
        Payload::File(vec![2])
    );
}

#[test]
fn archive_crc_ignores_insertion_order() {
    let mut a = Disk::new_seeded(4096, b"order", 7);
    a.insert(Entry::file(1, 0, b"one", vec![1], 1));
    a.insert(Entry::file(2, 0, b"two", vec![2], 1));
    a.link_child(0, 1).unwrap();
    a.link_child(0, 2).unwrap();

    let mut b = Disk::new_seeded(4096, b"order", 8);
    b.insert(Entry::file(2, 0, b"two", vec![2], 1));
    b.insert(Entry::file(1, 0, b"one", vec![1], 1));
    b.link_child(0, 2).unwrap();
    b.link_child(0, 1).unwrap();

    assert_eq!(a.archive_crc().unwrap(), b.archive_crc().unwrap());
}

#[test]
fn corruption_is_reported() {
    let disk = single_file_disk();
    let bytes = disk.save().unwrap();

    // Bad magic.
    let mut bad = bytes.clone();
    bad[0] ^= 0xFF;
    assert!(matches!(Disk::load(&bad), Err(TevdError::BadMagic)));

    // Flip a byte inside the file payload (the last payload byte of the
    // final entry, just before the footer framing).
    let mut bad = bytes.clone();
    let i = bytes.len() - 2 - 1 - 4 - 1; // EOF mark, footer flag byte, sentinel, 'i'
    assert_eq!(bad[i], b'i');
    bad[i] = b'o';
    assert!(matches!(Disk::load(&bad), Err(TevdError::EntryCorrupt(42))));

    // Flip the archive CRC in the header.
    let mut bad = bytes.clone();
    bad[42] ^= 0xFF;
    assert!(matches!(Disk::load(&bad), Err(TevdError::ArchiveCorrupt)));

    // Truncation.
    assert!(matches!(
        Disk::load(&bytes[..bytes.len() - 3]),
        Err(TevdError::Malformed(_))
    ));
}

#[test]
fn structurally_invalid_archives_are_rejected() {
    // A non-root entry whose parent handle was never written.
    let mut disk = Disk::new_seeded(4096, b"broken", 15);
    disk.insert(Entry::file(30, 777, b"dangling", vec![1], 1));
    assert!(matches!(
        Disk::load(&disk.save().unwrap()),
        Err(TevdError::Malformed(_))
    ));

    // A parent that exists but is not a directory.
    let mut disk = single_file_disk();
    disk.insert(Entry::file(43, 42, b"under-a-file", vec![2], 1));
    assert!(matches!(
        Disk::load(&disk.save().unwrap()),
        Err(TevdError::Malformed(_))
    ));

    // A root entry carrying a non-root parent.
    let mut disk = single_file_disk();
    disk.get_mut(0).unwrap().parent = 9;
    assert!(matches!(
        Disk::load(&disk.save().unwrap()),
        Err(TevdError::Malformed(_))
    ));
}

#[test]
fn append_rejects_duplicate_handles_in_one_batch() {
    let dir = tempdir().unwrap();
    let disk = single_file_disk();
    let path = write_disk(dir.path(), "a.tevd", &disk);
    let original = fs::read(&path).unwrap();

    let mut skimmer = open(&path);
    let result = skimmer.append(vec![
        Entry::file(60, 0, b"first", vec![1], 0),
        Entry::file(60, 0, b"second", vec![2], 0),
    ]);
    assert!(matches!(result, Err(TevdError::Malformed(_))));

    // The batch was refused before any file I/O or index change.
    assert_eq!(fs::read(&path).unwrap(), original);
    assert!(skimmer.fetch(60).unwrap().is_none());
    let reopened = open(&path);
    assert_eq!(reopened.offsets(), skimmer.offsets());
}

#[test]
fn directory_capacity_is_enforced() {
    let mut children: Vec<i32> = (1..=65_535).collect();
    let entry = Entry {
        handle: 99,
        parent: 0,
        name: b"big".to_vec(),
        created_at: 0,
        modified_at: 0,
        payload: Payload::Directory(children.clone()),
    };
    assert_eq!(entry.serialized_size(), 281 + 2 + 4 * 65_535);
    assert!(entry.payload_bytes().is_ok());

    children.push(65_536);
    let over = Entry {
        payload: Payload::Directory(children),
        ..entry
    };
    assert!(matches!(over.payload_bytes(), Err(TevdError::DirectoryFull)));
}

#[test]
fn read_only_archives_refuse_edits() {
    let dir = tempdir().unwrap();
    let mut disk = single_file_disk();
    disk.set_read_only(true);
    assert!(disk.is_read_only());
    let path = write_disk(dir.path(), "ro.tevd", &disk);

    let mut skimmer = open(&path);
    assert!(skimmer.is_read_only());
    assert!(skimmer.delete(&[42]).is_err());
    assert!(skimmer
        .append(vec![Entry::file(9, 0, b"x", vec![], 0)])
        .is_err());

    disk.set_read_only(false);
    assert!(!disk.is_read_only());

    // Capacity zero is read-only regardless of the flag.
    let empty = Disk::new_seeded(0, b"frozen", 9);
    assert!(empty.is_read_only());
}

#[test]
fn unique_handles_avoid_reserved_values() {
    let mut disk = Disk::new_seeded(4096, b"rng", 10);
    let mut seen = std::collections::HashSet::new();
    for _ in 0..64 {
        let handle = disk.generate_unique_handle();
        assert_ne!(handle, 0);
        assert_ne!(handle as u32, 0xFEFE_FEFE);
        assert!(seen.insert(handle));
        disk.insert(Entry::file(handle, 0, b"f", vec![], 0));
    }
}

#[test]
fn footer_bytes_are_preserved_verbatim() {
    let dir = tempdir().unwrap();
    let mut disk = single_file_disk();
    disk.footer = vec![0x02, 0xCA, 0xFE, 0xBA, 0xBE];
    let path = write_disk(dir.path(), "a.tevd", &disk);

    let mut skimmer = open(&path);
    assert_eq!(skimmer.footer_bytes(), &[0x02, 0xCA, 0xFE, 0xBA, 0xBE]);
    skimmer
        .append(vec![Entry::file(50, 0, b"new", vec![5], 0)])
        .unwrap();

    let reopened = open(&path);
    assert_eq!(reopened.footer_bytes(), &[0x02, 0xCA, 0xFE, 0xBA, 0xBE]);
    let loaded = Disk::load(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(loaded.footer, vec![0x02, 0xCA, 0xFE, 0xBA, 0xBE]);
}

#[test]
fn crashed_commit_is_recovered_on_open() {
    let dir = tempdir().unwrap();
    let disk = single_file_disk();
    let path = write_disk(dir.path(), "a.tevd", &disk);
    let original = fs::read(&path).unwrap();

    // The rename to backup finished but the copy never happened.
    let old = dir.path().join("a.tevd_old");
    fs::rename(&path, &old).unwrap();
    // A half-written temp file is also lying around.
    fs::write(dir.path().join("a.tevd_tmp"), b"garbage").unwrap();

    let skimmer = open(&path);
    assert!(skimmer.fetch(42).unwrap().is_some());
    assert_eq!(fs::read(&path).unwrap(), original);
    assert!(!dir.path().join("a.tevd_tmp").exists());
    assert!(!old.exists());
}

#[test]
fn rebuild_child_lists_repairs_stale_directories() {
    let dir = tempdir().unwrap();
    let mut disk = Disk::new_seeded(4096, b"stale", 14);
    // An entry whose parent never learned about it.
    disk.insert(Entry::file(21, 0, b"lost", vec![9], 1));
    let path = write_disk(dir.path(), "a.tevd", &disk);

    let mut skimmer = open(&path);
    assert_eq!(
        skimmer.fetch(0).unwrap().unwrap().payload,
        Payload::Directory(vec![])
    );
    skimmer.rebuild_child_lists().unwrap();
    assert_eq!(
        skimmer.fetch(0).unwrap().unwrap().payload,
        Payload::Directory(vec![21])
    );

    // The repaired archive loads cleanly in the in-memory engine.
    let loaded = Disk::load(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(loaded.children_of(0).unwrap(), &[21]);
}
