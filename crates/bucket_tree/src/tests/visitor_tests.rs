use byteorder::{ByteOrder, LittleEndian};
use storage::{FsError, Storage};

use super::helpers::*;

// -------------------- Forward traversal --------------------

#[test]
fn move_next_visits_every_entry_in_order() {
    // 150 entries across three entry sets.
    let entries = evenly_spaced(150, 0, 0x10);
    let f = build(&entries, 150 * 0x10);
    let tree = f.open();

    let mut v = tree.find(0).unwrap();
    let mut seen = vec![v.get::<TestEntry>()];
    while v.can_move_next() {
        v.move_next().unwrap();
        seen.push(v.get::<TestEntry>());
    }

    assert_eq!(seen, entries);
    assert!(!v.can_move_next());
    assert!(matches!(v.move_next().unwrap_err(), FsError::OutOfRange));
}

#[test]
fn can_move_next_false_only_at_last_entry() {
    let entries = evenly_spaced(130, 0x100, 0x8);
    let f = build(&entries, 0x100 + 130 * 0x8);
    let tree = f.open();

    for (i, e) in entries.iter().enumerate() {
        let v = tree.find(e.offset).unwrap();
        assert_eq!(v.can_move_next(), i + 1 < entries.len(), "entry {i}");
        assert_eq!(v.can_move_previous(), i > 0, "entry {i}");
    }
}

#[test]
fn traversal_from_middle_of_l2_tree() {
    let count = 126 * 63 + 10;
    let entries = evenly_spaced(count, 0, 0x10);
    let f = build(&entries, count as i64 * 0x10);
    let tree = f.open();

    let start = count - 200;
    let mut v = tree.find(entries[start].offset + 1).unwrap();
    let mut expected = start;
    loop {
        assert_eq!(v.get::<TestEntry>().value, expected as u64);
        if !v.can_move_next() {
            break;
        }
        v.move_next().unwrap();
        expected += 1;
    }
    assert_eq!(expected, count - 1);
}

// -------------------- Backward traversal --------------------

#[test]
fn move_previous_walks_back_across_sets() {
    let entries = evenly_spaced(140, 0, 0x10);
    let f = build(&entries, 140 * 0x10);
    let tree = f.open();

    let mut v = tree.find(139 * 0x10).unwrap();
    let mut seen = vec![v.get::<TestEntry>().value];
    while v.can_move_previous() {
        v.move_previous().unwrap();
        seen.push(v.get::<TestEntry>().value);
    }

    let expected: Vec<u64> = (0..140).rev().collect();
    assert_eq!(seen, expected);
    assert!(matches!(v.move_previous().unwrap_err(), FsError::OutOfRange));
}

#[test]
fn next_then_previous_returns_to_start() {
    let entries = evenly_spaced(70, 0, 0x10);
    let f = build(&entries, 70 * 0x10);
    let tree = f.open();

    // Entry 62 is the last of the first set.
    let mut v = tree.find(62 * 0x10).unwrap();
    v.move_next().unwrap();
    assert_eq!(v.get::<TestEntry>().value, 63);
    v.move_previous().unwrap();
    assert_eq!(v.get::<TestEntry>().value, 62);
}

// -------------------- Corruption --------------------

#[test]
fn move_next_detects_discontinuous_entry_sets() {
    let entries = evenly_spaced(70, 0, 0x10);
    let f = build(&entries, 70 * 0x10);
    let tree = f.open();

    // Shift the first entry of set 1 so it no longer starts where set 0 ends.
    let mut bad = [0u8; 8];
    LittleEndian::write_i64(&mut bad, 63 * 0x10 + 8);
    f.entry.write(NODE_SIZE as i64 + 16, &bad).unwrap();

    let mut v = tree.find(62 * 0x10).unwrap();
    let err = v.move_next().unwrap_err();
    assert!(matches!(err, FsError::InvalidBucketTreeEntrySetOffset));
    assert!(!v.is_valid());
    assert!(!v.can_move_next());
}

#[test]
#[should_panic(expected = "entry type size does not match the tree")]
fn get_with_wrong_entry_type_panics() {
    let f = build(&evenly_spaced(2, 0, 0x10), 0x20);
    let tree = f.open();
    let v = tree.find(0).unwrap();
    let _ = v.get::<MappedEntry>();
}
