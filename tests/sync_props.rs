//! Property tests: arbitrary edit sequences must reconstruct exactly.

use std::io::Cursor;

use md5::Digest;
use proptest::prelude::*;
use tempfile::TempDir;
use uuid::Uuid;

use arw::chunk::ChunkEntry;
use arw::filer::Filer;
use arw::store::BlockStore;
use arw::sync::{diff, generate, DiffOutcome, StoreCallbacks};

#[derive(Debug, Clone)]
enum Edit {
    Insert { at: usize, bytes: Vec<u8> },
    Delete { at: usize, len: usize },
    Replace { at: usize, bytes: Vec<u8> },
}

fn apply(base: &[u8], edits: &[Edit]) -> Vec<u8> {
    let mut data = base.to_vec();
    for edit in edits {
        match edit {
            Edit::Insert { at, bytes } => {
                let at = at % (data.len() + 1);
                data.splice(at..at, bytes.iter().copied());
            }
            Edit::Delete { at, len } => {
                if data.is_empty() {
                    continue;
                }
                let at = at % data.len();
                let end = (at + len).min(data.len());
                data.drain(at..end);
            }
            Edit::Replace { at, bytes } => {
                if data.is_empty() {
                    continue;
                }
                let at = at % data.len();
                let end = (at + bytes.len()).min(data.len());
                data[at..end].copy_from_slice(&bytes[..end - at]);
            }
        }
    }
    data
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (any::<usize>(), proptest::collection::vec(any::<u8>(), 1..600))
            .prop_map(|(at, bytes)| Edit::Insert { at, bytes }),
        (any::<usize>(), 1..2000usize).prop_map(|(at, len)| Edit::Delete { at, len }),
        (any::<usize>(), proptest::collection::vec(any::<u8>(), 1..600))
            .prop_map(|(at, bytes)| Edit::Replace { at, bytes }),
    ]
}

fn reconstruct(store: &mut BlockStore, filer: &Filer, uuid: &Uuid) -> Vec<u8> {
    let record = filer.open_version(uuid, false).unwrap();
    let mut out = Vec::new();
    let mut buf = vec![0u8; arw::MAX_CHUNK_SIZE as usize];
    for entry in record.entries() {
        match entry.unwrap() {
            ChunkEntry::End => break,
            ChunkEntry::Direct { len, data } => out.extend_from_slice(&data[..len as usize]),
            ChunkEntry::Reference { length, id } => {
                let n = store.get(&id, &mut buf).unwrap();
                assert_eq!(n, length as usize);
                out.extend_from_slice(&buf[..n]);
            }
        }
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn edited_inputs_reconstruct_bit_for_bit(
        base in proptest::collection::vec(any::<u8>(), 0..25_000),
        edits in proptest::collection::vec(edit_strategy(), 1..4),
    ) {
        let dir = TempDir::new().unwrap();
        let mut store = BlockStore::open(dir.path()).unwrap();
        let filer = Filer::open(dir.path()).unwrap();

        // First version of the base content.
        let basis_uuid = Uuid::new_v4();
        let mut basis = filer.open_version(&basis_uuid, true).unwrap();
        let outcome = {
            let mut cb = StoreCallbacks { store: &mut store, out: &mut basis };
            generate(&mut Cursor::new(base.clone()), &mut cb).unwrap()
        };
        basis.set_chunk_size(outcome.chunk_size);
        basis.set_hash(&outcome.hash);
        basis.remap().unwrap();

        prop_assert_eq!(&reconstruct(&mut store, &filer, &basis_uuid), &base);

        // Second version after arbitrary edits.
        let derived = apply(&base, &edits);
        let new_uuid = Uuid::new_v4();
        let mut record = filer.open_version(&new_uuid, true).unwrap();
        record.set_chunk_size(basis.chunk_size());
        let outcome = {
            let mut cb = StoreCallbacks { store: &mut store, out: &mut record };
            diff(&basis, &mut Cursor::new(derived.clone()), &mut cb, true).unwrap()
        };
        match outcome {
            DiffOutcome::Unchanged => prop_assert_eq!(&derived, &base),
            DiffOutcome::Synced { hash } => {
                record.set_hash(&hash);
                record.remap().unwrap();
                drop(record);
                prop_assert_eq!(&reconstruct(&mut store, &filer, &new_uuid), &derived);
                prop_assert_eq!(hash, <[u8; 16]>::from(md5::Md5::digest(&derived)));
            }
        }
    }
}
