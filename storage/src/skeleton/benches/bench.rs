use criterion::criterion_main;
use freelib_codec::{BinaryStream, Inline, Record, StringKey};
use freelib_storage::{
    scheduler::{create_pool, Metrics},
    serial::{LiveArchiver, MemoryArchiver, MemoryConfig},
    skeleton::{MapEntries, NodeArchiver, SkeletonBTreeMap},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{collections::BTreeMap, sync::Arc};


criterion_main!(update::benches, deflate::benches);

/// Minimum degree used by every benchmark tree.
const NODE_MIN: usize = 64;

/// A map backed by an in-memory store, with node I/O on `threads` workers when non-zero.
fn map(threads: usize) -> SkeletonBTreeMap<String, u64> {
    let store: Arc<dyn LiveArchiver<Record>> = Arc::new(MemoryArchiver::new(MemoryConfig {
        stream: BinaryStream::default(),
        registry: None,
    }));
    let entries = Arc::new(MapEntries::<String, u64>::new(
        Arc::new(StringKey),
        Arc::new(Inline),
    ));
    let mut archiver = NodeArchiver::new(store, entries);
    if threads > 0 {
        let pool = create_pool(threads).unwrap();
        archiver = archiver.with_pool(pool, Metrics::default());
    }
    let mut map = SkeletonBTreeMap::new(NODE_MIN);
    map.set_archiver(archiver);
    map
}

/// `n` random entries with 16-character keys.
fn random_entries(n: usize, seed: u64) -> BTreeMap<String, u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let key = (0..16).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
            (key, rng.gen_range(0..1 << 40))
        })
        .collect()
}
