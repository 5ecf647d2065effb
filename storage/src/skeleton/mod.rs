//! B-trees that can be partially loaded from, and persisted to, a content-addressed store.
//!
//! # Overview
//!
//! A [SkeletonBTreeMap] is an ordinary in-memory B-tree of minimum degree `node_min`, except that
//! any subtree may be a _ghost_: a [Ghost] holding only the address the subtree was pushed to and
//! the number of entries it contains. A node whose children are all ghosts is _bare_; a map is
//! bare when its root is.
//!
//! Nodes move through a [NodeArchiver], which translates each node to a
//! [freelib_codec::Record] (`{entries, subnodes: [{meta, size}]}`) and hands it to a leaf
//! [crate::serial::LiveArchiver]. With a thread pool configured, [SkeletonBTreeMap::inflate] and
//! [SkeletonBTreeMap::deflate] pull or push a whole level of nodes in parallel through a
//! [crate::scheduler::ObjectProcessor].
//!
//! # Lifecycle
//!
//! - `inflate_key` pulls the nodes on the path to one key; `inflate` pulls everything.
//! - `update` and `update_with` apply a batch of puts and removes, pulling ghosts on the touched
//!   paths. Updates never deflate on their own.
//! - `deflate` pushes every modified node, children before parents, and leaves the map bare.
//!   Unmodified nodes return to their original ghost without I/O.
//!
//! Read-only queries (`get`, `contains_key`, `iter`) never perform I/O and panic if they reach a
//! ghost.
//!
//! # Example
//!
//! ```rust
//! use freelib_codec::{BinaryStream, Inline, Record, StringKey};
//! use freelib_storage::{
//!     serial::{LiveArchiver, MemoryArchiver, MemoryConfig},
//!     skeleton::{MapEntries, NodeArchiver, SkeletonBTreeMap},
//! };
//! use std::{collections::{BTreeMap, BTreeSet}, sync::Arc};
//!
//! let store: Arc<dyn LiveArchiver<Record>> = Arc::new(MemoryArchiver::new(MemoryConfig {
//!     stream: BinaryStream::default(),
//!     registry: None,
//! }));
//! let entries = Arc::new(MapEntries::<String, i64>::new(Arc::new(StringKey), Arc::new(Inline)));
//!
//! let mut map = SkeletonBTreeMap::<String, i64>::new(2);
//! map.set_archiver(NodeArchiver::new(store, entries));
//! let puts: BTreeMap<_, _> = (0..100).map(|i| (format!("key{i}"), i)).collect();
//! map.update(puts, BTreeSet::new()).unwrap();
//!
//! map.deflate().unwrap();
//! assert!(map.is_bare());
//!
//! map.inflate_key(&"key42".to_string()).unwrap();
//! assert_eq!(map.get("key42"), Some(&42));
//! ```

mod map;
mod node;
mod set;
mod translate;

pub use map::{Binding, Iter, SkeletonBTreeMap};
pub use node::{Ghost, NodeArchiver, NodeTranslator, SkeletonNode};
pub use set::SkeletonBTreeSet;
pub use translate::{MapEntries, SetEntries, SetTranslator, TreeTranslator};
