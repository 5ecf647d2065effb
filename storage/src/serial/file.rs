//! Directory-backed content-addressed block store.
//!
//! # Format
//!
//! Each block lives in its own file, named by the hex SHA-256 of its address. The first byte of
//! the file records whether the rest is the raw block or a `zstd` frame, so the compression level
//! may change between instances sharing a directory.
//!
//! # Asynchronous inserts
//!
//! When a thread pool is configured, pushes return as soon as the address is known and the write
//! completes in the background. Pending blocks are served from memory until written.
//! [FileArchiver::wait_for_async_inserts] blocks until every write issued so far has finished.

use super::{Archiver, IterableArchiver, LiveArchiver, Progress, PullTask, PushTask};
use crate::{
    address::{Address, AddressKind},
    hex,
    scheduler::ThreadPool,
    sha256, Error,
};
use bytes::Bytes;
use freelib_codec::{ObjectStreamReader, ObjectStreamWriter, Record};
use futures::{channel::oneshot, executor::block_on, future::join_all};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{debug, trace, warn};
use zstd::{bulk::compress, decode_all};

const HEADER_RAW: u8 = 0;
const HEADER_ZSTD: u8 = 1;

/// Configuration for [FileArchiver].
#[derive(Clone)]
pub struct Config<S> {
    /// Directory holding one file per block. Created if missing.
    pub directory: PathBuf,

    /// Optional compression level (using `zstd`) to apply to blocks before storing.
    pub compression: Option<u8>,

    /// Framing used to turn records into blocks.
    pub stream: S,

    /// Pool for background writes. Writes are synchronous when `None`.
    pub pool: Option<ThreadPool>,

    /// Registry for metrics, if any.
    pub registry: Option<Arc<Mutex<Registry>>>,
}

/// Stores blocks as files in a directory.
pub struct FileArchiver<S> {
    directory: PathBuf,
    compression: Option<u8>,
    stream: S,
    pool: Option<ThreadPool>,

    pending: Arc<Mutex<HashMap<Address, Bytes>>>,
    waiters: Mutex<Vec<oneshot::Receiver<Result<(), Error>>>>,

    pulls: Counter,
    pushes: Counter,
    bytes_written: Counter,
}

fn encode_file(block: &[u8], compression: Option<u8>) -> Result<Vec<u8>, Error> {
    let mut contents = Vec::with_capacity(block.len() + 1);
    match compression {
        Some(level) => {
            let compressed = compress(block, level as i32)
                .map_err(|err| Error::abort_with("compression failed", err, false))?;
            contents.push(HEADER_ZSTD);
            contents.extend_from_slice(&compressed);
        }
        None => {
            contents.push(HEADER_RAW);
            contents.extend_from_slice(block);
        }
    }
    Ok(contents)
}

fn decode_file(contents: &[u8]) -> Result<Vec<u8>, Error> {
    match contents.split_first() {
        Some((&HEADER_RAW, block)) => Ok(block.to_vec()),
        Some((&HEADER_ZSTD, frame)) => {
            decode_all(frame).map_err(|err| Error::abort_with("decompression failed", err, false))
        }
        Some((other, _)) => Err(Error::abort(format!("unknown block header {other}"), false)),
        None => Err(Error::abort("empty block file", false)),
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|err| Error::abort_with(format!("write {}", path.display()), err, true))
}

impl<S> FileArchiver<S> {
    /// Opens (creating if necessary) the directory named in `cfg`.
    pub fn init(cfg: Config<S>) -> Result<Self, Error> {
        fs::create_dir_all(&cfg.directory)
            .map_err(|err| Error::abort_with("create block directory", err, true))?;
        let pulls = Counter::default();
        let pushes = Counter::default();
        let bytes_written = Counter::default();
        if let Some(registry) = &cfg.registry {
            let mut registry = registry.lock().unwrap();
            registry.register("pulls", "Number of blocks pulled", pulls.clone());
            registry.register("pushes", "Number of blocks pushed", pushes.clone());
            registry.register(
                "bytes_written",
                "Number of bytes written to block files",
                bytes_written.clone(),
            );
        }
        debug!(
            directory = %cfg.directory.display(),
            compression = ?cfg.compression,
            background = cfg.pool.is_some(),
            "opened file archiver"
        );
        Ok(Self {
            directory: cfg.directory,
            compression: cfg.compression,
            stream: cfg.stream,
            pool: cfg.pool,
            pending: Arc::new(Mutex::new(HashMap::new())),
            waiters: Mutex::new(Vec::new()),
            pulls,
            pushes,
            bytes_written,
        })
    }

    fn path(&self, address: &Address) -> PathBuf {
        self.directory
            .join(hex(&sha256(address.as_str().as_bytes())))
    }

    pub fn pulls(&self) -> u64 {
        self.pulls.get()
    }

    pub fn pushes(&self) -> u64 {
        self.pushes.get()
    }

    fn read_block(&self, address: &Address) -> Result<Bytes, Error> {
        if let Some(block) = self.pending.lock().unwrap().get(address) {
            return Ok(block.clone());
        }
        let path = self.path(address);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::abort_with(
                    format!("block not found: {address}"),
                    err,
                    false,
                ))
            }
            Err(err) => {
                return Err(Error::abort_with(
                    format!("read {}", path.display()),
                    err,
                    true,
                ))
            }
        };
        let block = Bytes::from(decode_file(&contents)?);
        if address.kind() == AddressKind::Chk && Address::content_hash(&block) != *address {
            warn!(%address, "block does not match its content hash");
            return Err(Error::abort(
                format!("content hash mismatch: {address}"),
                false,
            ));
        }
        Ok(block)
    }
}

impl<S: ObjectStreamReader + ObjectStreamWriter> Archiver<Record> for FileArchiver<S> {
    fn pull(&self, task: &mut PullTask<Record>) -> Result<(), Error> {
        self.pull_live(task, None)
    }

    fn push(&self, task: &mut PushTask<Record>) -> Result<(), Error> {
        self.push_live(task, None)
    }
}

impl<S: ObjectStreamReader + ObjectStreamWriter> IterableArchiver<Record> for FileArchiver<S> {}

impl<S: ObjectStreamReader + ObjectStreamWriter> LiveArchiver<Record> for FileArchiver<S> {
    fn pull_live(
        &self,
        task: &mut PullTask<Record>,
        progress: Option<&dyn Progress>,
    ) -> Result<(), Error> {
        if let Some(progress) = progress {
            progress.add_part_known(1, true);
        }
        let block = self.read_block(&task.meta)?;
        task.data = Some(self.stream.read_object(&block)?);
        self.pulls.inc();
        trace!(address = %task.meta, len = block.len(), "pulled block");
        if let Some(progress) = progress {
            progress.add_part_done();
        }
        Ok(())
    }

    fn push_live(
        &self,
        task: &mut PushTask<Record>,
        progress: Option<&dyn Progress>,
    ) -> Result<(), Error> {
        if let Some(progress) = progress {
            progress.add_part_known(1, true);
        }
        let block = self.stream.write_object(&task.data)?;
        let address = match task.meta.take() {
            Some(hint) if hint.kind() != AddressKind::Chk => hint,
            _ => Address::content_hash(&block),
        };
        let path = self.path(&address);
        let len = block.len();
        match &self.pool {
            None => {
                let contents = encode_file(&block, self.compression)?;
                write_file(&path, &contents)?;
                self.bytes_written.inc_by(contents.len() as u64);
            }
            Some(pool) => {
                self.pending
                    .lock()
                    .unwrap()
                    .insert(address.clone(), block.clone());
                let (sender, receiver) = oneshot::channel();
                self.waiters.lock().unwrap().push(receiver);

                let pending = self.pending.clone();
                let bytes_written = self.bytes_written.clone();
                let compression = self.compression;
                let address = address.clone();
                pool.spawn(move || {
                    let result = encode_file(&block, compression).and_then(|contents| {
                        write_file(&path, &contents)?;
                        bytes_written.inc_by(contents.len() as u64);
                        Ok(())
                    });
                    if result.is_ok() {
                        pending.lock().unwrap().remove(&address);
                    }
                    let _ = sender.send(result);
                });
            }
        }
        self.pushes.inc();
        trace!(%address, len, "pushed block");
        task.meta = Some(address);
        if let Some(progress) = progress {
            progress.add_part_done();
        }
        Ok(())
    }

    fn wait_for_async_inserts(&self) -> Result<(), Error> {
        let waiters = std::mem::take(&mut *self.waiters.lock().unwrap());
        if waiters.is_empty() {
            return Ok(());
        }
        debug!(count = waiters.len(), "waiting for background inserts");
        let mut first = None;
        for result in block_on(join_all(waiters)) {
            let err = match result {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(canceled) => Error::abort_with("background insert abandoned", canceled, true),
            };
            first.get_or_insert(err);
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::create_pool;
    use freelib_codec::BinaryStream;
    use std::time::{SystemTime, UNIX_EPOCH};
    use test_case::test_case;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("freelib-{name}-{}-{nanos}", std::process::id()))
    }

    fn config(directory: PathBuf, compression: Option<u8>) -> Config<BinaryStream> {
        Config {
            directory,
            compression,
            stream: BinaryStream::default(),
            pool: None,
            registry: None,
        }
    }

    fn sample(i: i64) -> Record {
        let mut record = Record::map();
        record.insert("index", i);
        record.insert("padding", "x".repeat(256));
        record
    }

    #[test_case(None; "raw")]
    #[test_case(Some(3); "compressed")]
    fn test_push_pull(compression: Option<u8>) {
        let directory = temp_dir("push-pull");
        let archiver = FileArchiver::init(config(directory.clone(), compression)).unwrap();

        let mut push = PushTask::new(sample(1));
        archiver.push(&mut push).unwrap();
        let address = push.meta.unwrap();

        let mut pull = PullTask::new(address);
        archiver.pull(&mut pull).unwrap();
        assert_eq!(pull.data, Some(sample(1)));
        assert_eq!(archiver.pulls(), 1);
        assert_eq!(archiver.pushes(), 1);

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_reopen_with_other_compression() {
        let directory = temp_dir("reopen");
        let address = {
            let archiver = FileArchiver::init(config(directory.clone(), Some(5))).unwrap();
            let mut push = PushTask::new(sample(2));
            archiver.push(&mut push).unwrap();
            push.meta.unwrap()
        };

        let archiver = FileArchiver::init(config(directory.clone(), None)).unwrap();
        let mut pull = PullTask::new(address);
        archiver.pull(&mut pull).unwrap();
        assert_eq!(pull.data, Some(sample(2)));

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_missing_block() {
        let directory = temp_dir("missing");
        let archiver = FileArchiver::init(config(directory.clone(), None)).unwrap();
        let mut pull = PullTask::new(Address::parse("CHK@0,2,A3").unwrap());
        let err = archiver.pull(&mut pull).unwrap_err();
        assert!(matches!(err, Error::Abort { retryable: false, .. }));

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_corruption_detected() {
        let directory = temp_dir("corrupt");
        let archiver = FileArchiver::init(config(directory.clone(), None)).unwrap();
        let mut push = PushTask::new(sample(3));
        archiver.push(&mut push).unwrap();
        let address = push.meta.unwrap();

        // Replace the stored block with a different (well-formed) one
        let other = BinaryStream::default().write_object(&sample(4)).unwrap();
        let contents = encode_file(&other, None).unwrap();
        fs::write(archiver.path(&address), contents).unwrap();

        let mut pull = PullTask::new(address);
        let err = archiver.pull(&mut pull).unwrap_err();
        assert!(err.to_string().contains("content hash mismatch"));

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_background_inserts() {
        let directory = temp_dir("background");
        let mut cfg = config(directory.clone(), Some(1));
        cfg.pool = Some(create_pool(2).unwrap());
        let archiver = FileArchiver::init(cfg).unwrap();

        // Step 1: push many blocks without waiting
        let mut addresses = Vec::new();
        for i in 0..50 {
            let mut push = PushTask::new(sample(i));
            archiver.push(&mut push).unwrap();
            addresses.push(push.meta.unwrap());
        }

        // Step 2: blocks are readable before their writes complete
        let mut pull = PullTask::new(addresses[49].clone());
        archiver.pull(&mut pull).unwrap();
        assert_eq!(pull.data, Some(sample(49)));

        // Step 3: after the barrier every block is on disk
        archiver.wait_for_async_inserts().unwrap();
        assert!(archiver.pending.lock().unwrap().is_empty());
        for (i, address) in addresses.iter().enumerate() {
            assert!(archiver.path(address).exists());
            let mut pull = PullTask::new(address.clone());
            archiver.pull(&mut pull).unwrap();
            assert_eq!(pull.data, Some(sample(i as i64)));
        }

        fs::remove_dir_all(directory).unwrap();
    }
}
