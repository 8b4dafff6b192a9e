//! Durable, append-only slot log backed by RocksDB.
//!
//! Keys are the big-endian fixed-width encoding of the slot index, so raw
//! iteration order is slot order. Entries are bincode-framed [`LogEntry`]
//! records; the framing round-trips bit-exactly. Length and the last entry's
//! term are cached in memory and recomputed from the tail key on open, which
//! makes truncation crash-safe: a restart always agrees with whatever slots
//! survived.

use crate::error::{KeystoneError, Result};
use crate::types::{LogEntry, SlotIndex, Term};
use parking_lot::Mutex;
use rocksdb::{BlockBasedOptions, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;

/// Binlog tunables, lifted from the replica configuration.
#[derive(Debug, Clone)]
pub struct BinLogOptions {
    pub compress: bool,
    /// Block size in KiB.
    pub block_size: usize,
    /// Write buffer size in MiB.
    pub write_buffer_size: usize,
}

impl Default for BinLogOptions {
    fn default() -> Self {
        Self {
            compress: false,
            block_size: 32,
            write_buffer_size: 32,
        }
    }
}

struct Cached {
    length: SlotIndex,
    last_term: Term,
}

/// The durable log. Internally thread-safe; callers may share it freely.
pub struct BinLog {
    db: DB,
    cached: Mutex<Cached>,
}

fn slot_key(slot: SlotIndex) -> [u8; 8] {
    (slot as u64).to_be_bytes()
}

fn parse_slot_key(key: &[u8]) -> Result<SlotIndex> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| KeystoneError::Binlog("malformed slot key".to_string()))?;
    Ok(u64::from_be_bytes(bytes) as SlotIndex)
}

impl BinLog {
    /// Open or create the log at `path` and recompute the cached tail.
    pub fn open<P: AsRef<Path>>(path: P, options: BinLogOptions) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(options.write_buffer_size * 1024 * 1024);
        if options.compress {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        } else {
            opts.set_compression_type(rocksdb::DBCompressionType::None);
        }
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_size(options.block_size * 1024);
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, path)?;

        let mut cached = Cached {
            length: 0,
            last_term: -1,
        };
        let mut tail = db.iterator(IteratorMode::End);
        if let Some(item) = tail.next() {
            let (key, value) = item?;
            let slot = parse_slot_key(&key)?;
            let entry: LogEntry = bincode::deserialize(&value)?;
            cached.length = slot + 1;
            cached.last_term = entry.term;
        }

        Ok(Self {
            db,
            cached: Mutex::new(cached),
        })
    }

    /// One past the last slot.
    pub fn length(&self) -> SlotIndex {
        self.cached.lock().length
    }

    /// `(last_log_index, last_log_term)`, both `-1` when the log is empty.
    pub fn last_index_and_term(&self) -> (SlotIndex, Term) {
        let cached = self.cached.lock();
        (cached.length - 1, cached.last_term)
    }

    /// Atomically append a single entry. Returns the slot it landed in.
    pub fn append(&self, entry: &LogEntry) -> Result<SlotIndex> {
        let mut cached = self.cached.lock();
        let slot = cached.length;
        let value = bincode::serialize(entry)?;
        self.db.put(slot_key(slot), value)?;
        cached.length = slot + 1;
        cached.last_term = entry.term;
        Ok(slot)
    }

    /// Append a replicated batch in order (follower side).
    pub fn append_batch(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut cached = self.cached.lock();
        let mut batch = WriteBatch::default();
        let mut slot = cached.length;
        for entry in entries {
            batch.put(slot_key(slot), bincode::serialize(entry)?);
            slot += 1;
        }
        self.db.write(batch)?;
        cached.length = slot;
        cached.last_term = entries[entries.len() - 1].term;
        Ok(())
    }

    /// Read one slot. Missing slots are [`KeystoneError::BadSlot`].
    pub fn read(&self, slot: SlotIndex) -> Result<LogEntry> {
        if slot < 0 {
            return Err(KeystoneError::BadSlot(slot));
        }
        match self.db.get(slot_key(slot))? {
            Some(raw) => Ok(bincode::deserialize(&raw)?),
            None => Err(KeystoneError::BadSlot(slot)),
        }
    }

    /// Drop every slot strictly greater than `last_kept_slot`. Passing `-1`
    /// empties the log.
    pub fn truncate(&self, last_kept_slot: SlotIndex) -> Result<()> {
        let mut cached = self.cached.lock();
        if last_kept_slot >= cached.length - 1 {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for slot in (last_kept_slot + 1)..cached.length {
            batch.delete(slot_key(slot));
        }
        self.db.write(batch)?;
        cached.length = last_kept_slot + 1;
        cached.last_term = if last_kept_slot >= 0 {
            match self.db.get(slot_key(last_kept_slot))? {
                Some(raw) => bincode::deserialize::<LogEntry>(&raw)?.term,
                None => -1,
            }
        } else {
            -1
        };
        Ok(())
    }

    /// Garbage-collect the prefix: delete every slot `< upto_slot`. Length
    /// and tail term are unaffected.
    pub fn remove_prefix(&self, upto_slot: SlotIndex) -> Result<()> {
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator(IteratorMode::From(&slot_key(0), Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if parse_slot_key(&key)? >= upto_slot {
                break;
            }
            batch.delete(&key);
        }
        self.db.write(batch)?;
        Ok(())
    }
}
