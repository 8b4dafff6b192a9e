//! Persistent election metadata: current term, votes by term, and the root
//! user record. Election safety depends on these writes, so callers treat a
//! failed write as fatal.

use crate::error::Result;
use crate::types::{ServerId, Term};
use crate::user::UserRecord;
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::collections::HashMap;
use std::path::Path;

const CURRENT_TERM_KEY: &[u8] = b"current_term";
const VOTED_FOR_PREFIX: &[u8] = b"voted_for/";
const ROOT_USER_KEY: &[u8] = b"root_user";

/// Per-replica meta column.
pub struct Meta {
    db: DB,
}

fn voted_for_key(term: Term) -> Vec<u8> {
    let mut key = VOTED_FOR_PREFIX.to_vec();
    key.extend_from_slice(&(term as u64).to_be_bytes());
    key
}

impl Meta {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    pub fn read_current_term(&self) -> Result<Term> {
        match self.db.get(CURRENT_TERM_KEY)? {
            Some(raw) => Ok(bincode::deserialize(&raw)?),
            None => Ok(0),
        }
    }

    pub fn write_current_term(&self, term: Term) -> Result<()> {
        self.db.put(CURRENT_TERM_KEY, bincode::serialize(&term)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn read_voted_for(&self) -> Result<HashMap<Term, ServerId>> {
        let mut votes = HashMap::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(VOTED_FOR_PREFIX, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(VOTED_FOR_PREFIX) {
                break;
            }
            let term_bytes: [u8; 8] = key[VOTED_FOR_PREFIX.len()..]
                .try_into()
                .map_err(|_| crate::error::KeystoneError::Storage("bad voted_for key".into()))?;
            let term = u64::from_be_bytes(term_bytes) as Term;
            votes.insert(term, String::from_utf8_lossy(&value).into_owned());
        }
        Ok(votes)
    }

    pub fn write_voted_for(&self, term: Term, candidate: &str) -> Result<()> {
        self.db.put(voted_for_key(term), candidate.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn read_root_user(&self) -> Result<Option<UserRecord>> {
        match self.db.get(ROOT_USER_KEY)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn write_root_user(&self, record: &UserRecord) -> Result<()> {
        self.db.put(ROOT_USER_KEY, bincode::serialize(record)?)?;
        self.db.flush()?;
        Ok(())
    }
}
