//! The signing ledger: an idempotent key-value store of signing records,
//! fronted by a bounded insertion-ordered cache. Keys are canonical
//! transaction ids, values are codec-encoded records.

mod cache;
mod interface;
mod schema;

pub use cache::{RecencyCache, CACHE_SIZE};
pub use interface::setup_db;

use crate::codec::{CodecError, SigningRecord};

use bitcoin::Txid;

use std::{path::PathBuf, sync::RwLock};

pub const DB_VERSION: u32 = 0;

#[derive(PartialEq, Eq, Debug)]
pub enum LedgerError {
    /// The key is neither cached nor stored.
    NotFound,
    /// Database Error
    Database(String),
    /// A stored value failed to decode.
    Codec(CodecError),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LedgerError::NotFound => write!(f, "Ledger error: record not found"),
            LedgerError::Database(e) => write!(f, "Database error: {}", e),
            LedgerError::Codec(e) => write!(f, "Ledger error: corrupt stored record: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {}

/// All access goes through a single reader-writer lock: point reads and the
/// total counter may proceed concurrently, insertions, completion updates
/// and the store-scanning path of `read_recent` are exclusive.
pub struct Ledger {
    db_path: PathBuf,
    state: RwLock<RecencyCache>,
}

impl Ledger {
    /// Open (creating it if needed) the ledger database and seed the running
    /// total from the last persisted value.
    pub fn open(db_path: PathBuf) -> Result<Self, LedgerError> {
        interface::setup_db(&db_path)?;

        let mut cache = RecencyCache::new(CACHE_SIZE);
        cache.set_total(interface::db_total(&db_path)?);

        Ok(Ledger {
            db_path,
            state: RwLock::new(cache),
        })
    }

    /// Idempotent insert: a key already cached or stored is reported as
    /// success without any mutation. Otherwise the record and the updated
    /// running total are persisted atomically, then pushed into the cache.
    pub fn put(&self, key: &Txid, record: &SigningRecord) -> Result<(), LedgerError> {
        let mut cache = self.state.write().expect("ledger lock poisoned");

        if cache.contains(key) {
            return Ok(());
        }
        if interface::db_record(&self.db_path, &key[..])?.is_some() {
            return Ok(());
        }

        interface::db_insert_record(
            &self.db_path,
            &key[..],
            &record.encode(),
            cache.total() + 1,
        )?;
        cache.push(*key, record.clone());

        Ok(())
    }

    pub fn get(&self, key: &Txid) -> Result<SigningRecord, LedgerError> {
        let cache = self.state.read().expect("ledger lock poisoned");

        if let Some(record) = cache.get(key) {
            return Ok(record.clone());
        }

        let raw = interface::db_record(&self.db_path, &key[..])?
            .ok_or(LedgerError::NotFound)?;
        SigningRecord::decode(&raw).map_err(LedgerError::Codec)
    }

    /// Flip the completion flag. The store is the single authority: the
    /// persisted copy is rewritten first and the cached copy is only updated
    /// once that write went through.
    pub fn mark_complete(&self, key: &Txid) -> Result<(), LedgerError> {
        let mut cache = self.state.write().expect("ledger lock poisoned");

        let raw = interface::db_record(&self.db_path, &key[..])?
            .ok_or(LedgerError::NotFound)?;
        let mut record = SigningRecord::decode(&raw).map_err(LedgerError::Codec)?;
        if !record.completed {
            record.completed = true;
            interface::db_update_record(&self.db_path, &key[..], &record.encode())?;
        }
        cache.set_completed(key);

        Ok(())
    }

    /// Up to `CACHE_SIZE` most recently received records, newest first.
    ///
    /// Served straight from the cache when it is full or already holds
    /// everything ever inserted. Otherwise (typically right after a restart)
    /// the store is scanned, the result sorted by receipt time, and the
    /// cache re-warmed with the next-oldest entries within its bound.
    pub fn read_recent(&self) -> Result<Vec<SigningRecord>, LedgerError> {
        let mut cache = self.state.write().expect("ledger lock poisoned");

        if cache.len() == CACHE_SIZE || cache.len() as u64 == cache.total() {
            return Ok(cache.newest_first());
        }

        let mut records = Vec::new();
        for raw in interface::db_all_records(&self.db_path)? {
            records.push(SigningRecord::decode(&raw).map_err(LedgerError::Codec)?);
        }
        records.sort_by(|a, b| b.received_at.cmp(&a.received_at));

        let already_cached = cache.len();
        for record in records.iter().skip(already_cached).take(CACHE_SIZE - already_cached) {
            cache.warm_oldest(record.key(), record.clone());
        }

        records.truncate(CACHE_SIZE);
        Ok(records)
    }

    /// The number of records ever inserted.
    pub fn total(&self) -> u64 {
        self.state.read().expect("ledger lock poisoned").total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_builder::VendorTestBuilder;
    use rusqlite::params;
    use serial_test::serial;

    #[test]
    #[serial]
    fn db_creation_sanity() {
        let test_framework = VendorTestBuilder::new(2, 3);
        let db_path = test_framework.db_file();
        let _ledger = Ledger::open(db_path.clone()).unwrap();

        // We can't create it twice
        interface::create_db(&db_path).unwrap_err();
        // The version is right
        interface::check_db(&db_path).unwrap();
        // It would not accept to open a database from the future!
        interface::db_exec(&db_path, |tx| {
            tx.execute(
                "UPDATE db_params SET version = (?1)",
                params![DB_VERSION + 1],
            )
            .unwrap();
            Ok(())
        })
        .unwrap();
        interface::check_db(&db_path).unwrap_err();
    }

    #[test]
    #[serial]
    fn put_is_idempotent() {
        let test_framework = VendorTestBuilder::new(2, 3);
        let ledger = test_framework.ledger();

        let record = test_framework.dummy_record(0);
        let key = record.key();

        ledger.put(&key, &record).unwrap();
        assert_eq!(ledger.total(), 1);

        // Redelivery of the same canonical transaction changes nothing.
        ledger.put(&key, &record).unwrap();
        assert_eq!(ledger.total(), 1);
        assert_eq!(ledger.get(&key).unwrap(), record);
        assert_eq!(ledger.read_recent().unwrap().len(), 1);
    }

    #[test]
    #[serial]
    fn recent_records_are_bounded_and_ordered() {
        let test_framework = VendorTestBuilder::new(2, 3);
        let ledger = test_framework.ledger();

        let records: Vec<_> = (0..CACHE_SIZE as u32 + 5)
            .map(|i| test_framework.dummy_record(i))
            .collect();
        for record in &records {
            ledger.put(&record.key(), record).unwrap();
        }

        assert_eq!(ledger.total(), records.len() as u64);

        let recent = ledger.read_recent().unwrap();
        assert_eq!(recent.len(), CACHE_SIZE);
        // Exactly the most recently inserted ones, newest first.
        for (i, record) in recent.iter().enumerate() {
            assert_eq!(record, &records[records.len() - 1 - i]);
        }
        for pair in recent.windows(2) {
            assert!(pair[0].received_at > pair[1].received_at);
        }
    }

    #[test]
    #[serial]
    fn restart_seeds_total_and_rescans() {
        let test_framework = VendorTestBuilder::new(2, 3);

        let records: Vec<_> = (0..CACHE_SIZE as u32 + 20)
            .map(|i| test_framework.dummy_record(i))
            .collect();
        {
            let ledger = test_framework.ledger();
            for record in &records {
                ledger.put(&record.key(), record).unwrap();
            }
        }

        // A fresh process: empty cache, total seeded from the store.
        let ledger = test_framework.ledger();
        assert_eq!(ledger.total(), records.len() as u64);

        // The first listing scans the store and still caps and orders.
        let recent = ledger.read_recent().unwrap();
        assert_eq!(recent.len(), CACHE_SIZE);
        for (i, record) in recent.iter().enumerate() {
            assert_eq!(record, &records[records.len() - 1 - i]);
        }

        // The scan warmed the cache: a second listing agrees.
        assert_eq!(ledger.read_recent().unwrap(), recent);

        // Point reads of evicted entries fall through to the store.
        let oldest = &records[0];
        assert_eq!(ledger.get(&oldest.key()).unwrap(), *oldest);
    }

    #[test]
    #[serial]
    fn completion_marking() {
        let test_framework = VendorTestBuilder::new(2, 3);

        let record = test_framework.dummy_record(3);
        let key = record.key();
        {
            let ledger = test_framework.ledger();
            ledger.put(&key, &record).unwrap();
            ledger.mark_complete(&key).unwrap();
            assert!(ledger.get(&key).unwrap().completed);

            // Marking twice is harmless.
            ledger.mark_complete(&key).unwrap();

            // But we can't complete what we never signed.
            let unknown = test_framework.dummy_record(99).key();
            assert_eq!(ledger.mark_complete(&unknown), Err(LedgerError::NotFound));
        }

        // The flag went to the store, not just the cache.
        let ledger = test_framework.ledger();
        assert!(ledger.get(&key).unwrap().completed);
    }
}
