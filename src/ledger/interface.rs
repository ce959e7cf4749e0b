use crate::ledger::{schema::SCHEMA, LedgerError, DB_VERSION};

use rusqlite::{params, Connection, Row, ToSql, Transaction, NO_PARAMS};

use std::{fs, os::unix::fs::OpenOptionsExt, path::PathBuf};

// Note that we don't share a global struct that would contain the connection
// here. As the bundled sqlite is compiled with SQLITE_THREADSAFE, quoting
// sqlite.org:
// > Multi-thread. In this mode, SQLite can be safely used by multiple threads
// > provided that no single database connection is used simultaneously in two
// > or more threads.
// Therefore the below routines create a new connection and can be used from
// any thread.

/// Perform a set of modifications to the database inside a single transaction
pub fn db_exec<F>(path: &PathBuf, modifications: F) -> Result<(), LedgerError>
where
    F: Fn(&Transaction) -> Result<(), LedgerError>,
{
    let mut conn = Connection::open(path)
        .map_err(|e| LedgerError::Database(format!("Opening database: {}", e.to_string())))?;
    let tx = conn
        .transaction()
        .map_err(|e| LedgerError::Database(format!("Creating transaction: {}", e.to_string())))?;

    modifications(&tx)?;
    tx.commit()
        .map_err(|e| LedgerError::Database(format!("Comitting transaction: {}", e.to_string())))?;

    Ok(())
}

// Internal helper for queries boilerplate
fn db_query<'a, P, F, T>(
    path: &PathBuf,
    stmt_str: &'a str,
    params: P,
    f: F,
) -> Result<Vec<T>, LedgerError>
where
    P: IntoIterator,
    P::Item: ToSql,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let conn = Connection::open(path).map_err(|e| {
        LedgerError::Database(format!("Opening database for query: {}", e.to_string()))
    })?;

    // rustc says 'borrowed value does not live long enough'
    let x = conn
        .prepare(stmt_str)
        .map_err(|e| LedgerError::Database(format!("Preparing query: '{}'", e.to_string())))?
        .query_map(params, f)
        .map_err(|e| LedgerError::Database(format!("Mapping query: '{}'", e.to_string())))?
        .collect::<rusqlite::Result<Vec<T>>>()
        .map_err(|e| LedgerError::Database(format!("Executing query: '{}'", e.to_string())));

    x
}

/// Get the database version
pub fn db_version(db_path: &PathBuf) -> Result<u32, LedgerError> {
    let mut rows = db_query(db_path, "SELECT version FROM db_params", NO_PARAMS, |row| {
        row.get::<_, u32>(0)
    })?;

    rows.pop()
        .ok_or_else(|| LedgerError::Database("No row in version table?".to_string()))
}

/// The total number of records ever inserted, as last persisted.
pub fn db_total(db_path: &PathBuf) -> Result<u64, LedgerError> {
    let mut rows = db_query(db_path, "SELECT total FROM signing_totals", NO_PARAMS, |row| {
        row.get::<_, i64>(0)
    })?;

    rows.pop()
        .map(|total| total as u64)
        .ok_or_else(|| LedgerError::Database("No row in signing_totals table?".to_string()))
}

/// Point-read the encoded record stored under this key, if any.
pub fn db_record(db_path: &PathBuf, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
    db_query(
        db_path,
        "SELECT value FROM signing_records WHERE key = (?1)",
        params![key],
        |row| row.get::<_, Vec<u8>>(0),
    )
    .map(|mut rows| rows.pop())
}

/// Insert a new record and persist the updated running total, atomically.
pub fn db_insert_record(
    db_path: &PathBuf,
    key: &[u8],
    value: &[u8],
    new_total: u64,
) -> Result<(), LedgerError> {
    db_exec(db_path, |tx| {
        tx.execute(
            "INSERT INTO signing_records (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(|e| LedgerError::Database(format!("Inserting signing record: {}", e.to_string())))?;
        tx.execute(
            "UPDATE signing_totals SET total = (?1)",
            params![new_total as i64],
        )
        .map_err(|e| LedgerError::Database(format!("Updating total: {}", e.to_string())))?;

        Ok(())
    })
}

/// Rewrite the record stored under this key.
pub fn db_update_record(db_path: &PathBuf, key: &[u8], value: &[u8]) -> Result<(), LedgerError> {
    db_exec(db_path, |tx| {
        tx.execute(
            "UPDATE signing_records SET value = (?2) WHERE key = (?1)",
            params![key, value],
        )
        .map_err(|e| LedgerError::Database(format!("Updating signing record: {}", e.to_string())))?;

        Ok(())
    })
}

/// All encoded records, in unspecified order.
pub fn db_all_records(db_path: &PathBuf) -> Result<Vec<Vec<u8>>, LedgerError> {
    db_query(
        db_path,
        "SELECT value FROM signing_records",
        NO_PARAMS,
        |row| row.get::<_, Vec<u8>>(0),
    )
}

// Create the db file with RW permissions only for the user
fn create_db_file(db_path: &PathBuf) -> Result<(), std::io::Error> {
    let mut options = fs::OpenOptions::new();
    options
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(db_path)?;

    Ok(())
}

// Create the SQLite database. This creates a file with 600 perms and creates
// the SCHEMA, then initializes the version and the running total.
pub(crate) fn create_db(db_path: &PathBuf) -> Result<(), LedgerError> {
    // Rusqlite could create it for us, but we want custom permissions
    create_db_file(db_path)
        .map_err(|e| LedgerError::Database(format!("Creating db file: {}", e.to_string())))?;

    db_exec(db_path, |tx| {
        tx.execute_batch(&SCHEMA)
            .map_err(|e| LedgerError::Database(format!("Creating database: {}", e.to_string())))?;
        tx.execute(
            "INSERT INTO db_params (version) VALUES (?1)",
            params![DB_VERSION],
        )
        .map_err(|e| LedgerError::Database(format!("Inserting db_params: {}", e.to_string())))?;
        tx.execute("INSERT INTO signing_totals (total) VALUES (0)", NO_PARAMS)
            .map_err(|e| {
                LedgerError::Database(format!("Inserting signing_totals: {}", e.to_string()))
            })?;
        Ok(())
    })
}

// Called on startup to check database integrity
pub(crate) fn check_db(db_path: &PathBuf) -> Result<(), LedgerError> {
    // Check if their database is not from the future.
    // We'll eventually do migration here if version < VERSION, but be strict
    // until then.
    let version = db_version(db_path)?;
    if version != DB_VERSION {
        return Err(LedgerError::Database(format!(
            "Unexpected database version: got '{}', expected '{}'",
            version, DB_VERSION
        )));
    }

    Ok(())
}

/// This integrity checks the database and creates it if it doesn't exist yet.
pub fn setup_db(db_path: &PathBuf) -> Result<(), LedgerError> {
    if !db_path.exists() {
        log::info!("No database at {:?}, creating a new one.", db_path);
        create_db(db_path)?;
    }

    check_db(db_path)?;

    Ok(())
}
