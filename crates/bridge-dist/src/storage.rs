//! Persistent state, backed by sqlite3.
//!
//! Four small tables: which distributor each bridge was assigned to
//! (provenance), when each email sender was last answered, which
//! senders have been warned, and which bridges are blocked where.
//!
//! Everything a distributor does with the store happens inside one
//! explicit transaction, so a request that fails midway leaves no
//! trace: either the answer was composed and the sender's clock
//! advanced, or neither.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::warn;

use bridge_hashring::{AssignmentTracker, Bridge};

use crate::Result;

/// Convert a [`SystemTime`] to whole seconds since the Unix epoch.
pub(crate) fn unix_secs(when: SystemTime) -> u64 {
    when.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// The schema version this code writes.
const SCHEMA_VERSION: u32 = 1;

/// Schema, as installed into an empty database.
const INSTALL_SCHEMA: &str = "
  -- Name and version of the schema, plus the oldest version of this
  -- software that can still read it.
  CREATE TABLE BridgeSchemaMeta (
    name TEXT PRIMARY KEY NOT NULL,
    version INTEGER NOT NULL,
    readable_by INTEGER NOT NULL
  );
  INSERT INTO BridgeSchemaMeta (name, version, readable_by)
    VALUES ('BridgeStorage', 1, 1);

  -- Which distributor each bridge was assigned to, and when we saw it.
  CREATE TABLE Bridges (
    hex_key TEXT PRIMARY KEY NOT NULL,
    distributor TEXT NOT NULL,
    address TEXT NOT NULL,
    or_port INTEGER NOT NULL,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL
  );

  -- When we last answered each (canonical) email sender.
  CREATE TABLE EmailedBridges (
    email TEXT PRIMARY KEY NOT NULL,
    last_seen INTEGER NOT NULL
  );

  -- Senders that have already received a rate-limit warning.
  CREATE TABLE WarnedEmails (
    email TEXT PRIMARY KEY NOT NULL,
    when_warned INTEGER NOT NULL
  );

  -- Countries each bridge is known to be blocked in.
  CREATE TABLE BridgeBlocks (
    hex_key TEXT NOT NULL,
    blocking_country TEXT NOT NULL,
    PRIMARY KEY (hex_key, blocking_country)
  );
";

/// The persistent store.
pub struct Database {
    /// The underlying sqlite3 connection.
    conn: Connection,
}

impl Database {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_conn(conn)
    }

    /// Open a store in memory.  Used for testing.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    /// Wrap a connection, checking and if necessary installing the
    /// schema.
    fn from_conn(conn: Connection) -> Result<Self> {
        let mut db = Database { conn };
        db.check_schema()?;
        Ok(db)
    }

    /// Check whether the database has a schema we can use, installing
    /// it into an empty database.
    fn check_schema(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        let n_tables: u32 = tx.query_row(
            "SELECT COUNT(name) FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )?;
        if n_tables == 0 {
            tx.execute_batch(INSTALL_SCHEMA)?;
            tx.commit()?;
            return Ok(());
        }

        let readable_by: u32 = tx.query_row(
            "SELECT readable_by FROM BridgeSchemaMeta WHERE name = 'BridgeStorage'",
            [],
            |row| row.get(0),
        )?;
        if readable_by > SCHEMA_VERSION {
            // There is no rusqlite error for this, so report it as the
            // nearest sqlite concept: a schema we cannot work with.
            return Err(rusqlite::Error::InvalidQuery.into());
        }
        // Rolls back the transaction, but nothing was done.
        Ok(())
    }

    /// Begin a transaction.
    ///
    /// Dropping the returned value without calling
    /// [`commit`](StorageTx::commit) rolls everything back.
    pub fn transaction(&mut self) -> Result<StorageTx<'_>> {
        Ok(StorageTx {
            tx: self.conn.transaction()?,
        })
    }

    /// Delete rate-limit state older than `cutoff`.
    ///
    /// Senders whose entire window has passed are indistinguishable
    /// from senders we never saw, so their rows are just space.
    pub fn clean_expired(&mut self, cutoff: SystemTime) -> Result<()> {
        let cutoff = unix_secs(cutoff);
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM EmailedBridges WHERE last_seen < ?1", [cutoff])?;
        tx.execute("DELETE FROM WarnedEmails WHERE when_warned < ?1", [cutoff])?;
        tx.commit()?;
        Ok(())
    }
}

/// An open transaction against the store.
pub struct StorageTx<'a> {
    /// The underlying sqlite transaction.
    tx: Transaction<'a>,
}

impl<'a> StorageTx<'a> {
    /// Return when we last answered `email`, if we have.
    pub fn email_time(&self, email: &str) -> Result<Option<u64>> {
        Ok(self
            .tx
            .query_row(
                "SELECT last_seen FROM EmailedBridges WHERE email = ?1",
                [email],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Record that we answered `email` at `when`.
    pub fn set_email_time(&self, email: &str, when: u64) -> Result<()> {
        self.tx.execute(
            "INSERT INTO EmailedBridges (email, last_seen) VALUES (?1, ?2)
             ON CONFLICT (email) DO UPDATE SET last_seen = ?2",
            params![email, when],
        )?;
        Ok(())
    }

    /// Return true if `email` has been warned in its current window.
    pub fn warned_email(&self, email: &str) -> Result<bool> {
        let got: Option<u64> = self
            .tx
            .query_row(
                "SELECT when_warned FROM WarnedEmails WHERE email = ?1",
                [email],
                |row| row.get(0),
            )
            .optional()?;
        Ok(got.is_some())
    }

    /// Set or clear the warned flag for `email`.
    pub fn set_warned_email(&self, email: &str, warned: bool, when: u64) -> Result<()> {
        if warned {
            self.tx.execute(
                "INSERT INTO WarnedEmails (email, when_warned) VALUES (?1, ?2)
                 ON CONFLICT (email) DO UPDATE SET when_warned = ?2",
                params![email, when],
            )?;
        } else {
            self.tx
                .execute("DELETE FROM WarnedEmails WHERE email = ?1", [email])?;
        }
        Ok(())
    }

    /// Record that `bridge` was assigned to `distributor` at `seen_at`.
    ///
    /// The first sighting fixes `first_seen`; later sightings update
    /// everything else.
    pub fn record_bridge(&self, bridge: &Bridge, distributor: &str, seen_at: u64) -> Result<()> {
        self.tx.execute(
            "INSERT INTO Bridges
               (hex_key, distributor, address, or_port, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (hex_key) DO UPDATE SET
               distributor = ?2, address = ?3, or_port = ?4, last_seen = ?5",
            params![
                bridge.fingerprint.to_string(),
                distributor,
                bridge.addr.to_string(),
                bridge.or_port,
                seen_at,
            ],
        )?;
        Ok(())
    }

    /// Return the distributor recorded for the given fingerprint, if
    /// any.
    pub fn bridge_distributor(&self, fingerprint: &str) -> Result<Option<String>> {
        Ok(self
            .tx
            .query_row(
                "SELECT distributor FROM Bridges WHERE hex_key = ?1",
                [fingerprint],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Record that the bridge with `fingerprint` is blocked in `cc`.
    pub fn add_bridge_block(&self, fingerprint: &str, cc: &str) -> Result<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO BridgeBlocks (hex_key, blocking_country) VALUES (?1, ?2)",
            params![fingerprint, cc],
        )?;
        Ok(())
    }

    /// Forget that the bridge with `fingerprint` is blocked in `cc`.
    pub fn del_bridge_block(&self, fingerprint: &str, cc: &str) -> Result<()> {
        self.tx.execute(
            "DELETE FROM BridgeBlocks WHERE hex_key = ?1 AND blocking_country = ?2",
            params![fingerprint, cc],
        )?;
        Ok(())
    }

    /// Return true if the bridge with `fingerprint` is recorded as
    /// blocked in `cc`.
    pub fn is_blocked(&self, fingerprint: &str, cc: &str) -> Result<bool> {
        let got: Option<u32> = self
            .tx
            .query_row(
                "SELECT 1 FROM BridgeBlocks WHERE hex_key = ?1 AND blocking_country = ?2",
                params![fingerprint, cc],
                |row| row.get(0),
            )
            .optional()?;
        Ok(got.is_some())
    }

    /// Return every country the bridge with `fingerprint` is blocked
    /// in.
    pub fn blocking_countries(&self, fingerprint: &str) -> Result<Vec<String>> {
        let mut stmt = self.tx.prepare(
            "SELECT blocking_country FROM BridgeBlocks WHERE hex_key = ?1
             ORDER BY blocking_country",
        )?;
        let rows = stmt.query_map([fingerprint], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Commit the transaction.
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

/// An [`AssignmentTracker`] recording provenance into a [`Database`].
pub struct StoreTracker {
    /// The shared store.
    db: Arc<Mutex<Database>>,
}

impl StoreTracker {
    /// Return a tracker writing into `db`.
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        StoreTracker { db }
    }
}

impl AssignmentTracker for StoreTracker {
    fn record(&self, bridge: &Bridge, distributor: &str, seen_at: SystemTime) {
        // Tracking is a side channel: a storage hiccup must not block
        // catalogue loading, so failures are logged and dropped.
        let mut db = self.db.lock().expect("poisoned lock");
        let result = (|| -> Result<()> {
            let tx = db.transaction()?;
            tx.record_bridge(bridge, distributor, unix_secs(seen_at))?;
            for cc in &bridge.blocked_in {
                tx.add_bridge_block(&bridge.fingerprint.to_string(), cc)?;
            }
            tx.commit()
        })();
        if let Err(e) = result {
            warn!("failed to record bridge assignment: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use bridge_hashring::testing::fake_bridge;
    use std::time::Duration;

    #[test]
    fn schema_install_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite3");
        drop(Database::open(&path).unwrap());
        // Reopening an installed database must succeed unchanged.
        drop(Database::open(&path).unwrap());
    }

    #[test]
    fn email_times() {
        let mut db = Database::open_in_memory().unwrap();
        let tx = db.transaction().unwrap();
        assert_eq!(tx.email_time("abc@example.com").unwrap(), None);
        tx.set_email_time("abc@example.com", 1000).unwrap();
        tx.set_email_time("def@example.com", 2000).unwrap();
        tx.commit().unwrap();

        let tx = db.transaction().unwrap();
        assert_eq!(tx.email_time("abc@example.com").unwrap(), Some(1000));
        assert_eq!(tx.email_time("def@example.com").unwrap(), Some(2000));
        assert_eq!(tx.email_time("ghi@example.com").unwrap(), None);
        // Refreshing replaces.
        tx.set_email_time("abc@example.com", 3000).unwrap();
        assert_eq!(tx.email_time("abc@example.com").unwrap(), Some(3000));
        tx.commit().unwrap();
    }

    #[test]
    fn rollback_on_drop() {
        let mut db = Database::open_in_memory().unwrap();
        {
            let tx = db.transaction().unwrap();
            tx.set_email_time("abc@example.com", 1000).unwrap();
            // No commit.
        }
        let tx = db.transaction().unwrap();
        assert_eq!(tx.email_time("abc@example.com").unwrap(), None);
    }

    #[test]
    fn warned_flags() {
        let mut db = Database::open_in_memory().unwrap();
        let tx = db.transaction().unwrap();
        assert!(!tx.warned_email("abc@example.com").unwrap());
        tx.set_warned_email("abc@example.com", true, 1000).unwrap();
        assert!(tx.warned_email("abc@example.com").unwrap());
        tx.set_warned_email("abc@example.com", false, 1000).unwrap();
        assert!(!tx.warned_email("abc@example.com").unwrap());
        tx.commit().unwrap();
    }

    #[test]
    fn clean_expired_state() {
        let mut db = Database::open_in_memory().unwrap();
        let tx = db.transaction().unwrap();
        tx.set_email_time("old@example.com", 100).unwrap();
        tx.set_email_time("new@example.com", 2_000_000).unwrap();
        tx.set_warned_email("old@example.com", true, 100).unwrap();
        tx.commit().unwrap();

        db.clean_expired(UNIX_EPOCH + Duration::from_secs(1_000_000))
            .unwrap();

        let tx = db.transaction().unwrap();
        assert_eq!(tx.email_time("old@example.com").unwrap(), None);
        assert!(!tx.warned_email("old@example.com").unwrap());
        assert_eq!(tx.email_time("new@example.com").unwrap(), Some(2_000_000));
    }

    #[test]
    fn bridge_provenance() {
        let mut db = Database::open_in_memory().unwrap();
        let b = fake_bridge(1);
        let fpr = b.fingerprint.to_string();

        let tx = db.transaction().unwrap();
        tx.record_bridge(&b, "https", 1000).unwrap();
        tx.commit().unwrap();

        // A later sighting updates last_seen but keeps first_seen.
        let tx = db.transaction().unwrap();
        tx.record_bridge(&b, "https", 5000).unwrap();
        let (first, last): (u64, u64) = tx
            .tx
            .query_row(
                "SELECT first_seen, last_seen FROM Bridges WHERE hex_key = ?1",
                [&fpr],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((first, last), (1000, 5000));
        assert_eq!(tx.bridge_distributor(&fpr).unwrap().as_deref(), Some("https"));
        tx.commit().unwrap();
    }

    #[test]
    fn bridge_blocks() {
        let mut db = Database::open_in_memory().unwrap();
        let tx = db.transaction().unwrap();
        let fpr = fake_bridge(2).fingerprint.to_string();
        tx.add_bridge_block(&fpr, "uk").unwrap();
        tx.add_bridge_block(&fpr, "cn").unwrap();
        tx.add_bridge_block(&fpr, "uk").unwrap();
        assert!(tx.is_blocked(&fpr, "uk").unwrap());
        assert!(!tx.is_blocked(&fpr, "us").unwrap());
        assert_eq!(tx.blocking_countries(&fpr).unwrap(), vec!["cn", "uk"]);
        tx.del_bridge_block(&fpr, "uk").unwrap();
        assert!(!tx.is_blocked(&fpr, "uk").unwrap());
        tx.commit().unwrap();
    }
}
