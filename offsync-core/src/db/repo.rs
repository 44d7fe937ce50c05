//! Sample store repository
//!
//! Append, scan, mark and prune operations over the `samples` table.

use crate::error::{Error, Result};
use crate::types::{normalize_timestamp, DeliveryState, NewSample, Sample};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use super::cipher::PayloadCipher;

/// Columns of a sample that are stored inside the (possibly sealed) payload.
#[derive(Debug, Serialize, Deserialize)]
struct StoredPayload {
    lat: f64,
    lng: f64,
    accuracy_m: f64,
    provider: Option<String>,
    battery_pct: Option<u8>,
    is_charging: Option<bool>,
    accuracy_mode: Option<String>,
}

/// A row as read from SQLite, before the payload is opened.
struct RawRow {
    id: i64,
    captured_at: String,
    delivered: i64,
    nonce: Option<Vec<u8>>,
    payload: Vec<u8>,
}

/// Durable sample queue (single connection behind a mutex)
pub struct Store {
    conn: Mutex<Connection>,
    cipher: Option<PayloadCipher>,
}

impl Store {
    /// Open or create a store at the given path
    ///
    /// With `cipher` set to `None` new rows are written unencrypted.
    pub fn open(path: &Path, cipher: Option<PayloadCipher>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets uploads read while capture appends
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(cipher: Option<PayloadCipher>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    /// Run migrations on this store
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Whether new rows are sealed
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    // ============================================
    // Queue operations
    // ============================================

    /// Append a sample as pending and return its id.
    ///
    /// `captured_at` is stored in canonical UTC form so that string order
    /// is time order for dequeue and retention.
    pub fn insert(&self, sample: &NewSample) -> Result<i64> {
        let captured_at = normalize_timestamp(&sample.captured_at)?;
        let plain = serde_json::to_vec(&StoredPayload {
            lat: sample.lat,
            lng: sample.lng,
            accuracy_m: sample.accuracy_m,
            provider: sample.provider.clone(),
            battery_pct: sample.battery_pct,
            is_charging: sample.is_charging,
            accuracy_mode: sample.accuracy_mode.clone(),
        })?;

        let (nonce, payload) = match &self.cipher {
            Some(cipher) => {
                let (nonce, sealed) = cipher.seal(&plain, captured_at.as_bytes())?;
                (Some(nonce), sealed)
            }
            None => (None, plain),
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO samples (captured_at, delivered, nonce, payload) VALUES (?1, 0, ?2, ?3)",
            params![captured_at, nonce, payload],
        )?;
        let id = conn.last_insert_rowid();

        tracing::debug!(id, captured_at = %captured_at, "Sample stored");
        Ok(id)
    }

    /// Up to `limit` pending samples, oldest `captured_at` first.
    ///
    /// Ties keep insertion order. Rows whose payload cannot be opened are
    /// logged and stepped over; scanning continues past them until `limit`
    /// readable samples are found or the queue is exhausted.
    pub fn dequeue_pending(&self, limit: usize) -> Result<Vec<Sample>> {
        let mut samples = Vec::with_capacity(limit);
        let mut cursor: Option<(String, i64)> = None;
        let mut skipped = 0usize;

        while samples.len() < limit {
            let page = self.pending_page(cursor.as_ref(), limit - samples.len())?;
            let exhausted = page.len() < limit - samples.len();

            for row in page {
                cursor = Some((row.captured_at.clone(), row.id));
                let id = row.id;
                match self.decode(row) {
                    Ok(sample) => samples.push(sample),
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!(id, error = %e, "Skipping unreadable pending sample");
                    }
                }
            }

            if exhausted {
                break;
            }
        }

        if skipped > 0 {
            tracing::debug!(skipped, returned = samples.len(), "Dequeued past unreadable rows");
        }
        Ok(samples)
    }

    /// Next `limit` pending rows strictly after `after` in queue order.
    fn pending_page(&self, after: Option<&(String, i64)>, limit: usize) -> Result<Vec<RawRow>> {
        let (after_ts, after_id) = match after {
            Some((ts, id)) => (Some(ts.as_str()), *id),
            None => (None, 0),
        };

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT id, captured_at, delivered, nonce, payload
            FROM samples
            WHERE delivered = 0
              AND (?1 IS NULL OR captured_at > ?1 OR (captured_at = ?1 AND id > ?2))
            ORDER BY captured_at ASC, id ASC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt
            .query_map(params![after_ts, after_id, limit as i64], Self::row_to_raw)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Mark samples as delivered in one transaction.
    ///
    /// Already-delivered and no-longer-existing ids are ignored. Returns the
    /// number of rows that moved from pending to delivered.
    pub fn mark_delivered(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE samples SET delivered = 1 WHERE id = ?1 AND delivered = 0")?;
            for id in ids {
                updated += stmt.execute([id])?;
            }
        }
        tx.commit()?;

        tracing::debug!(requested = ids.len(), updated, "Marked samples delivered");
        Ok(updated)
    }

    /// Most recent sample by `captured_at`, regardless of delivery state.
    pub fn get_latest(&self) -> Result<Option<Sample>> {
        let raw = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                r#"
                SELECT id, captured_at, delivered, nonce, payload
                FROM samples
                ORDER BY captured_at DESC, id DESC
                LIMIT 1
                "#,
                [],
                Self::row_to_raw,
            )
            .optional()?
        };

        raw.map(|row| self.decode(row)).transpose()
    }

    /// Delete every sample captured strictly before `cutoff`, in any state.
    pub fn prune_older_than(&self, cutoff: &str) -> Result<usize> {
        let cutoff = normalize_timestamp(cutoff)?;
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM samples WHERE captured_at < ?1", [cutoff])?;
        Ok(deleted)
    }

    /// Delete delivered samples captured strictly before `cutoff`.
    pub fn prune_delivered_older_than(&self, cutoff: &str) -> Result<usize> {
        let cutoff = normalize_timestamp(cutoff)?;
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM samples WHERE captured_at < ?1 AND delivered = 1",
            [cutoff],
        )?;
        Ok(deleted)
    }

    /// Number of samples still waiting for acknowledgment
    pub fn count_pending(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE delivered = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Number of samples in the store
    pub fn count_all(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM samples", [], |r| r.get(0))?;
        Ok(count)
    }

    // ============================================
    // Row decoding
    // ============================================

    fn row_to_raw(row: &Row) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            id: row.get("id")?,
            captured_at: row.get("captured_at")?,
            delivered: row.get("delivered")?,
            nonce: row.get("nonce")?,
            payload: row.get("payload")?,
        })
    }

    fn decode(&self, row: RawRow) -> Result<Sample> {
        let plain = match (&row.nonce, &self.cipher) {
            (Some(nonce), Some(cipher)) => {
                cipher.open(nonce, &row.payload, row.captured_at.as_bytes())?
            }
            (Some(_), None) => {
                return Err(Error::Crypto(format!(
                    "sample {} is encrypted but the store has no secret",
                    row.id
                )))
            }
            // Written while encryption was unavailable
            (None, _) => row.payload,
        };
        let payload: StoredPayload = serde_json::from_slice(&plain)?;

        Ok(Sample {
            id: row.id,
            captured_at: row.captured_at,
            lat: payload.lat,
            lng: payload.lng,
            accuracy_m: payload.accuracy_m,
            provider: payload.provider,
            battery_pct: payload.battery_pct,
            is_charging: payload.is_charging,
            accuracy_mode: payload.accuracy_mode,
            delivery_state: DeliveryState::from_flag(row.delivered),
        })
    }
}
