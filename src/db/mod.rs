use chrono::NaiveDate;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;

use crate::models::{DocumentoUploadPrazo, PrazoFilters, PrazoFiscal, PrazoSort, PrazoStatus};

const PRAZO_COLUMNS: &str = "id, user_id, company_id, description, obligation_type, due_date, status,
    priority, amount, notes, source_document_id, completed_at, created_at, updated_at";

const DOCUMENT_COLUMNS: &str = "id, user_id, file_name, mime_type, file_hash, file_size, storage_path,
    extraction_status, extraction_source, extracted_json, confidence_score, needs_review,
    error_message, prazo_id, created_at, updated_at";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(db_path: impl AsRef<Path>) -> SqlResult<Self> {
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> SqlResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let mut db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&mut self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let migrations = [
            (
                "001_create_prazos.sql",
                include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations/001_create_prazos.sql")),
            ),
            (
                "002_create_documents_and_settings.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/002_create_documents_and_settings.sql"
                )),
            ),
            (
                "003_create_processing_logs_table.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/003_create_processing_logs_table.sql"
                )),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, datetime('now'))",
                    params![name],
                )?;
                tx.commit()?;
                tracing::debug!(migration = name, "applied migration");
            }
        }

        Ok(())
    }

    pub fn insert_prazo(&self, prazo: &PrazoFiscal) -> SqlResult<()> {
        insert_prazo_row(&self.conn, prazo)
    }

    /// Rewrites every mutable column; returns false when no row of `user_id` matched.
    pub fn update_prazo(&self, prazo: &PrazoFiscal) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE prazos SET
                company_id = ?3, description = ?4, obligation_type = ?5, due_date = ?6,
                status = ?7, priority = ?8, amount = ?9, notes = ?10, source_document_id = ?11,
                completed_at = ?12, updated_at = ?13
             WHERE id = ?1 AND user_id = ?2",
            params![
                prazo.id,
                prazo.user_id,
                prazo.company_id,
                prazo.description,
                prazo.obligation_type,
                prazo.due_date,
                prazo.status,
                prazo.priority,
                prazo.amount,
                prazo.notes,
                prazo.source_document_id,
                prazo.completed_at,
                prazo.updated_at
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_prazo(&self, user_id: &str, id: &str) -> SqlResult<Option<PrazoFiscal>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {PRAZO_COLUMNS} FROM prazos WHERE user_id = ?1 AND id = ?2"))?;
        stmt.query_row(params![user_id, id], map_prazo).optional()
    }

    /// Row-level filters only; status is resolved by the caller against the
    /// reference date.
    pub fn query_prazos(
        &self,
        user_id: &str,
        filters: &PrazoFilters,
        window: Option<(NaiveDate, NaiveDate)>,
        sort: PrazoSort,
    ) -> SqlResult<Vec<PrazoFiscal>> {
        let mut sql = format!("SELECT {PRAZO_COLUMNS} FROM prazos WHERE user_id = ?1");
        let mut args: Vec<Value> = vec![Value::Text(user_id.to_string())];

        if let Some((from, to)) = window {
            args.push(Value::Text(from.format("%Y-%m-%d").to_string()));
            sql.push_str(&format!(" AND due_date >= ?{}", args.len()));
            args.push(Value::Text(to.format("%Y-%m-%d").to_string()));
            sql.push_str(&format!(" AND due_date <= ?{}", args.len()));
        }
        if let Some(company_id) = &filters.company_id {
            args.push(Value::Text(company_id.clone()));
            sql.push_str(&format!(" AND company_id = ?{}", args.len()));
        }
        if let Some(priority) = filters.priority {
            args.push(Value::Text(priority.as_str().to_string()));
            sql.push_str(&format!(" AND priority = ?{}", args.len()));
        }

        sql.push_str(match sort {
            PrazoSort::DueDateAsc => " ORDER BY due_date ASC, created_at ASC",
            PrazoSort::DueDateDesc => " ORDER BY due_date DESC, created_at DESC",
            PrazoSort::PriorityDesc => {
                " ORDER BY CASE priority
                    WHEN 'critical' THEN 3 WHEN 'high' THEN 2 WHEN 'medium' THEN 1 ELSE 0
                 END DESC, due_date ASC"
            }
            PrazoSort::AmountDesc => " ORDER BY COALESCE(amount, 0) DESC, due_date ASC",
            PrazoSort::CreatedDesc => " ORDER BY created_at DESC",
        });

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), map_prazo)?;
        rows.collect()
    }

    /// Persists `pending -> overdue` for open deadlines due before `today` and
    /// returns the rows that changed.
    pub fn mark_overdue(&mut self, user_id: &str, today: NaiveDate, now: &str) -> SqlResult<Vec<PrazoFiscal>> {
        let tx = self.conn.transaction()?;
        let transitioned = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {PRAZO_COLUMNS} FROM prazos
                 WHERE user_id = ?1 AND status = 'pending' AND due_date < ?2
                 ORDER BY due_date ASC"
            ))?;
            let rows = stmt.query_map(params![user_id, today], map_prazo)?;
            rows.collect::<SqlResult<Vec<_>>>()?
        };
        tx.execute(
            "UPDATE prazos SET status = 'overdue', updated_at = ?3
             WHERE user_id = ?1 AND status = 'pending' AND due_date < ?2",
            params![user_id, today, now],
        )?;
        tx.commit()?;

        Ok(transitioned
            .into_iter()
            .map(|mut prazo| {
                prazo.status = PrazoStatus::Overdue;
                prazo.updated_at = now.to_string();
                prazo
            })
            .collect())
    }

    pub fn count_prazos(&self, user_id: &str) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM prazos WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
    }

    pub fn upsert_document(&self, doc: &DocumentoUploadPrazo) -> SqlResult<()> {
        upsert_document_row(&self.conn, doc)
    }

    /// Inserts the deadline, marks the upload confirmed and logs it in one
    /// transaction. Returns false, writing nothing, when the stored upload is
    /// no longer awaiting confirmation.
    pub fn confirm_document(&mut self, prazo: &PrazoFiscal, doc: &DocumentoUploadPrazo) -> SqlResult<bool> {
        let tx = self.conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT extraction_status FROM prazo_documents WHERE user_id = ?1 AND id = ?2",
                params![doc.user_id, doc.id],
                |row| row.get(0),
            )
            .optional()?;
        if !matches!(current.as_deref(), Some("extracted" | "empty" | "failed")) {
            return Ok(false);
        }

        insert_prazo_row(&tx, prazo)?;
        upsert_document_row(&tx, doc)?;
        log_processing_row(&tx, Some(&doc.id), Some(&doc.file_hash), "confirm", "success", None)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_document(&self, user_id: &str, id: &str) -> SqlResult<Option<DocumentoUploadPrazo>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM prazo_documents WHERE user_id = ?1 AND id = ?2"
        ))?;
        stmt.query_row(params![user_id, id], map_document).optional()
    }

    /// Newest uploads first; `staged_only` keeps uploads still awaiting
    /// confirmation, filtered before the limit applies.
    pub fn get_recent_documents(
        &self,
        user_id: &str,
        limit: usize,
        staged_only: bool,
    ) -> SqlResult<Vec<DocumentoUploadPrazo>> {
        let staged = if staged_only {
            "AND extraction_status IN ('extracted', 'empty', 'failed')"
        } else {
            ""
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM prazo_documents
             WHERE user_id = ?1 {staged}
             ORDER BY created_at DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id, limit as i64], map_document)?;
        rows.collect()
    }

    pub fn set_setting(&self, key: &str, value: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> SqlResult<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        stmt.query_row(params![key], |row| row.get(0)).optional()
    }

    pub fn delete_setting(&self, key: &str) -> SqlResult<()> {
        self.conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn log_processing(
        &self,
        document_id: Option<&str>,
        file_hash: Option<&str>,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) -> SqlResult<()> {
        log_processing_row(&self.conn, document_id, file_hash, process_type, status, message)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> SqlResult<()> {
        self.conn.execute_batch(sql)
    }

    pub fn count_processing_logs(&self, document_id: &str) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM processing_logs WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )
    }
}

fn insert_prazo_row(conn: &Connection, prazo: &PrazoFiscal) -> SqlResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO prazos ({PRAZO_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            prazo.id,
            prazo.user_id,
            prazo.company_id,
            prazo.description,
            prazo.obligation_type,
            prazo.due_date,
            prazo.status,
            prazo.priority,
            prazo.amount,
            prazo.notes,
            prazo.source_document_id,
            prazo.completed_at,
            prazo.created_at,
            prazo.updated_at
        ],
    )?;
    Ok(())
}

fn upsert_document_row(conn: &Connection, doc: &DocumentoUploadPrazo) -> SqlResult<()> {
    let extracted_json = serde_json::to_string(&doc.candidate)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO prazo_documents ({DOCUMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            doc.id,
            doc.user_id,
            doc.file_name,
            doc.mime_type,
            doc.file_hash,
            doc.file_size,
            doc.storage_path,
            doc.extraction_status,
            doc.extraction_source,
            extracted_json,
            doc.confidence_score,
            doc.needs_review,
            doc.error_message,
            doc.prazo_id,
            doc.created_at,
            doc.updated_at
        ],
    )?;
    Ok(())
}

fn log_processing_row(
    conn: &Connection,
    document_id: Option<&str>,
    file_hash: Option<&str>,
    process_type: &str,
    status: &str,
    message: Option<&str>,
) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO processing_logs (id, document_id, file_hash, process_type, status, message, created_at)
         VALUES (hex(randomblob(16)), ?1, ?2, ?3, ?4, ?5, datetime('now'))",
        params![document_id, file_hash, process_type, status, message],
    )?;
    Ok(())
}

fn map_prazo(row: &Row<'_>) -> SqlResult<PrazoFiscal> {
    Ok(PrazoFiscal {
        id: row.get(0)?,
        user_id: row.get(1)?,
        company_id: row.get(2)?,
        description: row.get(3)?,
        obligation_type: row.get(4)?,
        due_date: row.get(5)?,
        status: row.get(6)?,
        priority: row.get(7)?,
        amount: row.get(8)?,
        notes: row.get(9)?,
        source_document_id: row.get(10)?,
        completed_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn map_document(row: &Row<'_>) -> SqlResult<DocumentoUploadPrazo> {
    let extracted_json: String = row.get(9)?;
    let candidate = serde_json::from_str(&extracted_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;
    Ok(DocumentoUploadPrazo {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_name: row.get(2)?,
        mime_type: row.get(3)?,
        file_hash: row.get(4)?,
        file_size: row.get(5)?,
        storage_path: row.get(6)?,
        extraction_status: row.get(7)?,
        extraction_source: row.get(8)?,
        candidate,
        confidence_score: row.get(10)?,
        needs_review: row.get(11)?,
        error_message: row.get(12)?,
        prazo_id: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    fn prazo(id: &str, user: &str, due: &str, priority: Priority) -> PrazoFiscal {
        PrazoFiscal {
            id: id.to_string(),
            user_id: user.to_string(),
            company_id: "acme".to_string(),
            description: format!("Guia {id}"),
            obligation_type: Some("DAS".to_string()),
            due_date: NaiveDate::parse_from_str(due, "%Y-%m-%d").unwrap(),
            status: PrazoStatus::Pending,
            priority,
            amount: Some(100.0),
            notes: None,
            source_document_id: None,
            completed_at: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut db = Database::in_memory().unwrap();
        db.run_migrations().unwrap();
        let applied: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 3);
    }

    #[test]
    fn queries_are_scoped_to_the_owner() {
        let db = Database::in_memory().unwrap();
        db.insert_prazo(&prazo("a", "u1", "2026-03-10", Priority::Low)).unwrap();
        db.insert_prazo(&prazo("b", "u2", "2026-03-11", Priority::Low)).unwrap();

        let rows = db
            .query_prazos("u1", &PrazoFilters::default(), None, PrazoSort::DueDateAsc)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "a");
        assert!(db.get_prazo("u1", "b").unwrap().is_none());
    }

    #[test]
    fn window_and_priority_sort_are_applied() {
        let db = Database::in_memory().unwrap();
        db.insert_prazo(&prazo("a", "u1", "2026-03-10", Priority::Low)).unwrap();
        db.insert_prazo(&prazo("b", "u1", "2026-03-20", Priority::Critical)).unwrap();
        db.insert_prazo(&prazo("c", "u1", "2026-04-02", Priority::High)).unwrap();

        let march = (
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
        );
        let rows = db
            .query_prazos("u1", &PrazoFilters::default(), Some(march), PrazoSort::PriorityDesc)
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn mark_overdue_only_touches_past_pending_rows() {
        let mut db = Database::in_memory().unwrap();
        db.insert_prazo(&prazo("a", "u1", "2026-03-01", Priority::Low)).unwrap();
        db.insert_prazo(&prazo("b", "u1", "2026-03-20", Priority::Low)).unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let changed = db.mark_overdue("u1", today, "2026-03-10T00:00:00Z").unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "a");

        let again = db.mark_overdue("u1", today, "2026-03-10T00:00:00Z").unwrap();
        assert!(again.is_empty());
        assert_eq!(db.get_prazo("u1", "a").unwrap().unwrap().status, PrazoStatus::Overdue);
    }

    #[test]
    fn settings_round_trip() {
        let db = Database::new(":memory:").unwrap();
        assert_eq!(db.get_setting("ocr_language").unwrap(), None);
        db.set_setting("ocr_language", "por").unwrap();
        assert_eq!(db.get_setting("ocr_language").unwrap().as_deref(), Some("por"));
        db.delete_setting("ocr_language").unwrap();
        assert_eq!(db.get_setting("ocr_language").unwrap(), None);
    }
}
