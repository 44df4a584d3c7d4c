use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::mysql::MySqlRow;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};

use crate::error::StoreError;
use crate::models::{EntityId, NaturalKey, NaturalKeyField, NaturalKeySpec, StagingRecord};

use super::{key_index_name, validate_ident, ApplyOutcome, EntityTableSummary, TradeStore, RECORD_COLUMNS};

/// MySQL caps a statement at 65 535 placeholders; 19 binds per row.
const MAX_ROWS_PER_STATEMENT: usize = 2_000;
const MAX_KEYS_PER_LOOKUP: usize = 500;

fn key_column_list(spec: &NaturalKeySpec) -> String {
    spec.fields.iter().map(|f| format!("`{}`", f.column())).collect::<Vec<_>>().join(", ")
}

/// Binary collation keeps natural-key comparison exact (no case or accent
/// folding). The default natural key is indexed up front.
fn create_table_sql(table: &str) -> String {
    let key = NaturalKeySpec::default();
    format!(
        "CREATE TABLE IF NOT EXISTS `{t}` (
            `id` CHAR(36) NOT NULL,
            `load_seq` BIGINT UNSIGNED NOT NULL,
            `entity_id` VARCHAR(64) NOT NULL,
            `year` INT NOT NULL,
            `appendix` VARCHAR(8) NOT NULL DEFAULT '',
            `taxon` VARCHAR(255) NOT NULL,
            `class` VARCHAR(64) NOT NULL DEFAULT '',
            `order_name` VARCHAR(64) NOT NULL DEFAULT '',
            `family` VARCHAR(64) NOT NULL DEFAULT '',
            `genus` VARCHAR(64) NOT NULL DEFAULT '',
            `importer` VARCHAR(8) NOT NULL DEFAULT '',
            `exporter` VARCHAR(8) NOT NULL DEFAULT '',
            `origin` VARCHAR(8) NOT NULL DEFAULT '',
            `quantity` DOUBLE NULL,
            `term` VARCHAR(64) NOT NULL DEFAULT '',
            `unit` VARCHAR(64) NOT NULL DEFAULT '',
            `purpose` VARCHAR(8) NOT NULL DEFAULT '',
            `source` VARCHAR(8) NOT NULL DEFAULT '',
            `data_source` VARCHAR(64) NOT NULL DEFAULT '',
            PRIMARY KEY (`id`),
            KEY `idx_entity_year` (`entity_id`, `year`),
            KEY `idx_load_seq` (`load_seq`),
            KEY `{k}` ({kc})
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin",
        t = table,
        k = key_index_name(&key),
        kc = key_column_list(&key)
    )
}

fn select_list() -> String {
    RECORD_COLUMNS.iter().map(|c| format!("`{}`", c)).collect::<Vec<_>>().join(", ")
}

fn record_from_row(r: &MySqlRow) -> Result<StagingRecord, sqlx::Error> {
    Ok(StagingRecord {
        load_seq: r.try_get("load_seq")?,
        entity_id: EntityId(r.try_get("entity_id")?),
        year: r.try_get("year")?,
        appendix: r.try_get("appendix")?,
        taxon: r.try_get("taxon")?,
        class: r.try_get("class")?,
        order_name: r.try_get("order_name")?,
        family: r.try_get("family")?,
        genus: r.try_get("genus")?,
        importer: r.try_get("importer")?,
        exporter: r.try_get("exporter")?,
        origin: r.try_get("origin")?,
        quantity: r.try_get("quantity")?,
        term: r.try_get("term")?,
        unit: r.try_get("unit")?,
        purpose: r.try_get("purpose")?,
        source: r.try_get("source")?,
        data_source: r.try_get("data_source")?,
    })
}

fn insert_builder<'a>(table: &str, rows: &'a [StagingRecord]) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::<MySql>::new(format!("INSERT INTO `{}` (`id`, {}) ", table, select_list()));
    qb.push_values(rows, |mut b, r| {
        b.push_bind(uuid::Uuid::new_v4().to_string())
            .push_bind(r.load_seq)
            .push_bind(r.entity_id.as_str())
            .push_bind(r.year)
            .push_bind(r.appendix.as_str())
            .push_bind(r.taxon.as_str())
            .push_bind(r.class.as_str())
            .push_bind(r.order_name.as_str())
            .push_bind(r.family.as_str())
            .push_bind(r.genus.as_str())
            .push_bind(r.importer.as_str())
            .push_bind(r.exporter.as_str())
            .push_bind(r.origin.as_str())
            .push_bind(r.quantity)
            .push_bind(r.term.as_str())
            .push_bind(r.unit.as_str())
            .push_bind(r.purpose.as_str())
            .push_bind(r.source.as_str())
            .push_bind(r.data_source.as_str());
    });
    qb
}

/// sqlx-backed store over one MySQL database.
#[derive(Clone)]
pub struct MySqlTradeStore {
    pool: MySqlPool,
}

impl MySqlTradeStore {
    pub fn new(pool: MySqlPool) -> Self { Self { pool } }

    pub fn pool(&self) -> &MySqlPool { &self.pool }

    async fn exec(&self, sql: &str) -> Result<(), StoreError> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn require(&self, table: &str) -> Result<(), StoreError> {
        validate_ident(table)?;
        if self.table_exists(table).await? { Ok(()) } else { Err(StoreError::MissingTable(table.to_string())) }
    }
}

#[async_trait]
impl TradeStore for MySqlTradeStore {
    async fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        validate_ident(table)?;
        self.exec(&create_table_sql(table)).await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        validate_ident(table)?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM information_schema.TABLES WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        let cnt: i64 = row.try_get("cnt")?;
        Ok(cnt > 0)
    }

    async fn truncate(&self, table: &str) -> Result<(), StoreError> {
        self.require(table).await?;
        self.exec(&format!("TRUNCATE TABLE `{}`", table)).await
    }

    async fn drop_table(&self, table: &str) -> Result<(), StoreError> {
        validate_ident(table)?;
        self.exec(&format!("DROP TABLE IF EXISTS `{}`", table)).await
    }

    async fn count(&self, table: &str) -> Result<u64, StoreError> {
        validate_ident(table)?;
        let row = sqlx::query(&format!("SELECT COUNT(*) AS cnt FROM `{}`", table)).fetch_one(&self.pool).await?;
        let cnt: i64 = row.try_get("cnt")?;
        Ok(cnt.max(0) as u64)
    }

    async fn insert_batch(&self, table: &str, rows: &[StagingRecord]) -> Result<u64, StoreError> {
        validate_ident(table)?;
        let mut written = 0u64;
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let res = insert_builder(table, chunk).build().execute(&self.pool).await?;
            written += res.rows_affected();
        }
        Ok(written)
    }

    async fn fetch_batch(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<StagingRecord>, StoreError> {
        validate_ident(table)?;
        let sql = format!("SELECT {} FROM `{}` ORDER BY `load_seq` LIMIT ? OFFSET ?", select_list(), table);
        let rows = sqlx::query(&sql).bind(limit as u64).bind(offset).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    async fn ensure_key_index(&self, table: &str, spec: &NaturalKeySpec) -> Result<(), StoreError> {
        self.require(table).await?;
        let name = key_index_name(spec);
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM information_schema.STATISTICS WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND INDEX_NAME = ?",
        )
        .bind(table)
        .bind(&name)
        .fetch_one(&self.pool)
        .await?;
        let cnt: i64 = row.try_get("cnt")?;
        if cnt > 0 { return Ok(()); }
        log::info!("[Store] Creating natural-key index `{}` on `{}` ({})", name, table, spec.describe());
        self.exec(&format!("CREATE INDEX `{}` ON `{}` ({})", name, table, key_column_list(spec))).await
    }

    async fn key_counts(&self, table: &str, spec: &NaturalKeySpec, keys: &[NaturalKey]) -> Result<HashMap<NaturalKey, u64>, StoreError> {
        validate_ident(table)?;
        // Columns are compared and returned in their own types so the key index applies.
        let tuple = key_column_list(spec);
        let mut out = HashMap::new();
        for chunk in keys.chunks(MAX_KEYS_PER_LOOKUP) {
            let mut qb = QueryBuilder::<MySql>::new(format!("SELECT {t}, COUNT(*) AS cnt FROM `{}` WHERE ({t}) IN ", table, t = tuple));
            let mut bad_year = None;
            qb.push_tuples(chunk, |mut b, key| {
                for (field, v) in spec.fields.iter().zip(&key.0) {
                    if *field == NaturalKeyField::Year {
                        match v.parse::<i32>() {
                            Ok(y) => { b.push_bind(y); }
                            Err(_) => { bad_year = Some(v.clone()); b.push_bind(0i32); }
                        }
                    } else {
                        b.push_bind(v.as_str());
                    }
                }
            });
            if let Some(v) = bad_year {
                return Err(StoreError::Rejected(format!("natural key year {:?} is not an integer", v)));
            }
            qb.push(format!(" GROUP BY {}", tuple));
            let rows = qb.build().fetch_all(&self.pool).await?;
            for r in rows {
                let mut parts = Vec::with_capacity(spec.fields.len());
                for (i, field) in spec.fields.iter().enumerate() {
                    let v = if *field == NaturalKeyField::Year { r.try_get::<i32, _>(i)?.to_string() } else { r.try_get::<String, _>(i)? };
                    parts.push(v);
                }
                let cnt: i64 = r.try_get("cnt")?;
                out.insert(NaturalKey(parts), cnt.max(0) as u64);
            }
        }
        Ok(out)
    }

    async fn entity_summary(&self, table: &str) -> Result<Vec<EntityTableSummary>, StoreError> {
        self.require(table).await?;
        let sql = format!(
            "SELECT `entity_id`, COUNT(*) AS cnt, MIN(`year`) AS min_year, MAX(`year`) AS max_year FROM `{}` GROUP BY `entity_id` ORDER BY `entity_id`",
            table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let cnt: i64 = r.try_get("cnt")?;
            out.push(EntityTableSummary {
                entity_id: EntityId(r.try_get("entity_id")?),
                rows: cnt.max(0) as u64,
                min_year: r.try_get("min_year")?,
                max_year: r.try_get("max_year")?,
            });
        }
        Ok(out)
    }

    async fn apply_rows(&self, table: &str, rows: &[StagingRecord], batch_size: usize, cancel: &AtomicBool) -> Result<ApplyOutcome, StoreError> {
        self.require(table).await?;
        let mut tx = self.pool.begin().await?;
        let mut outcome = ApplyOutcome::default();
        for batch in rows.chunks(batch_size.max(1)) {
            if cancel.load(Ordering::Relaxed) {
                outcome.interrupted = true;
                break;
            }
            for chunk in batch.chunks(MAX_ROWS_PER_STATEMENT) {
                // An error returns early and drops `tx`, which rolls back.
                let res = insert_builder(table, chunk).build().execute(&mut *tx).await?;
                outcome.applied += res.rows_affected();
            }
            outcome.batches += 1;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn create_snapshot(&self, table: &str, snapshot: &str) -> Result<u64, StoreError> {
        self.require(table).await?;
        validate_ident(snapshot)?;
        self.exec(&format!("DROP TABLE IF EXISTS `{}`", snapshot)).await?;
        self.exec(&format!("CREATE TABLE `{}` LIKE `{}`", snapshot, table)).await?;
        let res = sqlx::query(&format!("INSERT INTO `{}` SELECT * FROM `{}`", snapshot, table)).execute(&self.pool).await?;
        Ok(res.rows_affected())
    }

    async fn restore_snapshot(&self, table: &str, snapshot: &str) -> Result<(), StoreError> {
        validate_ident(table)?;
        if !self.table_exists(snapshot).await? {
            return Err(StoreError::MissingSnapshot(snapshot.to_string()));
        }
        let discarded = format!("{}__discarded", table);
        validate_ident(&discarded)?;
        self.exec(&format!("DROP TABLE IF EXISTS `{}`", discarded)).await?;
        if self.table_exists(table).await? {
            self.exec(&format!("RENAME TABLE `{t}` TO `{d}`, `{s}` TO `{t}`", t = table, d = discarded, s = snapshot)).await?;
            self.exec(&format!("DROP TABLE `{}`", discarded)).await
        } else {
            self.exec(&format!("RENAME TABLE `{}` TO `{}`", snapshot, table)).await
        }
    }

    async fn swap_tables(&self, live: &str, shadow: &str, retired: &str) -> Result<(), StoreError> {
        self.require(live).await?;
        self.require(shadow).await?;
        validate_ident(retired)?;
        self.exec(&format!("DROP TABLE IF EXISTS `{}`", retired)).await?;
        self.exec(&format!("RENAME TABLE `{l}` TO `{r}`, `{s}` TO `{l}`", l = live, r = retired, s = shadow)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_sql_names_every_record_column() {
        let sql = create_table_sql("trade_records");
        for c in RECORD_COLUMNS { assert!(sql.contains(&format!("`{}`", c)), "missing {}", c); }
        assert!(sql.contains("utf8mb4_bin"));
    }

    #[test]
    fn create_sql_indexes_default_natural_key() {
        let sql = create_table_sql("trade_records");
        let key = NaturalKeySpec::default();
        let expected = format!("KEY `{}` (`entity_id`, `year`, `taxon`, `importer`, `exporter`, `term`, `purpose`, `source`)", key_index_name(&key));
        assert!(sql.contains(&expected), "{}", sql);
        assert!(!sql.contains("CAST"));
    }

    #[test]
    fn insert_statement_fits_placeholder_limit() {
        assert!(MAX_ROWS_PER_STATEMENT * (RECORD_COLUMNS.len() + 1) < 65_535);
    }
}
