#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use quota_projection_core::{
    format_rfc3339, parse_rfc3339_utc, ColumnType, EventEnvelope, NotificationState,
    QuotaProjection, QuotaUnit, SqlValue, Statement, TableSchema,
};
use rusqlite::types::Value as DbValue;
use rusqlite::{params, Connection, OptionalExtension};

const QUOTA_MIGRATION_VERSION: i64 = 1;

const INCREMENT_USAGE_STATEMENT: &str = "INSERT INTO quotas_periods\
 (instance_id, unit, start, usage)\
 VALUES (?1, ?2, ?3, ?4) ON CONFLICT (instance_id, unit, start)\
 DO UPDATE SET usage = usage + excluded.usage RETURNING usage";

/// SQLite materialization of the quota projection: applies reduced
/// statements transactionally and owns the one direct-SQL operation, the
/// atomic usage increment.
pub struct SqliteQuotaStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct QuotaRow {
    pub id: String,
    pub instance_id: String,
    pub unit: QuotaUnit,
    pub amount: i64,
    pub from_anchor: String,
    pub interval_secs: i64,
    pub limit_usage: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct QuotaPeriodRow {
    pub instance_id: String,
    pub unit: QuotaUnit,
    pub start: String,
    pub usage: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct QuotaNotificationRow {
    pub instance_id: String,
    pub unit: QuotaUnit,
    pub id: String,
    pub call_url: String,
    pub percent: u32,
    pub repeat: bool,
    pub latest_due_period_start: Option<String>,
    pub next_due_threshold: Option<u64>,
}

impl QuotaNotificationRow {
    /// The row as threshold-due evaluation state.
    pub fn state(&self) -> Result<NotificationState> {
        let latest_due_period_start = match self.latest_due_period_start.as_deref() {
            Some(raw) => Some(
                parse_rfc3339_utc(raw)
                    .map_err(|err| anyhow!("invalid stored due period start: {err}"))?,
            ),
            None => None,
        };

        Ok(NotificationState {
            id: self.id.clone(),
            call_url: self.call_url.clone(),
            percent: self.percent,
            repeat: self.repeat,
            latest_due_period_start,
            next_due_threshold: self.next_due_threshold,
        })
    }
}

impl SqliteQuotaStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        for table in QuotaProjection::tables() {
            self.conn
                .execute_batch(&render_create_table(&table))
                .with_context(|| format!("failed to create projection table {}", table.name))?;
        }

        let now = format_rfc3339(quota_projection_core::now_utc())
            .map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![QUOTA_MIGRATION_VERSION, now],
            )
            .context("failed to register quota schema migration")?;

        Ok(())
    }

    /// Applies one statement in its own transaction. A multi-statement batch
    /// is all-or-nothing: either every inner statement lands or none does.
    pub fn apply(&mut self, statement: &Statement) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start statement transaction")?;
        apply_within(&tx, statement)?;
        tx.commit().context("failed to commit statement transaction")
    }

    /// Validates, reduces, and applies one event: the per-event unit an
    /// in-order delivery loop drives.
    pub fn apply_event(&mut self, event: &EventEnvelope) -> Result<()> {
        event
            .validate()
            .with_context(|| format!("rejecting {} event", event.event_type()))?;
        self.apply(&QuotaProjection::reduce(event))
    }

    /// Atomically adds `count` to the (instance, unit, period start) usage
    /// bucket, creating it if absent, and returns the cumulative usage. A
    /// zero count never touches storage.
    pub fn increment_usage(
        &self,
        unit: QuotaUnit,
        instance_id: &str,
        period_start: time::OffsetDateTime,
        count: u64,
    ) -> Result<u64> {
        if count == 0 {
            return Ok(0);
        }

        let start = format_rfc3339(period_start).map_err(|err| anyhow!(err.to_string()))?;
        let count = i64::try_from(count)
            .with_context(|| format!("usage increment count out of range for unit {unit}"))?;

        let sum: i64 = self
            .conn
            .query_row(
                INCREMENT_USAGE_STATEMENT,
                params![instance_id, unit.as_str(), start, count],
                |row| row.get(0),
            )
            .with_context(|| {
                format!("incrementing usage for unit {unit} failed for at least one quota period")
            })?;

        u64::try_from(sum).with_context(|| format!("stored usage out of range: {sum}"))
    }

    pub fn get_quota(&self, instance_id: &str, unit: QuotaUnit) -> Result<Option<QuotaRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, instance_id, unit, amount, from_anchor, interval, limit_usage
             FROM quotas
             WHERE instance_id = ?1 AND unit = ?2",
        )?;

        let row = stmt
            .query_row(params![instance_id, unit.as_str()], parse_quota_row)
            .optional()?;

        Ok(row)
    }

    pub fn list_periods(
        &self,
        instance_id: &str,
        unit: Option<QuotaUnit>,
    ) -> Result<Vec<QuotaPeriodRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT instance_id, unit, start, usage
             FROM quotas_periods
             WHERE instance_id = ?1 AND (?2 IS NULL OR unit = ?2)
             ORDER BY unit ASC, start ASC",
        )?;

        let rows = stmt.query_map(
            params![instance_id, unit.map(QuotaUnit::as_str)],
            parse_period_row,
        )?;
        collect_rows(rows)
    }

    pub fn list_notifications(
        &self,
        instance_id: &str,
        unit: Option<QuotaUnit>,
    ) -> Result<Vec<QuotaNotificationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT instance_id, unit, id, call_url, percent, repeat,
                    latest_due_period_start, next_due_threshold
             FROM quotas_notifications
             WHERE instance_id = ?1 AND (?2 IS NULL OR unit = ?2)
             ORDER BY unit ASC, id ASC",
        )?;

        let rows = stmt.query_map(
            params![instance_id, unit.map(QuotaUnit::as_str)],
            parse_notification_row,
        )?;
        collect_rows(rows)
    }

    pub fn get_period_usage(
        &self,
        unit: QuotaUnit,
        instance_id: &str,
        period_start: time::OffsetDateTime,
    ) -> Result<Option<u64>> {
        let start = format_rfc3339(period_start).map_err(|err| anyhow!(err.to_string()))?;
        let usage = self
            .conn
            .query_row(
                "SELECT usage FROM quotas_periods
                 WHERE instance_id = ?1 AND unit = ?2 AND start = ?3",
                params![instance_id, unit.as_str(), start],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to read quota period usage")?;

        usage
            .map(|value| {
                u64::try_from(value).with_context(|| format!("stored usage out of range: {value}"))
            })
            .transpose()
    }

    #[cfg(test)]
    fn count_rows(&self, table: &str) -> Result<i64> {
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count rows in {table}"))?;
        Ok(count)
    }
}

fn apply_within(tx: &rusqlite::Transaction<'_>, statement: &Statement) -> Result<()> {
    match statement {
        Statement::NoOp => Ok(()),
        Statement::Multi(statements) => {
            for statement in statements {
                apply_within(tx, statement)?;
            }
            Ok(())
        }
        Statement::Create { table, columns } => {
            let names = columns
                .iter()
                .map(|column| column.column)
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = (1..=columns.len())
                .map(|index| format!("?{index}"))
                .collect::<Vec<_>>()
                .join(", ");
            // redelivered create statements converge instead of erroring
            let sql = format!("INSERT OR IGNORE INTO {table} ({names}) VALUES ({placeholders})");

            let values = columns
                .iter()
                .map(|column| bind_value(&column.value))
                .collect::<Result<Vec<_>>>()?;
            tx.execute(&sql, rusqlite::params_from_iter(values))
                .with_context(|| format!("failed to create row in {table}"))?;
            Ok(())
        }
        Statement::Update {
            table,
            columns,
            conditions,
        } => {
            let assignments = columns
                .iter()
                .enumerate()
                .map(|(index, column)| format!("{} = ?{}", column.column, index + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let matches = conditions
                .iter()
                .enumerate()
                .map(|(index, condition)| {
                    format!("{} = ?{}", condition.column, columns.len() + index + 1)
                })
                .collect::<Vec<_>>()
                .join(" AND ");
            let sql = format!("UPDATE {table} SET {assignments} WHERE {matches}");

            let values = columns
                .iter()
                .map(|column| &column.value)
                .chain(conditions.iter().map(|condition| &condition.value))
                .map(bind_value)
                .collect::<Result<Vec<_>>>()?;
            // zero matched rows is a silent, already-applied outcome
            tx.execute(&sql, rusqlite::params_from_iter(values))
                .with_context(|| format!("failed to update rows in {table}"))?;
            Ok(())
        }
        Statement::Delete { table, conditions } => {
            if conditions.is_empty() {
                return Err(anyhow!(
                    "delete statement for {table} MUST carry at least one condition"
                ));
            }

            let matches = conditions
                .iter()
                .enumerate()
                .map(|(index, condition)| format!("{} = ?{}", condition.column, index + 1))
                .collect::<Vec<_>>()
                .join(" AND ");
            let sql = format!("DELETE FROM {table} WHERE {matches}");

            let values = conditions
                .iter()
                .map(|condition| bind_value(&condition.value))
                .collect::<Result<Vec<_>>>()?;
            tx.execute(&sql, rusqlite::params_from_iter(values))
                .with_context(|| format!("failed to delete rows from {table}"))?;
            Ok(())
        }
    }
}

fn bind_value(value: &SqlValue) -> Result<DbValue> {
    Ok(match value {
        SqlValue::Text(text) => DbValue::Text(text.clone()),
        SqlValue::Integer(value) => DbValue::Integer(*value),
        SqlValue::Bool(value) => DbValue::Integer(i64::from(*value)),
        SqlValue::Timestamp(value) => {
            DbValue::Text(format_rfc3339(*value).map_err(|err| anyhow!(err.to_string()))?)
        }
        SqlValue::Interval(value) => DbValue::Integer(value.whole_seconds()),
        SqlValue::Null => DbValue::Null,
    })
}

fn render_create_table(table: &TableSchema) -> String {
    let mut definitions = Vec::with_capacity(table.columns.len() + 1);
    for column in table.columns {
        let sql_type = match column.column_type {
            ColumnType::Text | ColumnType::Timestamp => "TEXT",
            ColumnType::Int64 | ColumnType::Bool | ColumnType::Interval => "INTEGER",
        };
        let constraint = if column.nullable { "" } else { " NOT NULL" };
        definitions.push(format!("  {} {sql_type}{constraint}", column.name));
    }
    definitions.push(format!("  PRIMARY KEY ({})", table.primary_key.join(", ")));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
        table.name,
        definitions.join(",\n")
    )
}

fn parse_quota_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuotaRow> {
    Ok(QuotaRow {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        unit: parse_unit(&row.get::<_, String>(2)?, 2)?,
        amount: row.get(3)?,
        from_anchor: row.get(4)?,
        interval_secs: row.get(5)?,
        limit_usage: row.get::<_, i64>(6)? == 1,
    })
}

fn parse_period_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuotaPeriodRow> {
    let usage_i64: i64 = row.get(3)?;
    let usage = u64::try_from(usage_i64).map_err(|_| {
        invalid_column(3, rusqlite::types::Type::Integer, format!("invalid usage: {usage_i64}"))
    })?;

    Ok(QuotaPeriodRow {
        instance_id: row.get(0)?,
        unit: parse_unit(&row.get::<_, String>(1)?, 1)?,
        start: row.get(2)?,
        usage,
    })
}

fn parse_notification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuotaNotificationRow> {
    let percent_i64: i64 = row.get(4)?;
    let percent = u32::try_from(percent_i64).map_err(|_| {
        invalid_column(
            4,
            rusqlite::types::Type::Integer,
            format!("invalid percent: {percent_i64}"),
        )
    })?;

    let next_due_threshold = row
        .get::<_, Option<i64>>(7)?
        .map(|value| {
            u64::try_from(value).map_err(|_| {
                invalid_column(
                    7,
                    rusqlite::types::Type::Integer,
                    format!("invalid next due threshold: {value}"),
                )
            })
        })
        .transpose()?;

    Ok(QuotaNotificationRow {
        instance_id: row.get(0)?,
        unit: parse_unit(&row.get::<_, String>(1)?, 1)?,
        id: row.get(2)?,
        call_url: row.get(3)?,
        percent,
        repeat: row.get::<_, i64>(5)? == 1,
        latest_due_period_start: row.get(6)?,
        next_due_threshold,
    })
}

fn parse_unit(raw: &str, column_index: usize) -> rusqlite::Result<QuotaUnit> {
    QuotaUnit::parse(raw).ok_or_else(|| {
        invalid_column(
            column_index,
            rusqlite::types::Type::Text,
            format!("invalid quota unit: {raw}"),
        )
    })
}

fn invalid_column(
    column_index: usize,
    column_type: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column_index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use quota_projection_core::{
        current_period_start, notification_is_due, parse_rfc3339_utc, reached_threshold,
        used_percent, DomainEvent, InstanceEvent, InstanceRemovedEvent, NotificationConfig,
        QuotaAddedEvent, QuotaEvent, QuotaNotificationDueEvent, QuotaRemovedEvent,
        QUOTAS_TABLE, QUOTA_NOTIFICATIONS_TABLE, QUOTA_PERIODS_TABLE,
    };
    use time::{Duration, OffsetDateTime};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(value) {
            Ok(parsed) => parsed,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn fixture_store() -> SqliteQuotaStore {
        let store = must(SqliteQuotaStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_quota_added(instance_id: &str, unit: QuotaUnit) -> QuotaAddedEvent {
        QuotaAddedEvent {
            aggregate_id: format!("quota-{instance_id}-{unit}"),
            instance_id: instance_id.to_string(),
            unit,
            amount: 1_000,
            from_anchor: must_utc("2026-01-01T00:00:00Z"),
            reset_interval: Duration::days(30),
            limit_usage: true,
            notifications: vec![NotificationConfig {
                id: "n1".to_string(),
                call_url: "https://tenant.example/hook".to_string(),
                percent: 80,
                repeat: true,
            }],
        }
    }

    fn quota_added(store: &mut SqliteQuotaStore, instance_id: &str, unit: QuotaUnit) {
        let event = fixture_quota_added(instance_id, unit);
        must(store.apply_event(&EventEnvelope::Domain(DomainEvent::Quota(QuotaEvent::Added(
            event,
        )))));
    }

    #[test]
    fn migrate_is_idempotent_and_declares_all_tables() {
        let store = fixture_store();
        must(store.migrate());

        for table in QuotaProjection::tables() {
            assert_eq!(must(store.count_rows(table.name)), 0);
        }
    }

    #[test]
    fn quota_added_materializes_quota_and_notification_rows() {
        let mut store = fixture_store();
        quota_added(&mut store, "instance-1", QuotaUnit::AuthenticatedRequests);

        let quota = match must(store.get_quota("instance-1", QuotaUnit::AuthenticatedRequests)) {
            Some(row) => row,
            None => panic!("missing quota row"),
        };
        assert_eq!(quota.amount, 1_000);
        assert_eq!(quota.interval_secs, Duration::days(30).whole_seconds());
        assert!(quota.limit_usage);

        let notifications = must(store.list_notifications("instance-1", None));
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].percent, 80);
        assert!(notifications[0].repeat);
        assert_eq!(notifications[0].latest_due_period_start, None);
        assert_eq!(notifications[0].next_due_threshold, None);
    }

    #[test]
    fn quota_added_redelivery_is_idempotent() {
        let mut store = fixture_store();
        quota_added(&mut store, "instance-1", QuotaUnit::AuthenticatedRequests);
        quota_added(&mut store, "instance-1", QuotaUnit::AuthenticatedRequests);

        assert_eq!(must(store.count_rows(QUOTAS_TABLE)), 1);
        assert_eq!(must(store.count_rows(QUOTA_NOTIFICATIONS_TABLE)), 1);
    }

    #[test]
    fn quota_added_then_removed_leaves_zero_rows_for_the_scope() {
        let mut store = fixture_store();
        quota_added(&mut store, "instance-1", QuotaUnit::AuthenticatedRequests);
        let period_start = must_utc("2026-01-01T00:00:00Z");
        let _ = must(store.increment_usage(
            QuotaUnit::AuthenticatedRequests,
            "instance-1",
            period_start,
            5,
        ));

        must(store.apply_event(&EventEnvelope::Domain(DomainEvent::Quota(
            QuotaEvent::Removed(QuotaRemovedEvent {
                instance_id: "instance-1".to_string(),
                unit: QuotaUnit::AuthenticatedRequests,
            }),
        ))));

        assert_eq!(must(store.count_rows(QUOTAS_TABLE)), 0);
        assert_eq!(must(store.count_rows(QUOTA_PERIODS_TABLE)), 0);
        assert_eq!(must(store.count_rows(QUOTA_NOTIFICATIONS_TABLE)), 0);
    }

    #[test]
    fn quota_removed_without_existing_rows_is_silent() {
        let mut store = fixture_store();
        must(store.apply_event(&EventEnvelope::Domain(DomainEvent::Quota(
            QuotaEvent::Removed(QuotaRemovedEvent {
                instance_id: "instance-1".to_string(),
                unit: QuotaUnit::ActionRunSeconds,
            }),
        ))));
    }

    #[test]
    fn instance_removed_cascades_all_units_and_spares_other_instances() {
        let mut store = fixture_store();
        quota_added(&mut store, "instance-1", QuotaUnit::AuthenticatedRequests);
        quota_added(&mut store, "instance-1", QuotaUnit::ActionRunSeconds);
        quota_added(&mut store, "instance-2", QuotaUnit::AuthenticatedRequests);

        let period_start = must_utc("2026-01-01T00:00:00Z");
        for unit in [QuotaUnit::AuthenticatedRequests, QuotaUnit::ActionRunSeconds] {
            let _ = must(store.increment_usage(unit, "instance-1", period_start, 10));
        }
        let _ = must(store.increment_usage(
            QuotaUnit::AuthenticatedRequests,
            "instance-2",
            period_start,
            7,
        ));

        must(store.apply_event(&EventEnvelope::Domain(DomainEvent::Instance(
            InstanceEvent::Removed(InstanceRemovedEvent {
                instance_id: "instance-1".to_string(),
            }),
        ))));

        assert_eq!(must(store.list_periods("instance-1", None)).len(), 0);
        assert_eq!(must(store.list_notifications("instance-1", None)).len(), 0);
        assert_eq!(
            must(store.get_quota("instance-1", QuotaUnit::AuthenticatedRequests)),
            None
        );
        assert_eq!(
            must(store.get_quota("instance-1", QuotaUnit::ActionRunSeconds)),
            None
        );

        let survivor = must(store.get_quota("instance-2", QuotaUnit::AuthenticatedRequests));
        assert!(survivor.is_some());
        assert_eq!(
            must(store.get_period_usage(
                QuotaUnit::AuthenticatedRequests,
                "instance-2",
                period_start
            )),
            Some(7)
        );
        assert_eq!(must(store.list_notifications("instance-2", None)).len(), 1);
    }

    #[test]
    fn notification_due_updates_only_the_due_columns() {
        let mut store = fixture_store();
        quota_added(&mut store, "instance-1", QuotaUnit::AuthenticatedRequests);

        let period_start = must_utc("2026-01-01T00:00:00Z");
        must(store.apply_event(&EventEnvelope::Domain(DomainEvent::Quota(
            QuotaEvent::NotificationDue(QuotaNotificationDueEvent {
                instance_id: "instance-1".to_string(),
                unit: QuotaUnit::AuthenticatedRequests,
                id: "n1".to_string(),
                call_url: "https://tenant.example/hook".to_string(),
                period_start,
                threshold: 80,
                usage: 850,
            }),
        ))));

        let notifications = must(store.list_notifications("instance-1", None));
        assert_eq!(notifications.len(), 1);
        let row = &notifications[0];
        assert_eq!(row.id, "n1");
        assert_eq!(row.call_url, "https://tenant.example/hook");
        assert_eq!(row.percent, 80);
        assert!(row.repeat);
        assert_eq!(
            row.latest_due_period_start.as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
        assert_eq!(row.next_due_threshold, Some(180));
    }

    #[test]
    fn notification_due_for_unknown_scope_matches_zero_rows() {
        let mut store = fixture_store();
        must(store.apply_event(&EventEnvelope::Domain(DomainEvent::Quota(
            QuotaEvent::NotificationDue(QuotaNotificationDueEvent {
                instance_id: "instance-9".to_string(),
                unit: QuotaUnit::ActionRunSeconds,
                id: "n1".to_string(),
                call_url: "https://tenant.example/hook".to_string(),
                period_start: must_utc("2026-01-01T00:00:00Z"),
                threshold: 80,
                usage: 850,
            }),
        ))));
        assert_eq!(must(store.count_rows(QUOTA_NOTIFICATIONS_TABLE)), 0);
    }

    #[test]
    fn invalid_quota_added_is_rejected_before_any_write() {
        let mut store = fixture_store();
        let mut event = fixture_quota_added("instance-1", QuotaUnit::AuthenticatedRequests);
        event.amount = 0;

        let result = store.apply_event(&EventEnvelope::Domain(DomainEvent::Quota(
            QuotaEvent::Added(event),
        )));
        assert!(result.is_err());
        assert_eq!(must(store.count_rows(QUOTAS_TABLE)), 0);
    }

    #[test]
    fn increment_usage_accumulates_across_calls() {
        let store = fixture_store();
        let period_start = must_utc("2026-01-01T00:00:00Z");

        let first = must(store.increment_usage(
            QuotaUnit::AuthenticatedRequests,
            "instance-1",
            period_start,
            850,
        ));
        assert_eq!(first, 850);

        let second = must(store.increment_usage(
            QuotaUnit::AuthenticatedRequests,
            "instance-1",
            period_start,
            150,
        ));
        assert_eq!(second, 1_000);

        assert_eq!(
            must(store.get_period_usage(
                QuotaUnit::AuthenticatedRequests,
                "instance-1",
                period_start
            )),
            Some(1_000)
        );
    }

    #[test]
    fn increment_usage_isolates_buckets_by_unit_and_period() {
        let store = fixture_store();
        let first_period = must_utc("2026-01-01T00:00:00Z");
        let second_period = must_utc("2026-01-31T00:00:00Z");

        let _ = must(store.increment_usage(
            QuotaUnit::AuthenticatedRequests,
            "instance-1",
            first_period,
            10,
        ));
        let _ = must(store.increment_usage(
            QuotaUnit::ActionRunSeconds,
            "instance-1",
            first_period,
            20,
        ));
        let _ = must(store.increment_usage(
            QuotaUnit::AuthenticatedRequests,
            "instance-1",
            second_period,
            30,
        ));

        assert_eq!(
            must(store.get_period_usage(
                QuotaUnit::AuthenticatedRequests,
                "instance-1",
                first_period
            )),
            Some(10)
        );
        assert_eq!(
            must(store.get_period_usage(QuotaUnit::ActionRunSeconds, "instance-1", first_period)),
            Some(20)
        );
        assert_eq!(
            must(store.get_period_usage(
                QuotaUnit::AuthenticatedRequests,
                "instance-1",
                second_period
            )),
            Some(30)
        );
    }

    #[test]
    fn increment_usage_with_zero_count_never_creates_a_row() {
        let store = fixture_store();
        let period_start = must_utc("2026-01-01T00:00:00Z");

        let sum = must(store.increment_usage(
            QuotaUnit::AuthenticatedRequests,
            "instance-1",
            period_start,
            0,
        ));
        assert_eq!(sum, 0);
        assert_eq!(
            must(store.get_period_usage(
                QuotaUnit::AuthenticatedRequests,
                "instance-1",
                period_start
            )),
            None
        );

        let _ = must(store.increment_usage(
            QuotaUnit::AuthenticatedRequests,
            "instance-1",
            period_start,
            5,
        ));
        let sum = must(store.increment_usage(
            QuotaUnit::AuthenticatedRequests,
            "instance-1",
            period_start,
            0,
        ));
        assert_eq!(sum, 0);
        assert_eq!(
            must(store.get_period_usage(
                QuotaUnit::AuthenticatedRequests,
                "instance-1",
                period_start
            )),
            Some(5)
        );
    }

    #[test]
    fn threshold_walkthrough_from_added_quota_to_escalated_notification() {
        let mut store = fixture_store();
        quota_added(&mut store, "instance-1", QuotaUnit::AuthenticatedRequests);

        let quota = match must(store.get_quota("instance-1", QuotaUnit::AuthenticatedRequests)) {
            Some(row) => row,
            None => panic!("missing quota row"),
        };
        let from_anchor = must_utc(&quota.from_anchor);
        let period_start = match current_period_start(
            from_anchor,
            Duration::seconds(quota.interval_secs),
            must_utc("2026-01-20T09:30:00Z"),
        ) {
            Ok(value) => value,
            Err(err) => panic!("period arithmetic failed: {err}"),
        };
        assert_eq!(period_start, from_anchor);

        let usage = must(store.increment_usage(
            QuotaUnit::AuthenticatedRequests,
            "instance-1",
            period_start,
            850,
        ));
        assert_eq!(usage, 850);

        let used = used_percent(usage, quota.amount);
        assert_eq!(used, 85);

        let notifications = must(store.list_notifications(
            "instance-1",
            Some(QuotaUnit::AuthenticatedRequests),
        ));
        let state = must(notifications[0].state());
        assert!(notification_is_due(&state, period_start, used));
        let threshold = match reached_threshold(state.percent, used) {
            Some(value) => value,
            None => panic!("expected a reached threshold"),
        };
        assert_eq!(threshold, 80);

        must(store.apply_event(&EventEnvelope::Domain(DomainEvent::Quota(
            QuotaEvent::NotificationDue(QuotaNotificationDueEvent {
                instance_id: "instance-1".to_string(),
                unit: QuotaUnit::AuthenticatedRequests,
                id: state.id.clone(),
                call_url: state.call_url.clone(),
                period_start,
                threshold,
                usage,
            }),
        ))));

        let notifications = must(store.list_notifications(
            "instance-1",
            Some(QuotaUnit::AuthenticatedRequests),
        ));
        assert_eq!(
            notifications[0].latest_due_period_start.as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
        assert_eq!(notifications[0].next_due_threshold, Some(180));

        // the same usage level no longer re-fires inside the period
        let state = must(notifications[0].state());
        assert!(!notification_is_due(&state, period_start, used));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_increment_total_is_order_independent(counts in prop::collection::vec(0u64..500, 1..24)) {
            let period_start = must_utc("2026-01-01T00:00:00Z");

            let forward = fixture_store();
            for count in &counts {
                let _ = must(forward.increment_usage(
                    QuotaUnit::AuthenticatedRequests,
                    "instance-1",
                    period_start,
                    *count,
                ));
            }

            let reversed = fixture_store();
            for count in counts.iter().rev() {
                let _ = must(reversed.increment_usage(
                    QuotaUnit::AuthenticatedRequests,
                    "instance-1",
                    period_start,
                    *count,
                ));
            }

            let total: u64 = counts.iter().sum();
            let forward_usage = must(forward.get_period_usage(
                QuotaUnit::AuthenticatedRequests,
                "instance-1",
                period_start,
            ));
            let reversed_usage = must(reversed.get_period_usage(
                QuotaUnit::AuthenticatedRequests,
                "instance-1",
                period_start,
            ));

            if total == 0 {
                prop_assert_eq!(forward_usage, None);
                prop_assert_eq!(reversed_usage, None);
            } else {
                prop_assert_eq!(forward_usage, Some(total));
                prop_assert_eq!(reversed_usage, Some(total));
            }
        }
    }
}
