use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProjectionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

pub const QUOTAS_TABLE: &str = "quotas";
pub const QUOTA_PERIODS_TABLE: &str = "quotas_periods";
pub const QUOTA_NOTIFICATIONS_TABLE: &str = "quotas_notifications";

pub const QUOTA_COL_ID: &str = "id";
pub const QUOTA_COL_INSTANCE_ID: &str = "instance_id";
pub const QUOTA_COL_UNIT: &str = "unit";
pub const QUOTA_COL_AMOUNT: &str = "amount";
pub const QUOTA_COL_FROM: &str = "from_anchor";
pub const QUOTA_COL_INTERVAL: &str = "interval";
pub const QUOTA_COL_LIMIT: &str = "limit_usage";

pub const PERIOD_COL_INSTANCE_ID: &str = "instance_id";
pub const PERIOD_COL_UNIT: &str = "unit";
pub const PERIOD_COL_START: &str = "start";
pub const PERIOD_COL_USAGE: &str = "usage";

pub const NOTIFICATION_COL_INSTANCE_ID: &str = "instance_id";
pub const NOTIFICATION_COL_UNIT: &str = "unit";
pub const NOTIFICATION_COL_ID: &str = "id";
pub const NOTIFICATION_COL_CALL_URL: &str = "call_url";
pub const NOTIFICATION_COL_PERCENT: &str = "percent";
pub const NOTIFICATION_COL_REPEAT: &str = "repeat";
pub const NOTIFICATION_COL_LATEST_DUE_PERIOD_START: &str = "latest_due_period_start";
pub const NOTIFICATION_COL_NEXT_DUE_THRESHOLD: &str = "next_due_threshold";

pub const QUOTA_ADDED_EVENT_TYPE: &str = "quota.added";
pub const QUOTA_REMOVED_EVENT_TYPE: &str = "quota.removed";
pub const QUOTA_NOTIFICATION_DUE_EVENT_TYPE: &str = "quota.notification.due";
pub const QUOTA_NOTIFIED_EVENT_TYPE: &str = "quota.notified";
pub const INSTANCE_REMOVED_EVENT_TYPE: &str = "instance.removed";

/// Namespace reserved for synthetic events that never touch the event log.
pub const PSEUDO_EVENT_TYPE_PREFIX: &str = "pseudo.";
pub const SCHEDULED_EVENT_TYPE: &str = "pseudo.timestamp";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuotaUnit {
    AuthenticatedRequests,
    ActionRunSeconds,
}

impl QuotaUnit {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticatedRequests => "authenticated_requests",
            Self::ActionRunSeconds => "action_run_seconds",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "authenticated_requests" => Some(Self::AuthenticatedRequests),
            "action_run_seconds" => Some(Self::ActionRunSeconds),
            _ => None,
        }
    }
}

impl Display for QuotaUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Bool(bool),
    Timestamp(OffsetDateTime),
    Interval(Duration),
    Null,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ColumnValue {
    pub column: &'static str,
    pub value: SqlValue,
}

impl ColumnValue {
    #[must_use]
    pub fn new(column: &'static str, value: SqlValue) -> Self {
        Self { column, value }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Condition {
    pub column: &'static str,
    pub value: SqlValue,
}

impl Condition {
    #[must_use]
    pub fn new(column: &'static str, value: SqlValue) -> Self {
        Self { column, value }
    }
}

/// One storage mutation produced by a reducer. The applier interprets it;
/// reducers never execute SQL themselves.
///
/// `Create` rows are written with ignore-on-duplicate semantics so that
/// redelivered events converge on the same table state. `Update` and
/// `Delete` matching zero rows is silent. `Multi` is applied as one atomic
/// unit.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Statement {
    Create {
        table: &'static str,
        columns: Vec<ColumnValue>,
    },
    Update {
        table: &'static str,
        columns: Vec<ColumnValue>,
        conditions: Vec<Condition>,
    },
    Delete {
        table: &'static str,
        conditions: Vec<Condition>,
    },
    Multi(Vec<Statement>),
    NoOp,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NotificationConfig {
    pub id: String,
    pub call_url: String,
    pub percent: u32,
    pub repeat: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QuotaAddedEvent {
    pub aggregate_id: String,
    pub instance_id: String,
    pub unit: QuotaUnit,
    pub amount: i64,
    pub from_anchor: OffsetDateTime,
    pub reset_interval: Duration,
    pub limit_usage: bool,
    pub notifications: Vec<NotificationConfig>,
}

impl QuotaAddedEvent {
    /// Validates the payload before it enters the reduction path.
    ///
    /// # Errors
    /// Returns [`ProjectionError::Validation`] when required fields are
    /// missing or violate schema constraints.
    pub fn validate(&self) -> Result<(), ProjectionError> {
        if self.aggregate_id.trim().is_empty() {
            return Err(ProjectionError::Validation(
                "quota id MUST be provided".to_string(),
            ));
        }

        if self.instance_id.trim().is_empty() {
            return Err(ProjectionError::Validation(
                "instance id MUST be provided".to_string(),
            ));
        }

        if self.amount < 1 {
            return Err(ProjectionError::Validation(
                "amount MUST be >= 1".to_string(),
            ));
        }

        if self.reset_interval <= Duration::ZERO {
            return Err(ProjectionError::Validation(
                "reset interval MUST be positive".to_string(),
            ));
        }

        if self.from_anchor.offset() != UtcOffset::UTC {
            return Err(ProjectionError::Validation(
                "from anchor MUST be UTC (offset Z)".to_string(),
            ));
        }

        let mut seen_ids = BTreeSet::new();
        for notification in &self.notifications {
            if notification.id.trim().is_empty() {
                return Err(ProjectionError::Validation(
                    "notification id MUST be provided".to_string(),
                ));
            }

            if notification.call_url.trim().is_empty() {
                return Err(ProjectionError::Validation(
                    "notification call url MUST be provided".to_string(),
                ));
            }

            if notification.percent == 0 {
                return Err(ProjectionError::Validation(
                    "notification percent MUST be >= 1".to_string(),
                ));
            }

            if !seen_ids.insert(notification.id.as_str()) {
                return Err(ProjectionError::Validation(
                    "notification ids MUST be unique per quota".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QuotaRemovedEvent {
    pub instance_id: String,
    pub unit: QuotaUnit,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QuotaNotificationDueEvent {
    pub instance_id: String,
    pub unit: QuotaUnit,
    pub id: String,
    pub call_url: String,
    pub period_start: OffsetDateTime,
    pub threshold: u64,
    pub usage: u64,
}

impl QuotaNotificationDueEvent {
    /// # Errors
    /// Returns [`ProjectionError::Validation`] for malformed payloads.
    pub fn validate(&self) -> Result<(), ProjectionError> {
        if self.instance_id.trim().is_empty() {
            return Err(ProjectionError::Validation(
                "instance id MUST be provided".to_string(),
            ));
        }

        if self.id.trim().is_empty() {
            return Err(ProjectionError::Validation(
                "notification id MUST be provided".to_string(),
            ));
        }

        if self.period_start.offset() != UtcOffset::UTC {
            return Err(ProjectionError::Validation(
                "period start MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Audit record of a delivery attempt; carries no projection-state change.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QuotaNotifiedEvent {
    pub instance_id: String,
    pub unit: QuotaUnit,
    pub id: String,
    pub period_start: OffsetDateTime,
    pub threshold: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InstanceRemovedEvent {
    pub instance_id: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum QuotaEvent {
    Added(QuotaAddedEvent),
    Removed(QuotaRemovedEvent),
    NotificationDue(QuotaNotificationDueEvent),
    Notified(QuotaNotifiedEvent),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum InstanceEvent {
    Removed(InstanceRemovedEvent),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DomainEvent {
    Quota(QuotaEvent),
    Instance(InstanceEvent),
}

impl DomainEvent {
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Quota(QuotaEvent::Added(_)) => QUOTA_ADDED_EVENT_TYPE,
            Self::Quota(QuotaEvent::Removed(_)) => QUOTA_REMOVED_EVENT_TYPE,
            Self::Quota(QuotaEvent::NotificationDue(_)) => QUOTA_NOTIFICATION_DUE_EVENT_TYPE,
            Self::Quota(QuotaEvent::Notified(_)) => QUOTA_NOTIFIED_EVENT_TYPE,
            Self::Instance(InstanceEvent::Removed(_)) => INSTANCE_REMOVED_EVENT_TYPE,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        match self {
            Self::Quota(QuotaEvent::Added(event)) => &event.instance_id,
            Self::Quota(QuotaEvent::Removed(event)) => &event.instance_id,
            Self::Quota(QuotaEvent::NotificationDue(event)) => &event.instance_id,
            Self::Quota(QuotaEvent::Notified(event)) => &event.instance_id,
            Self::Instance(InstanceEvent::Removed(event)) => &event.instance_id,
        }
    }

    /// # Errors
    /// Returns [`ProjectionError::Validation`] when the payload fails its
    /// write-side checks. Only payloads that carry validated fields do any
    /// work here.
    pub fn validate(&self) -> Result<(), ProjectionError> {
        match self {
            Self::Quota(QuotaEvent::Added(event)) => event.validate(),
            Self::Quota(QuotaEvent::NotificationDue(event)) => event.validate(),
            Self::Quota(QuotaEvent::Removed(_) | QuotaEvent::Notified(_))
            | Self::Instance(InstanceEvent::Removed(_)) => Ok(()),
        }
    }
}

/// Synthetic event injected into the reduction pipeline by a scheduler.
///
/// Never appended to the event log and holds no checkpoint position. The
/// `triggering_event` reference exists for correlation only; reducers must
/// not assume it is present.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScheduledEvent {
    pub timestamp: OffsetDateTime,
    pub instance_ids: Vec<String>,
    pub triggering_event: Option<Box<DomainEvent>>,
}

impl ScheduledEvent {
    #[must_use]
    pub fn new(
        timestamp: OffsetDateTime,
        instance_ids: Vec<String>,
        triggering_event: Option<DomainEvent>,
    ) -> Self {
        Self {
            timestamp,
            instance_ids,
            triggering_event: triggering_event.map(Box::new),
        }
    }

    #[must_use]
    pub fn event_type() -> &'static str {
        SCHEDULED_EVENT_TYPE
    }
}

/// The one value shape the dispatch path accepts: a persisted domain event
/// or a synthetic scheduled event.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EventEnvelope {
    Domain(DomainEvent),
    Scheduled(ScheduledEvent),
}

impl EventEnvelope {
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Domain(event) => event.event_type(),
            Self::Scheduled(_) => SCHEDULED_EVENT_TYPE,
        }
    }

    /// Tenant scopes the event addresses: a single aggregate scope for
    /// domain events, the explicit tenant list for scheduled events.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<&str> {
        match self {
            Self::Domain(event) => vec![event.instance_id()],
            Self::Scheduled(event) => event
                .instance_ids
                .iter()
                .map(String::as_str)
                .collect(),
        }
    }

    /// Generation wall clock, carried only by scheduled events.
    #[must_use]
    pub fn wall_clock(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Domain(_) => None,
            Self::Scheduled(event) => Some(event.timestamp),
        }
    }

    /// # Errors
    /// Returns [`ProjectionError::Validation`] when a domain payload fails
    /// its write-side checks. Scheduled events have no persisted shape to
    /// validate.
    pub fn validate(&self) -> Result<(), ProjectionError> {
        match self {
            Self::Domain(event) => event.validate(),
            Self::Scheduled(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ColumnType {
    Text,
    Int64,
    Bool,
    Timestamp,
    Interval,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ColumnSchema {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnSchema {
    #[must_use]
    pub const fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
        }
    }

    #[must_use]
    pub const fn nullable(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [ColumnSchema],
    pub primary_key: &'static [&'static str],
}

const QUOTAS_SCHEMA: TableSchema = TableSchema {
    name: QUOTAS_TABLE,
    columns: &[
        ColumnSchema::new(QUOTA_COL_ID, ColumnType::Text),
        ColumnSchema::new(QUOTA_COL_INSTANCE_ID, ColumnType::Text),
        ColumnSchema::new(QUOTA_COL_UNIT, ColumnType::Text),
        ColumnSchema::new(QUOTA_COL_AMOUNT, ColumnType::Int64),
        ColumnSchema::new(QUOTA_COL_FROM, ColumnType::Timestamp),
        ColumnSchema::new(QUOTA_COL_INTERVAL, ColumnType::Interval),
        ColumnSchema::new(QUOTA_COL_LIMIT, ColumnType::Bool),
    ],
    primary_key: &[QUOTA_COL_INSTANCE_ID, QUOTA_COL_UNIT],
};

const QUOTA_PERIODS_SCHEMA: TableSchema = TableSchema {
    name: QUOTA_PERIODS_TABLE,
    columns: &[
        ColumnSchema::new(PERIOD_COL_INSTANCE_ID, ColumnType::Text),
        ColumnSchema::new(PERIOD_COL_UNIT, ColumnType::Text),
        ColumnSchema::new(PERIOD_COL_START, ColumnType::Timestamp),
        ColumnSchema::new(PERIOD_COL_USAGE, ColumnType::Int64),
    ],
    primary_key: &[PERIOD_COL_INSTANCE_ID, PERIOD_COL_UNIT, PERIOD_COL_START],
};

const QUOTA_NOTIFICATIONS_SCHEMA: TableSchema = TableSchema {
    name: QUOTA_NOTIFICATIONS_TABLE,
    columns: &[
        ColumnSchema::new(NOTIFICATION_COL_INSTANCE_ID, ColumnType::Text),
        ColumnSchema::new(NOTIFICATION_COL_UNIT, ColumnType::Text),
        ColumnSchema::new(NOTIFICATION_COL_ID, ColumnType::Text),
        ColumnSchema::new(NOTIFICATION_COL_CALL_URL, ColumnType::Text),
        ColumnSchema::new(NOTIFICATION_COL_PERCENT, ColumnType::Int64),
        ColumnSchema::new(NOTIFICATION_COL_REPEAT, ColumnType::Bool),
        ColumnSchema::nullable(NOTIFICATION_COL_LATEST_DUE_PERIOD_START, ColumnType::Timestamp),
        ColumnSchema::nullable(NOTIFICATION_COL_NEXT_DUE_THRESHOLD, ColumnType::Int64),
    ],
    primary_key: &[
        NOTIFICATION_COL_INSTANCE_ID,
        NOTIFICATION_COL_UNIT,
        NOTIFICATION_COL_ID,
    ],
};

/// The quota table-group projection: declares its tables and reduces events
/// to statements. Holds no state between reductions.
pub struct QuotaProjection;

impl QuotaProjection {
    /// Stable table-group identifier.
    #[must_use]
    pub fn name() -> &'static str {
        QUOTAS_TABLE
    }

    /// The owned tables with columns, types, nullability, and primary keys.
    #[must_use]
    pub fn tables() -> [TableSchema; 3] {
        [QUOTAS_SCHEMA, QUOTA_PERIODS_SCHEMA, QUOTA_NOTIFICATIONS_SCHEMA]
    }

    /// Event types a delivery loop must subscribe this projection to.
    #[must_use]
    pub fn handled_event_types() -> &'static [&'static str] {
        &[
            INSTANCE_REMOVED_EVENT_TYPE,
            QUOTA_ADDED_EVENT_TYPE,
            QUOTA_REMOVED_EVENT_TYPE,
            QUOTA_NOTIFICATION_DUE_EVENT_TYPE,
            QUOTA_NOTIFIED_EVENT_TYPE,
        ]
    }

    /// Maps one event to its storage mutations. Pure and total: every
    /// (aggregate, event) combination the envelope can express has a
    /// reduction, so there is no runtime dispatch failure mode.
    #[must_use]
    pub fn reduce(event: &EventEnvelope) -> Statement {
        match event {
            EventEnvelope::Domain(DomainEvent::Quota(quota_event)) => match quota_event {
                QuotaEvent::Added(event) => reduce_quota_added(event),
                QuotaEvent::Removed(event) => reduce_quota_removed(event),
                QuotaEvent::NotificationDue(event) => reduce_notification_due(event),
                QuotaEvent::Notified(_) => Statement::NoOp,
            },
            EventEnvelope::Domain(DomainEvent::Instance(InstanceEvent::Removed(event))) => {
                reduce_instance_removed(event)
            }
            EventEnvelope::Scheduled(_) => Statement::NoOp,
        }
    }
}

fn reduce_quota_added(event: &QuotaAddedEvent) -> Statement {
    let mut statements = Vec::with_capacity(event.notifications.len() + 1);

    statements.push(Statement::Create {
        table: QUOTAS_TABLE,
        columns: vec![
            ColumnValue::new(QUOTA_COL_ID, SqlValue::Text(event.aggregate_id.clone())),
            ColumnValue::new(
                QUOTA_COL_INSTANCE_ID,
                SqlValue::Text(event.instance_id.clone()),
            ),
            ColumnValue::new(
                QUOTA_COL_UNIT,
                SqlValue::Text(event.unit.as_str().to_string()),
            ),
            ColumnValue::new(QUOTA_COL_AMOUNT, SqlValue::Integer(event.amount)),
            ColumnValue::new(QUOTA_COL_FROM, SqlValue::Timestamp(event.from_anchor)),
            ColumnValue::new(QUOTA_COL_INTERVAL, SqlValue::Interval(event.reset_interval)),
            ColumnValue::new(QUOTA_COL_LIMIT, SqlValue::Bool(event.limit_usage)),
        ],
    });

    for notification in &event.notifications {
        statements.push(Statement::Create {
            table: QUOTA_NOTIFICATIONS_TABLE,
            columns: vec![
                ColumnValue::new(
                    NOTIFICATION_COL_INSTANCE_ID,
                    SqlValue::Text(event.instance_id.clone()),
                ),
                ColumnValue::new(
                    NOTIFICATION_COL_UNIT,
                    SqlValue::Text(event.unit.as_str().to_string()),
                ),
                ColumnValue::new(NOTIFICATION_COL_ID, SqlValue::Text(notification.id.clone())),
                ColumnValue::new(
                    NOTIFICATION_COL_CALL_URL,
                    SqlValue::Text(notification.call_url.clone()),
                ),
                ColumnValue::new(
                    NOTIFICATION_COL_PERCENT,
                    SqlValue::Integer(i64::from(notification.percent)),
                ),
                ColumnValue::new(NOTIFICATION_COL_REPEAT, SqlValue::Bool(notification.repeat)),
            ],
        });
    }

    Statement::Multi(statements)
}

fn reduce_quota_removed(event: &QuotaRemovedEvent) -> Statement {
    Statement::Multi(vec![
        Statement::Delete {
            table: QUOTA_PERIODS_TABLE,
            conditions: vec![
                Condition::new(
                    PERIOD_COL_INSTANCE_ID,
                    SqlValue::Text(event.instance_id.clone()),
                ),
                Condition::new(
                    PERIOD_COL_UNIT,
                    SqlValue::Text(event.unit.as_str().to_string()),
                ),
            ],
        },
        Statement::Delete {
            table: QUOTA_NOTIFICATIONS_TABLE,
            conditions: vec![
                Condition::new(
                    NOTIFICATION_COL_INSTANCE_ID,
                    SqlValue::Text(event.instance_id.clone()),
                ),
                Condition::new(
                    NOTIFICATION_COL_UNIT,
                    SqlValue::Text(event.unit.as_str().to_string()),
                ),
            ],
        },
        Statement::Delete {
            table: QUOTAS_TABLE,
            conditions: vec![
                Condition::new(
                    QUOTA_COL_INSTANCE_ID,
                    SqlValue::Text(event.instance_id.clone()),
                ),
                Condition::new(
                    QUOTA_COL_UNIT,
                    SqlValue::Text(event.unit.as_str().to_string()),
                ),
            ],
        },
    ])
}

fn reduce_notification_due(event: &QuotaNotificationDueEvent) -> Statement {
    Statement::Update {
        table: QUOTA_NOTIFICATIONS_TABLE,
        columns: vec![
            ColumnValue::new(
                NOTIFICATION_COL_LATEST_DUE_PERIOD_START,
                SqlValue::Timestamp(event.period_start),
            ),
            // the reached percent re-arms one full quota later (e.g. 90 -> 190)
            ColumnValue::new(
                NOTIFICATION_COL_NEXT_DUE_THRESHOLD,
                SqlValue::Integer(
                    i64::try_from(event.threshold.saturating_add(100)).unwrap_or(i64::MAX),
                ),
            ),
        ],
        conditions: vec![
            Condition::new(
                NOTIFICATION_COL_INSTANCE_ID,
                SqlValue::Text(event.instance_id.clone()),
            ),
            Condition::new(
                NOTIFICATION_COL_UNIT,
                SqlValue::Text(event.unit.as_str().to_string()),
            ),
            Condition::new(NOTIFICATION_COL_ID, SqlValue::Text(event.id.clone())),
        ],
    }
}

fn reduce_instance_removed(event: &InstanceRemovedEvent) -> Statement {
    Statement::Multi(vec![
        Statement::Delete {
            table: QUOTA_PERIODS_TABLE,
            conditions: vec![Condition::new(
                PERIOD_COL_INSTANCE_ID,
                SqlValue::Text(event.instance_id.clone()),
            )],
        },
        Statement::Delete {
            table: QUOTA_NOTIFICATIONS_TABLE,
            conditions: vec![Condition::new(
                NOTIFICATION_COL_INSTANCE_ID,
                SqlValue::Text(event.instance_id.clone()),
            )],
        },
        Statement::Delete {
            table: QUOTAS_TABLE,
            conditions: vec![Condition::new(
                QUOTA_COL_INSTANCE_ID,
                SqlValue::Text(event.instance_id.clone()),
            )],
        },
    ])
}

/// Materialized notification row state used for threshold-due evaluation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NotificationState {
    pub id: String,
    pub call_url: String,
    pub percent: u32,
    pub repeat: bool,
    pub latest_due_period_start: Option<OffsetDateTime>,
    pub next_due_threshold: Option<u64>,
}

/// The period bucket containing `at`: `from_anchor + k * reset_interval`
/// with `k` truncated toward zero, so a clock before the anchor still lands
/// on the anchor until a full interval has passed.
///
/// # Errors
/// Returns [`ProjectionError::Configuration`] for a non-positive interval.
pub fn current_period_start(
    from_anchor: OffsetDateTime,
    reset_interval: Duration,
    at: OffsetDateTime,
) -> Result<OffsetDateTime, ProjectionError> {
    let interval_seconds = reset_interval.whole_seconds();
    if interval_seconds <= 0 {
        return Err(ProjectionError::Configuration(
            "reset interval MUST be at least one second".to_string(),
        ));
    }

    let elapsed_seconds = (at - from_anchor).whole_seconds();
    let periods = elapsed_seconds / interval_seconds;
    Ok(from_anchor + Duration::seconds(periods.saturating_mul(interval_seconds)))
}

/// Cumulative percent-of-quota in integer arithmetic; 0 for quotas without
/// a positive amount.
#[must_use]
pub fn used_percent(usage: u64, amount: i64) -> u64 {
    match u64::try_from(amount) {
        Ok(amount) if amount > 0 => usage.saturating_mul(100) / amount,
        _ => 0,
    }
}

/// Highest fired threshold bucket for a configured percent: the largest
/// `percent + 100 * k` that `used_percent` has reached, `None` below the
/// configured percent.
#[must_use]
pub fn reached_threshold(percent: u32, used_percent: u64) -> Option<u64> {
    let percent = u64::from(percent);
    if used_percent < percent {
        return None;
    }
    Some(percent + (used_percent - percent) / 100 * 100)
}

/// Whether a notification threshold is due for the given period and usage.
///
/// Non-repeating notifications fire once ever: a recorded due period
/// suppresses them permanently. Repeating ones re-arm at the configured
/// percent when the period rolls over, and inside one period escalate along
/// `next_due_threshold`.
#[must_use]
pub fn notification_is_due(
    state: &NotificationState,
    period_start: OffsetDateTime,
    used_percent: u64,
) -> bool {
    if used_percent < u64::from(state.percent) {
        return false;
    }

    if !state.repeat {
        return state.latest_due_period_start.is_none();
    }

    match state.latest_due_period_start {
        None => true,
        Some(latest) if latest != period_start => true,
        Some(_) => state
            .next_due_threshold
            .is_some_and(|threshold| used_percent >= threshold),
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ProjectionError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ProjectionError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ProjectionError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ProjectionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ProjectionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ProjectionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ProjectionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
