//! Command surface for operating the quota projection from a terminal.
//!
//! The `qp` binary appends quota domain events into the materialized tables,
//! injects scheduled pseudo events through the same dispatch path, runs the
//! metering flow (atomic increment plus threshold evaluation), and inspects
//! the projected rows as JSON.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use quota_projection_core::{
    current_period_start, format_rfc3339, notification_is_due, now_utc, parse_rfc3339_utc,
    reached_threshold, used_percent, DomainEvent, EventEnvelope, InstanceEvent,
    InstanceRemovedEvent, NotificationConfig, QuotaAddedEvent, QuotaEvent,
    QuotaNotificationDueEvent, QuotaRemovedEvent, QuotaUnit, ScheduledEvent,
};
use quota_projection_store_sqlite::SqliteQuotaStore;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "qp")]
#[command(about = "Quota usage projection CLI")]
pub struct Cli {
    #[arg(long, default_value = "./quota_projection.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Quota {
        #[command(subcommand)]
        command: Box<QuotaCommand>,
    },
    Instance {
        #[command(subcommand)]
        command: Box<InstanceCommand>,
    },
    Usage {
        #[command(subcommand)]
        command: Box<UsageCommand>,
    },
    Schedule {
        #[command(subcommand)]
        command: Box<ScheduleCommand>,
    },
    Show {
        #[command(subcommand)]
        command: Box<ShowCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum QuotaCommand {
    Add(QuotaAddArgs),
    Remove(QuotaRemoveArgs),
}

#[derive(Debug, Args)]
pub struct QuotaAddArgs {
    #[arg(long)]
    instance_id: String,
    #[arg(long)]
    unit: UnitArg,
    #[arg(long)]
    amount: i64,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    reset_interval_secs: i64,
    #[arg(long)]
    limit_usage: bool,
    /// Threshold configuration as `<id>:<percent>:<repeat>:<call_url>`.
    #[arg(long = "notification")]
    notifications: Vec<String>,
    #[arg(long)]
    quota_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct QuotaRemoveArgs {
    #[arg(long)]
    instance_id: String,
    #[arg(long)]
    unit: UnitArg,
}

#[derive(Debug, Subcommand)]
pub enum InstanceCommand {
    Remove(InstanceRemoveArgs),
}

#[derive(Debug, Args)]
pub struct InstanceRemoveArgs {
    #[arg(long)]
    instance_id: String,
}

#[derive(Debug, Subcommand)]
pub enum UsageCommand {
    Report(UsageReportArgs),
    Increment(UsageIncrementArgs),
}

#[derive(Debug, Args)]
pub struct UsageReportArgs {
    #[arg(long)]
    instance_id: String,
    #[arg(long)]
    unit: UnitArg,
    #[arg(long)]
    count: u64,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct UsageIncrementArgs {
    #[arg(long)]
    instance_id: String,
    #[arg(long)]
    unit: UnitArg,
    #[arg(long)]
    period_start: String,
    #[arg(long)]
    count: u64,
}

#[derive(Debug, Subcommand)]
pub enum ScheduleCommand {
    Tick(ScheduleTickArgs),
}

#[derive(Debug, Args)]
pub struct ScheduleTickArgs {
    #[arg(long)]
    timestamp: Option<String>,
    #[arg(long = "instance-id")]
    instance_ids: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum ShowCommand {
    Quota(ShowQuotaArgs),
    Periods(ShowScopeArgs),
    Notifications(ShowScopeArgs),
}

#[derive(Debug, Args)]
pub struct ShowQuotaArgs {
    #[arg(long)]
    instance_id: String,
    #[arg(long)]
    unit: UnitArg,
}

#[derive(Debug, Args)]
pub struct ShowScopeArgs {
    #[arg(long)]
    instance_id: String,
    #[arg(long)]
    unit: Option<UnitArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UnitArg {
    AuthenticatedRequests,
    ActionRunSeconds,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DueNotification {
    pub id: String,
    pub call_url: String,
    pub threshold: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct UsageReport {
    pub instance_id: String,
    pub unit: QuotaUnit,
    pub period_start: String,
    pub usage: u64,
    pub used_percent: u64,
    pub amount: i64,
    pub limit_usage: bool,
    pub due_notifications: Vec<DueNotification>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteQuotaStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument parsing, event application, or row
/// retrieval fails.
pub fn run_command(command: Command, store: &mut SqliteQuotaStore) -> Result<()> {
    match command {
        Command::Quota { command } => run_quota(*command, store),
        Command::Instance { command } => run_instance(*command, store),
        Command::Usage { command } => run_usage(*command, store),
        Command::Schedule { command } => run_schedule(*command, store),
        Command::Show { command } => run_show(*command, store),
    }
}

fn run_quota(command: QuotaCommand, store: &mut SqliteQuotaStore) -> Result<()> {
    match command {
        QuotaCommand::Add(args) => {
            let unit = map_unit(args.unit);
            let notifications = args
                .notifications
                .iter()
                .map(|raw| parse_notification_arg(raw))
                .collect::<Result<Vec<_>>>()?;

            let event = QuotaAddedEvent {
                aggregate_id: args.quota_id.unwrap_or_else(|| Ulid::new().to_string()),
                instance_id: args.instance_id.clone(),
                unit,
                amount: args.amount,
                from_anchor: parse_optional_utc(args.from.as_deref())?,
                reset_interval: Duration::seconds(args.reset_interval_secs),
                limit_usage: args.limit_usage,
                notifications,
            };

            store.apply_event(&EventEnvelope::Domain(DomainEvent::Quota(QuotaEvent::Added(
                event,
            ))))?;

            let quota = store
                .get_quota(&args.instance_id, unit)?
                .ok_or_else(|| anyhow!("quota row missing after append"))?;
            let notifications = store.list_notifications(&args.instance_id, Some(unit))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "quota": quota,
                    "notifications": notifications,
                }))?
            );
            Ok(())
        }
        QuotaCommand::Remove(args) => {
            let unit = map_unit(args.unit);
            store.apply_event(&EventEnvelope::Domain(DomainEvent::Quota(
                QuotaEvent::Removed(QuotaRemovedEvent {
                    instance_id: args.instance_id.clone(),
                    unit,
                }),
            )))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "removed": { "instance_id": args.instance_id, "unit": unit },
                }))?
            );
            Ok(())
        }
    }
}

fn run_instance(command: InstanceCommand, store: &mut SqliteQuotaStore) -> Result<()> {
    match command {
        InstanceCommand::Remove(args) => {
            store.apply_event(&EventEnvelope::Domain(DomainEvent::Instance(
                InstanceEvent::Removed(InstanceRemovedEvent {
                    instance_id: args.instance_id.clone(),
                }),
            )))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "removed": { "instance_id": args.instance_id },
                }))?
            );
            Ok(())
        }
    }
}

fn run_usage(command: UsageCommand, store: &mut SqliteQuotaStore) -> Result<()> {
    match command {
        UsageCommand::Report(args) => {
            let unit = map_unit(args.unit);
            let at = parse_optional_utc(args.at.as_deref())?;

            let Some(quota) = store.get_quota(&args.instance_id, unit)? else {
                return Err(anyhow!(
                    "no quota configured for {}/{}",
                    args.instance_id,
                    unit
                ));
            };

            let from_anchor = parse_rfc3339_utc(&quota.from_anchor)
                .map_err(|err| anyhow!("invalid stored from anchor: {err}"))?;
            let period_start =
                current_period_start(from_anchor, Duration::seconds(quota.interval_secs), at)
                    .map_err(|err| anyhow!(err.to_string()))?;

            // a zero count degrades to a read-only threshold check
            let usage = if args.count == 0 {
                store
                    .get_period_usage(unit, &args.instance_id, period_start)?
                    .unwrap_or(0)
            } else {
                store.increment_usage(unit, &args.instance_id, period_start, args.count)?
            };
            let used = used_percent(usage, quota.amount);

            let mut due_notifications = Vec::new();
            for row in store.list_notifications(&args.instance_id, Some(unit))? {
                let state = row.state()?;
                if !notification_is_due(&state, period_start, used) {
                    continue;
                }
                let Some(threshold) = reached_threshold(state.percent, used) else {
                    continue;
                };

                store.apply_event(&EventEnvelope::Domain(DomainEvent::Quota(
                    QuotaEvent::NotificationDue(QuotaNotificationDueEvent {
                        instance_id: args.instance_id.clone(),
                        unit,
                        id: state.id.clone(),
                        call_url: state.call_url.clone(),
                        period_start,
                        threshold,
                        usage,
                    }),
                )))?;
                due_notifications.push(DueNotification {
                    id: state.id,
                    call_url: state.call_url,
                    threshold,
                });
            }

            let report = UsageReport {
                instance_id: args.instance_id,
                unit,
                period_start: format_rfc3339(period_start)
                    .map_err(|err| anyhow!(err.to_string()))?,
                usage,
                used_percent: used,
                amount: quota.amount,
                limit_usage: quota.limit_usage,
                due_notifications,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        UsageCommand::Increment(args) => {
            let unit = map_unit(args.unit);
            let period_start = parse_rfc3339_utc(&args.period_start)
                .map_err(|err| anyhow!("invalid --period-start value: {err}"))?;

            let usage = store.increment_usage(unit, &args.instance_id, period_start, args.count)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "usage": usage }))?
            );
            Ok(())
        }
    }
}

fn run_schedule(command: ScheduleCommand, store: &mut SqliteQuotaStore) -> Result<()> {
    match command {
        ScheduleCommand::Tick(args) => {
            if args.instance_ids.is_empty() {
                return Err(anyhow!("at least one --instance-id is required"));
            }

            let timestamp = parse_optional_utc(args.timestamp.as_deref())?;
            let event = ScheduledEvent::new(timestamp, args.instance_ids, None);
            let envelope = EventEnvelope::Scheduled(event);
            store.apply_event(&envelope)?;

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "event_type": envelope.event_type(),
                    "timestamp": format_rfc3339(timestamp)
                        .map_err(|err| anyhow!(err.to_string()))?,
                    "instance_ids": envelope.instance_ids(),
                }))?
            );
            Ok(())
        }
    }
}

fn run_show(command: ShowCommand, store: &SqliteQuotaStore) -> Result<()> {
    match command {
        ShowCommand::Quota(args) => {
            let unit = map_unit(args.unit);
            let Some(quota) = store.get_quota(&args.instance_id, unit)? else {
                return Err(anyhow!(
                    "no quota configured for {}/{}",
                    args.instance_id,
                    unit
                ));
            };
            println!("{}", serde_json::to_string_pretty(&quota)?);
            Ok(())
        }
        ShowCommand::Periods(args) => {
            let periods = store.list_periods(&args.instance_id, args.unit.map(map_unit))?;
            println!("{}", serde_json::to_string_pretty(&periods)?);
            Ok(())
        }
        ShowCommand::Notifications(args) => {
            let notifications =
                store.list_notifications(&args.instance_id, args.unit.map(map_unit))?;
            println!("{}", serde_json::to_string_pretty(&notifications)?);
            Ok(())
        }
    }
}

fn map_unit(arg: UnitArg) -> QuotaUnit {
    match arg {
        UnitArg::AuthenticatedRequests => QuotaUnit::AuthenticatedRequests,
        UnitArg::ActionRunSeconds => QuotaUnit::ActionRunSeconds,
    }
}

fn parse_optional_utc(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => {
            parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid timestamp value: {err}"))
        }
        None => Ok(now_utc()),
    }
}

fn parse_notification_arg(raw: &str) -> Result<NotificationConfig> {
    let mut parts = raw.splitn(4, ':');
    let id = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| notification_format_error(raw))?;
    let percent_raw = parts.next().ok_or_else(|| notification_format_error(raw))?;
    let repeat_raw = parts.next().ok_or_else(|| notification_format_error(raw))?;
    let call_url = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| notification_format_error(raw))?;

    let percent: u32 = percent_raw
        .parse()
        .with_context(|| format!("invalid notification percent: {percent_raw}"))?;
    let repeat: bool = repeat_raw
        .parse()
        .with_context(|| format!("invalid notification repeat flag: {repeat_raw}"))?;

    Ok(NotificationConfig {
        id: id.to_string(),
        call_url: call_url.to_string(),
        percent,
        repeat,
    })
}

fn notification_format_error(raw: &str) -> anyhow::Error {
    anyhow!("notification must be in <id>:<percent>:<repeat>:<call_url> format, got {raw}")
}
