#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn qp_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_qp"));
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to execute qp command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output, label: &str) {
    assert!(
        output.status.success(),
        "{label} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn metering_flow_escalates_and_tears_down() {
    let db_path = std::env::temp_dir().join(format!("quota-usage-flow-{}.sqlite3", Ulid::new()));

    let add = qp_output(
        &db_path,
        &[
            "quota",
            "add",
            "--instance-id",
            "instance-1",
            "--unit",
            "authenticated-requests",
            "--amount",
            "1000",
            "--from",
            "2026-01-01T00:00:00Z",
            "--reset-interval-secs",
            "2592000",
            "--limit-usage",
            "--notification",
            "n1:80:true:https://tenant.example/hook",
        ],
    );
    assert_success(&add, "quota add");
    let add_json = stdout_json(&add);
    assert_eq!(add_json["quota"]["amount"], Value::from(1_000));
    assert_eq!(add_json["notifications"][0]["percent"], Value::from(80));
    assert_eq!(
        add_json["notifications"][0]["latest_due_period_start"],
        Value::Null
    );

    let report = qp_output(
        &db_path,
        &[
            "usage",
            "report",
            "--instance-id",
            "instance-1",
            "--unit",
            "authenticated-requests",
            "--count",
            "850",
            "--at",
            "2026-01-20T09:30:00Z",
        ],
    );
    assert_success(&report, "usage report");
    let report_json = stdout_json(&report);
    assert_eq!(report_json["usage"], Value::from(850));
    assert_eq!(report_json["used_percent"], Value::from(85));
    assert_eq!(report_json["period_start"], Value::from("2026-01-01T00:00:00Z"));
    assert_eq!(
        report_json["due_notifications"][0]["threshold"],
        Value::from(80)
    );

    let notifications = qp_output(
        &db_path,
        &["show", "notifications", "--instance-id", "instance-1"],
    );
    assert_success(&notifications, "show notifications");
    let notifications_json = stdout_json(&notifications);
    assert_eq!(
        notifications_json[0]["latest_due_period_start"],
        Value::from("2026-01-01T00:00:00Z")
    );
    assert_eq!(
        notifications_json[0]["next_due_threshold"],
        Value::from(180)
    );

    // below the escalated threshold nothing new becomes due
    let second_report = qp_output(
        &db_path,
        &[
            "usage",
            "report",
            "--instance-id",
            "instance-1",
            "--unit",
            "authenticated-requests",
            "--count",
            "100",
            "--at",
            "2026-01-21T09:30:00Z",
        ],
    );
    assert_success(&second_report, "second usage report");
    let second_json = stdout_json(&second_report);
    assert_eq!(second_json["usage"], Value::from(950));
    assert_eq!(second_json["used_percent"], Value::from(95));
    let due = match second_json["due_notifications"].as_array() {
        Some(value) => value,
        None => panic!("expected due_notifications to be an array"),
    };
    assert!(due.is_empty());

    let tick = qp_output(
        &db_path,
        &[
            "schedule",
            "tick",
            "--timestamp",
            "2026-02-01T00:00:00Z",
            "--instance-id",
            "instance-1",
            "--instance-id",
            "instance-2",
        ],
    );
    assert_success(&tick, "schedule tick");
    let tick_json = stdout_json(&tick);
    assert_eq!(tick_json["event_type"], Value::from("pseudo.timestamp"));
    assert_eq!(
        tick_json["instance_ids"],
        Value::from(vec!["instance-1", "instance-2"])
    );

    let remove = qp_output(&db_path, &["instance", "remove", "--instance-id", "instance-1"]);
    assert_success(&remove, "instance remove");

    let quota_after = qp_output(
        &db_path,
        &[
            "show",
            "quota",
            "--instance-id",
            "instance-1",
            "--unit",
            "authenticated-requests",
        ],
    );
    assert!(
        !quota_after.status.success(),
        "quota row should be gone after instance removal"
    );

    let periods_after = qp_output(&db_path, &["show", "periods", "--instance-id", "instance-1"]);
    assert_success(&periods_after, "show periods");
    let periods_json = stdout_json(&periods_after);
    let periods = match periods_json.as_array() {
        Some(value) => value,
        None => panic!("expected periods response to be an array"),
    };
    assert!(periods.is_empty());

    let _ = std::fs::remove_file(&db_path);
}
