use serde::Serialize;

use crate::commands::common::App;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct DoctorReport {
    issues: Vec<String>,
    consecutive_launches: u32,
    last_launch_at: Option<String>,
    last_stable_at: Option<String>,
}

pub async fn run_doctor(app: &App, as_json: bool) -> Result<(), CliError> {
    let issues = app.monitor.scan().await;
    let launch = app.monitor.launch_state();
    let report = DoctorReport {
        issues,
        consecutive_launches: launch.consecutive_launches,
        last_launch_at: launch.last_launch_at,
        last_stable_at: launch.last_stable_at,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Launches without a clean exit: {}",
            report.consecutive_launches
        );
        if report.issues.is_empty() {
            println!("No integrity problems found.");
        } else {
            println!("Integrity problems:");
            for issue in &report.issues {
                println!("  - {issue}");
            }
        }
    }

    if report.issues.is_empty() {
        Ok(())
    } else {
        Err(quoteflow_core::Error::Corruption(format!(
            "{} integrity problem(s) found",
            report.issues.len()
        ))
        .into())
    }
}
