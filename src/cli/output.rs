// Output formatting and display for CLI

use crate::ipc::ResponseData;
use crate::process::{InstanceStatus, ProcessState};
use chrono::{DateTime, Local};
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a success response to stdout
///
/// `single` selects the detailed view when exactly one instance is shown.
pub fn print_success(data: &ResponseData, single: bool) {
    match data {
        ResponseData::Started { name, instances } => {
            print_done(&format!("Started {} ({} instance(s))", name.cyan(), instances));
        }

        ResponseData::Stopped { name, instances } => {
            if *instances == 0 {
                print_info(&format!("{} was already stopped", name.cyan()));
            } else {
                print_done(&format!("Stopped {} ({} instance(s))", name.cyan(), instances));
            }
        }

        ResponseData::Restarted { name, instances } => {
            print_done(&format!("Restarted {} ({} instance(s))", name.cyan(), instances));
        }

        ResponseData::Status(statuses) => match statuses.as_slice() {
            [] => println!("{}", "No apps are managed".yellow()),
            [status] if single => print_detailed_status(status),
            _ => print_status_table(statuses),
        },

        ResponseData::Reloaded { apps, rejected } => {
            print_done(&format!("Reloaded {} app(s)", apps.len()));
            for entry in rejected {
                eprintln!(
                    "  {} {}: {}",
                    "✗".red().bold(),
                    entry.name.cyan(),
                    entry.error
                );
            }
        }
    }
}

fn print_done(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

fn print_status_table(statuses: &[InstanceStatus]) {
    #[derive(Tabled)]
    struct InstanceRow {
        #[tabled(rename = "App")]
        name: String,
        #[tabled(rename = "#")]
        instance: usize,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "CPU")]
        cpu: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: u32,
    }

    let rows: Vec<InstanceRow> = statuses
        .iter()
        .map(|s| InstanceRow {
            name: truncate(&s.name, 20),
            instance: s.instance,
            state: format_state_colored(s),
            pid: s
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            cpu: s
                .cpu
                .map(|cpu| format!("{:.1}%", cpu))
                .unwrap_or_else(|| "-".to_string()),
            memory: s.memory.map(format_memory).unwrap_or_else(|| "-".to_string()),
            uptime: format_duration(&s.uptime()),
            restarts: s.restarts,
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} instance(s)", statuses.len())
            .dimmed()
            .italic()
    );
}

fn print_detailed_status(status: &InstanceStatus) {
    println!("\n{}", "Instance Details".bold().underline());
    println!();
    println!("  {:<15} {}", "App:".bold(), status.name.cyan());
    println!("  {:<15} {}", "Instance:".bold(), status.instance);
    println!("  {:<15} {}", "State:".bold(), format_state_colored(status));

    if let Some(pid) = status.pid {
        println!("  {:<15} {}", "PID:".bold(), pid);
    }
    if let Some(cpu) = status.cpu {
        println!("  {:<15} {:.1}%", "CPU Usage:".bold(), cpu);
    }
    if let Some(memory) = status.memory {
        println!("  {:<15} {}", "Memory:".bold(), format_memory(memory));
    }

    println!(
        "  {:<15} {}",
        "Uptime:".bold(),
        format_duration(&status.uptime())
    );
    println!("  {:<15} {}", "Restarts:".bold(), status.restarts);

    if let Some(started_at) = status.started_at {
        let datetime: DateTime<Local> = started_at.into();
        println!(
            "  {:<15} {}",
            "Started:".bold(),
            datetime.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if let Some(last_restart) = status.last_restart {
        let datetime: DateTime<Local> = last_restart.into();
        println!(
            "  {:<15} {}",
            "Last Restart:".bold(),
            datetime.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if let Some(exit) = status.last_exit {
        println!("  {:<15} {}", "Last Exit:".bold(), exit);
    }
    if let Some(ref reason) = status.stop_reason {
        println!("  {:<15} {}", "Reason:".bold(), reason);
    }

    println!();
}

/// State label with color coding; a given-up instance reads "failed permanently"
fn format_state_colored(status: &InstanceStatus) -> String {
    if status.failed_permanently() {
        return "failed permanently".red().bold().to_string();
    }

    let label = status.state.to_string();
    match status.state {
        ProcessState::Running => label.green().to_string(),
        ProcessState::Starting | ProcessState::Restarting | ProcessState::Stopping => {
            label.yellow().to_string()
        }
        ProcessState::Stopped => label.bright_black().to_string(),
    }
}

fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
