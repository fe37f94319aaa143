//! REPL – Read-Eval-Print Loop for the CoreLink operator shell.
//!
//! Supported slash-commands:
//!   /help                 – show this list
//!   /status               – lifecycle state, counters and router stats
//!   /apps                 – registered applications
//!   /health               – run a health check now
//!   /heal                 – apply remediations for the latest check
//!   /emit <topic> <json>  – publish an event as the system
//!   /quit | /exit         – stop the kernel and exit

use colored::Colorize;
use corelink_kernel::Kernel;
use corelink_types::{AppId, HealthStatus, Severity};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Runtime;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Apps,
    Health,
    Heal,
    Emit { topic: String, payload: Value },
    Quit,
}

/// Parse one input line. `Err` carries the message shown to the operator.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        "/help" => Ok(Command::Help),
        "/status" => Ok(Command::Status),
        "/apps" => Ok(Command::Apps),
        "/health" => Ok(Command::Health),
        "/heal" => Ok(Command::Heal),
        "/quit" | "/exit" => Ok(Command::Quit),
        "/emit" => {
            let (topic, raw) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if topic.is_empty() {
                return Err("usage: /emit <topic> <json>".to_string());
            }
            let raw = raw.trim();
            let payload = if raw.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(raw).map_err(|e| format!("invalid JSON payload: {e}"))?
            };
            Ok(Command::Emit {
                topic: topic.to_string(),
                payload,
            })
        }
        other => Err(format!("Unknown command: '{other}'")),
    }
}

/// Entry point for the interactive shell.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(kernel: &Kernel, rt: &Runtime, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "corelink>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        match parse(&line) {
            Ok(Command::Help) => cmd_help(),
            Ok(Command::Status) => cmd_status(kernel),
            Ok(Command::Apps) => cmd_apps(kernel),
            Ok(Command::Health) => cmd_health(kernel),
            Ok(Command::Heal) => cmd_heal(kernel),
            Ok(Command::Emit { topic, payload }) => cmd_emit(kernel, rt, &topic, payload),
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(msg) => {
                println!("{} Type {} for available commands.", msg.red(), "/help".bold());
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "CoreLink Commands".bold().underline());
    println!("  {}               – lifecycle state and counters", "/status".bold().cyan());
    println!("  {}                 – registered applications", "/apps".bold().cyan());
    println!("  {}               – run a health check now", "/health".bold().cyan());
    println!("  {}                 – remediate the latest check", "/heal".bold().cyan());
    println!("  {}  – publish an event as the system", "/emit <topic> <json>".bold().cyan());
    println!("  {}          – stop the kernel and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(kernel: &Kernel) {
    let status = kernel.status();
    let runtime = &status.runtime;
    println!("{}", "Kernel Status".bold().underline());
    println!("  Daemon id      : {}", runtime.daemon_id.to_string().dimmed());
    println!("  State          : {}", runtime.state.to_string().yellow());
    println!("  Started at     : {}", runtime.started_at.to_rfc3339());
    println!("  Apps           : {} live, {} registered in total", status.apps_total, runtime.apps_registered);
    for (state, count) in &status.apps_by_state {
        println!("    {:<13}: {}", state.to_string(), count);
    }
    println!(
        "  Events         : {} published, {} delivered, {} handler errors",
        status.router.published, status.router.delivered, status.router.handler_errors
    );
    println!("  Subscriptions  : {}", status.router.subscriptions);
    println!("  Pending        : {} / {}", status.router.pending, status.queue_capacity);
    println!("  Errors         : {}", runtime.errors);
    match status.health {
        Some(health) => println!(
            "  Health         : {} ({} unresolved)",
            colour_status(health),
            status.unresolved_issues
        ),
        None => println!("  Health         : {}", "not checked yet".dimmed()),
    }
}

fn cmd_apps(kernel: &Kernel) {
    let registry = match kernel.registry() {
        Ok(r) => r,
        Err(e) => {
            println!("{}: {}", "Error".red(), e);
            return;
        }
    };
    let apps = registry.list();
    println!("{} ({})", "Applications".bold().underline(), apps.len());
    if apps.is_empty() {
        println!("  {}", "none registered".dimmed());
    }
    for app in apps {
        let caps: Vec<&str> = app.capabilities.iter().map(String::as_str).collect();
        println!(
            "  {} {} v{} [{}] topics={:?} caps={:?}",
            app.id.to_string().dimmed(),
            app.name.bold(),
            app.version,
            app.state.to_string().yellow(),
            app.topics,
            caps
        );
    }
}

fn cmd_health(kernel: &Kernel) {
    match kernel.check_now() {
        Ok(report) => {
            println!("{} {}", "Health:".bold(), colour_status(report.status));
            for issue in &report.issues {
                let severity = match issue.severity {
                    Severity::Critical | Severity::Error => issue.severity.to_string().red(),
                    Severity::Warning => issue.severity.to_string().yellow(),
                };
                println!("  [{}] {}: {} (action: {})", severity, issue.component, issue.message, issue.action);
            }
        }
        Err(e) => println!("{}: {}", "Error".red(), e),
    }
}

fn cmd_heal(kernel: &Kernel) {
    match kernel.heal_now() {
        Ok(outcome) => {
            println!(
                "{} {} fixed, {} failed, {} remaining",
                "Heal:".bold(),
                outcome.fixed.len().to_string().green(),
                outcome.failed.len().to_string().red(),
                outcome.remaining
            );
            for issue in &outcome.failed {
                println!("  {} {}: {}", "✗".red(), issue.component, issue.message);
            }
        }
        Err(e) => println!("{}: {}", "Error".red(), e),
    }
}

fn cmd_emit(kernel: &Kernel, rt: &Runtime, topic: &str, payload: Value) {
    let router = match kernel.router() {
        Ok(r) => r,
        Err(e) => {
            println!("{}: {}", "Error".red(), e);
            return;
        }
    };
    match rt.block_on(router.publish(topic, payload, AppId::SYSTEM)) {
        Ok(id) => println!("{} {} ({})", "✓ Published".green(), topic.bold(), id.to_string().dimmed()),
        Err(e) => println!("{}: {}", "Publish failed".red(), e),
    }
}

fn colour_status(status: HealthStatus) -> colored::ColoredString {
    match status {
        HealthStatus::Healthy => status.to_string().green(),
        HealthStatus::Degraded => status.to_string().yellow(),
        HealthStatus::Unhealthy | HealthStatus::Critical => status.to_string().red(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_commands() {
        assert_eq!(parse("/status"), Ok(Command::Status));
        assert_eq!(parse("  /apps  "), Ok(Command::Apps));
        assert_eq!(parse("/exit"), Ok(Command::Quit));
        assert_eq!(parse("/heal\n"), Ok(Command::Heal));
    }

    #[test]
    fn parses_emit_with_json_payload() {
        assert_eq!(
            parse(r#"/emit scene.ready {"frame": 7}"#),
            Ok(Command::Emit {
                topic: "scene.ready".into(),
                payload: json!({"frame": 7}),
            })
        );
    }

    #[test]
    fn emit_without_payload_sends_null() {
        assert_eq!(
            parse("/emit tick"),
            Ok(Command::Emit {
                topic: "tick".into(),
                payload: Value::Null,
            })
        );
    }

    #[test]
    fn emit_rejects_missing_topic_and_bad_json() {
        assert!(parse("/emit").is_err());
        assert!(parse("/emit tick {not json").is_err());
    }

    #[test]
    fn unknown_command_is_reported() {
        let err = parse("/launch").unwrap_err();
        assert!(err.contains("/launch"));
    }
}
