//! `corelink-cli` – CoreLink Command Line Interface
//!
//! This binary hosts a CoreLink kernel in the foreground. It:
//!
//! 1. Loads `~/.corelink/config.toml`, writing the defaults on first run.
//! 2. Starts the kernel on a multi-threaded Tokio runtime.
//! 3. Drops the operator into an **interactive REPL** with slash-commands
//!    (`/status`, `/apps`, `/health`, `/heal`, `/emit`, `/help`).
//! 4. Intercepts **Ctrl-C** and stops the kernel gracefully before exiting.

mod config;
mod repl;

use colored::Colorize;
use corelink_kernel::Kernel;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

fn main() {
    let cfg = load_or_init_config();

    // Stays alive until the end of `main` so pending spans are flushed.
    let _telemetry = corelink_runtime::init_tracing(&cfg.service_name);

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build the Tokio runtime");
            println!("{}: {}", "Fatal".red().bold(), e);
            std::process::exit(1);
        }
    };

    // ── Kernel ────────────────────────────────────────────────────────────
    let kernel = Arc::new(Kernel::new(cfg.kernel.clone()));
    if corelink_kernel::set_default_kernel(Arc::clone(&kernel)).is_err() {
        warn!("a default kernel was already installed");
    }

    print!("  Starting kernel … ");
    match rt.block_on(kernel.start()) {
        Ok(()) => {
            let state = kernel.runtime_state();
            println!("{} (daemon {})", "RUNNING".green().bold(), state.daemon_id.to_string().dimmed());
        }
        Err(e) => {
            println!("{}: {}", "FAILED".red().bold(), e);
            std::process::exit(1);
        }
    }
    print_config_summary(&cfg);

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&kernel, &rt, shutdown);

    print!("  Stopping kernel … ");
    match rt.block_on(kernel.stop()) {
        Ok(()) => println!("{}", "OK".green()),
        Err(e) => println!("{}: {}", "FAILED".red(), e),
    }
    println!("{}", "  ✓ Exiting CoreLink.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

fn load_or_init_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            cfg.kernel.state_dir = Some(config::default_state_dir());
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

fn print_config_summary(cfg: &config::Config) {
    let k = &cfg.kernel;
    println!("  max apps        : {}", k.max_apps.to_string().yellow());
    println!(
        "  delivery        : {:?} (queue {})",
        k.delivery_mode,
        k.event_queue_capacity.to_string().yellow()
    );
    println!(
        "  health loop     : {}",
        if k.auto_heal {
            format!("every {} ms, auto-heal on", k.health_check_interval_ms).green()
        } else {
            "disabled".to_string().dimmed()
        }
    );
    match &k.state_dir {
        Some(dir) => println!("  snapshot dir    : {}", dir.display().to_string().dimmed()),
        None => println!("  snapshot dir    : {}", "disabled".dimmed()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ______               __    _       __  "#.bold().cyan());
    println!("{}", r#"  / ____/___  ________  / /   (_)___  / /__"#.bold().cyan());
    println!("{}", r#" / /   / __ \/ ___/ _ \/ /   / / __ \/ //_/"#.bold().cyan());
    println!("{}", r#"/ /___/ /_/ / /  /  __/ /___/ / / / / ,<   "#.bold().cyan());
    println!("{}", r#"\____/\____/_/   \___/_____/_/_/ /_/_/|_|  "#.bold().cyan());
    println!();
    println!("  {} {}", "CoreLink".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Runtime Coordination Kernel");
    println!();
}
