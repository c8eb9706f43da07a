// crates/stepcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stepbridge::BridgeConfig;
use stepcore::{BusRecord, Event, HandlerRef, StepTrigger, TraceContext};
use stepruntime::{HandlerRegistry, LoadReport, RuntimeConfig, StepRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "step")]
#[command(about = "Event-driven step runtime CLI", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, env = "LOG_FORMAT", value_enum, ignore_case = true, default_value = "text")]
    log_format: LogFormat,

    /// Step roots to scan, `:`-separated
    #[arg(long, global = true, env = "STEPS_ROOTS", value_delimiter = ':')]
    roots: Vec<PathBuf>,

    /// Directory holding the language runner scripts
    #[arg(long, global = true, env = "RUNNERS_DIR")]
    runners_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every step and report the ones that would be skipped
    Validate,

    /// List registered steps and handler types
    Steps,

    /// Publish one event and print what each subscriber did
    Emit {
        /// Event type, e.g. `order.created`
        event_type: String,

        /// Event data as a JSON string
        #[arg(short, long, default_value = "null")]
        data: String,

        /// How long to let follow-up emissions run before shutting down
        #[arg(long, default_value_t = 500)]
        settle_ms: u64,
    },

    /// Load the steps, start the scheduler and run until Ctrl-C
    Run {
        /// Print every bus record as it happens
        #[arg(short, long)]
        watch: bool,
    },

    /// Create an example step tree
    Init {
        /// Directory to create the steps in
        #[arg(default_value = "steps")]
        dir: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = RuntimeConfig::from_env();
    if !cli.roots.is_empty() {
        config = config.with_roots(cli.roots.clone());
    }
    if let Some(dir) = &cli.runners_dir {
        config.runners_dir = dir.clone();
    }

    match cli.command {
        Commands::Validate => {
            let clean = validate(config).await?;
            if !clean {
                std::process::exit(1);
            }
        }

        Commands::Steps => {
            list_steps(config).await?;
        }

        Commands::Emit {
            event_type,
            data,
            settle_ms,
        } => {
            emit(config, event_type, &data, Duration::from_millis(settle_ms)).await?;
        }

        Commands::Run { watch } => {
            run(config, watch).await?;
        }

        Commands::Init { dir } => {
            create_example_steps(&dir)?;
        }
    }

    Ok(())
}

fn build_runtime(config: RuntimeConfig) -> StepRuntime {
    let mut handlers = HandlerRegistry::new();
    stepbridge::register_all(&mut handlers, BridgeConfig::from_runtime(&config));
    StepRuntime::new(config, handlers)
}

fn print_report(report: &LoadReport) {
    println!("📋 Loaded {} step(s)", report.loaded);
    for skipped in &report.skipped {
        println!("  ❌ {}: {}", skipped.unit(), skipped);
    }
    for cycle in &report.cycles {
        println!("  🔁 emission cycle: {}", cycle.join(" -> "));
    }
}

async fn validate(config: RuntimeConfig) -> Result<bool> {
    let roots: Vec<String> = config.roots.iter().map(|r| r.display().to_string()).collect();
    println!("🔍 Validating steps under: {}", roots.join(", "));

    let runtime = build_runtime(config);
    let report = runtime.load().await?;
    print_report(&report);
    runtime.shutdown().await;

    if report.is_clean() {
        println!("✅ All steps are valid");
    } else {
        println!("💥 {} unit(s) skipped", report.skipped.len());
    }
    Ok(report.is_clean())
}

async fn list_steps(config: RuntimeConfig) -> Result<()> {
    let runtime = build_runtime(config);
    runtime.load().await?;
    let snapshot = runtime.snapshot();

    println!("📦 Steps:");
    println!();
    for step in snapshot.registry().steps() {
        let trigger = match &step.trigger {
            StepTrigger::Event { subscribes } => format!("on {}", subscribes.join(", ")),
            StepTrigger::Api { method, path, .. } => format!("{} {}", method, path),
            StepTrigger::Schedule { interval, event_type } => format!("every {} -> {}", interval, event_type),
        };
        let handler = match &step.handler {
            Some(HandlerRef::Builtin(name)) => format!("builtin:{}", name),
            Some(HandlerRef::File(file)) => file.display().to_string(),
            None => "-".to_string(),
        };
        println!("  • {} [{}]", step.display_name(), trigger);
        println!("    handler: {}", handler);
        if !step.emits.is_empty() {
            let emits: Vec<&str> = step.emits.iter().map(String::as_str).collect();
            println!("    emits: {}", emits.join(", "));
        }
    }

    println!();
    println!("🧩 Handler types:");
    for name in runtime.handlers().list_handler_types() {
        match runtime.handlers().get_metadata(&name) {
            Some(metadata) => println!("  • {} ({}): {}", name, metadata.category, metadata.description),
            None => println!("  • {}", name),
        }
    }

    runtime.shutdown().await;
    Ok(())
}

async fn emit(config: RuntimeConfig, event_type: String, data: &str, settle: Duration) -> Result<()> {
    let data: serde_json::Value = serde_json::from_str(data).context("--data must be valid JSON")?;

    let runtime = build_runtime(config);
    runtime.load().await?;

    let event = Event::new(event_type, data).with_trace(TraceContext::new().trace_id);
    println!("🚀 Publishing {} (trace {})", event.event_type, event.trace_id);

    let outcomes = runtime.publish(event).await;
    if outcomes.is_empty() {
        println!("  no subscribers");
    }
    for outcome in &outcomes {
        match &outcome.result {
            Ok(()) => println!("  ✅ {}", outcome.step_id),
            Err(e) => println!("  ❌ {}: {}", outcome.step_id, e),
        }
    }

    // emits from the handlers above run detached
    tokio::time::sleep(settle).await;
    runtime.shutdown().await;
    Ok(())
}

async fn run(config: RuntimeConfig, watch: bool) -> Result<()> {
    let runtime = build_runtime(config);
    let report = runtime.load().await?;
    print_report(&report);

    let watcher = watch.then(|| {
        let mut records = runtime.bus().tap();
        tokio::spawn(async move {
            loop {
                match records.recv().await {
                    Ok(record) => print_record(&record),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        println!("  ⚠️  watcher lagged, {} record(s) missed", missed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    if let Err(e) = runtime.start_scheduler().await {
        tracing::warn!("Some schedules did not start: {}", e);
    }

    println!("▶️  Running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    println!();
    println!("⏹️  Shutting down");
    runtime.shutdown().await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    Ok(())
}

fn print_record(record: &BusRecord) {
    match record {
        BusRecord::Published { event, subscribers, .. } => {
            println!("  📣 {} -> {} subscriber(s) [{}]", event.event_type, subscribers, event.trace_id);
        }
        BusRecord::Delivered {
            step_id,
            event_type,
            duration_ms,
            ..
        } => {
            println!("  ✅ {} handled {} in {}ms", step_id, event_type, duration_ms);
        }
        BusRecord::Failed {
            step_id,
            event_type,
            error,
            ..
        } => {
            println!("  ❌ {} failed on {}: {}", step_id, event_type, error);
        }
        BusRecord::Dropped {
            event_type, reason, ..
        } => {
            println!("  🚫 dropped {}: {}", event_type, reason);
        }
    }
}

fn write_json(path: &Path, value: serde_json::Value) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(&value)?)
        .with_context(|| format!("writing {}", path.display()))
}

fn create_example_steps(dir: &Path) -> Result<()> {
    let orders = dir.join("orders");
    std::fs::create_dir_all(&orders).with_context(|| format!("creating {}", orders.display()))?;

    write_json(
        &orders.join("create.step.json"),
        serde_json::json!({
            "name": "Create order",
            "path": "/orders",
            "method": "POST",
            "handler": "builtin:relay",
            "config": { "to": "order.created" },
            "emits": ["order.created"],
            "flows": ["orders"],
        }),
    )?;

    write_json(
        &orders.join("notify.step.json"),
        serde_json::json!({
            "name": "Notify customer",
            "subscribes": ["order.*"],
            "handler": "notify.py",
            "emits": ["notification.sent"],
            "flows": ["orders"],
        }),
    )?;
    std::fs::write(
        orders.join("notify.py"),
        r#"def handler(input, emit, trace_id):
    print(f"notifying for trace {trace_id}")
    emit({"type": "notification.sent", "data": {"order": input}})
    return {"notified": True}
"#,
    )?;

    write_json(
        &dir.join("audit.step.json"),
        serde_json::json!({
            "name": "Audit log",
            "subscribes": ["notification.*", "cleanup.run"],
            "handler": "builtin:log",
        }),
    )?;

    write_json(
        &dir.join("cleanup.step.json"),
        serde_json::json!({
            "name": "Nightly cleanup",
            "interval": "1h",
            "eventType": "cleanup.run",
        }),
    )?;

    println!("✨ Created example steps in: {}", dir.display());
    println!();
    println!("Try it with:");
    println!("  step --roots {} validate", dir.display());
    println!(
        "  step --roots {} emit order.created --data '{{\"id\": 1}}'",
        dir.display()
    );
    println!("  step --roots {} run --watch", dir.display());

    Ok(())
}
