use clap::Parser;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use treesync::{
    cli::{Cli, OutputFormat},
    Command, Event, EventKind, LocalEndpoint, Side, SyncTask, Target, TaskErrorNotice, TaskOutput,
    TaskStatus, TreesyncConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();

    let mut config = TreesyncConfig::load_or_default(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    if let Err(err) = config.validate() {
        eprintln!("Error: invalid configuration: {}", err);
        std::process::exit(1);
    }

    tracing::info!("Starting treesync on: {} <-> {}", cli.left.display(), cli.right.display());

    let left = LocalEndpoint::with_config(&cli.left, &config.watcher)
        .with_context(|| format!("Failed to open {}", cli.left.display()))?;
    let right = LocalEndpoint::with_config(&cli.right, &config.watcher)
        .with_context(|| format!("Failed to open {}", cli.right.display()))?;

    let task = SyncTask::new(
        "local",
        cli.task_label(),
        Target::new(Arc::new(left), "", &config),
        Target::new(Arc::new(right), "", &config),
    );
    let mut handle = task.spawn().context("Failed to start sync task")?;

    let commands = handle.commands();
    let interrupt = commands.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt.send(Command::Halt);
    })?;
    tokio::spawn(read_commands(commands));

    if cli.output == OutputFormat::Text {
        println!("Watching: {} <-> {}", cli.left.display(), cli.right.display());
        println!("Press Ctrl+C to quit");
        println!("---");
    }

    let mut outputs = handle.outputs().context("Task output already taken")?;
    let mut status = handle.subscribe_status();
    let mut errors = handle.subscribe_errors();

    loop {
        tokio::select! {
            output = outputs.recv() => match output {
                Some(output) => print_output(&output, &cli)?,
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                print_status(&snapshot, &cli)?;
            }
            Ok(notice) = errors.recv() => print_error(&notice, &cli)?,
        }
    }

    handle.wait().await;
    Ok(())
}

/// Read control commands from stdin, one per line.
async fn read_commands(commands: mpsc::UnboundedSender<Command>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(command) => {
                if commands.send(command).is_err() {
                    break;
                }
            }
            Err(err) => eprintln!("{} (expected pause, resume, resync or halt)", err),
        }
    }
}

fn print_output(output: &TaskOutput, cli: &Cli) -> Result<()> {
    match output {
        TaskOutput::Batch { side, batch } => match cli.output {
            OutputFormat::Json => {
                let line = serde_json::json!({ "type": "batch", "side": side, "events": batch });
                println!("{}", serde_json::to_string(&line)?);
            }
            OutputFormat::Text => {
                println!("Batch of {} events on {}", batch.len(), side);
                for event in batch {
                    print_text_event(event, *side, cli);
                }
                println!();
            }
            OutputFormat::Compact => {
                for event in batch {
                    print_compact_event(event, *side);
                }
            }
        },
        TaskOutput::Resync => match cli.output {
            OutputFormat::Json => println!("{}", serde_json::json!({ "type": "resync" })),
            _ => println!("RESYNC requested"),
        },
    }
    Ok(())
}

fn print_status(status: &TaskStatus, cli: &Cli) -> Result<()> {
    match cli.output {
        OutputFormat::Json => {
            let line = serde_json::json!({ "type": "status", "status": status });
            println!("{}", serde_json::to_string(&line)?);
        }
        OutputFormat::Text => println!(
            "[{}] {} is {} (left {}, right {})",
            status.updated_at.with_timezone(&chrono::Local).format("%H:%M:%S"),
            status.label,
            status.state,
            connection(status.left_connected),
            connection(status.right_connected)
        ),
        OutputFormat::Compact => println!("S {}", status.state),
    }
    Ok(())
}

fn print_error(notice: &TaskErrorNotice, cli: &Cli) -> Result<()> {
    match cli.output {
        OutputFormat::Json => {
            let line = serde_json::json!({ "type": "error", "error": notice });
            println!("{}", serde_json::to_string(&line)?);
        }
        _ => eprintln!("Error on {}: {}", notice.side, notice.message),
    }
    Ok(())
}

fn connection(connected: bool) -> &'static str {
    if connected {
        "connected"
    } else {
        "disconnected"
    }
}

fn print_text_event(event: &Event, side: Side, cli: &Cli) {
    let time_str = chrono::DateTime::<chrono::Local>::from(event.timestamp).format("%H:%M:%S");

    let event_type = event.label();

    let path = match event.source() {
        Some(from) => format!("{} -> {}", from, event.path),
        None => event.path.clone(),
    };

    if cli.no_color {
        println!("[{}] {} {}:{}", time_str, event_type, side, path);
    } else {
        let color = match &event.kind {
            EventKind::Created => "\x1b[32m",      // Green
            EventKind::Updated => "\x1b[33m",      // Yellow
            EventKind::Deleted => "\x1b[31m",      // Red
            EventKind::Moved { .. } => "\x1b[34m", // Blue
        };
        println!("[{}] {}{}\x1b[0m {}:{}", time_str, color, event_type, side, path);
    }
}

fn print_compact_event(event: &Event, side: Side) {
    let event_type = match &event.kind {
        EventKind::Created => "C",
        EventKind::Updated => "U",
        EventKind::Deleted => "D",
        EventKind::Moved { .. } => "V",
    };

    let side = match side {
        Side::Left => "L",
        Side::Right => "R",
    };

    println!("{} {} {}", side, event_type, event.path);
}
