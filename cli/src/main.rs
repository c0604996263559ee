//! chainwatch CLI — watch chain accounts from the terminal.
//!
//! Usage:
//! ```bash
//! # Watch the accounts and tasks of a config file, printing events as JSON
//! chainwatch watch --config chainwatch.json
//!
//! # Persist tasks and events to SQLite (build with `--features sqlite`)
//! chainwatch watch --config chainwatch.json --store ./chainwatch.db
//!
//! # List built-in subscription actions
//! chainwatch catalog
//! ```

use std::env;
use std::process;
use std::sync::Arc;

use chainwatch_core::catalog::{StaticCatalog, DEFAULT_TIMESTAMP_TOLERANCE_MS};
use chainwatch_core::{init_tracing, Engine, WatchConfig};
use chainwatch_ws::WsClientFactory;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "watch" => cmd_watch(&args[2..]).await,
        "catalog" => {
            cmd_catalog();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainwatch {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainwatch {}", env!("CARGO_PKG_VERSION"));
    println!("Watch account and chain state over multiplexed subscriptions\n");
    println!("USAGE:");
    println!("    chainwatch <COMMAND>\n");
    println!("COMMANDS:");
    println!("    watch    Connect, apply tasks and print events until Ctrl-C");
    println!("    catalog  List built-in subscription actions");
    println!("    version  Print version");
    println!("    help     Print this help\n");
    println!("WATCH FLAGS:");
    println!("    --config <FILE>  JSON config file  [required]");
    println!("    --store <PATH>   SQLite database (overrides storePath)");
}

async fn cmd_watch(args: &[String]) -> Result<(), String> {
    let path = parse_flag(args, "--config").ok_or("--config is required")?;
    let mut config = WatchConfig::from_file(&path).map_err(|e| e.to_string())?;
    if let Some(store_path) = parse_flag(args, "--store") {
        config.store_path = Some(store_path);
    }
    init_tracing(&config.log);

    let store = chainwatch_storage::open_store(config.store_path.as_deref())
        .await
        .map_err(|e| e.to_string())?;
    let engine = Engine::builder(config)
        .client_factory(Arc::new(WsClientFactory::default()))
        .store(store)
        .build()
        .map_err(|e| e.to_string())?;

    let mut events = engine.events();
    engine.start().await.map_err(|e| e.to_string())?;
    let (intake, intake_loop) = engine.intake();
    let closed = intake.disconnect_if_unused().await.map_err(|e| e.to_string())?;
    let accounts = intake
        .get_all_account_subscriptions()
        .await
        .map_err(|e| e.to_string())?;
    tracing::info!(accounts = accounts.len(), closed = closed.len(), "watching");

    let mut maintenance = tokio::time::interval(std::time::Duration::from_secs(
        engine.config().maintenance_interval_secs.max(1),
    ));
    maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = maintenance.tick() => {
                let recovered = engine.maintain().await;
                if !recovered.is_empty() {
                    tracing::info!(chains = ?recovered, "subscriptions restored");
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event).unwrap_or_default());
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    intake.close();
    let _ = intake_loop.await;
    engine.shutdown().await;
    Ok(())
}

fn cmd_catalog() {
    let catalog = StaticCatalog::builtin(DEFAULT_TIMESTAMP_TOLERANCE_MS);
    println!("Built-in subscription actions:\n");
    for action in catalog.actions() {
        println!("  {action}");
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
