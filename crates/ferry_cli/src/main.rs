//! FERRY CLI
//!
//! Inspect wasm guests against the bridge ABI and run the concurrent
//! account scenario against the reference guest.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use ferry_bridge::abi::IMPORT_MODULE;
use ferry_core::BridgeConfig;
use ferry_sim::{sim_cell, AccountCore, AllowAll, Delayed, Denylist};
use ferry_wasm::Sandbox;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "FERRY - host/guest bridge tooling", long_about = None)]
struct Cli {
    /// Bridge configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a wasm module against the guest ABI
    Inspect {
        /// Path to the .wasm file
        #[arg(short, long)]
        module: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run concurrent exclusive operations against the reference guest
    Demo {
        /// Seed for the demo account
        #[arg(short, long, default_value = "ferry demo")]
        seed: String,
        /// Simulated policy latency in milliseconds
        #[arg(long, default_value_t = 50)]
        policy_delay_ms: u64,
        /// Session key the policy rejects
        #[arg(long, default_value = "blocked")]
        deny: String,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    path: String,
    hash: String,
    size: usize,
    exports: Vec<String>,
    imports: Vec<ImportStatus>,
}

#[derive(Debug, Serialize)]
struct ImportStatus {
    module: String,
    name: String,
    known: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ferry=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    let Some(path) = path else {
        return Ok(BridgeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading config {}", path.display()))?;
    let config = BridgeConfig::from_json_str(&text)?;
    config.validate()?;
    Ok(config)
}

fn inspect(config: BridgeConfig, module: &Path) -> Result<InspectReport> {
    let bytes = std::fs::read(module).wrap_err_with(|| format!("reading {}", module.display()))?;
    let sandbox = Sandbox::new(config)?;
    let compiled = sandbox.compile(&bytes)?;
    let abi = sandbox.compiler().abi();

    let exports = compiled.module.exports().map(|e| e.name().to_string()).collect();
    let imports = compiled
        .module
        .imports()
        .map(|i| ImportStatus {
            module: i.module().to_string(),
            name: i.name().to_string(),
            known: i.module() == IMPORT_MODULE && abi.import(i.name()).is_some(),
        })
        .collect();

    Ok(InspectReport {
        path: module.display().to_string(),
        hash: compiled.hash.clone(),
        size: compiled.size,
        exports,
        imports,
    })
}

async fn demo(config: BridgeConfig, seed: &str, delay: Duration, deny: &str) -> Result<()> {
    let cell = sim_cell(&config);
    let account = AccountCore::create(&cell, seed.as_bytes())?;
    println!("account {} (public key {})", account.address(), account.public_key());

    let journal = cell.with(|bridge| bridge.guest().journal());
    journal.clear();

    let slow = Delayed::new(AllowAll, delay);
    let denying = Delayed::new(Denylist::new([deny.to_string()]), delay);
    let (registered, signed, rejected, address) = tokio::join!(
        account.register_session("demo-session", &slow),
        account.sign(b"demo payload"),
        account.register_session(deny, &denying),
        async { account.address().to_string() },
    );

    registered?;
    println!("session registered");
    println!("signature {}", signed?);
    match rejected {
        Ok(()) => return Err(eyre!("policy accepted denied key {deny}")),
        Err(err) => println!("rejected {deny}: {err}"),
    }
    println!("companion read while busy: {address}");

    println!("guest call order:");
    for (i, entry) in journal.entries().iter().enumerate() {
        println!("  {i:>2} {entry}");
    }

    account.release().await?;
    let leaked = cell.with(|bridge| bridge.guest().live_accounts());
    tracing::info!(leaked, "demo finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Inspect { module, json } => {
            let report = inspect(config, &module)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{} ({} bytes, blake3 {})", report.path, report.size, report.hash);
                println!("exports: {}", report.exports.join(", "));
                for import in &report.imports {
                    let mark = if import.known { "ok" } else { "unknown" };
                    println!("import {}.{}: {mark}", import.module, import.name);
                }
            }
            Ok(())
        }
        Commands::Demo {
            seed,
            policy_delay_ms,
            deny,
        } => demo(config, &seed, Duration::from_millis(policy_delay_ms), &deny).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
