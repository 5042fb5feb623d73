//! # Wablast, bulk WhatsApp campaign engine
//!
//! Runs the campaign engine against an Evolution-style WhatsApp API and
//! manages campaigns in the local SQLite store.
//!
//! Usage:
//!   wablast run                       # Poll and dispatch until Ctrl+C
//!   wablast add campaign.json         # Create a campaign from JSON
//!   wablast list                      # Show campaigns and progress
//!   wablast pause 3 / activate 3      # Operator controls
//!   wablast instances sales support   # Inspect connection instances

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;
use wablast_channels::EvolutionGateway;
use wablast_core::WablastConfig;
use wablast_core::traits::{CampaignStore, ConnectionDirectory};
use wablast_core::types::{CampaignId, CampaignStatus, NewCampaign};
use wablast_scheduler::engine::PAUSED_REASON;
use wablast_scheduler::{CampaignDb, CampaignEngine, ProgressEvent};

#[derive(Parser)]
#[command(name = "wablast", version, about = "📣 Wablast — bulk WhatsApp campaign engine")]
struct Cli {
    /// Config file (default: ~/.wablast/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until Ctrl+C
    Run,
    /// List campaigns
    List,
    /// Create a campaign from a JSON file
    Add { file: PathBuf },
    /// Mark a campaign active (picked up on the next poll)
    Activate { id: CampaignId },
    /// Pause a campaign
    Pause { id: CampaignId },
    /// Delete a campaign
    Delete { id: CampaignId },
    /// Show connection state of instances
    Instances {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let config_path = cli
        .config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
        .unwrap_or_else(WablastConfig::default_path);

    if let Command::InitConfig { force } = cli.command {
        return init_config(&config_path, force);
    }

    let config = if config_path.exists() {
        WablastConfig::load_from(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        WablastConfig::load()?
    };

    match cli.command {
        Command::Run => run(config).await,
        Command::List => list(&open_store(&config)?),
        Command::Add { file } => add(&open_store(&config)?, &file),
        Command::Activate { id } => {
            let db = open_store(&config)?;
            db.set_status(id, CampaignStatus::Active, None).await?;
            println!("▶️  Campaign {id} activated");
            Ok(())
        }
        Command::Pause { id } => {
            let db = open_store(&config)?;
            db.set_status(id, CampaignStatus::Paused, Some(PAUSED_REASON)).await?;
            println!("⏸️  Campaign {id} paused");
            Ok(())
        }
        Command::Delete { id } => {
            let db = open_store(&config)?;
            if db.delete_campaign(id)? {
                println!("🗑️  Campaign {id} deleted");
            } else {
                println!("⚠️  Campaign {id} not found");
            }
            Ok(())
        }
        Command::Instances { names } => instances(&config, &names).await,
        Command::InitConfig { .. } => Ok(()),
    }
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "wablast=debug,wablast_scheduler=debug,wablast_channels=debug"
    } else {
        "wablast=info,wablast_scheduler=info,wablast_channels=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn open_store(config: &WablastConfig) -> Result<CampaignDb> {
    let path = config.store.resolved_path();
    CampaignDb::open(&path).with_context(|| format!("opening store {}", path.display()))
}

async fn run(config: WablastConfig) -> Result<()> {
    let store = Arc::new(open_store(&config)?);
    let gateway = Arc::new(EvolutionGateway::new(&config.gateway));
    tracing::info!("📡 Gateway: {}", config.gateway.base_url);
    tracing::info!("💾 Store: {}", config.store.resolved_path().display());

    let engine = CampaignEngine::new(config, store, gateway.clone(), gateway);

    let mut events = Box::pin(engine.progress_stream());
    let reporter = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                ProgressEvent::Sent { campaign_id, sent_messages, total_contacts } => {
                    tracing::info!("📤 Campaign {campaign_id}: {sent_messages}/{total_contacts} sent");
                }
                ProgressEvent::Skipped { campaign_id, destination, reason, .. } => {
                    tracing::warn!("⏭️ Campaign {campaign_id}: skipped {destination}: {reason}");
                }
                ProgressEvent::StatusChanged { campaign_id, status, reason } => match reason {
                    Some(reason) => tracing::info!("📋 Campaign {campaign_id} → {status} ({reason})"),
                    None => tracing::info!("📋 Campaign {campaign_id} → {status}"),
                },
            }
        }
    });

    engine.start().await;
    println!("📣 Wablast running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down...");
    engine.stop().await;
    reporter.abort();
    Ok(())
}

fn list(db: &CampaignDb) -> Result<()> {
    let campaigns = db.list_campaigns()?;
    if campaigns.is_empty() {
        println!("No campaigns.");
        return Ok(());
    }
    println!(
        "{:<5} {:<24} {:<12} {:<10} {:>13} {:>7}  START",
        "ID", "NAME", "INSTANCE", "STATUS", "SENT/TOTAL", "FAILED"
    );
    for c in campaigns {
        println!(
            "{:<5} {:<24} {:<12} {:<10} {:>13} {:>7}  {}",
            c.id,
            truncate(&c.name, 24),
            truncate(&c.instance, 12),
            c.status,
            format!("{}/{}", c.sent_messages, c.total_contacts),
            c.failed_messages,
            c.start_time.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn add(db: &CampaignDb, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let campaign: NewCampaign =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    if campaign.contacts.is_empty() {
        anyhow::bail!("campaign '{}' has no contacts", campaign.name);
    }
    let id = db.insert_campaign(&campaign)?;
    println!(
        "✅ Campaign {id} '{}' created ({} contacts, {})",
        campaign.name,
        campaign.contacts.len(),
        campaign.status
    );
    Ok(())
}

async fn instances(config: &WablastConfig, names: &[String]) -> Result<()> {
    let gateway = EvolutionGateway::new(&config.gateway);
    for name in names {
        match gateway.fetch_instance(name).await {
            Ok(inst) => {
                let icon = if inst.connection_status.is_open() { "🟢" } else { "🔴" };
                println!(
                    "{icon} {}: {} (messages: {}, contacts: {}, chats: {})",
                    inst.name, inst.connection_status, inst.messages, inst.contacts, inst.chats
                );
                if let Some(at) = inst.last_activity {
                    println!("   last activity: {}", at.to_rfc3339());
                }
            }
            Err(e) => println!("⚠️  {name}: {e}"),
        }
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("⚠️  {} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }
    WablastConfig::default().save_to(path)?;
    println!("✅ Config written to {}", path.display());
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
