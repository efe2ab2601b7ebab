mod logging;

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    tracing::{info, warn},
};

use {
    wazper_common::AccountId,
    wazper_config::{WazperConfig, apply_env_overrides, discover_and_load},
    wazper_whatsapp::{SqliteAccountStore, WhatsAppService},
};

#[derive(Parser)]
#[command(name = "wazper", version, about = "Multi-account WhatsApp session supervisor")]
struct Cli {
    /// Path to wazper.toml. Defaults to the per-user config directory.
    #[arg(long, global = true, env = "WAZPER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resume accounts and supervise their sessions until interrupted.
    Run {
        /// Also connect these accounts after resuming.
        #[arg(long = "connect", value_name = "ACCOUNT_ID")]
        connect: Vec<AccountId>,
    },
    /// List registered accounts.
    Accounts,
    /// Register a new account.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Log out, wipe credentials and delete an account.
    Remove { account_id: AccountId },
    /// Show the newest activity log entries of an account.
    Logs {
        account_id: AccountId,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = discover_and_load(cli.config.as_deref())?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate().context("invalid configuration")?;
    logging::init(&config.logging)?;

    let store = SqliteAccountStore::connect(&config.storage.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.storage.database_url))?;

    match cli.command {
        Command::Run { connect } => run(config, store, connect).await,
        Command::Accounts => {
            for account in store.list_accounts().await? {
                println!(
                    "{:>4}  {:<20} {:<16} {}",
                    account.id,
                    account.name,
                    account.phone.as_deref().unwrap_or("-"),
                    account.status
                );
            }
            Ok(())
        },
        Command::Add { name, phone } => {
            let account = store.create_account(&name, phone.as_deref()).await?;
            println!("created account {} ({})", account.id, account.name);
            Ok(())
        },
        Command::Remove { account_id } => {
            let store = Arc::new(store);
            let service = WhatsAppService::from_config(&config, Arc::clone(&store) as _)?;
            service.remove_account(account_id).await?;
            store.delete_account(account_id).await?;
            println!("removed account {account_id}");
            Ok(())
        },
        Command::Logs { account_id, limit } => {
            for entry in store.activity_logs(account_id, limit, 0).await? {
                println!(
                    "{}  {:<20} {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.action,
                    entry.details.as_deref().unwrap_or("")
                );
            }
            Ok(())
        },
    }
}

async fn run(
    config: WazperConfig,
    store: SqliteAccountStore,
    connect: Vec<AccountId>,
) -> Result<()> {
    let service = WhatsAppService::from_config(&config, Arc::new(store))?;

    let resumed = service.initialize().await?;
    for account_id in connect {
        if let Err(e) = service.connect(account_id).await {
            warn!(account_id = %account_id, error = %e, "connect failed");
        }
    }
    info!(resumed, sidecar = %config.sidecar.url, "wazper running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    service.shutdown().await;
    Ok(())
}
