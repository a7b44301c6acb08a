use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use forelka_core::{
    config::{ConfigStore, DEFAULT_CONFIG_PATH},
    domain::UserId,
    host::Host,
    repository::{Repository, SqliteRepository},
    supervisor::Supervisor,
};
use forelka_telegram::TelegramTransport;

/// Multi-account chat automation host.
#[derive(Debug, Parser)]
#[command(name = "forelka", version, about)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Store an account and exit.
    #[arg(long, num_args = 3, value_names = ["USER_ID", "API_ID", "API_HASH"])]
    add_account: Option<Vec<String>>,

    /// Command prefix for --add-account.
    #[arg(long, requires = "add_account")]
    prefix: Option<String>,

    /// Remove an account with all its data and exit.
    #[arg(long, value_name = "USER_ID", conflicts_with = "add_account")]
    remove_account: Option<i64>,

    /// Give OWNER_ID owner and admin rights on the account of USER_ID and exit.
    #[arg(
        long,
        num_args = 2,
        value_names = ["USER_ID", "OWNER_ID"],
        conflicts_with_all = ["add_account", "remove_account"]
    )]
    add_owner: Option<Vec<i64>>,

    /// Print the stored accounts and exit.
    #[arg(long, conflicts_with_all = ["add_account", "remove_account", "add_owner"])]
    list_accounts: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Arc::new(
        ConfigStore::load(cli.config.clone())
            .with_context(|| format!("failed to load config {}", cli.config.display()))?,
    );
    forelka_core::logging::init(&config.log_level(), config.log_file().as_deref())
        .context("failed to initialize logging")?;

    let db_path = config.database_path();
    let repo: Arc<dyn Repository> = Arc::new(
        SqliteRepository::open(&db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?,
    );
    let host = Host::new(config, repo);
    let supervisor = Supervisor::new(host, Arc::new(TelegramTransport::new()));

    if let Some(args) = cli.add_account {
        let [user_id, api_id, api_hash] = args.as_slice() else {
            anyhow::bail!("--add-account takes USER_ID API_ID API_HASH");
        };
        let user_id: i64 = user_id
            .parse()
            .with_context(|| format!("invalid user id {user_id:?}"))?;
        let id = supervisor
            .add_account(UserId(user_id), api_id, api_hash, cli.prefix.as_deref())
            .await?;
        println!("account {user_id} saved (id {id})");
        return close(&supervisor).await;
    }

    if let Some(user_id) = cli.remove_account {
        if supervisor.remove_account(UserId(user_id)).await? {
            println!("account {user_id} removed");
        } else {
            println!("account {user_id} not found");
        }
        return close(&supervisor).await;
    }

    if let Some(args) = cli.add_owner {
        let [user_id, owner_id] = args.as_slice() else {
            anyhow::bail!("--add-owner takes USER_ID OWNER_ID");
        };
        if supervisor.add_owner(UserId(*user_id), UserId(*owner_id)).await? {
            println!("user {owner_id} is now an owner of account {user_id}");
        } else {
            println!("account {user_id} not found");
        }
        return close(&supervisor).await;
    }

    if cli.list_accounts {
        let accounts = supervisor.list_accounts().await?;
        if accounts.is_empty() {
            println!("no accounts");
        }
        for a in accounts {
            println!(
                "{}\tuser {}\tprefix {}\tadded {}",
                a.id,
                a.external_user_id,
                a.prefix,
                a.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        return close(&supervisor).await;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    info!("forelka starting");
    supervisor.run(shutdown).await?;
    info!("forelka stopped");
    Ok(())
}

async fn close(supervisor: &Supervisor) -> anyhow::Result<()> {
    supervisor
        .host()
        .repo()
        .close()
        .await
        .context("failed to close database")
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    r = tokio::signal::ctrl_c() => {
                        if let Err(e) = r {
                            error!(error = %e, "ctrl-c handler failed");
                        }
                    }
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "ctrl-c handler failed");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl-c handler failed");
        }
    }

    info!("signal received, shutting down");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_owner_takes_account_and_owner_ids() {
        let cli = Cli::try_parse_from(["forelka", "--add-owner", "100", "200"]).unwrap();
        assert_eq!(cli.add_owner, Some(vec![100, 200]));

        assert!(Cli::try_parse_from(["forelka", "--add-owner", "100"]).is_err());
        assert!(Cli::try_parse_from(["forelka", "--add-owner", "1", "2", "--list-accounts"]).is_err());
    }
}
