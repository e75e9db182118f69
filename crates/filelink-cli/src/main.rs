use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str =
    "filelink=info,filelink_core=info,filelink_storage=info,filelink_transport=info,filelink_sync=info";

#[derive(Debug, Parser)]
#[command(name = "filelink")]
#[command(about = "Link uploaded remote files to their domain records")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation (default)
    Sync,
    /// Print the files a sync would process, as JSON, without writing anything
    Plan,
    /// Apply the bundled schema migrations
    Migrate,
    /// Run sync on FILELINK_SYNC_CRON until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = filelink_sync::run_sync_once_from_env().await?;
            tracing::info!(
                run_id = %summary.run_id,
                outcome = ?summary.outcome,
                artifacts = summary.artifact_ids.len(),
                associations = summary.association_ids.len(),
                orphaned = summary.orphaned.len(),
                already_claimed = summary.already_claimed.len(),
                "sync complete: created {} association records",
                summary.association_ids.len()
            );
        }
        Commands::Plan => {
            let plan = filelink_sync::plan_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Migrate => {
            filelink_sync::migrate_from_env().await?;
            tracing::info!("migrations applied");
        }
        Commands::Schedule => {
            filelink_sync::run_scheduled().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_means_sync() {
        let cli = Cli::try_parse_from(["filelink"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from(["filelink", "plan"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Plan)));
        assert!(Cli::try_parse_from(["filelink", "--force"]).is_err());
    }
}
