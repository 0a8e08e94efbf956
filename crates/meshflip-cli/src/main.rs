//! meshflip: blue/green cutover tooling for mesh-routed gRPC services.
//!
//! # Usage
//!
//! ```text
//! meshflip validate --config meshflip.toml
//! meshflip show echo_server:prod
//! meshflip rehearse --env echo_server:qa1 --interval 100ms
//! meshflip deploy --env echo_server:prod
//! meshflip lock --lock-table meshflip-deploy-locks status echo_server:prod
//! meshflip lock release echo_server:prod
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "meshflip",
    about = "meshflip: blue/green cutover for mesh-routed gRPC services",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the environment table.
    #[arg(short, long, global = true, default_value = "meshflip.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the config file and every environment in it
    Validate,
    /// Print one environment as JSON
    Show {
        /// Environment key, e.g. echo_server:prod
        key: String,
    },
    /// Run a full cutover against an in-memory copy of an environment.
    ///
    /// Nothing outside the process is touched: the platform, lock table
    /// and parameter store are all simulated.
    Rehearse {
        /// Environment key from the config file
        #[arg(long, required_unless_present = "spec", conflicts_with = "spec")]
        env: Option<String>,
        /// Inline spec as a JSON file
        #[arg(long)]
        spec: Option<PathBuf>,
        /// Override the health gate's base poll interval (e.g. 100ms)
        #[arg(long)]
        interval: Option<String>,
    },
    /// Cut over an environment on AWS: ECS, App Mesh, Cloud Map and SSM.
    ///
    /// Credentials and region come from the standard AWS environment.
    Deploy {
        /// Environment key from the config file
        #[arg(long, required_unless_present = "spec", conflicts_with = "spec")]
        env: Option<String>,
        /// Inline spec as a JSON file
        #[arg(long)]
        spec: Option<PathBuf>,
        /// Override the health gate's base poll interval (e.g. 10s)
        #[arg(long)]
        interval: Option<String>,
        #[command(flatten)]
        store: LockStoreArgs,
    },
    /// Inspect or release deployment locks
    Lock {
        #[command(flatten)]
        store: LockStoreArgs,
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Args)]
struct LockStoreArgs {
    /// Lock database file; defaults to `lock_db` from the config file
    #[arg(long, conflicts_with = "lock_table")]
    lock_db: Option<PathBuf>,
    /// DynamoDB lock table; defaults to `lock_table` from the config file
    #[arg(long)]
    lock_table: Option<String>,
}

#[derive(Subcommand)]
enum LockAction {
    /// Show whether a key is locked
    Status { key: String },
    /// Remove the lock on a key
    Release { key: String },
    /// List every held lock
    List,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meshflip=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Validate => commands::validate::validate(&cli.config),
        Commands::Show { key } => commands::show::show(&cli.config, &key),
        Commands::Rehearse {
            env,
            spec,
            interval,
        } => {
            commands::rehearse::rehearse(&cli.config, env.as_deref(), spec.as_deref(), interval)
                .await
        }
        Commands::Deploy {
            env,
            spec,
            interval,
            store,
        } => {
            let flags = commands::deploy::LockFlags {
                lock_db: store.lock_db,
                lock_table: store.lock_table,
            };
            commands::deploy::deploy(&cli.config, env.as_deref(), spec.as_deref(), interval, flags)
                .await
        }
        Commands::Lock { store, action } => {
            let config = commands::load_config(&cli.config)?;
            let target = commands::lock::resolve_target(&config, store.lock_db, store.lock_table);
            match action {
                LockAction::Status { key } => commands::lock::status(&target, &key).await,
                LockAction::Release { key } => commands::lock::release(&target, &key).await,
                LockAction::List => commands::lock::list(&target).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rehearse_needs_env_or_spec() {
        assert!(Cli::try_parse_from(["meshflip", "rehearse"]).is_err());
        assert!(
            Cli::try_parse_from(["meshflip", "rehearse", "--env", "a", "--spec", "b.json"])
                .is_err()
        );

        let cli = Cli::try_parse_from(["meshflip", "rehearse", "--env", "echo_server:qa1"]).unwrap();
        assert!(matches!(cli.command, Commands::Rehearse { env: Some(ref e), .. } if e == "echo_server:qa1"));
    }

    #[test]
    fn deploy_takes_lock_store_flags() {
        assert!(Cli::try_parse_from(["meshflip", "deploy"]).is_err());

        let cli = Cli::try_parse_from([
            "meshflip",
            "deploy",
            "--env",
            "echo_server:prod",
            "--lock-table",
            "meshflip-deploy-locks",
        ])
        .unwrap();
        match cli.command {
            Commands::Deploy { env, store, .. } => {
                assert_eq!(env.as_deref(), Some("echo_server:prod"));
                assert_eq!(store.lock_table.as_deref(), Some("meshflip-deploy-locks"));
                assert!(store.lock_db.is_none());
            }
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn lock_db_and_lock_table_conflict() {
        assert!(
            Cli::try_parse_from([
                "meshflip",
                "lock",
                "--lock-db",
                "locks.redb",
                "--lock-table",
                "locks",
                "list",
            ])
            .is_err()
        );
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "meshflip",
            "lock",
            "status",
            "echo_server:prod",
            "--config",
            "/etc/meshflip.toml",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/meshflip.toml"));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Lock { action: LockAction::Status { .. }, .. }
        ));
    }
}
