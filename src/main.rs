use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use laundry_repair::{
    backfill::{BackfillOptions, NullBackfill},
    config::{self, AppConfig},
    db, logging,
    repair::{self, IdentifierMigration, MigrationOptions},
    report::{self, ErrorReport, Summary},
    rollback_identifiers, OrphanPolicy, RepairError, RollbackOptions,
};
use migrations::{Migrator, MigratorTrait};
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "laundry-repair",
    version,
    about = "Schema repair and identifier migration for the laundry shop database"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render reports as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite UUID primary keys of customers, orders and payments to formatted ids
    ReformatIds(ReformatArgs),
    /// Restore the original UUIDs from the identifier map
    RollbackIds(RollbackArgs),
    /// Fill NULLs left behind by schema drift
    BackfillNulls(BackfillArgs),
    /// List foreign keys, recorded phases and unformatted rows
    Inspect,
    /// Base schema migrations
    #[command(subcommand)]
    Schema(SchemaCommands),
}

#[derive(Args)]
struct ReformatArgs {
    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Run everything inside the transaction, then roll back"
    )]
    dry_run: bool,
    #[arg(
        long,
        help = "What to do with orphaned rows: abort, assign-first-parent or report"
    )]
    orphans: Option<OrphanPolicy>,
}

#[derive(Args)]
struct RollbackArgs {
    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Leave key columns as VARCHAR(255) instead of retyping them to UUID"
    )]
    keep_varchar: bool,
}

#[derive(Args)]
struct BackfillArgs {
    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Re-apply NOT NULL on known columns once they hold no NULLs"
    )]
    enforce_not_null: bool,
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Apply pending migrations
    Up,
    /// Roll back every migration
    Down,
    /// Drop all tables and apply every migration again
    Fresh,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init_tracing(cfg.log_level(), cfg.log_json);

    let json = cli.json;
    match run(cli, cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            if json {
                if let Some(err) = e.downcast_ref::<RepairError>() {
                    if let Err(render_err) = print_report(&ErrorReport::from(err), true) {
                        error!("Failed to render error report: {:#}", render_err);
                    }
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, cfg: AppConfig) -> Result<()> {
    let json = cli.json;

    match cli.command {
        Commands::ReformatIds(args) => {
            let mut options = MigrationOptions::from_config(&cfg);
            options.dry_run = args.dry_run;
            if let Some(policy) = args.orphans {
                options.orphan_policy = policy;
            }

            let report = db::with_session(&cfg, move |session| {
                Box::pin(async move { IdentifierMigration::new(session, options).run().await })
            })
            .await
            .context("identifier migration failed")?;
            print_report(&report, json)?;
        }
        Commands::RollbackIds(args) => {
            let options = RollbackOptions {
                restore_uuid_type: cfg.restore_uuid_type && !args.keep_varchar,
            };

            let report = db::with_session(&cfg, move |session| {
                Box::pin(async move { rollback_identifiers(session, options).await })
            })
            .await
            .context("identifier rollback failed")?;
            print_report(&report, json)?;
        }
        Commands::BackfillNulls(args) => {
            let mut options = BackfillOptions::from_config(&cfg);
            options.enforce_not_null |= args.enforce_not_null;

            let report = db::with_session(&cfg, move |session| {
                Box::pin(async move {
                    Ok(NullBackfill::new(session.connection(), session.schema(), options)
                        .run()
                        .await)
                })
            })
            .await
            .context("NULL backfill failed")?;
            print_report(&report, json)?;
        }
        Commands::Inspect => {
            let report = db::with_session(&cfg, |session| {
                Box::pin(async move { repair::inspect(session.connection(), session.schema()).await })
            })
            .await
            .context("inspection failed")?;
            print_report(&report, json)?;
        }
        Commands::Schema(command) => {
            db::with_session(&cfg, move |session| {
                Box::pin(async move {
                    let conn = session.connection();
                    match command {
                        SchemaCommands::Up => Migrator::up(conn, None).await?,
                        SchemaCommands::Down => Migrator::down(conn, None).await?,
                        SchemaCommands::Fresh => Migrator::fresh(conn).await?,
                    }
                    Ok(())
                })
            })
            .await
            .context("schema migration failed")?;
            info!("Schema migration completed successfully");
        }
    }

    Ok(())
}

fn print_report<T: Serialize + Summary>(report: &T, json: bool) -> Result<()> {
    println!("{}", report::render(report, json)?);
    Ok(())
}
