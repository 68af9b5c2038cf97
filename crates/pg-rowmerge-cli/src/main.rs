//! pg-rowmerge CLI - change-only merges and table copies for PostgreSQL.

use clap::{Parser, Subcommand};
use pg_rowmerge::{DatabaseConfig, MergeOutcome, Orchestrator, RowMergeError};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "pg-rowmerge")]
#[command(about = "Change-only merges and table copies for PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to a YAML or JSON database configuration file
    /// [default: the JSON file named by DATABASE_CONFIG_JSON]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Update a table from another, writing only rows that changed
    Merge {
        /// Table providing the new values
        #[arg(long)]
        source: String,

        /// Table to update
        #[arg(long)]
        target: String,

        /// Key columns joining the two tables (comma separated)
        #[arg(long, value_delimiter = ',', required = true)]
        join: Vec<String>,

        /// Columns to update [default: every column both tables share]
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
    },

    /// Append rows of one table to another
    Copy {
        /// Table to read from
        #[arg(long)]
        source: String,

        /// Table to append to
        #[arg(long)]
        into: String,

        /// Columns to copy [default: every source column]
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,

        /// Key columns; rows whose key already exists are skipped
        #[arg(long, value_delimiter = ',')]
        join: Option<Vec<String>>,

        /// Create the destination from the source if it does not exist
        #[arg(long)]
        create: bool,
    },

    /// Create a new table as a copy of an existing one
    Snapshot {
        /// Table to copy
        #[arg(long)]
        source: String,

        /// Name of the table to create
        #[arg(long)]
        into: String,

        /// Columns to copy [default: every source column]
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
    },

    /// Show a table's columns and their types
    Describe {
        /// Table name, optionally schema-qualified
        table: String,
    },

    /// Drop the staging table left behind by an interrupted run
    Cleanup {
        /// Target table of the interrupted run
        target: String,
    },

    /// Test the database connection
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), RowMergeError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(RowMergeError::Config)?;

    let config = match cli.config {
        Some(ref path) => {
            let config = DatabaseConfig::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => DatabaseConfig::from_env()?,
    };

    let orchestrator = Orchestrator::connect(&config).await?;

    match cli.command {
        Commands::Merge {
            source,
            target,
            join,
            columns,
        } => {
            let join = as_strs(&join);
            let columns = columns.as_deref().map(as_strs);
            let outcome = orchestrator
                .merge_tables(&source, &target, &join, columns.as_deref())
                .await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                match outcome {
                    MergeOutcome::NothingToUpdate => println!("{}: nothing to update", target),
                    MergeOutcome::Applied {
                        rows_updated,
                        ignored_columns,
                    } => {
                        println!("{}: {} rows updated from {}", target, rows_updated, source);
                        if !ignored_columns.is_empty() {
                            println!("  Ignored columns: {}", ignored_columns.join(", "));
                        }
                    }
                }
            }
        }

        Commands::Copy {
            source,
            into,
            columns,
            join,
            create,
        } => {
            let columns = columns.as_deref().map(as_strs);
            let join = join.as_deref().map(as_strs);
            let rows = orchestrator
                .insert_from(&source, &into, columns.as_deref(), join.as_deref(), create)
                .await?;
            print_rows(cli.output_json, &into, rows)?;
        }

        Commands::Snapshot {
            source,
            into,
            columns,
        } => {
            let columns = columns.as_deref().map(as_strs);
            let rows = orchestrator
                .select_from(&source, &into, columns.as_deref())
                .await?;
            print_rows(cli.output_json, &into, rows)?;
        }

        Commands::Describe { table } => {
            let descriptor = orchestrator.describe(&table).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&descriptor)?);
            } else {
                println!("{}", descriptor.name);
                for column in &descriptor.columns {
                    println!(
                        "  {:<32} {:<28} {:?}",
                        column.name.as_str(),
                        column.sql_type,
                        column.column_type
                    );
                }
            }
        }

        Commands::Cleanup { target } => {
            let dropped = orchestrator.cleanup_staging(&target).await?;
            let staging = pg_rowmerge::staging_table_name(&orchestrator.table(&target)?)?;
            if cli.output_json {
                let out = json!({ "table": staging.display_name(), "dropped": dropped });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if dropped {
                println!("Dropped {}", staging);
            } else {
                println!("{} does not exist", staging);
            }
        }

        Commands::HealthCheck => {
            let result = orchestrator.database().health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  PostgreSQL {}: {} ({}ms)",
                    result.endpoint,
                    if result.connected { "OK" } else { "FAILED" },
                    result.latency_ms
                );
                if let Some(ref version) = result.server_version {
                    println!("    Server version: {}", version);
                }
                if let Some(ref err) = result.error {
                    println!("    Error: {}", err);
                }
            }

            if !result.connected {
                return Err(RowMergeError::pool(
                    result.error.unwrap_or_default(),
                    "health check",
                ));
            }
        }
    }

    Ok(())
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

fn print_rows(output_json: bool, table: &str, rows: u64) -> Result<(), RowMergeError> {
    if output_json {
        let out = json!({ "table": table, "rows": rows });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}: {} rows written", table, rows);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("Invalid verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("Invalid log format '{}': use text or json", other)),
    }

    Ok(())
}
