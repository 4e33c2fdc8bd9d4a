use std::process::ExitCode;
use std::sync::Arc;

use agri_core::{CycleResult, Dataset, MarketFilter, SchemeFilter, StatsOptions};
use agri_store::{available_states, Store, StoreConnector};
use agri_sync::{CycleRunner, ScheduleMode, Scheduler, SyncConfig};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "agri-cli")]
#[command(about = "Sync and query government agricultural schemes and market prices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch-normalize-upsert cycle.
    Fetch {
        #[arg(long, default_value = "schemes")]
        dataset: Dataset,
    },
    /// List stored schemes, newest first.
    List {
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        ministry: Option<String>,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    Get {
        #[arg(long)]
        id: String,
    },
    Stats,
    States,
    /// Latest market prices, trends and demand.
    Market {
        #[arg(long)]
        commodity: Option<String>,
        #[arg(long)]
        market: Option<String>,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run cycles on a timer until Ctrl-C (default every 6 hours).
    Schedule {
        /// Seconds between runs.
        #[arg(long, conflicts_with_all = ["daily", "once"])]
        interval: Option<u64>,
        /// Daily run time, HH:MM UTC.
        #[arg(long, conflicts_with = "once")]
        daily: Option<String>,
        #[arg(long)]
        once: bool,
        /// Repeatable; defaults to every dataset.
        #[arg(long)]
        dataset: Vec<Dataset>,
    },
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

/// What a command prints, and whether it counts as success.
struct Output {
    body: Value,
    ok: bool,
}

impl Output {
    fn ok(body: Value) -> Self {
        Self { body, ok: true }
    }

    fn cycles(results: &[CycleResult]) -> Result<Self> {
        Ok(Self {
            body: serde_json::to_value(results)?,
            ok: results.iter().all(CycleResult::is_success),
        })
    }
}

/// Usage errors become a JSON error object; `None` for help and version output.
fn usage_error(err: &clap::Error) -> Option<Output> {
    match err.kind() {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayVersion
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => None,
        _ => Some(Output {
            body: json!({ "error": err.to_string().trim() }),
            ok: false,
        }),
    }
}

fn print_json(body: &Value) {
    match serde_json::to_string_pretty(body) {
        Ok(text) => println!("{text}"),
        Err(err) => println!("{}", json!({ "error": err.to_string() })),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn open_store(config: &SyncConfig) -> Result<Box<dyn Store>> {
    let connector = StoreConnector::from_url(&config.database_url)
        .with_context(|| format!("invalid DATABASE_URL {}", config.database_url))?;
    connector
        .open()
        .await
        .with_context(|| format!("opening store {}", connector.describe()))
}

async fn query(config: &SyncConfig, command: Commands) -> Result<Output> {
    let store = open_store(config).await?;
    let result = run_query(store.as_ref(), command).await;
    store.close().await;
    result
}

async fn run_query(store: &dyn Store, command: Commands) -> Result<Output> {
    let output = match command {
        Commands::List {
            region,
            ministry,
            state,
            limit,
        } => {
            let filter = SchemeFilter {
                region,
                ministry,
                state,
                limit,
            };
            Output::ok(serde_json::to_value(store.list_schemes(&filter).await?)?)
        }
        Commands::Get { id } => match store.get_scheme(&id).await? {
            Some(scheme) => Output::ok(serde_json::to_value(scheme)?),
            None => Output {
                body: json!({ "error": "Scheme not found" }),
                ok: false,
            },
        },
        Commands::Stats => Output::ok(serde_json::to_value(
            store.scheme_stats(StatsOptions::default(), Utc::now()).await?,
        )?),
        Commands::States => Output::ok(serde_json::to_value(available_states(store).await?)?),
        Commands::Market {
            commodity,
            market,
            state,
            limit,
        } => {
            let filter = MarketFilter {
                commodity,
                market,
                state,
                limit,
            };
            Output::ok(serde_json::to_value(store.list_market(&filter).await?)?)
        }
        other => anyhow::bail!("{other:?} is not a query command"),
    };
    Ok(output)
}

fn schedule_mode(interval: Option<u64>, daily: Option<String>, once: bool) -> Result<ScheduleMode> {
    if once {
        return Ok(ScheduleMode::Once);
    }
    match (interval, daily) {
        (Some(secs), _) => ScheduleMode::interval_secs(secs),
        (None, Some(at)) => ScheduleMode::daily(&at),
        (None, None) => Ok(ScheduleMode::default()),
    }
}

async fn run(config: SyncConfig, command: Commands) -> Result<Output> {
    match command {
        Commands::Fetch { dataset } => {
            let runner = CycleRunner::from_config(&config).await?;
            let result = match runner.run_cycle(dataset).await {
                Ok(result) => result,
                Err(err) => err.result,
            };
            Ok(Output {
                ok: result.is_success(),
                body: serde_json::to_value(&result)?,
            })
        }
        Commands::Schedule {
            interval,
            daily,
            once,
            dataset,
        } => {
            let mode = schedule_mode(interval, daily, once)?;
            let datasets = if dataset.is_empty() {
                Dataset::ALL.to_vec()
            } else {
                dataset
            };
            let runner = Arc::new(CycleRunner::from_config(&config).await?);
            let results = Scheduler::new(runner, datasets, mode).run_until_shutdown().await?;
            Output::cycles(&results)
        }
        Commands::Serve { port } => {
            agri_web::serve(&config, port).await?;
            Ok(Output::ok(json!({ "status": "stopped" })))
        }
        command => query(&config, command).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match usage_error(&err) {
            Some(output) => {
                print_json(&output.body);
                return ExitCode::FAILURE;
            }
            None => err.exit(),
        },
    };

    let output = match run(SyncConfig::from_env(), cli.command).await {
        Ok(output) => output,
        Err(err) => {
            error!(error = ?err, "command failed");
            Output {
                body: json!({ "error": format!("{err:#}") }),
                ok: false,
            }
        }
    };

    print_json(&output.body);
    if output.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agri_core::Scheme;
    use agri_store::{upsert, MemoryStore};
    use chrono::TimeZone;

    fn scheme(id: &str) -> Scheme {
        Scheme {
            scheme_id: id.to_string(),
            scheme_name: id.to_uppercase(),
            description: String::new(),
            ministry: "Ministry of Agriculture".into(),
            eligibility: String::new(),
            region: "Central".into(),
            state: String::new(),
            start_date: None,
            last_updated: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn cli_parses_commands() {
        let cli = Cli::try_parse_from(["agri-cli", "fetch", "--dataset", "market"]).unwrap();
        assert!(matches!(cli.command, Commands::Fetch { dataset: Dataset::Market }));

        let cli = Cli::try_parse_from(["agri-cli", "list", "--state", "Punjab", "--limit", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::List { limit: Some(5), .. }));

        let cli = Cli::try_parse_from([
            "agri-cli", "schedule", "--daily", "06:00", "--dataset", "schemes", "--dataset", "market",
        ])
        .unwrap();
        match cli.command {
            Commands::Schedule { daily, dataset, .. } => {
                assert_eq!(daily.as_deref(), Some("06:00"));
                assert_eq!(dataset, vec![Dataset::Schemes, Dataset::Market]);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(Cli::try_parse_from(["agri-cli", "schedule", "--once", "--interval", "60"]).is_err());
        assert!(Cli::try_parse_from(["agri-cli", "get"]).is_err());
    }

    #[test]
    fn schedule_mode_from_flags() {
        assert_eq!(schedule_mode(None, None, true).unwrap(), ScheduleMode::Once);
        assert_eq!(schedule_mode(None, None, false).unwrap(), ScheduleMode::default());
        assert!(schedule_mode(Some(0), None, false).is_err());
        assert_eq!(
            schedule_mode(None, Some("18:15".into()), false).unwrap(),
            ScheduleMode::Daily { hour: 18, minute: 15 }
        );
    }

    #[test]
    fn usage_errors_become_json() {
        let err = Cli::try_parse_from(["agri-cli", "fetch", "--dataset", "weather"]).unwrap_err();
        let out = usage_error(&err).expect("bad value is a usage error");
        assert!(!out.ok);
        assert!(out.body["error"].as_str().unwrap().contains("weather"));

        let err = Cli::try_parse_from(["agri-cli", "get"]).unwrap_err();
        assert!(usage_error(&err).is_some());

        let err = Cli::try_parse_from(["agri-cli", "--help"]).unwrap_err();
        assert!(usage_error(&err).is_none());
    }

    #[tokio::test]
    async fn get_missing_scheme_prints_error_object() {
        let store = MemoryStore::new();
        let out = run_query(&store, Commands::Get { id: "nope".into() }).await.unwrap();
        assert!(!out.ok);
        assert_eq!(out.body, json!({ "error": "Scheme not found" }));
    }

    #[tokio::test]
    async fn query_commands_emit_json() {
        let store = MemoryStore::new();
        upsert(&store, &[scheme("pm-kisan")], Utc::now()).await.unwrap();

        let out = run_query(&store, Commands::Get { id: "pm-kisan".into() }).await.unwrap();
        assert!(out.ok);
        assert_eq!(out.body["schemeName"], "PM-KISAN");

        let out = run_query(&store, Commands::Stats).await.unwrap();
        assert_eq!(out.body["totalSchemes"], 1);

        let out = run_query(
            &store,
            Commands::Market {
                commodity: None,
                market: None,
                state: None,
                limit: None,
            },
        )
        .await
        .unwrap();
        assert!(out.body["prices"].as_array().unwrap().is_empty());
    }
}
