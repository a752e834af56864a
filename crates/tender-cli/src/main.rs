use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tender_adapters::{AdvancedFilter, DateWindow};
use tender_core::TenderStatus;
use tender_sync::{schedule, ScheduleConfig, SyncConfig, SyncRuntime, TenderFilter, TenderStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "tender-cli")]
#[command(about = "Public tender ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Args)]
struct WindowArgs {
    /// First day, YYYYMMDD. Defaults to yesterday.
    #[arg(long)]
    from: Option<String>,
    /// Last day, YYYYMMDD. Defaults to tomorrow.
    #[arg(long)]
    to: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect tenders announced in a date window.
    Collect {
        #[command(flatten)]
        window: WindowArgs,
        /// Upstream inquiry-division code.
        #[arg(long)]
        division: Option<String>,
    },
    /// Collect through the search operation with narrowing filters.
    CollectFiltered {
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        industry_prefix: Option<String>,
        #[arg(long)]
        product_code: Option<String>,
    },
    /// Recompute lifecycle status for non-terminal tenders.
    Reconcile {
        /// Evaluate as of this day (YYYY-MM-DD) instead of today.
        #[arg(long)]
        on: Option<NaiveDate>,
    },
    /// Delete closed tenders.
    Purge,
    /// Apply database migrations.
    Migrate,
    /// Run the cron schedule until interrupted.
    Schedule,
    /// Print stored tenders as JSON.
    Show {
        #[arg(long)]
        number: Option<String>,
        #[arg(long = "status")]
        statuses: Vec<TenderStatus>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        classification: Option<String>,
        #[arg(long)]
        closes_from: Option<NaiveDate>,
        #[arg(long)]
        closes_to: Option<NaiveDate>,
        #[arg(long)]
        min_budget: Option<i64>,
        #[arg(long)]
        max_budget: Option<i64>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Record an operator status override.
    SetStatus { number: String, status: TenderStatus },
}

fn resolve_window(args: &WindowArgs, today: NaiveDate) -> Result<DateWindow> {
    let rolling = DateWindow::around(today, 1, 1);
    let from = args.from.clone().unwrap_or_else(|| rolling.begin_param());
    let to = args.to.clone().unwrap_or_else(|| rolling.end_param());
    Ok(DateWindow::parse(&from, &to)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encoding output")?);
    Ok(())
}

/// Cancelled on the first Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current page");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    logging::init_tracing();
    let cli = Cli::parse();
    let runtime = SyncRuntime::from_env().await?;
    let collector = runtime.collector();

    match cli.command {
        Commands::Collect { window, division } => {
            let window = resolve_window(&window, collector.today())?;
            let cancel = interrupt_token();
            match collector
                .collect_by_date_range(window, division.as_deref(), &cancel)
                .await
            {
                Ok(report) => print_json(&report)?,
                Err(err) => {
                    if let Some(partial) = err.partial_report() {
                        print_json(partial)?;
                    }
                    error!(error = %err, "collection failed");
                    return Err(err.into());
                }
            }
        }
        Commands::CollectFiltered {
            window,
            region,
            industry_prefix,
            product_code,
        } => {
            let window = resolve_window(&window, collector.today())?;
            let filter = AdvancedFilter {
                region,
                industry_code_prefix: industry_prefix,
                product_code,
            };
            if filter.is_empty() {
                bail!("collect-filtered needs at least one of --region, --industry-prefix, --product-code");
            }
            let cancel = interrupt_token();
            match collector.collect_with_filters(window, filter, &cancel).await {
                Ok(report) => print_json(&report)?,
                Err(err) => {
                    if let Some(partial) = err.partial_report() {
                        print_json(partial)?;
                    }
                    return Err(err.into());
                }
            }
        }
        Commands::Reconcile { on } => {
            let report = match on {
                Some(day) => collector.reconcile_statuses_on(day).await?,
                None => collector.reconcile_statuses().await?,
            };
            print_json(&report)?;
        }
        Commands::Purge => {
            let report = collector.purge_closed().await?;
            print_json(&report)?;
        }
        Commands::Migrate => {
            runtime.store().migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let cancel = interrupt_token();
            let sched = match runtime.maybe_build_scheduler(cancel.clone()).await? {
                Some(sched) => sched,
                None => {
                    info!("TENDER_SCHEDULER_ENABLED is off; building schedule anyway for foreground run");
                    let config: &SyncConfig = runtime.config();
                    let schedule_config = ScheduleConfig::load(&config.schedule_file).await?;
                    schedule::build_scheduler(collector.clone(), &schedule_config, cancel.clone()).await?
                }
            };
            schedule::run_until_cancelled(sched, cancel).await?;
        }
        Commands::Show {
            number,
            statuses,
            region,
            classification,
            closes_from,
            closes_to,
            min_budget,
            max_budget,
            limit,
        } => {
            let store = runtime.store();
            if let Some(number) = number {
                match store.get(&number).await? {
                    Some(tender) => print_json(&tender)?,
                    None => bail!("no tender with number {number}"),
                }
            } else {
                let filter = TenderFilter {
                    statuses,
                    closes_on_or_after: closes_from,
                    closes_on_or_before: closes_to,
                    min_total_budget: min_budget,
                    max_total_budget: max_budget,
                    region,
                    classification_prefix: classification,
                    limit: Some(limit),
                };
                print_json(&store.find(&filter).await?)?;
            }
        }
        Commands::SetStatus { number, status } => {
            if !runtime.store().set_operator_status(&number, status).await? {
                bail!("no tender with number {number}");
            }
            println!("{number}: status set to {status} (manual)");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_defaults_to_rolling_three_days() {
        let today = NaiveDate::from_ymd_opt(2025, 9, 2).unwrap();
        let window = resolve_window(&WindowArgs { from: None, to: None }, today).unwrap();
        assert_eq!(window.begin_param(), "20250901");
        assert_eq!(window.end_param(), "20250903");

        let explicit = WindowArgs {
            from: Some("20250801".into()),
            to: Some("20250810".into()),
        };
        assert_eq!(resolve_window(&explicit, today).unwrap().days(), 10);

        let inverted = WindowArgs {
            from: Some("20250810".into()),
            to: Some("20250801".into()),
        };
        assert!(resolve_window(&inverted, today).is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["tender-cli", "show", "--status", "active", "--status", "opened", "--limit", "5"]).unwrap();
        match cli.command {
            Commands::Show { statuses, limit, .. } => {
                assert_eq!(statuses, vec![TenderStatus::Active, TenderStatus::Opened]);
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::try_parse_from(["tender-cli", "collect-filtered", "--region", "서울", "--from", "20250901", "--to", "20250903"]).unwrap();
        assert!(matches!(cli.command, Commands::CollectFiltered { region: Some(_), .. }));

        let cli = Cli::try_parse_from(["tender-cli", "reconcile", "--on", "2025-09-10"]).unwrap();
        assert!(matches!(cli.command, Commands::Reconcile { on: Some(_) }));

        assert!(Cli::try_parse_from(["tender-cli", "set-status", "R25BK1", "bogus"]).is_err());
    }
}
