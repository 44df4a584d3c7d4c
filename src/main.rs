use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};

use trade_subset::cli::{Cli, Command, OperatorArgs};
use trade_subset::db::{make_pool, MySqlTradeStore};
use trade_subset::engine::{ProgressUpdate, StreamControl};
use trade_subset::error::ConfigError;
use trade_subset::pipeline::{confirm_from_report, open_checkpointer, rollback_from_report, Pipeline};
use trade_subset::report::{RunOutcome, RunReport};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            let code = if e.downcast_ref::<ConfigError>().is_some() { 2 } else { 1 };
            std::process::exit(code);
        }
    }
}

/// Logs at most one progress line per second per stage.
fn progress_logger() -> impl Fn(ProgressUpdate) + Send + Clone + 'static {
    let last = Arc::new(AtomicU64::new(0));
    move |u: ProgressUpdate| {
        let now = chrono::Utc::now().timestamp() as u64;
        if last.swap(now, Ordering::Relaxed) == now && u.processed < u.total { return; }
        info!(
            "[{}] {}/{} ({:.1}%) eta {}s | mem used {} MB, avail {} MB",
            u.stage, u.processed, u.total, u.percent, u.eta_secs, u.mem_used_mb, u.mem_avail_mb
        );
    }
}

fn cancel_on_ctrl_c(control: &StreamControl) {
    let control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing current batches and saving checkpoints");
            control.request_cancel();
        }
    });
}

fn exit_code(report: &RunReport) -> i32 {
    match report.outcome {
        RunOutcome::Failed => 1,
        _ => 0,
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let control = StreamControl::new();
    cancel_on_ctrl_c(&control);

    match cli.command {
        Command::Extract(args) => {
            let cfg = args.to_app_config()?;
            let checkpointer = open_checkpointer(&cfg, args.fresh)?;
            let report = Pipeline::new(&cfg, control, checkpointer).execute(None, progress_logger()).await;
            info!("Run {} finished: {:?}", report.run_id, report.outcome);
            Ok(exit_code(&report))
        }
        Command::Run(args) => {
            let cfg = args.to_app_config()?;
            let checkpointer = open_checkpointer(&cfg, args.extract.fresh)?;
            let pool = make_pool(&cfg.database).await?;
            let store = MySqlTradeStore::new(pool);
            let report = Pipeline::new(&cfg, control, checkpointer).execute(Some(&store), progress_logger()).await;
            if let Some(c) = &report.cutover {
                info!("Cutover {}: {} of {} rows applied to `{}`", c.state, c.applied, c.attempted, c.production_table);
            }
            info!("Run {} finished: {:?}", report.run_id, report.outcome);
            Ok(exit_code(&report))
        }
        Command::Rollback(args) => operator(args, true).await,
        Command::Confirm(args) => operator(args, false).await,
    }
}

async fn operator(args: OperatorArgs, rollback: bool) -> Result<i32> {
    let db = args.db.to_database_config()?;
    let pool = make_pool(&db).await?;
    let store = MySqlTradeStore::new(pool);
    let report = if rollback {
        rollback_from_report(&store, &args.report).await?
    } else {
        confirm_from_report(&store, &args.report).await?
    };
    if let Some(c) = &report.cutover {
        info!("Run {}: cutover now {}{}", report.run_id, c.state, if c.confirmed { " (confirmed)" } else { "" });
    }
    Ok(0)
}
