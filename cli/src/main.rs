// cli/src/main.rs

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Weekday};
use clap::{Parser, Subcommand};

use dataget_core::config::AppConfig;
use dataget_core::data_models::batch::yesterday_local;
use dataget_core::data_models::{
    Audience, BatchId, DateWindow, ReportKind, ReportSpec, SinkKind,
};
use dataget_core::lark::card::LarkCardSink;
use dataget_core::lark::doc::{DocTarget, LarkDocClient, LarkDocSink};
use dataget_core::lark::ReportSink;
use dataget_core::pipeline::BatchCoordinator;
use dataget_core::scheduler::{Cadence, Scheduler};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Marketing-analytics ingestion and reporting pipeline", long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs one ingest tick for today (or T-1 under FETCH_YESTERDAY)
    IngestNow,
    /// Runs one ingest tick for a specific calendar day
    IngestForDate {
        /// Target day, YYYYMMDD
        date: String,
    },
    /// Publishes the daily report for a date
    ReportDaily {
        /// Report day, YYYY-MM-DD
        date: String,
        #[clap(flatten)]
        sink: SinkArgs,
    },
    /// Publishes the weekly report for a window ending at the given date
    ReportWeekly {
        /// Last day of the window, YYYY-MM-DD
        date: String,
        /// Window length in days
        #[clap(long, default_value_t = 7)]
        days: u32,
        #[clap(flatten)]
        sink: SinkArgs,
    },
    /// Re-fetches a day from the BI API and patches media_user_revenue
    BackfillField {
        /// Target day, YYYYMMDD
        date: String,
        /// Restrict the patch to one batch
        #[clap(long)]
        batch_id: Option<String>,
    },
    /// Runs the scheduler loop (hourly ingest plus report triggers)
    Schedule,
}

#[derive(clap::Args, Debug)]
struct SinkArgs {
    /// Write to a long-form document instead of the chat webhook
    #[clap(long)]
    doc_token: Option<String>,
    /// Write to a wiki node (resolved to its backing document)
    #[clap(long)]
    wiki_token: Option<String>,
    /// Company-wide audience: aggregate sections only, no per-person tables
    #[clap(long)]
    all: bool,
}

impl SinkArgs {
    fn audience(&self) -> Audience {
        if self.all {
            Audience::All
        } else {
            Audience::Team
        }
    }

    fn sink_kind(&self) -> SinkKind {
        if self.doc_token.is_some() || self.wiki_token.is_some() {
            SinkKind::Doc
        } else {
            SinkKind::Chat
        }
    }

    fn build(&self, config: &AppConfig) -> Box<dyn ReportSink> {
        let target = self
            .doc_token
            .clone()
            .map(DocTarget::Document)
            .or_else(|| self.wiki_token.clone().map(DocTarget::WikiNode));
        match target {
            Some(target) => Box::new(LarkDocSink::new(
                LarkDocClient::new(&config.lark_app_id, &config.lark_app_secret),
                target,
                config.doc_table_row_cap,
            )),
            None => Box::new(LarkCardSink::new(
                &config.lark_webhook_url,
                config.card_table_row_cap,
            )),
        }
    }
}

#[tokio::main]
async fn main() {
    if dataget_core::utils::logger::init().is_err() {
        eprintln!("warning: logger was already installed");
    }
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err.message);
            return 2;
        }
    };

    let coordinator = match BatchCoordinator::from_config(config.clone()) {
        Ok(coordinator) => coordinator,
        Err(err) => {
            eprintln!("startup error: {}", err.message);
            return 2;
        }
    };

    match &cli.command {
        Commands::IngestNow => {
            let window = coordinator.default_window();
            run_ingest(&coordinator, window).await
        }
        Commands::IngestForDate { date } => match parse_compact_date(date) {
            Ok(day) => run_ingest(&coordinator, DateWindow::single(day)).await,
            Err(message) => {
                eprintln!("{message}");
                2
            }
        },
        Commands::ReportDaily { date, sink } => {
            let day = match parse_iso_date(date) {
                Ok(day) => day,
                Err(message) => {
                    eprintln!("{message}");
                    return 2;
                }
            };
            let spec = ReportSpec {
                kind: ReportKind::Daily,
                window: DateWindow::single(day),
                sink: sink.sink_kind(),
                audience: sink.audience(),
            };
            run_report(&coordinator, &config, &spec, sink).await
        }
        Commands::ReportWeekly { date, days, sink } => {
            let end = match parse_iso_date(date) {
                Ok(day) => day,
                Err(message) => {
                    eprintln!("{message}");
                    return 2;
                }
            };
            if *days == 0 {
                eprintln!("--days must be at least 1");
                return 2;
            }
            let spec = ReportSpec {
                kind: ReportKind::Weekly,
                window: DateWindow {
                    start: end - Duration::days(*days as i64 - 1),
                    end,
                },
                sink: sink.sink_kind(),
                audience: sink.audience(),
            };
            run_report(&coordinator, &config, &spec, sink).await
        }
        Commands::BackfillField { date, batch_id } => {
            let day = match parse_compact_date(date) {
                Ok(day) => day,
                Err(message) => {
                    eprintln!("{message}");
                    return 2;
                }
            };
            let batch = match batch_id.as_deref().map(BatchId::parse).transpose() {
                Ok(batch) => batch,
                Err(err) => {
                    eprintln!("invalid --batch-id: {}", err.message);
                    return 2;
                }
            };
            match coordinator
                .run_backfill(DateWindow::single(day), batch.as_ref())
                .await
            {
                Ok(updated) => {
                    println!("backfilled {updated} rows for {day}");
                    0
                }
                Err(err) => {
                    eprintln!("backfill failed: {}", err.message);
                    1
                }
            }
        }
        Commands::Schedule => run_scheduler(coordinator, config).await,
    }
}

async fn run_ingest(coordinator: &BatchCoordinator, window: DateWindow) -> i32 {
    match coordinator.run_ingest(window).await {
        Ok(report) => {
            for outcome in &report.outcomes {
                println!(
                    "{}: {:?} ({} rows)",
                    outcome.source, outcome.status, outcome.row_count
                );
            }
            if report.any_failed() {
                1
            } else {
                0
            }
        }
        Err(err) => {
            eprintln!("ingest failed: {}", err.message);
            1
        }
    }
}

async fn run_report(
    coordinator: &BatchCoordinator,
    config: &AppConfig,
    spec: &ReportSpec,
    sink_args: &SinkArgs,
) -> i32 {
    let sink = sink_args.build(config);
    match coordinator.run_report(spec, sink.as_ref()).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("report failed: {}", err.message);
            1
        }
    }
}

async fn run_scheduler(coordinator: BatchCoordinator, config: AppConfig) -> i32 {
    let coordinator = Arc::new(coordinator);
    let mut scheduler = Scheduler::new();

    let ingest = coordinator.clone();
    scheduler.add_job("hourly_ingest", Cadence::Every(Duration::hours(1)), move || {
        let ingest = ingest.clone();
        Box::pin(async move {
            let window = ingest.default_window();
            ingest.run_ingest(window).await.map(|_| ())
        })
    });

    let intraday = coordinator.clone();
    let intraday_config = config.clone();
    scheduler.add_job(
        "intraday_broadcast",
        Cadence::Every(Duration::hours(1)),
        move || {
            let intraday = intraday.clone();
            let config = intraday_config.clone();
            Box::pin(async move {
                let spec = ReportSpec {
                    kind: ReportKind::Intraday,
                    window: intraday.default_window(),
                    sink: SinkKind::Chat,
                    audience: Audience::Team,
                };
                let sink = LarkCardSink::new(&config.lark_webhook_url, config.card_table_row_cap);
                intraday.run_report(&spec, &sink).await
            })
        },
    );

    let daily = coordinator.clone();
    let daily_config = config.clone();
    scheduler.add_job(
        "daily_report",
        Cadence::DailyAt { hour: 9, minute: 30 },
        move || {
            let daily = daily.clone();
            let config = daily_config.clone();
            Box::pin(async move {
                let spec = ReportSpec {
                    kind: ReportKind::Daily,
                    window: DateWindow::single(yesterday_local()),
                    sink: SinkKind::Chat,
                    audience: Audience::Team,
                };
                let sink = LarkCardSink::new(&config.lark_webhook_url, config.card_table_row_cap);
                daily.run_report(&spec, &sink).await
            })
        },
    );

    let weekly = coordinator.clone();
    let weekly_config = config.clone();
    scheduler.add_job(
        "weekly_report",
        Cadence::WeeklyOn {
            weekday: Weekday::Mon,
            hour: 10,
            minute: 0,
        },
        move || {
            let weekly = weekly.clone();
            let config = weekly_config.clone();
            Box::pin(async move {
                let end = yesterday_local();
                let spec = ReportSpec {
                    kind: ReportKind::Weekly,
                    window: DateWindow {
                        start: end - Duration::days(6),
                        end,
                    },
                    sink: SinkKind::Chat,
                    audience: Audience::Team,
                };
                let sink = LarkCardSink::new(&config.lark_webhook_url, config.card_table_row_cap);
                weekly.run_report(&spec, &sink).await
            })
        },
    );

    // First ingest runs immediately, then the loop takes over.
    let window = coordinator.default_window();
    if let Err(err) = coordinator.run_ingest(window).await {
        log::error!("initial ingest failed: {}", err.message);
    }
    scheduler.run().await;
    0
}

fn parse_compact_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .map_err(|_| format!("invalid date '{raw}', expected YYYYMMDD"))
}

fn parse_iso_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("invalid date '{raw}', expected YYYY-MM-DD"))
}
