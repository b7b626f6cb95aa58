//! Bugzilla Relay CLI
//!
//! Polls a bugmail mbox and announces changes, or answers one-off bug,
//! attachment and QuickSearch queries.

use anyhow::{bail, Context, Result};
use bugzilla_relay::{
    parse_bug_ids, AnnouncementLog, ChatTransport, ConfigStore, HeaderBugmailParser, LogFileTransport,
    MailboxPoller, NotificationEngine, PollScheduler, RelayConfig, StdoutTransport, TrackerClient,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "bzrelay")]
#[command(about = "Bugzilla Relay - announce Bugzilla changes in chat channels")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/bugzilla-relay/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the mailbox on an interval and announce changes
    Watch {
        /// Poll interval in seconds (default: poll_interval_secs from config)
        #[arg(long, short)]
        interval: Option<u64>,
        /// Record announcements to the JSONL log instead of stdout
        #[arg(long)]
        log_file: bool,
        /// Log announcements without sending them
        #[arg(long)]
        dry_run: bool,
    },
    /// Run a single poll cycle
    Poll {
        #[arg(long)]
        log_file: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show bugs by id or alias ("12, 15 and 20")
    Bug {
        #[arg(long, short, default_value = "")]
        channel: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Show attachments by id
    Attachment {
        #[arg(long, short, default_value = "")]
        channel: String,
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    /// Run a QuickSearch
    Query {
        #[arg(long, short, default_value = "")]
        channel: String,
        /// Only report the number of results
        #[arg(long)]
        total: bool,
        #[arg(required = true)]
        terms: Vec<String>,
    },
    /// Answer bug/attachment mentions in a chat line
    Snarf {
        #[arg(long, short)]
        channel: String,
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Print the effective configuration as JSON
    Config {
        /// Print one channel's merged configuration
        #[arg(long, short)]
        channel: Option<String>,
    },
    /// Show recently recorded announcements
    History {
        #[arg(long, short, default_value = "20")]
        limit: usize,
    },
}

fn transport_for(config: &RelayConfig, log_file: bool, dry_run: bool) -> Arc<dyn ChatTransport> {
    let channels = config.channels();
    if channels.is_empty() {
        warn!("No channels configured; nothing will be announced");
    }
    if log_file && !dry_run {
        let log = AnnouncementLog::new(AnnouncementLog::default_path());
        Arc::new(LogFileTransport::new(log, channels))
    } else {
        Arc::new(StdoutTransport::new(channels).with_dry_run(dry_run))
    }
}

fn build_engine(config: &Arc<RelayConfig>, transport: Arc<dyn ChatTransport>) -> Result<NotificationEngine> {
    let tracker = TrackerClient::new(config.http_timeout()).context("failed to create tracker client")?;
    let store: Arc<dyn ConfigStore> = config.clone();
    Ok(NotificationEngine::new(store, Arc::new(tracker), transport))
}

fn build_poller(config: &RelayConfig) -> MailboxPoller {
    if config.mbox.is_none() {
        warn!("No mbox configured; polling does nothing");
    }
    MailboxPoller::new(
        config.mbox.clone(),
        config.lock_timeout(),
        Arc::new(HeaderBugmailParser::new()),
    )
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}

fn run_watch(config: Arc<RelayConfig>, interval: Option<u64>, log_file: bool, dry_run: bool) -> Result<()> {
    let period = interval.map(Duration::from_secs).unwrap_or_else(|| config.poll_interval());
    if period.is_zero() {
        bail!("poll interval must be at least one second");
    }

    let transport = transport_for(&config, log_file, dry_run);
    let engine = Arc::new(Mutex::new(build_engine(&config, transport)?));
    let poller = Arc::new(build_poller(&config));

    // the blocking tracker client is built and dropped outside the runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut scheduler = PollScheduler::new(Arc::clone(&poller), Arc::clone(&engine), period, shutdown_rx);
        let handle = tokio::spawn(async move { scheduler.run().await });

        tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
        handle.await.context("poller task failed")?;
        Ok::<(), anyhow::Error>(())
    })
}

fn main() -> Result<()> {
    // RUST_LOG overrides, e.g. RUST_LOG=bugzilla_relay=debug bzrelay watch
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bugzilla_relay=info,bzrelay=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(RelayConfig::default_path);
    let config = RelayConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let config = Arc::new(config);

    match cli.command {
        Commands::Watch {
            interval,
            log_file,
            dry_run,
        } => {
            run_watch(config, interval, log_file, dry_run)?;
        }
        Commands::Poll { log_file, dry_run } => {
            let transport = transport_for(&config, log_file, dry_run);
            let engine = Mutex::new(build_engine(&config, transport)?);
            let sent = build_poller(&config).poll(&engine).context("poll failed")?;
            info!(sent, "Poll finished");
        }
        Commands::Bug { channel, ids } => {
            let engine = build_engine(&config, transport_for(&config, false, true))?;
            let ids = parse_bug_ids(&ids.join(" "));
            print_lines(&engine.bug_lines(&channel, &ids, true));
        }
        Commands::Attachment { channel, ids } => {
            let engine = build_engine(&config, transport_for(&config, false, true))?;
            print_lines(&engine.attachment_lines(&channel, &ids));
        }
        Commands::Query { channel, total, terms } => {
            let engine = build_engine(&config, transport_for(&config, false, true))?;
            print_lines(&engine.query_lines(&channel, &terms.join(" "), total));
        }
        Commands::Snarf { channel, text } => {
            let mut engine = build_engine(&config, transport_for(&config, false, true))?;
            let lines = engine.snarf(&channel, &text.join(" "));
            if lines.is_empty() {
                info!(channel = %channel, "Nothing to answer");
            }
            print_lines(&lines);
        }
        Commands::Config { channel } => {
            let json = match channel {
                Some(channel) => serde_json::to_string_pretty(&config.channel(&channel))?,
                None => serde_json::to_string_pretty(config.as_ref())?,
            };
            println!("{}", json);
        }
        Commands::History { limit } => {
            let log = AnnouncementLog::new(AnnouncementLog::default_path());
            let records = log.read_recent(limit);
            if records.is_empty() {
                println!("No announcements recorded in {}", log.path().display());
            }
            for record in records {
                println!(
                    "{} [{}] {}",
                    record.ts.format("%Y-%m-%d %H:%M:%S"),
                    record.channel,
                    record.line
                );
            }
        }
    }

    Ok(())
}
