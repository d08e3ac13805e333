//! CLI entry point for `mailcatch`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand};
use tokio::sync::watch;

use mailcatch::config::{self, Config};
use mailcatch::model::mail::MessageRecord;
use mailcatch::smtp::{Listener, SessionSettings};
use mailcatch::store::attachments::AttachmentStore;
use mailcatch::store::mailroom::Mailroom;
use mailcatch::store::records::RecordStore;

#[derive(Parser)]
#[command(
    name = "mailcatch",
    version,
    about = "Local SMTP sink that stores every message it receives",
    long_about = "Local SMTP sink that stores every message it receives.\n\n\
                  Bodies go to a SQLite record store, attachments to a directory \
                  on disk. Nothing is ever relayed."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SMTP listener until Ctrl-C
    Serve {
        /// Address to listen on (overrides server.bind_addr)
        #[arg(short, long, value_name = "ADDR")]
        bind: Option<SocketAddr>,
        #[command(flatten)]
        storage: StorageArgs,
        /// Attachment directory (overrides storage.attachments_dir)
        #[arg(long, value_name = "DIR")]
        attachments: Option<PathBuf>,
    },
    /// List stored messages, newest first
    List {
        #[command(flatten)]
        storage: StorageArgs,
        /// Show at most N messages
        #[arg(short = 'n', long, value_name = "N")]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Submit a message to a running listener
    Send {
        /// Envelope sender
        #[arg(long, value_name = "ADDR")]
        from: String,
        /// Envelope recipient (repeatable)
        #[arg(long, value_name = "ADDR", required = true)]
        to: Vec<String>,
        /// Send this RFC 5322 file verbatim
        #[arg(long, value_name = "FILE", conflicts_with_all = ["subject", "body"])]
        eml: Option<PathBuf>,
        #[arg(long, default_value = "mailcatch test message")]
        subject: String,
        #[arg(long, default_value = "")]
        body: String,
        /// Listener address (defaults to server.bind_addr)
        #[arg(long, value_name = "ADDR")]
        server: Option<SocketAddr>,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[derive(Args)]
struct StorageArgs {
    /// Message database (overrides storage.database)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.clone(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    setup_logging(&log_level, &config);

    match cli.command {
        Commands::Serve {
            bind,
            storage,
            attachments,
        } => {
            if let Some(addr) = bind {
                config.server.bind_addr = addr;
            }
            if let Some(db) = storage.db {
                config.storage.database = Some(db);
            }
            if let Some(dir) = attachments {
                config.storage.attachments_dir = Some(dir);
            }
            runtime()?.block_on(cmd_serve(&config))
        }
        Commands::List {
            storage,
            limit,
            json,
        } => {
            let db = storage.db.unwrap_or_else(|| config::database_path(&config));
            cmd_list(&db, limit, json)
        }
        Commands::Send {
            from,
            to,
            eml,
            subject,
            body,
            server,
        } => {
            let addr = server.unwrap_or(config.server.bind_addr);
            let payload = match eml {
                Some(path) => read_eml(&path)?,
                None => mailcatch::client::compose_text(&from, &to, &subject, &body),
            };
            runtime()?.block_on(cmd_send(addr, &from, &to, &payload))
        }
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_path = config::log_file_path(config);
    let log_dir = log_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mailcatch.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// Run the listener until Ctrl-C, then drain open sessions.
async fn cmd_serve(config: &Config) -> anyhow::Result<()> {
    let db_path = config::database_path(config);
    let att_dir = config::attachments_dir(config);

    let records = RecordStore::open(&db_path)?;
    let attachments = AttachmentStore::new(&att_dir, config.storage.collision);
    let mailroom = Arc::new(Mailroom::new(attachments, records));

    let settings = SessionSettings::from_config(&config.server);
    let listener = Listener::bind(config.server.bind_addr, settings, mailroom).await?;

    println!();
    println!("  {:<15} {}", "Listening on", listener.local_addr());
    println!("  {:<15} {}", "Database", db_path.display());
    println!("  {:<15} {}", "Attachments", att_dir.display());
    println!();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        let _ = shutdown_tx.send(true);
    });

    listener.run(shutdown_rx).await?;
    Ok(())
}

/// Print stored messages, newest first.
fn cmd_list(db: &Path, limit: Option<usize>, json: bool) -> anyhow::Result<()> {
    if !db.exists() {
        anyhow::bail!("Database not found: {}", db.display());
    }
    let store = RecordStore::open(db)?;
    let mut records = store.list_all()?;
    if let Some(n) = limit {
        records.truncate(n);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_records_table(&records);
    }
    Ok(())
}

/// Submit one message and report the listener's verdict.
async fn cmd_send(
    addr: SocketAddr,
    from: &str,
    to: &[String],
    payload: &[u8],
) -> anyhow::Result<()> {
    let reply = mailcatch::client::send_message(addr, from, to, payload).await?;
    if !reply.is_positive() {
        anyhow::bail!("Message rejected: {} {}", reply.code, reply.text());
    }
    println!("  {} {}", reply.code, reply.text());
    Ok(())
}

fn read_eml(path: &Path) -> anyhow::Result<Vec<u8>> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    Ok(std::fs::read(path)?)
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailcatch", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

/// Print records as a human-readable table.
fn print_records_table(records: &[MessageRecord]) {
    use humansize::{format_size, BINARY};

    println!();
    println!("  {} message(s)", records.len());
    println!();

    if records.is_empty() {
        return;
    }

    println!(
        "  {:<6} {:<25} {:<25} {:<35} {:>8} {:>4}",
        "ID", "Date", "From", "Subject", "Body", "Att"
    );
    println!("  {}", "-".repeat(108));

    for r in records {
        let date: String = r.date.chars().take(24).collect();
        let from: String = r.sender.chars().take(24).collect();
        let subject: String = r.subject.chars().take(34).collect();
        let size = format_size(r.body.len() as u64, BINARY);

        println!(
            "  {:<6} {:<25} {:<25} {:<35} {:>8} {:>4}",
            r.id,
            date,
            from,
            subject,
            size,
            r.attachments.len()
        );
    }
    println!();
}
