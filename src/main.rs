//! CLI entry point for `mailstash`.

use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::{CommandFactory, Parser, Subcommand};

use mailstash::cleanup::{RegistrationState, SweepReport};
use mailstash::config::{self, Config};
use mailstash::parser::eml;
use mailstash::provider::{provide_bytes, DecodedContentSource, FileProvider};
use mailstash::signal::{PressureLevel, Signal, SignalBus};

/// How long the `signals` session waits for a triggered sweep.
const SWEEP_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "mailstash",
    version,
    about = "Ephemeral decoded-content file service for mail clients"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override the cache directory (temp files and logs live here)
    #[arg(long, global = true, value_name = "DIR", env = "MAILSTASH_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Store(StoreCommand),
    /// Print the effective configuration as TOML
    Config {
        /// Write it to the config file location
        #[arg(long)]
        init: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

/// Commands that work on the temp file store.
#[derive(Subcommand)]
enum StoreCommand {
    /// Copy a file into the store and print its reference
    Provide {
        path: PathBuf,
        /// MIME type of the decoded content
        #[arg(short, long)]
        mime_type: String,
        /// Transfer encoding of the file's bytes (base64, quoted-printable)
        #[arg(short, long)]
        encoding: Option<String>,
    },
    /// Stage an attachment of an .eml message and print its reference
    Stage {
        path: PathBuf,
        /// Attachment index (see --list)
        #[arg(short, long, default_value_t = 0)]
        part: usize,
        /// List stageable parts instead of staging one
        #[arg(long)]
        list: bool,
        #[arg(long)]
        json: bool,
    },
    /// Write the decoded content behind a reference to stdout
    Cat { reference: String },
    /// Print the MIME type of a reference
    Type { reference: String },
    /// List files currently in the store
    List {
        #[arg(long)]
        json: bool,
    },
    /// Delete files older than the threshold now
    Sweep {
        #[arg(long)]
        json: bool,
    },
    /// Read host signals from stdin: `idle`, `trim <level>`,
    /// `provide <file> <mime> [encoding]`, `state`, `quit`
    Signals,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config();
    if let Some(dir) = cli.cache_dir.clone() {
        config.general.cache_dir = Some(dir);
    }

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Store(command) => run_store_command(command, &config),
        Commands::Config { init } => cmd_config(&config, init),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

fn run_store_command(command: StoreCommand, config: &Config) -> anyhow::Result<()> {
    let bus = SignalBus::spawn()?;
    let provider = FileProvider::new(config, bus.clone());
    match command {
        StoreCommand::Provide {
            path,
            mime_type,
            encoding,
        } => cmd_provide(&provider, &path, &mime_type, encoding.as_deref()),
        StoreCommand::Stage {
            path,
            part,
            list,
            json,
        } => cmd_stage(&provider, &path, part, list, json),
        StoreCommand::Cat { reference } => cmd_cat(&provider, &reference),
        StoreCommand::Type { reference } => cmd_type(&provider, &reference),
        StoreCommand::List { json } => cmd_list(&provider, json),
        StoreCommand::Sweep { json } => cmd_sweep(&provider, json),
        StoreCommand::Signals => cmd_signals(&provider, &bus, config),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_path = config::log_file_path(config);
    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_name = log_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "mailstash.log".into());
        let file_appender = tracing_appender::rolling::never(&log_dir, file_name);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn cmd_config(config: &Config, init: bool) -> anyhow::Result<()> {
    if init {
        let path = config::save_config(config)?;
        println!("Wrote {}", path.display());
    } else {
        print!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailstash", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::stdout().write_all(&buf)?;
    Ok(())
}

fn cmd_provide(
    provider: &FileProvider,
    path: &Path,
    mime_type: &str,
    encoding: Option<&str>,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;
    let reference = provide_bytes(provider, &bytes, encoding, mime_type)?;
    println!("{reference}");
    Ok(())
}

fn cmd_stage(
    provider: &FileProvider,
    path: &Path,
    part: usize,
    list: bool,
    json: bool,
) -> anyhow::Result<()> {
    let raw = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;

    if list {
        let parts = eml::list_parts(&raw)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&parts)?);
        } else {
            for p in &parts {
                println!(
                    "{:>3}  {:<40} {:<30} {:<16} {}",
                    p.index,
                    p.filename,
                    p.content_type,
                    p.encoding.as_deref().unwrap_or("-"),
                    humansize::format_size(p.encoded_len as u64, humansize::BINARY)
                );
            }
        }
        return Ok(());
    }

    let staged = eml::stage_part(provider, &raw, part)?;
    if json {
        let out = serde_json::json!({
            "reference": staged.reference.as_str(),
            "part": staged.part,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}", staged.reference);
    }
    Ok(())
}

fn cmd_cat(provider: &FileProvider, reference: &str) -> anyhow::Result<()> {
    let reference = provider.parse_reference(reference)?;
    let mut stream = provider.open_for_read(&reference)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    out.flush()?;
    stream.close();
    Ok(())
}

fn cmd_type(provider: &FileProvider, reference: &str) -> anyhow::Result<()> {
    let reference = provider.parse_reference(reference)?;
    println!("{}", provider.media_type_of(&reference)?);
    Ok(())
}

fn cmd_list(provider: &FileProvider, json: bool) -> anyhow::Result<()> {
    let now = SystemTime::now();
    let threshold = provider.scheduler().threshold();
    let mut rows = Vec::new();
    for file in provider.store().list_files() {
        let (Ok(modified), Ok(size)) = (file.modified(), file.len()) else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or_default();
        rows.push(serde_json::json!({
            "name": file.name(),
            "size": size,
            "modified": chrono::DateTime::<chrono::Local>::from(modified).to_rfc3339(),
            "age_secs": age.as_secs(),
            "expired": age > threshold,
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No temp files in {}", provider.store().directory().display());
        return Ok(());
    }
    for row in &rows {
        let size = row["size"].as_u64().unwrap_or(0);
        let age = row["age_secs"].as_u64().unwrap_or(0);
        println!(
            "{:<40} {:>10}  {:>4}m{:02}s{}",
            row["name"].as_str().unwrap_or("?"),
            humansize::format_size(size, humansize::BINARY),
            age / 60,
            age % 60,
            if row["expired"].as_bool() == Some(true) {
                "  (expired)"
            } else {
                ""
            }
        );
    }
    Ok(())
}

fn cmd_sweep(provider: &FileProvider, json: bool) -> anyhow::Result<()> {
    let report = provider.scheduler().sweep_now();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SweepReport) {
    println!(
        "Deleted {} file(s), freed {}; {} too young, {} failed",
        report.deleted,
        humansize::format_size(report.bytes_freed, humansize::BINARY),
        report.kept_young,
        report.failed
    );
}

/// Drive the cleanup state machine from stdin.
fn cmd_signals(
    provider: &FileProvider,
    bus: &Arc<SignalBus>,
    config: &Config,
) -> anyhow::Result<()> {
    let scheduler = provider.scheduler();
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["quit"] | ["exit"] => break,
            ["state"] => {}
            ["idle"] => {
                let before = scheduler.sweeps_completed();
                if scheduler.state() == RegistrationState::Registered {
                    bus.deliver(Signal::DeviceIdle);
                    bus.flush();
                    scheduler.wait_for_sweeps(before + 1, SWEEP_WAIT);
                } else {
                    println!("No cleanup listener registered, idle ignored");
                }
            }
            ["trim", level] => match level.parse::<PressureLevel>() {
                Ok(level) => {
                    let before = scheduler.sweeps_completed();
                    bus.deliver(Signal::MemoryPressure(level));
                    bus.flush();
                    if level >= config.cleanup.pressure_threshold {
                        scheduler.wait_for_sweeps(before + 1, SWEEP_WAIT);
                    }
                }
                Err(e) => {
                    eprintln!("{e}");
                    continue;
                }
            },
            ["provide", path, mime_type, rest @ ..] => {
                let encoding = rest.first().copied();
                if let Err(e) = cmd_provide(provider, Path::new(path), mime_type, encoding) {
                    eprintln!("{e}");
                    continue;
                }
            }
            _ => {
                eprintln!("Unknown command: {line}");
                continue;
            }
        }
        let state = match scheduler.state() {
            RegistrationState::Registered => "registered",
            RegistrationState::Unregistered => "unregistered",
        };
        println!(
            "cleanup listener: {state}, {} file(s) in store",
            provider.store().list_files().len()
        );
    }
    Ok(())
}
