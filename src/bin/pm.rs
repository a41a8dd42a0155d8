//! pm - client for the pm process supervisor
//!
//! Every command talks to the daemon over its control socket, starting
//! `pmd` in the background first if it is not running.
//!
//! # Usage
//!
//! ```text
//! pm create --name web --tag http -- python -m http.server 8080
//! pm list
//! pm start web            # by name
//! pm stop 1 2             # by id
//! pm stop --tag http      # by tag
//! pm restart web
//! pm run -n worker -- ./worker.sh   # create and start
//! pm delete web
//! pm ping
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pm_cli::daemon::{daemon_binary, ensure_daemon_running};
use pm_cli::DaemonClient;
use pm_core::{ProcId, ProcMetadata, ProcRecord, ProcStatus};
use pmd::config::Config;

// ============================================================================
// CLI Arguments
// ============================================================================

/// pm - background process manager
#[derive(Parser, Debug)]
#[command(name = "pm", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Fail instead of starting the daemon when it is not running
    #[arg(long, global = true)]
    no_autostart: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a new process (does not start it)
    Create(NewProcess),
    /// Register a new process and start it
    Run(NewProcess),
    /// List registered processes
    #[command(alias = "ls")]
    List,
    /// Start processes
    Start(Selection),
    /// Stop processes
    Stop(Selection),
    /// Stop processes, then start them again
    Restart(Selection),
    /// Delete stopped processes
    #[command(alias = "rm")]
    Delete(Selection),
    /// Check that the daemon answers
    Ping,
}

/// A process to register.
#[derive(ClapArgs, Debug)]
struct NewProcess {
    /// Name of the process; defaults to the program name
    #[arg(short, long, default_value = "")]
    name: String,

    /// Working directory; defaults to the current one
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Tag to attach (repeatable)
    #[arg(short, long = "tag")]
    tags: Vec<String>,

    /// Command to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl NewProcess {
    /// Builds the metadata sent to the daemon. A relative `--cwd` resolves
    /// against `current_dir`.
    fn into_metadata(self, current_dir: &Path) -> Result<ProcMetadata> {
        let cwd = match self.cwd {
            Some(dir) => current_dir.join(dir),
            None => current_dir.to_path_buf(),
        };
        let Some((program, rest)) = self.command.split_first() else {
            bail!("missing command");
        };
        Ok(ProcMetadata::new(self.name, program.clone())
            .with_args(rest.iter().cloned())
            .with_cwd(cwd)
            .with_tags(self.tags))
    }
}

/// Processes to act on: ids or names, plus every process carrying `--tag`.
#[derive(ClapArgs, Debug)]
struct Selection {
    /// Process ids or names
    targets: Vec<String>,

    /// Select every process with this tag (repeatable)
    #[arg(short, long = "tag")]
    tags: Vec<String>,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load().context("Failed to load configuration")?;
    if !args.no_autostart {
        ensure_daemon_running(&config.socket_path, &daemon_binary()).await?;
    }
    let mut client = DaemonClient::connect(&config.socket_path).await?;

    match args.command {
        Command::Create(new) => {
            let id = client.create(new.into_metadata(&current_dir()?)?).await?;
            println!("{id}");
        }
        Command::Run(new) => {
            let id = client.create(new.into_metadata(&current_dir()?)?).await?;
            let started = client.start(vec![id]).await?;
            report("started", &started);
        }
        Command::List => {
            let records = client.list().await?;
            print_table(&records);
        }
        Command::Start(selection) => {
            let ids = resolve(&mut client, &selection).await?;
            let started = client.start(ids).await?;
            report("started", &started);
        }
        Command::Stop(selection) => {
            let ids = resolve(&mut client, &selection).await?;
            let stopped = client.stop(ids).await?;
            report("stopped", &stopped);
        }
        Command::Restart(selection) => {
            let ids = resolve(&mut client, &selection).await?;
            client.stop(ids.clone()).await?;
            let started = client.start(ids).await?;
            report("restarted", &started);
        }
        Command::Delete(selection) => {
            let ids = resolve(&mut client, &selection).await?;
            let deleted = client.delete(ids).await?;
            report("deleted", &deleted);
        }
        Command::Ping => {
            let health = client.health_check().await?;
            println!(
                "pmd {} (PID {}) up {}s",
                health.version, health.pid, health.uptime_secs
            );
        }
    }

    client.disconnect().await?;
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Turns ids, names and tags into a list of ids, in id order.
///
/// Numeric targets are ids and are passed through so the daemon reports
/// unknown ones. A name or tag that matches nothing is an error.
async fn resolve(client: &mut DaemonClient, selection: &Selection) -> Result<Vec<ProcId>> {
    if selection.targets.is_empty() && selection.tags.is_empty() {
        bail!("nothing selected: pass ids, names or --tag");
    }

    let mut ids = BTreeSet::new();
    let mut names = Vec::new();
    for target in &selection.targets {
        match target.parse::<ProcId>() {
            Ok(id) => {
                ids.insert(id);
            }
            Err(_) => names.push(target.as_str()),
        }
    }

    if !names.is_empty() || !selection.tags.is_empty() {
        let records = client.list().await?;
        for name in names {
            let named: Vec<ProcId> = records
                .iter()
                .filter(|r| r.metadata.name == name)
                .map(|r| r.id)
                .collect();
            if named.is_empty() {
                bail!("no process named {name:?}");
            }
            ids.extend(named);
        }
        for tag in &selection.tags {
            let tagged: Vec<ProcId> = records
                .iter()
                .filter(|r| r.metadata.tags.contains(tag))
                .map(|r| r.id)
                .collect();
            if tagged.is_empty() {
                bail!("no process tagged {tag:?}");
            }
            ids.extend(tagged);
        }
    }

    Ok(ids.into_iter().collect())
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to read current directory")
}

fn report(verb: &str, ids: &[ProcId]) {
    let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
    println!("{verb}: {}", ids.join(" "));
}

fn print_table(records: &[ProcRecord]) {
    if records.is_empty() {
        println!("No processes.");
        return;
    }

    let now = Utc::now();
    println!(
        "{:>4}  {:<20} {:<16} {:>8} {:>7} {:>9} {:>9}  TAGS",
        "ID", "NAME", "STATUS", "PID", "CPU", "MEM", "UPTIME"
    );
    for record in records {
        let (pid, cpu, mem) = match record.status {
            ProcStatus::Running {
                pid, cpu, memory, ..
            } => (
                pid.to_string(),
                format!("{:.1}%", cpu as f64 / 100.0),
                format_bytes(memory),
            ),
            _ => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        let uptime = record
            .status
            .uptime(now)
            .map(|d| format_duration(d.num_seconds()))
            .unwrap_or_else(|| "-".to_string());
        let tags: Vec<&str> = record.metadata.tags.iter().map(String::as_str).collect();

        println!(
            "{:>4}  {:<20} {:<16} {:>8} {:>7} {:>9} {:>9}  {}",
            record.id,
            truncate(&record.metadata.name, 20),
            record.status.to_string(),
            pid,
            cpu,
            mem,
            uptime,
            tags.join(",")
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    match unit {
        0 => format!("{bytes}B"),
        _ => format!("{value:.1}{}", UNITS.get(unit).copied().unwrap_or("B")),
    }
}

fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m{}s", secs / 60, secs % 60),
        3600..=86_399 => format!("{}h{}m", secs / 3600, (secs % 3600) / 60),
        _ => format!("{}d{}h", secs / 86_400, (secs % 86_400) / 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0MiB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(-3), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(61), "1m1s");
        assert_eq!(format_duration(7260), "2h1m");
        assert_eq!(format_duration(90_000), "1d1h");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("web", 5), "web");
        assert_eq!(truncate("abcdefgh", 5), "abcd…");
    }

    #[test]
    fn test_create_parses_trailing_command() {
        let args = Args::try_parse_from([
            "pm", "create", "-n", "web", "-t", "http", "--", "python", "-m", "http.server",
        ])
        .unwrap();
        match args.command {
            Command::Create(new) => {
                assert_eq!(new.name, "web");
                assert_eq!(new.tags, ["http"]);
                assert_eq!(new.command, ["python", "-m", "http.server"]);
            }
            other => panic!("Expected Create, got {other:?}"),
        }
    }

    #[test]
    fn test_run_builds_metadata() {
        let args =
            Args::try_parse_from(["pm", "run", "--cwd", "srv", "--", "./worker.sh", "-v"]).unwrap();
        let new = match args.command {
            Command::Run(new) => new,
            other => panic!("Expected Run, got {other:?}"),
        };

        let metadata = new.into_metadata(Path::new("/home/me")).unwrap();
        assert_eq!(metadata.command, "./worker.sh");
        assert_eq!(metadata.args, ["-v"]);
        assert_eq!(metadata.cwd, Path::new("/home/me/srv"));
    }

    #[test]
    fn test_absolute_cwd_is_kept() {
        let new = NewProcess {
            name: String::new(),
            cwd: Some(PathBuf::from("/srv/app")),
            tags: Vec::new(),
            command: vec!["true".to_string()],
        };
        let metadata = new.into_metadata(Path::new("/home/me")).unwrap();
        assert_eq!(metadata.cwd, Path::new("/srv/app"));
    }

    #[test]
    fn test_restart_takes_selection() {
        let args = Args::try_parse_from(["pm", "restart", "web", "3", "-t", "http"]).unwrap();
        match args.command {
            Command::Restart(selection) => {
                assert_eq!(selection.targets, ["web", "3"]);
                assert_eq!(selection.tags, ["http"]);
            }
            other => panic!("Expected Restart, got {other:?}"),
        }
    }
}
