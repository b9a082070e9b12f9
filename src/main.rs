use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use ipintel::jobs::{JobRequest, JobStore, JsonFileStore, ScanMode, Scheduler};
use ipintel::output::{OutputConfig, OutputFormat, OutputManager};
use ipintel::{ExternalTool, ScannerConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn cli() -> Command {
    let format_arg = Arg::new("format")
        .short('f')
        .long("format")
        .value_name("FORMAT")
        .help("Report format")
        .value_parser(["text", "json", "csv"])
        .default_value("text")
        .global(true);

    Command::new("ipintel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Reachability and exposure scanning with risk assessment")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(format_arg)
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Write the report to FILE instead of stdout")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default: ~/.ipintel.toml)")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("no-color")
                .long("no-color")
                .help("Disable colored output")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug logging")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("scan")
                .about("Scan targets and report their exposure")
                .arg(
                    Arg::new("targets")
                        .value_name("TARGET")
                        .help("Hostnames, IP addresses or URLs")
                        .num_args(0..)
                        .required_unless_present("input-file"),
                )
                .arg(
                    Arg::new("input-file")
                        .short('i')
                        .long("input-file")
                        .value_name("FILE")
                        .help("Read targets from FILE, one per line")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("ai")
                        .long("ai")
                        .help("Ask the AI summarizer for the risk verdict")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("nmap")
                        .long("nmap")
                        .help("Run an nmap service scan per target")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("nikto")
                        .long("nikto")
                        .help("Run nikto against targets with a web surface")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("pool")
                        .long("pool")
                        .value_name("N")
                        .help("Worker pool size")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .value_name("MS")
                        .help("Per-port probe timeout in milliseconds")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("show-closed")
                        .long("show-closed")
                        .help("List closed ports in text reports")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show a stored job")
                .arg(Arg::new("token").value_name("TOKEN").required(true)),
        )
        .subcommand(Command::new("history").about("List stored jobs"))
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "ipintel=debug" } else { "ipintel=warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

fn load_config(matches: &ArgMatches) -> Result<ScannerConfig> {
    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => ScannerConfig::from_toml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ScannerConfig::load_default_config(),
    };
    Ok(config)
}

fn output_manager(matches: &ArgMatches, show_closed: bool) -> Result<OutputManager> {
    let format = matches
        .get_one::<String>("format")
        .map(|f| f.parse::<OutputFormat>())
        .transpose()
        .map_err(anyhow::Error::msg)?
        .unwrap_or(OutputFormat::Text);

    Ok(OutputManager::new(OutputConfig {
        format,
        file: matches.get_one::<PathBuf>("output").cloned(),
        colored: !matches.get_flag("no-color"),
        show_closed,
    }))
}

/// Targets from a file: one per line, blank lines and `#` comments skipped
fn read_targets_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading targets from {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

async fn run_scan(matches: &ArgMatches, scan: &ArgMatches) -> Result<()> {
    let mut config = load_config(matches)?;
    if let Some(pool) = scan.get_one::<usize>("pool") {
        config = config.with_worker_pool_size(*pool);
    }
    if let Some(timeout) = scan.get_one::<u64>("timeout") {
        config = config.with_probe_timeout(*timeout);
    }

    let mut targets: Vec<String> = scan
        .get_many::<String>("targets")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if let Some(path) = scan.get_one::<PathBuf>("input-file") {
        targets.extend(read_targets_file(path)?);
    }
    if targets.is_empty() {
        bail!("no targets given");
    }

    let mode = if scan.get_flag("ai") {
        if config.ai.api_key().is_none() {
            eprintln!(
                "{} {} is not set; the rules-based verdict will be used",
                "warning:".yellow().bold(),
                config.ai.api_key_env
            );
        }
        ScanMode::AiEnhanced
    } else {
        ScanMode::Standard
    };
    let mut tools = Vec::new();
    if scan.get_flag("nmap") {
        tools.push(ExternalTool::Nmap);
    }
    if scan.get_flag("nikto") {
        tools.push(ExternalTool::Nikto);
    }

    let scheduler = Scheduler::from_config(&config).context("starting scheduler")?;
    let total = targets.len() as u64;
    let token = scheduler
        .submit_request(JobRequest::new(targets, mode).with_tools(tools))
        .await?;
    eprintln!("{} {}", "Job:".bright_white().bold(), token.bright_yellow());

    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("progress template")?
            .progress_chars("=>-"),
    );
    progress.enable_steady_tick(Duration::from_millis(120));

    let status = scheduler.status_service();
    let job = loop {
        let job = status.get_status(&token).await?;
        progress.set_position(job.completed_targets as u64);
        progress.set_message(job.status.to_string());
        if job.is_terminal() {
            break job;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };
    progress.finish_and_clear();

    output_manager(matches, scan.get_flag("show-closed"))?.write_job(&job)?;
    if let Some(error) = &job.error {
        bail!("job {} failed: {}", job.token, error);
    }
    Ok(())
}

async fn run_status(matches: &ArgMatches, token: &str) -> Result<()> {
    let config = load_config(matches)?;
    let store = JsonFileStore::open_default(&config)?;
    match store.load(token).await? {
        Some(job) => {
            output_manager(matches, false)?.write_job(&job)?;
            Ok(())
        }
        None => bail!("no stored job with token {}", token),
    }
}

fn run_history(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let store = JsonFileStore::open_default(&config)?;
    let summaries = store.list()?;
    output_manager(matches, false)?.write_history(&summaries)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("verbose"));

    match matches.subcommand() {
        Some(("scan", scan)) => run_scan(&matches, scan).await,
        Some(("status", status)) => {
            let token = status
                .get_one::<String>("token")
                .context("missing token")?;
            run_status(&matches, token).await
        }
        Some(("history", _)) => run_history(&matches),
        _ => bail!("unknown subcommand"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn scan_flags_parse() {
        let matches = cli()
            .try_get_matches_from(["ipintel", "scan", "a.example", "b.example", "--ai", "--nmap", "-f", "json"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("format").map(String::as_str), Some("json"));
        let (name, scan) = matches.subcommand().unwrap();
        assert_eq!(name, "scan");
        assert!(scan.get_flag("ai"));
        assert!(scan.get_flag("nmap"));
        assert!(!scan.get_flag("nikto"));
        assert_eq!(scan.get_many::<String>("targets").unwrap().count(), 2);
    }

    #[test]
    fn scan_needs_targets_or_file() {
        assert!(cli().try_get_matches_from(["ipintel", "scan"]).is_err());
        assert!(cli()
            .try_get_matches_from(["ipintel", "scan", "-i", "targets.txt"])
            .is_ok());
    }

    #[test]
    fn targets_file_skips_comments() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# edge hosts\napi.example\n\n  10.0.0.5  \n#old.example").unwrap();
        let targets = read_targets_file(file.path()).unwrap();
        assert_eq!(targets, vec!["api.example", "10.0.0.5"]);
    }
}
