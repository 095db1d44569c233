//! Sandgate - replay driver for the network mode controller.
//!
//! Loads a configuration, builds the controller, and feeds it
//! newline-delimited JSON [`Request`] records from a file or stdin, writing
//! the resulting responses as JSON lines to stdout. No real network I/O
//! takes place; this drives the decision pipeline end to end against
//! captured or synthetic traffic.

use clap::Parser;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use sandgate::config::{self, Config, Mode};
use sandgate::controller::Controller;
use sandgate::request::Request;

#[derive(Parser, Debug)]
#[command(
    name = "sandgate",
    version,
    about = "Network mode controller for dynamic malware analysis sandboxes"
)]
struct Cli {
    /// Path to the YAML configuration file; built-in safe defaults when
    /// omitted.
    #[arg(short, long, env = "SANDGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured mode (full, half, transparent).
    #[arg(short, long)]
    mode: Option<String>,

    /// NDJSON file of requests to replay; stdin when omitted.
    #[arg(short, long)]
    requests: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, env = "SANDGATE_LOG_JSON")]
    log_json: bool,

    /// Print the statistics summary on exit.
    #[arg(long)]
    summary: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::load_and_validate(path)?,
        None => Config::default(),
    };

    init_tracing(&config.logging.level, cli.log_json);

    if let Some(mode) = &cli.mode {
        config.mode = parse_mode(mode)?;
    }

    let controller = Controller::new(config)?;

    let reader: Box<dyn BufRead> = match &cli.requests {
        Some(path) => Box::new(BufReader::new(std::fs::File::open(path)?)),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(err) => {
                warn!(error = %err, "Skipping malformed request record");
                continue;
            }
        };

        match controller.handle_request(&req).await {
            Ok(resp) => {
                serde_json::to_writer(&mut out, &resp)?;
                out.write_all(b"\n")?;
            }
            Err(err) => {
                warn!(req_id = %req.id, error = %err, "Request handling failed");
            }
        }
    }

    if cli.summary {
        let stats = controller.stats();
        writeln!(out, "{}", serde_json::to_string_pretty(&stats)?)?;

        if controller.mode() == Mode::Transparent {
            if let Ok(summary) = controller.transparent_summary() {
                writeln!(out, "{summary}")?;
            }
        }
    }

    controller.close();
    Ok(())
}

fn parse_mode(value: &str) -> Result<Mode, String> {
    match value.to_ascii_lowercase().as_str() {
        "full" => Ok(Mode::Full),
        "half" => Ok(Mode::Half),
        "transparent" => Ok(Mode::Transparent),
        other => Err(format!(
            "unknown mode '{other}', expected full|half|transparent"
        )),
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
