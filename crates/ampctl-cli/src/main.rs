use std::path::PathBuf;
use std::sync::Arc;

use ampctl_core::prelude::*;
use ampctl_core::protocol::{BoardOutcome, PortFailure};
use ampctl_core::settings::{read_csv_file, write_csv_file};
use ampctl_core::sim::SimOpener;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ampctl – configure and read back SiPM amplifier boards over USB serial.
#[derive(Parser, Debug)]
#[command(name = "ampctl", version)]
struct Cli {
    /// Talk to three simulated boards instead of real hardware.
    #[arg(long, global = true)]
    demo: bool,

    /// Configuration file (default: <config dir>/ampctl/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log wire traffic and per-command details.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List discovered boards in identifier order.
    List,
    /// Read every gain and threshold back from all boards.
    Read {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Apply a two-row settings CSV (gains, thresholds) and commit to the DAC.
    Apply {
        csv: PathBuf,
        /// Only apply to this board (position in `list`, from 0).
        #[arg(long)]
        board: Option<usize>,
    },
    /// Read one board and write its values as a settings CSV.
    Export {
        csv: PathBuf,
        /// Board position in `list`, from 0.
        #[arg(long)]
        board: usize,
    },
    /// Persist the applied values of every board to EEPROM (slow).
    Save {
        /// Required: saving overwrites the power-on values.
        #[arg(long)]
        yes: bool,
    },
    /// Toggle the status LED on every board.
    Led,
}

#[derive(Serialize)]
struct BoardReadout {
    identifier: u8,
    port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    channels: Option<Vec<ChannelValues>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eot_received: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .try_init()
        .context("initializing logging")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config =
        AmpConfig::load_or_default(cli.config.as_deref()).context("loading configuration")?;
    let demo = cli.demo;
    let (fleet, failures) = tokio::task::spawn_blocking(move || {
        if demo {
            let opener = SimOpener::demo(3);
            let ports = opener.ports();
            Fleet::discover(Arc::new(opener), &ports, config.session_timings())
        } else {
            Fleet::discover_on_host(&config)
        }
    })
    .await?;
    let fleet = Arc::new(fleet);

    match cli.cmd {
        Cmd::List => list(&fleet, &failures),
        Cmd::Read { json } => read(&fleet, json).await,
        Cmd::Apply { csv, board } => {
            require_boards(&fleet)?;
            let (gains, thresholds) =
                read_csv_file(&csv).with_context(|| format!("reading {}", csv.display()))?;
            let mut table = SettingsTable::new();
            match board {
                Some(index) => {
                    let target = board_at(&fleet, index)?;
                    table.import_board(index, target.channel_count, &gains, &thresholds);
                }
                None => table.import_all(fleet.boards(), &gains, &thresholds),
            }
            let outcomes = blocking(&fleet, move |f| f.apply_all(&table)).await?;
            for outcome in &outcomes {
                if let Ok(report) = &outcome.result {
                    println!(
                        "Board {:02}: {} writes acknowledged, {} abandoned",
                        outcome.board.identifier,
                        report.acknowledged,
                        report.faults.len()
                    );
                    for fault in &report.faults {
                        println!("  ch{} {}: {}", fault.channel, fault.kind, fault.error);
                    }
                }
            }
            check("apply", &outcomes)
        }
        Cmd::Export { csv, board } => {
            let target = board_at(&fleet, board)?.clone();
            let snapshot = {
                let session = fleet.session(&target);
                let count = target.channel_count;
                tokio::task::spawn_blocking(move || session.read_all(count)).await??
            };
            let mut table = SettingsTable::new();
            table.record_readout(board, &snapshot);
            let (gains, thresholds) = table.export_board(board, target.channel_count)?;
            write_csv_file(&csv, &gains, &thresholds)
                .with_context(|| format!("writing {}", csv.display()))?;
            println!(
                "Board {:02}: {} channels written to {}",
                target.identifier,
                target.channel_count,
                csv.display()
            );
            Ok(())
        }
        Cmd::Save { yes } => {
            if !yes {
                bail!("saving overwrites the values loaded at power-on; pass --yes to continue");
            }
            require_boards(&fleet)?;
            let cancel = fleet.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, abandoning pending EEPROM saves");
                    cancel.cancel();
                }
            });
            let outcomes = blocking(&fleet, |f| f.save_all()).await?;
            for outcome in outcomes.iter().filter(|o| o.result.is_ok()) {
                println!("Board {:02}: saved to EEPROM", outcome.board.identifier);
            }
            check("save", &outcomes)
        }
        Cmd::Led => {
            let outcomes = blocking(&fleet, |f| f.toggle_led_all()).await?;
            check("LED toggle", &outcomes)
        }
    }
}

fn list(fleet: &Fleet, failures: &[PortFailure]) -> Result<()> {
    for (index, board) in fleet.boards().iter().enumerate() {
        println!(
            "[{index}] Board {:02} on {} ({} channels)",
            board.identifier, board.port, board.channel_count
        );
    }
    for failure in failures {
        println!("    {}: {}", failure.port, failure.error);
    }
    if fleet.is_empty() {
        println!("No boards found");
    }
    Ok(())
}

async fn read(fleet: &Fleet, json: bool) -> Result<()> {
    let outcomes = fleet.read_all_concurrent().await;

    if json {
        let readouts: Vec<BoardReadout> = outcomes
            .iter()
            .map(|o| BoardReadout {
                identifier: o.board.identifier,
                port: o.board.port.clone(),
                channels: o.result.as_ref().ok().map(display_values),
                eot_received: o.result.as_ref().ok().map(|s| s.eot_received),
                error: o.result.as_ref().err().map(|e| e.to_string()),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&readouts)?);
    } else {
        for outcome in &outcomes {
            let Ok(snapshot) = &outcome.result else {
                continue;
            };
            println!(
                "Board {:02} on {}{}",
                outcome.board.identifier,
                outcome.board.port,
                if snapshot.eot_received { "" } else { " (no EOT)" }
            );
            println!("  {:>3} {:>5} {:>9}", "ch", "gain", "threshold");
            for (ch, values) in display_values(snapshot).iter().enumerate() {
                println!("  {ch:>3} {:>5} {:>9}", values.gain, values.threshold);
            }
        }
    }
    check("read", &outcomes)
}

/// Run a fleet operation on the blocking pool
async fn blocking<T, F>(fleet: &Arc<Fleet>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Fleet) -> T + Send + 'static,
{
    let fleet = fleet.clone();
    Ok(tokio::task::spawn_blocking(move || op(&fleet)).await?)
}

fn board_at(fleet: &Fleet, index: usize) -> Result<&Board> {
    fleet.boards().get(index).with_context(|| {
        format!(
            "no board at position {index} ({} board(s) found)",
            fleet.len()
        )
    })
}

fn require_boards(fleet: &Fleet) -> Result<()> {
    if fleet.is_empty() {
        bail!("no boards found");
    }
    Ok(())
}

/// Fail when any board's operation failed; details are already logged
fn check<T>(what: &str, outcomes: &[BoardOutcome<T>]) -> Result<()> {
    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if failed > 0 {
        bail!("{what} failed on {failed} of {} board(s)", outcomes.len());
    }
    Ok(())
}
