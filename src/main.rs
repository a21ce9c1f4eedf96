//! Simulator entry point.
//!
//! Loads the settings file given as the first argument (default
//! `config.json`), then executes the configured number of independent
//! runs. Each run writes its JSON-lines event log to
//! `<exec_outputDir>/output_run_<id>.jsonl`, settings snapshot first.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use env_logger::Builder;
use log::{LevelFilter, info};

use sixtisch_sim::simlog::LogSink;
use sixtisch_sim::{Settings, run_simulation};

fn main() -> Result<()> {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("sixtisch_sim"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    let config_path =
        std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.json"));
    let settings = Settings::load(&config_path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("loading settings from {}", config_path.display()))?;

    let output_dir = Path::new(&settings.exec_output_dir);
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;

    info!(
        "starting {} run(s): {} motes, {} slotframes per run",
        settings.exec_num_runs, settings.exec_num_motes, settings.exec_num_slotframes_per_run
    );

    for run_id in 0..settings.exec_num_runs {
        let log_path = output_dir.join(format!("output_run_{}.jsonl", run_id));
        let file = File::create(&log_path)
            .with_context(|| format!("creating log file {}", log_path.display()))?;
        let sink = LogSink::Writer(Box::new(BufWriter::new(file)));

        let started = Instant::now();
        run_simulation(settings.clone(), run_id, sink).map_err(anyhow::Error::msg)?;
        info!("run {} finished in {:.2?}, log: {}", run_id, started.elapsed(), log_path.display());
    }

    Ok(())
}
