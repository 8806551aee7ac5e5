use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use delay_drift::calibration::{
    corrected_setpoints, render_centroid_chart, render_centroid_table, smooth_table,
    CalibrationChanges, CalibrationStore, CURRENT,
};
use delay_drift::testing::SimBench;
use delay_drift::{init_logging, telemetry, DelayMacro, EngineConfig};

#[derive(Parser, Debug)]
#[command(
    name = "drift_cli",
    about = "Drift calibration harness for the compound delay axis"
)]
struct Cli {
    /// Directory holding saved calibrations (defaults to the install location)
    #[arg(long)]
    calibration_dir: Option<PathBuf>,
    /// Engine configuration JSON
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Calibrate against simulated hardware and print the result
    Simulate {
        #[arg(long, allow_negative_numbers = true)]
        start: f64,
        #[arg(long, allow_negative_numbers = true)]
        stop: f64,
        #[arg(long, allow_negative_numbers = true)]
        step: f64,
        /// Number of correctors (1 = x only, 2 = x and y)
        #[arg(long, default_value_t = 2)]
        correctors: usize,
        /// Centroid drift in pixels per delay unit along x
        #[arg(long, default_value_t = 0.1, allow_negative_numbers = true)]
        drift_x: f64,
        /// Centroid drift in pixels per delay unit along y
        #[arg(long, default_value_t = 0.05, allow_negative_numbers = true)]
        drift_y: f64,
        /// Uniform probe noise amplitude in pixels
        #[arg(long, default_value_t = 0.0)]
        noise: f64,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Also save under this name
        #[arg(long)]
        save: Option<String>,
        /// Print a chart of the scan
        #[arg(long)]
        chart: bool,
    },
    /// Print a saved calibration
    Show {
        #[arg(default_value = CURRENT)]
        name: String,
    },
    /// Print corrected setpoints for a target
    Setpoints {
        #[arg(default_value = CURRENT)]
        name: String,
        #[arg(long, allow_negative_numbers = true)]
        target: f64,
    },
    /// Savitzky-Golay smooth a saved correction table
    Smooth {
        #[arg(default_value = CURRENT)]
        name: String,
        #[arg(long)]
        window: Option<usize>,
        #[arg(long)]
        polyorder: Option<usize>,
        /// Name or path for the smoothed calibration
        #[arg(long)]
        save: String,
    },
    /// List saved calibrations
    List,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = cli
        .config
        .as_ref()
        .map(EngineConfig::load_from_file)
        .unwrap_or_default();
    if let Some(dir) = cli.calibration_dir {
        config.storage.directory = Some(dir);
    }
    let store = CalibrationStore::from_config(&config.storage);

    match cli.command {
        Commands::Simulate {
            start,
            stop,
            step,
            correctors,
            drift_x,
            drift_y,
            noise,
            seed,
            save,
            chart,
        } => {
            let bench = SimBenchArgs {
                correctors,
                drift_x,
                drift_y,
                noise,
                seed,
            };
            run_simulate(config, store, bench, (start, stop, step), save, chart)
        }
        Commands::Show { name } => run_show(&store, &name),
        Commands::Setpoints { name, target } => run_setpoints(&store, &name, target),
        Commands::Smooth {
            name,
            window,
            polyorder,
            save,
        } => run_smooth(&config, &store, &name, window, polyorder, &save),
        Commands::List => run_list(&store),
    }
}

struct SimBenchArgs {
    correctors: usize,
    drift_x: f64,
    drift_y: f64,
    noise: f64,
    seed: u64,
}

fn run_simulate(
    config: EngineConfig,
    store: CalibrationStore,
    args: SimBenchArgs,
    (start, stop, step): (f64, f64, f64),
    save: Option<String>,
    chart: bool,
) -> Result<ExitCode> {
    let names = match args.correctors {
        1 => vec!["corrector_x"],
        2 => vec!["corrector_x", "corrector_y"],
        n => bail!("simulate supports 1 or 2 correctors, got {n}"),
    };

    let mut bench = SimBench::new(args.drift_x, args.drift_y)
        .corrector("corrector_x", 0.0, -0.5, 0.0)
        .corrector("corrector_y", 0.0, 0.0, 0.25);
    if args.noise > 0.0 {
        bench = bench.noise(args.seed, args.noise);
    }
    let (hardware, handles) = bench.build();

    let delay = DelayMacro::with_store(hardware, config, store);
    let calibration = delay
        .calibrate(start, stop, step, &names, false)
        .context("simulated calibration failed")?;

    print!("{}", calibration.summary());
    print!("{}", delay.view_centroids()?);
    if chart {
        print!("{}", delay.graph_centroids(60, 15)?);
    }
    if let Some(name) = save {
        let path = delay.save_calibration(&name)?;
        println!("saved {}", path.display());
    }

    let snapshot = telemetry::hub().snapshot();
    println!(
        "moves: {} probe samples: {} events: {}",
        handles.total_moves(),
        handles.probe_samples(),
        snapshot.total_events
    );
    Ok(ExitCode::from(0))
}

fn run_show(store: &CalibrationStore, name: &str) -> Result<ExitCode> {
    let calibration = store
        .load(name)
        .with_context(|| format!("loading calibration {name}"))?;
    print!("{}", calibration.summary());

    let table = calibration.correction_table();
    println!("{:>14} {}", "target", calibration.correctors().join(" "));
    for (target, row) in table.targets().iter().zip(table.rows()) {
        let cells: Vec<String> = row.iter().map(|d| format!("{d:>14.6e}")).collect();
        println!("{target:>14.6} {}", cells.join(" "));
    }
    print!("{}", render_centroid_table(calibration.scan_record()));
    print!("{}", render_centroid_chart(calibration.scan_record(), 60, 12));
    Ok(ExitCode::from(0))
}

fn run_setpoints(store: &CalibrationStore, name: &str, target: f64) -> Result<ExitCode> {
    let calibration = store
        .load(name)
        .with_context(|| format!("loading calibration {name}"))?;
    let setpoints = corrected_setpoints(&calibration, target)?;
    for (corrector, setpoint) in calibration.correctors().iter().zip(setpoints) {
        println!("{corrector} {setpoint}");
    }
    Ok(ExitCode::from(0))
}

fn run_smooth(
    config: &EngineConfig,
    store: &CalibrationStore,
    name: &str,
    window: Option<usize>,
    polyorder: Option<usize>,
    save: &str,
) -> Result<ExitCode> {
    let calibration = store
        .load(name)
        .with_context(|| format!("loading calibration {name}"))?;
    let table = smooth_table(
        calibration.correction_table(),
        window.unwrap_or(config.smoothing.window_length),
        polyorder.unwrap_or(config.smoothing.polyorder),
    )?;
    let smoothed = calibration.reconfigure(CalibrationChanges::new().correction_table(table))?;
    let path = store
        .save(&smoothed, save)
        .with_context(|| format!("saving {save}"))?;
    println!("saved {}", path.display());
    Ok(ExitCode::from(0))
}

fn run_list(store: &CalibrationStore) -> Result<ExitCode> {
    let names = store.list()?;
    if names.is_empty() {
        println!("No calibrations under {}", store.root().display());
        return Ok(ExitCode::from(0));
    }
    for name in names {
        println!("{name}");
    }
    Ok(ExitCode::from(0))
}
