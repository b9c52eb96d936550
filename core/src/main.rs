//! RBPF-SLAM: replay multibeam surveys through the particle filter, or generate synthetic ones.
//!
//! - `run`: replay odometry and ping CSV logs through the filter, write per-update diagnostics, and
//!   optionally archive every particle's trajectory and map.
//! - `simulate`: generate a lawnmower survey over a synthetic seabed and write the logs, the mesh, and
//!   the configuration used.
//! - `config`: write a template configuration file (TOML/JSON/YAML by extension).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use rbpf_slam::beams::{MeshBeamSimulator, SoundSpeedProfile};
use rbpf_slam::config::RbpfConfig;
use rbpf_slam::map_model::{MapModel, SparseGpMap};
use rbpf_slam::messages::{Event, EventStream, read_odometry_csv, read_pings_csv};
use rbpf_slam::rbpf::{DIAGNOSTICS_HEADER, FilterOutput, RbpfSlam};
use rbpf_slam::sim::SurveyPlan;
use rbpf_slam::transforms::{SensorTransforms, StaticTransformTable};

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Rao-Blackwellized particle filter SLAM for multibeam surveys.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Replay odometry and ping logs through the filter")]
    Run(RunArgs),
    #[command(about = "Generate a synthetic lawnmower survey")]
    Simulate(SimulateArgs),
    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig {
        /// Output path; format chosen by extension
        #[arg(short, long, default_value = "rbpf.toml")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Filter configuration (TOML/JSON/YAML); defaults are used if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Odometry CSV: time,x,y,z,roll,pitch,yaw,vx,vy,vz,wx,wy,wz
    #[arg(long)]
    odometry: PathBuf,

    /// Ping CSV: time,beam,x,y,z (sonar frame)
    #[arg(long)]
    pings: PathBuf,

    /// Map model every particle starts from
    #[arg(long)]
    prior_map: Option<PathBuf>,

    /// Diagnostics CSV, one row per measurement update
    #[arg(short, long, default_value = "diagnostics.csv")]
    output: PathBuf,

    /// Write the trajectory archive under the configured storage path
    #[arg(long)]
    archive: bool,

    /// Directory to save every particle's final map into
    #[arg(long)]
    maps: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Filter configuration supplying sonar geometry and frames
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for odometry.csv, pings.csv, seabed.json, and config.toml
    #[arg(long, default_value = "survey")]
    output_dir: PathBuf,

    /// Random seed; defaults to the configured seed
    #[arg(long)]
    seed: Option<u64>,

    /// Number of survey legs
    #[arg(long, default_value_t = 4)]
    legs: usize,

    /// Length of each leg in metres
    #[arg(long, default_value_t = 100.0)]
    leg_length: f64,

    /// Seabed mesh resolution (cells per side)
    #[arg(long, default_value_t = 64)]
    mesh_cells: usize,
}

/// Initialize the logger with the specified level and optional log file.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("opening log file {}", log_path.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<RbpfConfig> {
    match path {
        Some(p) => RbpfConfig::from_file(p)
            .with_context(|| format!("loading configuration {}", p.display())),
        None => {
            info!("No configuration given; using defaults");
            Ok(RbpfConfig::default())
        }
    }
}

fn sensor_transforms(config: &RbpfConfig) -> SensorTransforms {
    let table = StaticTransformTable::from_transforms(&config.static_transforms);
    SensorTransforms::resolve(&table, &config.frames)
}

fn write_diagnostics(path: &Path, outputs: &[FilterOutput]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut header = vec!["stamp"];
    header.extend(DIAGNOSTICS_HEADER);
    header.extend(["ess", "missed", "resampled"]);
    wtr.write_record(&header)?;
    for out in outputs {
        let mut row: Vec<String> = vec![out.stamp.to_string()];
        row.extend(out.diagnostics.to_array().iter().map(|v| v.to_string()));
        row.push(out.ess.to_string());
        row.push(out.missed.to_string());
        row.push(u8::from(out.resampled).to_string());
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

fn run(args: &RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let odometry = read_odometry_csv(&args.odometry)
        .with_context(|| format!("reading odometry {}", args.odometry.display()))?;
    let pings = read_pings_csv(&args.pings)
        .with_context(|| format!("reading pings {}", args.pings.display()))?;
    info!(
        "Loaded {} odometry samples and {} pings",
        odometry.len(),
        pings.len()
    );
    let initial_pose = odometry
        .first()
        .map(|o| o.pose)
        .context("odometry log is empty")?;

    let prior = match &args.prior_map {
        Some(path) => SparseGpMap::load(path)
            .with_context(|| format!("loading prior map {}", path.display()))?,
        None => SparseGpMap::new(),
    };
    let transforms = sensor_transforms(&config);
    let mut slam = RbpfSlam::new(config, transforms, prior, initial_pose)?;

    let stream = EventStream::build(odometry, pings);
    let mut outputs = Vec::new();
    for event in stream.iter() {
        match event {
            Event::Odometry(odom) => outputs.extend(slam.handle_odometry(odom)),
            Event::Ping(ping) => slam.handle_ping(ping),
        }
    }
    slam.finish_survey();
    let installed = slam.wait_for_training();
    info!("Joined training jobs; {installed} maps updated after the survey");

    let resamples = outputs.iter().filter(|o| o.resampled).count();
    info!(
        "Processed {} updates, resampled {} times",
        outputs.len(),
        resamples
    );
    if let Some(last) = outputs.last() {
        let d = &last.diagnostics;
        info!(
            "Final position error: filter {:.3} m, dead reckoning {:.3} m",
            (d.estimate - d.ground_truth).norm(),
            (d.dead_reckoning - d.ground_truth).norm()
        );
        if last.degraded {
            warn!("Sensor transforms were degraded; positions are unreliable");
        }
    }
    write_diagnostics(&args.output, &outputs)?;
    info!("Diagnostics written to {}", args.output.display());

    if args.archive {
        let summary = slam.save_trajectories()?;
        info!("Archive: {} files", summary.files_written());
    }
    if let Some(dir) = &args.maps {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        for i in 0..slam.particles().len() {
            let path = dir.join(format!("particle_{i}.json"));
            slam.save_particle_map(i, &path)
                .with_context(|| format!("saving map {}", path.display()))?;
        }
        info!("Saved {} particle maps to {}", slam.particles().len(), dir.display());
    }
    Ok(())
}

fn simulate(args: &SimulateArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let plan = SurveyPlan {
        legs: args.legs,
        leg_length: args.leg_length,
        ..SurveyPlan::default()
    };
    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    let mesh = plan.seabed(args.mesh_cells);
    let mesh_path = args.output_dir.join("seabed.json");
    mesh.save(&mesh_path)
        .with_context(|| format!("writing {}", mesh_path.display()))?;

    let simulator = MeshBeamSimulator::new(mesh, SoundSpeedProfile::default());
    let seed = args.seed.unwrap_or(config.seed);
    let survey = plan.generate(&simulator, &sensor_transforms(&config), &config, seed);
    let (odom_path, ping_path) = survey.write_csv(&args.output_dir)?;
    let config_path = args.output_dir.join("config.toml");
    config.to_file(&config_path)?;

    info!(
        "Survey written: {}, {}, {}, {}",
        odom_path.display(),
        ping_path.display(),
        mesh_path.display(),
        config_path.display()
    );
    Ok(())
}

fn create_config_file(output: &Path) -> Result<()> {
    RbpfConfig::default()
        .to_file(output)
        .with_context(|| format!("writing {}", output.display()))?;
    info!("Template configuration written to {}", output.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match &cli.command {
        Command::Run(args) => run(args),
        Command::Simulate(args) => simulate(args),
        Command::CreateConfig { output } => create_config_file(output),
    }
}
