use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{Context, Result};

use camrig::{Reconstructor, Session, WorkspacePaths};
use camrig_types::{ImagePoints, Port};

#[derive(Parser)]
#[command(name = "camrig", about = "Multi-camera calibration and triangulation")]
struct Cli {
    /// Workspace directory containing config.toml
    #[arg(long, short = 'w')]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Calibrate one camera's intrinsics from a point_data.csv of board
    /// observations.
    CalibrateIntrinsics {
        /// Camera port to calibrate.
        #[arg(long)]
        port: u8,
        /// Observation table; defaults to calibration/intrinsic/point_data.csv
        #[arg(long)]
        points: Option<PathBuf>,
        /// Maximum acceptable reprojection RMSE in pixels.
        #[arg(long, default_value_t = 1.0)]
        epsilon: f64,
    },
    /// Estimate stereo pairs, initialize the array, and refine with bundle
    /// adjustment.
    CalibrateExtrinsics {
        /// Observation table; defaults to calibration/extrinsic/point_data.csv
        #[arg(long)]
        points: Option<PathBuf>,
        /// Run the cull / re-optimize improvement loop.
        #[arg(long)]
        culling: bool,
        /// Sync index for gauge alignment against object coordinates.
        #[arg(long, default_value_t = 0)]
        alignment_index: u32,
        /// Use only every n-th sync index in the bundle adjustment.
        #[arg(long, default_value_t = 1)]
        nth: u32,
    },
    /// Triangulate a tracker's recorded 2-D output into xyz CSV files.
    Reconstruct {
        /// Recording name under recordings/.
        #[arg(long)]
        session: String,
        /// Tracker name (subdirectory and file suffix).
        #[arg(long)]
        tracker: String,
    },
    /// Report sync assignments for a recorded frame_time_history.csv.
    SyncReport {
        /// Recording name under recordings/.
        #[arg(long)]
        session: String,
    },
}

fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "camrig=info,frame_sync=info,bundle_adj=info,pose_graph=info,gridcal=info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = WorkspacePaths::new(&cli.workspace);

    match cli.command {
        Command::CalibrateIntrinsics {
            port,
            points,
            epsilon,
        } => {
            let mut session = Session::load(paths.clone())?;
            let points_path = points
                .unwrap_or_else(|| paths.intrinsic_dir().join("point_data.csv"));
            let table = ImagePoints::from_csv(&points_path)
                .with_context(|| format!("loading {}", points_path.display()))?;
            let cfg = gridcal::IntrinsicConfig {
                epsilon_intrinsic: epsilon,
                ..Default::default()
            };
            let fit = session.calibrate_intrinsics(&table, Port(port), &cfg)?;
            println!(
                "port {port}: RMSE {} px over {} views",
                fit.rmse, fit.grid_count
            );
        }
        Command::CalibrateExtrinsics {
            points,
            culling,
            alignment_index,
            nth,
        } => {
            let mut session = Session::load(paths.clone())?;
            let points_path = points.unwrap_or_else(|| paths.point_data());
            let table = ImagePoints::from_csv(&points_path)
                .with_context(|| format!("loading {}", points_path.display()))?;
            let opts = camrig::ExtrinsicOptions {
                use_culling: culling,
                alignment_sync_index: Some(alignment_index),
                use_nth_sync_index: nth,
                ..Default::default()
            };
            let outcome = session.calibrate_extrinsics(&table, &opts, None, None)?;
            println!(
                "overall RMSE: {} px over {} observations",
                outcome.report.overall_rmse, outcome.report.n_observations
            );
            for (port, rmse) in outcome.report.per_camera_rmse.iter() {
                println!("  cam {port}: {rmse} px");
            }
            if let Some(scale) = outcome.scale {
                println!(
                    "scale check at sync {}: distance RMSE {} mm ({}%)",
                    scale.reference_sync_index,
                    scale.distance_rmse_mm,
                    scale.relative_error_percent
                );
            }
        }
        Command::Reconstruct { session, tracker } => {
            let s = Session::load(paths.clone())?;
            let array = s.camera_array()?;
            // archive the configuration used for this reconstruction
            std::fs::copy(paths.config(), paths.archived_config(&session))
                .with_context(|| "archiving config.toml into the recording")?;
            let recon = Reconstructor::new(array, paths.recording_dir(&session), &tracker);
            let names = BTreeMap::new();
            let xyz = recon.create_xyz(&names, &Default::default())?;
            println!(
                "triangulated {} world points into {}",
                xyz.len(),
                paths.tracker_dir(&session, &tracker).display()
            );
        }
        Command::SyncReport { session } => {
            let history = paths.frame_time_history(&session);
            let frames = frame_sync::load_frame_time_history(&history)
                .with_context(|| format!("loading {}", history.display()))?;
            let groups = frame_sync::sync_timestamps(&frames);
            let total_frames: usize = frames.values().map(|v| v.len()).sum();
            let assigned: usize = groups
                .iter()
                .map(|g| g.slots.values().filter(|s| s.is_some()).count())
                .sum();
            println!(
                "{} sync groups from {} frames across {} ports ({assigned} assigned)",
                groups.len(),
                total_frames,
                frames.len(),
            );
        }
    }
    Ok(())
}
