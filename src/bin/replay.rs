use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use flate2::read::GzDecoder;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::Deserialize;
use serde_json::json;
use sliding_window_fusion::{
    Ephemeris, Estimator, EstimatorConfig, FusionEvent, GnssObservation, GnssTime, ImageFrame,
    IngestStatus, Pose,
};
use sliding_window_fusion::types::{Matrix6, Vector6};

#[derive(Parser, Debug)]
struct Args {
    /// Path to a session_*.json[.gz] recording
    #[arg(long, conflicts_with = "golden_dir")]
    log: Option<PathBuf>,

    /// Directory of recordings to batch replay (processes session_*.json[.gz])
    #[arg(long)]
    golden_dir: Option<PathBuf>,

    /// Estimator configuration (JSON); defaults for anything missing
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the window capacity
    #[arg(long)]
    max_window_nodes: Option<usize>,

    /// Override the solver iteration cap
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Skip records earlier than this many seconds after the first one
    #[arg(long, short = 's', default_value_t = 0.0)]
    start: f64,

    /// Stop after this many seconds of playback
    #[arg(long, short = 'd')]
    duration: Option<f64>,

    /// Write the published estimate after every record as JSON lines. With --golden-dir this
    /// is a directory holding one <log>.jsonl per recording.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn default_accel_std() -> f64 {
    0.02
}

fn default_gyro_std() -> f64 {
    0.002
}

fn default_mocap_std() -> [f64; 2] {
    [1e-3, 1e-3]
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Imu {
        t: f64,
        accel: [f64; 3],
        gyro: [f64; 3],
        #[serde(default = "default_accel_std")]
        accel_std: f64,
        #[serde(default = "default_gyro_std")]
        gyro_std: f64,
    },
    #[serde(rename = "zero_vel")]
    ZeroVelocity {
        t: f64,
    },
    Mocap {
        t: f64,
        position: [f64; 3],
        /// (w, x, y, z)
        attitude: [f64; 4],
        /// (position [m], rotation [rad])
        #[serde(default = "default_mocap_std")]
        std: [f64; 2],
    },
    Image {
        t: f64,
        frame: ImageFrame,
    },
    #[serde(rename = "gnss_obs")]
    GnssEpoch {
        observations: Vec<GnssObservation>,
    },
    Ephemeris {
        receipt_time: GnssTime,
        ephemeris: Ephemeris,
    },
}

impl Record {
    /// Session time of the record; GNSS records only know theirs once the session epoch is
    /// fixed
    fn session_time(&self, epoch: Option<GnssTime>) -> Option<f64> {
        match self {
            Record::Imu { t, .. }
            | Record::ZeroVelocity { t }
            | Record::Mocap { t, .. }
            | Record::Image { t, .. } => Some(*t),
            Record::GnssEpoch { observations } => {
                let first = observations.first()?;
                epoch.map(|e| first.time - e)
            }
            Record::Ephemeris { .. } => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Admit {
    Skip,
    Feed,
    Stop,
}

/// Playback window measured from the first timed record. Records without a session time of
/// their own go by the latest one seen; ephemerides are always let through before the start
/// since they describe orbits rather than the trajectory.
struct Playback {
    start: f64,
    duration: Option<f64>,
    begin: Option<f64>,
    clock: Option<f64>,
}

impl Playback {
    fn new(start: f64, duration: Option<f64>) -> Self {
        Self {
            start,
            duration,
            begin: None,
            clock: None,
        }
    }

    fn admit(&mut self, record: &Record, epoch: Option<GnssTime>) -> Admit {
        if let Some(t) = record.session_time(epoch) {
            self.begin.get_or_insert(t);
            self.clock = Some(self.clock.map_or(t, |c| c.max(t)));
        }
        let (Some(begin), Some(clock)) = (self.begin, self.clock) else {
            return Admit::Feed;
        };
        let elapsed = clock - begin;
        if self.duration.is_some_and(|d| elapsed > self.start + d) {
            return Admit::Stop;
        }
        if elapsed < self.start && !matches!(record, Record::Ephemeris { .. }) {
            return Admit::Skip;
        }
        Admit::Feed
    }
}

#[derive(Deserialize)]
struct LogFile {
    records: Vec<Record>,
}

fn load_log(path: &Path) -> anyhow::Result<LogFile> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let gz = GzDecoder::new(file);
        let reader = BufReader::new(gz);
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn load_config(args: &Args) -> anyhow::Result<EstimatorConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))?
        }
        None => EstimatorConfig::default(),
    };
    if let Some(n) = args.max_window_nodes {
        config.max_window_nodes = n;
    }
    if let Some(n) = args.max_iterations {
        config.max_iterations = n;
    }
    Ok(config)
}

fn diagonal(first: f64, second: f64) -> Matrix6 {
    let mut d = Vector6::zeros();
    d.fixed_rows_mut::<3>(0).fill(first * first);
    d.fixed_rows_mut::<3>(3).fill(second * second);
    Matrix6::from_diagonal(&d)
}

#[derive(Default)]
struct Tally {
    dispatched: u64,
    deferred: u64,
    rejected: u64,
    ephemerides: u64,
    stale_ephemerides: u64,
    nodes: u64,
    marginalized: u64,
    satellites_dropped: u64,
    keyframes_skipped: u64,
    measurements_dropped: u64,
    degraded_solves: u64,
    max_final_cost: f64,
}

impl Tally {
    fn absorb(&mut self, events: Vec<FusionEvent>) {
        for event in events {
            match event {
                FusionEvent::Initialized { .. } | FusionEvent::NodeCreated { .. } => {
                    self.nodes += 1
                }
                FusionEvent::NodeMarginalized { .. } => self.marginalized += 1,
                FusionEvent::SatelliteDropped { .. } => self.satellites_dropped += 1,
                FusionEvent::KeyframeSkipped { .. } => self.keyframes_skipped += 1,
                FusionEvent::MeasurementDropped { .. } => self.measurements_dropped += 1,
                FusionEvent::EphemerisIgnored { .. } => {}
                FusionEvent::Optimized(report) => {
                    if !report.converged {
                        self.degraded_solves += 1;
                    }
                    self.max_final_cost = self.max_final_cost.max(report.final_cost);
                }
                FusionEvent::GnssOriginInitialized {
                    origin_ecef,
                    clock_bias,
                } => {
                    log::info!(
                        "origin {:?}, clock bias {clock_bias:.1} m",
                        origin_ecef.as_slice()
                    );
                }
            }
        }
    }
}

fn feed(est: &mut Estimator, record: Record, tally: &mut Tally) -> anyhow::Result<()> {
    let status = match record {
        Record::Imu {
            t,
            accel,
            gyro,
            accel_std,
            gyro_std,
        } => {
            let z = Vector6::new(accel[0], accel[1], accel[2], gyro[0], gyro[1], gyro[2]);
            est.imu_update(t, z, diagonal(accel_std, gyro_std))
        }
        Record::ZeroVelocity { t } => est.zero_vel_update(t),
        Record::Mocap {
            t,
            position,
            attitude,
            std,
        } => {
            let [w, x, y, z] = attitude;
            let pose = Pose::new(
                Vector3::from(position),
                UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
            );
            est.mocap_update(t, pose, diagonal(std[0], std[1]))
        }
        Record::Image { t, frame } => est.image_update(t, frame),
        Record::GnssEpoch { observations } => est.gnss_observation_epoch(observations),
        Record::Ephemeris {
            receipt_time,
            ephemeris,
        } => {
            return match est.gnss_ephemeris_update(receipt_time, ephemeris) {
                Ok(()) => {
                    tally.ephemerides += 1;
                    Ok(())
                }
                Err(e) if e.is_fatal() => Err(e.into()),
                Err(e) => {
                    log::debug!("{e}");
                    tally.stale_ephemerides += 1;
                    Ok(())
                }
            };
        }
    };
    match status {
        Ok(IngestStatus::Dispatched) => tally.dispatched += 1,
        Ok(IngestStatus::Deferred) => tally.deferred += 1,
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => {
            log::warn!("rejected: {e}");
            tally.rejected += 1;
        }
    }
    Ok(())
}

/// Recordings in `dir` matching session_*.json[.gz], sorted by name
fn session_logs(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut logs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with("session_") && (name.ends_with(".json") || name.ends_with(".json.gz"))
        {
            logs.push(path);
        }
    }
    logs.sort();
    Ok(logs)
}

/// Where the trajectory of `log` goes: --out itself for a single log, a file per log inside
/// --out for a batch
fn trajectory_path(args: &Args, log: &Path) -> Option<PathBuf> {
    let out = args.out.as_ref()?;
    if args.golden_dir.is_none() {
        return Some(out.clone());
    }
    let name = log.file_name().and_then(|n| n.to_str()).unwrap_or("session");
    let stem = name.trim_end_matches(".gz").trim_end_matches(".json");
    Some(out.join(format!("{stem}.jsonl")))
}

fn run_once(path: &Path, args: &Args) -> anyhow::Result<serde_json::Value> {
    let log = load_log(path)?;
    let mut est = Estimator::new(load_config(args)?)?;
    let mut trajectory = match trajectory_path(args, path) {
        Some(out) => {
            if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(&out).with_context(|| format!("creating {}", out.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    let mut tally = Tally::default();
    let mut playback = Playback::new(args.start, args.duration);
    let mut skipped = 0u64;
    let mut last_written = None;
    let records = log.records.len();
    for record in log.records {
        match playback.admit(&record, est.session_epoch()) {
            Admit::Skip => {
                skipped += 1;
                continue;
            }
            Admit::Stop => break,
            Admit::Feed => {}
        }
        feed(&mut est, record, &mut tally)?;
        tally.absorb(est.drain_events());
        if let (Some(out), Some(state)) = (trajectory.as_mut(), est.current_state()) {
            if last_written.as_ref() != Some(&state) {
                serde_json::to_writer(&mut *out, &*state)?;
                writeln!(out)?;
                last_written = Some(state);
            }
        }
    }
    est.flush()?;
    tally.absorb(est.drain_events());
    if let Some(out) = trajectory.as_mut() {
        out.flush()?;
    }

    Ok(json!({
        "log": path.display().to_string(),
        "records": records,
        "skipped": skipped,
        "dispatched": tally.dispatched,
        "deferred": tally.deferred,
        "rejected": tally.rejected,
        "ephemerides": tally.ephemerides,
        "stale_ephemerides": tally.stale_ephemerides,
        "nodes": tally.nodes,
        "marginalized": tally.marginalized,
        "satellites_dropped": tally.satellites_dropped,
        "keyframes_skipped": tally.keyframes_skipped,
        "measurements_dropped": tally.measurements_dropped,
        "degraded_solves": tally.degraded_solves,
        "events_overflowed": est.events_overflowed(),
        "max_final_cost": tally.max_final_cost,
        "session_epoch": est.session_epoch(),
        "final_state": est.current_state().map(|s| (*s).clone()),
        "window": est.window_summary(),
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut results = Vec::new();

    if let Some(dir) = args.golden_dir.as_ref() {
        for path in session_logs(dir)? {
            match run_once(&path, &args) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &args)?);
    } else {
        anyhow::bail!("Provide --log or --golden-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
