use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{
    error::{Result, ScanError},
    wait::WaitPolicy,
};

/// Settings shared by the server and its clients.
///
/// | Variable | Default |
/// |----------|---------|
/// | `PREFIX_SCAN_CHANNEL` | `./scan_fifo` |
/// | `PREFIX_SCAN_SEGMENT_DIR` | `/dev/shm`, else the temp dir |
/// | `PREFIX_SCAN_WORKERS` | available parallelism |
/// | `PREFIX_SCAN_MAX_IN_FLIGHT` | 200 |
/// | `PREFIX_SCAN_DEADLINE_MS` | unset: wait forever |
/// | `PREFIX_SCAN_BACKEND` | `cpu` |
#[derive(Clone, Debug)]
pub struct Config {
    pub channel_path: PathBuf,
    pub segment_dir: PathBuf,
    /// Threads in the scan pool.
    pub workers: usize,
    /// Compute tasks allowed to run at once before the server stops reading.
    pub max_in_flight: usize,
    pub wait: WaitPolicy,
    pub backend: Backend,
}

/// Which engine runs the scans.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    /// The rayon pool.
    #[default]
    Cpu,
    /// wgpu compute passes.
    #[cfg(feature = "gpu")]
    Gpu,
}

impl FromStr for Backend {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            #[cfg(feature = "gpu")]
            "gpu" => Ok(Self::Gpu),
            #[cfg(not(feature = "gpu"))]
            "gpu" => Err(ScanError::input("gpu backend requested but built without the `gpu` feature")),
            other => Err(ScanError::input(format!("unknown backend {other:?}, expected cpu or gpu"))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let shm = PathBuf::from("/dev/shm");
        let segment_dir = if shm.is_dir() { shm } else { env::temp_dir() };

        Self {
            channel_path: PathBuf::from("./scan_fifo"),
            segment_dir,
            workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            max_in_flight: 200,
            wait: WaitPolicy::default(),
            backend: Backend::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("PREFIX_SCAN_CHANNEL") {
            config.channel_path = path.into();
        }
        if let Some(dir) = lookup("PREFIX_SCAN_SEGMENT_DIR") {
            config.segment_dir = dir.into();
        }
        if let Some(workers) = parse_var(&lookup, "PREFIX_SCAN_WORKERS")? {
            config.workers = workers;
        }
        if let Some(limit) = parse_var(&lookup, "PREFIX_SCAN_MAX_IN_FLIGHT")? {
            config.max_in_flight = limit;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PREFIX_SCAN_DEADLINE_MS")? {
            config.wait = config.wait.with_deadline(Duration::from_millis(ms));
        }

        if let Some(backend) = lookup("PREFIX_SCAN_BACKEND") {
            config.backend = backend.parse()?;
        }

        if config.workers == 0 || config.max_in_flight == 0 {
            return Err(ScanError::input(
                "PREFIX_SCAN_WORKERS and PREFIX_SCAN_MAX_IN_FLIGHT must be at least 1",
            ));
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| ScanError::input(format!("{key}={raw:?} is not a valid number")))
        })
        .transpose()
}
