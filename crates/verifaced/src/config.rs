use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Deployment secret for field-level encryption of phone/name.
    pub field_secret: String,
    /// Whether VERIFACE_FIELD_SECRET was actually set (vs the dev default).
    pub field_secret_from_env: bool,
    /// Directory holding replay frames for the file-backed capture backend.
    pub replay_dir: Option<PathBuf>,
    /// Cosine similarity threshold for a positive identity match.
    pub similarity_threshold: f32,
    /// Target frame count for a count-bounded collection session.
    pub required_frames: usize,
    /// Fraction of live frames required for a session to count as live.
    /// 0.5 for permissive kiosks, 0.9 for recognize flows.
    pub live_ratio_threshold: f32,
    /// Hard wall-clock cap (seconds) on a count-bounded session.
    pub count_cap_secs: u64,
    /// Window length (seconds) for a time-bounded recognition session.
    pub recognition_secs: u64,
    /// Box-wide depth variation threshold (millimeters) for liveness.
    pub liveness_threshold_mm: f32,
    /// Maximum probe images consulted per multi-image verification.
    pub max_images: usize,
    /// Failed attempts within the failure window that lock a terminal out.
    pub max_failures: usize,
    /// Sliding window (seconds) over which failed attempts are counted.
    pub failure_window_secs: u64,
    /// Lockout duration (seconds) once the failure window fills.
    pub lockout_secs: u64,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `VERIFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("veriface");

        let db_path = std::env::var("VERIFACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("identities.db"));

        let (field_secret, field_secret_from_env) = match std::env::var("VERIFACE_FIELD_SECRET") {
            Ok(secret) => (secret, true),
            Err(_) => ("insecure-dev-secret".to_string(), false),
        };

        Self {
            db_path,
            field_secret,
            field_secret_from_env,
            replay_dir: std::env::var("VERIFACE_REPLAY_DIR").map(PathBuf::from).ok(),
            similarity_threshold: env_f32("VERIFACE_SIMILARITY_THRESHOLD", 0.70),
            required_frames: env_usize("VERIFACE_REQUIRED_FRAMES", 10),
            live_ratio_threshold: env_f32("VERIFACE_LIVE_RATIO_THRESHOLD", 0.9),
            count_cap_secs: env_u64("VERIFACE_COUNT_CAP_SECS", 2),
            recognition_secs: env_u64("VERIFACE_RECOGNITION_SECS", 3),
            liveness_threshold_mm: env_f32(
                "VERIFACE_LIVENESS_THRESHOLD_MM",
                veriface_core::liveness::DEFAULT_THRESHOLD_MM,
            ),
            max_images: env_usize(
                "VERIFACE_MAX_IMAGES",
                veriface_core::matcher::DEFAULT_MAX_IMAGES,
            ),
            max_failures: env_usize("VERIFACE_MAX_FAILURES", 5),
            failure_window_secs: env_u64("VERIFACE_FAILURE_WINDOW_SECS", 60),
            lockout_secs: env_u64("VERIFACE_LOCKOUT_SECS", 300),
            session_bus: std::env::var("VERIFACE_SESSION_BUS").is_ok(),
        }
    }

    /// Lockout thresholds for the verification rate limiter.
    pub fn lockout_policy(&self) -> crate::rate_limiter::LockoutPolicy {
        crate::rate_limiter::LockoutPolicy {
            max_failures: self.max_failures,
            window: std::time::Duration::from_secs(self.failure_window_secs),
            lockout: std::time::Duration::from_secs(self.lockout_secs),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
