use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directories walked for `*.step.json` manifests.
    pub roots: Vec<PathBuf>,
    /// Where the out-of-process runner scripts live.
    pub runners_dir: PathBuf,
    /// Per-invocation limit for bridged steps; `None` waits indefinitely.
    pub bridge_timeout: Option<Duration>,
    /// Invocations allowed to wait behind the one in flight, per bridge session.
    pub bridge_queue_capacity: usize,
    /// Hop limit for emitted events within one chain; `0` disables the guard.
    pub max_emit_depth: u32,
    pub event_tap_capacity: usize,
    /// Upper bound on one HTTP-triggered invocation; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            roots: vec![PathBuf::from("steps")],
            runners_dir: PathBuf::from("runners"),
            bridge_timeout: None,
            bridge_queue_capacity: 16,
            max_emit_depth: 32,
            event_tap_capacity: 1000,
            request_timeout: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `STEPS_ROOTS`, `RUNNERS_DIR`, `BRIDGE_TIMEOUT_MS`,
    /// `BRIDGE_QUEUE_CAPACITY`, `MAX_EMIT_DEPTH`, `EVENT_TAP_CAPACITY` and
    /// `REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(roots) = lookup("STEPS_ROOTS") {
            let roots: Vec<PathBuf> = roots
                .split(':')
                .filter(|r| !r.trim().is_empty())
                .map(|r| PathBuf::from(r.trim()))
                .collect();
            if !roots.is_empty() {
                config.roots = roots;
            }
        }
        if let Some(dir) = lookup("RUNNERS_DIR") {
            config.runners_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "BRIDGE_TIMEOUT_MS") {
            config.bridge_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(capacity) = parse_var(&lookup, "BRIDGE_QUEUE_CAPACITY") {
            config.bridge_queue_capacity = capacity;
        }
        if let Some(depth) = parse_var(&lookup, "MAX_EMIT_DEPTH") {
            config.max_emit_depth = depth;
        }
        if let Some(capacity) = parse_var(&lookup, "EVENT_TAP_CAPACITY") {
            config.event_tap_capacity = capacity;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "REQUEST_TIMEOUT_MS") {
            config.request_timeout = Some(Duration::from_millis(ms));
        }

        config
    }

    pub fn with_roots<I, P>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.roots = roots.into_iter().map(Into::into).collect();
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}
