use std::env;
use std::sync::OnceLock;
use std::time::Duration;

pub(crate) const DEFAULT_COMPILE_CACHE_SIZE: usize = 2048;

static COMPILE_CACHE_SIZE: OnceLock<usize> = OnceLock::new();
static WORKER_THREADS: OnceLock<Option<usize>> = OnceLock::new();
static WAIT_TIMEOUT: OnceLock<Option<Duration>> = OnceLock::new();

fn parse_usize(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok()
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds = value.trim().parse::<f64>().ok()?;
    if seconds.is_finite() && seconds > 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

fn read_var<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => {
            let parsed = parse(&value);
            if parsed.is_none() {
                tracing::warn!(var = name, value = %value, "ignoring unparsable environment value");
            }
            parsed
        }
        _ => None,
    }
}

/// `OPGRAPH_COMPILE_CACHE_SIZE`: capacity of the op-by-op compile cache.
pub(crate) fn compile_cache_size() -> usize {
    *COMPILE_CACHE_SIZE.get_or_init(|| {
        read_var("OPGRAPH_COMPILE_CACHE_SIZE", parse_usize).unwrap_or(DEFAULT_COMPILE_CACHE_SIZE)
    })
}

/// `OPGRAPH_WORKER_THREADS`: size of the shared worker pool; unset lets rayon decide.
pub(crate) fn worker_threads() -> Option<usize> {
    *WORKER_THREADS.get_or_init(|| {
        read_var("OPGRAPH_WORKER_THREADS", parse_usize).filter(|threads| *threads > 0)
    })
}

/// `OPGRAPH_WAIT_TIMEOUT_SECS`: upper bound for blocking waits on async results.
pub(crate) fn wait_timeout() -> Option<Duration> {
    *WAIT_TIMEOUT.get_or_init(|| read_var("OPGRAPH_WAIT_TIMEOUT_SECS", parse_seconds))
}
