//! Thread-count control for numeric libraries loaded by workers.
//!
//! N workers each spawning M internal threads oversubscribe the machine
//! N×M-fold. Every worker process or thread pins these knobs to one thread
//! before it runs its first task.

use tracing::debug;

/// Environment variables honoured by common numeric runtimes.
pub const THREAD_ENV_VARS: [&str; 6] = [
    "OMP_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "MKL_NUM_THREADS",
    "VECLIB_MAXIMUM_THREADS",
    "NUMEXPR_NUM_THREADS",
    "RAYON_NUM_THREADS",
];

/// Environment to pass to child processes so they start single-threaded.
pub fn single_thread_env() -> Vec<(String, String)> {
    THREAD_ENV_VARS
        .iter()
        .map(|name| (name.to_string(), "1".to_string()))
        .collect()
}

/// Pins the current process's numeric thread pools to a single thread.
///
/// Must run before the first task and before any worker thread starts.
/// Returns the number of variables that had to be changed.
pub fn pin_single_thread() -> usize {
    let mut changed = 0;
    for name in THREAD_ENV_VARS {
        if std::env::var(name).ok().as_deref() != Some("1") {
            std::env::set_var(name, "1");
            changed += 1;
        }
    }
    debug!("Pinned numeric thread pools to 1 thread ({} vars changed)", changed);
    changed
}

/// True when every thread-count variable is already set to one.
pub fn is_single_threaded() -> bool {
    THREAD_ENV_VARS
        .iter()
        .all(|name| std::env::var(name).ok().as_deref() == Some("1"))
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_pin_single_thread_is_idempotent() {
        pin_single_thread();
        assert!(is_single_threaded());
        assert_eq!(pin_single_thread(), 0);
    }
    
    #[test]
    fn test_single_thread_env_covers_all_vars() {
        let env = single_thread_env();
        assert_eq!(env.len(), THREAD_ENV_VARS.len());
        assert!(env.iter().all(|(_, v)| v == "1"));
    }
}
