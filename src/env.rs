pub use std::env::*;
use itertools::Itertools;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Name of the `PATH`-like variable as it actually appears in the current
/// environment (case can differ on some platforms), so env overrides can be
/// merged without clobbering it under the wrong key.
pub static PATH_KEY: LazyLock<String> = LazyLock::new(|| {
    vars()
        .map(|(k, _)| k)
        .find_or_first(|k| k.to_uppercase() == "PATH")
        .map(|k| k.to_string())
        .unwrap_or("PATH".into())
});

/// Explicit override for the workflow file path, bypassing the upward search
/// `config::load_default` otherwise performs.
pub static KILN_FILE: LazyLock<Option<String>> = LazyLock::new(|| var("KILN_FILE").ok());

/// Root directory for the cache store. Defaults to a per-user cache
/// directory; `KILN_CACHE_DIR` overrides it.
pub static KILN_CACHE_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    if let Ok(dir) = var("KILN_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kiln")
});

pub static KILN_JOBS: LazyLock<Option<usize>> =
    LazyLock::new(|| var("KILN_JOBS").ok().and_then(|v| v.parse().ok()));
