//! Tool-version resolver: abstracted as `version(tool_name) -> string |
//! absent`. The default implementation execs `<tool> --version` and
//! memoizes the result, since it only needs to be stable within a run.

use std::collections::HashMap;
use std::sync::Mutex;

pub trait ToolVersionResolver: Send + Sync {
    fn version(&self, tool: &str) -> Option<String>;
}

/// Runs `<tool> --version` the first time a tool is asked about, caching the
/// (possibly-absent) result for the lifetime of the resolver.
pub struct ShellToolVersionResolver {
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl Default for ShellToolVersionResolver {
    fn default() -> Self {
        Self { cache: Mutex::new(HashMap::new()) }
    }
}

impl ShellToolVersionResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ToolVersionResolver for ShellToolVersionResolver {
    fn version(&self, tool: &str) -> Option<String> {
        if let Some(cached) = self.cache.lock().unwrap().get(tool) {
            return cached.clone();
        }
        let resolved = std::process::Command::new(tool)
            .arg("--version")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());
        self.cache.lock().unwrap().insert(tool.to_string(), resolved.clone());
        resolved
    }
}
