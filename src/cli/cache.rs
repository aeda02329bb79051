//! `kiln cache`: inspect or prune the cache store. The cache directory is
//! deletable without loss of correctness, so these subcommands are thin
//! wrappers over [`crate::cache::CacheStore`].

use std::path::Path;

use eyre::Result;

use crate::cache::CacheStore;
use crate::config;
use crate::env::KILN_CACHE_DIR;

#[derive(Debug, clap::Args)]
pub struct Cache {
    #[clap(subcommand)]
    command: CacheCommand,
}

#[derive(Debug, clap::Subcommand)]
enum CacheCommand {
    /// Prune every job's cache family down to its `cache_keep` retention
    Prune,
    /// Remove the entire cache root
    Clear,
}

impl Cache {
    pub fn run(&self, workflow_path: &Path) -> Result<i32> {
        match &self.command {
            CacheCommand::Prune => self.prune(workflow_path),
            CacheCommand::Clear => self.clear(),
        }
    }

    fn prune(&self, workflow_path: &Path) -> Result<i32> {
        let workflow = match config::load(workflow_path) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!("{e}");
                return Ok(e.exit_code());
            }
        };
        let store = CacheStore::new(KILN_CACHE_DIR.clone());
        for job in &workflow.jobs {
            store.prune(&job.name, job.cache_keep)?;
            println!("pruned {} (kept {})", job.name, job.cache_keep);
        }
        Ok(0)
    }

    fn clear(&self) -> Result<i32> {
        let root = KILN_CACHE_DIR.clone();
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        println!("removed {}", root.display());
        Ok(0)
    }
}
