pub mod cache;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod dag;
pub mod env;
pub mod error;
pub mod input_hash;
pub mod key;
pub mod plan;
pub mod remote;
pub mod repo_facts;
pub mod scheduler;
pub mod selector;
pub mod settings;
pub mod step_executor;
pub mod tool_version;
pub mod tracing_setup;
pub mod workflow;

pub use cmd::CmdLineRunner;
pub use dag::Dag;
pub use error::{Error, Result};
pub use plan::RunPlan;
pub use scheduler::{JobResult, Scheduler, SchedulerConfig};
pub use settings::Settings;
pub use workflow::{Job, Step, Workflow};
