//! Combines job-identifying fields, step descriptors, environment, tool
//! versions, and the input digest into a cache key.
//!
//! Every field is length-prefixed before hashing to preclude collision by
//! concatenation (two different field splits producing the same byte
//! stream), so this is a hand-rolled byte writer rather than `serde_json`'s
//! canonical form, which gives no such guarantee.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::input_hash::hex;
use crate::tool_version::ToolVersionResolver;
use crate::workflow::Job;

/// Bumped whenever the canonical form below changes, so two kiln builds
/// with different key schemas never collide on the same cache namespace.
const KEY_SCHEMA_VERSION: u32 = 1;

const ABSENT_TOOL_VERSION: &str = "<absent>";

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn write_count(hasher: &mut Sha256, count: usize) {
    hasher.update((count as u64).to_be_bytes());
}

/// Derives the cache key for one job given its declared tool requirements
/// and the precomputed input digest.
pub fn derive(job: &Job, tool_versions: &dyn ToolVersionResolver, input_digest: &str) -> String {
    let mut hasher = Sha256::new();

    write_field(&mut hasher, job.name.as_bytes());

    for step in &job.steps {
        write_field(&mut hasher, step.name.as_bytes());
        write_field(&mut hasher, step.kind.as_bytes());
        write_field(&mut hasher, step.command.as_deref().unwrap_or("").as_bytes());
        write_field(&mut hasher, step.working_dir().as_bytes());
        // Kind-specific options, sorted by key for determinism.
        let mut opts: BTreeMap<&str, String> =
            step.with.iter().map(|(k, v)| (k.as_str(), v.to_string())).collect();
        write_count(&mut hasher, opts.len());
        for (k, v) in opts.iter_mut() {
            write_field(&mut hasher, k.as_bytes());
            write_field(&mut hasher, v.as_bytes());
        }
    }

    let sorted_env: BTreeMap<&str, &str> =
        job.env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    write_count(&mut hasher, sorted_env.len());
    for (k, v) in &sorted_env {
        write_field(&mut hasher, k.as_bytes());
        write_field(&mut hasher, v.as_bytes());
    }

    let mut required: Vec<&String> = job.requires.iter().collect();
    required.sort();
    write_count(&mut hasher, required.len());
    for tool in required {
        write_field(&mut hasher, tool.as_bytes());
        let version = tool_versions.version(tool).unwrap_or_else(|| ABSENT_TOOL_VERSION.to_string());
        write_field(&mut hasher, version.as_bytes());
    }

    write_field(&mut hasher, input_digest.as_bytes());
    write_field(&mut hasher, &KEY_SCHEMA_VERSION.to_be_bytes());

    hex(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_version::ToolVersionResolver;
    use crate::workflow::{Job, Step};
    use std::collections::HashMap;

    struct FakeResolver(HashMap<String, String>);
    impl ToolVersionResolver for FakeResolver {
        fn version(&self, tool: &str) -> Option<String> {
            self.0.get(tool).cloned()
        }
    }

    fn base_job() -> Job {
        Job {
            name: "build".into(),
            steps: vec![Step {
                name: "compile".into(),
                kind: "shell".into(),
                command: Some("cargo build".into()),
                dir: None,
                with: Default::default(),
            }],
            needs: Default::default(),
            paths: vec![],
            diff_enabled: true,
            inputs: vec![],
            env: Default::default(),
            cache_dirs: vec!["target".into()],
            requires: Default::default(),
            cache_keep: 5,
        }
    }

    #[test]
    fn determinism_same_inputs_same_key() {
        let job = base_job();
        let resolver = FakeResolver(Default::default());
        let k1 = derive(&job, &resolver, "digest1");
        let k2 = derive(&job, &resolver, "digest1");
        assert_eq!(k1, k2);
    }

    #[test]
    fn changing_command_changes_key() {
        let resolver = FakeResolver(Default::default());
        let job1 = base_job();
        let mut job2 = base_job();
        job2.steps[0].command = Some("cargo build --release".into());
        assert_ne!(derive(&job1, &resolver, "d"), derive(&job2, &resolver, "d"));
    }

    #[test]
    fn changing_step_name_changes_key() {
        let resolver = FakeResolver(Default::default());
        let job1 = base_job();
        let mut job2 = base_job();
        job2.steps[0].name = "build-it".into();
        assert_ne!(derive(&job1, &resolver, "d"), derive(&job2, &resolver, "d"));
    }

    #[test]
    fn changing_env_changes_key() {
        let resolver = FakeResolver(Default::default());
        let job1 = base_job();
        let mut job2 = base_job();
        job2.env.insert("FOO".into(), "bar".into());
        assert_ne!(derive(&job1, &resolver, "d"), derive(&job2, &resolver, "d"));
    }

    #[test]
    fn changing_tool_version_changes_key() {
        let mut job = base_job();
        job.requires.insert("rustc".into());
        let resolver1 = FakeResolver(HashMap::from([("rustc".to_string(), "1.80".to_string())]));
        let resolver2 = FakeResolver(HashMap::from([("rustc".to_string(), "1.81".to_string())]));
        assert_ne!(derive(&job, &resolver1, "d"), derive(&job, &resolver2, "d"));
    }

    #[test]
    fn missing_tool_still_participates() {
        let mut job = base_job();
        job.requires.insert("rustc".into());
        let resolver1 = FakeResolver(Default::default());
        let resolver2 = FakeResolver(HashMap::from([("rustc".to_string(), "1.81".to_string())]));
        assert_ne!(derive(&job, &resolver1, "d"), derive(&job, &resolver2, "d"));
    }

    #[test]
    fn changing_input_digest_changes_key() {
        let job = base_job();
        let resolver = FakeResolver(Default::default());
        assert_ne!(derive(&job, &resolver, "d1"), derive(&job, &resolver, "d2"));
    }

    #[test]
    fn env_key_order_does_not_matter() {
        let resolver = FakeResolver(Default::default());
        let mut job1 = base_job();
        job1.env.insert("A".into(), "1".into());
        job1.env.insert("B".into(), "2".into());
        let mut job2 = base_job();
        job2.env.insert("B".into(), "2".into());
        job2.env.insert("A".into(), "1".into());
        assert_eq!(derive(&job1, &resolver, "d"), derive(&job2, &resolver, "d"));
    }
}
