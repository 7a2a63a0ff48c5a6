use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use conveyor_lib::specs::{CacheSpec, PackageSpec};

/// Legacy isolate-server input reference.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct IsolatedInput {
    pub isolated: String,
    pub server: String,
    pub namespace: String,
}

#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct CasDigest {
    pub hash: String,
    pub size_bytes: i64,
}

/// Content-addressed input reference.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct CasInput {
    pub instance: String,
    pub digest: CasDigest,
}

/// Input reference for a task slice: either the legacy isolate form or a
/// content-addressed digest.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRef {
    Isolated(IsolatedInput),
    Cas(CasInput),
}

/// One slice of a trigger request: everything a bot needs to run the task.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct TaskSlice {
    pub dimensions: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    pub command: Vec<String>,
    pub extra_args: Vec<String>,
    pub caches: Vec<CacheSpec>,
    pub packages: Vec<PackageSpec>,
    pub input: Option<InputRef>,
    pub idempotent: bool,
    pub outputs: Vec<String>,
    pub execution_timeout_secs: u64,
    pub io_timeout_secs: u64,
}

/// A request to trigger one task on the worker pool.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct TriggerRequest {
    pub name: String,
    /// Pool priority; lower is more urgent. See [`pool_priority`].
    pub priority: i32,
    pub expiration_secs: u64,
    pub slices: Vec<TaskSlice>,
    pub tags: Vec<String>,
    pub service_account: String,
    pub pubsub_topic: String,
    pub pubsub_userdata: String,
}

/// Map a task-spec priority in (0, 1] onto the pool's integer scale, where
/// lower numbers run sooner.
pub fn pool_priority(spec_priority: f64) -> i32 {
    let p = ((1.0 - spec_priority) * 100.0).round() as i32;
    p.clamp(1, 255)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pool_priority_mapping() {
        // Highest spec priority maps to the most urgent pool value.
        assert_eq!(pool_priority(1.0), 1);
        assert_eq!(pool_priority(0.5), 50);
        assert_eq!(pool_priority(0.1), 90);
        // Out-of-range inputs stay clamped.
        assert_eq!(pool_priority(-5.0), 255);
        assert_eq!(pool_priority(9.0), 1);
    }

    #[test]
    fn test_pool_priority_monotone() {
        let mut last = i32::MAX;
        for p in [0.1, 0.3, 0.5, 0.8, 1.0] {
            let mapped = pool_priority(p);
            assert!(mapped <= last);
            last = mapped;
        }
    }

    #[test]
    fn test_input_ref_serialization_forms() {
        let isolated = InputRef::Isolated(IsolatedInput {
            isolated: "abc".to_string(),
            server: "https://isolate.example.org".to_string(),
            namespace: "default-gzip".to_string(),
        });
        let json = serde_json::to_value(&isolated).unwrap();
        assert!(json.get("isolated").is_some());

        let cas = InputRef::Cas(CasInput {
            instance: "projects/x/instances/default".to_string(),
            digest: CasDigest {
                hash: "deadbeef".to_string(),
                size_bytes: 128,
            },
        });
        let json = serde_json::to_value(&cas).unwrap();
        assert_eq!(json["cas"]["digest"]["size_bytes"], 128);
    }
}
