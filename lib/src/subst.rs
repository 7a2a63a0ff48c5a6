use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::task::TaskKey;

/// Number of trailing characters of the issue used for `ISSUE_SHORT`.
const ISSUE_SHORT_LENGTH: usize = 6;

static VAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\(([A-Z_0-9]+)\)").expect("valid regex"));

/// The values substituted for `<(VAR)` placeholders in task-spec commands,
/// extra args and extra tags.
#[derive(Debug, Clone, Default)]
pub struct TaskVars {
    vars: HashMap<&'static str, String>,
}

impl TaskVars {
    pub fn new(key: &TaskKey, task_id: &str, buildbucket_build_id: &str) -> Self {
        let mut vars: HashMap<&'static str, String> = HashMap::new();
        vars.insert("REPO", key.repo_state.repo.clone());
        vars.insert("REVISION", key.repo_state.revision.clone());
        vars.insert("TASK_NAME", key.name.clone());
        vars.insert("TASK_ID", task_id.to_string());
        vars.insert("BUILDBUCKET_BUILD_ID", buildbucket_build_id.to_string());

        let patch = key.repo_state.patch.clone().unwrap_or_default();
        let issue_short = if patch.issue.len() > ISSUE_SHORT_LENGTH {
            patch.issue[patch.issue.len() - ISSUE_SHORT_LENGTH..].to_string()
        } else {
            patch.issue.clone()
        };
        vars.insert("ISSUE_SHORT", issue_short);
        vars.insert("ISSUE_INT", int_string(&patch.issue));
        vars.insert("PATCHSET_INT", int_string(&patch.patchset));
        vars.insert("ISSUE", patch.issue);
        vars.insert("PATCHSET", patch.patchset);
        vars.insert("PATCH_REF", patch.patch_ref);
        vars.insert("PATCH_REPO", patch.patch_repo);
        vars.insert("PATCH_STORAGE", patch_storage(&patch.server));
        vars.insert("CODEREVIEW_SERVER", patch.server);

        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Expand every recognized `<(VAR)` in `input`. Unrecognized variables
    /// are left untouched so mistakes stay visible in the triggered command.
    pub fn expand(&self, input: &str) -> String {
        VAR_RE
            .replace_all(input, |caps: &regex::Captures<'_>| {
                match self.vars.get(&caps[1]) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    pub fn expand_all(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.expand(s)).collect()
    }
}

fn int_string(s: &str) -> String {
    s.parse::<i64>().map(|v| v.to_string()).unwrap_or_else(|_| "0".to_string())
}

/// The patch storage label, derived from the code-review server URL: the
/// first dot-separated label of the host.
fn patch_storage(server: &str) -> String {
    Url::parse(server)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .and_then(|host| host.split('.').next().map(str::to_string))
        .unwrap_or_default()
}
