// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Explicit, code-constructed engine configuration (pool capacity defaults, the
//! `shell` step denylist, default step timeouts). Threaded through [`crate::runner::Runner`]
//! rather than read from a global -- a second `Runner` in the same process (e.g. a test
//! harness exercising two different tenants) can carry a different denylist without
//! any shared mutable state.

use std::collections::HashMap;
use std::time::Duration;

/// First-argv-token denylist the `shell` executor checks before spawning a command
/// (spec: "Enforce denylist (config `engines.denylist`): the first argv token must
/// not match; `SecurityError` otherwise").
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default capacity for any pool a workflow references in a step's `pool` field
    /// but does not declare in `Workflow::pools`. A workflow's own declaration always
    /// wins over this default.
    pub pool_capacities: HashMap<String, usize>,
    /// Argv\[0\] values a `shell` step may never invoke, matched against the first
    /// whitespace-delimited token of the rendered `run` string.
    pub shell_denylist: Vec<String>,
    /// Applied to a step that declares no `timeout_ms` of its own.
    pub default_step_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_capacities: HashMap::new(),
            shell_denylist: default_shell_denylist(),
            default_step_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_capacity(mut self, name: impl Into<String>, capacity: usize) -> Self {
        self.pool_capacities.insert(name.into(), capacity);
        self
    }

    pub fn with_shell_denylist(mut self, denylist: Vec<String>) -> Self {
        self.shell_denylist = denylist;
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = Some(timeout);
        self
    }

    /// Returns the first whitespace-delimited token of `run`, i.e. what would become
    /// argv\[0\] under `sh -c`.
    pub fn argv0(run: &str) -> Option<&str> {
        run.split_whitespace().next()
    }

    pub fn is_denied(&self, run: &str) -> bool {
        match Self::argv0(run) {
            Some(token) => self.shell_denylist.iter().any(|denied| denied == token),
            None => false,
        }
    }
}

fn default_shell_denylist() -> Vec<String> {
    // Conservative defaults for commands that rewrite the host or exfiltrate
    // credentials outright; an operator can widen or narrow via `with_shell_denylist`.
    vec!["rm".to_string(), "sudo".to_string(), "shutdown".to_string(), "reboot".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_exact_argv0_match() {
        let config = EngineConfig::new();
        assert!(config.is_denied("rm -rf /"));
        assert!(!config.is_denied("echo rm"));
    }

    #[test]
    fn custom_denylist_replaces_default() {
        let config = EngineConfig::new().with_shell_denylist(vec!["curl".to_string()]);
        assert!(config.is_denied("curl https://example.com"));
        assert!(!config.is_denied("rm -rf /"));
    }
}
