// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Recovery wrappers layered around a step's own execution (spec §4.9): `retry` for
//! mechanical re-attempts, and three LLM-assisted wrappers -- `reflexion`, `auto_heal`,
//! `quality_gate` -- each of which can call back into a model but can never change a
//! step's identity or kind.

pub mod auto_heal;
pub mod quality_gate;
pub mod reflexion;
pub mod retry;

pub use auto_heal::run_auto_heal;
pub use quality_gate::run_quality_gate;
pub use reflexion::run_reflexion;
pub use retry::run_retry;

use serde_json::Value;

use crate::workflow::RECOVERY_PATCH_WHITELIST;

/// Merges `patch` into `current`, dropping any top-level key not on
/// [`RECOVERY_PATCH_WHITELIST`] -- an LLM-produced patch can reshape a step's inputs
/// but never its `id` or `type`.
pub fn apply_patch_whitelisted(current: &Value, patch: &Value) -> Value {
    let mut merged = current.clone();
    if let (Some(merged_obj), Some(patch_obj)) = (merged.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_obj {
            if RECOVERY_PATCH_WHITELIST.contains(&key.as_str()) {
                merged_obj.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_cannot_touch_id_or_type() {
        let current = json!({"id": "s1", "type": "shell", "run": "echo old"});
        let patch = json!({"id": "hijacked", "type": "llm", "run": "echo new"});
        let merged = apply_patch_whitelisted(&current, &patch);
        assert_eq!(merged["id"], json!("s1"));
        assert_eq!(merged["type"], json!("shell"));
        assert_eq!(merged["run"], json!("echo new"));
    }
}
