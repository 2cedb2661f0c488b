// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! `shell` step execution: runs `run` through `sh -c`, redacting secrets and capping
//! output size as stdout/stderr arrive.

use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{StepExecOutcome, StepOutcome};
use crate::error::EngineError;
use crate::redact::{OutputLimiter, Redactor};
use crate::workflow::ShellStepConfig;

pub async fn execute(
    step_id: &str,
    config: &ShellStepConfig,
    rendered_run: &str,
    redactor: &Redactor,
    denylist: &[String],
) -> Result<StepExecOutcome, EngineError> {
    if let Some(token) = rendered_run.split_whitespace().next() {
        if denylist.iter().any(|denied| denied == token) {
            return Err(EngineError::Security(format!("command \"{token}\" is denylisted")));
        }
    }

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(rendered_run)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::step_execution(step_id, format!("failed to spawn shell: {e}")))?;
    let stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::step_execution(step_id, "missing stdout pipe"))?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::step_execution(step_id, "missing stderr pipe"))?;

    let (stdout, stderr, status) = tokio::join!(
        read_capped(stdout_pipe, config.max_output_bytes, redactor),
        read_capped(stderr_pipe, config.max_output_bytes, redactor),
        child.wait(),
    );
    let status = status.map_err(|e| EngineError::step_execution(step_id, format!("wait failed: {e}")))?;
    let code = status.code().unwrap_or(-1);

    let output = serde_json::json!({
        "stdout": stdout,
        "stderr": stderr,
        "code": code,
    });

    if code != 0 {
        return Err(EngineError::step_execution(
            step_id,
            format!("command exited with status {code}: {stderr}"),
        ));
    }

    Ok(StepExecOutcome::Completed(StepOutcome::simple(output)))
}

async fn read_capped<R>(mut reader: R, max_bytes: Option<usize>, redactor: &Redactor) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    use crate::redact::RedactionBuffer;

    let mut limiter = OutputLimiter::new(max_bytes);
    let mut redact_buf = RedactionBuffer::new(redactor.clone());
    let mut out = String::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let decoded = redact_buf.push(&buf[..n]);
        match limiter.feed(&decoded) {
            Some(chunk) => out.push_str(&chunk),
            None => break,
        }
    }
    if !limiter.truncated() {
        out.push_str(&redact_buf.finish());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> ShellStepConfig {
        ShellStepConfig {
            run: String::new(),
            env: HashMap::new(),
            max_output_bytes: None,
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let redactor = Redactor::new(Vec::new());
        let outcome = execute("s1", &config(), "echo hello", &redactor, &[]).await.unwrap();
        let StepExecOutcome::Completed(outcome) = outcome else {
            panic!("expected completion")
        };
        assert_eq!(outcome.output["stdout"], serde_json::json!("hello\n"));
        assert_eq!(outcome.output["code"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let redactor = Redactor::new(Vec::new());
        let result = execute("s1", &config(), "exit 7", &redactor, &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn redacts_secrets_in_stdout() {
        let redactor = Redactor::new(["topsecret".to_string()]);
        let outcome = execute("s1", &config(), "echo the value is topsecret", &redactor, &[])
            .await
            .unwrap();
        let StepExecOutcome::Completed(outcome) = outcome else {
            panic!("expected completion")
        };
        assert!(outcome.output["stdout"].as_str().unwrap().contains("***REDACTED***"));
    }

    #[tokio::test]
    async fn denylisted_command_is_rejected() {
        let redactor = Redactor::new(Vec::new());
        let denylist = vec!["rm".to_string()];
        let result = execute("s1", &config(), "rm -rf /tmp/whatever", &redactor, &denylist).await;
        assert!(matches!(result, Err(EngineError::Security(_))));
    }
}
