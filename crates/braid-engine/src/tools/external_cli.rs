use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use braid_core::settings::ExternalCliSettings;
use braid_core::tools::{Tool, ToolCategory, ToolContext, ToolError};

use crate::thread_cache::ToolThreadCache;

const MAX_OUTPUT_BYTES: usize = 256 * 1024;
pub const THREAD_ENV: &str = "BRAID_THREAD_ID";

/// Runs an external agent CLI. The CLI resumes the session's thread when
/// `BRAID_THREAD_ID` is set and reports its thread with a
/// `{"threadId": "..."}` line on stdout.
pub struct ExternalCliTool {
    program: String,
    args: Vec<String>,
    threads: ToolThreadCache,
}

impl ExternalCliTool {
    pub fn new(settings: &ExternalCliSettings, threads: ToolThreadCache) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            threads,
        }
    }
}

#[async_trait]
impl Tool for ExternalCliTool {
    fn name(&self) -> &str {
        "external_agent"
    }

    fn description(&self) -> &str {
        "Send a prompt to the external coding agent bound to this session"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["prompt"],
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Instruction for the external agent"
                }
            }
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Standard
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let prompt = args["prompt"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("prompt is required".into()))?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let resumed = self.threads.lookup(&ctx.session_id);
        if let Some(thread_id) = &resumed {
            command.env(THREAD_ENV, thread_id);
        }

        let child = command.spawn().map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to start {}: {e}", self.program))
        })?;

        let output = tokio::select! {
            _ = ctx.abort_signal.cancelled() => return Err(ToolError::Cancelled),
            out = child.wait_with_output() => out.map_err(|e| {
                ToolError::ExecutionFailed(format!("failed to run {}: {e}", self.program))
            })?,
        };

        let stdout = truncated(&output.stdout);
        let stderr = truncated(&output.stderr);
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Err(ToolError::ExecutionFailed(format!("exit code {code}: {}", stderr.trim())));
        }

        let (text, thread_id) = split_thread_line(&stdout);
        match &thread_id {
            Some(id) => {
                self.threads.bind(&ctx.session_id, id.clone());
                info!(
                    session_id = %ctx.session_id,
                    thread_id = %id,
                    resumed = resumed.is_some(),
                    "external thread bound"
                );
            }
            None => debug!(session_id = %ctx.session_id, "external cli reported no thread id"),
        }

        Ok(json!({
            "output": text,
            "threadId": thread_id,
        }))
    }
}

fn truncated(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_OUTPUT_BYTES {
        return text.into_owned();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...\n[truncated: {} bytes total]", &text[..end], text.len())
}

/// Separate the last `{"threadId": ...}` line from the rest of stdout.
fn split_thread_line(stdout: &str) -> (String, Option<String>) {
    let mut thread_id = None;
    let mut kept = Vec::new();
    for line in stdout.lines() {
        let parsed = serde_json::from_str::<Value>(line.trim())
            .ok()
            .and_then(|v| v.get("threadId").and_then(Value::as_str).map(str::to_owned));
        match parsed {
            Some(id) => thread_id = Some(id),
            None => kept.push(line),
        }
    }
    (kept.join("\n").trim().to_string(), thread_id)
}
