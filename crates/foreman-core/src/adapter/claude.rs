use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

use super::error::AdapterError;
use super::types::*;
use super::{parse_version_string, resolve_binary, AgentAdapter};

/// Claude Code adapter: probe + runtime implementation.
pub struct ClaudeAdapter {
    configured_path: Option<String>,
}

impl ClaudeAdapter {
    pub fn new(configured_path: Option<String>) -> Self {
        Self { configured_path }
    }

    fn probe_help(binary: &PathBuf) -> Result<String, String> {
        let output = Command::new(binary)
            .arg("--help")
            .output()
            .map_err(|e| format!("failed to run --help: {e}"))?;

        if !output.status.success() {
            return Err(format!(
                "--help exited with status {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Ok(format!("{stdout}{stderr}"))
    }

    fn probe_version(binary: &PathBuf) -> Option<String> {
        let output = Command::new(binary).arg("--version").output().ok()?;
        parse_version_string(&String::from_utf8_lossy(&output.stdout))
    }

    /// Parse help text to determine supported flags.
    pub fn parse_help_flags(help_text: &str) -> Vec<String> {
        let mut flags = Vec::new();
        let required = [
            ("-p", "--print"),
            ("--output-format", "--output-format"),
            ("--permission-mode", "--permission-mode"),
        ];

        for (short, long) in &required {
            if Self::contains_flag_token(help_text, short)
                || Self::contains_flag_token(help_text, long)
            {
                flags.push(long.to_string());
            }
        }

        let optional = [
            "--allowedTools",
            "--disallowedTools",
            "--max-turns",
            "--input-format",
            "--verbose",
        ];
        for flag in &optional {
            if Self::contains_flag_token(help_text, flag) {
                flags.push(flag.to_string());
            }
        }

        flags
    }

    fn contains_flag_token(help_text: &str, flag: &str) -> bool {
        help_text.lines().any(|line| {
            line.split(|c: char| c.is_whitespace() || c == ',' || c == ':' || c == '(' || c == ')')
                .any(|token| token == flag)
        })
    }

    /// Parse a single line of Claude `stream-json` output into an `AgentEvent`.
    ///
    /// Claude stream-json emits one JSON object per line. Known types:
    /// - `system` (init) -> Progress
    /// - `assistant` with message content -> Message
    /// - `assistant` with tool_use -> ToolCall
    /// - `result` with subtype `tool_result` -> ToolResult
    /// - `result` with subtype `success` -> Completed + optional Usage
    pub fn parse_stream_json_line(line: &str) -> Option<AgentEvent> {
        let v: serde_json::Value = serde_json::from_str(line).ok()?;
        let obj = v.as_object()?;

        match obj.get("type")?.as_str()? {
            "system" => Some(AgentEvent::Progress {
                message: format!(
                    "session init: {}",
                    obj.get("subtype")
                        .and_then(|s| s.as_str())
                        .unwrap_or("unknown")
                ),
                percent: None,
            }),
            "assistant" => {
                let msg = obj.get("message")?.as_object()?;
                if let Some(tool_use) = msg.get("tool_use").and_then(|t| t.as_object()) {
                    let tool = tool_use
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let input = tool_use
                        .get("input")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    return Some(AgentEvent::ToolCall { tool, input });
                }
                let content = msg
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string();
                if content.is_empty() {
                    return None;
                }
                Some(AgentEvent::Message { content })
            }
            "result" => {
                let subtype = obj.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
                match subtype {
                    "tool_result" => {
                        let tool_id = obj
                            .get("tool_use_id")
                            .and_then(|t| t.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        let content = obj
                            .get("content")
                            .cloned()
                            .unwrap_or(serde_json::Value::Null);
                        Some(AgentEvent::ToolResult {
                            tool: tool_id,
                            output: content,
                        })
                    }
                    "success" => {
                        let summary = obj
                            .get("cost_usd")
                            .and_then(|c| c.as_f64())
                            .map(|c| format!("cost: ${c:.4}"));
                        if let Some(usage) = obj.get("usage").and_then(|u| u.as_object()) {
                            let input_tokens = usage
                                .get("input_tokens")
                                .and_then(|t| t.as_u64())
                                .unwrap_or(0);
                            let output_tokens = usage
                                .get("output_tokens")
                                .and_then(|t| t.as_u64())
                                .unwrap_or(0);
                            let mut extra = HashMap::new();
                            if let Some(cost) = obj.get("cost_usd").and_then(|c| c.as_f64()) {
                                extra.insert("cost_usd".to_string(), serde_json::Value::from(cost));
                            }
                            if let Some(dur) = obj.get("duration_ms").and_then(|d| d.as_u64()) {
                                extra.insert(
                                    "duration_ms".to_string(),
                                    serde_json::Value::from(dur),
                                );
                            }
                            return Some(AgentEvent::Usage {
                                input_tokens,
                                output_tokens,
                                extra,
                            });
                        }
                        Some(AgentEvent::Completed { summary })
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn key(&self) -> &'static str {
        "claude"
    }

    fn tier(&self) -> AdapterTier {
        AdapterTier::Tier1
    }

    fn detect(&self) -> DetectResult {
        let binary = resolve_binary(self.configured_path.as_deref(), &["claude"]);

        let Some(binary_path) = binary else {
            return DetectResult {
                status: DetectStatus::Missing,
                binary_path: None,
                version: None,
                supported_flags: vec![],
                confidence: CapabilityConfidence::Verified,
                error: Some("claude binary not found in PATH".to_string()),
            };
        };

        let version = Self::probe_version(&binary_path);

        let help_text = match Self::probe_help(&binary_path) {
            Ok(text) => text,
            Err(e) => {
                return DetectResult {
                    status: DetectStatus::Blocked,
                    binary_path: Some(binary_path),
                    version,
                    supported_flags: vec![],
                    confidence: CapabilityConfidence::Unknown,
                    error: Some(e),
                };
            }
        };

        let flags = Self::parse_help_flags(&help_text);

        let has_print = flags.iter().any(|f| f == "--print");
        let has_output_format = flags.iter().any(|f| f == "--output-format");
        let has_permission_mode = flags.iter().any(|f| f == "--permission-mode");

        let status = if has_print && has_output_format && has_permission_mode {
            DetectStatus::Ready
        } else {
            DetectStatus::Blocked
        };

        let error = if status == DetectStatus::Blocked {
            let mut missing = Vec::new();
            if !has_print {
                missing.push("-p/--print");
            }
            if !has_output_format {
                missing.push("--output-format");
            }
            if !has_permission_mode {
                missing.push("--permission-mode");
            }
            Some(format!("missing required flags: {}", missing.join(", ")))
        } else {
            None
        };

        DetectResult {
            status,
            binary_path: Some(binary_path),
            version,
            supported_flags: flags,
            confidence: CapabilityConfidence::Verified,
            error,
        }
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            json_stream: CapabilityEntry::verified(true),
            plain_text: CapabilityEntry::verified(true),
            force_edit_mode: CapabilityEntry::verified(true),
            sandbox_controls: CapabilityEntry::observed(false),
            approval_controls: CapabilityEntry::verified(true),
            session_resume: CapabilityEntry::unknown(),
            emits_usage: CapabilityEntry::verified(true),
        }
    }

    fn build_command(&self, req: &SpawnRequest) -> Result<BuiltCommand, AdapterError> {
        let binary = resolve_binary(self.configured_path.as_deref(), &["claude"]).ok_or(
            AdapterError::BinaryMissing {
                adapter: "claude".to_string(),
            },
        )?;

        let mut args = vec![
            "-p".to_string(),
            req.task_prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];

        if req.supported_flags.iter().any(|f| f == "--verbose") {
            args.push("--verbose".to_string());
        }

        if req.force_edit {
            args.push("--permission-mode".to_string());
            args.push("bypassPermissions".to_string());
        }

        Ok(BuiltCommand {
            program: binary.display().to_string(),
            args,
            env: vec![],
            cwd: req.worktree_path.clone(),
        })
    }

    fn parse_line(&self, line: &str) -> Option<AgentEvent> {
        Self::parse_stream_json_line(line)
    }

    fn parse_raw(&self, chunk: &[u8]) -> Vec<AgentEvent> {
        let text = match std::str::from_utf8(chunk) {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        text.lines()
            .filter_map(Self::parse_stream_json_line)
            .collect()
    }
}
