//! Command lines executed inside a sandbox.

use std::collections::BTreeMap;

use serde_json::json;

use crate::backend::sh;
use crate::config::SandboxSettings;

/// Single-quote `value` for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

pub fn git_credentials(settings: &SandboxSettings, token: &str) -> Vec<String> {
    let line = format!("https://x-access-token:{}@{}", token, settings.source_host);
    sh(format!(
        "umask 077 && printf '%s\\n' {} > /root/.git-credentials && git config --global credential.helper store",
        shell_quote(&line)
    ))
}

pub fn git_clone(settings: &SandboxSettings, repo: &str) -> Vec<String> {
    vec![
        "git".to_string(),
        "clone".to_string(),
        format!("https://{}/{}.git", settings.source_host, repo),
        settings.workspace_dir.clone(),
    ]
}

pub fn make_workspace(settings: &SandboxSettings) -> Vec<String> {
    vec![
        "mkdir".to_string(),
        "-p".to_string(),
        settings.workspace_dir.clone(),
    ]
}

pub fn fetch_identity(settings: &SandboxSettings, token: &str) -> Vec<String> {
    vec![
        "curl".to_string(),
        "-s".to_string(),
        "-H".to_string(),
        format!("Authorization: token {}", token),
        format!("{}/user", settings.source_api_url.trim_end_matches('/')),
    ]
}

pub fn git_config(key: &str, value: &str) -> Vec<String> {
    vec![
        "git".to_string(),
        "config".to_string(),
        "--global".to_string(),
        key.to_string(),
        value.to_string(),
    ]
}

pub fn write_agent_config(settings: &SandboxSettings) -> Vec<String> {
    let config = json!({
        "server": { "port": settings.agent_port, "hostname": "0.0.0.0" }
    });
    let path = format!("{}/opencode.json", settings.workspace_dir.trim_end_matches('/'));
    sh(format!(
        "printf '%s' {} > {}",
        shell_quote(&config.to_string()),
        shell_quote(&path)
    ))
}

/// Rewrites the env file (mode 0600) that the agent server sources at start.
pub fn write_env_file(settings: &SandboxSettings, env: &BTreeMap<String, String>) -> Vec<String> {
    let body: String = env
        .iter()
        .map(|(name, value)| format!("export {}={}\n", name, shell_quote(value)))
        .collect();
    sh(format!(
        "umask 077 && printf '%s' {} > {}",
        shell_quote(&body),
        shell_quote(&settings.env_file)
    ))
}

pub fn start_agent(settings: &SandboxSettings, conversation_id: Option<&str>) -> Vec<String> {
    let mut command = format!(
        "{} serve --port {} --hostname 0.0.0.0",
        settings.agent_binary, settings.agent_port
    );
    if let Some(id) = conversation_id {
        command.push_str(&format!(" --session {}", shell_quote(id)));
    }
    sh(format!(
        "cd {} && . {} 2>/dev/null; nohup {} > {} 2>&1 &",
        shell_quote(&settings.workspace_dir),
        shell_quote(&settings.env_file),
        command,
        shell_quote(&settings.agent_log_path)
    ))
}

pub fn health_check(settings: &SandboxSettings) -> Vec<String> {
    vec![
        "curl".to_string(),
        "-s".to_string(),
        "-o".to_string(),
        "/dev/null".to_string(),
        "-w".to_string(),
        "%{http_code}".to_string(),
        format!("http://localhost:{}/global/health", settings.agent_port),
    ]
}

pub fn health_report(settings: &SandboxSettings) -> Vec<String> {
    sh(format!(
        "curl -s --max-time 5 http://localhost:{}/global/health || echo NOT_RESPONDING",
        settings.agent_port
    ))
}

pub fn create_conversation(settings: &SandboxSettings) -> Vec<String> {
    vec![
        "curl".to_string(),
        "-s".to_string(),
        "-X".to_string(),
        "POST".to_string(),
        "-H".to_string(),
        "Content-Type: application/json".to_string(),
        "-d".to_string(),
        "{}".to_string(),
        format!("http://localhost:{}/session", settings.agent_port),
    ]
}

pub fn agent_processes(settings: &SandboxSettings) -> Vec<String> {
    sh(format!(
        "ps aux | grep -E {} | grep -v grep",
        shell_quote(&format!("{}|node", settings.agent_binary))
    ))
}

pub fn listeners(settings: &SandboxSettings) -> Vec<String> {
    sh(format!(
        "(ss -ltnp 2>/dev/null || netstat -ltnp 2>/dev/null) | grep {} || echo 'nothing listening on {}'",
        settings.agent_port, settings.agent_port
    ))
}

pub fn log_tail_chars(settings: &SandboxSettings, chars: usize) -> Vec<String> {
    sh(format!(
        "tail -c {} {} 2>/dev/null",
        chars,
        shell_quote(&settings.agent_log_path)
    ))
}

pub fn log_tail_lines(settings: &SandboxSettings, lines: usize) -> Vec<String> {
    sh(format!(
        "tail -n {} {} 2>/dev/null",
        lines,
        shell_quote(&settings.agent_log_path)
    ))
}

pub fn environment() -> Vec<String> {
    sh("env | sort")
}

/// Exit code 2 when `path` is not a directory.
pub fn list_directory(path: &str) -> Vec<String> {
    let quoted = shell_quote(path);
    sh(format!(
        "test -d {q} || exit 2; find {q} -maxdepth 1 -printf '%y|%s|%p\\n'",
        q = quoted
    ))
}

pub fn is_file(path: &str) -> Vec<String> {
    vec!["test".to_string(), "-f".to_string(), path.to_string()]
}

/// File contents as one base64 line, so binary files survive the text exec
/// channel.
pub fn read_base64(path: &str) -> Vec<String> {
    vec!["base64".to_string(), "-w0".to_string(), path.to_string()]
}
