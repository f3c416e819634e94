//! Live environment snapshots: git state, the last shell command, relevant
//! running processes and selected environment variables.
//!
//! Every probe is an external process bounded by `probe_timeout_ms`. A probe
//! that fails, times out or isn't installed contributes defaults instead of
//! an error, so a snapshot always succeeds. Outside a git repository
//! [`GitStatus::available`] is `false`.

use crate::{Error, Result, truncate_chars};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Paths listed per git category in prompt text.
const PROMPT_PATHS_PER_CATEGORY: usize = 10;

/// Characters of each environment value kept.
const ENV_VALUE_CHARS: usize = 200;

/// Configuration for [`DynamicContextCollector`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DynamicConfig {
    /// Directory probes and commands run in. Default: `.`.
    pub workdir: PathBuf,
    /// Timeout per probe in milliseconds. Default: `5000`.
    pub probe_timeout_ms: u64,
    /// Timeout for [`DynamicContextCollector::run_command`]. Default: `60000`.
    pub command_timeout_ms: u64,
    /// Characters of stdout/stderr kept per command. Default: `4000`.
    pub output_chars: usize,
    /// Process names (substring, case-insensitive) worth reporting.
    pub process_patterns: Vec<String>,
    /// Maximum processes reported. Default: `20`.
    pub max_processes: usize,
    /// Environment variables included in snapshots.
    pub env_allowlist: Vec<String>,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            probe_timeout_ms: 5_000,
            command_timeout_ms: 60_000,
            output_chars: 4_000,
            process_patterns: ["cargo", "rustc", "node", "npm", "python", "pytest", "go", "docker"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_processes: 20,
            env_allowlist: ["SHELL", "VIRTUAL_ENV", "CONDA_DEFAULT_ENV", "NODE_ENV", "RUST_LOG", "CI"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl DynamicConfig {
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe_timeout_ms == 0 || self.command_timeout_ms == 0 {
            return Err(Error::InvalidConfig("dynamic timeouts must be positive".into()));
        }
        if self.output_chars == 0 {
            return Err(Error::InvalidConfig("dynamic.output_chars must be positive".into()));
        }
        Ok(())
    }
}

/// Working tree state from `git status --porcelain=v2 --branch`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct GitStatus {
    /// `false` outside a repository or when git is unavailable.
    pub available: bool,
    pub branch: Option<String>,
    pub upstream: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
    pub conflicted: Vec<String>,
    pub clean: bool,
}

/// A finished shell command.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the command was killed or timed out.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl CommandRecord {
    pub fn new(
        command: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: Option<i32>,
        duration: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            duration_ms: duration.as_millis() as u64,
            finished_at: Utc::now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A running process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command_line: String,
}

/// Point-in-time environment snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DynamicState {
    pub git: GitStatus,
    pub last_command: Option<CommandRecord>,
    pub processes: Vec<ProcessInfo>,
    pub env: BTreeMap<String, String>,
    pub collected_at: DateTime<Utc>,
}

fn push_paths(out: &mut String, label: &str, paths: &[String]) {
    if paths.is_empty() {
        return;
    }
    let shown: Vec<&str> = paths
        .iter()
        .take(PROMPT_PATHS_PER_CATEGORY)
        .map(String::as_str)
        .collect();
    let _ = write!(out, "\n  {label}: {}", shown.join(", "));
    if paths.len() > shown.len() {
        let _ = write!(out, " (+{} more)", paths.len() - shown.len());
    }
}

impl DynamicState {
    /// Compact text rendering for a prompt.
    pub fn to_prompt_text(&self) -> String {
        let mut out = String::new();
        let git = &self.git;
        if git.available {
            let branch = git.branch.as_deref().unwrap_or("(unknown)");
            let _ = write!(out, "Git: branch {branch}");
            if git.ahead > 0 || git.behind > 0 {
                let _ = write!(out, " (ahead {}, behind {})", git.ahead, git.behind);
            }
            out.push_str(if git.clean { ", clean" } else { ", dirty" });
            push_paths(&mut out, "staged", &git.staged);
            push_paths(&mut out, "unstaged", &git.unstaged);
            push_paths(&mut out, "untracked", &git.untracked);
            push_paths(&mut out, "conflicted", &git.conflicted);
        } else {
            out.push_str("Git: not a repository");
        }

        if let Some(cmd) = &self.last_command {
            let status = match cmd.exit_code {
                Some(code) => format!("exited {code}"),
                None => "did not finish".to_string(),
            };
            let _ = write!(
                out,
                "\nLast command: `{}` {status} in {:.1}s",
                cmd.command,
                cmd.duration_ms as f64 / 1000.0
            );
            let stdout = cmd.stdout.trim();
            if !stdout.is_empty() {
                let _ = write!(out, "\n  stdout: {}", truncate_chars(stdout, 500, "..."));
            }
            let stderr = cmd.stderr.trim();
            if !stderr.is_empty() {
                let _ = write!(out, "\n  stderr: {}", truncate_chars(stderr, 500, "..."));
            }
        }

        if !self.processes.is_empty() {
            let procs: Vec<String> = self
                .processes
                .iter()
                .map(|p| format!("{} ({})", p.name, p.pid))
                .collect();
            let _ = write!(out, "\nProcesses: {}", procs.join(", "));
        }

        if !self.env.is_empty() {
            let vars: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
            let _ = write!(out, "\nEnv: {}", vars.join(", "));
        }
        out
    }
}

/// Parse `git status --porcelain=v2 --branch` output.
pub fn parse_porcelain_v2(text: &str) -> GitStatus {
    let mut status = GitStatus {
        available: true,
        ..GitStatus::default()
    };

    for line in text.lines() {
        if let Some(header) = line.strip_prefix("# ") {
            let (key, value) = header.split_once(' ').unwrap_or((header, ""));
            match key {
                "branch.head" if value != "(detached)" => status.branch = Some(value.to_string()),
                "branch.head" => status.branch = Some("HEAD (detached)".to_string()),
                "branch.upstream" => status.upstream = Some(value.to_string()),
                "branch.ab" => {
                    for part in value.split_whitespace() {
                        if let Some(n) = part.strip_prefix('+') {
                            status.ahead = n.parse().unwrap_or(0);
                        } else if let Some(n) = part.strip_prefix('-') {
                            status.behind = n.parse().unwrap_or(0);
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        let (kind, fields) = line.split_once(' ').unwrap_or((line, ""));
        match kind {
            "1" | "2" => {
                // Ordinary: XY sub mH mI mW hH hI path
                // Renamed:  XY sub mH mI mW hH hI Xscore path<TAB>orig
                let skip = if kind == "1" { 7 } else { 8 };
                let mut parts = fields.splitn(skip + 1, ' ');
                let xy = parts.next().unwrap_or("..");
                let Some(path) = parts.nth(skip - 1) else {
                    continue;
                };
                let path = path.split('\t').next().unwrap_or(path).to_string();
                let mut codes = xy.chars();
                let (x, y) = (codes.next().unwrap_or('.'), codes.next().unwrap_or('.'));
                if x != '.' {
                    status.staged.push(path.clone());
                }
                if y != '.' {
                    status.unstaged.push(path);
                }
            }
            "u" => {
                // Unmerged: XY sub m1 m2 m3 mW h1 h2 h3 path
                if let Some(path) = fields.splitn(10, ' ').nth(9) {
                    status.conflicted.push(path.to_string());
                }
            }
            "?" => status.untracked.push(fields.to_string()),
            _ => {}
        }
    }

    status.clean = status.staged.is_empty()
        && status.unstaged.is_empty()
        && status.untracked.is_empty()
        && status.conflicted.is_empty();
    status
}

/// Parse `ps -eo pid=,comm=,args=` output, keeping processes whose name
/// matches one of `patterns`.
pub fn parse_processes(text: &str, patterns: &[String], limit: usize) -> Vec<ProcessInfo> {
    let own_pid = std::process::id();
    let patterns: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, rest) = line.split_once(char::is_whitespace)?;
            let pid: u32 = pid.parse().ok()?;
            let rest = rest.trim_start();
            let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            Some(ProcessInfo {
                pid,
                name: name.to_string(),
                command_line: args.trim().to_string(),
            })
        })
        .filter(|p| p.pid != own_pid)
        .filter(|p| {
            let name = p.name.to_lowercase();
            patterns.iter().any(|pat| name.contains(pat.as_str()))
        })
        .take(limit)
        .collect()
}

/// Allowlisted environment variables, resolved through `lookup`.
pub fn collect_env(allowlist: &[String], lookup: impl Fn(&str) -> Option<String>) -> BTreeMap<String, String> {
    allowlist
        .iter()
        .filter_map(|key| {
            let value = lookup(key)?;
            Some((key.clone(), truncate_chars(&value, ENV_VALUE_CHARS, "...")))
        })
        .collect()
}

/// Snapshots the live environment.
#[derive(Debug)]
pub struct DynamicContextCollector {
    config: DynamicConfig,
    last_command: Option<CommandRecord>,
}

impl DynamicContextCollector {
    pub fn new(config: DynamicConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            last_command: None,
        })
    }

    pub fn config(&self) -> &DynamicConfig {
        &self.config
    }

    pub fn last_command(&self) -> Option<&CommandRecord> {
        self.last_command.as_ref()
    }

    /// Run a probe program; `None` on spawn failure, timeout or non-zero exit.
    async fn probe(&self, program: &str, args: &[&str]) -> Option<String> {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.config.workdir)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(timeout, output).await {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => {
                debug!("Probe {program} exited with {}", output.status);
                None
            }
            Ok(Err(e)) => {
                debug!("Probe {program} failed to start: {e}");
                None
            }
            Err(_) => {
                warn!("Probe {program} timed out after {} ms", timeout.as_millis());
                None
            }
        }
    }

    pub async fn git_status(&self) -> GitStatus {
        match self
            .probe("git", &["status", "--porcelain=v2", "--branch"])
            .await
        {
            Some(text) => parse_porcelain_v2(&text),
            None => GitStatus::default(),
        }
    }

    pub async fn processes(&self) -> Vec<ProcessInfo> {
        match self.probe("ps", &["-eo", "pid=,comm=,args="]).await {
            Some(text) => parse_processes(&text, &self.config.process_patterns, self.config.max_processes),
            None => Vec::new(),
        }
    }

    /// Take a snapshot. Never fails; failed probes yield defaults.
    pub async fn snapshot(&self) -> DynamicState {
        let (git, processes) = tokio::join!(self.git_status(), self.processes());
        DynamicState {
            git,
            last_command: self.last_command.clone(),
            processes,
            env: collect_env(&self.config.env_allowlist, |k| std::env::var(k).ok()),
            collected_at: Utc::now(),
        }
    }

    fn cap(&self, text: &str) -> String {
        truncate_chars(text, self.config.output_chars, "\n[truncated]")
    }

    /// Store a command that ran elsewhere as the last command. Outputs are
    /// truncated to `output_chars`.
    pub fn record_command(&mut self, mut record: CommandRecord) -> &CommandRecord {
        record.stdout = self.cap(&record.stdout);
        record.stderr = self.cap(&record.stderr);
        self.last_command.insert(record)
    }

    /// Run `command` with `sh -c` in the work dir and record it.
    ///
    /// A command that exceeds `command_timeout_ms` is killed and recorded with
    /// no exit code. Failure to spawn the shell is an error.
    pub async fn run_command(&mut self, command: &str) -> Result<CommandRecord> {
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        let start = Instant::now();
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.config.workdir)
            .kill_on_drop(true)
            .output();

        let record = match tokio::time::timeout(timeout, output).await {
            Ok(output) => {
                let output = output?;
                CommandRecord::new(
                    command,
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr),
                    output.status.code(),
                    start.elapsed(),
                )
            }
            Err(_) => {
                warn!("Command timed out after {} ms: {command}", timeout.as_millis());
                CommandRecord::new(
                    command,
                    "",
                    format!("timed out after {} ms", timeout.as_millis()),
                    None,
                    start.elapsed(),
                )
            }
        };
        debug!("Ran `{command}`: exit {:?} in {} ms", record.exit_code, record.duration_ms);
        Ok(self.record_command(record).clone())
    }
}
