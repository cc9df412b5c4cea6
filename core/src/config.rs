/// Configuration management
use crate::error::{MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_REFRESH_DEBOUNCE_MS: u64 = 300;
const DEFAULT_FEED_CAPACITY: usize = 256;

/// Messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the local store
    pub data_dir: PathBuf,

    /// User to act as (falls back to the remembered session)
    pub viewer_id: Option<String>,

    /// Optional scope (e.g. course id) narrowing threads and the inbox
    pub scope_id: Option<String>,

    /// Window over which conversation-list refresh signals are coalesced
    pub refresh_debounce: Duration,

    /// Per-subscriber buffer of the change feed
    pub feed_capacity: usize,

    /// Remaining positional arguments (the CLI command)
    pub command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".inbox"),
            viewer_id: None,
            scope_id: None,
            refresh_debounce: Duration::from_millis(DEFAULT_REFRESH_DEBOUNCE_MS),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            command: Vec::new(),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(MessagingError::Config(format!(
                "Usage: {} <data-dir> [--as <user>] [--scope <id>] [--debounce-ms <ms>] [--feed-capacity <n>] <command> [args]",
                args.first().map(String::as_str).unwrap_or("inbox")
            )));
        }

        let data_dir = PathBuf::from(&args[1]);
        let mut viewer_id: Option<String> = None;
        let mut scope_id: Option<String> = None;
        let mut debounce_ms: Option<u64> = None;
        let mut feed_capacity: Option<usize> = None;
        let mut command = Vec::new();

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--as" => {
                    let user = args.get(i + 1).ok_or_else(|| {
                        MessagingError::Config("--as requires a user id".to_string())
                    })?;
                    viewer_id = Some(user.clone());
                    i += 2;
                }
                "--scope" => {
                    let scope = args.get(i + 1).ok_or_else(|| {
                        MessagingError::Config("--scope requires an id".to_string())
                    })?;
                    scope_id = Some(scope.clone());
                    i += 2;
                }
                "--debounce-ms" => {
                    let v = args.get(i + 1).ok_or_else(|| {
                        MessagingError::Config("--debounce-ms requires a value".to_string())
                    })?;
                    debounce_ms = Some(v.parse::<u64>().map_err(|_| {
                        MessagingError::Config("--debounce-ms must be a number".to_string())
                    })?);
                    i += 2;
                }
                "--feed-capacity" => {
                    let v = args.get(i + 1).ok_or_else(|| {
                        MessagingError::Config("--feed-capacity requires a value".to_string())
                    })?;
                    feed_capacity = Some(parse_capacity(v)?);
                    i += 2;
                }
                other => {
                    command.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if viewer_id.is_none() {
            viewer_id = std::env::var("INBOX_VIEWER").ok().filter(|s| !s.is_empty());
        }
        if let Some(ms) = std::env::var("INBOX_DEBOUNCE_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            debounce_ms = Some(ms);
        }
        if let Some(cap) = std::env::var("INBOX_FEED_CAPACITY")
            .ok()
            .and_then(|s| parse_capacity(&s).ok())
        {
            feed_capacity = Some(cap);
        }

        let defaults = Self::default();
        Ok(Self {
            data_dir,
            viewer_id,
            scope_id,
            refresh_debounce: debounce_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.refresh_debounce),
            feed_capacity: feed_capacity.unwrap_or(defaults.feed_capacity),
            command,
        })
    }
}

fn parse_capacity(v: &str) -> Result<usize> {
    match v.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(MessagingError::Config(
            "--feed-capacity must be a positive number".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flags_and_command_are_split() {
        let config = Config::from_args(&args(&[
            "inbox", "/tmp/x", "--as", "alice", "send", "bob", "--scope", "course-1", "hi",
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.viewer_id.as_deref(), Some("alice"));
        assert_eq!(config.scope_id.as_deref(), Some("course-1"));
        assert_eq!(config.command, args(&["send", "bob", "hi"]));
    }

    #[test]
    fn test_missing_data_dir_is_an_error() {
        assert!(Config::from_args(&args(&["inbox"])).is_err());
    }

    #[test]
    fn test_bad_capacity_is_rejected() {
        let result = Config::from_args(&args(&["inbox", "/tmp/x", "--feed-capacity", "0"]));
        assert!(matches!(result, Err(MessagingError::Config(_))));
    }
}
