//! Process-wide configuration, read once at startup and immutable after.

use std::env;
use std::path::PathBuf;

use tracing::warn;

use crate::message_log::AppendPolicy;

pub struct Config {
    pub bind_addr: String,
    pub history_file: PathBuf,
    pub max_history: usize,
    pub admin_ip: String,
    pub resolve_hostnames: bool,
    pub files_dir: PathBuf,
    pub policy: AppendPolicy,
}

impl Config {
    pub fn from_env() -> Config {
        dotenvy::dotenv().ok();

        let policy = if flag("BABBEL_MODERATION") {
            AppendPolicy::Moderated {
                forbidden: var_or("BABBEL_FORBIDDEN_WORD", "govno"),
                placeholder: var_or("BABBEL_FILTERED_TEXT", "[message removed]"),
            }
        } else {
            AppendPolicy::Open
        };

        Config {
            bind_addr: var_or("BABBEL_BIND", "127.0.0.1:8000"),
            history_file: PathBuf::from(var_or("BABBEL_HISTORY_FILE", "message_history.json")),
            max_history: usize_or("BABBEL_MAX_HISTORY", 100),
            admin_ip: var_or("BABBEL_ADMIN_IP", "127.0.0.1"),
            resolve_hostnames: flag("BABBEL_RESOLVE_HOSTNAMES"),
            files_dir: PathBuf::from(var_or("BABBEL_FILES_DIR", "files")),
            policy,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn flag(key: &str) -> bool {
    matches!(env::var(key).as_deref(), Ok("1") | Ok("true") | Ok("yes"))
}

fn usize_or(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                warn!("ignoring invalid {}: {:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
