//! Bounded, persisted message history.
//!
//! All state lives in one `MessageLog` built at startup and shared with the
//! request handlers. Every accepted append rewrites the whole dump file, so
//! the on-disk history is never more than one message behind memory.

use std::collections::VecDeque;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Wire format for timestamps, minute precision.
const DATETIME_FORMAT: &str = "%d.%m.%Y %H:%M";

mod wire_datetime {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(datetime: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&datetime.format(super::DATETIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, super::DATETIME_FORMAT)
            .map_err(serde::de::Error::custom)
    }
}

/// One stored chat entry. Field names match the dump file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(with = "wire_datetime")]
    pub datetime: NaiveDateTime,
    pub method: String,
    pub message: String,
    pub ip: String,
    pub admin: bool,
}

pub type History = Vec<MessageRecord>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid history format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Per-deployment append policy. The two variants are mutually exclusive;
/// one instance runs exactly one of them.
#[derive(Debug, Clone)]
pub enum AppendPolicy {
    /// Store every non-empty message as-is.
    Open,
    /// Replace bodies containing `forbidden` with `placeholder` and skip
    /// appends whose body equals the immediately preceding one.
    Moderated {
        forbidden: String,
        placeholder: String,
    },
}

pub struct MessageLog {
    inner: Mutex<VecDeque<MessageRecord>>,
    path: PathBuf,
    capacity: usize,
    admin_ip: String,
    policy: AppendPolicy,
    resolve_hostnames: bool,
}

impl MessageLog {
    /// Load the persisted history (missing or unreadable file means an
    /// empty log) and wrap it in a ready-to-share instance.
    pub fn open<P, S>(
        path: P,
        capacity: usize,
        admin_ip: S,
        policy: AppendPolicy,
        resolve_hostnames: bool,
    ) -> MessageLog
    where
        P: Into<PathBuf>,
        S: Into<String>,
    {
        let path = path.into();
        let records = if path.exists() {
            match load(&path, capacity) {
                Ok(records) => {
                    info!("loaded {} messages from {}", records.len(), path.display());
                    records
                }
                Err(e) => {
                    warn!("could not load history from {}: {}", path.display(), e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        MessageLog {
            inner: Mutex::new(VecDeque::from(records)),
            path,
            capacity,
            admin_ip: admin_ip.into(),
            policy,
            resolve_hostnames,
        }
    }

    /// Append one message and rewrite the dump file.
    ///
    /// Empty text is a no-op; callers filter it out, this is the backstop.
    /// Under the moderated policy the append may also be skipped entirely
    /// (consecutive duplicate) or stored with the placeholder body.
    pub fn append(&self, method: &str, text: &str, addr: &str) {
        if text.is_empty() {
            return;
        }

        let ip = strip_port(addr);
        let admin = ip == self.admin_ip;
        // Lookup runs before the lock so a slow resolver never stalls readers.
        let ip_display = if self.resolve_hostnames {
            resolve_display(ip)
        } else {
            ip.to_string()
        };

        let stored = match &self.policy {
            AppendPolicy::Open => text.to_string(),
            AppendPolicy::Moderated {
                forbidden,
                placeholder,
            } => {
                if !forbidden.is_empty() && text.contains(forbidden.as_str()) {
                    placeholder.clone()
                } else {
                    text.to_string()
                }
            }
        };

        let mut records = self.inner.lock().unwrap();

        if let AppendPolicy::Moderated { .. } = self.policy {
            let repeated = records.back().map_or(false, |last| last.message == stored);
            if repeated {
                return;
            }
        }

        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(MessageRecord {
            datetime: now_minute(),
            method: method.to_string(),
            message: stored,
            ip: ip_display,
            admin,
        });

        self.persist_locked(&records);
    }

    /// Independent copy of the history, oldest first.
    pub fn snapshot(&self) -> History {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    /// The admin record nearest the end of the log, if any.
    pub fn last_admin_message(&self) -> Option<MessageRecord> {
        self.inner.lock().unwrap().iter().rev().find(|m| m.admin).cloned()
    }

    /// Flush the current history to disk, used by the shutdown hook.
    pub fn persist_now(&self) {
        let records = self.inner.lock().unwrap();
        self.persist_locked(&records);
    }

    // Best effort: a failed write is an operator problem, not a caller one.
    fn persist_locked(&self, records: &VecDeque<MessageRecord>) {
        let snapshot: History = records.iter().cloned().collect();
        if let Err(e) = persist(&self.path, &snapshot) {
            error!("could not persist history to {}: {}", self.path.display(), e);
        }
    }
}

/// Serialize the full history to `path`, replacing previous contents.
pub fn persist(path: &Path, records: &[MessageRecord]) -> Result<(), StoreError> {
    let data = serde_json::to_string_pretty(records)?;
    fs::write(path, data)?;
    Ok(())
}

/// Read a history dump, keeping only the most recent `capacity` records.
pub fn load(path: &Path, capacity: usize) -> Result<History, StoreError> {
    let data = fs::read_to_string(path)?;
    let mut records: History = serde_json::from_str(&data)?;
    let excess = records.len().saturating_sub(capacity);
    if excess > 0 {
        records.drain(..excess);
    }
    Ok(records)
}

/// Drop a trailing `:port` from an address. Bare IPv6 addresses pass
/// through untouched; bracketed ones lose brackets and port.
fn strip_port(addr: &str) -> &str {
    if addr.starts_with('[') {
        return addr[1..].split(']').next().unwrap_or(addr);
    }
    if addr.matches(':').count() == 1 {
        addr.split(':').next().unwrap_or(addr)
    } else {
        addr
    }
}

// Reverse lookup is best effort; any failure falls back to the bare address.
fn resolve_display(ip: &str) -> String {
    let parsed: IpAddr = match ip.parse() {
        Ok(parsed) => parsed,
        Err(_) => return ip.to_string(),
    };
    match dns_lookup::lookup_addr(&parsed) {
        Ok(host) => format!("{} ({})", ip, host),
        Err(_) => ip.to_string(),
    }
}

// Minute precision keeps the stored value identical to its wire form.
fn now_minute() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}
