//! Append-only cost decision log
//!
//! Decisions are kept in memory for status queries and, when a path is
//! configured, appended to a JSON-lines file. Existing entries are never
//! rewritten.

use crate::models::CostDecision;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default number of decisions kept in memory
const DEFAULT_MAX_IN_MEMORY: usize = 1_000;

#[derive(Debug, Clone)]
pub struct DecisionLogConfig {
    /// JSON-lines file the log is appended to (optional)
    pub path: Option<PathBuf>,
    pub max_in_memory: usize,
}

impl Default for DecisionLogConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_in_memory: DEFAULT_MAX_IN_MEMORY,
        }
    }
}

pub struct DecisionLog {
    entries: VecDeque<CostDecision>,
    config: DecisionLogConfig,
}

impl DecisionLog {
    /// Open the log, loading entries already on disk
    pub fn open(config: DecisionLogConfig) -> Result<Self> {
        let mut log = Self {
            entries: VecDeque::new(),
            config,
        };

        if let Some(path) = log.config.path.clone() {
            if path.exists() {
                for decision in load(&path)? {
                    log.remember(decision);
                }
                info!(path = %path.display(), entries = log.entries.len(), "Loaded decision log");
            }
        }

        Ok(log)
    }

    /// In-memory log with no persistence
    pub fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            config: DecisionLogConfig::default(),
        }
    }

    /// Append a decision, persisting it first when a path is configured
    pub fn append(&mut self, decision: CostDecision) -> Result<()> {
        if let Some(path) = &self.config.path {
            append_line(path, &decision)?;
            debug!(path = %path.display(), target = decision.target_node_count, "Decision appended");
        }
        self.remember(decision);
        Ok(())
    }

    pub fn last(&self) -> Option<&CostDecision> {
        self.entries.back()
    }

    /// Most recent `n` decisions, oldest first
    pub fn tail(&self, n: usize) -> Vec<CostDecision> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remember(&mut self, decision: CostDecision) {
        self.entries.push_back(decision);
        while self.entries.len() > self.config.max_in_memory.max(1) {
            self.entries.pop_front();
        }
    }
}

fn append_line(path: &Path, decision: &CostDecision) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    let mut line = serde_json::to_vec(decision).context("Failed to serialize decision")?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open decision log {:?}", path))?;
    file.write_all(&line)
        .context("Failed to write decision")?;
    file.sync_data().context("Failed to sync decision log")?;
    Ok(())
}

/// Read every decision stored at `path`, skipping malformed lines
pub fn load(path: &Path) -> Result<Vec<CostDecision>> {
    let file = File::open(path).with_context(|| format!("Failed to open decision log {:?}", path))?;
    let mut decisions = Vec::new();

    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("Failed to read decision log")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CostDecision>(&line) {
            Ok(decision) => decisions.push(decision),
            Err(e) => warn!(
                path = %path.display(),
                line = number + 1,
                error = %e,
                "Skipping malformed decision log entry"
            ),
        }
    }

    Ok(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn decision(minute: u32, target: u32) -> CostDecision {
        CostDecision {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 3, 20, minute, 0).unwrap(),
            target_node_count: target,
            reason: "idle beyond idle window".to_string(),
        }
    }

    #[test]
    fn test_append_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("decisions.jsonl");
        let config = DecisionLogConfig {
            path: Some(path.clone()),
            ..Default::default()
        };

        let mut log = DecisionLog::open(config.clone()).unwrap();
        assert!(log.is_empty());
        log.append(decision(0, 1)).unwrap();
        log.append(decision(30, 0)).unwrap();

        let reopened = DecisionLog::open(config).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.last(), Some(&decision(30, 0)));
        assert_eq!(load(&path).unwrap(), vec![decision(0, 1), decision(30, 0)]);
    }

    #[test]
    fn test_existing_lines_are_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        std::fs::write(&path, "not json\n\n").unwrap();

        let mut log = DecisionLog::open(DecisionLogConfig {
            path: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();
        assert!(log.is_empty());
        log.append(decision(5, 1)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("not json\n"));
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn test_tail_and_memory_bound() {
        let mut log = DecisionLog::open(DecisionLogConfig {
            path: None,
            max_in_memory: 3,
        })
        .unwrap();
        for minute in 0..5 {
            log.append(decision(minute, minute % 2)).unwrap();
        }

        assert_eq!(log.len(), 3);
        let tail = log.tail(2);
        assert_eq!(tail, vec![decision(3, 1), decision(4, 0)]);
        assert_eq!(log.tail(10).len(), 3);
        assert_eq!(DecisionLog::in_memory().tail(5), Vec::<CostDecision>::new());
    }
}
