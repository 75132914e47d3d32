use chrono::{DateTime, Duration, Utc};

use crate::catalog::{BackupMeta, BackupState};
use crate::errors::{BackupError, Result};

/// Validated retention policy. At least one keep rule must be set — a
/// policy that would delete everything is rejected before any mutation.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Always retain the N most recent fully-created backups.
    pub keep_count: Option<usize>,
    /// Always retain terminal backups newer than this.
    pub keep_duration: Option<Duration>,
    /// Do not treat backups older than this as valid dedup sources.
    pub deduplicate_age_limit: Option<Duration>,
}

impl RetentionPolicy {
    pub fn from_options(
        keep_count: Option<usize>,
        keep_duration: Option<&str>,
        deduplicate_age_limit: Option<&str>,
    ) -> Result<Self> {
        let keep_duration = keep_duration.map(parse_duration).transpose()?;
        let deduplicate_age_limit = deduplicate_age_limit.map(parse_duration).transpose()?;
        if keep_count.is_none() && keep_duration.is_none() {
            return Err(BackupError::PolicyConfiguration(
                "set at least one of keep_count or keep_duration".into(),
            ));
        }
        Ok(Self {
            keep_count,
            keep_duration,
            deduplicate_age_limit,
        })
    }
}

/// Parse a duration string like "48h", "7d", "4w". Pure numeric values are
/// treated as days.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(BackupError::PolicyConfiguration("empty duration string".into()));
    }

    if let Ok(n) = s.parse::<i64>() {
        return Ok(Duration::days(n));
    }

    let split_at = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| BackupError::PolicyConfiguration(format!("invalid duration: '{s}'")))?;
    let (num_str, suffix) = s.split_at(split_at);
    let n: i64 = num_str.parse().map_err(|_| {
        BackupError::PolicyConfiguration(format!("invalid duration number: '{num_str}'"))
    })?;

    match suffix {
        "h" | "H" => Ok(Duration::hours(n)),
        "d" | "D" => Ok(Duration::days(n)),
        "w" | "W" => Ok(Duration::weeks(n)),
        _ => Err(BackupError::PolicyConfiguration(format!(
            "unknown duration suffix: '{suffix}'"
        ))),
    }
}

/// The plan: which backup ids to keep and which to schedule for deletion.
#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    pub keep: Vec<String>,
    pub delete: Vec<String>,
}

/// Decide which backups to keep and which to delete.
///
/// Terminal entries survive when they are among the `keep_count` most
/// recent created backups or newer than `keep_duration`. Entries already in
/// `deleting` state are re-scheduled so an interrupted run resumes.
/// `creating` entries are neither kept nor deleted — they belong to an
/// in-flight (or abandoned) backup the engine never touches.
pub fn compute_retention_plan(
    entries: &[BackupMeta],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> RetentionPlan {
    let mut plan = RetentionPlan::default();

    // ids of the N most recent created backups (entries arrive oldest-first)
    let recent_created: Vec<&str> = match policy.keep_count {
        Some(n) => entries
            .iter()
            .rev()
            .filter(|e| e.state == BackupState::Created)
            .take(n)
            .map(|e| e.id.as_str())
            .collect(),
        None => Vec::new(),
    };

    for entry in entries {
        match entry.state {
            BackupState::Creating => continue,
            BackupState::Deleting => plan.delete.push(entry.id.clone()),
            BackupState::Created | BackupState::PartiallyFailed => {
                let kept_by_count = recent_created.contains(&entry.id.as_str());
                let kept_by_age = policy
                    .keep_duration
                    .map(|d| entry.start_time >= now - d)
                    .unwrap_or(false);
                if kept_by_count || kept_by_age {
                    plan.keep.push(entry.id.clone());
                } else {
                    plan.delete.push(entry.id.clone());
                }
            }
        }
    }
    plan
}
