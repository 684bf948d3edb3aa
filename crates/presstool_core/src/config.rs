use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::ResolvedPaths;

pub const DEFAULT_USER_AGENT: &str = "presstool/0.1";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MEDIA_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MEDIA_MAX_BYTES: u64 = 25 * 1024 * 1024;
pub const DEFAULT_MEDIA_RETRIES: usize = 2;
pub const DEFAULT_MEDIA_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PressConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub migration: MigrationSection,
    #[serde(default)]
    pub media: MediaSection,
    #[serde(default)]
    pub mapping: MappingSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub url: Option<String>,
    pub timezone_offset: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrationSection {
    pub batch_size: Option<usize>,
    pub log_dir: Option<String>,
    pub csv_reports: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MediaSection {
    pub timeout_ms: Option<u64>,
    pub max_bytes: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub uploads_dir: Option<String>,
}

/// Column alias lists per normalized field; the first alias present in a row wins.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MappingSection {
    pub id: Option<Vec<String>>,
    pub title: Option<Vec<String>>,
    pub slug: Option<Vec<String>>,
    pub date: Option<Vec<String>>,
    pub author: Option<Vec<String>>,
    pub body: Option<Vec<String>>,
    pub excerpt: Option<Vec<String>>,
    pub featured_image: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub required: Option<Vec<String>>,
    #[serde(default)]
    pub author_aliases: BTreeMap<String, String>,
}

impl PressConfig {
    /// Resolve user agent: env PRESSTOOL_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Some(value) = env_override("PRESSTOOL_USER_AGENT") {
            return value;
        }
        self.site
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve batch size: env PRESSTOOL_BATCH_SIZE > config > DEFAULT_BATCH_SIZE.
    pub fn batch_size(&self) -> usize {
        if let Some(value) = env_override("PRESSTOOL_BATCH_SIZE")
            && let Ok(parsed) = value.parse::<usize>()
            && parsed > 0
        {
            return parsed;
        }
        self.migration
            .batch_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn csv_reports(&self) -> bool {
        self.migration.csv_reports.unwrap_or(true)
    }

    pub fn timezone_offset(&self) -> Result<FixedOffset> {
        match self.site.timezone_offset.as_deref() {
            Some(value) => parse_timezone_offset(value),
            None => Ok(utc_offset()),
        }
    }

    pub fn log_dir(&self, paths: &ResolvedPaths) -> PathBuf {
        match self.migration.log_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => absolutize(dir, &paths.project_root),
            _ => paths.logs_dir.clone(),
        }
    }

    pub fn uploads_dir(&self, paths: &ResolvedPaths) -> PathBuf {
        match self.media.uploads_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => absolutize(dir, &paths.project_root),
            _ => paths.uploads_dir.clone(),
        }
    }

    pub fn media_timeout_ms(&self) -> u64 {
        self.media.timeout_ms.unwrap_or(DEFAULT_MEDIA_TIMEOUT_MS)
    }

    pub fn media_max_bytes(&self) -> u64 {
        self.media.max_bytes.unwrap_or(DEFAULT_MEDIA_MAX_BYTES)
    }

    pub fn media_retries(&self) -> usize {
        self.media.retries.unwrap_or(DEFAULT_MEDIA_RETRIES)
    }

    pub fn media_retry_delay_ms(&self) -> u64 {
        self.media
            .retry_delay_ms
            .unwrap_or(DEFAULT_MEDIA_RETRY_DELAY_MS)
    }
}

/// Load and parse a PressConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<PressConfig> {
    if !config_path.exists() {
        return Ok(PressConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: PressConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    parsed
        .timezone_offset()
        .with_context(|| format!("invalid [site] timezone_offset in {}", config_path.display()))?;
    Ok(parsed)
}

/// Parse `+HH:MM`, `-HH:MM`, `+HHMM` or `Z`/`UTC` into a fixed offset.
pub fn parse_timezone_offset(value: &str) -> Result<FixedOffset> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc")
    {
        return Ok(utc_offset());
    }

    let (sign, rest) = match trimmed.as_bytes()[0] {
        b'+' => (1, &trimmed[1..]),
        b'-' => (-1, &trimmed[1..]),
        _ => bail!("timezone offset must start with + or -: {trimmed}"),
    };
    let digits = rest.replace(':', "");
    if digits.len() != 4 || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        bail!("timezone offset must look like +HH:MM: {trimmed}");
    }
    let hours: i32 = digits[..2].parse().context("invalid offset hours")?;
    let minutes: i32 = digits[2..].parse().context("invalid offset minutes")?;
    if hours > 14 || minutes > 59 {
        bail!("timezone offset out of range: {trimmed}");
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow::anyhow!("timezone offset out of range: {trimmed}"))
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn absolutize(value: &str, project_root: &Path) -> PathBuf {
    let path = Path::new(value.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}
