//! Progress decoding for downloader output
//!
//! The downloader is run with a progress template that prints one
//! `[progress] {...}` line per update. Lines announcing that the file already
//! exists end the stream early.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

use crate::process::{Transform, TransformStep};

/// Value for `--progress-template` that produces lines this module understands
pub const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress)j";

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[progress\]\s*(\{.*\})\s*$").expect("progress pattern is valid"))
}

fn already_downloaded_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"has already been downloaded").expect("pattern is valid"))
}

/// A decoded line of downloader output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Structured payload from a `[progress]` line
    Progress(Value),
    /// Any other line, only produced in pass-through mode
    Line(String),
}

impl ProgressEvent {
    /// Download completion in percent, when the payload carries byte counts
    pub fn percent(&self) -> Option<f64> {
        let ProgressEvent::Progress(payload) = self else {
            return None;
        };

        let downloaded = payload.get("downloaded_bytes")?.as_f64()?;
        let total = payload
            .get("total_bytes")
            .and_then(Value::as_f64)
            .or_else(|| payload.get("total_bytes_estimate").and_then(Value::as_f64))?;

        if total <= 0.0 {
            return None;
        }
        Some((downloaded / total * 100.0).min(100.0))
    }

    /// Downloader status string (`downloading`, `finished`, ...)
    pub fn status(&self) -> Option<&str> {
        match self {
            ProgressEvent::Progress(payload) => payload.get("status").and_then(Value::as_str),
            ProgressEvent::Line(_) => None,
        }
    }
}

/// Line transform recognising progress and already-downloaded markers
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressTransform {
    /// Yield unrecognised lines as `ProgressEvent::Line` instead of dropping them
    pub passthrough: bool,
}

impl ProgressTransform {
    pub fn new(passthrough: bool) -> Self {
        Self { passthrough }
    }

    /// Decode a single output line
    pub fn decode(&self, line: &str) -> Result<TransformStep<ProgressEvent>> {
        if let Some(caps) = progress_re().captures(line) {
            let payload = &caps[1];
            let value: Value = serde_json::from_str(payload)
                .with_context(|| format!("Invalid progress payload: {payload}"))?;
            return Ok(TransformStep::Emit(ProgressEvent::Progress(value)));
        }

        if already_downloaded_re().is_match(line) {
            return Ok(TransformStep::Stop);
        }

        if self.passthrough {
            Ok(TransformStep::Emit(ProgressEvent::Line(line.to_string())))
        } else {
            Ok(TransformStep::Skip)
        }
    }

    pub fn into_transform(self) -> Transform<ProgressEvent> {
        Arc::new(move |line: &str| self.decode(line))
    }
}
