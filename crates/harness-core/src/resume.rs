//! Resume-point detection for line-oriented result files.
//!
//! A result file is a sequence of unit blocks. A block opens with a line
//! naming its unit number and is complete once a closing phrase appears. The
//! resume point is the last complete block; anything after it is a
//! half-written block and is discarded on restore.

use crate::markers::MarkerError;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Where a checkpointed result file can be resumed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    /// Unit number of the last fully written block.
    pub last_completed_unit: u64,
    /// Byte offset just past the closing line of that block.
    pub byte_offset: usize,
    /// Number of complete blocks in the file.
    pub completed_units: usize,
}

/// Scans result content for the last completed unit.
#[derive(Debug, Clone)]
pub struct ResumeScanner {
    unit_start: Regex,
    closing_phrase: String,
}

impl ResumeScanner {
    /// `unit_start` must capture the unit number in group 1.
    pub fn new(unit_start: &str, closing_phrase: impl Into<String>) -> Result<Self, MarkerError> {
        let unit_start = Regex::new(unit_start).map_err(|source| MarkerError::InvalidPattern {
            pattern: unit_start.to_string(),
            source,
        })?;
        Ok(Self {
            unit_start,
            closing_phrase: closing_phrase.into(),
        })
    }

    pub fn scan(&self, content: &str) -> Option<ResumePoint> {
        let mut offset = 0usize;
        let mut open_unit: Option<u64> = None;
        let mut last: Option<ResumePoint> = None;
        let mut completed_units = 0usize;

        for line in content.split_inclusive('\n') {
            offset += line.len();
            // A closing phrase without its newline may still be mid-write.
            if !line.ends_with('\n') {
                break;
            }
            let trimmed = line.trim();

            if let Some(caps) = self.unit_start.captures(trimmed) {
                open_unit = caps.get(1).and_then(|m| m.as_str().parse().ok());
                continue;
            }

            if trimmed.contains(&self.closing_phrase) {
                if let Some(unit) = open_unit.take() {
                    completed_units += 1;
                    last = Some(ResumePoint {
                        last_completed_unit: unit,
                        byte_offset: offset,
                        completed_units,
                    });
                }
            }
        }

        last
    }

    /// Content up to and including the last completed block.
    pub fn trim_to_resume_point<'a>(&self, content: &'a str) -> (&'a str, Option<ResumePoint>) {
        match self.scan(content) {
            Some(point) => (&content[..point.byte_offset], Some(point)),
            None => ("", None),
        }
    }
}
