//! Salary text parsing and range filtering.
//!
//! Listing salaries arrive as free text: `"15-25K"`, `"15-25K·13薪"`,
//! `"200-300元/天"`. Everything is normalised to a monthly range in K.

use crate::error::AppError;
use crate::models::CandidateJob;

/// Working days per month used to convert daily rates.
const WORKDAYS_PER_MONTH: f64 = 22.0;

/// Monthly salary range in thousands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SalaryRange {
    pub min_k: f64,
    pub max_k: f64,
}

impl SalaryRange {
    /// Parse listing salary text. Returns `None` for formats such as "面议".
    pub fn parse(text: &str) -> Option<Self> {
        let text = strip_bonus_months(text.trim());

        if let Some(daily) = text.strip_suffix("元/天") {
            let (min, max) = split_range(daily)?;
            return Some(Self {
                min_k: min * WORKDAYS_PER_MONTH / 1000.0,
                max_k: max * WORKDAYS_PER_MONTH / 1000.0,
            });
        }

        if text.contains(['k', 'K']) {
            let monthly = text.replace(['k', 'K'], "");
            let (min, max) = split_range(&monthly)?;
            return Some(Self {
                min_k: min,
                max_k: max,
            });
        }

        None
    }
}

/// Drops a trailing `·13薪` style bonus-month marker.
fn strip_bonus_months(text: &str) -> &str {
    match text.split_once('·') {
        Some((head, tail)) if tail.ends_with('薪') => head,
        _ => text,
    }
}

fn split_range(text: &str) -> Option<(f64, f64)> {
    let mut parts = text.split('-').map(str::trim);
    let min: f64 = parts.next()?.parse().ok()?;
    let max: f64 = match parts.next() {
        Some(raw) => raw.parse().ok()?,
        None => min,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((min, max))
}

/// Keeps jobs whose minimum monthly salary falls inside the configured bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SalaryFilter {
    pub min_k: f64,
    pub max_k: Option<f64>,
}

impl SalaryFilter {
    pub fn new(min_k: f64, max_k: Option<f64>) -> Result<Self, AppError> {
        if min_k < 0.0 || max_k.is_some_and(|max| max < min_k) {
            return Err(AppError::ConfigError(format!(
                "Invalid salary range {min_k}..{max_k:?}"
            )));
        }
        Ok(Self { min_k, max_k })
    }

    /// Accepts everything that parses.
    pub fn any() -> Self {
        Self {
            min_k: 0.0,
            max_k: None,
        }
    }

    pub fn accepts(&self, job: &CandidateJob) -> bool {
        let Some(range) = SalaryRange::parse(&job.salary_text) else {
            tracing::warn!(job = %job.name, salary = %job.salary_text, "Unrecognised salary format");
            return false;
        };
        if range.min_k < self.min_k {
            tracing::debug!(job = %job.name, salary = %job.salary_text, "Salary below range");
            return false;
        }
        if let Some(max) = self.max_k
            && range.min_k > max
        {
            tracing::debug!(job = %job.name, salary = %job.salary_text, "Salary above range");
            return false;
        }
        true
    }

    pub fn filter(&self, jobs: Vec<CandidateJob>) -> Vec<CandidateJob> {
        jobs.into_iter().filter(|job| self.accepts(job)).collect()
    }
}

impl Default for SalaryFilter {
    fn default() -> Self {
        Self::any()
    }
}
