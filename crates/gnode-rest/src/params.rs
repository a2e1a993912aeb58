//! Request parameter cleaning.
//!
//! Recognised control parameters are parsed into [`QueryOptions`]; everything
//! else is kept aside as a filter candidate and validated later against the
//! entity type's descriptor table.

use chrono::{DateTime, Utc};
use gnode_shared::constants::DEFAULT_MAX_RESULTS;
use gnode_shared::{LifecycleState, ResponseMode};

use crate::error::{RestError, Result};
use crate::fields::parse_datetime;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub offset: usize,
    pub max_results: usize,
    pub mode: ResponseMode,
    pub cascade: bool,
    pub at_time: Option<DateTime<Utc>>,
    pub bulk_update: bool,
    /// Bulk operations touch only the writable subset instead of failing.
    pub lenient: bool,
    /// Multi-valued references: union (true) or overwrite (false).
    pub m2m_append: bool,
    pub state: LifecycleState,
    /// Parameters left for the filter compiler, in request order.
    pub filters: Vec<(String, String)>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            max_results: DEFAULT_MAX_RESULTS,
            mode: ResponseMode::Full,
            cascade: false,
            at_time: None,
            bulk_update: false,
            lenient: false,
            m2m_append: true,
            state: LifecycleState::Active,
            filters: Vec::new(),
        }
    }
}

impl QueryOptions {
    pub fn parse(params: &[(String, String)], default_max_results: usize) -> Result<Self> {
        let mut opts = Self {
            max_results: default_max_results,
            ..Self::default()
        };

        for (key, value) in params {
            match key.as_str() {
                "offset" => opts.offset = parse_usize(key, value)?,
                "max_results" => {
                    let n: i64 = value
                        .trim()
                        .parse()
                        .map_err(|_| wrong(key, value))?;
                    opts.max_results = n.unsigned_abs() as usize;
                }
                "q" => opts.mode = value.parse().map_err(|_| wrong(key, value))?,
                "cascade" => opts.cascade = parse_flag(key, value)?,
                "bulk_update" => opts.bulk_update = parse_flag(key, value)?,
                "lenient" => opts.lenient = parse_flag(key, value)?,
                "m2m_append" => opts.m2m_append = parse_flag(key, value)?,
                "state" => opts.state = value.parse().map_err(|_| wrong(key, value))?,
                "at_time" => {
                    opts.at_time = Some(parse_datetime(value).ok_or_else(|| wrong(key, value))?)
                }
                _ => opts.filters.push((key.clone(), value.clone())),
            }
        }
        Ok(opts)
    }

    /// The `[start, end)` window applied to an identifier list of `total`.
    pub fn window(&self, total: usize) -> std::ops::Range<usize> {
        let start = self.offset.min(total);
        let end = start.saturating_add(self.max_results).min(total);
        start..end
    }
}

fn wrong(key: &str, value: &str) -> RestError {
    RestError::WrongParams(format!("invalid value '{value}' for '{key}'"))
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| wrong(key, value))
}

pub fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(wrong(key, value)),
    }
}
