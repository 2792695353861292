use crate::query::PagedQuery;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_POOL_SIZE: usize = 15;
pub const DEFAULT_DESCRIBE_LIMIT: u64 = 200;
pub const DEFAULT_SELECT_LIMIT: u64 = 1000;
pub const DEFAULT_CSTOP: u64 = 100;

/// How many pages a fill expects for `total` records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageRounding {
    /// `total / limit + 1`: always one page past an exact multiple, so the last page is short.
    #[default]
    Legacy,
    /// `ceil(total / limit)`: no trailing empty page.
    Ceil,
}

impl PageRounding {
    pub fn page_count(self, total: u64, limit: u64) -> u64 {
        let limit = limit.max(1);
        match self {
            PageRounding::Legacy => total / limit + 1,
            PageRounding::Ceil => total.div_ceil(limit),
        }
    }
}

/// What a read does with an entry that is not valid JSON.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorruptEntryPolicy {
    #[default]
    TreatAsMiss,
    Fail,
}

/// Settings of one cacher, fixed for the lifetime of a VistA session.
#[derive(Clone, Debug, PartialEq)]
pub struct CacherConfig {
    pub caches_root: PathBuf,
    pub vista_label: String,
    /// Fetch workers per fill, and broker sessions per pool.
    pub pool_size: usize,
    pub describe_limit: u64,
    pub select_limit: u64,
    pub default_cstop: u64,
    pub page_rounding: PageRounding,
    pub corrupt_entries: CorruptEntryPolicy,
    pub fetch_retries: u32,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
    pub checkout_timeout: Duration,
}

impl CacherConfig {
    pub fn new(caches_root: impl Into<PathBuf>, vista_label: impl Into<String>) -> Self {
        Self {
            caches_root: caches_root.into(),
            vista_label: vista_label.into(),
            pool_size: DEFAULT_POOL_SIZE,
            describe_limit: DEFAULT_DESCRIBE_LIMIT,
            select_limit: DEFAULT_SELECT_LIMIT,
            default_cstop: DEFAULT_CSTOP,
            page_rounding: PageRounding::default(),
            corrupt_entries: CorruptEntryPolicy::default(),
            fetch_retries: 2,
            retry_backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(120),
            checkout_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_limits(mut self, describe: u64, select: u64) -> Self {
        self.describe_limit = describe.max(1);
        self.select_limit = select.max(1);
        self
    }

    pub fn with_default_cstop(mut self, cstop: u64) -> Self {
        self.default_cstop = cstop;
        self
    }

    pub fn with_page_rounding(mut self, rounding: PageRounding) -> Self {
        self.page_rounding = rounding;
        self
    }

    pub fn with_corrupt_entries(mut self, policy: CorruptEntryPolicy) -> Self {
        self.corrupt_entries = policy;
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.fetch_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_timeouts(mut self, request: Duration, checkout: Duration) -> Self {
        self.request_timeout = request;
        self.checkout_timeout = checkout;
        self
    }

    /// Page size used for `base` when the caller does not pick one.
    pub fn default_limit_for(&self, base: &PagedQuery) -> u64 {
        if base.is_bulk() {
            self.select_limit
        } else {
            self.describe_limit
        }
    }

    pub fn page_count(&self, total: u64, limit: u64) -> u64 {
        self.page_rounding.page_count(total, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FileId;

    #[test]
    fn rounding_policies() {
        assert_eq!(PageRounding::Legacy.page_count(450, 200), 3);
        assert_eq!(PageRounding::Ceil.page_count(450, 200), 3);
        assert_eq!(PageRounding::Legacy.page_count(400, 200), 3);
        assert_eq!(PageRounding::Ceil.page_count(400, 200), 2);
        assert_eq!(PageRounding::Legacy.page_count(0, 200), 1);
        assert_eq!(PageRounding::Ceil.page_count(0, 200), 0);
    }

    #[test]
    fn bulk_selects_use_the_larger_limit() {
        let config = CacherConfig::new("/tmp/caches", "GOLD");
        let file = FileId::new("2").unwrap();
        assert_eq!(config.default_limit_for(&PagedQuery::select(file.clone())), 1000);
        assert_eq!(config.default_limit_for(&PagedQuery::describe(file, 100)), 200);
    }
}
