//! The paginated query cacher.
//!
//! A multi-page query goes through three steps. *Check* probes cached pages from offset 0 until
//! one is missing or short. *Fill*, only when the check finds a gap, asks the backend for the
//! total with an uncached `COUNT`, works out how many pages that is, and fetches every page not
//! already cached on the worker pool. *Stream* then reads the pages back in ascending offset
//! order and yields their records one at a time.

use crate::adapter::FmqlTransport;
use crate::config::{CacherConfig, CorruptEntryPolicy};
use crate::error::{CacheError, Result};
use crate::lock::FillLock;
use crate::query::{FileId, FmqlQuery, PagedQuery};
use crate::store::{CachedResponse, DiskCacheStore};
use crate::worker::{TaskRunner, ThreadedRunner};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Result of probing the cached pages of a paged query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completeness {
    /// Every page up to and including a short last page is cached.
    Complete { pages: u64 },
    /// `cached_pages` consecutive full pages are cached; the page at `missing_offset` is not.
    Incomplete {
        cached_pages: u64,
        missing_offset: u64,
    },
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete { .. })
    }
}

/// What a fill did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FillReport {
    /// Records reported by `COUNT`; `None` if the cache turned out complete once locked.
    pub total: Option<u64>,
    /// Pages the fill expects to exist; `None` together with `total`.
    pub expected_pages: Option<u64>,
    /// Pages fetched from the backend by this fill.
    pub fetched: usize,
}

/// One type of the schema listing, with its `DESCRIBE TYPE` document.
#[derive(Clone, Debug, PartialEq)]
pub struct SchemaType {
    pub file: FileId,
    /// The `DESCRIBE TYPE` reply, with `count` copied in from `SELECT TYPES` when listed there.
    pub document: Value,
}

/// Caches FMQL replies for one VistA.
#[derive(Debug)]
pub struct FmqlCacher {
    config: CacherConfig,
    store: DiskCacheStore,
    transport: Option<Arc<dyn FmqlTransport>>,
    runner: Arc<dyn TaskRunner>,
}

impl FmqlCacher {
    /// A cacher that fetches misses through `transport`.
    pub fn new(config: CacherConfig, transport: Arc<dyn FmqlTransport>) -> Result<Self> {
        Self::open(config, Some(transport))
    }

    /// A cacher over an existing cache only; any miss fails with
    /// [`CacheError::NoBackendConfigured`].
    pub fn offline(config: CacherConfig) -> Result<Self> {
        Self::open(config, None)
    }

    fn open(config: CacherConfig, transport: Option<Arc<dyn FmqlTransport>>) -> Result<Self> {
        let store = DiskCacheStore::open(&config.caches_root)?;
        store.ensure_vista_directory(&config.vista_label)?;
        let runner = Arc::new(ThreadedRunner::new(config.pool_size));
        Ok(Self {
            config,
            store,
            transport,
            runner,
        })
    }

    /// Replace the worker pool used for fills.
    pub fn with_runner(mut self, runner: impl TaskRunner + 'static) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    pub fn config(&self) -> &CacherConfig {
        &self.config
    }

    pub fn store(&self) -> &DiskCacheStore {
        &self.store
    }

    pub fn vista_label(&self) -> &str {
        &self.config.vista_label
    }

    pub fn is_online(&self) -> bool {
        self.transport.is_some()
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.store.clear_cache(&self.config.vista_label)
    }

    /// One document, from the cache when present. `COUNT` always goes to the backend and is
    /// never persisted.
    pub fn fetch_single(&self, query: &FmqlQuery) -> Result<CachedResponse> {
        if !query.is_cacheable() {
            let bytes = self.fetch_with_retry(query)?;
            return parse_reply(query, &bytes);
        }

        let key = query.to_string();
        if let Some(cached) = self.lookup(&key)? {
            tracing::debug!(
                target = "vdm.cache",
                vista = %self.vista_label(),
                query = %key,
                "cache hit"
            );
            return Ok(cached);
        }
        tracing::debug!(
            target = "vdm.cache",
            vista = %self.vista_label(),
            query = %key,
            "cache miss"
        );
        self.fetch_and_store(query)
    }

    /// Number of entries in `file`, straight from the backend.
    pub fn count(&self, file: &FileId) -> Result<u64> {
        let query = FmqlQuery::Count(file.clone());
        let reply = self.fetch_single(&query)?;
        reply.count().ok_or_else(|| CacheError::InvalidResponse {
            query: query.to_string(),
            message: "reply has no numeric count".to_owned(),
        })
    }

    /// Probe the cached pages of `base`. Never contacts the backend.
    pub fn completeness(&self, base: &PagedQuery, limit: Option<u64>) -> Result<Completeness> {
        let limit = self.limit_for(base, limit);
        let mut offset = 0;
        let mut pages = 0;
        loop {
            let key = base.page(limit, offset).to_string();
            match self.lookup(&key)? {
                None => {
                    return Ok(Completeness::Incomplete {
                        cached_pages: pages,
                        missing_offset: offset,
                    })
                }
                Some(page) => {
                    pages += 1;
                    if page.page_len() != limit {
                        return Ok(Completeness::Complete { pages });
                    }
                }
            }
            offset += limit;
        }
    }

    /// Fetch every page of `base` that is not validly cached.
    ///
    /// Holds the VistA's fill lock throughout. The first failing page aborts the fill; pages
    /// written before that stay cached and are skipped by the next fill.
    pub fn fill(&self, base: &PagedQuery, limit: Option<u64>) -> Result<FillReport> {
        let limit = self.limit_for(base, limit);
        self.transport()?;
        let _lock = FillLock::acquire(&self.store, self.vista_label())?;

        // Another filler may have finished while we waited for the lock.
        if self.completeness(base, Some(limit))?.is_complete() {
            return Ok(FillReport::default());
        }

        let started = Instant::now();
        let total = self.count(base.file())?;
        let pages = self.config.page_count(total, limit);
        let mut tasks = Vec::new();
        for page in 0..pages {
            let query = base.page(limit, page * limit);
            if self.lookup(&query.to_string())?.is_none() {
                tasks.push(query);
            }
        }
        let fetched = tasks.len();

        tracing::info!(
            target = "vdm.cache",
            vista = %self.vista_label(),
            query = %base,
            total,
            pages,
            missing = fetched,
            "filling paged query"
        );
        self.runner.run(tasks, &|query| self.fetch_and_store(&query).map(drop))?;
        tracing::info!(
            target = "vdm.cache",
            vista = %self.vista_label(),
            query = %base,
            pages,
            fetched,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "filled paged query"
        );

        Ok(FillReport {
            total: Some(total),
            expected_pages: Some(pages),
            fetched,
        })
    }

    /// Every record of `base`, page by page, filling the cache first if it has gaps.
    ///
    /// Records are read lazily: only one page is held in memory at a time.
    pub fn fetch_paginated(&self, base: &PagedQuery, limit: Option<u64>) -> Result<PageStream<'_>> {
        let limit = self.limit_for(base, limit);
        let expected_pages = match self.completeness(base, Some(limit))? {
            Completeness::Complete { pages } => {
                tracing::debug!(
                    target = "vdm.cache",
                    vista = %self.vista_label(),
                    query = %base,
                    pages,
                    "paged query fully cached"
                );
                None
            }
            Completeness::Incomplete { .. } => self.fill(base, Some(limit))?.expected_pages,
        };
        Ok(PageStream {
            cacher: self,
            base: base.clone(),
            limit,
            next_offset: 0,
            pages_read: 0,
            expected_pages,
            current: Vec::new().into_iter(),
            done: false,
        })
    }

    /// `SELECT TYPES`, then a `DESCRIBE TYPE` for every listed type, fetching the missing ones
    /// on the worker pool.
    pub fn describe_schema_types(&self) -> Result<SchemaTypes<'_>> {
        let listing = self.fetch_single(&FmqlQuery::SelectTypes)?;
        let types = schema_listing(&listing);

        // A type listed twice is still fetched by one worker only.
        let mut seen = BTreeSet::new();
        let mut missing = Vec::new();
        for (file, _) in &types {
            if !seen.insert(file.as_str()) {
                continue;
            }
            let query = FmqlQuery::DescribeType(file.clone());
            if self.lookup(&query.to_string())?.is_none() {
                missing.push(query);
            }
        }

        if !missing.is_empty() {
            self.transport()?;
            let _lock = FillLock::acquire(&self.store, self.vista_label())?;
            let started = Instant::now();
            let fetched = missing.len();
            tracing::info!(
                target = "vdm.cache",
                vista = %self.vista_label(),
                types = types.len(),
                missing = fetched,
                "caching schema"
            );
            self.runner.run(missing, &|query| {
                if self.lookup(&query.to_string())?.is_some() {
                    return Ok(());
                }
                self.fetch_and_store(&query).map(drop)
            })?;
            tracing::info!(
                target = "vdm.cache",
                vista = %self.vista_label(),
                fetched,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "cached schema"
            );
        }

        Ok(SchemaTypes {
            cacher: self,
            types: types.into_iter(),
        })
    }

    /// Whether `describe_schema_types` can run without contacting the backend.
    pub fn is_schema_cached(&self) -> Result<bool> {
        let Some(listing) = self.lookup(&FmqlQuery::SelectTypes.to_string())? else {
            return Ok(false);
        };
        for (file, _) in schema_listing(&listing) {
            if self
                .lookup(&FmqlQuery::DescribeType(file).to_string())?
                .is_none()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn limit_for(&self, base: &PagedQuery, limit: Option<u64>) -> u64 {
        limit
            .unwrap_or_else(|| self.config.default_limit_for(base))
            .max(1)
    }

    fn transport(&self) -> Result<&dyn FmqlTransport> {
        self.transport
            .as_deref()
            .ok_or(CacheError::NoBackendConfigured)
    }

    /// A valid cached entry, `None` on a miss. Corrupt entries follow the configured policy.
    fn lookup(&self, key: &str) -> Result<Option<CachedResponse>> {
        match self.store.read(self.vista_label(), key) {
            Ok(cached) => Ok(Some(cached)),
            Err(CacheError::NotFound { .. }) => Ok(None),
            Err(CacheError::CorruptCacheEntry { path, message })
                if self.config.corrupt_entries == CorruptEntryPolicy::TreatAsMiss =>
            {
                tracing::warn!(
                    target = "vdm.cache",
                    path = %path.display(),
                    error = %message,
                    "ignoring corrupt cache entry"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn fetch_and_store(&self, query: &FmqlQuery) -> Result<CachedResponse> {
        let bytes = self.fetch_with_retry(query)?;
        parse_reply(query, &bytes)?;
        let key = query.to_string();
        let response = self.store.write_raw(self.vista_label(), &key, &bytes)?;
        tracing::info!(target = "vdm.cache", vista = %self.vista_label(), query = %key, "cached");
        Ok(response)
    }

    fn fetch_with_retry(&self, query: &FmqlQuery) -> Result<Vec<u8>> {
        let transport = self.transport()?;
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            match transport.execute(query) {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_transient() && attempt < self.config.fetch_retries => {
                    attempt += 1;
                    tracing::warn!(
                        target = "vdm.cache",
                        vista = %self.vista_label(),
                        query = %query,
                        attempt,
                        error = %err,
                        "retrying FMQL call"
                    );
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// A reply must be JSON and must not be an FMQL error document.
fn parse_reply(query: &FmqlQuery, bytes: &[u8]) -> Result<CachedResponse> {
    let reply = CachedResponse::from_slice(bytes).map_err(|err| CacheError::InvalidResponse {
        query: query.to_string(),
        message: err.to_string(),
    })?;
    if let Some(error) = reply.error() {
        return Err(CacheError::InvalidResponse {
            query: query.to_string(),
            message: format!("FMQL error: {error}"),
        });
    }
    Ok(reply)
}

/// `(file, count)` for every row of a `SELECT TYPES` reply that names a valid file number.
fn schema_listing(listing: &CachedResponse) -> Vec<(FileId, Option<Value>)> {
    listing
        .results()
        .iter()
        .filter_map(|row| {
            let number = match row.get("number")? {
                Value::String(number) => number.clone(),
                Value::Number(number) => number.to_string(),
                _ => return None,
            };
            let Some(file) = FileId::new(&number) else {
                tracing::debug!(
                    target = "vdm.cache",
                    number = %number,
                    "skipping unparseable type number"
                );
                return None;
            };
            Some((file, row.get("count").cloned()))
        })
        .collect()
}

/// The records of a paged query, read from the cache one page at a time.
#[derive(Debug)]
pub struct PageStream<'a> {
    cacher: &'a FmqlCacher,
    base: PagedQuery,
    limit: u64,
    next_offset: u64,
    pages_read: u64,
    expected_pages: Option<u64>,
    current: std::vec::IntoIter<Value>,
    done: bool,
}

impl PageStream<'_> {
    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }

    fn next_page(&mut self) -> Result<()> {
        let key = self.base.page(self.limit, self.next_offset).to_string();
        let page = match self.cacher.store.read(self.cacher.vista_label(), &key) {
            Ok(page) => page,
            Err(CacheError::NotFound { .. }) => {
                return Err(CacheError::CacheInvariantViolation { query: key })
            }
            Err(err) => return Err(err),
        };
        self.pages_read += 1;
        self.next_offset += self.limit;
        if page.page_len() != self.limit {
            self.done = true;
        }
        self.current = page.into_results().into_iter();
        Ok(())
    }
}

impl Iterator for PageStream<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }
            if self
                .expected_pages
                .is_some_and(|expected| self.pages_read >= expected)
            {
                self.done = true;
                return None;
            }
            if let Err(err) = self.next_page() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}

/// The schema, one type at a time, in `SELECT TYPES` order.
#[derive(Debug)]
pub struct SchemaTypes<'a> {
    cacher: &'a FmqlCacher,
    types: std::vec::IntoIter<(FileId, Option<Value>)>,
}

impl Iterator for SchemaTypes<'_> {
    type Item = Result<SchemaType>;

    fn next(&mut self) -> Option<Self::Item> {
        let (file, count) = self.types.next()?;
        let key = FmqlQuery::DescribeType(file.clone()).to_string();
        let document = match self.cacher.store.read(self.cacher.vista_label(), &key) {
            Ok(document) => document.into_value(),
            Err(CacheError::NotFound { .. }) => {
                return Some(Err(CacheError::CacheInvariantViolation { query: key }))
            }
            Err(err) => return Some(Err(err)),
        };
        let document = match (document, count) {
            (Value::Object(mut map), Some(count)) => {
                map.insert("count".to_owned(), count);
                Value::Object(map)
            }
            (document, _) => document,
        };
        Some(Ok(SchemaType { file, document }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.types.size_hint()
    }
}
