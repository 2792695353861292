//! Disk-backed cache of FMQL query replies for one or more VistA systems.
//!
//! This crate turns a remote, paginated, rate-limited query interface into a resumable local
//! cache:
//! - [`FmqlQuery`] / [`PagedQuery`]: the query shapes, rendered to strings only at the edges
//! - [`FmqlInterface`]: an FMQL web endpoint or the `CG FMQL QP` RPC over a pooled
//!   [`BrokerConnector`] session
//! - [`DiskCacheStore`]: one JSON document per query, written atomically
//! - [`FmqlCacher`]: cache-first single queries, parallel fills of paged queries, and lazy
//!   streaming of their records
//!
//! ## On-disk layout
//!
//! `<caches_root>/<label>/<query>.json`, where both `label` and `query` have spaces and
//! filesystem-unsafe characters replaced by `_`, e.g.
//! `Caches/CGVISTA/DESCRIBE_9_6_CSTOP_100_LIMIT_200_OFFSET_0.json`. Each VistA directory also
//! holds a `.fill.lock` taken while pages are being fetched into it.
//!
//! Entries are never modified once written and never removed by this crate.

mod adapter;
mod broker;
mod cacher;
mod config;
mod describe;
mod error;
mod lock;
mod pool;
mod query;
mod store;
mod worker;

pub use adapter::{EndpointTransport, FmqlInterface, FmqlTransport, RpcTransport};
pub use broker::{
    decode_reply, encode_request, BrokerConnector, BrokerCredentials, BrokerSession, CipherPad,
    DEFAULT_CONTEXT,
};
pub use cacher::{Completeness, FillReport, FmqlCacher, PageStream, SchemaType, SchemaTypes};
pub use config::{
    CacherConfig, CorruptEntryPolicy, PageRounding, DEFAULT_CSTOP, DEFAULT_DESCRIBE_LIMIT,
    DEFAULT_POOL_SIZE, DEFAULT_SELECT_LIMIT,
};
pub use describe::{DescribeResult, CONTAINER_FIELD};
pub use error::{CacheError, Result};
pub use lock::FillLock;
pub use pool::{ConnectionPool, PooledSession, RpcConnector, RpcSession};
pub use query::{FileId, FmqlQuery, PagedQuery};
pub use store::{sanitize_component, CachedResponse, DiskCacheStore};
pub use worker::{InlineRunner, Job, TaskRunner, ThreadedRunner};
