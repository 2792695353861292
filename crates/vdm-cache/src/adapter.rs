//! Turns an [`FmqlQuery`] into a call against whichever backend a VistA is reachable through.

use crate::error::{CacheError, Result};
use crate::pool::ConnectionPool;
use crate::query::FmqlQuery;
use std::fmt;
use std::io::Read as _;
use std::sync::Arc;
use std::time::Duration;

const URL_REDACTION: &str = "<redacted>";
const MAX_BODY_BYTES: u64 = 512 * 1024 * 1024;

/// Executes one query and returns the backend's raw reply. Never retries.
pub trait FmqlTransport: Send + Sync + fmt::Debug {
    fn execute(&self, query: &FmqlQuery) -> Result<Vec<u8>>;
}

/// `GET <endpoint>?fmql=<query>` against an FMQL web endpoint.
pub struct EndpointTransport {
    agent: ureq::Agent,
    endpoint: String,
    safe_endpoint: String,
}

impl fmt::Debug for EndpointTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointTransport")
            .field("endpoint", &self.safe_endpoint)
            .finish_non_exhaustive()
    }
}

impl EndpointTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let endpoint = endpoint.into();
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            safe_endpoint: sanitize_endpoint(&endpoint),
            endpoint,
        }
    }
}

impl FmqlTransport for EndpointTransport {
    fn execute(&self, query: &FmqlQuery) -> Result<Vec<u8>> {
        let safe_endpoint = &self.safe_endpoint;
        let response = self
            .agent
            .get(&self.endpoint)
            .query("fmql", &query.to_string())
            .call()
            .map_err(|err| {
                let message = match err {
                    ureq::Error::Status(code, _response) => {
                        format!("server returned status {code} for {safe_endpoint}")
                    }
                    ureq::Error::Transport(transport) => {
                        format!("transport error for {safe_endpoint}: {}", transport.kind())
                    }
                };
                CacheError::TransportFailure { message }
            })?;

        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_BODY_BYTES)
            .read_to_end(&mut body)
            .map_err(|err| {
                CacheError::transport(format!("reading reply from {safe_endpoint}: {err}"))
            })?;
        Ok(body)
    }
}

/// Sends the compact RPC form of a query as the single parameter of `CG FMQL QP`.
#[derive(Debug)]
pub struct RpcTransport {
    pool: Arc<ConnectionPool>,
}

impl RpcTransport {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl FmqlTransport for RpcTransport {
    fn execute(&self, query: &FmqlQuery) -> Result<Vec<u8>> {
        self.pool.invoke(FmqlQuery::RPC_NAME, &[query.rpc_form()])
    }
}

/// The query interface of one VistA: an endpoint, a broker connection pool, or both.
///
/// The pool is preferred when both are configured.
#[derive(Clone, Debug)]
pub struct FmqlInterface {
    transport: Arc<dyn FmqlTransport>,
}

impl FmqlInterface {
    pub fn new(
        endpoint: Option<String>,
        pool: Option<Arc<ConnectionPool>>,
        timeout: Duration,
    ) -> Result<Self> {
        let transport: Arc<dyn FmqlTransport> = match (pool, endpoint) {
            (Some(pool), _) => Arc::new(RpcTransport::new(pool)),
            (None, Some(endpoint)) => Arc::new(EndpointTransport::new(endpoint, timeout)),
            (None, None) => return Err(CacheError::NoBackendConfigured),
        };
        Ok(Self { transport })
    }

    pub fn from_transport(transport: Arc<dyn FmqlTransport>) -> Self {
        Self { transport }
    }

    pub fn execute(&self, query: &FmqlQuery) -> Result<Vec<u8>> {
        self.transport.execute(query)
    }

    /// Parses `query` first; fails with [`CacheError::UnsupportedQueryForm`] before any I/O.
    pub fn execute_raw(&self, query: &str) -> Result<Vec<u8>> {
        let query: FmqlQuery = query.parse()?;
        self.execute(&query)
    }

    pub fn transport(&self) -> Arc<dyn FmqlTransport> {
        Arc::clone(&self.transport)
    }
}

impl FmqlTransport for FmqlInterface {
    fn execute(&self, query: &FmqlQuery) -> Result<Vec<u8>> {
        self.transport.execute(query)
    }
}

/// Drop userinfo and query values from an endpoint URL before it reaches an error message.
fn sanitize_endpoint(url: &str) -> String {
    let Some(scheme_idx) = url.find("://") else {
        return url.to_owned();
    };
    let (scheme, rest) = url.split_at(scheme_idx + 3);
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    let authority = match authority.rfind('@') {
        Some(at) => format!("{URL_REDACTION}@{}", &authority[at + 1..]),
        None => authority.to_owned(),
    };
    let tail = tail.split('#').next().unwrap_or_default();
    let tail = match tail.split_once('?') {
        Some((path, query)) => {
            let keys: Vec<String> = query
                .split('&')
                .filter(|part| !part.is_empty())
                .map(|part| {
                    let key = part.split_once('=').map_or(part, |(key, _)| key);
                    format!("{key}={URL_REDACTION}")
                })
                .collect();
            format!("{path}?{}", keys.join("&"))
        }
        None => tail.to_owned(),
    };
    format!("{scheme}{authority}{tail}")
}
