//! The FMQL query shapes understood by the cache.
//!
//! Callers build [`FmqlQuery`] values directly. The textual form (`DESCRIBE 9_6 CSTOP 100 LIMIT
//! 200 OFFSET 0`) only exists at the edges: as the cache file name, as the `fmql` parameter of an
//! endpoint request, and parsed back from user input. The broker takes a third, compact form
//! produced by [`FmqlQuery::rpc_form`].

use crate::error::CacheError;
use std::fmt;
use std::str::FromStr;

/// A FileMan file number in FMQL form (`9_6` for file `9.6`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(String);

impl FileId {
    /// Accepts either the FileMan (`9.6`) or the FMQL (`9_6`) spelling.
    pub fn new(number: &str) -> Option<Self> {
        let number = number.trim();
        if number.is_empty() || number.starts_with(['.', '_']) || number.ends_with(['.', '_']) {
            return None;
        }
        let mut separators = 0;
        for c in number.chars() {
            match c {
                '0'..='9' => {}
                '.' | '_' => separators += 1,
                _ => return None,
            }
        }
        if separators > 1 {
            return None;
        }
        Some(Self(number.replace('.', "_")))
    }

    /// The FMQL spelling, as used in queries.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The FileMan spelling (`9.6`).
    pub fn number(&self) -> String {
        self.0.replace('_', ".")
    }

    /// Numeric value of the file number, for threshold comparisons.
    pub fn value(&self) -> f64 {
        self.number().parse().unwrap_or(0.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FileId {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s).ok_or_else(|| CacheError::UnsupportedQueryForm {
            query: s.to_owned(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FmqlQuery {
    /// `SELECT TYPES`: every file in the schema, with entry counts.
    SelectTypes,
    /// `DESCRIBE TYPE <file>`: the schema of one file.
    DescribeType(FileId),
    /// `COUNT <file>`: number of entries in a file. Never cached.
    Count(FileId),
    /// One page of full entry descriptions.
    Describe {
        file: FileId,
        cstop: u64,
        limit: u64,
        offset: u64,
    },
    /// One page of a bulk select.
    Select {
        file: FileId,
        limit: u64,
        offset: u64,
    },
}

impl FmqlQuery {
    /// Name of the broker RPC that executes FMQL queries.
    pub const RPC_NAME: &'static str = "CG FMQL QP";

    /// The compact `OP:<NAME>^ARG:<VALUE>` form taken by the FMQL RPC.
    pub fn rpc_form(&self) -> String {
        match self {
            FmqlQuery::SelectTypes => "OP:SELECTALLTYPES".to_owned(),
            FmqlQuery::DescribeType(file) => format!("OP:DESCRIBETYPE^TYPE:{file}"),
            FmqlQuery::Count(file) => format!("OP:COUNT^TYPE:{file}"),
            FmqlQuery::Describe {
                file,
                cstop,
                limit,
                offset,
            } => format!(
                "OP:DESCRIBE^TYPE:{file}^LIMIT:{limit}^OFFSET:{offset}^CNODESTOP:{cstop}"
            ),
            FmqlQuery::Select {
                file,
                limit,
                offset,
            } => format!("OP:SELECT^TYPE:{file}^LIMIT:{limit}^OFFSET:{offset}"),
        }
    }

    /// Whether replies to this query may be persisted.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, FmqlQuery::Count(_))
    }
}

impl fmt::Display for FmqlQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FmqlQuery::SelectTypes => f.write_str("SELECT TYPES"),
            FmqlQuery::DescribeType(file) => write!(f, "DESCRIBE TYPE {file}"),
            FmqlQuery::Count(file) => write!(f, "COUNT {file}"),
            FmqlQuery::Describe {
                file,
                cstop,
                limit,
                offset,
            } => write!(f, "DESCRIBE {file} CSTOP {cstop} LIMIT {limit} OFFSET {offset}"),
            FmqlQuery::Select {
                file,
                limit,
                offset,
            } => write!(f, "SELECT {file} LIMIT {limit} OFFSET {offset}"),
        }
    }
}

impl FromStr for FmqlQuery {
    type Err = CacheError;

    /// Shapes are tried in a fixed order: `COUNT`, `DESCRIBE TYPE`, `DESCRIBE <file>`,
    /// `SELECT TYPES`, `SELECT <file>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unsupported = || CacheError::UnsupportedQueryForm {
            query: s.to_owned(),
        };
        let file_id = |token: &str| FileId::new(token).ok_or_else(unsupported);
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let query = match tokens.as_slice() {
            ["COUNT", file] => FmqlQuery::Count(file_id(*file)?),
            ["DESCRIBE", "TYPE", file] => FmqlQuery::DescribeType(file_id(*file)?),
            ["DESCRIBE", file, rest @ ..] => {
                let args = PageArgs::parse(rest, &["CSTOP", "LIMIT", "OFFSET"])
                    .ok_or_else(unsupported)?;
                FmqlQuery::Describe {
                    file: file_id(*file)?,
                    cstop: args.get("CSTOP").ok_or_else(unsupported)?,
                    limit: args.get("LIMIT").ok_or_else(unsupported)?,
                    offset: args.get("OFFSET").ok_or_else(unsupported)?,
                }
            }
            ["SELECT", "TYPES"] => FmqlQuery::SelectTypes,
            ["SELECT", file, rest @ ..] => {
                let args =
                    PageArgs::parse(rest, &["LIMIT", "OFFSET"]).ok_or_else(unsupported)?;
                FmqlQuery::Select {
                    file: file_id(*file)?,
                    limit: args.get("LIMIT").ok_or_else(unsupported)?,
                    offset: args.get("OFFSET").ok_or_else(unsupported)?,
                }
            }
            _ => return Err(unsupported()),
        };
        Ok(query)
    }
}

/// `KEYWORD <n>` pairs trailing a paged query, in any order, each at most once.
struct PageArgs<'a> {
    pairs: Vec<(&'a str, u64)>,
}

impl<'a> PageArgs<'a> {
    fn parse(tokens: &[&'a str], allowed: &[&str]) -> Option<Self> {
        if tokens.len() % 2 != 0 {
            return None;
        }
        let mut pairs: Vec<(&'a str, u64)> = Vec::with_capacity(tokens.len() / 2);
        for chunk in tokens.chunks(2) {
            let (key, value) = (chunk[0], chunk[1]);
            if !allowed.contains(&key) || pairs.iter().any(|(seen, _)| *seen == key) {
                return None;
            }
            pairs.push((key, value.parse().ok()?));
        }
        Some(Self { pairs })
    }

    fn get(&self, key: &str) -> Option<u64> {
        self.pairs
            .iter()
            .find_map(|(k, v)| (*k == key).then_some(*v))
    }
}

/// The base of a multi-page request: everything but `LIMIT`/`OFFSET`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PagedQuery {
    Describe { file: FileId, cstop: u64 },
    Select { file: FileId },
}

impl PagedQuery {
    pub fn describe(file: FileId, cstop: u64) -> Self {
        PagedQuery::Describe { file, cstop }
    }

    pub fn select(file: FileId) -> Self {
        PagedQuery::Select { file }
    }

    pub fn file(&self) -> &FileId {
        match self {
            PagedQuery::Describe { file, .. } | PagedQuery::Select { file } => file,
        }
    }

    /// Bulk selects return thin rows and page with a larger default limit.
    pub fn is_bulk(&self) -> bool {
        matches!(self, PagedQuery::Select { .. })
    }

    pub fn page(&self, limit: u64, offset: u64) -> FmqlQuery {
        match self {
            PagedQuery::Describe { file, cstop } => FmqlQuery::Describe {
                file: file.clone(),
                cstop: *cstop,
                limit,
                offset,
            },
            PagedQuery::Select { file } => FmqlQuery::Select {
                file: file.clone(),
                limit,
                offset,
            },
        }
    }

    pub fn count_query(&self) -> FmqlQuery {
        FmqlQuery::Count(self.file().clone())
    }
}

impl fmt::Display for PagedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PagedQuery::Describe { file, cstop } => write!(f, "DESCRIBE {file} CSTOP {cstop}"),
            PagedQuery::Select { file } => write!(f, "SELECT {file}"),
        }
    }
}
