use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::io::Write as _;
use std::path::PathBuf;
use vdm_cache::{
    Completeness, DescribeResult, FileId, FmqlCacher, FmqlQuery, PagedQuery, SchemaType,
};
use vdm_config::{init_tracing, BrokerConfig, VdmConfig, VistaTarget, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "vdm", version, about = "VistA metadata: cached FMQL queries")]
struct Cli {
    /// Config file (defaults to ./vdm.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Caches root directory, overriding the config file and VDM_CACHE_DIR
    #[arg(long, global = true)]
    caches: Option<PathBuf>,
    #[command(flatten)]
    target: TargetArgs,
    #[command(subcommand)]
    command: Command,
}

/// Backend for the VistA named on the command line, overriding `[vistas.<label>]`.
#[derive(Args)]
struct TargetArgs {
    /// FMQL web endpoint
    #[arg(long, global = true, conflicts_with = "host")]
    endpoint: Option<String>,
    /// RPC broker host
    #[arg(long, global = true)]
    host: Option<String>,
    /// RPC broker port
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Access code
    #[arg(long, global = true)]
    access: Option<String>,
    /// Verify code
    #[arg(long, global = true)]
    verify: Option<String>,
    /// The site's cipher pad file
    #[arg(long, global = true)]
    cipher_pad: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one query through the cache and print its reply
    Query(QueryArgs),
    /// List the schema's types, fetching missing type descriptions
    Schema(SchemaArgs),
    /// Stream every entry of a file, fetching missing pages
    Entries(EntriesArgs),
    /// Report how much of a file is cached, without contacting the VistA
    Status(StatusArgs),
}

#[derive(Args)]
struct QueryArgs {
    /// VistA label, e.g. GOLD or CGVISTA
    vista: String,
    /// e.g. "DESCRIBE TYPE 9_6"
    query: FmqlQuery,
    /// Print compact JSON on one line
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct SchemaArgs {
    vista: String,
    /// Emit JSON suitable for scripts
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct PageArgs {
    vista: String,
    /// File number, `9.6` or `9_6`
    file: FileId,
    /// Page size (default from config: describe or select limit)
    #[arg(long)]
    limit: Option<u64>,
    /// Child-node expansion bound for describes
    #[arg(long, conflicts_with = "select")]
    cstop: Option<u64>,
    /// Page with bulk SELECT instead of DESCRIBE
    #[arg(long)]
    select: bool,
}

impl PageArgs {
    fn base(&self, config: &VdmConfig) -> PagedQuery {
        if self.select {
            PagedQuery::select(self.file.clone())
        } else {
            PagedQuery::describe(self.file.clone(), self.cstop.unwrap_or(config.limits.cstop))
        }
    }
}

#[derive(Args)]
struct EntriesArgs {
    #[command(flatten)]
    page: PageArgs,
    /// Print each entry as flattened JSON instead of its label
    #[arg(long)]
    flat: bool,
}

#[derive(Args)]
struct StatusArgs {
    #[command(flatten)]
    page: PageArgs,
    /// Emit JSON suitable for scripts
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = VdmConfig::load(cli.config.as_deref()).with_context(|| {
        match &cli.config {
            Some(path) => format!("loading {}", path.display()),
            None => format!("loading {DEFAULT_CONFIG_FILE}"),
        }
    })?;
    if let Some(caches) = cli.caches {
        config.caches_root = caches;
    }
    init_tracing(&config.logging);
    tracing::debug!(
        target = "vdm.cli",
        caches_root = %config.caches_root.display(),
        "config loaded"
    );

    match cli.command {
        Command::Query(args) => {
            let cacher = open_cacher(&mut config, &cli.target, &args.vista)?;
            let reply = cacher.fetch_single(&args.query)?;
            let out = if args.json {
                serde_json::to_string(reply.as_value())?
            } else {
                serde_json::to_string_pretty(reply.as_value())?
            };
            println!("{out}");
            Ok(0)
        }
        Command::Schema(args) => {
            let cacher = open_cacher(&mut config, &cli.target, &args.vista)?;
            let mut listed = Vec::new();
            for schema_type in cacher.describe_schema_types()? {
                let schema_type = schema_type?;
                if schema_type.file.value() < config.min_file_id {
                    continue;
                }
                listed.push(TypeSummary::from(&schema_type));
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&listed)?);
            } else {
                for (idx, summary) in listed.iter().enumerate() {
                    println!(
                        "{}: {} {} ({})",
                        idx + 1,
                        summary.number,
                        summary.name.as_deref().unwrap_or("?"),
                        summary.count.as_deref().unwrap_or("?")
                    );
                }
            }
            Ok(0)
        }
        Command::Entries(args) => {
            let cacher = open_cacher(&mut config, &cli.target, &args.page.vista)?;
            let base = args.page.base(&config);
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for record in cacher.fetch_paginated(&base, args.page.limit)? {
                let record = record?;
                if args.flat {
                    let flat = DescribeResult::new(record)
                        .map(|record| Value::Object(record.flatten()))
                        .unwrap_or(Value::Null);
                    writeln!(out, "{}", serde_json::to_string(&flat)?)?;
                } else {
                    writeln!(out, "{}", entry_label(&record))?;
                }
            }
            out.flush()?;
            Ok(0)
        }
        Command::Status(args) => {
            let cacher = FmqlCacher::offline(config.cacher_config(&args.page.vista))?;
            let base = args.page.base(&config);
            let status = StatusReport::from(cacher.completeness(&base, args.page.limit)?);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else if status.complete {
                println!("{base}: complete ({} pages)", status.cached_pages);
            } else {
                println!(
                    "{base}: incomplete ({} pages cached, next offset {})",
                    status.cached_pages,
                    status.missing_offset.unwrap_or(0)
                );
            }
            Ok(0)
        }
    }
}

/// The cacher for `vista`, after applying any backend given on the command line.
fn open_cacher(config: &mut VdmConfig, target: &TargetArgs, vista: &str) -> Result<FmqlCacher> {
    if let Some(target) = target_override(target)? {
        config.vistas.insert(vista.to_owned(), target);
        config.validate()?;
    }
    config
        .open_cacher(vista)
        .with_context(|| format!("opening cache for {vista}"))
}

fn target_override(args: &TargetArgs) -> Result<Option<VistaTarget>> {
    if let Some(endpoint) = &args.endpoint {
        return Ok(Some(VistaTarget::endpoint(endpoint)));
    }
    let Some(host) = &args.host else {
        return Ok(None);
    };
    let (Some(port), Some(access), Some(verify), Some(cipher_pad)) =
        (args.port, &args.access, &args.verify, &args.cipher_pad)
    else {
        bail!("--host also needs --port, --access, --verify and --cipher-pad");
    };
    Ok(Some(VistaTarget::broker(BrokerConfig {
        host: host.clone(),
        port,
        access: access.clone(),
        verify: verify.clone(),
        cipher_pad: cipher_pad.clone(),
        context: vdm_cache::DEFAULT_CONTEXT.to_owned(),
    })))
}

fn entry_label(record: &Value) -> String {
    let uri = &record["uri"];
    uri["label"]
        .as_str()
        .or_else(|| uri["value"].as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| record.to_string())
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Serialize)]
struct TypeSummary {
    number: String,
    name: Option<String>,
    count: Option<String>,
}

impl From<&SchemaType> for TypeSummary {
    fn from(schema_type: &SchemaType) -> Self {
        Self {
            number: schema_type.file.number(),
            name: scalar_text(&schema_type.document["name"]),
            count: scalar_text(&schema_type.document["count"]),
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    complete: bool,
    cached_pages: u64,
    missing_offset: Option<u64>,
}

impl From<Completeness> for StatusReport {
    fn from(completeness: Completeness) -> Self {
        match completeness {
            Completeness::Complete { pages } => Self {
                complete: true,
                cached_pages: pages,
                missing_offset: None,
            },
            Completeness::Incomplete {
                cached_pages,
                missing_offset,
            } => Self {
                complete: false,
                cached_pages,
                missing_offset: Some(missing_offset),
            },
        }
    }
}
