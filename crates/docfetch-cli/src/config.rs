use anyhow::bail;
use clap::{Parser, Subcommand};
use docfetch::{
    DEFAULT_COLLECTION, DEFAULT_CONNECT_RETRIES, DEFAULT_MAX_CONCURRENCY, DEFAULT_SEQUENCE_BUFFER,
    DEFAULT_WORKER_THREADS, EngineConfig, SpatialViewQuery, Statement, ViewQuery,
};
use serde_json::Value;
use std::path::PathBuf;

/// Runtime configuration for the `docfetch` binary.
///
/// Engine settings are parsed from CLI arguments or environment variables.
/// The subcommand picks the retrieval to run.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "docfetch",
    version,
    about = "Partitioned bulk retrieval against a document cluster fixture"
)]
pub struct CliArgs {
    /// Path to the JSON cluster fixture to load.
    ///
    /// Environment variable: `DOCFETCH_FIXTURE`
    #[arg(long, env = "DOCFETCH_FIXTURE")]
    pub fixture: PathBuf,

    /// Collection to read from.
    ///
    /// Environment variable: `COLLECTION`
    #[arg(long, env = "COLLECTION", default_value_t = String::from(DEFAULT_COLLECTION))]
    pub collection: String,

    /// Number of partitions a bulk get or lookup is split into. Defaults to
    /// the number of CPUs.
    ///
    /// Environment variable: `PARALLELISM`
    #[arg(long, env = "PARALLELISM")]
    pub parallelism: Option<usize>,

    /// Maximum in-flight client operations per partition.
    ///
    /// Environment variable: `MAX_CONCURRENCY`
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: usize,

    /// Results a partition may fetch ahead of the consumer.
    ///
    /// Lower values increase backpressure responsiveness; higher values let
    /// fetching run further ahead of printing.
    ///
    /// Environment variable: `SEQUENCE_BUFFER`
    #[arg(long, env = "SEQUENCE_BUFFER", default_value_t = DEFAULT_SEQUENCE_BUFFER)]
    pub sequence_buffer: usize,

    /// Extra connection attempts after a transient failure.
    ///
    /// Environment variable: `CONNECT_RETRIES`
    #[arg(long, env = "CONNECT_RETRIES", default_value_t = DEFAULT_CONNECT_RETRIES)]
    pub connect_retries: u32,

    /// Worker threads of the engine runtime.
    ///
    /// Environment variable: `WORKER_THREADS`
    #[arg(long, env = "WORKER_THREADS", default_value_t = DEFAULT_WORKER_THREADS)]
    pub worker_threads: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch whole documents by key. Missing keys are skipped.
    Get {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Look up paths inside documents; one result per key.
    Subdoc {
        #[arg(required = true)]
        keys: Vec<String>,
        /// Path whose value to fetch. Repeatable.
        #[arg(long = "get")]
        get: Vec<String>,
        /// Path whose presence to check. Repeatable.
        #[arg(long = "exists")]
        exists: Vec<String>,
    },
    /// Run a view query. Keys are JSON; bare words are taken as strings.
    View {
        design: String,
        view: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        skip: Option<usize>,
        #[arg(long, default_value_t = false)]
        descending: bool,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        start_key: Option<String>,
        #[arg(long)]
        end_key: Option<String>,
    },
    /// Run a spatial view query.
    Spatial {
        design: String,
        view: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        skip: Option<usize>,
        /// Lower bound per dimension as a JSON array, e.g. `[0, null]`.
        #[arg(long, requires = "end_range")]
        start_range: Option<String>,
        /// Upper bound per dimension as a JSON array.
        #[arg(long, requires = "start_range")]
        end_range: Option<String>,
        /// Bounding box as `min_x,min_y,max_x,max_y`.
        #[arg(long, conflicts_with_all = ["start_range", "end_range"])]
        bbox: Option<String>,
    },
    /// Run a declarative query statement.
    Query {
        statement: String,
        /// Positional argument (JSON). Repeatable.
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Named argument as `name=value` (value is JSON). Repeatable.
        #[arg(long = "named")]
        named: Vec<String>,
    },
}

/// What to retrieve, with every argument parsed.
#[derive(Debug, Clone)]
pub enum Request {
    Get {
        keys: Vec<String>,
    },
    Subdoc {
        keys: Vec<String>,
        get: Vec<String>,
        exists: Vec<String>,
    },
    View(ViewQuery),
    Spatial(SpatialViewQuery),
    Query(Statement),
}

impl Request {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Subdoc { .. } => "subdoc",
            Self::View(_) => "view",
            Self::Spatial(_) => "spatial",
            Self::Query(_) => "query",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub fixture: PathBuf,
    pub engine: EngineConfig,
    pub parallelism: Option<usize>,
    pub request: Request,
}

impl TryFrom<CliArgs> for CliConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.parallelism == Some(0) {
            bail!("PARALLELISM must be greater than 0");
        }

        let engine = EngineConfig {
            default_collection: args.collection,
            default_parallelism: args
                .parallelism
                .unwrap_or(EngineConfig::default().default_parallelism),
            max_concurrency: args.max_concurrency,
            sequence_buffer: args.sequence_buffer,
            connect_retries: args.connect_retries,
            worker_threads: args.worker_threads,
            ..EngineConfig::default()
        };
        engine.validate()?;

        Ok(Self {
            fixture: args.fixture,
            engine,
            parallelism: args.parallelism,
            request: Request::try_from(args.command)?,
        })
    }
}

impl TryFrom<Command> for Request {
    type Error = anyhow::Error;

    fn try_from(command: Command) -> Result<Self, Self::Error> {
        let request = match command {
            Command::Get { keys } => Self::Get { keys },
            Command::Subdoc { keys, get, exists } => {
                if get.is_empty() && exists.is_empty() {
                    bail!("subdoc needs at least one --get or --exists path");
                }
                Self::Subdoc { keys, get, exists }
            }
            Command::View {
                design,
                view,
                limit,
                skip,
                descending,
                key,
                start_key,
                end_key,
            } => {
                let mut query = ViewQuery::from(design, view).descending(descending);
                if let Some(limit) = limit {
                    query = query.limit(limit);
                }
                if let Some(skip) = skip {
                    query = query.skip(skip);
                }
                if let Some(key) = key {
                    query = query.key(parse_json(&key));
                }
                if let Some(start) = start_key {
                    query = query.start_key(parse_json(&start));
                }
                if let Some(end) = end_key {
                    query = query.end_key(parse_json(&end));
                }
                Self::View(query)
            }
            Command::Spatial {
                design,
                view,
                limit,
                skip,
                start_range,
                end_range,
                bbox,
            } => {
                let mut query = SpatialViewQuery::from(design, view);
                if let Some(limit) = limit {
                    query = query.limit(limit);
                }
                if let Some(skip) = skip {
                    query = query.skip(skip);
                }
                if let (Some(start), Some(end)) = (start_range, end_range) {
                    query = query.range(parse_range(&start)?, parse_range(&end)?);
                }
                if let Some(bbox) = bbox {
                    let [min_x, min_y, max_x, max_y] = parse_bbox(&bbox)?;
                    query = query.bbox(min_x, min_y, max_x, max_y);
                }
                Self::Spatial(query)
            }
            Command::Query {
                statement,
                args,
                named,
            } => {
                let mut stmt = Statement::new(statement);
                for arg in &args {
                    stmt = stmt.arg(parse_json(arg));
                }
                for pair in &named {
                    let Some((name, value)) = pair.split_once('=') else {
                        bail!("named argument `{pair}` is not of the form name=value");
                    };
                    if name.is_empty() {
                        bail!("named argument `{pair}` has an empty name");
                    }
                    stmt = stmt.named_arg(name, parse_json(value));
                }
                Self::Query(stmt)
            }
        };
        Ok(request)
    }
}

/// Parses `raw` as JSON, falling back to a JSON string.
fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

fn parse_range(raw: &str) -> anyhow::Result<Vec<Value>> {
    match serde_json::from_str(raw) {
        Ok(Value::Array(dims)) => Ok(dims),
        _ => bail!("range `{raw}` is not a JSON array"),
    }
}

fn parse_bbox(raw: &str) -> anyhow::Result<[f64; 4]> {
    let coords = raw
        .split(',')
        .map(|c| c.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("bbox `{raw}` is not numeric: {e}"))?;
    match coords[..] {
        [min_x, min_y, max_x, max_y] => {
            if min_x > max_x || min_y > max_y {
                bail!("bbox `{raw}` has its minimum above its maximum");
            }
            Ok([min_x, min_y, max_x, max_y])
        }
        _ => bail!("bbox `{raw}` must have exactly 4 coordinates"),
    }
}
