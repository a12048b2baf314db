use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hopgraph_core::{FilterMap, RetrievalPlan, SchemaRegistry, SearchQuery};
use hopgraph_engine::{Engine, EngineConfig, HashingEmbedder, PathFinder, RequestContext};
use hopgraph_storage::dump::{self, DumpRecord, DumpWriter};
use hopgraph_storage::InMemoryStore;
use serde_json::Value as JsonValue;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hopgraph")]
#[command(about = "Hopgraph admin CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Args)]
struct Source {
    /// Schema registry JSON.
    #[arg(long)]
    schema: PathBuf,
    /// NDJSON data dump, optionally `.zst`.
    #[arg(long)]
    data: Option<PathBuf>,
    #[arg(long)]
    tenant: String,
    #[arg(long, default_value_t = 256)]
    dims: usize,
}

#[derive(Subcommand)]
enum Cmd {
    /// Validate a schema registry and print its relationship graph.
    CheckSchema { schema: PathBuf },
    /// Direct join between two collections.
    Path {
        #[arg(long)]
        schema: PathBuf,
        from: String,
        to: String,
    },
    /// Multi-hop chain between two collections.
    Chain {
        #[arg(long)]
        schema: PathBuf,
        from: String,
        to: String,
    },
    Search {
        #[command(flatten)]
        source: Source,
        collection: String,
        /// JSON object, e.g. '{"industry": "SaaS"}'.
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        vector: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Execute a retrieval plan file and print every step outcome.
    RunPlan {
        #[command(flatten)]
        source: Source,
        plan: PathBuf,
    },
    /// Pack raw NDJSON documents of one collection into a data dump.
    Pack {
        input: PathBuf,
        out: PathBuf,
        #[arg(long)]
        collection: String,
    },
}

fn load_registry(path: &Path) -> Result<Arc<SchemaRegistry>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Arc::new(SchemaRegistry::from_json(&raw)?))
}

fn open_engine(source: &Source) -> Result<Engine> {
    let registry = load_registry(&source.schema)?;
    let store = match &source.data {
        Some(path) => dump::load_store(path)
            .with_context(|| format!("loading {}", path.display()))?
            .0,
        None => InMemoryStore::new(),
    };
    store.apply_schema(&registry);
    Ok(Engine::new(
        registry,
        Arc::new(store),
        Arc::new(HashingEmbedder::new(source.dims)),
        EngineConfig::from_env()?,
    )?)
}

fn print(v: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn pack(input: &Path, out: PathBuf, collection: &str) -> Result<usize> {
    let fh = std::fs::File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let reader: Box<dyn Read> = if input.extension().map(|e| e == "zst").unwrap_or(false) {
        Box::new(zstd::Decoder::new(fh)?)
    } else {
        Box::new(fh)
    };
    let mut w = DumpWriter::create(out)?;
    for (n, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let v: JsonValue =
            serde_json::from_str(&line).with_context(|| format!("line {}", n + 1))?;
        if !v.is_object() {
            bail!("line {}: expected a JSON object", n + 1);
        }
        w.write_record(&DumpRecord {
            collection: collection.to_string(),
            doc: v.into(),
        })?;
    }
    Ok(w.finish()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::CheckSchema { schema } => {
            let registry = load_registry(&schema)?;
            for c in registry.collections() {
                let related = registry.get_related_collections(&c.name);
                println!(
                    "{} ({} fields, tenant={}, embedding={}) -> [{}]",
                    c.name,
                    c.fields.len(),
                    c.owner_field.as_deref().unwrap_or("-"),
                    c.embedding_field.as_deref().unwrap_or("-"),
                    related.join(", ")
                );
            }
        }
        Cmd::Path { schema, from, to } => {
            let finder = PathFinder::new(load_registry(&schema)?);
            match finder.find_path(&from, &to) {
                Some(path) => print(&path)?,
                None => bail!("no relationship between {from} and {to}"),
            }
        }
        Cmd::Chain { schema, from, to } => {
            let finder = PathFinder::new(load_registry(&schema)?);
            let chain = finder.find_chain(&from, &to);
            if chain.is_empty() {
                bail!("no chain from {from} to {to}");
            }
            print(&chain)?;
        }
        Cmd::Search {
            source,
            collection,
            filter,
            text,
            vector,
            limit,
        } => {
            let engine = open_engine(&source)?;
            let filter: FilterMap = match filter {
                Some(raw) => serde_json::from_str(&raw).context("--filter must be a JSON object")?,
                None => FilterMap::new(),
            };
            let query = SearchQuery {
                collection,
                filter,
                text_query: text,
                vector_query: vector,
                limit,
                ..Default::default()
            };
            let result = engine
                .search(&RequestContext::new(source.tenant.clone()), &query)
                .await?;
            print(&result)?;
        }
        Cmd::RunPlan { source, plan } => {
            let engine = open_engine(&source)?;
            let raw = std::fs::read_to_string(&plan)
                .with_context(|| format!("reading {}", plan.display()))?;
            let plan = RetrievalPlan::from_json(&raw)?;
            let ctx = RequestContext::new(source.tenant.clone())
                .with_budget(engine.config().time_budget);
            let execution = engine.execute(&ctx, &plan).await?;
            print(&execution)?;
        }
        Cmd::Pack {
            input,
            out,
            collection,
        } => {
            let n = pack(&input, out.clone(), &collection)?;
            eprintln!("packed {n} documents into {}", out.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_writes_a_loadable_dump() {
        let dir = std::env::temp_dir().join(format!("hopgraph-pack-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("companies.ndjson");
        std::fs::write(&input, "{\"_id\":\"c1\"}\n\n{\"_id\":\"c2\"}\n").unwrap();
        let out = dir.join("seed.ndjson.zst");
        assert_eq!(pack(&input, out.clone(), "companies").unwrap(), 2);
        let (store, n) = dump::load_store(&out).unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.len("companies"), 2);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn pack_rejects_non_objects() {
        let dir = std::env::temp_dir().join(format!("hopgraph-pack-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("bad.ndjson");
        std::fs::write(&input, "[1, 2]\n").unwrap();
        assert!(pack(&input, dir.join("out.ndjson"), "x").is_err());
        std::fs::remove_dir_all(dir).ok();
    }
}
