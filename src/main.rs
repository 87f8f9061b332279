use std::path::PathBuf;
use std::process::ExitCode;

use bptree_store::database::{DeleteReport, IndexReport, LoadReport, QueryResult, StorageReport};
use bptree_store::{
    AccessSummary, BLOCK_SIZE, BPlusTree, Database, DatabaseConfig, DatabaseResult, MEMORY_SIZE,
    StorageConfig,
};
use clap::{Parser, ValueEnum};
use prettytable::{Table, row};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

/// Load a ratings file into a block store, index it by vote count and run
/// point, range and delete queries through the index
#[derive(Debug, Parser)]
#[command(name = "bptree-store", version)]
struct Args {
    /// Tab separated file with tconst, averageRating and numVotes columns
    #[arg(long)]
    data: PathBuf,

    /// Block size in bytes
    #[arg(long, default_value_t = BLOCK_SIZE)]
    block_size: usize,

    /// Arena capacity in MiB
    #[arg(long, default_value_t = MEMORY_SIZE >> 20)]
    capacity_mib: usize,

    /// Tree order, sized to one block when omitted
    #[arg(long)]
    order: Option<usize>,

    /// Vote count for the point query
    #[arg(long, default_value_t = 500)]
    point: i32,

    /// Inclusive vote range for the range query
    #[arg(long, num_args = 2, value_names = ["LO", "HI"], default_values_t = [30_000, 40_000])]
    range: Vec<i32>,

    /// Vote count whose records are deleted
    #[arg(long, default_value_t = 1000)]
    delete: i32,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct QuerySummary {
    lower: i32,
    upper: i32,
    matches: usize,
    average_rating: Option<f64>,
    access: AccessSummary,
}

impl QuerySummary {
    fn new(lower: i32, upper: i32, result: QueryResult) -> Self {
        Self {
            lower,
            upper,
            matches: result.len(),
            average_rating: result.average_rating(),
            access: result.access,
        }
    }
}

#[derive(Debug, Serialize)]
struct Experiments {
    config: DatabaseConfig,
    load: LoadReport,
    storage: StorageReport,
    index: IndexReport,
    point: QuerySummary,
    range: QuerySummary,
    delete: DeleteReport,
}

fn run(args: &Args) -> DatabaseResult<Experiments> {
    let storage = StorageConfig::new(args.block_size, args.capacity_mib.saturating_mul(1 << 20));
    let order = args
        .order
        .unwrap_or_else(|| BPlusTree::max_order_for_block(args.block_size));
    let config = DatabaseConfig { storage, order };

    let mut db = Database::new(config)?;
    let load = db.load_tsv(&args.data)?;
    let storage = db.storage_report();
    let index = db.index_report();

    let point = QuerySummary::new(args.point, args.point, db.find(args.point)?);

    let (lower, upper) = match args.range.as_slice() {
        [lower, upper] => (*lower, *upper),
        _ => (1, 0),
    };
    let range = QuerySummary::new(lower, upper, db.find_range(lower, upper)?);

    let delete = db.delete(args.delete)?;

    Ok(Experiments {
        config,
        load,
        storage,
        index,
        point,
        range,
        delete,
    })
}

fn format_keys<T: ToString>(keys: &[T]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_storage(load: &LoadReport, storage: &StorageReport) {
    let mut table = Table::new();
    table.add_row(row!["Storage", ""]);
    table.add_row(row!["rows read", load.rows]);
    table.add_row(row!["rows skipped", load.skipped]);
    table.add_row(row!["records", storage.records]);
    table.add_row(row!["record size (bytes)", storage.record_size]);
    table.add_row(row!["records per block", storage.slots_per_block]);
    table.add_row(row!["blocks", storage.blocks]);
    table.add_row(row!["database size (bytes)", storage.used_bytes]);
    table.add_row(row!["free slots", storage.free_slots]);
    table.printstd();
}

fn print_index(title: &str, index: &IndexReport) {
    let mut table = Table::new();
    table.add_row(row![title, ""]);
    table.add_row(row!["order", index.order]);
    table.add_row(row!["entries", index.entries]);
    table.add_row(row!["nodes", index.nodes]);
    table.add_row(row!["levels", index.height]);
    table.add_row(row!["root keys", format_keys(&index.root_keys)]);
    let events = &index.events;
    let splits = format!(
        "{}/{}/{}",
        events.leaf_splits, events.internal_splits, events.root_splits
    );
    table.add_row(row!["splits (leaf/internal/root)", splits]);
    table.add_row(row!["borrows", events.borrows]);
    table.add_row(row!["merges", events.merges]);
    table.add_row(row!["root collapses", events.root_collapses]);
    table.printstd();
}

fn print_query(title: &str, query: &QuerySummary) {
    let mut table = Table::new();
    table.add_row(row![title, format!("numVotes in [{}, {}]", query.lower, query.upper)]);
    table.add_row(row!["index nodes accessed", query.access.node_visits]);
    for node in &query.access.nodes {
        let kind = if node.leaf { "leaf" } else { "internal" };
        table.add_row(row![format!("  {kind} node {}", node.id), format_keys(&node.keys)]);
    }
    table.add_row(row!["data blocks accessed", query.access.block_reads]);
    table.add_row(row!["distinct data blocks", query.access.distinct_blocks]);
    table.add_row(row!["first blocks", format_keys(&query.access.blocks)]);
    table.add_row(row!["matching records", query.matches]);
    let average = query
        .average_rating
        .map_or_else(|| "-".to_string(), |avg| format!("{avg:.3}"));
    table.add_row(row!["average rating", average]);
    table.printstd();
}

fn print_table(experiments: &Experiments) {
    print_storage(&experiments.load, &experiments.storage);
    print_index("Index", &experiments.index);
    print_query("Point query", &experiments.point);
    print_query("Range query", &experiments.range);

    let delete = &experiments.delete;
    println!(
        "Deleted {} records with numVotes = {}",
        delete.removed, delete.votes
    );
    print_index("Index after delete", &delete.index);
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bptree_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let experiments = match run(&args) {
        Ok(experiments) => experiments,
        Err(err) => {
            tracing::error!(%err, "experiment failed");
            return ExitCode::FAILURE;
        }
    };

    match args.format {
        OutputFormat::Table => print_table(&experiments),
        OutputFormat::Json => match serde_json::to_string_pretty(&experiments) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                tracing::error!(%err, "cannot serialize report");
                return ExitCode::FAILURE;
            }
        },
    }

    ExitCode::SUCCESS
}
