use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chat_sync_core::models::{ChatUser, EntityKind};
use chat_sync_core::query::{Pagination, Sorting};
use chat_sync_core::store::{ChangeScope, ListChange, Observation};
use chat_sync_core::tracing_setup::init_tracing;
use chat_sync_core::{
    CoreConfig, CoreEvent, FilterExpression, FilterHash, ListQuery, SyncCommand, SyncRuntime,
    UpdatePolicy,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "chat-sync")]
#[command(about = "Keep server-driven list queries in sync with a local cache")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    /// Path to JSON config file (contains dataDir, api, reconcileKinds)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a query and store its first page
    Update {
        /// Entity kind: user, channel or message
        kind: String,
        /// Filter in operator JSON, e.g. '{"role": {"$eq": "admin"}}'
        filter: String,
        /// Replace existing members instead of merging
        #[arg(long)]
        replace: bool,
        /// Sort field, may be given multiple times
        #[arg(long)]
        sort: Vec<String>,
        /// Sort descending
        #[arg(long)]
        descending: bool,
        /// Page size (defaults per kind)
        #[arg(long)]
        limit: Option<u32>,
        /// Skip this query during orphan reconciliation
        #[arg(long)]
        unobserved: bool,
    },

    /// Re-fetch a stored query, replacing its members
    Refresh {
        filter_hash: String,
    },

    /// List stored queries
    Queries,

    /// Show the members of a stored query
    Show {
        filter_hash: String,
    },

    /// Run the orphan reconcilers and print store changes until interrupted
    Watch {
        /// Entity kind to print changes for
        #[arg(default_value = "user")]
        kind: String,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };
    tracing::debug!(data_dir = %config.data_dir.display(), base_url = %config.api.base_url, "Loaded config");
    let mut runtime = SyncRuntime::new(config)?;

    match cli.command {
        Commands::Update {
            kind,
            filter,
            replace,
            sort,
            descending,
            limit,
            unobserved,
        } => {
            let kind = parse_kind(&kind)?;
            let filter_json: Value =
                serde_json::from_str(&filter).context("Filter is not valid JSON")?;
            let filter = FilterExpression::from_json(&filter_json)?;
            let sort = sort
                .into_iter()
                .map(|field| {
                    if descending {
                        Sorting::descending(field)
                    } else {
                        Sorting::ascending(field)
                    }
                })
                .collect();
            let mut query = ListQuery::new(kind, filter)
                .with_sort(sort)
                .observed(!unobserved);
            if let Some(limit) = limit {
                query = query.with_pagination(Pagination {
                    limit,
                    cursor: None,
                });
            }
            let policy = if replace {
                UpdatePolicy::Replace
            } else {
                UpdatePolicy::Merge
            };
            let event = dispatch(&mut runtime, SyncCommand::Update { query, policy }).await?;
            print_json(&event_json(&event), cli.pretty);
        }
        Commands::Refresh { filter_hash } => {
            let command = SyncCommand::Refresh {
                filter_hash: FilterHash::new(filter_hash),
            };
            let event = dispatch(&mut runtime, command).await?;
            print_json(&event_json(&event), cli.pretty);
        }
        Commands::Queries => {
            let queries: Vec<Value> = runtime
                .registry()
                .all_queries()
                .into_iter()
                .map(|record| {
                    json!({
                        "filterHash": record.filter_hash.as_str(),
                        "kind": record.kind.as_str(),
                        "filter": record.filter.to_json(),
                        "observed": record.observe_in_background,
                        "members": record.member_ids.len(),
                    })
                })
                .collect();
            print_json(&Value::Array(queries), cli.pretty);
        }
        Commands::Show { filter_hash } => {
            let filter_hash = FilterHash::new(filter_hash);
            let Some(record) = runtime.store().query_record(&filter_hash) else {
                bail!("No stored query with hash {}", filter_hash);
            };
            let members: Vec<Value> = match record.kind {
                EntityKind::User => runtime
                    .users(&filter_hash)
                    .iter()
                    .map(user_json)
                    .collect(),
                _ => runtime
                    .store()
                    .snapshot()
                    .members(&filter_hash)
                    .iter()
                    .map(|entity| json!({ "id": entity.id.as_str(), "attributes": entity.attributes }))
                    .collect(),
            };
            print_json(&Value::Array(members), cli.pretty);
        }
        Commands::Watch { kind } => {
            let kind = parse_kind(&kind)?;
            runtime.start_reconcilers();
            let mut changes = runtime
                .store()
                .subscribe(Observation::new(kind, ChangeScope::All));
            eprintln!("Watching {} changes, press Ctrl-C to stop", kind);
            loop {
                tokio::select! {
                    batch = changes.next() => {
                        let Some(batch) = batch else { break };
                        for change in &batch.changes {
                            print_json(&change_json(batch.version, change), cli.pretty);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            for reconciler in runtime.reconcilers() {
                reconciler.shutdown().await;
            }
            let stats = runtime.reconcile_stats().snapshot();
            eprintln!(
                "Reconciled {} entities: {} checks, {} linked, {} unlinked, {} failed",
                stats.entities_seen, stats.pairs_checked, stats.linked, stats.unlinked, stats.failed
            );
        }
    }

    Ok(())
}

/// Send one command, wait for its outcome, then shut the runtime down.
async fn dispatch(runtime: &mut SyncRuntime, command: SyncCommand) -> Result<CoreEvent> {
    let mut events = runtime
        .take_event_rx()
        .context("Runtime events already taken")?;
    let handle = runtime.handle();
    handle.send(command).context("Runtime is not accepting commands")?;
    handle
        .send(SyncCommand::Shutdown)
        .context("Runtime is not accepting commands")?;
    runtime.run().await;
    events.recv().await.context("Runtime stopped without a result")
}

fn parse_kind(value: &str) -> Result<EntityKind> {
    EntityKind::parse(value).with_context(|| format!("Unknown entity kind: {}", value))
}

fn event_json(event: &CoreEvent) -> Value {
    match event {
        CoreEvent::QueryUpdated {
            filter_hash,
            kind,
            members,
        } => json!({
            "status": "updated",
            "filterHash": filter_hash.as_str(),
            "kind": kind.as_str(),
            "members": members,
        }),
        CoreEvent::UpdateFailed { filter_hash, error } => json!({
            "status": "failed",
            "filterHash": filter_hash.as_str(),
            "error": error.to_string(),
        }),
    }
}

fn user_json(user: &ChatUser) -> Value {
    json!({
        "id": user.id,
        "name": user.display_name(),
        "role": user.role,
        "online": user.is_online,
        "banned": user.is_banned,
        "lastActiveAt": user.last_active_at,
    })
}

fn change_json(version: u64, change: &ListChange) -> Value {
    let (op, index) = match change {
        ListChange::Insert { index, .. } => ("insert", json!(index)),
        ListChange::Update { index, .. } => ("update", json!(index)),
        ListChange::Delete { index, .. } => ("delete", json!(index)),
        ListChange::Move { from, to, .. } => ("move", json!({ "from": from, "to": to })),
    };
    json!({
        "version": version,
        "op": op,
        "index": index,
        "id": change.entity().id.as_str(),
    })
}

fn print_json(value: &Value, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to render output: {}", e),
    }
}
