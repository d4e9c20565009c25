use std::collections::BTreeMap;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::{
    api::{Api, DynamicObject},
    ResourceExt,
};
use stagehand_core::KindResolver;
use stagehand_kubehub::{DiscoveryResolver, KubeListWatch};
use stagehand_snapshot::{LoadError, LoadReport, DEFAULT_RESOURCES};
use stagehand_store::DynamicGetter;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stagehandctl", version, about = "Stagehand: snapshot loading and cached cluster views")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Work with captured object snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Print object counts per namespace from a watched, cached collection
    Summary {
        /// Resource type, e.g. "pods" or "deployments.apps"
        resource: String,
        /// Restrict to one namespace
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Label selector, e.g. "app=web,tier!=cache"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// Field selector, e.g. "status.phase=Running"
        #[arg(long = "field-selector")]
        field_selector: Option<String>,
        /// Seconds between prints
        #[arg(long = "interval", default_value_t = 5)]
        interval: u64,
        /// Stop after this many prints (0 runs until Ctrl-C)
        #[arg(long = "count", default_value_t = 1)]
        count: u64,
    },
    /// Show the endpoint each resource type name resolves to
    Resolve {
        #[arg(required = true)]
        resources: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCommands {
    /// Create the objects of a snapshot in the current cluster, owners first
    Load {
        /// Snapshot file, "-" for stdin
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Resource types to load; defaults to the common built-in set
        #[arg(long = "resource", value_delimiter = ',')]
        resources: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("STAGEHAND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STAGEHAND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STAGEHAND_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; shutting down");
            token.cancel();
        }
    });
}

/// Read the whole snapshot, from stdin for "-", off the async workers.
async fn read_input(file: String) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        if file == "-" {
            io::read_to_string(io::stdin()).context("reading stdin")
        } else {
            std::fs::read_to_string(&file).with_context(|| format!("reading {}", file))
        }
    })
    .await
    .context("input reader panicked")?
}

fn print_report(output: Output, report: &LoadReport) -> Result<()> {
    match output {
        Output::Human => {
            println!(
                "applied: {}  created: {}  updated: {}  filtered: {}  conflicts: {}  failed: {}  unresolved: {}",
                report.applied(),
                report.created,
                report.updated,
                report.filtered,
                report.conflicts,
                report.failed,
                report.unresolved.len()
            );
            for s in &report.unresolved {
                println!("  missing owner: {} {}", s.kind, s.name);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn count_by_namespace(items: &[DynamicObject]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for obj in items {
        let ns = obj.namespace().unwrap_or_else(|| "-".to_string());
        *counts.entry(ns).or_insert(0) += 1;
    }
    counts
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Snapshot { command: SnapshotCommands::Load { file, resources } } => {
            let resources: Vec<String> = if resources.is_empty() {
                DEFAULT_RESOURCES.iter().map(|s| s.to_string()).collect()
            } else {
                resources
            };
            info!(file = %file, resources = resources.len(), "snapshot load invoked");
            let input = read_input(file).await?;
            let client = stagehand_kubehub::get_kube_client().await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            match stagehand_snapshot::load_into_cluster(client, &input, resources.as_slice(), &cancel).await {
                Ok(report) => print_report(cli.output, &report)?,
                Err(LoadError::Cancelled(report)) => {
                    print_report(cli.output, &report)?;
                    return Err(anyhow!("load cancelled; the report above covers the objects written so far"));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Summary { resource, namespace, selector, field_selector, interval, count } => {
            info!(resource = %resource, ns = ?namespace, "summary invoked");
            let client = stagehand_kubehub::get_kube_client().await?;
            let resolver = DiscoveryResolver::new(client.clone()).await?;
            let kind = resolver.resolve_name(&resource).await?;
            let api: Api<DynamicObject> = match namespace.as_deref() {
                Some(ns) if kind.namespaced => Api::namespaced_with(client, ns, &kind.resource),
                _ => Api::all_with(client, &kind.resource),
            };
            let mut feed = KubeListWatch::new(api);
            if let Some(labels) = selector.as_deref() {
                feed = feed.labels(labels);
            }
            if let Some(fields) = field_selector.as_deref() {
                feed = feed.fields(fields);
            }
            let getter = DynamicGetter::new(feed, count_by_namespace);
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let sync = getter.start(cancel.clone()).await?;

            let mut printed = 0u64;
            loop {
                let counts = getter.get();
                match cli.output {
                    Output::Human => {
                        println!("VERSION {}", getter.observed_version());
                        println!("{:<32} COUNT", "NAMESPACE");
                        for (ns, n) in counts.iter() {
                            println!("{:<32} {}", ns, n);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string(&*counts)?),
                }
                printed += 1;
                if count != 0 && printed >= count {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval.max(1))) => {}
                }
            }
            cancel.cancel();
            if let Err(e) = sync.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
        Commands::Resolve { resources } => {
            let client = stagehand_kubehub::get_kube_client().await?;
            let resolver = DiscoveryResolver::new(client).await?;
            #[derive(serde::Serialize)]
            struct Row {
                resource: String,
                group_kind: String,
                api_version: String,
                plural: String,
                namespaced: bool,
            }
            let mut rows = Vec::with_capacity(resources.len());
            for r in &resources {
                let kind = resolver.resolve_name(r).await?;
                rows.push(Row {
                    resource: r.clone(),
                    group_kind: kind.group_kind().to_string(),
                    api_version: kind.resource.api_version.clone(),
                    plural: kind.resource.plural.clone(),
                    namespaced: kind.namespaced,
                });
            }
            match cli.output {
                Output::Human => {
                    for row in &rows {
                        let scope = if row.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {} • {}", row.resource, row.api_version, row.plural, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn load_resources_split_on_commas() {
        let cli = Cli::try_parse_from(["stagehandctl", "snapshot", "load", "-f", "-", "--resource", "pods,configmaps"])
            .unwrap();
        match cli.command {
            Commands::Snapshot { command: SnapshotCommands::Load { file, resources } } => {
                assert_eq!(file, "-");
                assert_eq!(resources, vec!["pods", "configmaps"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn summary_accepts_label_and_field_selectors() {
        let cli = Cli::try_parse_from([
            "stagehandctl",
            "summary",
            "pods",
            "-l",
            "app=web",
            "--field-selector",
            "status.phase=Running",
        ])
        .unwrap();
        match cli.command {
            Commands::Summary { resource, selector, field_selector, namespace, .. } => {
                assert_eq!(resource, "pods");
                assert_eq!(selector.as_deref(), Some("app=web"));
                assert_eq!(field_selector.as_deref(), Some("status.phase=Running"));
                assert!(namespace.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn input_file_is_read_whole() {
        let path = std::env::temp_dir().join(format!("stagehandctl-input-{}.yaml", std::process::id()));
        std::fs::write(&path, "---\nkind: ConfigMap\n").unwrap();
        let text = read_input(path.to_string_lossy().into_owned()).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(text, "---\nkind: ConfigMap\n");
        assert!(read_input("/nonexistent/stagehand.yaml".into()).await.is_err());
    }

    #[test]
    fn namespace_counts_group_cluster_scoped_under_dash() {
        let mk = |name: &str, ns: Option<&str>| {
            let mut o: DynamicObject =
                serde_json::from_value(serde_json::json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name}}))
                    .unwrap();
            o.metadata.namespace = ns.map(str::to_string);
            o
        };
        let counts = count_by_namespace(&[mk("a", Some("x")), mk("b", Some("x")), mk("n", None)]);
        assert_eq!(counts.get("x"), Some(&2));
        assert_eq!(counts.get("-"), Some(&1));
    }
}
