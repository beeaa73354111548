//! GateWire daemon: loads a TOML deployment and runs its paths until a
//! termination signal arrives.

mod config;
mod nodes;
mod rt;
mod stats;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick};
use tracing_subscriber::EnvFilter;

use gatewire_core::{hooks, signal, Hook, Node, NodeTypeRegistry, Path, PathSettings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const EXIT_CONFIG: i32 = 1;
const EXIT_FATAL: i32 = 2;

fn print_help() {
    println!("gatewire {VERSION} — real-time sample gateway daemon");
    println!();
    println!("USAGE:");
    println!("    gatewire [OPTIONS] CONFIG");
    println!();
    println!("ARGS:");
    println!("    CONFIG           Path to a TOML deployment file");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Starts every configured node, connects them with paths and");
    println!("    routes time-stamped sample vectors between them, optionally");
    println!("    rate-controlled and transformed by per-path hooks.");
    println!();
    println!("    Node types: c37_118, file, loopback, mqtt, socket");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM.");
    println!();
    println!("ENVIRONMENT VARIABLES:");
    println!("    GATEWIRE_CONFIG  Deployment file used when CONFIG is not given");
    println!("    GATEWIRE_STATS   Stats interval in seconds (overrides [global].stats)");
    println!("    RUST_LOG         Log filter (default: info)");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config_path: Option<PathBuf> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("gatewire {VERSION}");
                return;
            }
            "--help" | "-h" => {
                print_help();
                return;
            }
            other if other.starts_with('-') => {
                eprintln!("gatewire: unknown option '{other}'\n");
                print_help();
                std::process::exit(EXIT_CONFIG);
            }
            other => {
                if config_path.replace(PathBuf::from(other)).is_some() {
                    eprintln!("gatewire: more than one CONFIG argument\n");
                    std::process::exit(EXIT_CONFIG);
                }
            }
        }
    }
    // Without a positional CONFIG argument, fall back to the environment.
    let config_path = config_path.or_else(|| std::env::var_os("GATEWIRE_CONFIG").map(PathBuf::from));
    let Some(config_path) = config_path else {
        print_help();
        std::process::exit(EXIT_CONFIG);
    };

    std::process::exit(run(&config_path));
}

fn run(config_path: &std::path::Path) -> i32 {
    tracing::info!(version = VERSION, config = %config_path.display(), "starting gatewire");

    let config = match config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return EXIT_CONFIG;
        }
    };
    tracing::info!(name = config.global.name, "configuration loaded");

    if let Err(e) = rt::init(&config.global) {
        tracing::error!(error = %e, "real-time setup failed");
        return EXIT_CONFIG;
    }

    let registry = nodes::registry();

    let nodes = match build_nodes(&registry, &config) {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return EXIT_CONFIG;
        }
    };

    let mut paths = match build_paths(&config, &nodes) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return EXIT_CONFIG;
        }
    };

    // Everything fallible about the configuration happens before any thread
    // starts; from here on errors are runtime faults.
    for node in nodes.values() {
        if let Err(e) = node.check() {
            tracing::error!(node = %node.name(), error = %e, "node check failed");
            return EXIT_CONFIG;
        }
    }
    for path in &mut paths {
        if let Err(e) = path.prepare() {
            tracing::error!(path = path.name(), error = %e, "path preparation failed");
            return EXIT_CONFIG;
        }
    }

    tracing::info!(count = nodes.len(), "starting nodes");
    for node in nodes.values() {
        if let Err(e) = node.start() {
            tracing::error!(node = %node.name(), error = %e, "node start failed");
            stop_all(&mut paths, &nodes, &registry);
            return EXIT_FATAL;
        }
    }

    tracing::info!(count = paths.len(), "starting paths");
    for path in &mut paths {
        if let Err(e) = path.start() {
            tracing::error!(path = path.name(), error = %e, "path start failed");
            stop_all(&mut paths, &nodes, &registry);
            return EXIT_FATAL;
        }
    }

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    }) {
        tracing::error!(error = %e, "failed to install signal handler");
        stop_all(&mut paths, &nodes, &registry);
        return EXIT_FATAL;
    }

    if config.global.stats > 0.0 {
        let ticker = tick(Duration::from_secs_f64(config.global.stats));
        loop {
            select! {
                recv(ticker) -> _ => stats::report(&paths),
                recv(shutdown_rx) -> _ => break,
            }
        }
    } else {
        let _ = shutdown_rx.recv();
    }
    tracing::info!("shutting down");

    let faulted = paths.iter().any(|p| p.is_faulted());
    stop_all(&mut paths, &nodes, &registry);
    tracing::info!("goodbye");

    if faulted {
        EXIT_FATAL
    } else {
        0
    }
}

fn build_nodes(
    registry: &NodeTypeRegistry,
    config: &config::Config,
) -> Result<BTreeMap<String, Arc<Node>>, Box<dyn std::error::Error>> {
    let mut nodes = BTreeMap::new();
    for (name, node_config) in &config.nodes {
        let params = toml::Value::Table(node_config.params.clone());
        let (type_name, backend) = registry
            .instantiate(&node_config.r#type, &params)
            .map_err(|e| format!("node '{name}': {e}"))?;

        let signals = match &node_config.signals {
            Some(signals) => signal::generate(signals.count, signals.ty),
            None => signal::generate(
                gatewire_core::path::DEFAULT_SAMPLELEN,
                gatewire_core::SignalType::Float,
            ),
        };

        let node = Arc::new(Node::new(
            name.clone(),
            type_name,
            node_config.vectorize,
            signals,
            backend,
        ));
        tracing::debug!(node = %name, node_type = type_name, "loaded node");
        nodes.insert(name.clone(), node);
    }
    Ok(nodes)
}

fn build_paths(
    config: &config::Config,
    nodes: &BTreeMap<String, Arc<Node>>,
) -> Result<Vec<Path>, Box<dyn std::error::Error>> {
    let mut paths = Vec::new();
    for expanded in config::expand_paths(config) {
        let source = nodes
            .get(&expanded.source)
            .ok_or_else(|| format!("unknown node '{}'", expanded.source))?
            .clone();
        let destinations = expanded
            .destinations
            .iter()
            .map(|name| {
                nodes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| format!("unknown node '{name}'"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut hook_list: Vec<(Box<dyn Hook>, Option<toml::Value>)> = Vec::new();
        for hook_config in &expanded.hooks {
            let hook = hooks::from_config(hook_config)?;
            hook_list.push((hook, Some(hook_config.clone())));
        }

        let path = Path::new(
            source,
            destinations,
            hook_list,
            PathSettings {
                rate: expanded.rate,
                queuelen: expanded.queuelen,
                samplelen: expanded.samplelen,
                poolsize: expanded.poolsize,
            },
        );
        tracing::debug!(path = path.name(), rate = expanded.rate, "loaded path");
        paths.push(path);
    }
    Ok(paths)
}

/// Graceful teardown order: paths first, then nodes, then the type-level
/// plug-in state.
fn stop_all(
    paths: &mut [Path],
    nodes: &BTreeMap<String, Arc<Node>>,
    registry: &NodeTypeRegistry,
) {
    for path in paths.iter_mut() {
        if let Err(e) = path.stop() {
            tracing::warn!(path = path.name(), error = %e, "path stop failed");
        }
    }
    for node in nodes.values() {
        if let Err(e) = node.stop() {
            tracing::warn!(node = %node.name(), error = %e, "node stop failed");
        }
        registry.release(node.type_name());
    }
}
