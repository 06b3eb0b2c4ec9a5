// crates/flowcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{ExecutionEvent, FlowDefinition, NodeConfig, NodeEvent};
use flowruntime::{validate_definition, FlowOrchestrator, JsonFileStore, NodeRegistry, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the flow runtime until ctrl-c, recovering flows left running
    Serve {
        /// Directory holding flow definitions and the execution log
        #[arg(short, long, default_value = "flowdata")]
        store: PathBuf,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Also start these deployed flows
        #[arg(long = "start")]
        start: Vec<String>,
    },

    /// Validate a flow file and persist it as stopped
    Deploy {
        #[arg(short, long, default_value = "flowdata")]
        store: PathBuf,

        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List persisted flows
    List {
        #[arg(short, long, default_value = "flowdata")]
        store: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Validate a flow file
    Validate {
        /// Path to flow JSON file
        file: PathBuf,
    },

    /// Create a new example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { store, config, start } => serve(store, config, start).await?,
        Commands::Deploy { store, file } => deploy_flow(store, file).await?,
        Commands::List { store } => list_flows(store).await?,
        Commands::Nodes => list_nodes(),
        Commands::Validate { file } => validate_flow(file)?,
        Commands::Init { output } => create_example_flow(output)?,
    }

    Ok(())
}

fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry);
    registry
}

async fn open_orchestrator(store: &Path, config: RuntimeConfig) -> Result<FlowOrchestrator> {
    let store = JsonFileStore::open(store)
        .await
        .with_context(|| format!("opening store at {}", store.display()))?;
    Ok(FlowOrchestrator::new(
        Arc::new(standard_registry()),
        Arc::new(store),
        config,
    ))
}

fn read_flow(file: &Path) -> Result<FlowDefinition> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let definition = serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    Ok(definition)
}

async fn serve(store: PathBuf, config: Option<PathBuf>, start: Vec<String>) -> Result<()> {
    let config = match config {
        Some(path) => RuntimeConfig::from_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    println!("🚀 Flow runtime using store: {}", store.display());
    let orchestrator = open_orchestrator(&store, config).await?;
    println!("📦 {} node types registered", orchestrator.registry().len());

    let mut events = orchestrator.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let report = orchestrator.initialize().await;
    println!("♻️  Recovered {} flow(s)", report.started.len());
    for (flow_id, error) in &report.failed {
        println!("  ❌ {} did not recover: {}", flow_id, error);
    }

    for flow_id in start {
        if let Err(e) = orchestrator.start(&flow_id, None).await {
            println!("  ❌ {} failed to start: {}", flow_id, e);
        }
    }

    println!("Press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    println!();
    let report = orchestrator.shutdown().await;
    event_task.abort();
    println!("🛑 Stopped {} flow(s)", report.stopped.len());
    for (flow_id, error) in &report.failures {
        println!("  ⚠️  {}: {}", flow_id, error);
    }

    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::FlowStarted {
            flow_id, node_count, ..
        } => {
            println!("▶️  Flow {} started ({} nodes)", flow_id, node_count);
        }
        ExecutionEvent::FlowStopped { flow_id, .. } => {
            println!("⏹️  Flow {} stopped", flow_id);
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {}/{} failed: {}", event.flow_id(), node_id, error);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Debug { payload } => println!("  🐞 [{}] {}", node_id, payload),
            NodeEvent::Info { message } => println!("     ℹ️  [{}] {}", node_id, message),
            NodeEvent::Warning { message } => println!("     ⚠️  [{}] {}", node_id, message),
            NodeEvent::Status { text } => println!("     📡 [{}] {}", node_id, text),
        },
        ExecutionEvent::NodeOutput { .. } => {}
    }
}

async fn deploy_flow(store: PathBuf, file: PathBuf) -> Result<()> {
    let definition = read_flow(&file)?;
    let orchestrator = open_orchestrator(&store, RuntimeConfig::default()).await?;

    let deployed = orchestrator.deploy(definition).await?;
    println!("✅ Deployed '{}'", deployed.name);
    println!("   ID: {}", deployed.id);
    println!("   Version: {}", deployed.version);
    println!();
    println!("Start it with:");
    println!("  flow serve --store {} --start {}", store.display(), deployed.id);
    Ok(())
}

async fn list_flows(store: PathBuf) -> Result<()> {
    let orchestrator = open_orchestrator(&store, RuntimeConfig::default()).await?;
    let flows = orchestrator.list_flows().await?;

    if flows.is_empty() {
        println!("No flows in {}", store.display());
        return Ok(());
    }

    println!("📋 Flows:");
    for flow in flows {
        let status = serde_json::to_value(flow.status)?;
        println!(
            "  • {} [{}] {} (v{}, {} nodes)",
            flow.id,
            status.as_str().unwrap_or_default(),
            flow.name,
            flow.version,
            flow.nodes.len()
        );
    }
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = standard_registry();
    for node_type in registry.list_types() {
        if let Some(metadata) = registry.metadata(&node_type) {
            println!("  • {} ({}, {:?})", node_type, metadata.category, metadata.kind);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn validate_flow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let definition = read_flow(&file)?;
    let report = validate_definition(&definition, &standard_registry())?;

    println!("✅ Flow is valid:");
    println!("   Name: {}", definition.name);
    println!("   Nodes: {}", definition.nodes.len());
    println!("   Wires: {}", definition.wires.len());
    for warning in &report.warnings {
        println!("   ⚠️  {}", warning);
    }

    Ok(())
}

fn create_example_flow(output: PathBuf) -> Result<()> {
    let mut flow = FlowDefinition::new("Example Beacon");
    flow.description = Some("Transmits a beacon every ten seconds and shows the receipt".to_string());

    let inject = flow.add_node(
        NodeConfig::new("inject")
            .with_name("Every 10s")
            .with_config("payload", "BEACON")
            .with_config("interval_ms", 10_000),
    );
    let transmit = flow.add_node(
        NodeConfig::new("radio.transmit")
            .with_name("Transmit")
            .with_config("channel", "146.520"),
    );
    let debug = flow.add_node(NodeConfig::new("debug").with_name("Receipt"));

    flow.connect(inject, "out", transmit.clone(), "in");
    flow.connect(transmit, "out", debug, "in");

    let json = serde_json::to_string_pretty(&flow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Deploy it with:");
    println!("  flow deploy --file {}", output.display());

    Ok(())
}
