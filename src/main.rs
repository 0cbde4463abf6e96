//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use converge::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use converge::config::{
    find_document_file, DesiredDocument, DocumentParser, DocumentValidator, StateBackend,
};
use converge::error::{ConfigError, ConvergeError, Result, StateError};
use converge::graph::{Address, Attributes, GraphBuilder};
use converge::planner::{ApplyReport, Plan};
use converge::provider::{LocalExecutor, NullProvider, ProviderSet, ProvisionerRunner};
use converge::reconciler::Reconciler;
use converge::state::{
    generate_holder_id, Backend, HistoryEntry, HistoryOperation, LocalBackend, Removal,
    S3Backend, StateEntry, StateStore, STATE_DIR,
};

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph => cmd_graph(config, &formatter),
        Commands::Plan { out, destroy } => {
            cmd_plan(config, out.as_deref(), destroy, &formatter).await
        }
        Commands::Apply {
            plan,
            yes,
            parallelism,
            fail_fast,
        } => cmd_apply(config, plan.as_deref(), yes, parallelism, fail_fast, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Validate the document.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (document, _) = load_document(config_path)?;
    let result = DocumentValidator::new().check(&document);

    let valid = result.is_valid() && {
        match GraphBuilder::build(&document) {
            Ok(graph) => {
                info!("Graph expands to {} instances", graph.len());
                true
            }
            Err(e) => {
                emit(&formatter.error(&e.to_string()))?;
                false
            }
        }
    };

    emit(&formatter.format_validation(&result, show_warnings))?;
    Ok(exit_code(valid))
}

/// Show the expanded graph.
fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (document, _) = load_document(config_path)?;
    DocumentValidator::new().validate(&document)?;
    let graph = GraphBuilder::build(&document)?;
    emit(&formatter.format_graph(&graph))?;
    Ok(ExitCode::SUCCESS)
}

/// Compute and show a plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    out: Option<&Path>,
    destroy: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let reconciler = build_reconciler(config_path).await?;
    let plan = if destroy {
        reconciler.plan_destroy().await?
    } else {
        reconciler.plan().await?
    };

    emit(&formatter.format_plan(&plan))?;

    if let Some(path) = out {
        plan.save(path)?;
        eprintln!("Plan saved to {}", path.display());
    }

    Ok(ExitCode::SUCCESS)
}

/// Apply a saved plan, or plan and apply.
async fn cmd_apply(
    config_path: Option<&Path>,
    plan_path: Option<&Path>,
    yes: bool,
    parallelism: Option<usize>,
    fail_fast: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let mut reconciler = build_reconciler(config_path).await?;
    if let Some(parallelism) = parallelism {
        reconciler = reconciler.with_parallelism(parallelism);
    }
    if fail_fast {
        reconciler = reconciler.with_fail_fast(true);
    }

    let plan = if let Some(path) = plan_path {
        info!("Applying saved plan: {}", path.display());
        Plan::load(path)?
    } else {
        let plan = reconciler.plan().await?;
        if plan.is_empty() {
            emit(&formatter.format_plan(&plan))?;
            return Ok(ExitCode::SUCCESS);
        }
        show_plan(&plan, formatter)?;
        if !yes && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
        plan
    };

    let report = apply_with_interrupt(&reconciler, &plan).await?;
    emit(&formatter.format_report(&report))?;
    Ok(exit_code(report.is_success()))
}

/// Destroy everything in state.
async fn cmd_destroy(
    config_path: Option<&Path>,
    yes: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let reconciler = build_reconciler(config_path).await?;
    let plan = reconciler.plan_destroy().await?;

    if plan.is_empty() {
        emit(&formatter.success("Nothing recorded in state."))?;
        return Ok(ExitCode::SUCCESS);
    }

    show_plan(&plan, formatter)?;

    if !yes
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let report = apply_with_interrupt(&reconciler, &plan).await?;
    emit(&formatter.format_report(&report))?;
    Ok(exit_code(report.is_success()))
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (document, base_dir) = load_document(config_path)?;
    let store = StateStore::open(open_backend(&document, &base_dir).await?).await?;
    let holder = document
        .settings
        .lock_holder
        .clone()
        .unwrap_or_else(generate_holder_id);

    match command {
        StateCommands::List => {
            emit(&formatter.format_state_list(&store.snapshot().await))?;
        }
        StateCommands::Show { address } => {
            let address = parse_address(&address)?;
            let entry = store.get(&address).await.ok_or_else(|| StateError::EntryNotFound {
                address: address.to_string(),
            })?;
            emit(&formatter.format_entry(&entry))?;
        }
        StateCommands::Mv { from, to } => {
            let (from, to) = (parse_address(&from)?, parse_address(&to)?);
            let addresses = vec![from.to_string(), to.to_string()];
            with_lock(&store, &holder, HistoryOperation::Move, addresses, async {
                store.move_entry(&from, &to).await
            })
            .await?;
            emit(&formatter.success(&format!("Moved {from} to {to}")))?;
        }
        StateCommands::Rm { address } => {
            let address = parse_address(&address)?;
            with_lock(&store, &holder, HistoryOperation::Forget, vec![address.to_string()], async {
                store.remove(&address, Removal::Forgotten).await.map(|_| ())
            })
            .await?;
            emit(&formatter.success(&format!("Removed {address} from state")))?;
        }
        StateCommands::Import {
            address,
            attributes,
        } => {
            let address = parse_address(&address)?;
            let attributes: Attributes = serde_json::from_str(&attributes).map_err(|e| {
                ConfigError::validation(
                    format!("attributes must be a JSON object: {e}"),
                    "attributes",
                )
            })?;
            let kind = GraphBuilder::build(&document)
                .ok()
                .and_then(|graph| graph.get(&address).map(|i| i.kind))
                .unwrap_or_default();
            let entry = StateEntry::new(address.clone(), kind, attributes);
            with_lock(&store, &holder, HistoryOperation::Import, vec![address.to_string()], async {
                store.import(entry).await
            })
            .await?;
            emit(&formatter.success(&format!("Imported {address}")))?;
        }
        StateCommands::Taint { address } => {
            set_taint(&store, &holder, &address, true).await?;
            emit(&formatter.success(&format!("Tainted {address}")))?;
        }
        StateCommands::Untaint { address } => {
            set_taint(&store, &holder, &address, false).await?;
            emit(&formatter.success(&format!("Untainted {address}")))?;
        }
        StateCommands::Lock { holder: requested } => {
            let lock = store.lock(requested.as_deref().unwrap_or(&holder)).await?;
            emit(&formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            let Some(current) = store.lock_info().await? else {
                emit(&formatter.warning("State is not locked."))?;
                return Ok(ExitCode::SUCCESS);
            };
            match lock_id {
                Some(id) if id == current.lock_id => store.force_unlock(&id).await?,
                Some(id) => {
                    return Err(StateError::lock_contention(
                        format!("lock {id} is not the current lock {}", current.lock_id),
                        Some(current.holder),
                    )
                    .into());
                }
                None if force => store.force_unlock(&current.lock_id).await?,
                None => {
                    emit(&formatter.warning(&format!(
                        "State is locked by {current}; pass --lock-id or --force to release it."
                    )))?;
                    return Ok(ExitCode::FAILURE);
                }
            }
            emit(&formatter.success("State unlocked."))?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn set_taint(store: &StateStore, holder: &str, address: &str, tainted: bool) -> Result<()> {
    let address = parse_address(address)?;
    with_lock(store, holder, HistoryOperation::Taint, vec![address.to_string()], async {
        store.set_tainted(&address, tainted).await
    })
    .await
}

/// Runs a state mutation under the lock and records it in history.
async fn with_lock<F>(
    store: &StateStore,
    holder: &str,
    operation: HistoryOperation,
    addresses: Vec<String>,
    mutation: F,
) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    store.lock(holder).await?;

    let result = mutation.await;
    let history = match &result {
        Ok(()) => HistoryEntry::new(operation, addresses),
        Err(e) => HistoryEntry::failed(operation, addresses, &e.to_string()),
    };
    if let Err(e) = store.record_history(history).await {
        warn!("Failed to record history: {}", e);
    }

    if let Err(e) = store.unlock().await {
        warn!("Failed to release state lock: {}", e);
    }
    result
}

/// Applies a plan, turning Ctrl-C into a graceful cancellation.
async fn apply_with_interrupt(reconciler: &Reconciler, plan: &Plan) -> Result<ApplyReport> {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; waiting for running steps to finish");
            let _ = cancel_tx.send(true);
        }
    });

    let result = reconciler.apply(plan, cancel_rx).await;
    interrupt.abort();
    result
}

/// Builds a reconciler with the bundled collaborators.
async fn build_reconciler(config_path: Option<&Path>) -> Result<Reconciler> {
    let (document, base_dir) = load_document(config_path)?;
    DocumentValidator::new().validate(&document)?;

    let store = Arc::new(StateStore::open(open_backend(&document, &base_dir).await?).await?);
    let providers = Arc::new(ProviderSet::new().with("null", Arc::new(NullProvider::new())));
    let provisioners = Arc::new(ProvisionerRunner::new(Arc::new(LocalExecutor::new())));

    Reconciler::new(&document, store, providers, provisioners)
}

/// Opens the backend named by the document's state section.
async fn open_backend(document: &DesiredDocument, base_dir: &Path) -> Result<Arc<dyn Backend>> {
    let state = &document.state;
    match state.backend {
        StateBackend::Local => {
            let dir = state
                .path
                .as_deref()
                .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p));
            debug!("Using local state in {}", dir.display());
            Ok(Arc::new(LocalBackend::with_base_dir(dir)))
        }
        StateBackend::S3 => {
            let bucket = state.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("S3 state requires a bucket", "state.bucket")
            })?;
            debug!("Using S3 state in bucket {}", bucket);
            Ok(Arc::new(
                S3Backend::new(bucket, state.prefix.as_deref(), state.region.as_deref()).await,
            ))
        }
    }
}

/// Loads the document and `.env`, returning it with its directory.
fn load_document(config_path: Option<&Path>) -> Result<(DesiredDocument, PathBuf)> {
    let path = resolve_document_path(config_path)?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let parser = DocumentParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;
    let document = parser.load_with_env(&path)?;
    Ok((document, base_dir))
}

/// Resolves the document path.
fn resolve_document_path(config_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = config_path {
        return Ok(path.to_path_buf());
    }

    let cwd = std::env::current_dir()?;
    find_document_file(cwd)
}

fn parse_address(input: &str) -> Result<Address> {
    Ok(input.parse::<Address>()?)
}

/// Shows a plan before it is applied; JSON output carries only the report.
fn show_plan(plan: &Plan, formatter: &OutputFormatter) -> Result<()> {
    if formatter.format() == OutputFormat::Text {
        emit(&formatter.format_plan(plan))?;
    }
    Ok(())
}

/// Prompts on stderr and compares the answer.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", output.trim_end()).map_err(ConvergeError::from)
}

const fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
