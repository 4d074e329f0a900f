use std::sync::Arc;

use anyhow::{Context, bail};
use serde_json::Value;
use step_sandbox::broker::HostBroker;
use step_sandbox::config::{SandboxConfig, WorkerCommand};
use step_sandbox::config_service::{ConfigService, HttpConfigService, StaticConfigService};
use step_sandbox::executor::StepExecutor;
use step_sandbox::protocol::{ErrorPayload, ExecutionMeta, StepReference};
use step_sandbox::steps::{BUILTIN_MODULE, builtin_registry};
use step_sandbox::store::MapStore;
use step_sandbox::worker::WorkerRuntime;

const USAGE: &str = "\
usage: step-sandbox worker
       step-sandbox run <modulePath> [inputJson] [--module ID] [--app ID] [--device ID]
                        [--user ID] [--catch NAME:MESSAGE]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the worker protocol; logs go to stderr in both modes.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match parse_mode(std::env::args().skip(1))? {
        Mode::Worker => run_worker().await,
        Mode::Run(args) => run_step(args).await,
    }
}

enum Mode {
    Worker,
    Run(Vec<String>),
}

fn parse_mode(mut args: impl Iterator<Item = String>) -> anyhow::Result<Mode> {
    match args.next().as_deref() {
        Some("worker") => Ok(Mode::Worker),
        Some("run") => Ok(Mode::Run(args.collect())),
        _ => bail!("{USAGE}"),
    }
}

async fn run_worker() -> anyhow::Result<()> {
    let config = SandboxConfig::from_env(WorkerCommand::current_exe()?)?;
    let registry = builtin_registry();
    tracing::debug!(steps = registry.count(), "Loaded step registry");

    WorkerRuntime::new(Arc::new(registry), config.context)
        .run_stdio()
        .await?;
    Ok(())
}

struct RunArgs {
    module_id: String,
    module_path: String,
    input: Value,
    meta: ExecutionMeta,
    catch: Option<ErrorPayload>,
}

fn parse_run_args(args: Vec<String>) -> anyhow::Result<RunArgs> {
    let mut positional = Vec::new();
    let mut module_id = BUILTIN_MODULE.to_string();
    let mut app_id = "local".to_string();
    let mut device_id = "local".to_string();
    let mut user_id = None;
    let mut catch = None;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .with_context(|| format!("{flag} needs a value\n{USAGE}"))
        };
        match arg.as_str() {
            "--module" => module_id = value("--module")?,
            "--app" => app_id = value("--app")?,
            "--device" => device_id = value("--device")?,
            "--user" => user_id = Some(value("--user")?),
            "--catch" => {
                let raw = value("--catch")?;
                let (name, message) = raw.split_once(':').unwrap_or((raw.as_str(), ""));
                catch = Some(ErrorPayload::named(name, message));
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let Some(module_path) = positional.next() else {
        bail!("missing <modulePath>\n{USAGE}");
    };
    let input = match positional.next() {
        Some(raw) => serde_json::from_str(&raw).context("inputJson is not valid JSON")?,
        None => Value::Null,
    };

    let mut meta = ExecutionMeta::new(app_id, device_id);
    if let Some(user_id) = user_id {
        meta = meta.with_user(user_id);
    }

    Ok(RunArgs {
        module_id,
        module_path,
        input,
        meta,
        catch,
    })
}

async fn run_step(args: Vec<String>) -> anyhow::Result<()> {
    let run = parse_run_args(args)?;
    let config = SandboxConfig::from_env(WorkerCommand::current_exe()?)?;

    let store = MapStore::open(&config.store_path);
    let service: Arc<dyn ConfigService> = match &config.config_service_url {
        Some(url) => Arc::new(HttpConfigService::new(
            url.clone(),
            config.config_service_token.clone(),
        )),
        None => {
            tracing::info!("No config service URL set, app/device info will be unavailable");
            Arc::new(StaticConfigService::new())
        }
    };
    tracing::info!(store = %config.store_path.display(), "Opened map store");

    let executor = StepExecutor::new(config.executor.clone(), Arc::new(HostBroker::new(service, store)));
    executor.start().await?;

    let reference = match run.catch {
        Some(error) => StepReference::catching(run.module_id, run.module_path, error),
        None => StepReference::new(run.module_id, run.module_path),
    };
    let outcome = executor.execute(run.input, reference, run.meta).await;
    executor.stop().await;

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
