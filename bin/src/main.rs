#![allow(clippy::cognitive_complexity)]
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};

mod config;
mod startup_health;

use crate::config::{
    cli::{self, Parser},
    trace,
};
use ::config::ConnectionConfig;
use external_api::{ExternalApi, Health};
use nsq_coordination::{CoordinationError, Coordinator, Message, ShutdownCoordinator};
use startup_health::verify_background_task_running;
use tokio::{runtime::Builder, signal, sync::mpsc};
use tracing::*;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// time reader connections get to finish their CLS/CLOSE_WAIT exchange
const CLOSE_GRACE: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.nsq_link_log, config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start nsq-link"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing nsq config");
    let nsq_cfg = Arc::new(
        ConnectionConfig::parse(&config.config_path)
            .with_context(|| format!("failed to load {}", config.config_path.display()))?,
    );
    info!(topic = nsq_cfg.topic(), reader = config.reader, "loaded nsq config");

    let mut coordinator = Coordinator::nsq((*nsq_cfg).clone());
    if config.reader {
        coordinator = coordinator.with_reader();
    }
    let startup = coordinator.start().context("failed to start nsq")?;

    // start external api for healthchecks, health stays BAD until nsq is ready
    let api = ExternalApi::new(
        config.external_api,
        Arc::clone(&nsq_cfg),
        startup.readiness(),
    );
    let api_sender = api.sender();
    let mut api_task = api.start();
    verify_background_task_running("external API", &mut api_task)
        .await
        .context("startup check failed")?;

    // pre-stop hook: registered before waiting so ctrl-c also ends a pending startup
    let shutdown = startup.shutdown_handle();
    let signal_task = tokio::spawn(shutdown_signal(shutdown.clone()));

    let system = match startup.ready().await {
        Ok(system) => system,
        Err(CoordinationError::ShutDown) => {
            info!("shutdown requested before nsq was ready");
            api_task.abort();
            return Ok(());
        }
        Err(err) => {
            set_bad(&api_sender).await;
            shutdown.shutdown();
            api_task.abort();
            return Err(anyhow!(err).context("nsq did not become ready"));
        }
    };
    if system.has_reader() {
        system.on_message(log_message)?;
    }

    debug!("changing health to good after nsq is ready");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    shutdown.wait().await;
    set_bad(&api_sender).await;
    tokio::time::sleep(CLOSE_GRACE).await;
    drop(system);

    api_task.abort();
    match signal_task.await {
        Ok(res) => res,
        Err(err) => Err(anyhow!(err)),
    }
}

async fn set_bad(api_sender: &mpsc::Sender<Health>) {
    if let Err(err) = api_sender.send(Health::Bad).await {
        warn!(?err, "failed to change health status to Bad");
    }
}

fn log_message(msg: &Message) -> Result<()> {
    info!(
        id = %msg.id(),
        attempts = msg.attempts(),
        payload = %String::from_utf8_lossy(msg.body()),
        "received message"
    );
    Ok(())
}

async fn shutdown_signal(shutdown: ShutdownCoordinator) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    info!("received ctrl-c, shutting down");
    shutdown.shutdown();
    ret
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[tokio::test]
    async fn test_set_bad_reaches_api() {
        let (tx, mut rx) = mpsc::channel(1);
        set_bad(&tx).await;
        assert_eq!(rx.recv().await, Some(Health::Bad));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_set_bad_logs_when_api_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        set_bad(&tx).await;
        assert!(logs_contain("failed to change health status to Bad"));
    }
}
