use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{Builder, Rotation},
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use conveyor_host::{server, SchedulerState};

#[tokio::main]
async fn main() -> Result<()> {
    let state = SchedulerState::init()?;
    let _guard = subscribe_log(
        &state.opts.log_path,
        &state.opts.log_level,
        state.opts.max_log,
    );
    tracing::info!(
        "starting conveyor for {:?} on pools {:?}",
        state.opts.repos,
        state.opts.pools
    );

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn(state.scheduler.clone().run(
        Duration::from_secs(state.opts.loop_period_secs),
        cancel.clone(),
    ));

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    };
    let address = state.opts.address.clone();
    server::serve(state, &address, shutdown).await?;

    cancel.cancel();
    let _ = loop_handle.await;
    Ok(())
}

fn subscribe_log(
    log_path: &Option<PathBuf>,
    log_level: &str,
    max_log: usize,
) -> Option<WorkerGuard> {
    let subscriber_builder = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(log_level))
        .with_test_writer();
    match log_path {
        Some(log_path) => {
            let file_appender = Builder::new()
                .rotation(Rotation::DAILY)
                .filename_prefix("conveyor.log")
                .max_log_files(max_log)
                .build(log_path)
                .expect("initializing rolling file appender failed");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let subscriber = subscriber_builder.json().with_writer(non_blocking).finish();
            tracing::subscriber::set_global_default(subscriber).expect("setting subscriber failed");
            Some(guard)
        }
        None => {
            let subscriber = subscriber_builder.finish();
            tracing::subscriber::set_global_default(subscriber).expect("setting subscriber failed");
            None
        }
    }
}
