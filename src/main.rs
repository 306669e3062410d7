//! feedrelay service.
//!
//! Main entry point. Wires the HTTP collaborators into the reliability
//! layer, runs the poller, delivery queue and health reset as background
//! tasks, and coordinates graceful shutdown.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use feedrelay_core::{
    CircuitSnapshot, CircuitStateStore, Clock, MemoryCircuitStore, MemorySeenStore,
    PlainRenderer, RealClock, Secret, DOWNSTREAM_SEND, UPSTREAM_FETCH,
};
use feedrelay_http::{HttpFeedSource, WebhookSender};
use feedrelay_pipeline::{standard_pipeline, Delivery, Poller, StandardStages};
use feedrelay_reliability::{CircuitBreaker, CredentialRotator, DeliveryQueue, TransitionHook};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DeliveryMode, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(config.log_format);

    info!(
        upstream_url = %config.upstream_url,
        downstream_url = %config.downstream_url,
        credentials = config.credentials.len(),
        topics = config.topics.len(),
        delivery_mode = ?config.delivery_mode,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let client_config = config.to_client_config();
    let source = Arc::new(
        HttpFeedSource::new(&config.upstream_url, client_config.clone())
            .context("Failed to build upstream client")?,
    );
    let sender = Arc::new(
        WebhookSender::new(
            &config.downstream_url,
            config.downstream_token.clone().map(Secret::new),
            client_config,
        )
        .context("Failed to build downstream client")?,
    );
    let seen = Arc::new(MemorySeenStore::new());
    let circuit_store: Arc<dyn CircuitStateStore> = Arc::new(MemoryCircuitStore::new());

    let token = CancellationToken::new();

    let (transitions, transition_rx) = mpsc::unbounded_channel::<CircuitSnapshot>();
    let hook: TransitionHook = Arc::new(move |snapshot: &CircuitSnapshot| {
        if transitions.send(snapshot.clone()).is_err() {
            debug!(category = %snapshot.category, "circuit persistence stopped");
        }
    });
    let breaker = Arc::new(
        CircuitBreaker::new(config.to_circuit_config(), Arc::clone(&clock))
            .with_transition_hook(hook),
    );
    let restored = breaker
        .restore_from(circuit_store.as_ref(), &[UPSTREAM_FETCH, DOWNSTREAM_SEND])
        .await
        .context("Failed to restore circuit state")?;
    info!(restored, "Circuit state restored");
    let persistence =
        spawn_circuit_persistence(transition_rx, Arc::clone(&circuit_store), token.clone());

    let rotator = Arc::new(
        CredentialRotator::new(config.credentials(), config.to_rotator_config(), Arc::clone(&clock))
            .context("Failed to build credential pool")?,
    );

    let queue = Arc::new(
        DeliveryQueue::new(
            config.to_queue_config(),
            sender.clone(),
            seen.clone(),
            Arc::clone(&clock),
        )
        .with_circuit_breaker(Arc::clone(&breaker)),
    );

    let delivery = match config.delivery_mode {
        DeliveryMode::Queued => Delivery::Queued(Arc::clone(&queue)),
        DeliveryMode::Direct => {
            Delivery::Direct { sender, breaker: Some(Arc::clone(&breaker)) }
        },
    };
    let stages = StandardStages {
        seen,
        renderer: Arc::new(PlainRenderer),
        topics: config.topics.clone(),
        max_age: config.max_age(),
        send_options: config.send_options(),
        delivery,
    };
    let pipeline = standard_pipeline(config.to_pipeline_config(), Arc::clone(&clock), stages)
        .context("Failed to assemble pipeline")?;
    info!(stages = ?pipeline.stage_names(), "Pipeline assembled");

    let poller = Arc::new(Poller::new(
        config.to_poller_config(),
        config.topics.clone(),
        source,
        Arc::clone(&rotator),
        Arc::clone(&breaker),
        Arc::new(pipeline),
        clock,
    ));

    let queue_task = Arc::clone(&queue).spawn(token.clone());
    let health_task = Arc::clone(&rotator).spawn_health_reset(token.clone());
    let mut poller_task = poller.spawn(token.clone());

    info!("feedrelay is running");

    let poller_exit = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, starting graceful shutdown");
            None
        },
        joined = &mut poller_task => Some(joined),
    };
    token.cancel();

    let drain = async {
        let poller_result = match poller_exit {
            Some(joined) => joined,
            None => poller_task.await,
        };
        let tasks = [("queue", queue_task), ("health", health_task), ("persistence", persistence)];
        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Background task failed");
            }
        }
        poller_result
    };

    let mut halted = None;
    match tokio::time::timeout(config.shutdown_timeout(), drain).await {
        Ok(Ok(Ok(()))) => info!("Poller stopped"),
        Ok(Ok(Err(e))) => {
            error!(error = %e, "Poller halted");
            halted = Some(e);
        },
        Ok(Err(e)) => error!(error = %e, "Poller task failed"),
        Err(_) => warn!("Shutdown grace period expired"),
    }

    if let Err(e) = breaker.persist_to(circuit_store.as_ref()).await {
        warn!(error = %e, "Failed to persist circuit state");
    }

    let status = queue.status().await;
    info!(
        pending = status.queue_length,
        delivered = status.delivered,
        dead_lettered = status.dead_lettered,
        "Delivery queue stopped"
    );

    info!("feedrelay shutdown complete");
    match halted {
        Some(e) => Err(e).context("Poller halted"),
        None => Ok(()),
    }
}

/// Initializes tracing with environment-based filtering.
fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,feedrelay=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_file(true).with_line_number(true))
            .init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).init(),
    }
}

/// Saves every circuit transition to `store` until cancelled.
fn spawn_circuit_persistence(
    mut transitions: mpsc::UnboundedReceiver<CircuitSnapshot>,
    store: Arc<dyn CircuitStateStore>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snapshot = tokio::select! {
                () = token.cancelled() => break,
                snapshot = transitions.recv() => snapshot,
            };
            let Some(snapshot) = snapshot else { break };

            if let Err(e) = store.save(&snapshot.category, &snapshot).await {
                warn!(category = %snapshot.category, error = %e, "Failed to persist circuit state");
            }
        }
    })
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
