//! evalrunner -- execution engine for LLM evaluation suites.
//!
//! Loads declarative test suites, drives each test case through a pluggable
//! adapter, scores the output with an evaluation service, and records runs
//! and results for history queries.

pub mod adapters;
pub mod api;
pub mod config;
pub mod evaluation;
pub mod model;
pub mod report;
pub mod runner;
pub mod storage;
pub mod suite;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::adapters::AdapterRegistry;
use crate::config::AppConfig;
use crate::evaluation::HttpEvaluator;
use crate::runner::{ParallelRunner, TestExecutor};
use crate::storage::SqliteStore;

/// Wire the runner against the configured SQLite store and scoring service.
pub fn build_runner(config: &AppConfig, registry: AdapterRegistry) -> Result<(ParallelRunner, HttpEvaluator)> {
    let db_path = &config.storage.db_path;
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let store = SqliteStore::open(db_path)
        .with_context(|| format!("opening result store at {}", db_path.display()))?;

    let evaluator = HttpEvaluator::from_config(&config.evaluation).context("building evaluation client")?;
    let executor = TestExecutor::new(
        Arc::new(registry),
        Arc::new(evaluator.clone()),
        config.runner.clone(),
    );
    Ok((ParallelRunner::new(executor, Arc::new(store)), evaluator))
}

/// Start the API server and serve until Ctrl-C.
pub async fn serve(config: AppConfig) -> Result<()> {
    let (runner, evaluator) = build_runner(&config, AdapterRegistry::with_builtins())?;
    if !evaluator.health_check().await {
        tracing::warn!(base_url = %evaluator.base_url(), "evaluation service not reachable; scored tests will error until it is");
    }

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let grace = config.server.shutdown_grace();
    let state = api::state::AppState::new(runner, Some(evaluator), config);
    let app = api::router(state.clone());

    tracing::info!(%addr, "evalrunner listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    // Cancelled runs still have to write their final record before the runtime goes away.
    state.shutdown(grace).await;

    Ok(())
}
