//! PitchDesk Backend Library
//!
//! Dynamic pricing, live price fan-out and single-submission pitch handling
//! for the opportunity marketplace. Exposed as a library for the binary and
//! the integration tests.

pub mod api;
pub mod auth;
pub mod broadcaster;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod pricing;
pub mod repositories;
pub mod services;
pub mod websocket;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{AppError, AppResult};

use broadcaster::PriceBroadcaster;
use clock::Clock;
use pricing::PricingModel;
use repositories::Repositories;
use services::{
    AutosaveQueue, EngineHandle, OpportunityService, PitchService, PriceEngine, QueryService,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Shared state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub broadcaster: PriceBroadcaster,
    pub engine: EngineHandle,
    pub pitches: Arc<PitchService>,
    pub queries: Arc<QueryService>,
    pub opportunities: Arc<OpportunityService>,
    pub autosave: AutosaveQueue,
}

/// Tasks started alongside the state
pub struct BackgroundTasks {
    pub engine: JoinHandle<()>,
    pub autosave: JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn abort(&self) {
        self.engine.abort();
        self.autosave.abort();
    }
}

impl AppState {
    /// Wire services over `repos` and start the price engine and the
    /// autosave flusher. Must run inside a tokio runtime.
    pub fn start(
        config: &AppConfig,
        repos: Repositories,
        clock: Arc<dyn Clock>,
    ) -> AppResult<(Self, BackgroundTasks)> {
        config.submission.validate().map_err(AppError::Config)?;
        let pricing = PricingModel::new(config.pricing.clone())
            .map_err(|e| AppError::Config(e.to_string()))?;
        let pricing = Arc::new(pricing);

        let broadcaster = PriceBroadcaster::new(
            repos.opportunities.clone(),
            repos.price_history.clone(),
            pricing.clone(),
            clock.clone(),
            config.broadcast.clone(),
        );

        let engine = PriceEngine::new(
            &repos,
            pricing.clone(),
            broadcaster.clone(),
            clock.clone(),
            config.engine.clone(),
        );
        let (engine_handle, engine_task) = engine.spawn();

        let pitches = Arc::new(
            PitchService::new(&repos, clock.clone(), config.submission.clone())
                .with_engine(engine_handle.clone()),
        );
        let queries = Arc::new(QueryService::new(&repos, pricing.clone(), clock));
        let opportunities = Arc::new(
            OpportunityService::new(&repos, pricing).with_engine(engine_handle.clone()),
        );

        let autosave =
            AutosaveQueue::new(pitches.clone(), config.submission.autosave_queue_capacity);
        let autosave_task = autosave.spawn_flusher(config.submission.autosave_flush_interval());

        let state = Self {
            broadcaster,
            engine: engine_handle,
            pitches,
            queries,
            opportunities,
            autosave,
        };

        Ok((
            state,
            BackgroundTasks {
                engine: engine_task,
                autosave: autosave_task,
            },
        ))
    }
}
