pub mod catalog;
pub mod config;
pub mod error;
pub mod packet_buffer;
pub mod protocol;
pub mod services;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use log::{error, info, warn};

use crate::catalog::SkillCatalog;
use crate::config::{load_config, AppConfig, DEFAULT_CONFIG_FILE};
use crate::error::{MeterError, Result};
use crate::protocol::layout::ProtocolLayout;
use crate::protocol::types::{AnalyzedSkill, DpsSnapshot, EntityId, SkillCode};
use crate::services::aggregator::DamageAggregator;
use crate::services::interface;
use crate::services::pipeline::{Pipeline, PipelineStats};

/// Command/query surface for whatever presents the meter.
///
/// Owns the one aggregator instance; the capture pipeline gets a handle to it
/// on `start` and is its only writer.
pub struct DpsMeter {
    aggregator: Arc<DamageAggregator>,
    pipeline: Mutex<Option<Pipeline>>,
}

impl DpsMeter {
    pub fn new(catalog: SkillCatalog) -> Self {
        Self {
            aggregator: Arc::new(DamageAggregator::new(Arc::new(catalog))),
            pipeline: Mutex::new(None),
        }
    }

    pub fn aggregator(&self) -> Arc<DamageAggregator> {
        self.aggregator.clone()
    }

    fn pipeline(&self) -> MutexGuard<'_, Option<Pipeline>> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the capture device and starts capturing. A pipeline whose
    /// capture loop already ended is replaced.
    pub fn start(&self, config: &AppConfig) -> Result<()> {
        let mut slot = self.pipeline();
        if slot.as_ref().is_some_and(Pipeline::is_running) {
            return Err(MeterError::AlreadyRunning);
        }
        // Joins the dead pipeline's threads before opening a new capture
        *slot = None;

        let layout = Arc::new(ProtocolLayout::load(&config.protocol_file)?);
        let device = interface::resolve(config.device_name.as_deref())?;
        *slot = Some(Pipeline::start(device, config, layout, self.aggregator.clone())?);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(mut pipeline) = self.pipeline().take() {
            pipeline.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.pipeline().as_ref().is_some_and(Pipeline::is_running)
    }

    pub fn get_dps(&self) -> DpsSnapshot {
        self.aggregator.snapshot()
    }

    pub fn get_battle_detail(&self, entity: EntityId) -> IndexMap<SkillCode, AnalyzedSkill> {
        self.aggregator.detail(entity)
    }

    pub fn reset_data_storage(&self) {
        self.aggregator.reset();
    }

    /// Display names otherwise outlive `reset_data_storage`.
    pub fn clear_nicknames(&self) {
        self.aggregator.clear_nicknames();
    }

    /// `None` until a pipeline has been started.
    pub fn stats(&self) -> Option<PipelineStats> {
        self.pipeline().as_ref().map(Pipeline::stats)
    }
}

fn log_table(snapshot: &DpsSnapshot) {
    if snapshot.map.is_empty() {
        return;
    }

    info!(
        "--- {} | {:.1}s ---",
        if snapshot.target_name.is_empty() { "?" } else { &snapshot.target_name },
        snapshot.elapsed_ms as f64 / 1000.0
    );
    for (rank, (_, stats)) in snapshot.ranking().into_iter().enumerate() {
        info!(
            "{:>2}. {:<16} {:<6} {:>10.0} dps {:>5.1}% {:>12}",
            rank + 1,
            stats.nickname,
            stats.job.map_or("-", |job| job.display_name()),
            stats.dps,
            stats.damage_contribution,
            stats.total_damage
        );
    }
}

/// Headless entry point: capture, then print the ranking every `refreshInterval`.
pub fn run() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = load_config(&config_path);
    info!("[Meter] Config: {}", config_path.display());

    let meter = DpsMeter::new(SkillCatalog::load(&config.skill_catalog));
    if let Err(e) = meter.start(&config) {
        error!("[Meter] Startup failed: {}", e);
        return ExitCode::FAILURE;
    }

    let refresh = config.refresh_interval.max(Duration::from_millis(50));
    while meter.is_running() {
        thread::sleep(refresh);
        log_table(&meter.get_dps());
    }

    warn!("[Meter] Capture ended. {:?}", meter.stats());
    meter.stop();
    ExitCode::FAILURE
}
