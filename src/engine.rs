use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::config::{EngineConfig, EstimatorMode};
use crate::counter_model::CounterModel;
use crate::estimator::{EstimatorStack, LogisticEstimator};
use crate::features::fnv1a32;
use crate::lifecycle::{LifecycleManager, Services, SignalBook};
use crate::policy::{PolicyBook, ScopeFloors};
use crate::store::Store;
use crate::tick::{MatchContext, Tick};
use crate::tracker::OutcomeTracker;

#[derive(Debug, Clone)]
pub enum IngestEvent {
    Tick(Tick),
    Context(MatchContext),
    /// Force-settles a match that will receive no more ticks.
    Conclude { match_id: String, minute: u16 },
    Shutdown,
}

impl IngestEvent {
    fn match_id(&self) -> Option<&str> {
        match self {
            IngestEvent::Tick(t) => Some(&t.match_id),
            IngestEvent::Context(c) => Some(&c.match_id),
            IngestEvent::Conclude { match_id, .. } => Some(match_id),
            IngestEvent::Shutdown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub ticks: u64,
    pub duplicates: u64,
    pub errors: u64,
    pub windows_opened: u64,
    pub windows_settled: u64,
    pub signals_opened: u64,
    pub signals_settled: u64,
    pub matches_concluded: u64,
}

impl ShardStats {
    fn absorb(&mut self, other: &ShardStats) {
        self.ticks += other.ticks;
        self.duplicates += other.duplicates;
        self.errors += other.errors;
        self.windows_opened += other.windows_opened;
        self.windows_settled += other.windows_settled;
        self.signals_opened += other.signals_opened;
        self.signals_settled += other.signals_settled;
        self.matches_concluded += other.matches_concluded;
    }
}

/// Opens persistence and wires the shared models. Fails when the store cannot
/// be opened.
pub fn build_services(cfg: EngineConfig) -> Result<Services> {
    let store = Arc::new(
        Store::open(&cfg.storage.db_path)
            .with_context(|| format!("open event store {}", cfg.storage.db_path.display()))?,
    );
    build_services_with_store(cfg, store)
}

pub fn build_services_with_store(cfg: EngineConfig, store: Arc<Store>) -> Result<Services> {
    let model = Arc::new(CounterModel::with_store(cfg.model.clone(), store.clone()));
    let cells = model.load_from_store()?;

    let logistic = match cfg.prediction.mode {
        EstimatorMode::Logistic | EstimatorMode::Blend => Some(Arc::new(if store.path().is_some() {
            LogisticEstimator::open(&cfg.prediction, cfg.storage.data_dir.clone())
        } else {
            LogisticEstimator::new(&cfg.prediction)
        })),
        EstimatorMode::Counter | EstimatorMode::Remote => None,
    };
    let estimators = Arc::new(EstimatorStack::from_config(
        &cfg.prediction,
        model.clone(),
        logistic,
    ));

    let policies = Arc::new(PolicyBook::load(
        &store,
        cfg.default_policy,
        ScopeFloors::from_trainer(&cfg.trainer),
    )?);

    let tracker = Arc::new(if store.path().is_some() {
        OutcomeTracker::open(
            cfg.storage.tracker_state_path(),
            cfg.storage.audit_csv_path(),
        )?
    } else {
        OutcomeTracker::in_memory()
    });

    info!(
        cells,
        policies = policies.len(),
        mode = ?cfg.prediction.mode,
        "engine services ready"
    );
    Ok(Services {
        cfg: Arc::new(cfg),
        store,
        model,
        estimators,
        policies,
        book: Arc::new(SignalBook::new()),
        tracker,
    })
}

pub fn shard_for(match_id: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    fnv1a32(match_id) as usize % shards
}

/// Running engine: one worker thread per shard, each owning the sessions of
/// the matches that hash to it.
pub struct EngineHandle {
    senders: Vec<Sender<IngestEvent>>,
    workers: Vec<JoinHandle<ShardStats>>,
    services: Services,
}

impl EngineHandle {
    pub fn start(services: Services, shards: usize) -> Self {
        let shards = shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, rx) = mpsc::channel();
            let manager = LifecycleManager::new(services.clone());
            workers.push(thread::spawn(move || run_shard(shard, manager, rx)));
            senders.push(tx);
        }
        Self {
            senders,
            workers,
            services,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn submit(&self, event: IngestEvent) -> Result<()> {
        let Some(match_id) = event.match_id() else {
            for tx in &self.senders {
                let _ = tx.send(IngestEvent::Shutdown);
            }
            return Ok(());
        };
        let shard = shard_for(match_id, self.senders.len());
        self.senders[shard]
            .send(event)
            .map_err(|_| anyhow!("shard {shard} is no longer running"))
    }

    /// Drains every shard, waits for the workers and persists model weights.
    pub fn shutdown(self) -> Result<ShardStats> {
        for tx in &self.senders {
            let _ = tx.send(IngestEvent::Shutdown);
        }
        drop(self.senders);
        let mut total = ShardStats::default();
        for (shard, worker) in self.workers.into_iter().enumerate() {
            match worker.join() {
                Ok(stats) => total.absorb(&stats),
                Err(_) => warn!(shard, "shard worker panicked"),
            }
        }
        if let Some(logistic) = self.services.estimators.logistic() {
            logistic.save()?;
        }
        info!(
            ticks = total.ticks,
            signals_opened = total.signals_opened,
            signals_settled = total.signals_settled,
            errors = total.errors,
            "engine stopped"
        );
        Ok(total)
    }
}

fn run_shard(shard: usize, mut manager: LifecycleManager, rx: Receiver<IngestEvent>) -> ShardStats {
    let mut stats = ShardStats::default();
    for event in rx {
        match event {
            IngestEvent::Shutdown => break,
            IngestEvent::Context(ctx) => {
                let match_id = ctx.match_id.clone();
                if let Err(err) = manager.on_context(ctx) {
                    stats.errors += 1;
                    warn!(shard, match_id = %match_id, error = %format!("{err:#}"), "context update failed");
                }
            }
            IngestEvent::Tick(tick) => {
                let match_id = tick.match_id.clone();
                match manager.on_tick(tick) {
                    Ok(report) => {
                        stats.ticks += 1;
                        if report.duplicate {
                            stats.duplicates += 1;
                        }
                        stats.windows_opened += report.windows_opened as u64;
                        stats.windows_settled += (report.windows_won + report.windows_lost) as u64;
                        stats.signals_opened += report.signals_opened as u64;
                        stats.signals_settled += report.signals_settled as u64;
                        if report.concluded {
                            stats.matches_concluded += 1;
                        }
                    }
                    Err(err) => {
                        stats.errors += 1;
                        warn!(shard, match_id = %match_id, error = %format!("{err:#}"), "tick failed");
                    }
                }
            }
            IngestEvent::Conclude { match_id, minute } => {
                match manager.conclude_match(&match_id, minute) {
                    Ok(report) => {
                        stats.windows_settled += (report.windows_won + report.windows_lost) as u64;
                        stats.signals_settled += report.signals_settled as u64;
                        if report.concluded {
                            stats.matches_concluded += 1;
                        }
                    }
                    Err(err) => {
                        stats.errors += 1;
                        warn!(shard, match_id = %match_id, error = %format!("{err:#}"), "conclude failed");
                    }
                }
            }
        }
    }
    stats
}
