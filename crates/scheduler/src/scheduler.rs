//! Run scheduler: admits one run at a time and dispatches its items FIFO
//! to idle workers, one worker per loaded device.

use crate::backend::{Backends, ModelHandle};
use crate::context::RunContext;
use crate::emitter::ProgressEmitter;
use crate::error::SchedulerError;
use crate::model_pool::ModelPool;
use crate::pipeline::{ItemResult, PipelineExecutor, PipelineJob, PipelineOutcome};
use crate::resources::{ResourceMonitor, ResourceSnapshot, SystemInfo};
use crate::state::{ProgressSnapshot, Stage, Substage, WorkerState};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch, OwnedMutexGuard};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use video_caption_common::{DeviceId, MediaItem, ProcessingError, RunSettings};

/// Acknowledgement returned when a background run is admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAck {
    pub accepted: bool,
    pub queued: usize,
}

/// Loaded-model summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub loaded: bool,
    pub model_id: Option<String>,
    pub devices: Vec<DeviceId>,
    pub vram_used_gb: f64,
}

type Joined = Result<(usize, PipelineOutcome), JoinError>;

/// Entry point of the engine.
///
/// The model pool sits behind the run lock: a run, a model load and an
/// unload each hold it for their whole duration, so at most one of them is
/// active. Cloning is cheap and every clone drives the same engine.
#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<RunContext>,
    pool: Arc<tokio::sync::Mutex<ModelPool>>,
    backends: Backends,
    stop: Arc<Mutex<CancellationToken>>,
    /// True from admission until the run lock is released
    running: Arc<watch::Sender<bool>>,
    results: Arc<Mutex<Vec<ItemResult>>>,
    resources: Arc<ResourceMonitor>,
}

impl Scheduler {
    #[must_use]
    pub fn new(backends: Backends) -> Self {
        Self::with_emitter(backends, ProgressEmitter::default())
    }

    /// Use a custom emitter, e.g. with a larger observer buffer
    #[must_use]
    pub fn with_emitter(backends: Backends, emitter: ProgressEmitter) -> Self {
        Self {
            ctx: Arc::new(RunContext::new(emitter)),
            pool: Arc::new(tokio::sync::Mutex::new(ModelPool::new(backends.clone()))),
            resources: Arc::new(ResourceMonitor::new(backends.monitor.clone())),
            backends,
            stop: Arc::new(Mutex::new(CancellationToken::new())),
            running: Arc::new(watch::Sender::new(false)),
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Admit a run and process it in the background.
    ///
    /// Must be called from within a tokio runtime. Rejections leave the
    /// engine state untouched.
    pub fn start(
        &self,
        items: Vec<MediaItem>,
        settings: &RunSettings,
    ) -> Result<StartAck, SchedulerError> {
        let (pool, cancel) = self.admit(&items, settings)?;
        let queued = items.len();
        let settings = Arc::new(settings.clone());
        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.execute(pool, items, settings, cancel).await {
                warn!("Run ended without processing: {}", e);
            }
        });
        Ok(StartAck {
            accepted: true,
            queued,
        })
    }

    /// Admit a run and process it to completion, returning its results
    pub async fn process(
        &self,
        items: Vec<MediaItem>,
        settings: &RunSettings,
    ) -> Result<Vec<ItemResult>, SchedulerError> {
        let (pool, cancel) = self.admit(&items, settings)?;
        self.execute(pool, items, Arc::new(settings.clone()), cancel)
            .await
    }

    /// Request cooperative cancellation of the active run. No new item
    /// starts; items in flight stop at their next stage boundary and the run
    /// ends once they have. Items already finished keep their results.
    /// No effect when idle.
    pub fn stop(&self) {
        let token = self.lock_stop().clone();
        if !token.is_cancelled() {
            info!("Stop requested");
            token.cancel();
        }
    }

    /// Latest snapshot, with elapsed time recomputed while a run is active
    #[must_use]
    pub fn status(&self) -> ProgressSnapshot {
        self.ctx.status()
    }

    /// Observer receiving every published snapshot
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.ctx.subscribe()
    }

    /// Observer that only sees the most recent snapshot
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ProgressSnapshot> {
        self.ctx.watch()
    }

    /// Wait for the active run, if any, to end and release the run lock.
    /// Does not queue on the lock, so a `start()` issued right after this
    /// returns is admitted.
    pub async fn wait(&self) -> ProgressSnapshot {
        let mut running = self.running.subscribe();
        // The sender lives as long as `self`
        let _ = running.wait_for(|active| !active).await;
        self.status()
    }

    /// Results of the most recent run
    #[must_use]
    pub fn last_results(&self) -> Vec<ItemResult> {
        self.lock_results().clone()
    }

    /// Load a single model copy on the primary device, replacing any loaded copies
    pub async fn load_model(&self, settings: &RunSettings) -> Result<(), SchedulerError> {
        settings.validate().map_err(invalid_settings)?;
        let mut pool = self
            .pool
            .try_lock()
            .map_err(|_| SchedulerError::AlreadyRunning)?;
        pool.load_single(&self.ctx, settings).await
    }

    /// Release every model copy. A no-op when nothing is loaded.
    pub fn unload_model(&self) -> Result<(), SchedulerError> {
        let mut pool = self
            .pool
            .try_lock()
            .map_err(|_| SchedulerError::AlreadyRunning)?;
        pool.unload(&self.ctx);
        Ok(())
    }

    /// Return to a fresh idle state. Loaded models are kept and reported.
    pub fn reset(&self) -> Result<(), SchedulerError> {
        let pool = self
            .pool
            .try_lock()
            .map_err(|_| SchedulerError::AlreadyRunning)?;
        self.lock_results().clear();
        self.ctx.reset();

        let devices = pool.loaded_devices();
        let model_id = pool.model_id().map(str::to_string);
        let vram = pool.backends().memory_used_gb();
        self.ctx.update(|s| {
            s.model_loaded = !devices.is_empty();
            s.model_id = model_id;
            s.devices_loaded = devices;
            s.vram_used_gb = vram;
        });
        Ok(())
    }

    #[must_use]
    pub fn model_status(&self) -> ModelStatus {
        let status = self.ctx.status();
        ModelStatus {
            loaded: status.model_loaded,
            model_id: status.model_id,
            devices: status.devices_loaded,
            vram_used_gb: status.vram_used_gb,
        }
    }

    #[must_use]
    pub fn system_info(&self) -> SystemInfo {
        SystemInfo::collect(self.backends.monitor.as_ref())
    }

    /// Sample host and accelerator usage
    #[must_use]
    pub fn resources(&self) -> ResourceSnapshot {
        self.resources.snapshot()
    }

    fn lock_stop(&self) -> MutexGuard<'_, CancellationToken> {
        self.stop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_results(&self) -> MutexGuard<'_, Vec<ItemResult>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the run lock and validate the request. The stop token is only
    /// replaced once the run is admitted.
    fn admit(
        &self,
        items: &[MediaItem],
        settings: &RunSettings,
    ) -> Result<(OwnedMutexGuard<ModelPool>, CancellationToken), SchedulerError> {
        let pool = self.pool.clone().try_lock_owned().map_err(|_| {
            debug!("Rejected run request: already processing");
            SchedulerError::AlreadyRunning
        })?;
        if items.is_empty() {
            return Err(SchedulerError::NoItems);
        }
        settings.validate().map_err(invalid_settings)?;

        let cancel = CancellationToken::new();
        *self.lock_stop() = cancel.clone();
        self.running.send_replace(true);
        Ok((pool, cancel))
    }

    /// Run to a terminal stage, then release the run lock
    async fn execute(
        &self,
        mut pool: OwnedMutexGuard<ModelPool>,
        items: Vec<MediaItem>,
        settings: Arc<RunSettings>,
        cancel: CancellationToken,
    ) -> Result<Vec<ItemResult>, SchedulerError> {
        let outcome = self.run_items(&mut pool, items, settings, cancel).await;
        drop(pool);
        self.running.send_replace(false);
        outcome
    }

    async fn run_items(
        &self,
        pool: &mut ModelPool,
        items: Vec<MediaItem>,
        settings: Arc<RunSettings>,
        cancel: CancellationToken,
    ) -> Result<Vec<ItemResult>, SchedulerError> {
        let total = items.len();
        let requested = settings.batch_size.clamp(1, total);
        let wanted = settings.device_set(requested);
        info!(
            "Starting run: {} item(s), requested {} worker(s)",
            total, requested
        );

        self.lock_results().clear();
        self.ctx.update(|s| {
            s.total_videos = total;
            s.completed_videos = 0;
            s.video_index = 0;
            s.current_video = None;
            s.workers.clear();
            s.batch_size = requested;
            s.error_message = None;
            s.start_clock();
        });

        let reload = !pool.covers(&wanted) || pool.model_id() != Some(settings.model_id.as_str());
        if reload {
            let loaded = if wanted.len() == 1 {
                pool.load_single(&self.ctx, &settings).await
            } else {
                pool.load_parallel(&self.ctx, &settings, &wanted, &cancel)
                    .await
                    .map(|_| ())
            };
            match loaded {
                Ok(()) => {}
                Err(SchedulerError::Stopped) => return Ok(self.finish(Vec::new())),
                Err(e) => {
                    error!("Run aborted: {}", e);
                    return Err(e);
                }
            }
        }

        let (devices, handles): (Vec<DeviceId>, Vec<ModelHandle>) = wanted
            .iter()
            .filter_map(|d| pool.handle_for(d).map(|h| (d.clone(), h)))
            .unzip();
        let degree = devices.len();
        if degree < requested {
            warn!(
                "Running with {} of {} requested worker(s)",
                degree, requested
            );
        }

        self.ctx.update(|s| {
            s.stage = Stage::Processing;
            s.batch_size = degree;
            s.workers = devices
                .iter()
                .enumerate()
                .map(|(id, device)| WorkerState::new(id, device.clone()))
                .collect();
            s.substage = Substage::Idle;
            s.substage_progress = 0.0;
        });

        let executor = PipelineExecutor::new(self.ctx.clone(), pool.backends().clone());
        let mut queue: VecDeque<(usize, MediaItem)> = items.into_iter().enumerate().collect();
        let mut busy = vec![false; degree];
        let mut in_flight: JoinSet<(usize, PipelineOutcome)> = JoinSet::new();
        let mut results = Vec::with_capacity(total);

        loop {
            if cancel.is_cancelled() {
                info!(
                    "Run stopped with {} item(s) in flight and {} queued",
                    self.ctx.read(|s| s.in_flight()),
                    queue.len()
                );
                // In-flight items observe the token at their next stage
                // boundary; the run lock is held until every one has settled
                while let Some(joined) = in_flight.join_next().await {
                    self.settle(joined, &mut busy, &mut results);
                }
                break;
            }

            // Lowest idle worker takes the head of the queue
            for worker_id in 0..degree {
                if busy[worker_id] {
                    continue;
                }
                let Some((index, item)) = queue.pop_front() else {
                    break;
                };
                busy[worker_id] = true;
                self.ctx
                    .update(|s| s.assign_worker(worker_id, index, item.name()));
                debug!("Worker {} assigned {}", worker_id, item.name());

                let job = PipelineJob {
                    worker_id,
                    device: devices[worker_id].clone(),
                    item,
                    handle: Some(handles[worker_id].clone()),
                    settings: settings.clone(),
                    parallel: degree > 1,
                };
                in_flight.spawn(run_guarded(executor.clone(), job, cancel.clone()));
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                joined = in_flight.join_next() => {
                    if let Some(joined) = joined {
                        self.settle(joined, &mut busy, &mut results);
                    }
                    while let Some(joined) = in_flight.try_join_next() {
                        self.settle(joined, &mut busy, &mut results);
                    }
                }
            }
        }

        Ok(self.finish(results))
    }

    /// Record a finished pipeline and free its worker
    fn settle(&self, joined: Joined, busy: &mut [bool], results: &mut Vec<ItemResult>) {
        match joined {
            Ok((worker_id, outcome)) => {
                if let Some(slot) = busy.get_mut(worker_id) {
                    *slot = false;
                }
                match outcome {
                    PipelineOutcome::Finished(result) => {
                        self.ctx.update(|s| {
                            s.completed_videos += 1;
                            s.release_worker(worker_id);
                        });
                        results.push(result);
                    }
                    PipelineOutcome::Cancelled => {
                        self.ctx.update(|s| s.release_worker(worker_id));
                    }
                }
            }
            Err(e) => error!("Pipeline task failed: {}", e),
        }
    }

    /// Store results, then publish the terminal snapshot
    fn finish(&self, results: Vec<ItemResult>) -> Vec<ItemResult> {
        let succeeded = results.iter().filter(|r| r.success).count();
        *self.lock_results() = results.clone();
        self.ctx.update(|s| {
            s.stage = Stage::Complete;
            s.current_video = None;
            for worker in &mut s.workers {
                worker.release();
            }
            s.substage = Substage::Idle;
            s.substage_progress = 0.0;
            s.stop_clock();
        });
        info!(
            "Run complete: {}/{} item(s) succeeded",
            succeeded,
            results.len()
        );
        results
    }
}

/// Run one pipeline, turning a panic into a failed result for its item
async fn run_guarded(
    executor: PipelineExecutor,
    job: PipelineJob,
    cancel: CancellationToken,
) -> (usize, PipelineOutcome) {
    let worker_id = job.worker_id;
    let item = job.item.clone();
    let outcome = AssertUnwindSafe(executor.run(job, cancel))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!("Worker {} panicked processing {}", worker_id, item.name());
            PipelineOutcome::Finished(ItemResult::failed(
                &item,
                worker_id,
                "pipeline panicked".to_string(),
            ))
        });
    (worker_id, outcome)
}

fn invalid_settings(e: ProcessingError) -> SchedulerError {
    match e {
        ProcessingError::InvalidSettings(message) => SchedulerError::InvalidSettings(message),
        other => SchedulerError::InvalidSettings(other.to_string()),
    }
}
