//! Model copies, one per accelerator device

use crate::backend::{Backends, ModelHandle};
use crate::context::RunContext;
use crate::error::SchedulerError;
use crate::state::{Stage, Substage};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use video_caption_common::{DeviceId, ProcessingError, RunSettings};

/// Message recorded when no requested device produced a model copy
pub const NO_DEVICE_AVAILABLE: &str = "no device available";

/// Owns every loaded model handle.
///
/// The pool is only reachable through the scheduler's run lock, so loads,
/// unloads and runs never overlap. Pipelines borrow handles through
/// [`ModelPool::handle_for`] and never release them.
pub struct ModelPool {
    handles: BTreeMap<DeviceId, ModelHandle>,
    model_id: Option<String>,
    backends: Backends,
}

impl ModelPool {
    #[must_use]
    pub fn new(backends: Backends) -> Self {
        Self {
            handles: BTreeMap::new(),
            model_id: None,
            backends,
        }
    }

    #[must_use]
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Model id of the loaded copies, if any
    #[must_use]
    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    #[must_use]
    pub fn handle_for(&self, device: &DeviceId) -> Option<ModelHandle> {
        self.handles.get(device).cloned()
    }

    #[must_use]
    pub fn loaded_devices(&self) -> Vec<DeviceId> {
        self.handles.keys().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether every device in `devices` has a handle
    #[must_use]
    pub fn covers(&self, devices: &[DeviceId]) -> bool {
        devices.iter().all(|d| self.handles.contains_key(d))
    }

    fn release_all(&mut self) {
        if !self.handles.is_empty() {
            info!("Releasing {} model handle(s)", self.handles.len());
        }
        self.handles.clear();
        self.model_id = None;
        self.backends.loader.clear_cache();
    }

    /// Load one model copy on the settings' primary device, replacing any
    /// existing copies.
    pub async fn load_single(
        &mut self,
        ctx: &RunContext,
        settings: &RunSettings,
    ) -> Result<(), SchedulerError> {
        let device = settings.primary_device();
        info!("Loading model {} on {}", settings.model_id, device);

        ctx.update(|s| {
            s.stage = Stage::LoadingModel;
            s.substage = Substage::Idle;
            s.substage_progress = 0.0;
            s.error_message = None;
            s.start_clock();
        });

        self.release_all();
        ctx.update(|s| s.substage_progress = 0.1);

        match self.load_on(settings, &device).await {
            Ok(handle) => {
                self.handles.insert(device.clone(), handle);
                self.model_id = Some(settings.model_id.clone());
                let vram = self.backends.memory_used_gb();
                let devices = self.loaded_devices();
                ctx.update(|s| {
                    s.model_loaded = true;
                    s.model_id = Some(settings.model_id.clone());
                    s.devices_loaded = devices;
                    s.substage_progress = 1.0;
                    s.vram_used_gb = vram;
                    s.stage = Stage::Idle;
                });
                info!("Model loaded on {}, VRAM: {:.2} GB", device, vram);
                Ok(())
            }
            Err(e) => {
                error!("Model load failed on {}: {}", device, e);
                let message = e.to_string();
                let vram = self.backends.memory_used_gb();
                ctx.update(|s| {
                    s.stage = Stage::Error;
                    s.error_message = Some(message.clone());
                    s.model_loaded = false;
                    s.model_id = None;
                    s.devices_loaded.clear();
                    s.vram_used_gb = vram;
                    s.stop_clock();
                });
                Err(SchedulerError::ModelLoad(message))
            }
        }
    }

    /// Load a model copy on each device, one device at a time to bound peak
    /// memory during warm-up. Failing devices are skipped. Returns the number
    /// of devices that loaded.
    pub async fn load_parallel(
        &mut self,
        ctx: &RunContext,
        settings: &RunSettings,
        devices: &[DeviceId],
        cancel: &CancellationToken,
    ) -> Result<usize, SchedulerError> {
        info!(
            "Loading model {} on {} device(s): {:?}",
            settings.model_id,
            devices.len(),
            devices
        );

        ctx.update(|s| {
            s.stage = Stage::LoadingModel;
            s.substage = Substage::Idle;
            s.substage_progress = 0.0;
            s.error_message = None;
            s.start_clock();
        });

        self.release_all();

        let step = if devices.is_empty() {
            1.0
        } else {
            1.0 / devices.len() as f64
        };

        for device in devices {
            if cancel.is_cancelled() {
                info!("Model loading interrupted by stop request");
                break;
            }

            match self.load_on(settings, device).await {
                Ok(handle) => {
                    self.handles.insert(device.clone(), handle);
                    info!("Model loaded on {}", device);
                }
                Err(e) => warn!("Failed to load model on {}: {}", device, e),
            }

            let vram = self.backends.memory_used_gb();
            ctx.update(|s| {
                s.substage_progress = (s.substage_progress + step).min(1.0);
                s.vram_used_gb = vram;
            });
        }

        let vram = self.backends.memory_used_gb();
        if self.handles.is_empty() && cancel.is_cancelled() {
            ctx.update(|s| {
                s.stage = Stage::Idle;
                s.model_loaded = false;
                s.model_id = None;
                s.devices_loaded.clear();
                s.vram_used_gb = vram;
            });
            return Err(SchedulerError::Stopped);
        }
        if self.handles.is_empty() {
            error!("Model load failed on all {} device(s)", devices.len());
            ctx.update(|s| {
                s.stage = Stage::Error;
                s.error_message = Some(NO_DEVICE_AVAILABLE.to_string());
                s.model_loaded = false;
                s.model_id = None;
                s.devices_loaded.clear();
                s.vram_used_gb = vram;
                s.stop_clock();
            });
            return Err(SchedulerError::ModelLoad(NO_DEVICE_AVAILABLE.to_string()));
        }

        self.model_id = Some(settings.model_id.clone());
        let loaded = self.loaded_devices();
        let count = loaded.len();
        ctx.update(|s| {
            s.model_loaded = true;
            s.model_id = Some(settings.model_id.clone());
            s.devices_loaded = loaded;
            s.substage_progress = 1.0;
            s.vram_used_gb = vram;
            s.stage = Stage::Idle;
        });
        info!(
            "Models loaded on {}/{} device(s), VRAM: {:.2} GB",
            count,
            devices.len(),
            vram
        );
        Ok(count)
    }

    /// Drop every handle and recompute memory usage
    pub fn unload(&mut self, ctx: &RunContext) {
        self.release_all();
        let vram = self.backends.memory_used_gb();
        ctx.update(|s| {
            s.model_loaded = false;
            s.model_id = None;
            s.devices_loaded.clear();
            s.vram_used_gb = vram;
        });
        info!("Models unloaded, VRAM: {:.2} GB", vram);
    }

    async fn load_on(
        &self,
        settings: &RunSettings,
        device: &DeviceId,
    ) -> Result<ModelHandle, ProcessingError> {
        let loader = self.backends.loader.clone();
        let settings = settings.clone();
        let target = device.clone();
        tokio::task::spawn_blocking(move || loader.load(&settings, &target))
            .await
            .map_err(|e| ProcessingError::ModelLoad {
                device: device.to_string(),
                reason: format!("loader task failed: {e}"),
            })?
    }
}
