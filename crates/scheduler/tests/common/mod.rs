//! Mock collaborators shared by the integration tests
//!
//! Items are named `clip_<n>.mp4`; the mock extractor stores `n` in the frame
//! batch metadata so the mock model knows which item it is captioning.

#![allow(dead_code)]

use image::RgbImage;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use video_caption_common::{
    DeviceId, FrameBatch, Generation, MediaItem, ProcessingError, Result, RunSettings, VideoMeta,
};
use video_caption_scheduler::{
    Backends, CaptionModel, DeviceInfo, DeviceMonitor, FrameExtractor, FrameLimits,
    GenerationRequest, ModelHandle, ModelLoader,
};

const GIB: u64 = 1 << 30;
const GATE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Blocks the generation of gated items until opened
#[derive(Default)]
pub struct Gate {
    entered: AtomicUsize,
    open: AtomicBool,
}

impl Gate {
    fn block(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + GATE_TIMEOUT;
        while !self.open.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn is_entered(&self) -> bool {
        self.entered_count() > 0
    }

    pub fn entered_count(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Poll until a gated item reaches generation
    pub async fn entered(&self) {
        self.entered_by(1).await;
    }

    /// Poll until `count` gated items are blocked in generation
    pub async fn entered_by(&self, count: usize) {
        eventually("gated items never reached generation", || {
            self.entered_count() >= count
        })
        .await;
    }
}

/// Poll `condition` until it holds, failing the test after a timeout
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + GATE_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "{what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// What the mocks observed
#[derive(Default)]
pub struct CallLog {
    pub loads: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    /// (item number, device) per generate call, in call order
    pub generated: Mutex<Vec<(usize, DeviceId)>>,
    /// Model copies currently alive, per device
    pub resident: Mutex<Vec<DeviceId>>,
    pub gate: Gate,
}

impl CallLog {
    pub fn generated_items(&self) -> Vec<usize> {
        self.generated.lock().unwrap().iter().map(|(i, _)| *i).collect()
    }

    pub fn generated_devices(&self) -> HashSet<DeviceId> {
        self.generated
            .lock()
            .unwrap()
            .iter()
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
struct Behaviour {
    broken_devices: HashSet<DeviceId>,
    failing_items: HashSet<usize>,
    gated_items: HashSet<usize>,
    delay: Duration,
}

/// Builder for a mock backend set
pub struct MockSetup {
    devices: usize,
    behaviour: Behaviour,
}

impl MockSetup {
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            behaviour: Behaviour::default(),
        }
    }

    pub fn broken(mut self, devices: &[usize]) -> Self {
        self.behaviour
            .broken_devices
            .extend(devices.iter().map(|i| DeviceId::cuda(*i)));
        self
    }

    pub fn failing_item(mut self, item: usize) -> Self {
        self.behaviour.failing_items.insert(item);
        self
    }

    pub fn gated_item(mut self, item: usize) -> Self {
        self.behaviour.gated_items.insert(item);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.behaviour.delay = delay;
        self
    }

    pub fn build(self) -> (Backends, Arc<CallLog>) {
        let log = Arc::new(CallLog::default());
        let behaviour = Arc::new(self.behaviour);
        let backends = Backends::new(
            Arc::new(MockLoader {
                log: log.clone(),
                behaviour,
            }),
            Arc::new(MockExtractor),
            Arc::new(MockMonitor {
                count: self.devices,
                log: log.clone(),
            }),
        );
        (backends, log)
    }
}

struct MockModel {
    device: DeviceId,
    log: Arc<CallLog>,
    behaviour: Arc<Behaviour>,
}

impl CaptionModel for MockModel {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    fn generate(&self, frames: &FrameBatch, _: &GenerationRequest) -> Result<Generation> {
        let item = frames.meta.frame_count.unwrap_or_default() as usize;
        let active = self.log.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_active.fetch_max(active, Ordering::SeqCst);
        self.log
            .generated
            .lock()
            .unwrap()
            .push((item, self.device.clone()));

        if self.behaviour.gated_items.contains(&item) {
            self.log.gate.block();
        }
        std::thread::sleep(self.behaviour.delay);
        self.log.active.fetch_sub(1, Ordering::SeqCst);

        if self.behaviour.failing_items.contains(&item) {
            return Err(ProcessingError::Generation(format!(
                "mock failure on item {item}"
            )));
        }
        Ok(Generation {
            caption: format!("Caption for clip {item} on {}", self.device),
            output_tokens: 10,
            tokens_per_sec: 25.0,
            num_frames: frames.len(),
        })
    }
}

impl Drop for MockModel {
    fn drop(&mut self) {
        let mut resident = self.log.resident.lock().unwrap();
        if let Some(pos) = resident.iter().position(|d| d == &self.device) {
            resident.remove(pos);
        }
    }
}

struct MockLoader {
    log: Arc<CallLog>,
    behaviour: Arc<Behaviour>,
}

impl ModelLoader for MockLoader {
    fn load(&self, _: &RunSettings, device: &DeviceId) -> Result<ModelHandle> {
        self.log.loads.fetch_add(1, Ordering::SeqCst);
        if self.behaviour.broken_devices.contains(device) {
            return Err(ProcessingError::ModelLoad {
                device: device.to_string(),
                reason: "CUDA out of memory".to_string(),
            });
        }
        self.log.resident.lock().unwrap().push(device.clone());
        Ok(Arc::new(MockModel {
            device: device.clone(),
            log: self.log.clone(),
            behaviour: self.behaviour.clone(),
        }))
    }
}

struct MockExtractor;

impl FrameExtractor for MockExtractor {
    fn extract(&self, path: &Path, limits: FrameLimits) -> Result<FrameBatch> {
        let item = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("clip_"))
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| ProcessingError::FrameExtraction(format!("unexpected item {path:?}")))?;
        Ok(FrameBatch {
            frames: vec![RgbImage::new(4, 4); limits.max_frames.min(4) as usize],
            meta: VideoMeta {
                frame_count: Some(item),
                ..Default::default()
            },
        })
    }
}

struct MockMonitor {
    count: usize,
    log: Arc<CallLog>,
}

impl DeviceMonitor for MockMonitor {
    fn devices(&self) -> Vec<DeviceInfo> {
        let resident = self.log.resident.lock().unwrap();
        (0..self.count)
            .map(|i| {
                let device = DeviceId::cuda(i);
                let copies = resident.iter().filter(|d| **d == device).count() as u64;
                DeviceInfo {
                    index: i,
                    name: format!("Mock GPU {i}"),
                    device,
                    memory_total_bytes: 24 * GIB,
                    memory_used_bytes: copies * 2 * GIB,
                    utilization_percent: Some(0),
                }
            })
            .collect()
    }
}

/// Create `count` placeholder media files and return them as items
pub fn media_items(dir: &Path, count: usize) -> Vec<MediaItem> {
    (0..count).map(|i| media_item(dir, i)).collect()
}

/// Create the placeholder file for item `n`
pub fn media_item(dir: &Path, n: usize) -> MediaItem {
    let path = dir.join(format!("clip_{n}.mp4"));
    std::fs::write(&path, b"").unwrap();
    MediaItem::new(path)
}

pub fn settings(batch_size: usize) -> RunSettings {
    RunSettings {
        batch_size,
        max_frames: 4,
        ..Default::default()
    }
}
