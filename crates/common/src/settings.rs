//! Run configuration captured when a captioning run starts

use crate::{DeviceId, ProcessingError, Result, MAX_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;

const DEFAULT_MODEL_ID: &str = "Qwen/Qwen3-VL-8B-Instruct";

const DEFAULT_PROMPT: &str = "Describe this video in detail. Include:
- The main subject and their actions
- The setting and environment
- Any notable objects or elements
- The overall mood or atmosphere
- Any text visible in the video";

const MAX_FRAMES_RANGE: RangeInclusive<u32> = 1..=128;
const FRAME_SIZE_RANGE: RangeInclusive<u32> = 224..=672;
const MAX_TOKENS_RANGE: RangeInclusive<u32> = 64..=2048;
const TEMPERATURE_RANGE: RangeInclusive<f32> = 0.0..=2.0;
const BATCH_SIZE_RANGE: RangeInclusive<usize> = 1..=MAX_BATCH_SIZE;

/// Accelerator family models are loaded onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cuda,
    Cpu,
}

/// Weight precision requested from the model loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float16,
    Bfloat16,
    Float32,
}

/// Settings for one run. The scheduler clones these at `start()`, so edits made
/// afterwards never reach an in-flight run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub model_id: String,
    pub device: DeviceKind,
    pub dtype: Dtype,
    /// Maximum frames sampled per item
    pub max_frames: u32,
    /// Longest frame edge in pixels
    pub frame_size: u32,
    /// Generation limit in tokens
    pub max_tokens: u32,
    pub temperature: f32,
    pub use_sage_attention: bool,
    pub use_torch_compile: bool,
    /// Append a metadata footer to each caption file
    pub include_metadata: bool,
    /// Requested concurrency degree (one worker per device)
    pub batch_size: usize,
    pub prompt: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            device: DeviceKind::Cuda,
            dtype: Dtype::Bfloat16,
            max_frames: 16,
            frame_size: 336,
            max_tokens: 512,
            temperature: 0.3,
            use_sage_attention: false,
            use_torch_compile: true,
            include_metadata: false,
            batch_size: 1,
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

impl RunSettings {
    /// Parse settings from YAML; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a `.yaml`/`.yml` or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&contents),
            _ => Self::from_json_str(&contents),
        }
    }

    /// Check every bounded field against its allowed range
    pub fn validate(&self) -> Result<()> {
        check_range("max_frames", self.max_frames, &MAX_FRAMES_RANGE)?;
        check_range("frame_size", self.frame_size, &FRAME_SIZE_RANGE)?;
        check_range("max_tokens", self.max_tokens, &MAX_TOKENS_RANGE)?;
        check_range("batch_size", self.batch_size, &BATCH_SIZE_RANGE)?;
        if !TEMPERATURE_RANGE.contains(&self.temperature) {
            return Err(ProcessingError::InvalidSettings(format!(
                "temperature must be within {:?}, got {}",
                TEMPERATURE_RANGE, self.temperature
            )));
        }
        if self.prompt.trim().is_empty() {
            return Err(ProcessingError::InvalidSettings(
                "prompt must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Device used when a single model copy is loaded
    #[must_use]
    pub fn primary_device(&self) -> DeviceId {
        match self.device {
            DeviceKind::Cuda => DeviceId::cuda(0),
            DeviceKind::Cpu => DeviceId::cpu(),
        }
    }

    /// Devices for `degree` workers. CPU has a single slot.
    #[must_use]
    pub fn device_set(&self, degree: usize) -> Vec<DeviceId> {
        match self.device {
            DeviceKind::Cuda => (0..degree).map(DeviceId::cuda).collect(),
            DeviceKind::Cpu => vec![DeviceId::cpu()],
        }
    }
}

fn check_range<T>(field: &str, value: T, range: &RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + std::fmt::Debug,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ProcessingError::InvalidSettings(format!(
            "{field} must be within {range:?}, got {value:?}"
        )))
    }
}

/// Partial settings update; `None` leaves the current value untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub model_id: Option<String>,
    pub device: Option<DeviceKind>,
    pub dtype: Option<Dtype>,
    pub max_frames: Option<u32>,
    pub frame_size: Option<u32>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub use_sage_attention: Option<bool>,
    pub use_torch_compile: Option<bool>,
    pub include_metadata: Option<bool>,
    pub batch_size: Option<usize>,
    pub prompt: Option<String>,
}

impl SettingsUpdate {
    /// Apply onto `base`, returning the validated result. `base` is not modified.
    pub fn apply(self, base: &RunSettings) -> Result<RunSettings> {
        let mut next = base.clone();
        macro_rules! merge {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { next.$field = v; })*
            };
        }
        merge!(
            model_id,
            device,
            dtype,
            max_frames,
            frame_size,
            max_tokens,
            temperature,
            use_sage_attention,
            use_torch_compile,
            include_metadata,
            batch_size,
            prompt
        );
        next.validate()?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = RunSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.batch_size, 1);
        assert_eq!(settings.max_frames, 16);
        assert!(!settings.include_metadata);
    }

    #[test]
    fn test_yaml_partial_uses_defaults() {
        let settings = RunSettings::from_yaml_str("batch_size: 4\ninclude_metadata: true\n").unwrap();
        assert_eq!(settings.batch_size, 4);
        assert!(settings.include_metadata);
        assert_eq!(settings.frame_size, 336);
        assert_eq!(settings.device, DeviceKind::Cuda);
    }

    #[test]
    fn test_json_out_of_range_rejected() {
        let err = RunSettings::from_json_str(r#"{"batch_size": 9}"#).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidSettings(_)));

        let err = RunSettings::from_json_str(r#"{"temperature": 2.5}"#).unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yml");
        std::fs::write(&path, "device: cpu\nmax_tokens: 128\n").unwrap();

        let settings = RunSettings::load(&path).unwrap();
        assert_eq!(settings.device, DeviceKind::Cpu);
        assert_eq!(settings.max_tokens, 128);
    }

    #[test]
    fn test_device_set() {
        let mut settings = RunSettings::default();
        assert_eq!(
            settings.device_set(3),
            vec![DeviceId::cuda(0), DeviceId::cuda(1), DeviceId::cuda(2)]
        );
        assert_eq!(settings.primary_device(), DeviceId::cuda(0));

        settings.device = DeviceKind::Cpu;
        assert_eq!(settings.device_set(3), vec![DeviceId::cpu()]);
        assert_eq!(settings.primary_device(), DeviceId::cpu());
    }

    #[test]
    fn test_settings_update() {
        let base = RunSettings::default();
        let update = SettingsUpdate {
            batch_size: Some(2),
            prompt: Some("Summarize the clip.".to_string()),
            ..Default::default()
        };
        let next = update.apply(&base).unwrap();
        assert_eq!(next.batch_size, 2);
        assert_eq!(next.prompt, "Summarize the clip.");
        assert_eq!(next.max_tokens, base.max_tokens);

        let invalid = SettingsUpdate {
            frame_size: Some(100),
            ..Default::default()
        };
        assert!(invalid.apply(&base).is_err());
    }
}
