//! Typed, JSON-persisted configuration (spec §6). Replaces the teacher's
//! INI-backed `Config`/`KeyBinding` shortcut store (`config.rs` in the
//! reference pack) with the schema this core actually consumes: cache
//! radii and capacities, worker counts, view mode and resampling choices.
//! Legacy key migration follows spec §6 verbatim.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::entry::BindingDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RenderingBackend {
    Cpu,
    CpuMt,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingMode {
    Nearest,
    Bilinear,
    Lanczos3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub rendering_backend: RenderingBackend,
    pub is_spread_view: bool,
    pub binding_direction: SerdeBindingDirection,
    pub spread_view_first_page_single: bool,
    pub decode_workers: u32,
    pub l2_capacity_mb: u32,
    pub cpu_prefetch_radius: u32,
    pub gpu_prefetch_radius: u32,
    pub resampling_mode_cpu: ResamplingMode,
    pub resampling_mode_gpu: ResamplingMode,
    /// Supplemented from `cache.py`'s `adjust_cache_size`: recompute L2
    /// capacity from available system memory rather than using a fixed cap.
    pub dynamic_cache_resizing: bool,
    pub min_cache_size_mb: u32,
    pub max_cache_size_mb: u32,
}

/// `BindingDirection` mirrored here with `Serialize`/`Deserialize` since the
/// canonical type in `entry.rs` is shared with non-serialized call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SerdeBindingDirection {
    Left,
    Right,
}

impl From<SerdeBindingDirection> for BindingDirection {
    fn from(d: SerdeBindingDirection) -> Self {
        match d {
            SerdeBindingDirection::Left => BindingDirection::Left,
            SerdeBindingDirection::Right => BindingDirection::Right,
        }
    }
}

impl From<BindingDirection> for SerdeBindingDirection {
    fn from(d: BindingDirection) -> Self {
        match d {
            BindingDirection::Left => SerdeBindingDirection::Left,
            BindingDirection::Right => SerdeBindingDirection::Right,
        }
    }
}

fn default_decode_workers() -> u32 {
    std::thread::available_parallelism().map(|n| (n.get() as u32 / 2).max(1)).unwrap_or(1)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rendering_backend: RenderingBackend::CpuMt,
            is_spread_view: true,
            binding_direction: SerdeBindingDirection::Left,
            spread_view_first_page_single: true,
            decode_workers: default_decode_workers(),
            l2_capacity_mb: 4096,
            cpu_prefetch_radius: 10,
            gpu_prefetch_radius: 9,
            resampling_mode_cpu: ResamplingMode::Lanczos3,
            resampling_mode_gpu: ResamplingMode::Bilinear,
            dynamic_cache_resizing: true,
            min_cache_size_mb: 64,
            max_cache_size_mb: 4096,
        }
    }
}

impl Config {
    pub fn l2_capacity_bytes(&self) -> u64 {
        u64::from(self.l2_capacity_mb) * 1024 * 1024
    }

    pub fn l1_capacity_items(&self) -> u32 {
        2 * self.gpu_prefetch_radius + 2
    }

    /// Clamp the two prefetch radii so `gpu_prefetch_radius <= cpu_prefetch_radius`.
    pub fn clamp_radii(&mut self) {
        if self.gpu_prefetch_radius > self.cpu_prefetch_radius {
            self.gpu_prefetch_radius = self.cpu_prefetch_radius;
        }
        if self.decode_workers == 0 {
            self.decode_workers = 1;
        }
        if self.min_cache_size_mb < 1 {
            self.min_cache_size_mb = 1;
        }
        if self.max_cache_size_mb < self.min_cache_size_mb {
            self.max_cache_size_mb = self.min_cache_size_mb;
        }
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "rust-image-viewer", "rust-image-viewer")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Load configuration from disk, applying legacy key migrations before
    /// typed deserialization. Falls back to defaults (logged, not a hard
    /// error) on any read/parse failure, per spec §7's handling of
    /// configuration errors at startup.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::config_path() else {
            warn!("no config directory available on this platform; using defaults");
            return Self::default();
        };
        match Self::load_from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "failed to load config, falling back to defaults");
                Self::default()
            }
        }
    }

    fn load_from_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let mut value: Value = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
        migrate_legacy_keys(&mut value);
        let mut cfg: Config = serde_json::from_value(value).map_err(|e| e.to_string())?;
        cfg.clamp_radii();
        info!(?path, "configuration loaded");
        Ok(cfg)
    }

    pub fn save(&self) -> Result<(), String> {
        let Some(path) = Self::config_path() else {
            return Err("no config directory available on this platform".into());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        std::fs::write(&path, json).map_err(|e| e.to_string())
    }
}

/// Apply the legacy key migrations from spec §6:
/// `max_prefetch_pages -> cpu_prefetch_radius`;
/// `gpu_texture_cache_size` / `gpu_cache_page_count` -> `gpu_prefetch_radius`;
/// `resampling_mode` split into `_cpu`/`_gpu` by prefix.
fn migrate_legacy_keys(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else { return };

    if !obj.contains_key("cpu_prefetch_radius") {
        if let Some(v) = obj.remove("max_prefetch_pages") {
            obj.insert("cpu_prefetch_radius".to_string(), v);
        }
    }

    if !obj.contains_key("gpu_prefetch_radius") {
        if let Some(v) = obj.remove("gpu_texture_cache_size").or_else(|| obj.remove("gpu_cache_page_count")) {
            obj.insert("gpu_prefetch_radius".to_string(), v);
        }
    }

    if let Some(v) = obj.remove("resampling_mode") {
        obj.entry("resampling_mode_cpu".to_string()).or_insert_with(|| v.clone());
        obj.entry("resampling_mode_gpu".to_string()).or_insert(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_radius_constraint() {
        let cfg = Config::default();
        assert!(cfg.gpu_prefetch_radius <= cfg.cpu_prefetch_radius);
        assert!(cfg.decode_workers >= 1);
    }

    #[test]
    fn clamp_radii_caps_gpu_at_cpu() {
        let mut cfg = Config::default();
        cfg.cpu_prefetch_radius = 5;
        cfg.gpu_prefetch_radius = 20;
        cfg.clamp_radii();
        assert_eq!(cfg.gpu_prefetch_radius, 5);
    }

    #[test]
    fn migrates_legacy_prefetch_keys() {
        let mut value = serde_json::json!({
            "max_prefetch_pages": 7,
            "gpu_cache_page_count": 4,
        });
        migrate_legacy_keys(&mut value);
        assert_eq!(value["cpu_prefetch_radius"], 7);
        assert_eq!(value["gpu_prefetch_radius"], 4);
        assert!(value.get("max_prefetch_pages").is_none());
    }

    #[test]
    fn migrates_legacy_resampling_key_by_splitting() {
        let mut value = serde_json::json!({ "resampling_mode": "nearest" });
        migrate_legacy_keys(&mut value);
        assert_eq!(value["resampling_mode_cpu"], "nearest");
        assert_eq!(value["resampling_mode_gpu"], "nearest");
    }

    #[test]
    fn l1_capacity_follows_gpu_radius_formula() {
        let mut cfg = Config::default();
        cfg.gpu_prefetch_radius = 9;
        assert_eq!(cfg.l1_capacity_items(), 20);
    }
}
