// SPDX-License-Identifier: GPL-2.0
//
// Tuning profiles and daemon configuration.
//
// Profiles are keyed by display mode name so the platform can switch the
// controller's coefficients when the refresh rate changes. The currently
// selected profile is published through an ArcSwap so controller paths read
// it without taking a lock.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use log::info;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Numeric tuning profile for the per-session feedback controller.
///
/// Gains are split by error sign: `*_o` applies when the workload overruns
/// the target, `*_u` when it finishes early. Sampling windows are trailing
/// sample counts; zero means the full reported batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdpfProfile {
    pub pid_on: bool,
    pub pid_po: f64,
    pub pid_pu: f64,
    pub pid_i: f64,
    /// Bound on the integral term's contribution, in output (uclamp) units.
    pub pid_i_high: f64,
    pub pid_i_low: f64,
    pub pid_do: f64,
    pub pid_du: f64,
    pub sampling_window_p: u64,
    pub sampling_window_i: u64,
    pub sampling_window_d: u64,
    pub uclamp_min_on: bool,
    pub uclamp_min_init: u32,
    pub uclamp_min_high: u32,
    pub uclamp_min_low: u32,
    /// A session is stale after `target * stale_time_factor` without a report.
    pub stale_time_factor: f64,
    pub early_boost_on: bool,
    pub early_boost_time_factor: f64,
    /// Declared target durations are scaled by this before use.
    pub target_time_factor: f64,
}

impl Default for AdpfProfile {
    fn default() -> Self {
        Self {
            pid_on: true,
            pid_po: 5.0,
            pid_pu: 3.0,
            pid_i: 0.001,
            pid_i_high: 512.0,
            pid_i_low: -120.0,
            pid_do: 500.0,
            pid_du: 0.0,
            sampling_window_p: 1,
            sampling_window_i: 0,
            sampling_window_d: 1,
            uclamp_min_on: true,
            uclamp_min_init: 200,
            uclamp_min_high: 480,
            uclamp_min_low: 2,
            stale_time_factor: 20.0,
            early_boost_on: false,
            early_boost_time_factor: 0.8,
            target_time_factor: 1.0,
        }
    }
}

impl AdpfProfile {
    /// Anti-windup bound on the accumulated integral error, derived from the
    /// output-unit bound and the integral gain. A zero gain leaves the
    /// integral unbounded (its contribution is zero anyway).
    pub fn integral_high(&self) -> i64 {
        if self.pid_i == 0.0 {
            i64::MAX
        } else {
            (self.pid_i_high / self.pid_i) as i64
        }
    }

    pub fn integral_low(&self) -> i64 {
        if self.pid_i == 0.0 {
            i64::MIN
        } else {
            (self.pid_i_low / self.pid_i) as i64
        }
    }
}

/// Interaction boost tuning, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionConfig {
    /// Whether display-idle detection gates the boost release at all.
    pub idle_support: bool,
    /// First-phase bounded wait before reading the idle state.
    pub wait_ms: u32,
    pub min_duration_ms: u32,
    pub max_duration_ms: u32,
    /// Added to every requested duration before clamping.
    pub duration_offset_ms: u32,
    /// Candidate sysfs nodes exposing the display idle state.
    pub idle_state_paths: Vec<String>,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            idle_support: true,
            wait_ms: 100,
            min_duration_ms: 1400,
            max_duration_ms: 5650,
            duration_offset_ms: 650,
            idle_state_paths: vec![
                "/sys/class/drm/card0/device/idle_state".into(),
                "/sys/class/graphics/fb0/idle_state".into(),
            ],
        }
    }
}

/// On-disk daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Profile selected at startup; display mode changes re-select.
    pub default_profile: String,
    pub profiles: FxHashMap<String, AdpfProfile>,
    pub interaction: InteractionConfig,
    /// Named hint engaged while a deadline-aware app session is active, to
    /// suppress the blanket top-app boost.
    pub disable_boost_hint: String,
    /// Hint names the platform sink accepts; everything else is rejected.
    pub supported_hints: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: "DEFAULT".into(),
            profiles: FxHashMap::default(),
            interaction: InteractionConfig::default(),
            disable_boost_hint: "ADPF_DISABLE_TA_BOOST".into(),
            supported_hints: vec!["INTERACTION".into(), "ADPF_DISABLE_TA_BOOST".into()],
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }
}

/// Published tuning-profile snapshot.
///
/// Readers grab the current profile once per operation and work off that
/// snapshot; a concurrent profile switch affects the next operation.
pub struct ProfileStore {
    current: ArcSwap<AdpfProfile>,
    profiles: FxHashMap<String, Arc<AdpfProfile>>,
}

impl ProfileStore {
    pub fn from_config(config: &Config) -> Self {
        let profiles: FxHashMap<String, Arc<AdpfProfile>> = config
            .profiles
            .iter()
            .map(|(name, p)| (name.clone(), Arc::new(p.clone())))
            .collect();
        // Missing default profile degrades to the built-in numbers with the
        // controller and the uclamp writes disabled.
        let current = match profiles.get(&config.default_profile) {
            Some(p) => Arc::clone(p),
            None => Arc::new(AdpfProfile {
                pid_on: false,
                uclamp_min_on: false,
                ..Default::default()
            }),
        };
        info!(
            "Loaded {} tuning profile(s), starting with '{}'",
            profiles.len(),
            config.default_profile
        );
        Self {
            current: ArcSwap::from(current),
            profiles,
        }
    }

    /// Store holding exactly one fixed profile.
    pub fn with_profile(profile: AdpfProfile) -> Self {
        Self {
            current: ArcSwap::from_pointee(profile),
            profiles: FxHashMap::default(),
        }
    }

    pub fn current(&self) -> Arc<AdpfProfile> {
        self.current.load_full()
    }

    /// Select the profile registered under `name`. Returns false (and keeps
    /// the current profile) if no such profile exists.
    pub fn select(&self, name: &str) -> bool {
        match self.profiles.get(name) {
            Some(p) => {
                self.current.store(Arc::clone(p));
                info!("Switched to tuning profile '{}'", name);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.json");

        let mut config = Config::default();
        config.profiles.insert(
            "REFRESH_120FPS".into(),
            AdpfProfile {
                stale_time_factor: 10.0,
                ..Default::default()
            },
        );
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.default_profile, "DEFAULT");
        assert_eq!(
            loaded.profiles["REFRESH_120FPS"].stale_time_factor,
            10.0
        );
        assert_eq!(loaded.disable_boost_hint, "ADPF_DISABLE_TA_BOOST");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"default_profile": "X"}"#).unwrap();
        assert_eq!(config.interaction.min_duration_ms, 1400);
        assert_eq!(config.interaction.max_duration_ms, 5650);
        assert_eq!(config.interaction.duration_offset_ms, 650);
    }

    #[test]
    fn test_missing_default_profile_disables_controller() {
        let store = ProfileStore::from_config(&Config::default());
        let profile = store.current();
        assert!(!profile.pid_on);
        assert!(!profile.uclamp_min_on);
    }

    #[test]
    fn test_select_switches_current() {
        let mut config = Config::default();
        config.profiles.insert("DEFAULT".into(), AdpfProfile::default());
        config.profiles.insert(
            "REFRESH_90FPS".into(),
            AdpfProfile {
                uclamp_min_high: 640,
                ..Default::default()
            },
        );
        let store = ProfileStore::from_config(&config);
        assert!(store.current().pid_on);

        assert!(store.select("REFRESH_90FPS"));
        assert_eq!(store.current().uclamp_min_high, 640);
        assert!(!store.select("REFRESH_144FPS"));
        assert_eq!(store.current().uclamp_min_high, 640);
    }

    #[test]
    fn test_integral_bounds() {
        let profile = AdpfProfile::default();
        assert_eq!(profile.integral_high(), 512_000);
        assert_eq!(profile.integral_low(), -120_000);

        let unbounded = AdpfProfile {
            pid_i: 0.0,
            ..Default::default()
        };
        assert_eq!(unbounded.integral_high(), i64::MAX);
        assert_eq!(unbounded.integral_low(), i64::MIN);
    }
}
