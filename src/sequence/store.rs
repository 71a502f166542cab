//! Learned outlet-position store.
//!
//! Every successfully held setpoint teaches the platform where the outlet
//! valve ended up. Positions are keyed by full scale, then by the setpoint
//! rounded to three decimals, each holding the ten most recent
//! observations:
//!
//! ```text
//! { "100": { "50.000": [27.8, 28.1, …], "10.000": [41.2, …] } }
//! ```
//!
//! Predictions average each setpoint's list and interpolate linearly
//! between the two nearest known setpoints. The file is written atomically
//! (temp file + rename) at end of run and at clean shutdown.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Observations retained per setpoint.
pub const POSITIONS_PER_SETPOINT: usize = 10;

type Profile = BTreeMap<String, heapless::Vec<f64, POSITIONS_PER_SETPOINT>>;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct StoreData {
    profiles: BTreeMap<String, Profile>,
}

/// Learned outlet positions for one full-scale profile, with persistence.
pub struct LearnedStore {
    path: PathBuf,
    data: StoreData,
    fs_key: String,
}

/// Format a full scale the way profile keys are written.
fn fs_key(full_scale_torr: f64) -> String {
    format_value(full_scale_torr)
}

/// Format a setpoint key with three-decimal rounding.
fn setpoint_key(setpoint_torr: f64) -> String {
    format!("{setpoint_torr:.3}")
}

/// Trim a float to its shortest faithful decimal form ("100", not "100.0").
fn format_value(value: f64) -> String {
    if (value - value.round()).abs() < f64::EPSILON {
        format!("{}", value.round() as i64)
    } else {
        format!("{value}")
    }
}

impl LearnedStore {
    /// Load the store from `path`, activating the profile for
    /// `full_scale_torr`. A missing or unreadable file starts empty.
    pub fn load(path: &Path, full_scale_torr: f64) -> Self {
        let data = match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<StoreData>(&text) {
                Ok(data) => data,
                Err(e) => {
                    warn!("learned-position file malformed ({e}); starting fresh");
                    StoreData::default()
                }
            },
            Err(_) => {
                info!("no learned-position file at {}; starting fresh", path.display());
                StoreData::default()
            }
        };
        let store = Self {
            path: path.to_path_buf(),
            data,
            fs_key: fs_key(full_scale_torr),
        };
        info!(
            "activated learning profile for {} Torr full scale ({} setpoints)",
            store.fs_key,
            store.len()
        );
        store
    }

    /// Number of setpoints known to the active profile.
    pub fn len(&self) -> usize {
        self.data
            .profiles
            .get(&self.fs_key)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record an observed outlet position for a held setpoint, keeping only
    /// the most recent observations.
    pub fn record(&mut self, setpoint_torr: f64, outlet_position: f64) {
        let profile = self.data.profiles.entry(self.fs_key.clone()).or_default();
        let positions = profile.entry(setpoint_key(setpoint_torr)).or_default();
        if positions.is_full() {
            positions.remove(0);
        }
        // Cannot fail after the eviction above.
        let _ = positions.push(outlet_position);
        info!(
            "learned outlet {:.2}% for {:.3} Torr ({} observation(s))",
            outlet_position,
            setpoint_torr,
            positions.len()
        );
    }

    /// Recorded observations for a setpoint (most recent last).
    pub fn positions(&self, setpoint_torr: f64) -> &[f64] {
        self.data
            .profiles
            .get(&self.fs_key)
            .and_then(|profile| profile.get(&setpoint_key(setpoint_torr)))
            .map_or(&[], |positions| positions.as_slice())
    }

    /// Predict the outlet position for a setpoint from the active profile:
    /// per-setpoint averages with linear interpolation between the two
    /// nearest known setpoints, extrapolating from the edge pair outside
    /// the known range.
    pub fn predict(&self, setpoint_torr: f64) -> Option<f64> {
        let profile = self.data.profiles.get(&self.fs_key)?;

        let mut averages: Vec<(f64, f64)> = profile
            .iter()
            .filter(|(_, positions)| !positions.is_empty())
            .filter_map(|(key, positions)| {
                let setpoint: f64 = key.parse().ok()?;
                let mean = positions.iter().sum::<f64>() / positions.len() as f64;
                Some((setpoint, mean))
            })
            .collect();
        if averages.is_empty() {
            return None;
        }
        averages.sort_by(|a, b| a.0.total_cmp(&b.0));

        let target = setpoint_torr;
        if let Some(&(_, mean)) = averages.iter().find(|(sp, _)| *sp == target) {
            return Some(mean);
        }
        if averages.len() < 2 {
            // Single known setpoint: nearest is all we have.
            return averages
                .iter()
                .min_by(|a, b| (a.0 - target).abs().total_cmp(&(b.0 - target).abs()))
                .map(|&(_, mean)| mean);
        }

        let (low, high) = if target < averages[0].0 {
            (averages[0], averages[1])
        } else if target > averages[averages.len() - 1].0 {
            (averages[averages.len() - 2], averages[averages.len() - 1])
        } else {
            let above = averages.iter().copied().find(|(sp, _)| *sp > target)?;
            let below = averages
                .iter()
                .copied()
                .rev()
                .find(|(sp, _)| *sp < target)?;
            (below, above)
        };

        if high.0 == low.0 {
            return Some(low.1);
        }
        let fraction = (target - low.0) / (high.0 - low.0);
        Some(low.1 + fraction * (high.1 - low.1))
    }

    /// Persist the store atomically.
    pub fn save(&self) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(&self.data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        info!(
            "saved {} learned setpoint(s) for {} Torr full scale",
            self.len(),
            self.fs_key
        );
        Ok(())
    }
}
