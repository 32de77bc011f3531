//! Sim configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub sim: SimSettings,
    pub backend: BackendSettings,
    pub workload: WorkloadSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSettings {
    /// Default log filter when RUST_LOG is unset.
    pub log_level: String,
    /// Virtual ports on the controller.
    pub ports: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Global pending-request pool size.
    pub pending_requests: usize,
    /// Watchdog deadline for control and OUT transfers, in seconds.
    pub transfer_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSettings {
    /// Round trips to run.
    pub transfers: usize,
    /// Bytes per transfer.
    pub transfer_len: usize,
    /// Endpoint number used by the workload.
    pub endpoint: u8,
    /// Mix isochronous transfers into the workload.
    pub isochronous: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            sim: SimSettings {
                log_level: "info".to_string(),
                ports: 4,
            },
            backend: BackendSettings {
                pending_requests: 64,
                transfer_timeout_secs: 15,
            },
            workload: WorkloadSettings {
                transfers: 64,
                transfer_len: 64 * 1024,
                endpoint: 2,
                isochronous: false,
            },
        }
    }
}

impl SimConfig {
    /// Default config location: `<config dir>/pv-usb/sim.toml`.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("pv-usb").join("sim.toml")
        } else {
            PathBuf::from("sim.toml")
        }
    }

    /// Load from an explicit path (must exist) or the default path
    /// (falls back to defaults when absent).
    pub fn load(explicit: Option<&Path>) -> Result<SimConfig> {
        match explicit {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))
            }
            None => {
                let path = SimConfig::default_path();
                if path.exists() {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("reading config {}", path.display()))?;
                    toml::from_str(&text)
                        .with_context(|| format!("parsing config {}", path.display()))
                } else {
                    Ok(SimConfig::default())
                }
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("serializing config")?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sim.ports == 0 {
            return Err(anyhow!("sim.ports must be at least 1"));
        }
        if self.backend.pending_requests == 0 {
            return Err(anyhow!("backend.pending_requests must be at least 1"));
        }
        if self.workload.endpoint == 0 || self.workload.endpoint > 0x0f {
            return Err(anyhow!("workload.endpoint must be 1..=15"));
        }
        if self.workload.transfer_len == 0 {
            return Err(anyhow!("workload.transfer_len must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SimConfig::default().validate().unwrap();
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.toml");

        let mut config = SimConfig::default();
        config.workload.transfers = 7;
        config.workload.isochronous = true;
        config.save(&path).unwrap();

        let loaded = SimConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.workload.transfers, 7);
        assert!(loaded.workload.isochronous);
        assert_eq!(loaded.sim.ports, config.sim.ports);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        assert!(SimConfig::load(Some(Path::new("/nonexistent/sim.toml"))).is_err());
    }

    #[test]
    fn validation_rejects_bad_endpoint() {
        let mut config = SimConfig::default();
        config.workload.endpoint = 0;
        assert!(config.validate().is_err());
    }
}
