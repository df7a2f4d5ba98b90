use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub devices: DevicesConf,
    pub http: HttpConf,
    pub cache: CacheConf,
    pub provisioning: ProvisioningConf,
    pub store: StoreConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DevicesConf {
    pub bind: IpAddr,
    pub port: u16,
    /// Au-delà, un device muet est considéré mort
    pub request_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConf {
    pub bind: IpAddr,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConf {
    pub freshness_window_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProvisioningConf {
    pub simulated_first: u32,
    pub simulated_last: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConf {
    pub snapshot_path: Option<String>, // ex: "./data/bins.json"
    pub flush_interval_secs: u64,
}

impl Default for DevicesConf {
    fn default() -> Self {
        Self { bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port: 2910, request_timeout_ms: 5000 }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port: 8080 }
    }
}

impl Default for CacheConf {
    fn default() -> Self {
        Self { freshness_window_secs: 3600 }
    }
}

impl Default for ProvisioningConf {
    fn default() -> Self {
        Self { simulated_first: 1000, simulated_last: 1999 }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { snapshot_path: None, flush_interval_secs: 60 }
    }
}

impl DevicesConf {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl HttpConf {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl ProvisioningConf {
    pub fn simulated_range(&self) -> RangeInclusive<u32> {
        self.simulated_first..=self.simulated_last
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    let mut cfg: KernelConfig = serde_yaml::from_str(txt)?;
    // un timeout nul ferait échouer toutes les requêtes
    if cfg.devices.request_timeout_ms == 0 {
        let fallback = DevicesConf::default().request_timeout_ms;
        warn!(fallback, "devices.request_timeout_ms = 0, using default");
        cfg.devices.request_timeout_ms = fallback;
    }
    Ok(cfg)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("BINLINK_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!(%path, error = %e, "invalid config, using defaults");
            KernelConfig::default()
        })
    } else {
        warn!(%path, "no config file, using defaults");
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.devices.port, 2910);
        assert_eq!(cfg.devices.request_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.cache.freshness_window_secs, 3600);
        assert_eq!(cfg.provisioning.simulated_range(), 1000..=1999);
        assert_eq!(parse_config("   \n").unwrap(), cfg);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config("devices:\n  port: 3000\nstore:\n  snapshot_path: ./data/bins.json\n").unwrap();
        assert_eq!(cfg.devices.port, 3000);
        assert_eq!(cfg.devices.request_timeout_ms, 5000);
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.store.snapshot_path.as_deref(), Some("./data/bins.json"));
        assert_eq!(cfg.store.flush_interval_secs, 60);
    }

    #[test]
    fn test_zero_request_timeout_falls_back_to_default() {
        let cfg = parse_config("devices:\n  request_timeout_ms: 0\n").unwrap();
        assert_eq!(cfg.devices.request_timeout(), Duration::from_secs(5));
        let cfg = parse_config("devices:\n  request_timeout_ms: 250\n").unwrap();
        assert_eq!(cfg.devices.request_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(parse_config("devices: [1, 2").is_err());
        assert!(parse_config("devices:\n  port: not-a-port\n").is_err());
    }
}
