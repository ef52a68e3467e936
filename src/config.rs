//! Client configuration.
//!
//! Every field has a default, so a config file only needs the VIN:
//!
//! ```json
//! { "vin": "7G2CEHED7RA003723", "response_timeout_ms": 8000 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vin::Vin;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub vin: String,
    pub response_timeout_ms: u64,
    /// Silence after the first notification that ends a response.
    pub idle_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub scan_timeout_ms: u64,
    pub chunk_size: usize,
    pub chunk_pacing_ms: u64,
    pub mtu: u16,
    /// How long a scanned address is reused before scanning again.
    pub device_cache_timeout_ms: u64,
    /// Keep the accumulated vehicle state when reconnecting instead of starting empty.
    pub retain_state_across_reconnects: bool,
    /// Hex-encoded session key for signed commands.
    pub hmac_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            vin: String::new(),
            response_timeout_ms: 5000,
            idle_timeout_ms: 1000,
            connection_timeout_ms: 10000,
            scan_timeout_ms: 20000,
            chunk_size: 20,
            chunk_pacing_ms: 50,
            mtu: 517,
            device_cache_timeout_ms: 300_000,
            retain_state_across_reconnects: false,
            hmac_key: None,
        }
    }
}

impl ClientConfig {
    pub fn new(vin: &str) -> Self {
        Self { vin: vin.to_owned(), ..Default::default() }
    }

    /// Read a JSON config file. The VIN is checked here so a typo fails before any scanning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Config { path: path.to_owned(), source })?;
        let config: ClientConfig = serde_json::from_str(&text)?;
        config.vin()?;
        Ok(config)
    }

    pub fn vin(&self) -> Result<Vin> {
        Vin::new(&self.vin)
    }

    pub fn hmac_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.hmac_key.as_deref().map(hex::decode).transpose().map_err(Error::from)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn chunk_pacing(&self) -> Duration {
        Duration::from_millis(self.chunk_pacing_ms)
    }

    pub fn device_cache_timeout(&self) -> Duration {
        Duration::from_millis(self.device_cache_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: ClientConfig = serde_json::from_str(r#"{"vin": "7G2CEHED7RA003723", "chunk_size": 182}"#).unwrap();
        assert_eq!(config.chunk_size, 182);
        assert_eq!(config.response_timeout(), Duration::from_millis(5000));
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.device_cache_timeout(), Duration::from_secs(300));
        assert!(!config.retain_state_across_reconnects);
        assert_eq!(config.vin().unwrap().as_str(), "7G2CEHED7RA003723");
    }

    #[test]
    fn test_load_rejects_bad_vin() {
        let path = std::env::temp_dir().join(format!("carread-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"vin": "TOOSHORT"}"#).unwrap();
        let result = ClientConfig::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(Error::InvalidVin { len: 8, .. })));
    }

    #[test]
    fn test_load_missing_file() {
        let result = ClientConfig::load("/nonexistent/carread.json");
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_hmac_key() {
        let mut config = ClientConfig::new("7G2CEHED7RA003723");
        assert_eq!(config.hmac_key_bytes().unwrap(), None);
        config.hmac_key = Some("00ff".to_owned());
        assert_eq!(config.hmac_key_bytes().unwrap(), Some(vec![0x00, 0xff]));
        config.hmac_key = Some("zz".to_owned());
        assert!(matches!(config.hmac_key_bytes(), Err(Error::InvalidHexKey(_))));
    }
}
