//! Persistent device configuration stored in the reserved prefix of the
//! block store.

use heapless::String;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::header;
use crate::session::SamplingRequest;
use crate::storage::{BlockStore, FlashMedium};

/// Marks a prefix that holds a serialized [`DeviceConfig`]
pub const CONFIG_MAGIC: u32 = 0x4543_4647;

/// Upper bound of a serialized config
pub const CONFIG_SIZE: usize = 256;

pub const DEFAULT_DEVICE_TYPE: &str = "PARTICLE_P2";
pub const DEFAULT_LABEL: &str = "test";
pub const DEFAULT_INTERVAL_MS: f32 = 0.0625;
pub const DEFAULT_LENGTH_MS: u32 = 10_000;

/// Identity strings used verbatim in the header and as the signing key
pub trait DeviceIdentity {
    fn device_id(&self) -> &str;
    fn device_type(&self) -> &str;
    fn hmac_key(&self) -> &str;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    magic: u32,
    pub device_id: String<32>,
    pub device_type: String<32>,
    pub hmac_key: String<64>,
    pub sample_label: String<32>,
    pub sample_interval_ms: f32,
    pub sample_length_ms: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::with_mac([0; 6])
    }
}

fn truncated<const N: usize>(s: &str) -> String<N> {
    let mut out = String::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Format a MAC address as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(mac: &[u8; 6]) -> String<17> {
    let mut out = String::new();
    for (i, byte) in mac.iter().enumerate() {
        let mut pair = [0u8; 2];
        header::hex_encode(&[*byte], &mut pair);
        if i > 0 {
            let _ = out.push(':');
        }
        let _ = out.push(pair[0] as char);
        let _ = out.push(pair[1] as char);
    }
    out
}

impl DeviceConfig {
    /// Factory defaults with the device id derived from `mac`.
    pub fn with_mac(mac: [u8; 6]) -> Self {
        Self {
            magic: CONFIG_MAGIC,
            device_id: truncated(&format_mac(&mac)),
            device_type: truncated(DEFAULT_DEVICE_TYPE),
            hmac_key: String::new(),
            sample_label: truncated(DEFAULT_LABEL),
            sample_interval_ms: DEFAULT_INTERVAL_MS,
            sample_length_ms: DEFAULT_LENGTH_MS,
        }
    }

    pub fn set_hmac_key(&mut self, key: &str) {
        self.hmac_key = truncated(key);
    }

    pub fn set_label(&mut self, label: &str) {
        self.sample_label = truncated(label);
    }

    pub fn sampling_request(&self) -> SamplingRequest {
        SamplingRequest {
            length_ms: self.sample_length_ms,
            interval_ms: self.sample_interval_ms,
        }
    }

    pub fn save<M: FlashMedium>(&self, store: &mut BlockStore<M>) -> Result<()> {
        let mut buf = [0u8; CONFIG_SIZE];
        let used = postcard::to_slice(self, &mut buf)
            .map_err(|_| CaptureError::Config(CaptureError::message("config encode failed")))?;
        store.save_config(used)?;
        info!("Config saved ({} bytes)", used.len());
        Ok(())
    }

    /// Load the stored config. A blank or foreign prefix yields `Ok(None)`.
    pub fn load<M: FlashMedium>(store: &mut BlockStore<M>) -> Result<Option<Self>> {
        let prefix = store.region().sample_offset() as usize;
        let len = CONFIG_SIZE.min(prefix);
        if len == 0 {
            warn!("No config blocks reserved");
            return Ok(None);
        }

        let mut buf = [0u8; CONFIG_SIZE];
        store.load_config(&mut buf[..len])?;
        match postcard::from_bytes::<Self>(&buf[..len]) {
            Ok(config) if config.magic == CONFIG_MAGIC => {
                debug!("Loaded config for {}", config.device_id);
                Ok(Some(config))
            }
            _ => {
                debug!("Config region blank");
                Ok(None)
            }
        }
    }

    /// Load the stored config, or write factory defaults for `mac` if none.
    pub fn load_or_init<M: FlashMedium>(store: &mut BlockStore<M>, mac: [u8; 6]) -> Result<Self> {
        if let Some(config) = Self::load(store)? {
            return Ok(config);
        }
        let config = Self::with_mac(mac);
        config.save(store)?;
        Ok(config)
    }
}

impl DeviceIdentity for DeviceConfig {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn device_type(&self) -> &str {
        &self.device_type
    }

    fn hmac_key(&self) -> &str {
        &self.hmac_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryRegion, RamFlash};

    fn store() -> BlockStore<RamFlash> {
        let region = MemoryRegion::new(0, 512, 8, CONFIG_SIZE as u32, 10);
        BlockStore::new(RamFlash::new(512, 8), region)
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0x00, 0x1a, 0x2b, 0xc3, 0xd4, 0xff]).as_str(),
            "00:1a:2b:c3:d4:ff"
        );
    }

    #[test]
    fn test_blank_region_has_no_config() {
        let mut store = store();
        assert_eq!(DeviceConfig::load(&mut store), Ok(None));
    }

    #[test]
    fn test_save_load() {
        let mut store = store();
        let mut config = DeviceConfig::with_mac([1, 2, 3, 4, 5, 6]);
        config.set_hmac_key("secret-key");
        config.set_label("door-knock");
        config.sample_length_ms = 2500;
        config.save(&mut store).unwrap();

        let loaded = DeviceConfig::load(&mut store).unwrap().unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.device_id(), "01:02:03:04:05:06");
        assert_eq!(loaded.hmac_key(), "secret-key");
        assert_eq!(loaded.sampling_request().length_ms, 2500);
    }

    #[test]
    fn test_load_or_init_writes_defaults_once() {
        let mut store = store();
        let first = DeviceConfig::load_or_init(&mut store, [0xaa; 6]).unwrap();
        assert_eq!(first.device_type(), DEFAULT_DEVICE_TYPE);

        let mut changed = first.clone();
        changed.set_label("changed");
        changed.save(&mut store).unwrap();
        let second = DeviceConfig::load_or_init(&mut store, [0xbb; 6]).unwrap();
        assert_eq!(second.sample_label.as_str(), "changed");
        assert_eq!(second.device_id.as_str(), "aa:aa:aa:aa:aa:aa");
    }

    #[test]
    fn test_overwrite_does_not_touch_samples() {
        let mut store = store();
        store.erase_sample_data(0, 16);
        store.write_sample_data(0, &[0x5a; 16]);
        DeviceConfig::default().save(&mut store).unwrap();
        DeviceConfig::with_mac([9; 6]).save(&mut store).unwrap();

        let mut buf = [0u8; 16];
        store.read_sample_exact(0, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; 16]);
    }

    #[test]
    fn test_long_strings_truncate() {
        let mut config = DeviceConfig::default();
        config.set_label("a label that is far longer than thirty-two characters");
        assert_eq!(config.sample_label.len(), 32);
    }
}
