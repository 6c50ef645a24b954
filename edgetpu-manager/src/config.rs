// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::time::Duration;
use edgetpu_interface::EdgeTpuError;
use edgetpu_shared::*;
use log::warn;
use serde::{Deserialize, Serialize};

/// Tunables of the manager and driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct EdgeTpuConfig {
    /// How long open_device waits for the accelerator to enumerate.
    pub connect_timeout: Duration,
    /// Bound on every USB transfer.
    pub transfer_timeout: Duration,
    pub max_bulk_chunk: usize,
    /// Mode used by EdgeTpuManager::open_default.
    pub default_mode: PerformanceMode,
}
impl Default for EdgeTpuConfig {
    fn default() -> Self {
        EdgeTpuConfig {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            max_bulk_chunk: MAX_BULK_CHUNK,
            default_mode: PerformanceMode::default(),
        }
    }
}
impl EdgeTpuConfig {
    /// Serializes into |buf|, returning the used prefix.
    pub fn to_slice<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8], EdgeTpuError> {
        postcard::to_slice(self, buf).or(Err(EdgeTpuError::SerializeFailed))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EdgeTpuError> {
        postcard::from_bytes(bytes).or(Err(EdgeTpuError::DeserializeFailed))
    }

    /// Decodes the stored config, falling back to the defaults when it is
    /// missing or unreadable.
    pub fn load(stored: Option<&[u8]>) -> Self {
        let Some(bytes) = stored else {
            return Self::default();
        };
        match Self::from_bytes(bytes) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring stored Edge TPU config: {:?}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EdgeTpuConfig::default();
        assert_eq!(config.default_mode, PerformanceMode::High);
        assert_eq!(config.max_bulk_chunk, MAX_BULK_CHUNK);
    }

    #[test]
    fn persisted_form() {
        let config = EdgeTpuConfig {
            connect_timeout: Duration::from_millis(50),
            default_mode: PerformanceMode::Low,
            ..Default::default()
        };
        let mut buf = [0u8; 64];
        let bytes = config.to_slice(&mut buf).unwrap();
        assert_eq!(EdgeTpuConfig::from_bytes(bytes), Ok(config));

        assert_eq!(
            config.to_slice(&mut [0u8; 2]).err(),
            Some(EdgeTpuError::SerializeFailed)
        );
        assert_eq!(
            EdgeTpuConfig::from_bytes(&[0xff]).err(),
            Some(EdgeTpuError::DeserializeFailed)
        );
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let config = EdgeTpuConfig {
            transfer_timeout: Duration::from_millis(7),
            ..Default::default()
        };
        let mut buf = [0u8; 64];
        let bytes = config.to_slice(&mut buf).unwrap();
        assert_eq!(EdgeTpuConfig::load(Some(bytes)), config);
        assert_eq!(EdgeTpuConfig::load(None), EdgeTpuConfig::default());
        assert_eq!(EdgeTpuConfig::load(Some(&[0xff])), EdgeTpuConfig::default());
    }
}
