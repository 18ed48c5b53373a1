/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::{error::ConfigResult, receiver::config::DEFAULT_DELAY_FRAMES};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Interface selector: a name like `eth0` or one of its IPv4 addresses.
    pub interface: String,
    /// NMOS registry Query API base URL.
    #[serde(default)]
    pub registry: Option<String>,
    /// Output device name; resolution is up to the host audio layer.
    #[serde(default)]
    pub audio_device: Option<String>,
    #[serde(default = "default_delay_frames")]
    pub delay_frames: u32,
    #[serde(default = "default_query_version")]
    pub query_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interface: String::new(),
            registry: None,
            audio_device: None,
            delay_frames: default_delay_frames(),
            query_version: default_query_version(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> ConfigResult<Config> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

fn default_delay_frames() -> u32 {
    DEFAULT_DELAY_FRAMES
}

fn default_query_version() -> String {
    crate::nmos::DEFAULT_QUERY_VERSION.to_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_parses_with_defaults() {
        let config: Config = serde_yaml::from_str("interface: eth0\n").expect("valid yaml");
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.delay_frames, 240);
        assert_eq!(config.query_version, "v1.3");
        assert!(config.registry.is_none());
    }
}
