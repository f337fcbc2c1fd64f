/*
 * Copyright (C) 2023 Guillaume Pellegrino
 * This file is part of cwmpsim <https://github.com/guillaumepellegrino/cwmpsim>.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */
use eyre::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub acs_url: String,
    pub serial_number: String,
    pub mac_address: String,
    pub username: String,
    pub password: String,
    pub session_timeout_ms: u64,
    pub download_timeout_ms: u64,
    pub periodic_inform_interval_s: u64,
    pub stop_window_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            acs_url: String::from("http://127.0.0.1:7547/"),
            serial_number: String::from("000000000000"),
            mac_address: String::from("20:20:20:20:20:20"),
            username: String::from("usertest"),
            password: String::from("passtest"),
            session_timeout_ms: 30000,
            download_timeout_ms: 30000,
            periodic_inform_interval_s: 10,
            stop_window_ms: 3000,
        }
    }
}

impl Config {
    /**
     * Build the launcher configuration: the TOML file pointed at by
     * CWMPSIM_CONFIG when set, then environment overrides on top.
     */
    pub fn load() -> Result<Config> {
        let mut config = match std::env::var("CWMPSIM_CONFIG") {
            Ok(path) => Self::restore(std::path::Path::new(&path))?,
            Err(_) => Config::default(),
        };

        if let Ok(value) = std::env::var("ACS_URL") {
            config.acs_url = value;
        }
        if let Ok(value) = std::env::var("SERIAL_NUMBER") {
            config.serial_number = value;
        }
        if let Ok(value) = std::env::var("MAC_ADDRESS") {
            config.mac_address = value;
        }
        if let Ok(value) = std::env::var("ACS_CPE_USERNAME") {
            config.username = value;
        }
        if let Ok(value) = std::env::var("ACS_CPE_PASSWORD") {
            config.password = value;
        }
        if let Ok(value) = std::env::var("DOWNLOAD_TIMEOUT") {
            if let Ok(ms) = value.trim().parse::<u64>() {
                config.download_timeout_ms = ms;
            }
        }

        Ok(config)
    }

    /**
     * Restore configuration from TOML file specified by path
     */
    pub fn restore(path: &std::path::Path) -> Result<Config> {
        let string = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&string)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.username, "usertest");
        assert_eq!(config.password, "passtest");
        assert_eq!(config.download_timeout_ms, 30000);
        assert_eq!(config.periodic_inform_interval_s, 10);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.acs_url = String::from("http://acs.example.net:7547/cwmp");
        config.serial_number = String::from("SN1234");

        let text = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str("acs_url = \"http://10.0.0.1:7547/\"").unwrap();
        assert_eq!(config.acs_url, "http://10.0.0.1:7547/");
        assert_eq!(config.session_timeout_ms, 30000);
    }
}
