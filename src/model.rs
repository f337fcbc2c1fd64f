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
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::Config;
use crate::device::{Device, Identity, Parameter};

const DEFAULT_MODEL: &str = include_str!("../model/device.toml");

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
struct ModelParameter {
    path: String,
    writable: bool,

    #[serde(default)]
    value: String,

    #[serde(default)]
    #[serde(rename = "type")]
    xsd_type: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
struct ModelFile {
    parameter: Vec<ModelParameter>,
}

/**
 * Build the simulated device from the data-model dictionary: the embedded
 * default model, or the TOML file pointed at by `CWMPSIM_MODEL`.
 *
 * The configured serial number and MAC address are stamped into the matching
 * parameters, and the ACS credentials fall back from
 * `ManagementServer.Username/Password` to the launcher configuration.
 */
pub fn load(config: &Config) -> Result<Device> {
    let text = match std::env::var("CWMPSIM_MODEL") {
        Ok(path) => std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("cannot read data model {}", path))?,
        Err(_) => String::from(DEFAULT_MODEL),
    };
    let model: ModelFile = toml::from_str(&text).wrap_err("invalid data model")?;

    let mut params = HashMap::new();
    for entry in model.parameter {
        let param = if entry.path.ends_with('.') {
            Parameter::object(entry.writable)
        } else {
            Parameter::leaf(entry.writable, &entry.value, &entry.xsd_type)
        };
        params.insert(entry.path, param);
    }

    for (path, param) in params.iter_mut() {
        if path.ends_with(".DeviceInfo.SerialNumber") {
            param.value = config.serial_number.clone();
        } else if path.ends_with(".MACAddress") {
            param.value = config.mac_address.clone();
        }
    }

    let identity = Identity {
        manufacturer: value_of(&params, "DeviceInfo.Manufacturer")
            .unwrap_or("cwmpsim")
            .to_string(),
        oui: value_of(&params, "DeviceInfo.ManufacturerOUI")
            .unwrap_or("CAFE12")
            .to_string(),
        product_class: value_of(&params, "DeviceInfo.ProductClass")
            .unwrap_or("cwmpsim")
            .to_string(),
        serial_number: config.serial_number.clone(),
    };

    let username = value_of(&params, "ManagementServer.Username")
        .filter(|v| !v.is_empty())
        .unwrap_or(&config.username)
        .to_string();
    let password = value_of(&params, "ManagementServer.Password")
        .filter(|v| !v.is_empty())
        .unwrap_or(&config.password)
        .to_string();

    Ok(Device::new(params, identity, &username, &password))
}

/// Look a suffix up under both data-model roots.
fn value_of<'a>(params: &'a HashMap<String, Parameter>, suffix: &str) -> Option<&'a str> {
    for root in ["InternetGatewayDevice", "Device"] {
        if let Some(param) = params.get(&format!("{}.{}", root, suffix)) {
            return Some(param.value.as_str());
        }
    }
    None
}
