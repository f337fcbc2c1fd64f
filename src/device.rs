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

use std::collections::HashMap;
use std::collections::VecDeque;

/// Data-model roots that never show up in GetParameterNames listings.
const HIDDEN_ROOTS: [&str; 7] = [
    "DeviceID",
    "Downloads",
    "Tags",
    "Events",
    "Reboot",
    "FactoryReset",
    "VirtualParameters",
];

/// Parameter paths reported in every Inform, when the device defines them.
pub const INFORM_PARAMS: [&str; 16] = [
    "InternetGatewayDevice.DeviceInfo.SpecVersion",
    "InternetGatewayDevice.DeviceInfo.HardwareVersion",
    "InternetGatewayDevice.DeviceInfo.SoftwareVersion",
    "InternetGatewayDevice.DeviceInfo.ProvisioningCode",
    "InternetGatewayDevice.ManagementServer.ParameterKey",
    "InternetGatewayDevice.ManagementServer.ConnectionRequestURL",
    "InternetGatewayDevice.WANDevice.1.WANConnectionDevice.1.WANPPPConnection.1.ExternalIPAddress",
    "InternetGatewayDevice.WANDevice.1.WANConnectionDevice.1.WANIPConnection.1.ExternalIPAddress",
    "Device.DeviceInfo.SpecVersion",
    "Device.DeviceInfo.HardwareVersion",
    "Device.DeviceInfo.SoftwareVersion",
    "Device.DeviceInfo.ProvisioningCode",
    "Device.ManagementServer.ParameterKey",
    "Device.ManagementServer.ConnectionRequestURL",
    "Device.WANDevice.1.WANConnectionDevice.1.WANPPPConnection.1.ExternalIPAddress",
    "Device.WANDevice.1.WANConnectionDevice.1.WANIPConnection.1.ExternalIPAddress",
];

const UPGRADED_VERSION: &str = "2.0.0-upgraded";

/// One node of the data model. Object nodes (paths ending with `.`) only
/// carry the writable flag.
#[derive(Debug, PartialEq, Default, Clone)]
pub struct Parameter {
    pub writable: bool,
    pub value: String,
    pub xsd_type: String,
}

impl Parameter {
    pub fn object(writable: bool) -> Self {
        Self {
            writable,
            value: String::new(),
            xsd_type: String::new(),
        }
    }

    pub fn leaf(writable: bool, value: &str, xsd_type: &str) -> Self {
        Self {
            writable,
            value: String::from(value),
            xsd_type: String::from(xsd_type),
        }
    }
}

#[derive(Debug, PartialEq, Default, Clone)]
pub struct Identity {
    pub manufacturer: String,
    pub oui: String,
    pub product_class: String,
    pub serial_number: String,
}

/// Outcome of a finished (or failed) file transfer, waiting to be delivered
/// as a TransferComplete in a later session. `fault_code` is `"0"` or empty
/// on success.
#[derive(Debug, PartialEq, Default, Clone)]
pub struct TransferRecord {
    pub command_key: String,
    pub start_time: String,
    pub fault_code: String,
    pub fault_string: String,
}

impl TransferRecord {
    pub fn success(command_key: &str, start_time: &str) -> Self {
        Self {
            command_key: String::from(command_key),
            start_time: String::from(start_time),
            fault_code: String::from("0"),
            fault_string: String::new(),
        }
    }

    pub fn fault(command_key: &str, start_time: &str, code: u32, text: &str) -> Self {
        Self {
            command_key: String::from(command_key),
            start_time: String::from(start_time),
            fault_code: code.to_string(),
            fault_string: String::from(text),
        }
    }

    pub fn is_fault(&self) -> bool {
        !self.fault_code.is_empty() && self.fault_code != "0"
    }
}

/// The simulated device: parameter map, identity, ACS credentials and the
/// pending-transfers queue. The pristine template map is kept aside so
/// AddObject can instantiate new objects with the leaves the model defines.
pub struct Device {
    pub identity: Identity,
    pub username: String,
    pub password: String,
    pub transfers: VecDeque<TransferRecord>,
    params: HashMap<String, Parameter>,
    template: HashMap<String, Parameter>,
    sorted_paths: Option<Vec<String>>,
}

impl Device {
    pub fn new(
        params: HashMap<String, Parameter>,
        identity: Identity,
        username: &str,
        password: &str,
    ) -> Self {
        Self {
            identity,
            username: String::from(username),
            password: String::from(password),
            transfers: VecDeque::new(),
            template: params.clone(),
            params,
            sorted_paths: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Update a leaf in place. Unknown names are left untouched.
    pub fn set_value(&mut self, name: &str, value: &str, xsd_type: &str) -> bool {
        match self.params.get_mut(name) {
            Some(param) => {
                param.value = String::from(value);
                if !xsd_type.is_empty() {
                    param.xsd_type = String::from(xsd_type);
                }
                true
            }
            None => false,
        }
    }

    /// Lexicographically sorted visible paths. Built lazily, invalidated by
    /// AddObject/DeleteObject.
    pub fn sorted_paths(&mut self) -> &[String] {
        self.ensure_sorted();
        self.sorted_paths.as_deref().unwrap_or_default()
    }

    fn ensure_sorted(&mut self) {
        if self.sorted_paths.is_none() {
            let mut paths: Vec<String> = self
                .params
                .keys()
                .filter(|path| Self::visible(path))
                .cloned()
                .collect();
            paths.sort();
            self.sorted_paths = Some(paths);
        }
    }

    /// GetParameterNames listing: `(path, writable)` for every visible path
    /// under `prefix`. With `next_level`, only direct children: leaves with
    /// no further dot, or child objects with a single trailing dot; the
    /// `prefix` node itself is excluded.
    pub fn parameter_names(&mut self, prefix: &str, next_level: bool) -> Vec<(String, bool)> {
        self.ensure_sorted();
        let params = &self.params;
        self.sorted_paths
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|path| path.starts_with(prefix))
            .filter(|path| {
                if !next_level {
                    return true;
                }
                let rest = &path[prefix.len()..];
                if rest.is_empty() {
                    return false;
                }
                let inner = rest.strip_suffix('.').unwrap_or(rest);
                !inner.contains('.')
            })
            .map(|path| {
                let writable = params.get(path.as_str()).map(|p| p.writable).unwrap_or(false);
                (path.clone(), writable)
            })
            .collect()
    }

    fn visible(path: &str) -> bool {
        if path.starts_with('_') {
            return false;
        }
        let root = path.split('.').next().unwrap_or(path);
        !HIDDEN_ROOTS.contains(&root)
    }

    /// Leaves under `prefix`, sorted. Used to expand partial paths in
    /// GetParameterValues.
    pub fn leaves_under(&mut self, prefix: &str) -> Vec<String> {
        self.sorted_paths()
            .iter()
            .filter(|path| path.starts_with(prefix) && !path.ends_with('.'))
            .cloned()
            .collect()
    }

    /// Instantiate `<object><i>.` with the smallest free positive `i`,
    /// populating every leaf the template defines for instances of this
    /// object with a type-appropriate default.
    pub fn add_object(&mut self, object: &str) -> u32 {
        let mut instance: u32 = 1;
        while self.params.contains_key(&format!("{}{}.", object, instance)) {
            instance += 1;
        }
        let base = format!("{}{}.", object, instance);
        self.params.insert(base.clone(), Parameter::object(true));

        if let Some(model) = self.template_instance(object) {
            let model_base = format!("{}{}.", object, model);
            let suffixes: Vec<(String, Parameter)> = self
                .template
                .iter()
                .filter(|(path, _)| path.len() > model_base.len() && path.starts_with(&model_base))
                .map(|(path, param)| (path[model_base.len()..].to_string(), param.clone()))
                .collect();
            for (suffix, param) in suffixes {
                let path = format!("{}{}", base, suffix);
                let fresh = if suffix.ends_with('.') {
                    Parameter::object(param.writable)
                } else {
                    Parameter::leaf(param.writable, default_value(&param.xsd_type), &param.xsd_type)
                };
                self.params.insert(path, fresh);
            }
        }

        self.sorted_paths = None;
        instance
    }

    /// Smallest instance number the template defines under `object`.
    fn template_instance(&self, object: &str) -> Option<u32> {
        self.template
            .keys()
            .filter_map(|path| path.strip_prefix(object))
            .filter_map(|rest| rest.split('.').next())
            .filter_map(|segment| segment.parse::<u32>().ok())
            .min()
    }

    /// Remove every key starting with `prefix`.
    pub fn delete_object(&mut self, prefix: &str) {
        self.params.retain(|path, _| !path.starts_with(prefix));
        self.sorted_paths = None;
    }

    pub fn periodic_inform_interval(&self) -> Option<u64> {
        for root in ["InternetGatewayDevice", "Device"] {
            let name = format!("{}.ManagementServer.PeriodicInformInterval", root);
            if let Some(param) = self.params.get(&name) {
                if let Ok(seconds) = param.value.trim().parse::<u64>() {
                    return Some(seconds);
                }
            }
        }
        None
    }

    /// Firmware-upgrade continuation bumps the version on both roots.
    pub fn upgrade_software_version(&mut self) {
        for root in ["InternetGatewayDevice", "Device"] {
            let name = format!("{}.DeviceInfo.SoftwareVersion", root);
            if let Some(param) = self.params.get_mut(&name) {
                param.value = String::from(UPGRADED_VERSION);
            }
        }
    }

    pub fn set_connection_request_url(&mut self, url: &str) {
        for root in ["InternetGatewayDevice", "Device"] {
            let name = format!("{}.ManagementServer.ConnectionRequestURL", root);
            if let Some(param) = self.params.get_mut(&name) {
                param.value = String::from(url);
            }
        }
    }
}

/// AddObject leaf defaults, by xsd type.
fn default_value(xsd_type: &str) -> &'static str {
    match xsd_type {
        "xsd:boolean" => "false",
        "xsd:int" | "xsd:unsignedInt" => "0",
        "xsd:dateTime" => "0001-01-01T00:00:00Z",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> Device {
        let mut params = HashMap::new();
        let entries = [
            ("InternetGatewayDevice.", false, "", ""),
            ("InternetGatewayDevice.DeviceInfo.", false, "", ""),
            (
                "InternetGatewayDevice.DeviceInfo.SoftwareVersion",
                false,
                "1.0.0",
                "xsd:string",
            ),
            ("InternetGatewayDevice.LANDevice.", false, "", ""),
            ("InternetGatewayDevice.LANDevice.1.", false, "", ""),
            (
                "InternetGatewayDevice.LANDevice.1.WLANConfiguration.",
                true,
                "",
                "",
            ),
            (
                "InternetGatewayDevice.LANDevice.1.WLANConfiguration.1.",
                true,
                "",
                "",
            ),
            (
                "InternetGatewayDevice.LANDevice.1.WLANConfiguration.1.SSID",
                true,
                "sim",
                "xsd:string",
            ),
            (
                "InternetGatewayDevice.LANDevice.1.WLANConfiguration.1.Enable",
                true,
                "true",
                "xsd:boolean",
            ),
            (
                "InternetGatewayDevice.LANDevice.1.WLANConfiguration.1.Channel",
                true,
                "11",
                "xsd:unsignedInt",
            ),
            ("_private", false, "x", "xsd:string"),
            ("DeviceID.SerialNumber", false, "123", "xsd:string"),
        ];
        for (path, writable, value, xsd_type) in entries {
            params.insert(
                String::from(path),
                Parameter::leaf(writable, value, xsd_type),
            );
        }
        Device::new(params, Identity::default(), "usertest", "passtest")
    }

    #[test]
    fn test_sorted_paths_hide_private_roots() {
        let mut device = test_device();
        let paths = device.sorted_paths();
        assert!(paths.iter().all(|p| !p.starts_with('_')));
        assert!(paths.iter().all(|p| !p.starts_with("DeviceID")));
        let mut sorted = paths.to_vec();
        sorted.sort();
        assert_eq!(paths, sorted.as_slice());
    }

    #[test]
    fn test_add_object_picks_smallest_free_instance() {
        let mut device = test_device();
        let object = "InternetGatewayDevice.LANDevice.1.WLANConfiguration.";
        let instance = device.add_object(object);
        assert_eq!(instance, 2);

        // Template leaves materialize with type defaults.
        let ssid = device
            .get("InternetGatewayDevice.LANDevice.1.WLANConfiguration.2.SSID")
            .unwrap();
        assert_eq!(ssid.value, "");
        let enable = device
            .get("InternetGatewayDevice.LANDevice.1.WLANConfiguration.2.Enable")
            .unwrap();
        assert_eq!(enable.value, "false");
        let channel = device
            .get("InternetGatewayDevice.LANDevice.1.WLANConfiguration.2.Channel")
            .unwrap();
        assert_eq!(channel.value, "0");

        assert_eq!(device.add_object(object), 3);
    }

    #[test]
    fn test_add_then_delete_restores_key_set() {
        let mut device = test_device();
        let before: Vec<String> = device.sorted_paths().to_vec();

        let object = "InternetGatewayDevice.LANDevice.1.WLANConfiguration.";
        let instance = device.add_object(object);
        assert_ne!(device.sorted_paths().to_vec(), before);

        device.delete_object(&format!("{}{}.", object, instance));
        assert_eq!(device.sorted_paths().to_vec(), before);
    }

    #[test]
    fn test_parameter_names_next_level() {
        let mut device = test_device();

        let children = device.parameter_names("InternetGatewayDevice.LANDevice.1.WLANConfiguration.1.", true);
        let names: Vec<&str> = children.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            [
                "InternetGatewayDevice.LANDevice.1.WLANConfiguration.1.Channel",
                "InternetGatewayDevice.LANDevice.1.WLANConfiguration.1.Enable",
                "InternetGatewayDevice.LANDevice.1.WLANConfiguration.1.SSID",
            ]
        );

        // Direct child objects keep their single trailing dot; deeper paths
        // are excluded.
        let top = device.parameter_names("InternetGatewayDevice.", true);
        let names: Vec<&str> = top.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"InternetGatewayDevice.DeviceInfo."));
        assert!(names.contains(&"InternetGatewayDevice.LANDevice."));
        assert!(!names.iter().any(|n| n.contains("WLANConfiguration")));

        // Without next_level the whole subtree comes back.
        let all = device.parameter_names("InternetGatewayDevice.LANDevice.", false);
        assert!(all.len() > top.len());
    }

    #[test]
    fn test_set_value_only_touches_existing() {
        let mut device = test_device();
        assert!(device.set_value(
            "InternetGatewayDevice.DeviceInfo.SoftwareVersion",
            "1.1.0",
            "xsd:string"
        ));
        assert!(!device.set_value("InternetGatewayDevice.Nope", "x", "xsd:string"));
        assert_eq!(
            device
                .get("InternetGatewayDevice.DeviceInfo.SoftwareVersion")
                .unwrap()
                .value,
            "1.1.0"
        );
    }

    #[test]
    fn test_upgrade_software_version() {
        let mut device = test_device();
        device.upgrade_software_version();
        assert_eq!(
            device
                .get("InternetGatewayDevice.DeviceInfo.SoftwareVersion")
                .unwrap()
                .value,
            "2.0.0-upgraded"
        );
    }

    #[test]
    fn test_transfer_record_fault_rules() {
        assert!(!TransferRecord::success("ck", "t").is_fault());
        assert!(TransferRecord::fault("ck", "t", 9010, "Download failure").is_fault());
    }
}
