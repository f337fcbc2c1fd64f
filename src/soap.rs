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
use quick_xml::events::Event as XmlEvent;
use serde::Deserialize;
use serde::Serialize;

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Wire timestamp mandated by TR-069 for not-yet-known times.
pub const UNKNOWN_TIME: &str = "0001-01-01T00:00:00Z";

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct ID {
    #[serde(rename(serialize = "@soap-env:mustUnderstand", deserialize = "@mustUnderstand"))]
    #[serde(default)]
    must_understand: String,

    #[serde(rename = "$text")]
    pub text: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct Header {
    #[serde(rename(serialize = "cwmp:ID", deserialize = "ID"))]
    pub id: ID,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize, Clone)]
pub struct DeviceId {
    #[serde(rename = "Manufacturer")]
    pub manufacturer: String,

    #[serde(rename = "OUI")]
    pub oui: String,

    #[serde(rename = "ProductClass")]
    pub product_class: String,

    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct EventStruct {
    #[serde(rename = "EventCode")]
    pub event_code: String,

    #[serde(rename = "CommandKey")]
    #[serde(default)]
    pub command_key: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct Event {
    #[serde(rename(serialize = "@soap-enc:arrayType", deserialize = "@arrayType"))]
    #[serde(default)]
    array_type: String,

    #[serde(rename = "EventStruct")]
    #[serde(default)]
    pub event_struct: Vec<EventStruct>,
}

impl Event {
    pub fn push(self: &mut Self, event_code: &str, command_key: &str) -> &mut Self {
        self.event_struct.push(EventStruct {
            event_code: String::from(event_code),
            command_key: String::from(command_key),
        });
        self.array_type = format!("cwmp:EventStruct[{}]", self.event_struct.len());
        self
    }
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct Value {
    #[serde(rename(serialize = "@xsi:type", deserialize = "@type"))]
    #[serde(default)]
    pub xsi_type: String,

    #[serde(rename = "$text")]
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct ParameterValue {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Value")]
    pub value: Value,
}

impl ParameterValue {
    pub fn new(name: &str, xsi_type: &str, value: &str) -> Self {
        Self {
            name: String::from(name),
            value: Value {
                xsi_type: String::from(xsi_type),
                text: String::from(value),
            },
        }
    }
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct ParameterList {
    #[serde(rename(serialize = "@soap-enc:arrayType", deserialize = "@arrayType"))]
    #[serde(default)]
    pub array_type: String,

    #[serde(rename = "ParameterValueStruct")]
    #[serde(default)]
    pub parameter_values: Vec<ParameterValue>,
}

impl ParameterList {
    pub fn push(self: &mut Self, pv: ParameterValue) -> &mut Self {
        self.parameter_values.push(pv);
        self.array_type = format!("cwmp:ParameterValueStruct[{}]", self.parameter_values.len());
        self
    }

    pub fn get(self: &Self, name: &str) -> Option<&ParameterValue> {
        self.parameter_values.iter().find(|pv| pv.name == name)
    }

    pub fn get_value(self: &Self, name: &str) -> Option<&str> {
        self.get(name).map(|pv| pv.value.text.as_str())
    }
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct ParameterInfoStruct {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Writable")]
    pub writable: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct ParameterInfoList {
    #[serde(rename(serialize = "@soap-enc:arrayType", deserialize = "@arrayType"))]
    #[serde(default)]
    array_type: String,

    #[serde(rename = "ParameterInfoStruct")]
    #[serde(default)]
    pub parameter_info: Vec<ParameterInfoStruct>,
}

impl ParameterInfoList {
    pub fn push(self: &mut Self, name: &str, writable: bool) -> &mut Self {
        self.parameter_info.push(ParameterInfoStruct {
            name: String::from(name),
            writable: String::from(if writable { "1" } else { "0" }),
        });
        self.array_type = format!("cwmp:ParameterInfoStruct[{}]", self.parameter_info.len());
        self
    }
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct ParameterNames {
    #[serde(rename(serialize = "@soap-enc:arrayType", deserialize = "@arrayType"))]
    #[serde(default)]
    array_type: String,

    #[serde(rename = "string")]
    #[serde(default)]
    pub string: Vec<String>,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct Inform {
    #[serde(rename = "DeviceId")]
    pub device_id: DeviceId,

    #[serde(rename = "Event")]
    #[serde(default)]
    pub event: Event,

    #[serde(rename = "MaxEnvelopes")]
    pub max_envelopes: u32,

    #[serde(rename = "CurrentTime")]
    pub current_time: String,

    #[serde(rename = "RetryCount")]
    pub retry_count: u32,

    #[serde(rename = "ParameterList")]
    #[serde(default)]
    pub parameter_list: ParameterList,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct InformResponse {
    #[serde(rename = "MaxEnvelopes")]
    #[serde(default)]
    pub max_envelopes: u32,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct GetParameterNames {
    #[serde(rename = "ParameterPath")]
    #[serde(default)]
    pub parameter_path: String,

    #[serde(rename = "NextLevel")]
    #[serde(default)]
    pub next_level: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct GetParameterNamesResponse {
    #[serde(rename = "ParameterList")]
    #[serde(default)]
    pub parameter_list: ParameterInfoList,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct GetParameterValues {
    #[serde(rename = "ParameterNames")]
    #[serde(default)]
    pub parameter_names: ParameterNames,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct GetParameterValuesResponse {
    #[serde(rename = "ParameterList")]
    #[serde(default)]
    pub parameter_list: ParameterList,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct SetParameterValues {
    #[serde(rename = "ParameterList")]
    #[serde(default)]
    pub parameter_list: ParameterList,

    #[serde(rename = "ParameterKey")]
    #[serde(default)]
    pub parameter_key: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct SetParameterValuesResponse {
    #[serde(rename = "Status")]
    pub status: i32,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct AddObject {
    #[serde(rename = "ObjectName")]
    #[serde(default)]
    pub object_name: String,

    #[serde(rename = "ParameterKey")]
    #[serde(default)]
    pub parameter_key: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct AddObjectResponse {
    #[serde(rename = "InstanceNumber")]
    pub instance_number: u32,

    #[serde(rename = "Status")]
    pub status: i32,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct DeleteObject {
    #[serde(rename = "ObjectName")]
    #[serde(default)]
    pub object_name: String,

    #[serde(rename = "ParameterKey")]
    #[serde(default)]
    pub parameter_key: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct DeleteObjectResponse {
    #[serde(rename = "Status")]
    pub status: i32,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct Download {
    #[serde(rename = "CommandKey")]
    #[serde(default)]
    pub command_key: String,

    #[serde(rename = "FileType")]
    #[serde(default)]
    pub file_type: String,

    #[serde(rename = "URL")]
    #[serde(default)]
    pub url: String,

    #[serde(rename = "Username")]
    #[serde(default)]
    pub username: String,

    #[serde(rename = "Password")]
    #[serde(default)]
    pub password: String,

    #[serde(rename = "FileSize")]
    #[serde(default)]
    pub file_size: i64,

    #[serde(rename = "TargetFileName")]
    #[serde(default)]
    pub target_file_name: String,

    #[serde(rename = "DelaySeconds")]
    #[serde(default)]
    pub delay_seconds: i32,

    #[serde(rename = "SuccessURL")]
    #[serde(default)]
    pub success_url: String,

    #[serde(rename = "FailureURL")]
    #[serde(default)]
    pub failure_url: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct DownloadResponse {
    #[serde(rename = "Status")]
    pub status: i32,

    #[serde(rename = "StartTime")]
    pub start_time: String,

    #[serde(rename = "CompleteTime")]
    pub complete_time: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct Reboot {
    #[serde(rename = "CommandKey")]
    #[serde(default)]
    pub command_key: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct RebootResponse {}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct FactoryReset {}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct FactoryResetResponse {}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct FaultStruct {
    #[serde(rename = "FaultCode")]
    pub fault_code: String,

    #[serde(rename = "FaultString")]
    #[serde(default)]
    pub fault_string: String,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct TransferComplete {
    #[serde(rename = "CommandKey")]
    #[serde(default)]
    pub command_key: String,

    #[serde(rename = "StartTime")]
    pub start_time: String,

    #[serde(rename = "CompleteTime")]
    pub complete_time: String,

    #[serde(rename = "FaultStruct")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_struct: Option<FaultStruct>,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct TransferCompleteResponse {}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct FaultDetail {
    #[serde(rename(serialize = "cwmp:Fault", deserialize = "Fault"))]
    pub fault: FaultStruct,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct Fault {
    #[serde(rename = "faultcode")]
    pub faultcode: String,

    #[serde(rename = "faultstring")]
    pub faultstring: String,

    #[serde(rename = "detail")]
    pub detail: FaultDetail,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
pub struct Body {
    #[serde(rename(serialize = "cwmp:Inform", deserialize = "Inform"))]
    #[serde(default)]
    pub inform: Vec<Inform>,

    #[serde(rename(serialize = "cwmp:InformResponse", deserialize = "InformResponse"))]
    #[serde(default)]
    pub inform_response: Vec<InformResponse>,

    #[serde(rename(serialize = "cwmp:GetParameterNames", deserialize = "GetParameterNames"))]
    #[serde(default)]
    pub gpn: Vec<GetParameterNames>,

    #[serde(rename(
        serialize = "cwmp:GetParameterNamesResponse",
        deserialize = "GetParameterNamesResponse"
    ))]
    #[serde(default)]
    pub gpn_response: Vec<GetParameterNamesResponse>,

    #[serde(rename(serialize = "cwmp:GetParameterValues", deserialize = "GetParameterValues"))]
    #[serde(default)]
    pub gpv: Vec<GetParameterValues>,

    #[serde(rename(
        serialize = "cwmp:GetParameterValuesResponse",
        deserialize = "GetParameterValuesResponse"
    ))]
    #[serde(default)]
    pub gpv_response: Vec<GetParameterValuesResponse>,

    #[serde(rename(serialize = "cwmp:SetParameterValues", deserialize = "SetParameterValues"))]
    #[serde(default)]
    pub spv: Vec<SetParameterValues>,

    #[serde(rename(
        serialize = "cwmp:SetParameterValuesResponse",
        deserialize = "SetParameterValuesResponse"
    ))]
    #[serde(default)]
    pub spv_response: Vec<SetParameterValuesResponse>,

    #[serde(rename(serialize = "cwmp:AddObject", deserialize = "AddObject"))]
    #[serde(default)]
    pub add_object: Vec<AddObject>,

    #[serde(rename(serialize = "cwmp:AddObjectResponse", deserialize = "AddObjectResponse"))]
    #[serde(default)]
    pub add_object_response: Vec<AddObjectResponse>,

    #[serde(rename(serialize = "cwmp:DeleteObject", deserialize = "DeleteObject"))]
    #[serde(default)]
    pub delete_object: Vec<DeleteObject>,

    #[serde(rename(
        serialize = "cwmp:DeleteObjectResponse",
        deserialize = "DeleteObjectResponse"
    ))]
    #[serde(default)]
    pub delete_object_response: Vec<DeleteObjectResponse>,

    #[serde(rename(serialize = "cwmp:Download", deserialize = "Download"))]
    #[serde(default)]
    pub download: Vec<Download>,

    #[serde(rename(serialize = "cwmp:DownloadResponse", deserialize = "DownloadResponse"))]
    #[serde(default)]
    pub download_response: Vec<DownloadResponse>,

    #[serde(rename(serialize = "cwmp:Reboot", deserialize = "Reboot"))]
    #[serde(default)]
    pub reboot: Vec<Reboot>,

    #[serde(rename(serialize = "cwmp:RebootResponse", deserialize = "RebootResponse"))]
    #[serde(default)]
    pub reboot_response: Vec<RebootResponse>,

    #[serde(rename(serialize = "cwmp:FactoryReset", deserialize = "FactoryReset"))]
    #[serde(default)]
    pub factory_reset: Vec<FactoryReset>,

    #[serde(rename(
        serialize = "cwmp:FactoryResetResponse",
        deserialize = "FactoryResetResponse"
    ))]
    #[serde(default)]
    pub factory_reset_response: Vec<FactoryResetResponse>,

    #[serde(rename(serialize = "cwmp:TransferComplete", deserialize = "TransferComplete"))]
    #[serde(default)]
    pub transfer_complete: Vec<TransferComplete>,

    #[serde(rename(
        serialize = "cwmp:TransferCompleteResponse",
        deserialize = "TransferCompleteResponse"
    ))]
    #[serde(default)]
    pub transfer_complete_response: Vec<TransferCompleteResponse>,

    #[serde(rename(serialize = "soap-env:Fault", deserialize = "Fault"))]
    #[serde(default)]
    pub fault: Vec<Fault>,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename(serialize = "soap-env:Envelope", deserialize = "Envelope"))]
pub struct Envelope {
    #[serde(rename = "@xmlns:soap-enc")]
    #[serde(default)]
    xmlns_soap_enc: String,

    #[serde(rename = "@xmlns:soap-env")]
    #[serde(default)]
    xmlns_soap_env: String,

    #[serde(rename = "@xmlns:xsd")]
    #[serde(default)]
    xmlns_xsd: String,

    #[serde(rename = "@xmlns:xsi")]
    #[serde(default)]
    xmlns_xsi: String,

    #[serde(rename = "@xmlns:cwmp")]
    #[serde(default)]
    xmlns_cwmp: String,

    #[serde(rename(serialize = "soap-env:Header", deserialize = "Header"))]
    #[serde(default)]
    pub header: Header,

    #[serde(rename(serialize = "soap-env:Body", deserialize = "Body"))]
    #[serde(default)]
    pub body: Body,
}

impl Envelope {
    pub fn new(id: &str) -> Self {
        let mut root = Self::default();
        root.header.id.text = String::from(id);
        root.header.id.must_understand = String::from("1");
        root.xmlns_soap_enc = String::from("http://schemas.xmlsoap.org/soap/encoding/");
        root.xmlns_soap_env = String::from("http://schemas.xmlsoap.org/soap/envelope/");
        root.xmlns_xsd = String::from("http://www.w3.org/2001/XMLSchema");
        root.xmlns_xsi = String::from("http://www.w3.org/2001/XMLSchema-instance");
        root.xmlns_cwmp = String::from("urn:dslforum-org:cwmp-1-0");
        root
    }

    /// Envelope carrying a CWMP fault, the only SOAP fault shape the CPE emits.
    pub fn fault(id: &str, fault_code: u32, fault_string: &str) -> Self {
        let mut root = Self::new(id);
        root.body.fault.push(Fault {
            faultcode: String::from("Client"),
            faultstring: String::from("CWMP fault"),
            detail: FaultDetail {
                fault: FaultStruct {
                    fault_code: fault_code.to_string(),
                    fault_string: String::from(fault_string),
                },
            },
        });
        root
    }

    pub fn id(self: &Self) -> &str {
        &self.header.id.text
    }

    pub fn add_inform(self: &mut Self, inform: Inform) -> &mut Inform {
        self.body.inform.push(inform);
        self.body.inform.last_mut().unwrap()
    }

    pub fn add_transfer_complete(self: &mut Self, tc: TransferComplete) -> &mut TransferComplete {
        self.body.transfer_complete.push(tc);
        self.body.transfer_complete.last_mut().unwrap()
    }

    pub fn to_xml(self: &Self) -> Result<String> {
        let body = quick_xml::se::to_string(self)?;
        Ok(format!("{}{}", XML_DECLARATION, body))
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match quick_xml::se::to_string(self) {
            Ok(xml) => f.write_str(&xml),
            Err(_) => f.write_str("<envelope>"),
        }
    }
}

pub fn parse(xml: &str) -> Result<Envelope> {
    let envelope: Envelope = quick_xml::de::from_str(xml)?;
    Ok(envelope)
}

/// Local name of the first element under `Body`, or `None` for an envelope
/// without any body element. Namespace prefixes vary between ACS vendors so
/// the scan compares local names only.
pub fn method_name(xml: &str) -> Result<Option<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut in_body = false;
    loop {
        match reader.read_event()? {
            XmlEvent::Start(e) | XmlEvent::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if in_body {
                    return Ok(Some(name));
                }
                if name == "Body" {
                    in_body = true;
                }
            }
            XmlEvent::End(e) => {
                if in_body && e.local_name().as_ref() == b"Body" {
                    return Ok(None);
                }
            }
            XmlEvent::Eof => {
                return Ok(None);
            }
            _ => {}
        }
    }
}

/// TR-069 booleans come in both spellings.
pub fn parse_bool(text: &str) -> bool {
    matches!(text.trim(), "1" | "true" | "TRUE" | "True")
}
