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
use std::sync::Arc;
use eyre::{eyre, Result, WrapErr};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::device::{Device, TransferRecord, INFORM_PARAMS};
use crate::download;
use crate::session::{Continuation, Simulator};
use crate::soap;

/// What the session loop does with a handler's reply.
pub enum Outcome {
    /// Send the envelope and dispatch the ACS's next reply.
    Respond(String),
    /// Send the envelope, then destroy the keep-alive connection.
    CloseAfter(String),
}

pub fn now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn build_inform(device: &Device, events: Option<&str>) -> soap::Inform {
    let mut inform = soap::Inform {
        device_id: soap::DeviceId {
            manufacturer: device.identity.manufacturer.clone(),
            oui: device.identity.oui.clone(),
            product_class: device.identity.product_class.clone(),
            serial_number: device.identity.serial_number.clone(),
        },
        max_envelopes: 1,
        current_time: now_iso(),
        retry_count: 0,
        ..Default::default()
    };
    for code in events.unwrap_or("2 PERIODIC").split(',') {
        inform.event.push(code, "");
    }
    for name in INFORM_PARAMS {
        if let Some(param) = device.get(name) {
            inform
                .parameter_list
                .push(soap::ParameterValue::new(name, &param.xsd_type, &param.value));
        }
    }
    inform
}

pub fn transfer_complete(record: &TransferRecord) -> soap::TransferComplete {
    soap::TransferComplete {
        command_key: record.command_key.clone(),
        start_time: record.start_time.clone(),
        complete_time: now_iso(),
        fault_struct: record.is_fault().then(|| soap::FaultStruct {
            fault_code: record.fault_code.clone(),
            fault_string: record.fault_string.clone(),
        }),
    }
}

/// Identify the CWMP method in an inbound envelope, run its handler and wrap
/// the reply with the ACS's request-id.
pub async fn dispatch(sim: &Arc<Simulator>, xml: &str) -> Result<Outcome> {
    let envelope = soap::parse(xml).wrap_err("unparseable ACS RPC")?;
    let id = envelope.id().to_string();
    let method = soap::method_name(xml)?
        .ok_or_else(|| eyre!("non-empty ACS response without a body element"))?;

    if !sim.flags.read().await.accept_connections {
        info!("{} refused, device not ready", method);
        let fault = soap::Envelope::fault(&id, 9002, "Device not ready to accept requests");
        return Ok(Outcome::CloseAfter(fault.to_xml()?));
    }

    let response = match method.as_str() {
        "GetParameterNames" => get_parameter_names(sim, &id, &envelope).await,
        "GetParameterValues" => get_parameter_values(sim, &id, &envelope).await,
        "SetParameterValues" => set_parameter_values(sim, &id, &envelope).await,
        "AddObject" => add_object(sim, &id, &envelope).await,
        "DeleteObject" => delete_object(sim, &id, &envelope).await,
        "Download" => download::handle(sim, &id, &envelope).await,
        "Reboot" => reboot(sim, &id).await,
        "FactoryReset" => factory_reset(&id),
        _ => {
            warn!("unsupported method {}", method);
            soap::Envelope::fault(&id, 9000, "Method not supported")
        }
    };
    Ok(Outcome::Respond(response.to_xml()?))
}

async fn get_parameter_names(sim: &Arc<Simulator>, id: &str, envelope: &soap::Envelope) -> soap::Envelope {
    let Some(request) = envelope.body.gpn.first() else {
        return soap::Envelope::fault(id, 9003, "Invalid arguments");
    };
    let next_level = soap::parse_bool(&request.next_level);

    let mut device = sim.device.write().await;
    let mut response = soap::GetParameterNamesResponse::default();
    for (name, writable) in device.parameter_names(&request.parameter_path, next_level) {
        response.parameter_list.push(&name, writable);
    }

    let mut reply = soap::Envelope::new(id);
    reply.body.gpn_response.push(response);
    reply
}

async fn get_parameter_values(sim: &Arc<Simulator>, id: &str, envelope: &soap::Envelope) -> soap::Envelope {
    let Some(request) = envelope.body.gpv.first() else {
        return soap::Envelope::fault(id, 9003, "Invalid arguments");
    };

    let mut device = sim.device.write().await;
    let mut response = soap::GetParameterValuesResponse::default();
    for name in &request.parameter_names.string {
        if name.ends_with('.') {
            // Partial path: expand to every leaf underneath.
            for leaf in device.leaves_under(name) {
                if let Some(param) = device.get(&leaf) {
                    response.parameter_list.push(soap::ParameterValue::new(
                        &leaf,
                        &param.xsd_type,
                        &param.value,
                    ));
                }
            }
        } else if let Some(param) = device.get(name) {
            response.parameter_list.push(soap::ParameterValue::new(
                name,
                &param.xsd_type,
                &param.value,
            ));
        } else {
            warn!("GetParameterValues: unknown parameter {}", name);
        }
    }

    let mut reply = soap::Envelope::new(id);
    reply.body.gpv_response.push(response);
    reply
}

async fn set_parameter_values(sim: &Arc<Simulator>, id: &str, envelope: &soap::Envelope) -> soap::Envelope {
    let Some(request) = envelope.body.spv.first() else {
        return soap::Envelope::fault(id, 9003, "Invalid arguments");
    };

    let mut device = sim.device.write().await;
    for pv in &request.parameter_list.parameter_values {
        if !device.set_value(&pv.name, &pv.value.text, &pv.value.xsi_type) {
            warn!("SetParameterValues: unknown parameter {}", pv.name);
        }
    }

    let mut reply = soap::Envelope::new(id);
    reply
        .body
        .spv_response
        .push(soap::SetParameterValuesResponse { status: 0 });
    reply
}

async fn add_object(sim: &Arc<Simulator>, id: &str, envelope: &soap::Envelope) -> soap::Envelope {
    let Some(request) = envelope.body.add_object.first() else {
        return soap::Envelope::fault(id, 9003, "Invalid arguments");
    };
    if !request.object_name.ends_with('.') {
        return soap::Envelope::fault(id, 9003, "Invalid arguments - ObjectName must end with a dot");
    }

    let instance = sim.device.write().await.add_object(&request.object_name);
    info!("AddObject {} -> instance {}", request.object_name, instance);

    let mut reply = soap::Envelope::new(id);
    reply.body.add_object_response.push(soap::AddObjectResponse {
        instance_number: instance,
        status: 0,
    });
    reply
}

async fn delete_object(sim: &Arc<Simulator>, id: &str, envelope: &soap::Envelope) -> soap::Envelope {
    let Some(request) = envelope.body.delete_object.first() else {
        return soap::Envelope::fault(id, 9003, "Invalid arguments");
    };

    sim.device.write().await.delete_object(&request.object_name);
    info!("DeleteObject {}", request.object_name);

    let mut reply = soap::Envelope::new(id);
    reply
        .body
        .delete_object_response
        .push(soap::DeleteObjectResponse { status: 0 });
    reply
}

/// Reboot aborts any running download (its outcome becomes a 9010
/// TransferComplete), opens the stop window and arms the continuation the
/// session close will schedule.
async fn reboot(sim: &Arc<Simulator>, id: &str) -> soap::Envelope {
    {
        let mut flags = sim.flags.write().await;
        if let Some(active) = flags.active_download.take() {
            active.token.cancel();
            flags.download_in_progress = false;
            sim.device.write().await.transfers.push_back(TransferRecord::fault(
                &active.command_key,
                &active.start_time,
                9010,
                "Download failure",
            ));
            info!("reboot: active download aborted");
        }
        flags.pending_reboot = true;
        flags.reboot_continuation = Some(Continuation {
            events: String::from("1 BOOT,M Reboot,4 VALUE CHANGE"),
            delay: Duration::from_millis(sim.config.stop_window_ms) + Duration::from_secs(10),
        });
    }
    sim.stop_session_window().await;

    let mut reply = soap::Envelope::new(id);
    reply.body.reboot_response.push(soap::RebootResponse::default());
    reply
}

fn factory_reset(id: &str) -> soap::Envelope {
    warn!("factory reset requested, exiting in 500ms");
    tokio::spawn(async {
        sleep(Duration::from_millis(500)).await;
        std::process::exit(0);
    });

    let mut reply = soap::Envelope::new(id);
    reply
        .body
        .factory_reset_response
        .push(soap::FactoryResetResponse::default());
    reply
}
