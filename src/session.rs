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
use rand::{thread_rng, Rng};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth::AuthState;
use crate::config::Config;
use crate::device::{Device, TransferRecord};
use crate::rpc;
use crate::soap;
use crate::transport::Transport;

pub const TRANSFER_COMPLETE_EVENT: &str = "7 TRANSFER COMPLETE";

/// Download the session engine can cancel on Reboot.
pub struct ActiveDownload {
    pub token: CancellationToken,
    pub command_key: String,
    pub start_time: String,
}

/// Deferred session entry armed by the Reboot handler.
pub struct Continuation {
    pub events: String,
    pub delay: Duration,
}

/// Session-engine state shared with the downloader and the
/// connection-request listener.
pub struct Flags {
    pub session_in_progress: bool,
    pub pending_inform: bool,
    pub pending_events: Option<String>,
    pub accept_connections: bool,
    pub pending_reboot: bool,
    pub firmware_upgrade: bool,
    pub transfer_complete_session: bool,
    pub download_in_progress: bool,
    pub active_download: Option<ActiveDownload>,
    pub reboot_continuation: Option<Continuation>,
    pub inform_timer: Option<JoinHandle<()>>,
    pub timer_generation: u64,
}

impl Flags {
    fn new() -> Self {
        Self {
            session_in_progress: false,
            pending_inform: false,
            pending_events: None,
            accept_connections: true,
            pending_reboot: false,
            firmware_upgrade: false,
            transfer_complete_session: false,
            download_in_progress: false,
            active_download: None,
            reboot_continuation: None,
            inform_timer: None,
            timer_generation: 0,
        }
    }
}

/// An armed inform timer sends one of these; the generation lets the engine
/// drop timers that were superseded while the message sat in the queue.
pub struct Trigger {
    pub generation: u64,
    pub events: Option<String>,
}

/// The whole simulated CPE: configuration, parameter store and session
/// flags. One process owns exactly one of these.
pub struct Simulator {
    pub config: Config,
    pub device: RwLock<Device>,
    pub flags: RwLock<Flags>,
    events: mpsc::Sender<Trigger>,
}

impl Simulator {
    pub fn new(config: Config, device: Device) -> (Arc<Self>, mpsc::Receiver<Trigger>) {
        let (tx, rx) = mpsc::channel(8);
        let simulator = Arc::new(Self {
            config,
            device: RwLock::new(device),
            flags: RwLock::new(Flags::new()),
            events: tx,
        });
        (simulator, rx)
    }

    /// Arm the inform timer, replacing whatever was armed before. Timers are
    /// the only source of session entry.
    pub async fn schedule_inform(self: &Arc<Self>, delay: Duration, events: Option<String>) {
        let mut flags = self.flags.write().await;
        if let Some(timer) = flags.inform_timer.take() {
            timer.abort();
        }
        flags.timer_generation += 1;
        let generation = flags.timer_generation;
        let tx = self.events.clone();
        debug!("next inform in {:?}, events {:?}", delay, events);
        flags.inform_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Trigger { generation, events }).await;
        }));
    }

    /// Refuse connection-requests and inbound RPCs until the stop window is
    /// over.
    pub async fn stop_session_window(self: &Arc<Self>) {
        let window = Duration::from_millis(self.config.stop_window_ms);
        self.flags.write().await.accept_connections = false;
        info!("stop window: refusing connections for {:?}", window);
        let simulator = self.clone();
        tokio::spawn(async move {
            sleep(window).await;
            simulator.flags.write().await.accept_connections = true;
            debug!("stop window over");
        });
    }

    /// File a transfer outcome and make sure a session delivers it: in
    /// 500 ms, or right after the current session when one is running.
    pub async fn queue_transfer_complete(self: &Arc<Self>, record: TransferRecord) {
        info!(
            "transfer {} settled, fault_code={:?}",
            record.command_key, record.fault_code
        );
        let in_session = {
            let mut flags = self.flags.write().await;
            self.device.write().await.transfers.push_back(record);
            if flags.session_in_progress {
                flags.pending_inform = true;
                flags.pending_events = Some(String::from(TRANSFER_COMPLETE_EVENT));
                true
            } else {
                false
            }
        };
        if !in_session {
            self.schedule_inform(
                Duration::from_millis(500),
                Some(String::from(TRANSFER_COMPLETE_EVENT)),
            )
            .await;
        }
    }
}

/// 8 characters of base-36, the request-id of every CPE-initiated envelope.
pub fn request_id() -> String {
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = thread_rng();
    (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Drives the CWMP state machine: Idle -> Informing -> Serving -> Closing.
/// Sessions run one at a time, inline in the event loop, so at most one ACS
/// request is ever outstanding.
pub struct Engine {
    sim: Arc<Simulator>,
    events: mpsc::Receiver<Trigger>,
}

impl Engine {
    pub fn new(sim: Arc<Simulator>, events: mpsc::Receiver<Trigger>) -> Self {
        Self { sim, events }
    }

    pub async fn run(mut self) {
        while let Some(trigger) = self.events.recv().await {
            let accept = {
                let flags = self.sim.flags.read().await;
                if trigger.generation != flags.timer_generation {
                    debug!("stale inform timer ignored");
                    continue;
                }
                flags.accept_connections
            };
            if !accept {
                // A stop window is open; try again once it must be over.
                let retry = Duration::from_millis(self.sim.config.stop_window_ms)
                    + Duration::from_secs(1);
                debug!("session trigger during stop window, retry in {:?}", retry);
                self.sim.schedule_inform(retry, trigger.events).await;
                continue;
            }
            if let Err(err) = self.run_session(trigger.events).await {
                error!("session aborted: {:#}", err);
            }
            self.close_session().await;
        }
    }

    async fn run_session(&mut self, events: Option<String>) -> Result<()> {
        {
            let mut flags = self.sim.flags.write().await;
            if let Some(timer) = flags.inform_timer.take() {
                timer.abort();
            }
            flags.session_in_progress = true;
            flags.pending_inform = false;
            flags.pending_events = None;
            flags.transfer_complete_session = false;
        }

        let request_id = request_id();
        info!("session {} start, events {:?}", request_id, events);

        let config = &self.sim.config;
        let mut transport = Transport::new(
            &config.acs_url,
            Duration::from_millis(config.session_timeout_ms),
        )?;
        let mut auth = {
            let device = self.sim.device.read().await;
            AuthState::new(&device.username, &device.password)
        };

        let mut envelope = soap::Envelope::new(&request_id);
        {
            let device = self.sim.device.read().await;
            envelope.add_inform(rpc::build_inform(&device, events.as_deref()));
        }

        let reply = transport.post(&mut auth, Some(envelope.to_xml()?)).await?;
        let xml = reply.ok_or_else(|| eyre!("ACS closed the session before InformResponse"))?;
        let response = soap::parse(&xml).wrap_err("unparseable ACS response")?;
        if response.body.inform_response.is_empty() {
            return Err(eyre!("expected InformResponse from ACS"));
        }

        // At most one transfer outcome is delivered per session, in FIFO
        // order. The TransferCompleteResponse reply carries nothing to
        // dispatch.
        let record = self.sim.device.write().await.transfers.pop_front();
        if let Some(record) = record {
            self.sim.flags.write().await.transfer_complete_session = true;
            info!("TransferComplete for {}", record.command_key);
            let mut envelope = soap::Envelope::new(&request_id);
            envelope.add_transfer_complete(rpc::transfer_complete(&record));
            let _ = transport.post(&mut auth, Some(envelope.to_xml()?)).await?;
        }

        // An empty POST invites the next server RPC; an empty reply closes.
        let mut reply = transport.post(&mut auth, None).await?;
        while let Some(xml) = reply {
            match rpc::dispatch(&self.sim, &xml).await? {
                rpc::Outcome::Respond(body) => {
                    reply = transport.post(&mut auth, Some(body)).await?;
                }
                rpc::Outcome::CloseAfter(body) => {
                    let _ = transport.post(&mut auth, Some(body)).await;
                    break;
                }
            }
        }

        info!("session {} closed", request_id);
        Ok(())
    }

    /// Close bookkeeping: the keep-alive agent died with the transport; pick
    /// the continuation and re-arm the inform timer.
    async fn close_session(&mut self) {
        let sim = self.sim.clone();
        let stop_window = Duration::from_millis(sim.config.stop_window_ms);

        let mut flags = sim.flags.write().await;
        flags.session_in_progress = false;

        if flags.pending_reboot && flags.firmware_upgrade && flags.transfer_complete_session {
            flags.pending_reboot = false;
            flags.firmware_upgrade = false;
            flags.transfer_complete_session = false;
            flags.reboot_continuation = None;
            drop(flags);
            info!("firmware upgrade: applying image, reboot scheduled");
            sim.stop_session_window().await;
            sim.device.write().await.upgrade_software_version();
            sim.schedule_inform(
                stop_window + Duration::from_secs(1),
                Some(String::from("1 BOOT,M Download,4 VALUE CHANGE")),
            )
            .await;
        } else if flags.pending_reboot {
            flags.pending_reboot = false;
            let continuation = flags.reboot_continuation.take();
            drop(flags);
            match continuation {
                // The Reboot handler armed the stop window already.
                Some(continuation) => {
                    sim.schedule_inform(continuation.delay, Some(continuation.events))
                        .await;
                }
                None => {
                    sim.stop_session_window().await;
                    sim.schedule_inform(
                        stop_window + Duration::from_secs(1),
                        Some(String::from("1 BOOT,M Reboot")),
                    )
                    .await;
                }
            }
        } else if flags.pending_inform {
            flags.pending_inform = false;
            let events = flags
                .pending_events
                .take()
                .unwrap_or_else(|| String::from("6 CONNECTION REQUEST"));
            drop(flags);
            sim.schedule_inform(Duration::from_secs(1), Some(events)).await;
        } else {
            drop(flags);
            let interval = sim
                .device
                .read()
                .await
                .periodic_inform_interval()
                .unwrap_or(sim.config.periodic_inform_interval_s);
            sim.schedule_inform(Duration::from_secs(interval), None).await;
        }
    }
}
