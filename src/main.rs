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
use tokio::time::Duration;
use tracing::info;

mod auth;
mod config;
mod connreq;
mod device;
mod download;
mod model;
mod rpc;
mod session;
mod soap;
mod transport;

use crate::config::Config;
use crate::session::{Engine, Simulator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::load()?;
    info!(
        "simulating CPE {} against {}",
        config.serial_number, config.acs_url
    );

    let device = model::load(&config)?;
    let (sim, events) = Simulator::new(config, device);

    let (listener, url) = connreq::bind(&sim).await?;
    sim.device.write().await.set_connection_request_url(&url);
    info!("connection-request listener on {}", url);
    tokio::spawn(connreq::serve(sim.clone(), listener));

    sim.schedule_inform(Duration::ZERO, Some(String::from("1 BOOT")))
        .await;
    Engine::new(sim, events).run().await;
    Ok(())
}
