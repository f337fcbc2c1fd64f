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
use bytes::Bytes;
use eyre::{eyre, Result, WrapErr};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming as IncomingBody, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tracing::{debug, info};

use crate::session::Simulator;

/// Learn the local IP the ACS can reach us on: the source address of a
/// throwaway connection towards it.
async fn local_ip(acs_url: &str) -> Result<std::net::IpAddr> {
    let url = reqwest::Url::parse(acs_url).wrap_err("invalid ACS URL")?;
    let host = url.host_str().ok_or_else(|| eyre!("ACS URL has no host"))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let stream = TcpStream::connect((host, port))
        .await
        .wrap_err("cannot reach the ACS to learn the local address")?;
    Ok(stream.local_addr()?.ip())
}

/// Bind the connection-request listener on `ACS port + 1` and return it with
/// the URL to advertise in `ManagementServer.ConnectionRequestURL`.
pub async fn bind(sim: &Arc<Simulator>) -> Result<(TcpListener, String)> {
    let url = reqwest::Url::parse(&sim.config.acs_url)?;
    let port = url.port_or_known_default().unwrap_or(80) + 1;
    let ip = local_ip(&sim.config.acs_url).await?;
    let listener = TcpListener::bind((ip, port)).await?;
    let advertised = format!("http://{}:{}/", ip, port);
    Ok((listener, advertised))
}

/// Serve connection-requests forever. Any request triggers an out-of-cycle
/// session; sockets are dropped unanswered during a stop window.
pub async fn serve(sim: Arc<Simulator>, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!("connection-request accept failed: {:?}", err);
                continue;
            }
        };
        if !sim.flags.read().await.accept_connections {
            debug!("connection request from {} dropped during stop window", remote);
            continue;
        }

        let sim = sim.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |_req: Request<IncomingBody>| {
                let sim = sim.clone();
                async move {
                    trigger(&sim).await;
                    let reply: Response<Full<Bytes>> = Response::new(Full::new(Bytes::new()));
                    Ok::<_, std::convert::Infallible>(reply)
                }
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("connection-request error: {:?}", err);
            }
        });
    }
}

async fn trigger(sim: &Arc<Simulator>) {
    let mut flags = sim.flags.write().await;
    if flags.session_in_progress {
        // Collapses any number of pokes into one follow-up session.
        flags.pending_inform = true;
        info!("connection request during session, inform pending");
    } else {
        drop(flags);
        info!("connection request, starting session");
        sim.schedule_inform(Duration::ZERO, Some(String::from("6 CONNECTION REQUEST")))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model;

    async fn test_simulator() -> Arc<Simulator> {
        let config = Config::default();
        let device = model::load(&config).unwrap();
        Simulator::new(config, device).0
    }

    #[tokio::test]
    async fn test_trigger_idle_arms_immediate_session() {
        let sim = test_simulator().await;
        trigger(&sim).await;

        let mut flags = sim.flags.write().await;
        assert!(!flags.pending_inform);
        assert!(flags.inform_timer.is_some());
        if let Some(timer) = flags.inform_timer.take() {
            timer.abort();
        }
    }

    #[tokio::test]
    async fn test_trigger_during_session_sets_pending_inform() {
        let sim = test_simulator().await;
        sim.flags.write().await.session_in_progress = true;

        trigger(&sim).await;
        trigger(&sim).await;

        let flags = sim.flags.read().await;
        assert!(flags.pending_inform);
        assert!(flags.inform_timer.is_none());
    }

    #[tokio::test]
    async fn test_listener_answers_200() {
        let sim = test_simulator().await;
        sim.flags.write().await.session_in_progress = true;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(sim.clone(), listener));

        let response = reqwest::get(format!("http://{}/", addr)).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert!(sim.flags.read().await.pending_inform);
    }
}
