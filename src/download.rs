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
use digest_auth::HttpMethod;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::{self, AuthState};
use crate::device::TransferRecord;
use crate::session::{ActiveDownload, Simulator, TRANSFER_COMPLETE_EVENT};
use crate::soap;

pub const FILE_TYPES: [&str; 5] = [
    "1 Firmware Upgrade Image",
    "2 Web Content",
    "3 Vendor Configuration File",
    "4 Tone File",
    "5 Ringer File",
];

const MAX_AUTH_RETRIES: u32 = 5;

struct Job {
    command_key: String,
    url: String,
    username: String,
    password: String,
}

/// Download RPC entry point. Validation happens before the RPC response;
/// the transfer itself runs detached and reports through the
/// pending-transfers queue.
pub async fn handle(sim: &Arc<Simulator>, id: &str, envelope: &soap::Envelope) -> soap::Envelope {
    let Some(request) = envelope.body.download.first() else {
        return soap::Envelope::fault(id, 9003, "Invalid arguments");
    };
    if request.file_type.is_empty() {
        return soap::Envelope::fault(id, 9003, "Invalid arguments - FileType is required");
    }
    if !FILE_TYPES.contains(&request.file_type.as_str()) {
        return soap::Envelope::fault(id, 9003, "Invalid arguments - FileType is not recognized");
    }

    let firmware = request.file_type == FILE_TYPES[0];
    if firmware {
        let mut flags = sim.flags.write().await;
        if flags.download_in_progress {
            return soap::Envelope::fault(id, 9010, "File transfer already in progress");
        }
        flags.download_in_progress = true;
    }

    let start_time = crate::rpc::now_iso();

    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        // The transfer settles right away, as a fault.
        if firmware {
            sim.flags.write().await.download_in_progress = false;
        }
        sim.queue_transfer_complete(TransferRecord::fault(
            &request.command_key,
            &start_time,
            9016,
            "Invalid URL scheme",
        ))
        .await;
        return response(id);
    }

    let token = CancellationToken::new();
    {
        let mut flags = sim.flags.write().await;
        flags.active_download = Some(ActiveDownload {
            token: token.clone(),
            command_key: request.command_key.clone(),
            start_time: start_time.clone(),
        });
    }

    let job = Job {
        command_key: request.command_key.clone(),
        url: request.url.clone(),
        username: request.username.clone(),
        password: request.password.clone(),
    };
    info!("download {} started: {}", job.command_key, job.url);
    tokio::spawn(run(sim.clone(), job, token, firmware, start_time));

    response(id)
}

/// TR-069 deferred-confirmation form: the real outcome arrives later as a
/// TransferComplete.
fn response(id: &str) -> soap::Envelope {
    let mut envelope = soap::Envelope::new(id);
    envelope.body.download_response.push(soap::DownloadResponse {
        status: 1,
        start_time: String::from(soap::UNKNOWN_TIME),
        complete_time: String::from(soap::UNKNOWN_TIME),
    });
    envelope
}

async fn run(sim: Arc<Simulator>, job: Job, token: CancellationToken, firmware: bool, start_time: String) {
    let attempt_timeout = Duration::from_millis(sim.config.download_timeout_ms);
    let result = tokio::select! {
        // Reboot owns the transfer outcome when it cancels us.
        _ = token.cancelled() => {
            debug!("download {} cancelled", job.command_key);
            return;
        }
        result = fetch(&job, attempt_timeout) => result,
    };

    let record = match &result {
        Ok(()) => TransferRecord::success(&job.command_key, &start_time),
        Err(text) => TransferRecord::fault(&job.command_key, &start_time, 9010, text),
    };
    info!(
        "download {} settled: {}",
        job.command_key,
        if result.is_ok() { "ok" } else { "failed" }
    );

    // Settle under the flags lock so a concurrent Reboot cannot also file an
    // outcome for this transfer.
    let in_session = {
        let mut flags = sim.flags.write().await;
        if token.is_cancelled() {
            return;
        }
        flags.active_download = None;
        if firmware {
            flags.download_in_progress = false;
            if result.is_ok() {
                flags.pending_reboot = true;
                flags.firmware_upgrade = true;
            }
        }
        sim.device.write().await.transfers.push_back(record);
        if flags.session_in_progress {
            flags.pending_inform = true;
            flags.pending_events = Some(String::from(TRANSFER_COMPLETE_EVENT));
            true
        } else {
            false
        }
    };
    if !in_session {
        sim.schedule_inform(
            Duration::from_millis(500),
            Some(String::from(TRANSFER_COMPLETE_EVENT)),
        )
        .await;
    }
}

/// HTTP GET with Basic/Digest retries. The body is read to the end and
/// discarded. Errors carry the fault string for the 9010 TransferComplete.
async fn fetch(job: &Job, attempt_timeout: Duration) -> Result<(), String> {
    let url = reqwest::Url::parse(&job.url).map_err(|err| format!("Invalid URL: {}", err))?;
    let uri = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => String::from(url.path()),
    };
    let client = reqwest::Client::new();
    let mut auth = AuthState::new(&job.username, &job.password);
    let mut authorization: Option<String> = None;
    let mut cookies: Vec<String> = Vec::new();

    for _attempt in 0..=MAX_AUTH_RETRIES {
        let mut request = client.get(url.clone());
        if !cookies.is_empty() {
            request = request.header("Cookie", cookies.join("; "));
        }
        if let Some(header) = &authorization {
            request = request.header("Authorization", header.clone());
        }

        let attempt = async {
            let mut response = request.send().await?;
            let status = response.status().as_u16();
            let challenge = response
                .headers()
                .get("www-authenticate")
                .and_then(|value| value.to_str().ok())
                .map(String::from);
            let set_cookies: Vec<String> = response
                .headers()
                .get_all("set-cookie")
                .iter()
                .filter_map(|value| value.to_str().ok())
                .filter_map(|value| value.split(';').next())
                .map(|value| value.trim().to_string())
                .collect();
            if status == 200 {
                while let Some(_chunk) = response.chunk().await? {}
            }
            Ok::<_, reqwest::Error>((status, challenge, set_cookies))
        };
        let (status, challenge, set_cookies) = match timeout(attempt_timeout, attempt).await {
            Err(_) => return Err(String::from("Download timeout")),
            Ok(Err(err)) => return Err(err.to_string()),
            Ok(Ok(outcome)) => outcome,
        };

        // Unlike the session transport, cookies accumulate across retries.
        for cookie in set_cookies {
            if !cookies.contains(&cookie) {
                cookies.push(cookie);
            }
        }

        match status {
            200 => return Ok(()),
            401 => {
                let Some(challenge) = challenge else {
                    return Err(String::from("Server returned code 401"));
                };
                let header = if challenge.trim_start().starts_with("Digest") {
                    auth.accept_challenge(&challenge).map_err(|err| err.to_string())?;
                    auth.authorization(HttpMethod::GET, &uri, None)
                        .map_err(|err| err.to_string())?
                } else if auth.has_credentials() {
                    Some(auth::basic(&job.username, &job.password))
                } else {
                    None
                };
                match header {
                    Some(header) => authorization = Some(header),
                    None => return Err(String::from("Server returned code 401")),
                }
            }
            code => return Err(format!("Server returned code {}", code)),
        }
    }
    Err(String::from("Too many attempts"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn test_simulator() -> Arc<Simulator> {
        let mut config = Config::default();
        config.download_timeout_ms = 2000;
        let device = model::load(&config).unwrap();
        Simulator::new(config, device).0
    }

    fn download_envelope(file_type: &str, url: &str) -> soap::Envelope {
        let mut envelope = soap::Envelope::new("dl");
        envelope.body.download.push(soap::Download {
            command_key: String::from("ck-test"),
            file_type: String::from(file_type),
            url: String::from(url),
            ..Default::default()
        });
        envelope
    }

    async fn read_headers(stream: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            data.extend_from_slice(&buf[..n]);
            if data.windows(4).any(|w| w == b"\r\n\r\n") {
                return String::from_utf8_lossy(&data).into_owned();
            }
        }
    }

    #[tokio::test]
    async fn test_missing_file_type_is_9003() {
        let sim = test_simulator().await;
        let request = download_envelope("", "http://127.0.0.1:1/fw.bin");
        let reply = handle(&sim, "1", &request).await;
        let fault = &reply.body.fault.first().unwrap().detail.fault;
        assert_eq!(fault.fault_code, "9003");
        assert_eq!(fault.fault_string, "Invalid arguments - FileType is required");
    }

    #[tokio::test]
    async fn test_unrecognized_file_type_is_9003() {
        let sim = test_simulator().await;
        let request = download_envelope("6 Stored Firmware Image", "http://127.0.0.1:1/fw.bin");
        let reply = handle(&sim, "1", &request).await;
        let fault = &reply.body.fault.first().unwrap().detail.fault;
        assert_eq!(fault.fault_code, "9003");
    }

    #[tokio::test]
    async fn test_second_firmware_download_is_9010() {
        let sim = test_simulator().await;
        sim.flags.write().await.download_in_progress = true;
        let request = download_envelope(FILE_TYPES[0], "http://127.0.0.1:1/fw.bin");
        let reply = handle(&sim, "1", &request).await;
        let fault = &reply.body.fault.first().unwrap().detail.fault;
        assert_eq!(fault.fault_code, "9010");
        assert_eq!(fault.fault_string, "File transfer already in progress");
    }

    #[tokio::test]
    async fn test_bad_scheme_queues_9016_but_answers_status_1() {
        let sim = test_simulator().await;
        let request = download_envelope(FILE_TYPES[0], "ftp://host/fw.bin");
        let reply = handle(&sim, "1", &request).await;

        let response = reply.body.download_response.first().unwrap();
        assert_eq!(response.status, 1);
        assert_eq!(response.start_time, soap::UNKNOWN_TIME);

        let mut flags = sim.flags.write().await;
        assert!(!flags.download_in_progress);
        // TransferComplete session armed.
        assert!(flags.inform_timer.is_some());
        if let Some(timer) = flags.inform_timer.take() {
            timer.abort();
        }
        drop(flags);

        let device = sim.device.read().await;
        let record = device.transfers.front().unwrap();
        assert_eq!(record.fault_code, "9016");
        assert_eq!(record.fault_string, "Invalid URL scheme");
    }

    #[tokio::test]
    async fn test_fetch_success_discards_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_headers(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\nfirmware",
                )
                .await
                .unwrap();
        });

        let job = Job {
            command_key: String::from("ck"),
            url: format!("http://{}/fw.bin", addr),
            username: String::new(),
            password: String::new(),
        };
        assert_eq!(fetch(&job, Duration::from_secs(2)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_fetch_basic_auth_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let first = read_headers(&mut stream).await;
            assert!(!first.to_lowercase().contains("authorization:"));
            stream
                .write_all(
                    b"HTTP/1.1 401 Unauthorized\r\n\
                      WWW-Authenticate: Basic realm=\"files\"\r\n\
                      Set-Cookie: dl=1; Path=/\r\n\
                      Content-Length: 0\r\nConnection: close\r\n\r\n",
                )
                .await
                .unwrap();
            drop(stream);

            let (mut stream, _) = listener.accept().await.unwrap();
            let second = read_headers(&mut stream).await;
            assert!(second.to_lowercase().contains("authorization: basic "));
            assert!(second.to_lowercase().contains("cookie: dl=1"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await
                .unwrap();
        });

        let job = Job {
            command_key: String::from("ck"),
            url: format!("http://{}/fw.bin", addr),
            username: String::from("dluser"),
            password: String::from("dlpass"),
        };
        assert_eq!(fetch(&job, Duration::from_secs(2)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_headers(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                )
                .await
                .unwrap();
        });

        let job = Job {
            command_key: String::from("ck"),
            url: format!("http://{}/fw.bin", addr),
            username: String::new(),
            password: String::new(),
        };
        assert_eq!(
            fetch(&job, Duration::from_secs(2)).await,
            Err(String::from("Server returned code 404"))
        );
    }

    #[tokio::test]
    async fn test_firmware_success_arms_reboot_flags() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_headers(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nblob",
                )
                .await
                .unwrap();
        });

        let sim = test_simulator().await;
        let request = download_envelope(FILE_TYPES[0], &format!("http://{}/fw.bin", addr));
        let reply = handle(&sim, "1", &request).await;
        assert_eq!(reply.body.download_response.first().unwrap().status, 1);

        // Wait for the detached worker to settle; the timer is armed last.
        for _ in 0..200 {
            if sim.flags.read().await.inform_timer.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut flags = sim.flags.write().await;
        assert!(flags.pending_reboot);
        assert!(flags.firmware_upgrade);
        assert!(!flags.download_in_progress);
        assert!(flags.active_download.is_none());
        assert!(flags.inform_timer.is_some());
        if let Some(timer) = flags.inform_timer.take() {
            timer.abort();
        }
        drop(flags);

        let device = sim.device.read().await;
        assert!(!device.transfers.front().unwrap().is_fault());
    }
}
