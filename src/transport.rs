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
use digest_auth::HttpMethod;
use eyre::{eyre, Result, WrapErr};
use tokio::time::Duration;
use tracing::debug;

use crate::auth::AuthState;

/// One keep-alive agent towards the ACS, created at session entry and
/// dropped at session close. A single connection is kept in the pool so at
/// most one ACS request is ever in flight.
pub struct Transport {
    client: reqwest::Client,
    url: reqwest::Url,
    uri: String,
    cookie: Option<String>,
}

impl Transport {
    pub fn new(acs_url: &str, session_timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(acs_url).wrap_err("invalid ACS URL")?;
        let uri = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => String::from(url.path()),
        };
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .timeout(session_timeout + Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url,
            uri,
            cookie: None,
        })
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// POST one SOAP envelope (or an empty body) and return the response
    /// body, `None` when the ACS answered with no content. A Digest
    /// challenge is answered once by retransmitting the identical body;
    /// every other non-2xx outcome is a fatal session error.
    pub async fn post(&mut self, auth: &mut AuthState, body: Option<String>) -> Result<Option<String>> {
        let payload = body.unwrap_or_default();
        let mut response = self.send(auth, &payload).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get("www-authenticate")
                .ok_or_else(|| eyre!("ACS replied 401 without WWW-Authenticate"))?
                .to_str()?
                .to_string();
            if !challenge.trim_start().starts_with("Digest") {
                return Err(eyre!("ACS replied 401 with non-digest challenge"));
            }
            debug!("digest challenge from ACS, retransmitting");
            auth.accept_challenge(&challenge)?;
            self.store_cookie(&response);
            response = self.send(auth, &payload).await?;
            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(eyre!("ACS rejected digest authorization"));
            }
        }

        if !response.status().is_success() {
            return Err(eyre!("ACS replied with status {}", response.status()));
        }
        self.store_cookie(&response);

        let text = response.text().await?;
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }

    async fn send(&self, auth: &mut AuthState, payload: &str) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .body(String::from(payload));
        if let Some(cookie) = &self.cookie {
            request = request.header("Cookie", cookie.clone());
        }
        if let Some(authorization) =
            auth.authorization(HttpMethod::POST, &self.uri, Some(payload.as_bytes()))?
        {
            request = request.header("Authorization", authorization);
        }
        Ok(request.send().await?)
    }

    /// The last response's cookies replace the stored value wholesale.
    fn store_cookie(&mut self, response: &reqwest::Response) {
        let cookies: Vec<String> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .map(|value| value.trim().to_string())
            .collect();
        if !cookies.is_empty() {
            self.cookie = Some(cookies.join("; "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// Read one HTTP/1.1 request off the stream: headers, then the body
    /// promised by Content-Length.
    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(pos) = text.find("\r\n\r\n") {
                let headers = &text[..pos].to_lowercase();
                let length: usize = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .map(|v| v.trim().parse().unwrap())
                    .unwrap_or(0);
                if data.len() >= pos + 4 + length {
                    return String::from_utf8_lossy(&data).into_owned();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_digest_retry_and_cookie() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));

        let seen_srv = seen.clone();
        tokio::spawn(async move {
            // First request: challenge + cookie, close the connection.
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            seen_srv.lock().await.push(request);
            stream
                .write_all(
                    b"HTTP/1.1 401 Unauthorized\r\n\
                      WWW-Authenticate: Digest realm=\"acs\", nonce=\"abc\", qop=\"auth\", algorithm=MD5\r\n\
                      Set-Cookie: session=deadbeef; Path=/\r\n\
                      Content-Length: 0\r\n\
                      Connection: close\r\n\r\n",
                )
                .await
                .unwrap();
            drop(stream);

            // Second request: authenticated retransmission.
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            seen_srv.lock().await.push(request);
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Length: 0\r\n\
                      Connection: close\r\n\r\n",
                )
                .await
                .unwrap();
        });

        let acs_url = format!("http://{}/acs", addr);
        let mut transport = Transport::new(&acs_url, Duration::from_secs(5)).unwrap();
        let mut auth = AuthState::new("usertest", "passtest");

        let reply = transport
            .post(&mut auth, Some(String::from("<x/>")))
            .await
            .unwrap();
        assert_eq!(reply, None);

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 2);
        // First attempt leads with Basic, the retry signs the challenge.
        assert!(seen[0].to_lowercase().contains("authorization: basic "));
        assert!(seen[1].to_lowercase().contains("authorization: digest "));
        assert!(seen[1].contains("nc=00000001"));
        assert!(seen[1].contains("uri=\"/acs\""));
        // The 401's cookie rides on the retry.
        assert!(seen[1].to_lowercase().contains("cookie: session=deadbeef"));
        assert_eq!(transport.cookie(), Some("session=deadbeef"));
        assert_eq!(auth.nonce_count(), 1);
    }

    #[tokio::test]
    async fn test_non_2xx_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 503 Service Unavailable\r\n\
                      Content-Length: 0\r\n\
                      Connection: close\r\n\r\n",
                )
                .await
                .unwrap();
        });

        let acs_url = format!("http://{}/acs", addr);
        let mut transport = Transport::new(&acs_url, Duration::from_secs(5)).unwrap();
        let mut auth = AuthState::new("usertest", "passtest");
        let result = transport.post(&mut auth, None).await;
        assert!(result.is_err());
    }
}
