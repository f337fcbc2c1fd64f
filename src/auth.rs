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
use base64::Engine;
use digest_auth::{AuthContext, HttpMethod, WwwAuthenticateHeader};
use eyre::Result;

pub fn basic(username: &str, password: &str) -> String {
    let token = format!("{}:{}", username, password);
    let token64 = base64::engine::general_purpose::STANDARD.encode(&token);
    format!("Basic {}", token64)
}

/// Credential scope for one HTTP peer (the ACS, or a download server).
///
/// Until the peer sends a Digest challenge, requests carry a Basic header.
/// Once a challenge is cached, each `authorization()` call signs it again
/// with a strictly increasing nonce count; a fresh challenge resets the
/// count.
pub struct AuthState {
    username: String,
    password: String,
    challenge: Option<WwwAuthenticateHeader>,
}

impl AuthState {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: String::from(username),
            password: String::from(password),
            challenge: None,
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// Cache a `WWW-Authenticate: Digest ...` challenge. The nonce count
    /// restarts from zero for the new nonce.
    pub fn accept_challenge(&mut self, header: &str) -> Result<()> {
        self.challenge = Some(digest_auth::parse(header)?);
        Ok(())
    }

    pub fn nonce_count(&self) -> u32 {
        self.challenge.as_ref().map(|c| c.nc).unwrap_or(0)
    }

    /// `Authorization` header value for the next request, or `None` when the
    /// device has no username configured.
    pub fn authorization(
        &mut self,
        method: HttpMethod,
        uri: &str,
        body: Option<&[u8]>,
    ) -> Result<Option<String>> {
        if !self.has_credentials() {
            return Ok(None);
        }
        match self.challenge.as_mut() {
            Some(challenge) => {
                let context = AuthContext::new_with_method(
                    self.username.as_str(),
                    self.password.as_str(),
                    uri,
                    body,
                    method,
                );
                let answer = challenge.respond(&context)?;
                Ok(Some(answer.to_header_string()))
            }
            None => Ok(Some(basic(&self.username, &self.password))),
        }
    }

    /// Variant with a caller-chosen cnonce, for reproducible signatures.
    #[cfg(test)]
    pub fn authorization_with_cnonce(
        &mut self,
        method: HttpMethod,
        uri: &str,
        cnonce: &str,
    ) -> Result<Option<String>> {
        if !self.has_credentials() {
            return Ok(None);
        }
        match self.challenge.as_mut() {
            Some(challenge) => {
                let mut context = AuthContext::new_with_method(
                    self.username.as_str(),
                    self.password.as_str(),
                    uri,
                    None::<&[u8]>,
                    method,
                );
                context.set_custom_cnonce(String::from(cnonce));
                let answer = challenge.respond(&context)?;
                Ok(Some(answer.to_header_string()))
            }
            None => Ok(Some(basic(&self.username, &self.password))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header() {
        // base64("usertest:passtest")
        assert_eq!(
            basic("usertest", "passtest"),
            "Basic dXNlcnRlc3Q6cGFzc3Rlc3Q="
        );
    }

    #[test]
    fn test_no_credentials_no_header() {
        let mut auth = AuthState::new("", "");
        let header = auth
            .authorization(HttpMethod::POST, "/acs", None)
            .unwrap();
        assert_eq!(header, None);
    }

    #[test]
    fn test_basic_before_challenge() {
        let mut auth = AuthState::new("usertest", "passtest");
        let header = auth
            .authorization(HttpMethod::POST, "/acs", None)
            .unwrap()
            .unwrap();
        assert!(header.starts_with("Basic "));
    }

    #[test]
    fn test_digest_response_matches_rfc2617() {
        let mut auth = AuthState::new("usertest", "passtest");
        auth.accept_challenge("Digest realm=\"r\", nonce=\"n\", qop=\"auth\", algorithm=MD5")
            .unwrap();

        let cnonce = "0a4f113b0a4f113b";
        let header = auth
            .authorization_with_cnonce(HttpMethod::POST, "/acs", cnonce)
            .unwrap()
            .unwrap();

        let ha1 = format!("{:x}", md5::compute("usertest:r:passtest"));
        let ha2 = format!("{:x}", md5::compute("POST:/acs"));
        let expected = format!(
            "{:x}",
            md5::compute(format!("{}:n:00000001:{}:auth:{}", ha1, cnonce, ha2))
        );

        assert!(header.starts_with("Digest "));
        assert!(header.contains("username=\"usertest\""));
        assert!(header.contains("realm=\"r\""));
        assert!(header.contains("nonce=\"n\""));
        assert!(header.contains("uri=\"/acs\""));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains(&format!("response=\"{}\"", expected)));
    }

    #[test]
    fn test_nonce_count_monotonic_within_challenge() {
        let mut auth = AuthState::new("usertest", "passtest");
        auth.accept_challenge("Digest realm=\"r\", nonce=\"n\", qop=\"auth\", algorithm=MD5")
            .unwrap();

        let first = auth
            .authorization(HttpMethod::GET, "/file", None)
            .unwrap()
            .unwrap();
        let second = auth
            .authorization(HttpMethod::GET, "/file", None)
            .unwrap()
            .unwrap();
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
        assert_eq!(auth.nonce_count(), 2);

        // A fresh challenge restarts the count.
        auth.accept_challenge("Digest realm=\"r\", nonce=\"n2\", qop=\"auth\", algorithm=MD5")
            .unwrap();
        let third = auth
            .authorization(HttpMethod::GET, "/file", None)
            .unwrap()
            .unwrap();
        assert!(third.contains("nc=00000001"));
    }
}
