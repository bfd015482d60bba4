// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client-side SIP digest authentication (RFC 2617, RFC 7616).
//!
//! The bridge is always the authenticating party toward the PBX, so this
//! crate only implements the client half: consume a challenge, compute the
//! digest, render the Authorization header.

use sha2::{Digest, Sha256};
use sip_core::{generate_cnonce, DigestChallenge, Method};
use smol_str::SmolStr;

/// Digest hash algorithm. MD5 is what real trunks speak; SHA-256 servers
/// are accepted when the challenge asks for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "MD5" => Some(DigestAlgorithm::Md5),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }

    fn hash(&self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 => format!("{:x}", md5::compute(data)),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }
}

/// Generates Authorization header values for successive challenges.
///
/// The nonce-count is per nonce, as RFC 2617 §3.2.2 requires: it counts
/// requests made under one server nonce and restarts at 1 whenever the
/// server issues a fresh one.
pub struct DigestClient {
    username: SmolStr,
    password: SmolStr,
    nc: u32,
    nonce: Option<SmolStr>,
}

impl DigestClient {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: SmolStr::new(username),
            password: SmolStr::new(password),
            nc: 0,
            nonce: None,
        }
    }

    /// Answers a digest challenge for the given request method and URI,
    /// returning the full Authorization header value.
    pub fn authorization(&mut self, method: &Method, uri: &str, challenge: &DigestChallenge) -> String {
        let algorithm = challenge
            .algorithm
            .as_deref()
            .and_then(DigestAlgorithm::from_token)
            .unwrap_or_default();

        let qop_auth = challenge.offers_auth_qop();
        if self.nonce.as_ref() != Some(&challenge.nonce) {
            self.nonce = Some(challenge.nonce.clone());
            self.nc = 0;
        }
        self.nc = self.nc.wrapping_add(1);
        let nc_str = format!("{:08x}", self.nc);
        let cnonce = generate_cnonce();

        let response = compute_digest_response(
            algorithm,
            &self.username,
            &self.password,
            &challenge.realm,
            method,
            uri,
            &challenge.nonce,
            qop_auth.then(|| (nc_str.as_str(), cnonce.as_str())),
        );

        let mut auth = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            self.username, challenge.realm, challenge.nonce, uri, response, algorithm.as_str()
        );
        if qop_auth {
            auth.push_str(&format!(
                ", qop=auth, nc={}, cnonce=\"{}\"",
                nc_str, cnonce
            ));
        }
        if let Some(opaque) = &challenge.opaque {
            auth.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        auth
    }
}

/// Computes the digest response value.
///
/// HA1 = H(username:realm:password), HA2 = H(method:uri). With qop=auth the
/// response is H(HA1:nonce:nc:cnonce:auth:HA2), otherwise H(HA1:nonce:HA2).
#[allow(clippy::too_many_arguments)]
pub fn compute_digest_response(
    algorithm: DigestAlgorithm,
    username: &str,
    password: &str,
    realm: &str,
    method: &Method,
    uri: &str,
    nonce: &str,
    qop_auth: Option<(&str, &str)>,
) -> String {
    let ha1 = algorithm.hash(format!("{}:{}:{}", username, realm, password).as_bytes());
    let ha2 = algorithm.hash(format!("{}:{}", method.as_str(), uri).as_bytes());

    let final_input = match qop_auth {
        Some((nc, cnonce)) => format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2),
        None => format!("{}:{}:{}", ha1, nonce, ha2),
    };
    algorithm.hash(final_input.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_core::parse_digest_challenge;

    fn md5_hex(data: &str) -> String {
        format!("{:x}", md5::compute(data.as_bytes()))
    }

    #[test]
    fn digest_matches_reference_construction() {
        // Known vector: extension 30 registering against an Asterisk realm.
        let ha1 = md5_hex("30:asterisk:Twist@2025");
        let ha2 = md5_hex("REGISTER:sip:122.163.120.156");
        let expected = md5_hex(&format!("{}:1a2b3c:{}", ha1, ha2));

        let computed = compute_digest_response(
            DigestAlgorithm::Md5,
            "30",
            "Twist@2025",
            "asterisk",
            &Method::Register,
            "sip:122.163.120.156",
            "1a2b3c",
            None,
        );
        assert_eq!(computed, expected);
        assert_eq!(computed.len(), 32);
        assert!(computed.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn qop_auth_uses_eight_field_concatenation() {
        let ha1 = md5_hex("alice:example.com:secret");
        let ha2 = md5_hex("REGISTER:sip:example.com");
        let expected = md5_hex(&format!("{}:n0nce:00000001:deadbeef:auth:{}", ha1, ha2));

        let computed = compute_digest_response(
            DigestAlgorithm::Md5,
            "alice",
            "secret",
            "example.com",
            &Method::Register,
            "sip:example.com",
            "n0nce",
            Some(("00000001", "deadbeef")),
        );
        assert_eq!(computed, expected);
    }

    #[test]
    fn qop_auth_property_against_reference() {
        // A handful of random-ish triples checked against the straight-line
        // reference construction.
        let cases = [
            ("u1", "pw1", "realm-a", "nonce-a"),
            ("ext42", "S3cr3t!", "asterisk", "8f3a2b"),
            ("30", "Twist@2025", "asterisk", "1a2b3c"),
            ("long.user.name", "p@ss:with:colons", "sip.example.org", "zz9"),
        ];
        for (user, password, realm, nonce) in cases {
            let ha1 = md5_hex(&format!("{}:{}:{}", user, realm, password));
            let ha2 = md5_hex("REGISTER:sip:pbx");
            let expected =
                md5_hex(&format!("{}:{}:00000001:cafebabe:auth:{}", ha1, nonce, ha2));
            let computed = compute_digest_response(
                DigestAlgorithm::Md5,
                user,
                password,
                realm,
                &Method::Register,
                "sip:pbx",
                nonce,
                Some(("00000001", "cafebabe")),
            );
            assert_eq!(computed, expected, "mismatch for user {}", user);
        }
    }

    #[test]
    fn authorization_header_contains_required_fields() {
        let challenge = parse_digest_challenge(
            "Digest realm=\"asterisk\", nonce=\"1a2b3c\", qop=\"auth\", opaque=\"op\"",
        )
        .unwrap();
        let mut client = DigestClient::new("30", "Twist@2025");
        let auth = client.authorization(&Method::Register, "sip:122.163.120.156", &challenge);

        assert!(auth.starts_with("Digest "));
        assert!(auth.contains("username=\"30\""));
        assert!(auth.contains("realm=\"asterisk\""));
        assert!(auth.contains("nonce=\"1a2b3c\""));
        assert!(auth.contains("uri=\"sip:122.163.120.156\""));
        assert!(auth.contains("algorithm=MD5"));
        assert!(auth.contains("qop=auth"));
        assert!(auth.contains("nc=00000001"));
        assert!(auth.contains("cnonce=\""));
        assert!(auth.contains("opaque=\"op\""));
    }

    #[test]
    fn nonce_count_increments_under_one_nonce() {
        let challenge =
            parse_digest_challenge("Digest realm=\"r\", nonce=\"n\", qop=\"auth\"").unwrap();
        let mut client = DigestClient::new("u", "p");
        let first = client.authorization(&Method::Register, "sip:pbx", &challenge);
        let second = client.authorization(&Method::Register, "sip:pbx", &challenge);
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn fresh_nonce_restarts_nonce_count_at_one() {
        let first_challenge =
            parse_digest_challenge("Digest realm=\"r\", nonce=\"n1\", qop=\"auth\"").unwrap();
        let second_challenge =
            parse_digest_challenge("Digest realm=\"r\", nonce=\"n2\", qop=\"auth\"").unwrap();
        let mut client = DigestClient::new("u", "p");

        let first = client.authorization(&Method::Register, "sip:pbx", &first_challenge);
        assert!(first.contains("nonce=\"n1\""));
        assert!(first.contains("nc=00000001"));

        // A later re-challenge (registration refresh, post-failure retry)
        // carries a new server nonce; nc must not carry over.
        let second = client.authorization(&Method::Register, "sip:pbx", &second_challenge);
        assert!(second.contains("nonce=\"n2\""));
        assert!(
            second.contains("nc=00000001"),
            "nonce count must restart for a fresh nonce: {}",
            second
        );
    }

    #[test]
    fn no_qop_omits_qop_fields() {
        let challenge = parse_digest_challenge("Digest realm=\"r\", nonce=\"n\"").unwrap();
        let mut client = DigestClient::new("u", "p");
        let auth = client.authorization(&Method::Register, "sip:pbx", &challenge);
        assert!(!auth.contains("qop="));
        assert!(!auth.contains("cnonce="));
    }

    #[test]
    fn sha256_challenge_uses_sha256() {
        let challenge = parse_digest_challenge(
            "Digest realm=\"r\", nonce=\"n\", algorithm=SHA-256",
        )
        .unwrap();
        let mut client = DigestClient::new("u", "p");
        let auth = client.authorization(&Method::Register, "sip:pbx", &challenge);
        assert!(auth.contains("algorithm=SHA-256"));
        // SHA-256 responses are 64 hex chars.
        let response = auth
            .split("response=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap();
        assert_eq!(response.len(), 64);
    }
}
