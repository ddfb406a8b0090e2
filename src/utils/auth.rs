//! HTTP Basic and Digest authentication primitives
//!
//! Used on both sides of the agent: verifying ACS connection requests on the
//! local listener and answering Digest challenges from the ACS itself.

use base64::Engine;
use md5::{Digest, Md5};
use rand::RngCore;

use crate::utils::time::epoch_now;

/// Realm presented in connection-request challenges.
pub const REALM: &str = "redfire-cwmp";

/// Opaque value carried through Digest challenges.
pub const OPAQUE: &str = "f81b1e4a0d7e9c35";

/// How long a minted nonce stays acceptable, in seconds.
pub const NONCE_WINDOW_SECS: i64 = 300;

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a `Authorization: Basic <b64>` credential against the configured
/// username and password.
pub fn basic_check(b64_credentials: &str, username: &str, password: &str) -> bool {
    let decoded = match base64::engine::general_purpose::STANDARD.decode(b64_credentials.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let decoded = match String::from_utf8(decoded) {
        Ok(s) => s,
        Err(_) => return false,
    };
    match decoded.split_once(':') {
        Some((user, pass)) => user == username && pass == password,
        None => false,
    }
}

/// Build the challenge line for a failed Basic authentication.
pub fn basic_challenge() -> String {
    format!("WWW-Authenticate: Basic realm=\"{}\"", REALM)
}

/// Parse the comma-separated `k=v` / `k="v"` parameter list of a Digest
/// header into (key, value) pairs.
pub fn parse_digest_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let eq = match rest.find('=') {
            Some(i) => i,
            None => break,
        };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = match stripped.find('"') {
                Some(i) => i,
                None => break,
            };
            value = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }
        if !key.is_empty() {
            params.push((key, value));
        }
    }
    params
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Server-side Digest gate for the connection-request listener. Nonces are
/// minted from a per-process random key and expire after [`NONCE_WINDOW_SECS`].
pub struct DigestGate {
    key: [u8; 16],
}

impl DigestGate {
    pub fn new() -> Self {
        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    fn nonce_for(&self, stamp: i64) -> String {
        let proof = md5_hex(&format!("{}:{}", stamp, hex::encode(self.key)));
        format!("{}-{}", stamp, proof)
    }

    pub fn mint_nonce(&self) -> String {
        self.nonce_for(epoch_now())
    }

    fn nonce_valid(&self, nonce: &str) -> bool {
        let (stamp, _) = match nonce.split_once('-') {
            Some(parts) => parts,
            None => return false,
        };
        let stamp: i64 = match stamp.parse() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let age = epoch_now() - stamp;
        if !(0..=NONCE_WINDOW_SECS).contains(&age) {
            return false;
        }
        self.nonce_for(stamp) == nonce
    }

    /// Build the challenge line for a failed Digest authentication.
    pub fn challenge(&self) -> String {
        format!(
            "WWW-Authenticate: Digest realm=\"{}\", qop=\"auth\", nonce=\"{}\", opaque=\"{}\"",
            REALM,
            self.mint_nonce(),
            OPAQUE
        )
    }

    /// Verify an `Authorization: Digest <params>` credential for the given
    /// request method and URI.
    pub fn check(
        &self,
        method: &str,
        uri: &str,
        header_params: &str,
        username: &str,
        password: &str,
    ) -> bool {
        let params = parse_digest_params(header_params);

        if param(&params, "username") != Some(username) {
            return false;
        }
        if param(&params, "realm") != Some(REALM) {
            return false;
        }
        let nonce = match param(&params, "nonce") {
            Some(n) => n,
            None => return false,
        };
        if !self.nonce_valid(nonce) {
            return false;
        }
        let response = match param(&params, "response") {
            Some(r) => r,
            None => return false,
        };
        let digest_uri = param(&params, "uri").unwrap_or(uri);

        let ha1 = md5_hex(&format!("{}:{}:{}", username, REALM, password));
        let ha2 = md5_hex(&format!("{}:{}", method, digest_uri));

        let expected = match param(&params, "qop") {
            Some(qop) if qop.eq_ignore_ascii_case("auth") => {
                let nc = param(&params, "nc").unwrap_or("");
                let cnonce = param(&params, "cnonce").unwrap_or("");
                md5_hex(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
            }
            _ => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
        };

        expected == response
    }
}

impl Default for DigestGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Client side: answer a `WWW-Authenticate: Digest ...` challenge from the
/// ACS with an `Authorization` header value.
pub struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop_auth: bool,
    nc: u32,
}

impl DigestChallenge {
    /// Parse the parameter list following `Digest ` in a challenge header.
    pub fn parse(challenge_params: &str) -> Option<Self> {
        let params = parse_digest_params(challenge_params);
        let realm = param(&params, "realm")?.to_string();
        let nonce = param(&params, "nonce")?.to_string();
        let opaque = param(&params, "opaque").map(str::to_string);
        let qop_auth = param(&params, "qop")
            .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false);
        Some(Self {
            realm,
            nonce,
            opaque,
            qop_auth,
            nc: 0,
        })
    }

    /// Compute the `Authorization: Digest ...` value for one request.
    pub fn respond(&mut self, method: &str, uri: &str, username: &str, password: &str) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
            username, self.realm, self.nonce, uri
        );

        if self.qop_auth {
            self.nc += 1;
            let nc = format!("{:08x}", self.nc);
            let mut cnonce_bytes = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut cnonce_bytes);
            let cnonce = hex::encode(cnonce_bytes);
            let response = md5_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            ));
            header.push_str(&format!(
                ", qop=auth, nc={}, cnonce=\"{}\", response=\"{}\"",
                nc, cnonce, response
            ));
        } else {
            let response = md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2));
            header.push_str(&format!(", response=\"{}\"", response));
        }

        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }

        header
    }
}

/// Build the `Authorization: Basic ...` value.
pub fn basic_credentials(username: &str, password: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", username, password));
    format!("Basic {}", token)
}
