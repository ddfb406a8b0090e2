//! HTTP client for ACS sessions
//!
//! One client per session: POSTs SOAP envelopes, follows a single 302/307
//! redirect by re-POSTing to the new location, negotiates Basic or Digest
//! from the server challenge and keeps cookies for session affinity. An
//! empty POST tells the ACS the CPE has nothing more to send.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::config::{AcsConfig, SslVerify};
use crate::utils::auth::{basic_credentials, DigestChallenge};
use crate::{Error, Result};

/// Per-POST timeout towards the ACS.
pub const ACS_TIMEOUT_SECS: u64 = 30;

enum AuthMode {
    None,
    Basic,
    Digest(DigestChallenge),
}

pub struct AcsClient {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
    auth: AuthMode,
}

impl AcsClient {
    /// Build the session client for the given working URL. Redirects are
    /// handled manually so a 307 re-POSTs the same body instead of being
    /// degraded to a GET.
    pub fn new(acs: &AcsConfig, url: &str) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(ACS_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .cookie_store(true)
            .user_agent(crate::DAEMON_NAME);

        if let Some(cert) = &acs.ssl_cert {
            let pem = std::fs::read(cert)?;
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::network(format!("bad ssl_cert: {}", e)))?;
            builder = builder.identity(identity);
        }
        if let Some(cacert) = &acs.ssl_cacert {
            let pem = std::fs::read(cacert)?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::network(format!("bad ssl_cacert: {}", e)))?;
            builder = builder.add_root_certificate(certificate);
        }
        if acs.ssl_verify == SslVerify::Disabled {
            warn!("ssl_verify: SSL certificate validation disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            client: builder.build()?,
            url: url.to_string(),
            username: acs.username.clone().unwrap_or_default(),
            password: acs.password.clone().unwrap_or_default(),
            auth: AuthMode::None,
        })
    }

    /// The working URL, including any redirect followed this session.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_uri(&self) -> String {
        match reqwest::Url::parse(&self.url) {
            Ok(url) => {
                let mut uri = url.path().to_string();
                if let Some(query) = url.query() {
                    uri.push('?');
                    uri.push_str(query);
                }
                uri
            }
            Err(_) => "/".to_string(),
        }
    }

    /// POST one message. `None` in means the empty "nothing more to send"
    /// POST; `None` out means the ACS answered with an empty 200 or a 204.
    pub async fn send(&mut self, body: Option<String>) -> Result<Option<String>> {
        let mut redirected = false;
        let mut challenged = false;

        match &body {
            Some(msg) => debug!("+++ SEND HTTP REQUEST +++\n{}", msg),
            None => debug!("+++ SEND EMPTY HTTP REQUEST +++"),
        }

        loop {
            let uri = self.request_uri();
            let mut request = self
                .client
                .post(&self.url)
                .header(CONTENT_TYPE, "text/xml; charset=\"utf-8\"");
            if body.is_some() {
                request = request.header("SOAPAction", "");
            }
            match &mut self.auth {
                AuthMode::None => {}
                AuthMode::Basic => {
                    request = request.header(
                        "Authorization",
                        basic_credentials(&self.username, &self.password),
                    );
                }
                AuthMode::Digest(challenge) => {
                    request = request.header(
                        "Authorization",
                        challenge.respond("POST", &uri, &self.username, &self.password),
                    );
                }
            }
            request = request.body(body.clone().unwrap_or_default());

            let response = request
                .send()
                .await
                .map_err(|e| Error::network(format!("POST to {} failed: {}", self.url, e)))?;

            let status = response.status();
            match status {
                StatusCode::FOUND | StatusCode::TEMPORARY_REDIRECT if !redirected => {
                    let location = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                        .ok_or_else(|| Error::network("redirect without a Location header"))?;
                    debug!("receiving http redirect to {}", location);
                    self.url = location;
                    redirected = true;
                }
                StatusCode::UNAUTHORIZED if !challenged => {
                    self.auth = self.pick_auth(response.headers())?;
                    challenged = true;
                }
                StatusCode::OK => {
                    let text = response
                        .text()
                        .await
                        .map_err(|e| Error::network(format!("cannot read ACS response: {}", e)))?;
                    if text.is_empty() {
                        debug!("+++ RECEIVED EMPTY HTTP RESPONSE +++");
                        return Ok(None);
                    }
                    debug!("+++ RECEIVED HTTP RESPONSE +++\n{}", text);
                    return Ok(Some(text));
                }
                StatusCode::NO_CONTENT => {
                    debug!("+++ RECEIVED EMPTY HTTP RESPONSE +++");
                    return Ok(None);
                }
                other => {
                    return Err(Error::network(format!(
                        "ACS answered {} to POST {}",
                        other, self.url
                    )))
                }
            }
        }
    }

    fn pick_auth(&self, headers: &reqwest::header::HeaderMap) -> Result<AuthMode> {
        for value in headers.get_all(WWW_AUTHENTICATE) {
            let value = match value.to_str() {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Some(params) = value.strip_prefix("Digest ") {
                let challenge = DigestChallenge::parse(params)
                    .ok_or_else(|| Error::auth("unparseable Digest challenge from the ACS"))?;
                return Ok(AuthMode::Digest(challenge));
            }
            if value.starts_with("Basic") {
                return Ok(AuthMode::Basic);
            }
        }
        Err(Error::auth("ACS requested an unsupported authentication scheme"))
    }
}
