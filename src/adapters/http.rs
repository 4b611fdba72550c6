//! HTTP client adapter.
//!
//! Implements [`HttpPort`]: one blocking `POST` of a JSON body, returning
//! the response body (at most [`MAX_RESPONSE_BYTES`]).  A non-2xx status
//! is an error; a 2xx with an empty body is `Ok(vec![])`.
//!
//! On target this is `EspHttpConnection` with the certificate bundle
//! attached so `https://` URLs work.  The simulation backend replays a
//! scripted queue of responses and records every request.

#[cfg(not(target_os = "espidf"))]
use std::collections::VecDeque;

use log::{debug, warn};

use crate::app::ports::{HttpPort, TransportError};

pub const MAX_RESPONSE_BYTES: usize = 4096;
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

/// One request as seen by the simulated server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub body: Vec<u8>,
}

pub struct HttpClient {
    #[cfg(not(target_os = "espidf"))]
    script: VecDeque<Result<Vec<u8>, TransportError>>,
    #[cfg(not(target_os = "espidf"))]
    requests: Vec<RecordedRequest>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            script: VecDeque::new(),
            #[cfg(not(target_os = "espidf"))]
            requests: Vec::new(),
        }
    }

    /// Queue the result of the next simulated request.  Requests with an
    /// empty script fail with `RequestFailed`.
    #[cfg(not(target_os = "espidf"))]
    pub fn sim_respond(&mut self, response: Result<Vec<u8>, TransportError>) {
        self.script.push_back(response);
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn sim_requests(&self) -> &[RecordedRequest] {
        &self.requests
    }

    #[cfg(target_os = "espidf")]
    fn platform_post(&mut self, url: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        use core::time::Duration;
        use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
        use esp_idf_svc::http::Method;

        let config = Configuration {
            timeout: Some(Duration::from_millis(REQUEST_TIMEOUT_MS)),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut conn = EspHttpConnection::new(&config).map_err(|e| {
            warn!("HTTP: connection init failed ({})", e);
            TransportError::RequestFailed
        })?;

        let len = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", len.as_str()),
        ];
        conn.initiate_request(Method::Post, url, &headers)
            .map_err(|_| TransportError::RequestFailed)?;

        let mut sent = 0;
        while sent < body.len() {
            let n = conn
                .write(&body[sent..])
                .map_err(|_| TransportError::RequestFailed)?;
            if n == 0 {
                return Err(TransportError::RequestFailed);
            }
            sent += n;
        }

        conn.initiate_response()
            .map_err(|_| TransportError::RequestFailed)?;
        let status = conn.status();
        if !(200..300).contains(&status) {
            return Err(TransportError::HttpStatus(status));
        }

        let mut response = Vec::new();
        let mut chunk = [0u8; 512];
        while response.len() < MAX_RESPONSE_BYTES {
            let n = conn
                .read(&mut chunk)
                .map_err(|_| TransportError::RequestFailed)?;
            if n == 0 {
                break;
            }
            let room = MAX_RESPONSE_BYTES - response.len();
            response.extend_from_slice(&chunk[..n.min(room)]);
        }
        Ok(response)
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_post(&mut self, url: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.requests.push(RecordedRequest {
            url: url.into(),
            body: body.to_vec(),
        });
        let mut response = self
            .script
            .pop_front()
            .unwrap_or(Err(TransportError::RequestFailed))?;
        response.truncate(MAX_RESPONSE_BYTES);
        Ok(response)
    }
}

impl HttpPort for HttpClient {
    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        debug!("HTTP: POST {} ({} bytes)", url, body.len());
        let result = self.platform_post(url, body);
        match &result {
            Ok(response) => debug!("HTTP: {} byte response", response.len()),
            Err(e) => warn!("HTTP: POST {} failed ({})", url, e),
        }
        result
    }
}
