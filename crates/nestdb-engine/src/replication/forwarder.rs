//! Write-forwarder: a secondary proxies mutating requests to the primary.
//!
//! Frontends on a secondary node call [`Forwarder::forward`] for any
//! request that would mutate state and relay the primary's response
//! verbatim.

use nestdb_common::Result;

use super::http;

pub struct Forwarder {
    authority: String,
}

/// A mutating client request, as seen by a frontend adapter.
pub struct ForwardRequest {
    pub method: String,
    pub path_and_query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The primary's answer, relayed to the client unchanged.
pub struct ForwardResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Forwarder {
    pub fn new(primary_url: &str) -> Result<Self> {
        Ok(Self {
            authority: http::parse_authority(primary_url)?,
        })
    }

    /// Replay the request against the primary and collect the response.
    pub async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse> {
        let mut headers = request.headers;
        headers.push(("Connection".to_string(), "close".to_string()));

        let (head, mut body) = http::request(
            &self.authority,
            &request.method,
            &request.path_and_query,
            &headers,
            &request.body,
        )
        .await?;

        Ok(ForwardResponse {
            status: head.status,
            headers: head.headers,
            body: body.read_to_end().await?,
        })
    }
}
