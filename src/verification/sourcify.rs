use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{Explorer, ExplorerResponse, VerificationRequest};
use crate::errors::VerificationError;

const INPUT_FILE: &str = "SolcJsonInput.json";

/// Client for a Sourcify server. Verification is synchronous, a response
/// is final.
pub struct Sourcify {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolcJsonRequest<'a> {
    address: String,
    chain: String,
    files: std::collections::BTreeMap<&'a str, &'a str>,
    compiler_version: &'a str,
    contract_name: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct SourcifyResponse {
    #[serde(default)]
    result: Vec<SourcifyMatch>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SourcifyMatch {
    status: String,
}

impl Sourcify {
    pub fn new(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    fn endpoint(&self) -> String {
        format!("{}/verify/solc-json", self.api_url.trim_end_matches('/'))
    }
}

fn classify(status: StatusCode, body: &SourcifyResponse) -> ExplorerResponse {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ExplorerResponse::RateLimited;
    }

    if body
        .result
        .iter()
        .any(|m| m.status == "perfect" || m.status == "partial")
    {
        return ExplorerResponse::Verified;
    }

    let error = body
        .error
        .clone()
        .unwrap_or_else(|| format!("Unexpected response with status {status}"));

    if error.to_lowercase().contains("already") {
        ExplorerResponse::AlreadyVerified
    } else {
        ExplorerResponse::Rejected(error)
    }
}

#[async_trait]
impl Explorer for Sourcify {
    fn name(&self) -> String {
        format!("sourcify ({})", self.api_url)
    }

    #[instrument(skip_all, fields(address = ?request.address))]
    async fn submit(
        &self,
        request: &VerificationRequest,
    ) -> Result<ExplorerResponse, VerificationError> {
        let source = request.source.as_deref().ok_or_else(|| {
            VerificationError::Rejected(
                "Sourcify needs the standard json input as source".to_string(),
            )
        })?;

        // Sourcify wants the bare contract name
        let contract_name = request
            .contract_name
            .rsplit(':')
            .next()
            .unwrap_or(&request.contract_name);

        let body = SolcJsonRequest {
            address: format!("{:?}", request.address),
            chain: request.chain_id.to_string(),
            files: [(INPUT_FILE, source)].into(),
            compiler_version: request.compiler.version.trim_start_matches('v'),
            contract_name,
        };

        let response = self
            .client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|err| VerificationError::Transport(err.to_string()))?;

        let status = response.status();

        // Error pages aren't always json
        let body: SourcifyResponse = response.json().await.unwrap_or_default();

        debug!(%status, ?body, "Sourcify response");

        Ok(classify(status, &body))
    }
}
