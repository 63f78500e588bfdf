use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{Explorer, ExplorerResponse, VerificationRequest};
use crate::errors::VerificationError;

/// Client for etherscan compatible `contract` module APIs.
pub struct Etherscan {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    chain_id: u64,
}

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: String,
}

impl Etherscan {
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        api_key: Option<String>,
        chain_id: u64,
    ) -> Self {
        Self {
            client,
            api_url,
            api_key,
            chain_id,
        }
    }

    fn api_key(&self) -> Result<&str, VerificationError> {
        self.api_key.as_deref().ok_or_else(|| {
            VerificationError::Rejected(format!(
                "No api key configured for {}",
                self.api_url
            ))
        })
    }

    async fn parse(
        response: reqwest::Response,
    ) -> Result<Option<EtherscanResponse>, VerificationError> {
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Ok(None);
        }

        let body = response
            .json()
            .await
            .map_err(|err| VerificationError::Transport(err.to_string()))?;

        Ok(Some(body))
    }
}

/// Etherscan reports most outcomes as free text in `result`.
fn classify_text(text: &str) -> ExplorerResponse {
    let lower = text.to_lowercase();

    if lower.contains("already verified") {
        ExplorerResponse::AlreadyVerified
    } else if lower.contains("rate limit") {
        ExplorerResponse::RateLimited
    } else if lower.contains("pass - verified") {
        ExplorerResponse::Verified
    } else if lower.contains("pending in queue") {
        ExplorerResponse::Pending(String::new())
    } else {
        ExplorerResponse::Rejected(text.to_string())
    }
}

fn classify_submission(response: &EtherscanResponse) -> ExplorerResponse {
    if response.status == "1" {
        return ExplorerResponse::Pending(response.result.clone());
    }

    if response.result.is_empty() {
        classify_text(&response.message)
    } else {
        classify_text(&response.result)
    }
}

fn classify_status(response: &EtherscanResponse) -> ExplorerResponse {
    classify_text(&response.result)
}

#[async_trait]
impl Explorer for Etherscan {
    fn name(&self) -> String {
        format!("etherscan ({})", self.api_url)
    }

    #[instrument(skip_all, fields(address = ?request.address))]
    async fn submit(
        &self,
        request: &VerificationRequest,
    ) -> Result<ExplorerResponse, VerificationError> {
        let source = request.source.as_deref().ok_or_else(|| {
            VerificationError::Rejected(
                "Etherscan needs the standard json input as source".to_string(),
            )
        })?;

        let form = [
            ("apikey", self.api_key()?.to_string()),
            ("module", "contract".to_string()),
            ("action", "verifysourcecode".to_string()),
            ("contractaddress", format!("{:?}", request.address)),
            ("sourceCode", source.to_string()),
            ("codeformat", "solidity-standard-json-input".to_string()),
            ("contractname", request.contract_name.clone()),
            ("compilerversion", request.compiler.version.clone()),
            ("constructorArguements", hex::encode(&request.constructor_args)),
            ("licenseType", request.compiler.license_type.to_string()),
        ];

        let response = self
            .client
            .post(&self.api_url)
            .query(&[("chainid", self.chain_id)])
            .form(&form)
            .send()
            .await
            .map_err(|err| VerificationError::Transport(err.to_string()))?;

        let Some(body) = Self::parse(response).await? else {
            return Ok(ExplorerResponse::RateLimited);
        };

        debug!(?body, "Submission response");

        Ok(classify_submission(&body))
    }

    async fn check(
        &self,
        receipt: &str,
    ) -> Result<ExplorerResponse, VerificationError> {
        let chain_id = self.chain_id.to_string();

        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("apikey", self.api_key()?),
                ("module", "contract"),
                ("action", "checkverifystatus"),
                ("guid", receipt),
                ("chainid", chain_id.as_str()),
            ])
            .send()
            .await
            .map_err(|err| VerificationError::Transport(err.to_string()))?;

        let Some(body) = Self::parse(response).await? else {
            return Ok(ExplorerResponse::RateLimited);
        };

        debug!(?body, "Status response");

        Ok(classify_status(&body))
    }
}
