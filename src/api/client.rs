//! reqwest implementation of [`LicenseApi`]

use super::models::{LicenseRequest, PaymentRequest, PaymentResponse, VerifyLicenseResponse};
use super::{ApiError, ApiResponse, LicenseApi};
use crate::config::ApiSection;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

const LICENSE_PATH: &str = "license/v1/license";

pub struct HttpLicenseApi {
    base_url: String,
    signature_header: String,
    client: Client,
}

impl HttpLicenseApi {
    pub fn new(config: &ApiSection) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            signature_header: config.signature_header.clone(),
            client,
        })
    }

    fn pay_url(&self, license_uuid: &str) -> String {
        format!(
            "{}/{LICENSE_PATH}/{license_uuid}/pay-with-transfermovil/",
            self.base_url
        )
    }

    fn verify_url(&self) -> String {
        format!("{}/{LICENSE_PATH}/verify/", self.base_url)
    }

    async fn post_json<B, T>(
        &self,
        url: &str,
        body: &B,
        access_token: &str,
    ) -> Result<ApiResponse<T>, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        debug!(url, "POST");
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        let signature = response
            .headers()
            .get(self.signature_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let raw_body = response
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !status.is_success() {
            let message = if raw_body.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                String::from_utf8_lossy(&raw_body).into_owned()
            };
            warn!(url, status = status.as_u16(), "License API request failed");
            return Err(ApiError::Status {
                code: status.as_u16(),
                message,
            });
        }

        if raw_body.iter().all(u8::is_ascii_whitespace) {
            return Err(ApiError::EmptyBody {
                code: status.as_u16(),
            });
        }

        let body = serde_json::from_slice(&raw_body).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(ApiResponse {
            status: status.as_u16(),
            body,
            raw_body,
            signature,
        })
    }
}

#[async_trait]
impl LicenseApi for HttpLicenseApi {
    async fn pay_license(
        &self,
        license_uuid: &str,
        request: &PaymentRequest,
        access_token: &str,
    ) -> Result<ApiResponse<PaymentResponse>, ApiError> {
        self.post_json(&self.pay_url(license_uuid), request, access_token)
            .await
    }

    async fn verify_license(
        &self,
        request: &LicenseRequest,
        access_token: &str,
    ) -> Result<ApiResponse<VerifyLicenseResponse>, ApiError> {
        self.post_json(&self.verify_url(), request, access_token)
            .await
    }
}
