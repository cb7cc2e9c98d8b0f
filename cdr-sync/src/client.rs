use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use cdr_common::call::{format_cel_time, CallRecord, OriginateStatus};
use cdr_common::cel::CLOSING_EVENTS_HEADER;

use crate::error::SyncError;
use crate::origination::OriginationSettings;
use crate::source::{CallPage, CallSource};

// How much of an unexpected response body makes it into the error message.
const MAX_ERROR_BODY: usize = 500;

const ORIGINATION_URL_ERROR: &str = "Error contacting Origination URL.";

/// Client for the PBX side `rockrmsinterface` commands.
pub struct PbxClient {
    client: Client,
    base_url: Url,
    username: String,
    password: String,
    origination: OriginationSettings,
}

impl PbxClient {
    pub fn new(
        server_url: &str,
        api_path: &str,
        username: &str,
        password: &str,
        timeout: Duration,
        origination: OriginationSettings,
    ) -> Result<Self, SyncError> {
        let invalid_url =
            |e: url::ParseError| SyncError::TransportFailure(format!("invalid PBX url: {}", e));

        let mut server_url = server_url.trim().to_owned();
        if !server_url.ends_with('/') {
            server_url.push('/');
        }
        let base_url = Url::parse(&server_url)
            .and_then(|url| url.join(&format!("{}/", api_path.trim_matches('/'))))
            .map_err(invalid_url)?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::TransportFailure(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            username: username.to_owned(),
            password: password.to_owned(),
            origination,
        })
    }

    async fn send(&self, command: &str, params: &[(&str, String)]) -> Result<Response, SyncError> {
        let url = self
            .base_url
            .join(command)
            .map_err(|e| SyncError::TransportFailure(format!("invalid PBX url: {}", e)))?;

        let response = self
            .client
            .get(url)
            .query(&[("username", &self.username), ("password", &self.password)])
            .query(params)
            .send()
            .await
            .map_err(request_error)?;

        check_status(response).await
    }

    async fn command<T>(&self, command: &str, params: &[(&str, String)]) -> Result<T, SyncError>
    where
        T: DeserializeOwned,
    {
        let response = self.send(command, params).await?;
        decode(response).await
    }

    /// Ask the PBX to ring `from` and connect it to `to`. Both numbers go through the
    /// origination rule first, and the caller id through its template.
    pub async fn originate(
        &self,
        from: &str,
        to: &str,
        caller_id: &str,
    ) -> Result<OriginateStatus, SyncError> {
        let rule = self.origination.number_rule;
        let from = rule.apply(from);
        let to = rule.apply(to);
        let fields = [
            ("caller_id", caller_id.trim()),
            ("from", from.as_str()),
            ("to", to.as_str()),
        ];

        if let Some(url_template) = &self.origination.url_template {
            return self.originate_by_url(&url_template.render(&fields)).await;
        }

        let caller_id = self.origination.caller_id_template.render(&fields);
        let status: OriginateStatus = self
            .command(
                "originate",
                &[
                    ("from", from.clone()),
                    ("to", to.clone()),
                    ("callerid", caller_id),
                ],
            )
            .await?;

        if !status.is_success() {
            warn!(from = %from, to = %to, status = %status.status, "PBX refused to originate call");
            return Err(SyncError::OriginateRejected(status.message));
        }

        Ok(status)
    }

    async fn originate_by_url(&self, url: &str) -> Result<OriginateStatus, SyncError> {
        let url = Url::parse(url).map_err(|e| {
            warn!(error = %e, "origination url is not a valid url");
            SyncError::OriginateRejected(ORIGINATION_URL_ERROR.to_owned())
        })?;

        let status = match self.client.get(url).send().await {
            Ok(response) => response.status(),
            Err(e) => {
                warn!(error = %e, "failed to reach the origination url");
                return Err(SyncError::OriginateRejected(ORIGINATION_URL_ERROR.to_owned()));
            }
        };

        if status != StatusCode::OK {
            warn!(status = %status, "origination url refused the call");
            return Err(SyncError::OriginateRejected(ORIGINATION_URL_ERROR.to_owned()));
        }

        Ok(OriginateStatus {
            status: "Success".to_owned(),
            message: String::new(),
        })
    }
}

#[async_trait]
impl CallSource for PbxClient {
    async fn fetch_page(
        &self,
        since: DateTime<Utc>,
        page: i64,
        limit: i64,
    ) -> Result<CallPage, SyncError> {
        debug!(page, limit, "fetching call records from the PBX");

        let response = self
            .send(
                "getCelData",
                &[
                    ("date", format_cel_time(&since)),
                    ("page", page.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let closing_events = response
            .headers()
            .get(CLOSING_EVENTS_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<usize>().ok());

        let calls: Vec<CallRecord> = decode(response).await?;
        // Without the count, an empty page is all there is to go on.
        let exhausted = match closing_events {
            Some(count) => count == 0,
            None => calls.is_empty(),
        };

        Ok(CallPage::new(calls, exhausted))
    }
}

async fn decode<T>(response: Response) -> Result<T, SyncError>
where
    T: DeserializeOwned,
{
    response
        .json::<T>()
        .await
        .map_err(|e| SyncError::TransportFailure(format!("invalid response from the PBX: {}", e)))
}

fn request_error(error: reqwest::Error) -> SyncError {
    if error.is_timeout() {
        SyncError::TransportFailure("Request to the PBX timed out".to_owned())
    } else {
        SyncError::TransportFailure(format!("Error contacting PBX server: {}", error))
    }
}

async fn check_status(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(SyncError::AuthenticationFailure);
    }

    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    Err(SyncError::TransportFailure(format!(
        "PBX returned {}: {}",
        status, body
    )))
}
