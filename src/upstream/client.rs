//! HTTP upstream client.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::error::SyncError;

use super::types::{ApiChange, ApiRecord, ApiRecordPage, ChangeAction, ExternalRecord};
use super::Upstream;

/// Upstream client speaking the board/CRM HTTP API.
#[derive(Clone)]
pub struct HttpUpstream {
  http: reqwest::Client,
  base_url: Url,
  board_id: String,
  token: String,
}

impl HttpUpstream {
  pub fn new(config: &Config) -> Result<Self, SyncError> {
    let token =
      Config::get_api_token().map_err(|e| SyncError::Configuration(e.to_string()))?;

    let base_url = Url::parse(&config.upstream.url)
      .map_err(|e| SyncError::Configuration(format!("invalid upstream base url: {}", e)))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| SyncError::Configuration(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      http,
      base_url,
      board_id: config.upstream.board_id.clone(),
      token,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
    self
      .base_url
      .join(path)
      .map_err(|e| SyncError::Configuration(format!("invalid endpoint '{}': {}", path, e)))
  }

  async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, SyncError> {
    let response = self
      .http
      .get(url)
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(|e| SyncError::Transport(e.to_string()))?;

    let response = check_status(response).await?;
    response
      .json::<T>()
      .await
      .map_err(|e| SyncError::Transport(format!("failed to decode response: {}", e)))
  }
}

/// Map the response status into the error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  if status == StatusCode::TOO_MANY_REQUESTS {
    let retry_after = response
      .headers()
      .get(reqwest::header::RETRY_AFTER)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.parse::<u64>().ok())
      .map(Duration::from_secs);
    return Err(SyncError::RateLimited {
      key: "upstream".into(),
      retry_after,
    });
  }

  let detail = response.text().await.unwrap_or_default();
  let detail = detail.chars().take(200).collect::<String>();
  if status.is_server_error() {
    Err(SyncError::UpstreamServer {
      status: status.as_u16(),
      detail,
    })
  } else {
    Err(SyncError::UpstreamClient {
      status: status.as_u16(),
      detail,
    })
  }
}

impl Upstream for HttpUpstream {
  fn list_records(&self) -> BoxFuture<'_, Result<Vec<ExternalRecord>, SyncError>> {
    Box::pin(async move {
      let mut all_records = Vec::new();
      let mut cursor: Option<String> = None;

      // Follow the continuation cursor until the last page.
      loop {
        let mut url = self.endpoint(&format!("boards/{}/records", self.board_id))?;
        if let Some(ref c) = cursor {
          url.query_pairs_mut().append_pair("cursor", c);
        }

        let page: ApiRecordPage = self.get_json(url).await?;
        all_records.extend(page.records.into_iter().map(ApiRecord::into_record));

        match page.cursor {
          Some(next) => cursor = Some(next),
          None => break,
        }
      }

      Ok(all_records)
    })
  }

  fn changes_since(
    &self,
    since: DateTime<Utc>,
  ) -> BoxFuture<'_, Result<Vec<ChangeAction>, SyncError>> {
    Box::pin(async move {
      let mut url = self.endpoint(&format!("boards/{}/actions", self.board_id))?;
      url
        .query_pairs_mut()
        .append_pair("since", &since.to_rfc3339());

      let changes: Vec<ApiChange> = self.get_json(url).await?;
      Ok(changes.into_iter().map(ApiChange::into_change).collect())
    })
  }

  fn get_record<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<ExternalRecord, SyncError>> {
    Box::pin(async move {
      let url = self.endpoint(&format!("records/{}", id))?;
      let record: ApiRecord = self.get_json(url).await?;
      Ok(record.into_record())
    })
  }
}
