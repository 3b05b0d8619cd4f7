//! Backblaze B2 API Client
//!
//! Read-only access to one bucket: paginated prefix listings and streaming
//! downloads, with retry and token refresh for transient failures.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::types::{B2File, ListFilesResponse};
use crate::config::{Credential, LookupMode};
use crate::remote::{ContentStream, ObjectStream, RemoteError, RemoteObject, RemoteStore};

/// B2 API base URL for authorization (v3 for nested apiInfo structure)
const B2_AUTH_URL: &str = "https://api.backblazeb2.com/b2api/v3/b2_authorize_account";

/// Total deadline for a JSON API call, body included
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for establishing a connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest gap between reads of a response body; downloads have no total deadline
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// Backoff between retries, in milliseconds
const BACKOFF_MS: [u64; 3] = [500, 1000, 2000];

/// Files requested per b2_list_file_names page
const LIST_PAGE_SIZE: u32 = 1000;

/// Auth state that can be refreshed (interior mutability)
struct AuthState {
    auth_token: String,
    api_url: String,
    download_url: String,
}

/// B2 API client for making authenticated requests
#[derive(Clone)]
pub struct B2Client {
    /// HTTP client for making requests
    http_client: Client,
    /// B2 account ID
    account_id: String,
    /// Mutable auth state (refreshable on 401)
    auth_state: Arc<RwLock<AuthState>>,
    /// Key pair for re-authorization; `None` when running on a bare token
    key_pair: Option<(String, String)>,
    /// Bucket ID to operate on
    bucket_id: String,
    /// Bucket name
    bucket_name: String,
}

/// Response from b2_authorize_account API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    account_id: String,
    authorization_token: String,
    api_info: ApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInfo {
    storage_api: StorageApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageApiInfo {
    api_url: String,
    download_url: String,
}

/// Response from b2_list_buckets API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBucketsResponse {
    buckets: Vec<BucketInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketInfo {
    bucket_id: String,
    bucket_name: String,
}

/// Request body for b2_list_file_names API
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNamesRequest {
    bucket_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    max_file_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_file_name: Option<String>,
}

/// Pagination state of a lazy listing
struct ListState<'a> {
    client: &'a B2Client,
    prefix: String,
    buffer: VecDeque<B2File>,
    next_file_name: Option<String>,
    exhausted: bool,
}

/// Read a non-success response into a RemoteError
async fn error_from_response(response: reqwest::Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RemoteError::from_status(status, &body)
}

fn basic_auth_header(key_id: &str, key: &str) -> String {
    let credentials = format!("{}:{}", key_id, key);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(credentials)
    )
}

async fn authorize_account(
    http_client: &Client,
    key_id: &str,
    key: &str,
) -> Result<AuthorizeAccountResponse, RemoteError> {
    let response = http_client
        .get(B2_AUTH_URL)
        .header("Authorization", basic_auth_header(key_id, key))
        .timeout(API_TIMEOUT)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    Ok(response.json().await?)
}

impl B2Client {
    /// Get current auth token
    fn auth_token(&self) -> String {
        self.auth_state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .auth_token
            .clone()
    }

    /// Get current API URL
    fn api_url(&self) -> String {
        self.auth_state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .api_url
            .clone()
    }

    /// Get current download URL
    fn download_url(&self) -> String {
        self.auth_state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .download_url
            .clone()
    }

    /// Connect to a bucket with either credential form
    ///
    /// With an application key pair the account is authorized and the bucket
    /// id looked up by name. With a token the endpoint serves both API and
    /// download requests and the bucket id must be known up front.
    pub async fn connect(credential: &Credential, bucket_name: &str) -> Result<Self, RemoteError> {
        let http_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Request(format!("failed to create HTTP client: {}", e)))?;

        match credential {
            Credential::ApplicationKey { key_id, key } => {
                Self::authorize(http_client, key_id, key, bucket_name).await
            }
            Credential::Token {
                service_uri,
                token,
                container_id,
            } => {
                info!(bucket = bucket_name, endpoint = %service_uri, "Using pre-issued B2 token");
                Ok(Self {
                    http_client,
                    account_id: String::new(),
                    auth_state: Arc::new(RwLock::new(AuthState {
                        auth_token: token.clone(),
                        api_url: service_uri.clone(),
                        download_url: service_uri.clone(),
                    })),
                    key_pair: None,
                    bucket_id: container_id.clone(),
                    bucket_name: bucket_name.to_string(),
                })
            }
        }
    }

    /// Authorize with B2 and resolve the bucket ID for `bucket_name`
    async fn authorize(
        http_client: Client,
        key_id: &str,
        key: &str,
        bucket_name: &str,
    ) -> Result<Self, RemoteError> {
        info!(bucket = bucket_name, "Authorizing with B2 API...");

        let auth_response = authorize_account(&http_client, key_id, key).await?;
        let api_url = auth_response.api_info.storage_api.api_url;
        let download_url = auth_response.api_info.storage_api.download_url;
        debug!(api_url = %api_url, download_url = %download_url, "B2 authorization successful");

        let mut client = Self {
            http_client,
            account_id: auth_response.account_id,
            auth_state: Arc::new(RwLock::new(AuthState {
                auth_token: auth_response.authorization_token,
                api_url,
                download_url,
            })),
            key_pair: Some((key_id.to_string(), key.to_string())),
            bucket_id: String::new(),
            bucket_name: bucket_name.to_string(),
        };

        client.bucket_id = client.get_bucket_id(bucket_name).await?;

        info!(bucket_name = bucket_name, bucket_id = %client.bucket_id, "B2 client ready");
        Ok(client)
    }

    /// Refresh the auth token by re-authorizing with B2
    async fn refresh_auth(&self) -> Result<(), RemoteError> {
        let (key_id, key) = self.key_pair.as_ref().ok_or(RemoteError::AuthExpired)?;
        info!("Refreshing B2 auth token...");

        let auth_response = authorize_account(&self.http_client, key_id, key).await?;

        let mut state = self.auth_state.write().unwrap_or_else(|e| e.into_inner());
        state.auth_token = auth_response.authorization_token;
        state.api_url = auth_response.api_info.storage_api.api_url;
        state.download_url = auth_response.api_info.storage_api.download_url;

        info!("B2 auth token refreshed successfully");
        Ok(())
    }

    /// Execute an operation with retry logic and exponential backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, path: &str, f: F) -> Result<T, RemoteError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match f().await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt == MAX_RETRIES {
                return Err(err);
            }

            if matches!(err, RemoteError::AuthExpired) {
                warn!(operation = operation, "Auth expired, refreshing token...");
                if let Err(refresh_err) = self.refresh_auth().await {
                    error!(error = %refresh_err, "Failed to refresh auth token");
                    return Err(err);
                }
            }

            let delay = BACKOFF_MS
                .get(attempt as usize)
                .copied()
                .unwrap_or(2000);
            warn!(
                operation = operation,
                path = path,
                attempt = attempt + 1,
                max = MAX_RETRIES,
                delay_ms = delay,
                error = %err,
                "Retrying B2 operation"
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }

    /// Authenticated JSON API call, bounded by [`API_TIMEOUT`]
    fn api_post(&self, url: &str) -> RequestBuilder {
        self.http_client
            .post(url)
            .header("Authorization", self.auth_token())
            .timeout(API_TIMEOUT)
    }

    /// Authenticated download; only connect and read gaps are bounded
    fn download_request(&self, url: &str) -> RequestBuilder {
        self.http_client
            .get(url)
            .header("Authorization", self.auth_token())
    }

    /// Look up bucket ID from bucket name
    async fn get_bucket_id(&self, bucket_name: &str) -> Result<String, RemoteError> {
        let url = format!("{}/b2api/v2/b2_list_buckets", self.api_url());

        let response = self
            .api_post(&url)
            .json(&serde_json::json!({
                "accountId": self.account_id,
                "bucketName": bucket_name
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let list_response: ListBucketsResponse = response.json().await?;

        list_response
            .buckets
            .into_iter()
            .find(|b| b.bucket_name == bucket_name)
            .map(|b| b.bucket_id)
            .ok_or_else(|| RemoteError::NotFound(format!("bucket '{}'", bucket_name)))
    }

    fn list_request(
        &self,
        prefix: &str,
        start_file_name: Option<String>,
        max_file_count: u32,
    ) -> ListFileNamesRequest {
        ListFileNamesRequest {
            bucket_id: self.bucket_id.clone(),
            prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
            max_file_count,
            start_file_name,
        }
    }

    /// Fetch one page of b2_list_file_names
    async fn list_page(&self, request: ListFileNamesRequest) -> Result<ListFilesResponse, RemoteError> {
        let prefix = request.prefix.as_deref().unwrap_or("");
        self.with_retry("list_file_names", prefix, || {
            let request = &request;
            async move {
                let url = format!("{}/b2api/v2/b2_list_file_names", self.api_url());
                debug!(prefix = prefix, start = ?request.start_file_name, "Listing files from B2");

                let response = self.api_post(&url).json(request).send().await?;

                if !response.status().is_success() {
                    return Err(error_from_response(response).await);
                }

                Ok(response.json::<ListFilesResponse>().await?)
            }
        })
        .await
    }
}

#[async_trait]
impl RemoteStore for B2Client {
    fn account_name(&self) -> &str {
        if self.account_id.is_empty() {
            &self.bucket_id
        } else {
            &self.account_id
        }
    }

    fn container_name(&self) -> &str {
        &self.bucket_name
    }

    fn list_by_prefix(&self, prefix: &str) -> ObjectStream<'_> {
        let state = ListState {
            client: self,
            prefix: prefix.to_string(),
            buffer: VecDeque::new(),
            next_file_name: None,
            exhausted: false,
        };

        stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(file) = state.buffer.pop_front() {
                    if let Some(object) = file.into_remote_object() {
                        return Ok(Some((object, state)));
                    }
                    continue;
                }
                if state.exhausted {
                    return Ok::<_, RemoteError>(None);
                }

                let request = state.client.list_request(
                    &state.prefix,
                    state.next_file_name.take(),
                    LIST_PAGE_SIZE,
                );
                let page = state.client.list_page(request).await?;
                debug!(prefix = %state.prefix, count = page.files.len(), "Listed page from B2");
                state.buffer.extend(page.files);
                state.exhausted = page.next_file_name.is_none();
                state.next_file_name = page.next_file_name;
            }
        })
        .boxed()
    }

    fn lists_in_name_order(&self) -> bool {
        true
    }

    /// Exact lookups ask for the single name at or after `path` instead of
    /// paging through everything under it
    async fn first_match(
        &self,
        path: &str,
        mode: LookupMode,
    ) -> Result<Option<RemoteObject>, RemoteError> {
        if mode == LookupMode::Prefix {
            return self.list_by_prefix(path).try_next().await;
        }

        let request = self.list_request(path, Some(path.to_string()), 1);
        let page = self.list_page(request).await?;
        Ok(page
            .files
            .into_iter()
            .next()
            .filter(|file| file.file_name == path)
            .and_then(B2File::into_remote_object))
    }

    async fn open_content(&self, object: &RemoteObject) -> Result<ContentStream, RemoteError> {
        let encoded = urlencoding::encode(&object.name);
        let encoded_name: &str = &encoded;

        let response = self
            .with_retry("download_file", &object.name, || async move {
                let url = format!(
                    "{}/file/{}/{}",
                    self.download_url(),
                    self.bucket_name,
                    encoded_name
                );
                debug!(file = %object.name, url = %url, "Downloading file from B2");

                let response = self.download_request(&url).send().await?;

                if !response.status().is_success() {
                    return Err(error_from_response(response).await);
                }
                Ok(response)
            })
            .await?;

        info!(file = %object.name, size = object.size, "Streaming file from B2");
        Ok(response.bytes_stream().map_err(RemoteError::from).boxed())
    }
}
