//! A refresh executor that uses an OAuth2 token endpoint

use std::{marker::PhantomData, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokenward_clock::{Clock, System};

use super::{with_retries, AttemptError, RefreshError, TokenRefresher, TransientError};
use crate::{backoff::RetryPolicy, record::TokenFields, RefreshTokenRef};

pub mod dto;

/// The default timeout for a single token endpoint request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds an HTTP client whose requests time out after `timeout`
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(timeout).build()
}

/// Performs refresh-grant exchanges against an OAuth2 token endpoint
///
/// HTTP 400 and 401 responses are treated as a terminal rejection of the
/// refresh token. Transport failures and every status other than 200 are
/// retried according to the configured [`RetryPolicy`].
#[derive(Debug)]
pub struct HttpRefreshExecutor<T = FormBody, C = System> {
    client: reqwest::Client,
    token_url: reqwest::Url,
    credentials: Arc<dto::ClientCredentials>,
    retry: RetryPolicy,
    clock: C,
    content_type: PhantomData<fn() -> T>,
}

impl HttpRefreshExecutor<FormBody, System> {
    /// Constructs a new refresh executor sending form-encoded requests
    ///
    /// The `client` should carry a request timeout; see [`build_client`].
    pub fn new(
        client: reqwest::Client,
        token_url: reqwest::Url,
        credentials: impl Into<Arc<dto::ClientCredentials>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            token_url,
            credentials: credentials.into(),
            retry,
            clock: System,
            content_type: PhantomData,
        }
    }
}

impl<T, C> HttpRefreshExecutor<T, C> {
    /// Configures the executor to send credentials to
    /// the authority as JSON
    pub fn using_json_body(self) -> HttpRefreshExecutor<JsonBody, C> {
        HttpRefreshExecutor {
            client: self.client,
            token_url: self.token_url,
            credentials: self.credentials,
            retry: self.retry,
            clock: self.clock,
            content_type: PhantomData,
        }
    }

    /// Configures the executor to send credentials to
    /// the authority as form data
    pub fn using_form_data(self) -> HttpRefreshExecutor<FormBody, C> {
        HttpRefreshExecutor {
            client: self.client,
            token_url: self.token_url,
            credentials: self.credentials,
            retry: self.retry,
            clock: self.clock,
            content_type: PhantomData,
        }
    }

    /// Uses the given clock to resolve relative lifetimes
    pub fn with_clock<C2>(self, clock: C2) -> HttpRefreshExecutor<T, C2> {
        HttpRefreshExecutor {
            client: self.client,
            token_url: self.token_url,
            credentials: self.credentials,
            retry: self.retry,
            clock,
            content_type: PhantomData,
        }
    }

    /// The token endpoint
    pub fn token_url(&self) -> &reqwest::Url {
        &self.token_url
    }
}

#[async_trait]
impl<T, C> TokenRefresher for HttpRefreshExecutor<T, C>
where
    T: RequestType,
    C: Clock + Send + Sync,
{
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenFields, RefreshError> {
        let grant = dto::RefreshGrant {
            credentials: &self.credentials,
            refresh_token,
        };

        with_retries(&self.retry, |attempt| {
            request_refresh::<T, C>(&self.client, &self.token_url, &grant, &self.clock, attempt)
        })
        .await
    }
}

#[tracing::instrument(
    level = "debug",
    skip(client, token_url, grant, clock),
    fields(
        token_url = %token_url,
        credentials.client_id = %grant.credentials.client_id,
    ),
)]
async fn request_refresh<T: RequestType, C: Clock>(
    client: &reqwest::Client,
    token_url: &reqwest::Url,
    grant: &dto::RefreshGrant<'_>,
    clock: &C,
    attempt: u32,
) -> Result<TokenFields, AttemptError> {
    tracing::trace!("requesting token refresh from authority");

    let req = T::attach_payload(client.post(token_url.clone()), grant);
    let resp = req
        .send()
        .await
        .map_err(|err| TransientError::Transport(Box::new(err)))?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from issuing authority"
    );

    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
        let body = resp.text().await.unwrap_or_default();
        return Err(AttemptError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    if status != StatusCode::OK {
        let body = resp.text().await.unwrap_or_default();
        return Err(TransientError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        }
        .into());
    }

    let body = resp
        .bytes()
        .await
        .map_err(|err| TransientError::Transport(Box::new(err)))?;
    let resp: dto::TokenResponse = serde_json::from_slice(&body).map_err(TransientError::from)?;

    let has_refresh_token = resp.refresh_token.is_some();
    let fields = resp.into_fields(clock.now());

    tracing::info!(
        has_refresh_token,
        expiry = fields.expires_at.unwrap_or_default().0,
        "received refreshed tokens"
    );

    Ok(fields)
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType: Send + Sync + 'static {
    /// Attaches the serializable payload to the request body
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder;
}

/// Attaches credentials to the request body as JSON
#[derive(Debug)]
pub struct JsonBody;

/// Attaches credentials to the request body as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.form(payload)
    }
}
