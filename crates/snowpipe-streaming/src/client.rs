// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::{Method, RequestBuilder, StatusCode};
use std::sync::Arc;

use crate::credential::TokenProvider;
use crate::discovery::IngestionEndpoint;
use crate::errors::AuthError;

/// How a response status should be handled by the channel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// 409: the continuation token no longer matches the service's view of the channel.
    TokenMismatch,
    /// 401: the credential was refused and should be refreshed before retrying.
    Unauthorized,
    /// 408, 429 and 5xx.
    Transient,
    /// Any other 4xx; the request will never succeed as sent.
    Rejected,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    match status {
        s if s.is_success() => StatusClass::Success,
        StatusCode::CONFLICT => StatusClass::TokenMismatch,
        StatusCode::UNAUTHORIZED => StatusClass::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => StatusClass::Transient,
        s if s.is_server_error() => StatusClass::Transient,
        s if s.is_client_error() => StatusClass::Rejected,
        // 1xx/3xx are not expected from the service; retrying is the safe default.
        _ => StatusClass::Transient,
    }
}

/// Authenticated access to the ingestion endpoint, shared by the channel session and
/// the append engine.
#[derive(Debug, Clone)]
pub struct IngestClient {
    http: reqwest::Client,
    endpoint: IngestionEndpoint,
    tokens: Arc<TokenProvider>,
}

impl IngestClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: IngestionEndpoint,
        tokens: Arc<TokenProvider>,
    ) -> Self {
        Self {
            http,
            endpoint,
            tokens,
        }
    }

    pub fn endpoint(&self) -> &IngestionEndpoint {
        &self.endpoint
    }

    pub fn tokens(&self) -> &Arc<TokenProvider> {
        &self.tokens
    }

    /// Builds a request carrying the current bearer credential.
    pub async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, AuthError> {
        let credential = self.tokens.get_credential().await?;
        Ok(self
            .http
            .request(method, self.endpoint.url(path))
            .bearer_auth(credential.token()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplicate::duplicate_item;

    #[duplicate_item(
        test_name                   status                              expected;
        [test_classify_ok]          [StatusCode::OK]                    [StatusClass::Success];
        [test_classify_accepted]    [StatusCode::ACCEPTED]              [StatusClass::Success];
        [test_classify_conflict]    [StatusCode::CONFLICT]              [StatusClass::TokenMismatch];
        [test_classify_unauth]      [StatusCode::UNAUTHORIZED]          [StatusClass::Unauthorized];
        [test_classify_timeout]     [StatusCode::REQUEST_TIMEOUT]       [StatusClass::Transient];
        [test_classify_rate_limit]  [StatusCode::TOO_MANY_REQUESTS]     [StatusClass::Transient];
        [test_classify_503]         [StatusCode::SERVICE_UNAVAILABLE]   [StatusClass::Transient];
        [test_classify_500]         [StatusCode::INTERNAL_SERVER_ERROR] [StatusClass::Transient];
        [test_classify_bad_request] [StatusCode::BAD_REQUEST]           [StatusClass::Rejected];
        [test_classify_forbidden]   [StatusCode::FORBIDDEN]             [StatusClass::Rejected];
        [test_classify_too_large]   [StatusCode::PAYLOAD_TOO_LARGE]     [StatusClass::Rejected];
    )]
    #[test]
    fn test_name() {
        assert_eq!(classify_status(status), expected);
    }
}
