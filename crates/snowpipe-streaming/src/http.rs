// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use reqwest::ClientBuilder;
use std::error::Error;

/// Creates a reqwest client builder backed by rustls.
pub fn create_reqwest_client_builder() -> ClientBuilder {
    reqwest::Client::builder().use_rustls_tls()
}

/// Builds a reqwest client with optional proxy configuration and timeout.
///
/// One client is shared by every component so connections to the ingestion host are
/// pooled across discovery, channel and append requests.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, Box<dyn Error + Send + Sync>> {
    let mut builder = create_reqwest_client_builder()
        .timeout(timeout)
        .user_agent(concat!("snowpipe-streaming/", env!("CARGO_PKG_VERSION")));
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}
