// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, future::Future, process, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use snowpipe_streaming::{
    append::AppendEngine,
    channel::{channel_name, ChannelSession},
    client::IngestClient,
    config::{AuthMethod, Config, SourceKind},
    constants::IMAGE_CHECK_ATTEMPTS,
    credential::{
        CredentialSource, JwtKeyPairSource, OAuthRefreshSource, StaticToken, TokenProvider,
    },
    errors::AuthError,
    discovery::HostResolver,
    http::build_client,
    orchestrator::BatchOrchestrator,
    sinks::{
        notification::NotificationSink, postgres::PostgresSink, slack::SlackNotifier,
        Notification, Notifier,
    },
    source::{CameraSource, RecordSource, TrafficEventSource, TrafficSpeedSource},
    stats::{IngestionStats, StatsSnapshot},
};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,sqlx=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on pipeline startup: {e:#}");
            process::exit(1);
        }
    };
    let Some(api_key) = config.ny511_api_key.clone() else {
        error!("NY511_API_KEY not set, nothing to collect");
        process::exit(1);
    };

    let http = match build_client(config.proxy_url.as_deref(), config.request_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to create HTTP client: {e}");
            process::exit(1);
        }
    };

    let credentials = match credential_source(&config, &http) {
        Ok(source) => source,
        Err(e) => {
            error!("Unable to load credentials: {e}");
            process::exit(1);
        }
    };
    let tokens = Arc::new(
        TokenProvider::new(credentials).with_refresh_margin(config.token_refresh_margin),
    );
    let credential = match tokens.get_credential().await {
        Ok(credential) => credential,
        Err(e) => {
            error!("Authentication failed: {e}");
            process::exit(1);
        }
    };
    info!("Authenticated as {}", credential.principal());

    let endpoint = match HostResolver::new(http.clone(), &config.account_url)
        .discover_endpoint(&credential)
        .await
    {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("Unable to discover ingest host: {e}");
            process::exit(1);
        }
    };

    let client = IngestClient::new(http.clone(), endpoint, tokens);
    let mut session = ChannelSession::new(
        AppendEngine::new(client, config.retry_strategy()),
        channel_name(&config.channel_name_prefix, chrono::Utc::now()),
    );
    if let Err(e) = session.open().await {
        error!("Unable to open channel {}: {e}", session.name());
        process::exit(1);
    }

    let source: Arc<dyn RecordSource> = match config.source {
        SourceKind::Cameras => Arc::new(CameraSource::new(
            http.clone(),
            &config.source_url,
            &api_key,
        )),
        SourceKind::Events => Arc::new(TrafficEventSource::new(
            http.clone(),
            &config.source_url,
            &api_key,
        )),
        SourceKind::Speeds => Arc::new(TrafficSpeedSource::new(
            http.clone(),
            &config.source_url,
            &api_key,
        )),
    };
    let stats = Arc::new(IngestionStats::new());
    let mut orchestrator = BatchOrchestrator::new(
        source,
        session,
        Arc::clone(&stats),
        config.orchestrator_config(),
    );

    if config.source != SourceKind::Cameras {
        if config.postgres.is_some() {
            info!("PostgreSQL sink only stores camera records, disabled");
        }
    } else if let Some(pg) = &config.postgres {
        match start_postgres(&pg.database_url, &pg.table, config.sink_timeout).await {
            Some(sink) => orchestrator = orchestrator.with_sink(Arc::new(sink)),
            None => warn!("PostgreSQL sink disabled"),
        }
    } else {
        info!("DATABASE_URL not set, PostgreSQL sink disabled");
    }

    let notifier: Option<Arc<dyn Notifier>> = config.slack.as_ref().map(|slack| {
        info!("Slack notifications enabled for {}", slack.channel);
        let notifier: Arc<dyn Notifier> = Arc::new(SlackNotifier::new(
            http.clone(),
            &slack.api_url,
            &slack.token,
            &slack.channel,
        ));
        notifier
    });
    if let (Some(notifier), Some(slack)) = (&notifier, &config.slack) {
        let sink = NotificationSink::new(
            Arc::clone(notifier),
            slack.status_every,
            slack.images_per_batch,
        )
        .with_subject(config.source.noun())
        .with_image_check(http.clone(), IMAGE_CHECK_ATTEMPTS);
        orchestrator = orchestrator.with_sink(Arc::new(sink));
    }

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    send_lifecycle(
        notifier.as_deref(),
        format!(
            "🚦 NYC {} pipeline started on {} (every {}s)",
            config.source.noun(),
            orchestrator.session().name(),
            config.poll_interval.as_secs_f64()
        ),
        config.sink_timeout,
    )
    .await;

    let result = orchestrator.run(cancel).await;

    let snapshot = match &result {
        Ok(snapshot) => snapshot.clone(),
        Err(_) => stats.snapshot(),
    };
    send_lifecycle(
        notifier.as_deref(),
        shutdown_message(&snapshot),
        config.sink_timeout,
    )
    .await;

    if let Err(e) = result {
        error!("Pipeline stopped: {e}");
        process::exit(1);
    }
    info!("Pipeline stopped");
}

fn credential_source(
    config: &Config,
    http: &reqwest::Client,
) -> Result<Arc<dyn CredentialSource>, AuthError> {
    Ok(match &config.auth {
        AuthMethod::AccessToken(token) => Arc::new(StaticToken::new(token, &config.user)),
        AuthMethod::RefreshToken {
            refresh_token,
            client_id,
            client_secret,
        } => {
            let mut source = OAuthRefreshSource::new(
                http.clone(),
                &config.account_url,
                refresh_token,
                &config.oauth_scope(),
                &config.user,
            );
            if let Some(client_id) = client_id {
                source = source.with_client_credentials(client_id, client_secret.as_deref());
            }
            Arc::new(source)
        }
        AuthMethod::KeyPair {
            private_key_path,
            passphrase,
        } => Arc::new(JwtKeyPairSource::from_pem_file(
            http.clone(),
            &config.account_url,
            &config.account,
            &config.user,
            private_key_path,
            passphrase.as_deref(),
            &config.role_scope(),
        )?),
    })
}

async fn start_postgres(database_url: &str, table: &str, timeout: Duration) -> Option<PostgresSink> {
    let sink = match PostgresSink::connect_lazy(database_url, table, timeout) {
        Ok(sink) => sink,
        Err(e) => {
            warn!("Unable to configure PostgreSQL sink: {e}");
            return None;
        }
    };
    match tokio::time::timeout(timeout, sink.create_table()).await {
        Ok(Ok(())) => {
            info!("PostgreSQL sink writing to {}", sink.table());
            Some(sink)
        }
        Ok(Err(e)) => {
            warn!("Unable to prepare PostgreSQL table {}: {e}", sink.table());
            None
        }
        Err(_) => {
            warn!("Timed out preparing PostgreSQL table {}", sink.table());
            None
        }
    }
}

async fn send_lifecycle(notifier: Option<&dyn Notifier>, message: String, timeout: Duration) {
    let Some(notifier) = notifier else {
        return;
    };
    match tokio::time::timeout(timeout, notifier.notify(&Notification::Text(message))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to send lifecycle notification: {e}"),
        Err(_) => warn!("Lifecycle notification timed out"),
    }
}

fn shutdown_message(snapshot: &StatsSnapshot) -> String {
    format!(
        "🛑 NYC traffic pipeline stopped: {} rows in {} batches ({} errors) over {:.0}s",
        snapshot.rows_sent,
        snapshot.batches,
        snapshot.errors,
        snapshot.elapsed.as_secs_f64()
    )
}

async fn wait_for_shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    let signal = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            first_signal(tokio::signal::ctrl_c(), async move { sigterm.recv().await }).await
        }
        Err(e) => {
            warn!("Unable to listen for SIGTERM: {e}");
            first_signal(tokio::signal::ctrl_c(), std::future::pending()).await
        }
    };
    #[cfg(not(unix))]
    let signal = first_signal(tokio::signal::ctrl_c(), std::future::pending()).await;

    info!("Received {signal}, finishing the current tick");
    cancel.cancel();
}

/// Name of the first shutdown signal received. A listener that fails or closes never
/// resolves, so it cannot stop the pipeline on its own.
async fn first_signal<I, T>(sigint: I, sigterm: T) -> &'static str
where
    I: Future<Output = std::io::Result<()>>,
    T: Future<Output = Option<()>>,
{
    let sigint = async {
        if let Err(e) = sigint.await {
            warn!("Unable to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };
    let sigterm = async {
        if sigterm.await.is_none() {
            warn!("SIGTERM listener closed");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        () = sigint => "SIGINT",
        () = sigterm => "SIGTERM",
    }
}
