// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use snowpipe_streaming::{
    append::AppendEngine,
    channel::{ChannelSession, ChannelState, OffsetToken},
    client::IngestClient,
    credential::{OAuthRefreshSource, TokenProvider},
    discovery::{HostResolver, IngestionEndpoint},
    errors::AppendError,
    orchestrator::{BatchOrchestrator, OrchestratorConfig, TickOutcome},
    record::{Batch, Record},
    retry::RetryStrategy,
    source::CameraSource,
    stats::IngestionStats,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn camera(id: u32) -> Record {
    Record::new()
        .with("camera_id", id.to_string())
        .with("roadway_name", "I-87")
}

async fn discover(server: &ServerGuard, tokens: &TokenProvider) -> IngestionEndpoint {
    let credential = tokens.get_credential().await.unwrap();
    HostResolver::new(reqwest::Client::new(), &server.url())
        .discover_endpoint(&credential)
        .await
        .unwrap()
}

#[tokio::test]
async fn channel_session_advances_token_and_faults_on_mismatch() {
    let mut server = Server::new_async().await;
    let _discovery = server
        .mock("GET", "/discovery")
        .match_header("authorization", "Bearer mock-pat")
        .with_status(200)
        .with_body(json!({"host": server.url()}).to_string())
        .create_async()
        .await;
    let _open = server
        .mock("POST", "/channels")
        .match_body(Matcher::Json(json!({"channel_name": "NYC_CAM_20240101_000000"})))
        .with_status(200)
        .with_body(r#"{"continuation_token":"0_0","offset_token":"0"}"#)
        .create_async()
        .await;
    let first = server
        .mock("POST", "/channels/NYC_CAM_20240101_000000/append")
        .match_body(Matcher::PartialJson(
            json!({"continuation_token": "0_0", "offset_token": "1"}),
        ))
        .with_status(200)
        .with_body(r#"{"continuation_token":"0_1","offset_token":"1","rejected_rows":[]}"#)
        .create_async()
        .await;
    let stale = server
        .mock("POST", "/channels/NYC_CAM_20240101_000000/append")
        .match_body(Matcher::PartialJson(json!({"continuation_token": "0_1"})))
        .with_status(409)
        .with_body(r#"{"code":"STALE_CONTINUATION_TOKEN_SEQUENCER"}"#)
        .create_async()
        .await;

    let tokens = Arc::new(TokenProvider::new_from_static_token("mock-pat", "INGEST_USER"));
    let endpoint = discover(&server, &tokens).await;
    let client = IngestClient::new(reqwest::Client::new(), endpoint, tokens);
    let mut session = ChannelSession::new(
        AppendEngine::new(client, RetryStrategy::Immediate(1)),
        "NYC_CAM_20240101_000000".to_string(),
    );

    session.open().await.unwrap();
    let result = session
        .append(&Batch::new(1, vec![camera(1), camera(2), camera(3)]))
        .await
        .unwrap();
    first.assert_async().await;
    assert_eq!(result.accepted_rows(), 3);
    assert_eq!(session.continuation_token().unwrap().as_str(), "0_1");
    assert_eq!(session.last_committed_offset(), OffsetToken(1));

    let fault = session.append(&Batch::new(2, vec![camera(4)])).await;
    stale.assert_async().await;
    assert!(matches!(
        fault,
        Err(AppendError::ChannelFaulted { status: 409, code: Some(ref code) })
            if code == "STALE_CONTINUATION_TOKEN_SEQUENCER"
    ));
    assert_eq!(session.state(), ChannelState::Faulted);
    assert!(session.continuation_token().is_none());
    assert!(matches!(
        session.append(&Batch::new(3, vec![camera(5)])).await,
        Err(AppendError::InvalidState(ChannelState::Faulted))
    ));
}

#[tokio::test]
async fn reopen_never_reuses_a_confirmed_offset() {
    let mut server = Server::new_async().await;
    // The service forgets the position on reopen and reports offset 0.
    let open = server
        .mock("POST", "/channels")
        .with_status(200)
        .with_body(r#"{"continuation_token":"0_0","offset_token":"0"}"#)
        .expect(2)
        .create_async()
        .await;
    let first = server
        .mock("POST", "/channels/CAM/append")
        .match_body(Matcher::PartialJson(json!({"offset_token": "1"})))
        .with_status(200)
        .with_body(r#"{"continuation_token":"0_1","offset_token":"1"}"#)
        .create_async()
        .await;
    let after_reopen = server
        .mock("POST", "/channels/CAM/append")
        .match_body(Matcher::PartialJson(
            json!({"continuation_token": "0_0", "offset_token": "2"}),
        ))
        .with_status(200)
        .with_body(r#"{"continuation_token":"0_2","offset_token":"2"}"#)
        .create_async()
        .await;

    let client = IngestClient::new(
        reqwest::Client::new(),
        IngestionEndpoint::new(&server.url()),
        Arc::new(TokenProvider::new_from_static_token("mock-pat", "INGEST_USER")),
    );
    let mut session = ChannelSession::new(
        AppendEngine::new(client, RetryStrategy::Immediate(1)),
        "CAM".to_string(),
    );

    session.open().await.unwrap();
    session.append(&Batch::new(1, vec![camera(1)])).await.unwrap();
    session.reopen().await.unwrap();
    assert_eq!(session.last_committed_offset(), OffsetToken(1));
    session.append(&Batch::new(2, vec![camera(2)])).await.unwrap();

    open.assert_async().await;
    first.assert_async().await;
    after_reopen.assert_async().await;
    assert_eq!(session.last_committed_offset(), OffsetToken(2));
    assert_eq!(session.continuation_token().unwrap().as_str(), "0_2");
}

#[tokio::test]
async fn oauth_credential_is_used_for_discovery_and_appends() {
    let mut server = Server::new_async().await;
    let token = server
        .mock("POST", "/oauth/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-secret".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"access_token":"oauth-access","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;
    let _discovery = server
        .mock("GET", "/discovery")
        .match_header("authorization", "Bearer oauth-access")
        .with_status(200)
        .with_body(json!({"host": server.url()}).to_string())
        .create_async()
        .await;
    let _open = server
        .mock("POST", "/channels")
        .match_header("authorization", "Bearer oauth-access")
        .with_status(200)
        .with_body(r#"{"continuation_token":"0_0"}"#)
        .create_async()
        .await;
    let append = server
        .mock("POST", "/channels/CAM/append")
        .match_header("authorization", "Bearer oauth-access")
        .with_status(200)
        .with_body(r#"{"continuation_token":"0_1"}"#)
        .create_async()
        .await;

    let source = OAuthRefreshSource::new(
        reqwest::Client::new(),
        &server.url(),
        "refresh-secret",
        "session:role:PUBLIC database:DEMO schema:DEMO",
        "INGEST_USER",
    );
    let tokens = Arc::new(TokenProvider::new(Arc::new(source)));
    let endpoint = discover(&server, &tokens).await;
    let client = IngestClient::new(reqwest::Client::new(), endpoint, tokens);
    let mut session = ChannelSession::new(
        AppendEngine::new(client, RetryStrategy::Immediate(1)),
        "CAM".to_string(),
    );

    session.open().await.unwrap();
    session.append(&Batch::new(1, vec![camera(1)])).await.unwrap();

    // One refresh serves every request while the access token is fresh.
    token.assert_async().await;
    append.assert_async().await;
}

#[tokio::test]
async fn pipeline_streams_camera_records_until_cancelled() {
    let mut server = Server::new_async().await;
    let _cameras = server
        .mock("GET", "/api/getcameras")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!([
                {"ID": "1", "Name": "cam one", "RoadwayName": "I-87", "Disabled": "False", "Blocked": "False"},
                {"ID": "2", "Name": "cam two", "RoadwayName": "I-95", "Disabled": "True", "Blocked": "False"},
                {"ID": "3", "Name": "cam three", "RoadwayName": "I-95", "Disabled": "False", "Blocked": "False"}
            ])
            .to_string(),
        )
        .create_async()
        .await;
    let _open = server
        .mock("POST", "/channels")
        .with_status(200)
        .with_body(r#"{"continuation_token":"0_0","offset_token":"0"}"#)
        .create_async()
        .await;
    let append = server
        .mock("POST", "/channels/CAM/append")
        .with_status(200)
        .with_body(r#"{"continuation_token":"0_9"}"#)
        .expect(1)
        .create_async()
        .await;
    let close = server
        .mock("DELETE", "/channels/CAM")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let client = IngestClient::new(
        reqwest::Client::new(),
        IngestionEndpoint::new(&server.url()),
        Arc::new(TokenProvider::new_from_static_token("mock-pat", "INGEST_USER")),
    );
    let mut session = ChannelSession::new(
        AppendEngine::new(client, RetryStrategy::default()),
        "CAM".to_string(),
    );
    session.open().await.unwrap();

    let source = CameraSource::new(
        reqwest::Client::new(),
        &format!("{}/api/getcameras", server.url()),
        "test-key",
    );
    let mut orchestrator = BatchOrchestrator::new(
        Arc::new(source),
        session,
        Arc::new(IngestionStats::new()),
        OrchestratorConfig {
            interval: Duration::from_secs(3600),
            source_timeout: Duration::from_secs(5),
            sink_timeout: Duration::from_secs(1),
        },
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let snapshot = orchestrator.run(cancel).await.unwrap();
    append.assert_async().await;
    close.assert_async().await;
    assert_eq!(snapshot.batches, 1);
    assert_eq!(snapshot.rows_sent, 2);
    assert_eq!(snapshot.errors, 0);
    assert_eq!(snapshot.last_offset, Some(OffsetToken(1)));
    assert_eq!(orchestrator.session().state(), ChannelState::Closed);
}

#[tokio::test]
async fn tick_outcome_for_rejected_batch_is_dropped() {
    let mut server = Server::new_async().await;
    let _open = server
        .mock("POST", "/channels")
        .with_status(200)
        .with_body(r#"{"continuation_token":"0_0"}"#)
        .create_async()
        .await;
    let rejected = server
        .mock("POST", "/channels/CAM/append")
        .with_status(400)
        .with_body(r#"{"code":"INVALID_ROW"}"#)
        .expect(1)
        .create_async()
        .await;
    let _cameras = server
        .mock("GET", "/api/getcameras")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"[{"ID":"1"}]"#)
        .create_async()
        .await;

    let client = IngestClient::new(
        reqwest::Client::new(),
        IngestionEndpoint::new(&server.url()),
        Arc::new(TokenProvider::new_from_static_token("mock-pat", "INGEST_USER")),
    );
    let session = ChannelSession::new(
        AppendEngine::new(client, RetryStrategy::default()),
        "CAM".to_string(),
    );
    let mut orchestrator = BatchOrchestrator::new(
        Arc::new(CameraSource::new(
            reqwest::Client::new(),
            &format!("{}/api/getcameras", server.url()),
            "test-key",
        )),
        session,
        Arc::new(IngestionStats::new()),
        OrchestratorConfig::default(),
    );

    assert_eq!(orchestrator.run_tick().await.unwrap(), TickOutcome::Dropped);
    rejected.assert_async().await;
    // The channel is still usable for the next batch.
    assert_eq!(orchestrator.session().state(), ChannelState::Open);
    let snapshot = orchestrator.stats().snapshot();
    assert_eq!(snapshot.errors, 1);
    assert_eq!(snapshot.batches, 0);
}
