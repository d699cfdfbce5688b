// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::errors::SourceError;
use crate::record::Record;
use crate::source::{flag, number, text, Feed, RecordSource};

/// Polls the 511NY traffic camera API.
pub struct CameraSource {
    feed: Feed,
}

impl CameraSource {
    pub fn new(client: reqwest::Client, url: &str, api_key: &str) -> Self {
        Self {
            feed: Feed::new(client, url, api_key, "cameras", "cameras"),
        }
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.feed.set_hostname(hostname);
        self
    }

    /// Entries dropped so far because they could not be turned into records.
    pub fn malformed_count(&self) -> u64 {
        self.feed.malformed_count()
    }

    fn process(&self, cameras: Vec<Value>) -> Vec<Record> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let total = cameras.len();
        let mut inactive = 0;

        let records = self.feed.map_entries(cameras, "ID", |camera, camera_id| {
            let disabled = flag(camera, "Disabled");
            let blocked = flag(camera, "Blocked");
            if disabled || blocked {
                inactive += 1;
                return None;
            }
            Some(
                Record::new()
                    .with("uuid", Uuid::new_v4().to_string())
                    .with("camera_id", camera_id)
                    .with("name", text(camera, "Name"))
                    .with("latitude", number(camera, "Latitude"))
                    .with("longitude", number(camera, "Longitude"))
                    .with("direction_of_travel", text(camera, "DirectionOfTravel"))
                    .with("roadway_name", text(camera, "RoadwayName"))
                    .with("video_url", text(camera, "VideoUrl"))
                    .with("image_url", text(camera, "Url"))
                    .with("disabled", disabled)
                    .with("blocked", blocked)
                    .with("image_timestamp", timestamp.as_str())
                    .with("ingest_timestamp", timestamp.as_str())
                    .with("hostname", self.feed.hostname()),
            )
        });

        debug!(
            "SOURCE | {} active cameras out of {total} ({inactive} disabled or blocked)",
            records.len()
        );
        records
    }
}

#[async_trait]
impl RecordSource for CameraSource {
    async fn poll(&self) -> Result<Vec<Record>, SourceError> {
        let cameras = self.feed.fetch().await?;
        Ok(self.process(cameras))
    }

    fn dropped_count(&self) -> u64 {
        self.feed.malformed_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn source(server: &Server) -> CameraSource {
        CameraSource::new(
            reqwest::Client::new(),
            &format!("{}/api/getcameras", server.url()),
            "test-key",
        )
        .with_hostname("collector-1")
    }

    #[tokio::test]
    async fn test_poll_maps_cameras_to_records() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/getcameras")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("key".into(), "test-key".into()),
                Matcher::UrlEncoded("format".into(), "json".into()),
            ]))
            .with_status(200)
            .with_body(
                json!([{
                    "ID": "NYSDOT_1",
                    "Name": "I-87 at Exit 1",
                    "Latitude": 40.85,
                    "Longitude": "-73.93",
                    "DirectionOfTravel": "Northbound",
                    "RoadwayName": "I-87",
                    "VideoUrl": "https://video.example/1",
                    "Url": "https://images.example/1.jpg",
                    "Disabled": "False",
                    "Blocked": "False"
                }])
                .to_string(),
            )
            .create_async()
            .await;

        let records = source(&server).poll().await.unwrap();
        mock.assert_async().await;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.get_str("camera_id"), Some("NYSDOT_1"));
        assert_eq!(record.get_str("roadway_name"), Some("I-87"));
        assert_eq!(record.get_str("image_url"), Some("https://images.example/1.jpg"));
        assert_eq!(record.get_f64("latitude"), Some(40.85));
        assert_eq!(record.get_f64("longitude"), Some(-73.93));
        assert_eq!(record.get_bool("disabled"), Some(false));
        assert_eq!(record.get_str("hostname"), Some("collector-1"));
        assert_eq!(
            record.get_str("image_timestamp"),
            record.get_str("ingest_timestamp")
        );
        assert!(Uuid::parse_str(record.get_str("uuid").unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_poll_accepts_wrapped_list_and_skips_inactive() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/getcameras")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({"cameras": [
                    {"ID": 1, "Name": "active"},
                    {"ID": 2, "Disabled": "True"},
                    {"ID": 3, "Blocked": true},
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let source = source(&server);
        let records = source.poll().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get_str("camera_id"), Some("1"));
        assert_eq!(records[0].get("latitude"), Some(&Value::Null));
        assert_eq!(source.malformed_count(), 0);
    }

    #[tokio::test]
    async fn test_poll_drops_and_counts_malformed_entries() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/getcameras")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!([{"ID": "A"}, "not a camera", {"Name": "no id"}, {"ID": ""}]).to_string())
            .expect(2)
            .create_async()
            .await;

        let source = source(&server);
        let records = source.poll().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(source.malformed_count(), 3);
        source.poll().await.unwrap();
        assert_eq!(source.dropped_count(), 6);
    }

    #[tokio::test]
    async fn test_poll_non_success_status() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/getcameras")
            .match_query(Matcher::Any)
            .with_status(502)
            .create_async()
            .await;

        assert!(matches!(
            source(&server).poll().await,
            Err(SourceError::Status(502))
        ));
    }

    #[tokio::test]
    async fn test_poll_rejects_unexpected_payload() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/getcameras")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"error":"invalid key"}"#)
            .create_async()
            .await;

        assert!(matches!(
            source(&server).poll().await,
            Err(SourceError::Decode(_))
        ));
    }
}
