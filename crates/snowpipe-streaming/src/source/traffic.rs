// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::errors::SourceError;
use crate::record::Record;
use crate::source::{number, text, Feed, RecordSource};

/// Polls the 511NY traffic events API (incidents, construction, closures).
pub struct TrafficEventSource {
    feed: Feed,
}

impl TrafficEventSource {
    pub fn new(client: reqwest::Client, url: &str, api_key: &str) -> Self {
        Self {
            feed: Feed::new(client, url, api_key, "events", "traffic events"),
        }
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.feed.set_hostname(hostname);
        self
    }
}

#[async_trait]
impl RecordSource for TrafficEventSource {
    async fn poll(&self) -> Result<Vec<Record>, SourceError> {
        let events = self.feed.fetch().await?;
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let records = self.feed.map_entries(events, "ID", |event, event_id| {
            Some(
                Record::new()
                    .with("uuid", Uuid::new_v4().to_string())
                    .with("event_id", event_id)
                    .with("event_type", text(event, "EventType"))
                    .with("event_subtype", text(event, "EventSubType"))
                    .with("severity", text(event, "Severity"))
                    .with("roadway_name", text(event, "RoadwayName"))
                    .with("direction", text(event, "Direction"))
                    .with("description", text(event, "Description"))
                    .with("location", text(event, "Location"))
                    .with("latitude", number(event, "Latitude"))
                    .with("longitude", number(event, "Longitude"))
                    .with("start_date", text(event, "StartDate"))
                    .with("planned_end_date", text(event, "PlannedEndDate"))
                    .with("last_updated", text(event, "LastUpdated"))
                    .with("event_timestamp", timestamp.as_str())
                    .with("ingest_timestamp", timestamp.as_str())
                    .with("hostname", self.feed.hostname()),
            )
        });
        debug!("SOURCE | {} traffic events", records.len());
        Ok(records)
    }

    fn dropped_count(&self) -> u64 {
        self.feed.malformed_count()
    }
}

/// Polls the 511NY traffic speeds API, one record per road segment.
pub struct TrafficSpeedSource {
    feed: Feed,
}

impl TrafficSpeedSource {
    pub fn new(client: reqwest::Client, url: &str, api_key: &str) -> Self {
        Self {
            feed: Feed::new(client, url, api_key, "speeds", "traffic speeds"),
        }
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.feed.set_hostname(hostname);
        self
    }
}

#[async_trait]
impl RecordSource for TrafficSpeedSource {
    async fn poll(&self) -> Result<Vec<Record>, SourceError> {
        let segments = self.feed.fetch().await?;
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let records = self.feed.map_entries(segments, "ID", |segment, segment_id| {
            Some(
                Record::new()
                    .with("uuid", Uuid::new_v4().to_string())
                    .with("segment_id", segment_id)
                    .with("link_id", text(segment, "LinkId"))
                    .with("roadway_name", text(segment, "RoadwayName"))
                    .with("direction", text(segment, "Direction"))
                    .with("from_location", text(segment, "From"))
                    .with("to_location", text(segment, "To"))
                    .with("current_speed", number(segment, "Speed"))
                    .with("free_flow_speed", number(segment, "FreeFlowSpeed"))
                    .with("travel_time", number(segment, "TravelTime"))
                    .with("data_as_of", text(segment, "DataAsOf"))
                    .with("traffic_timestamp", timestamp.as_str())
                    .with("ingest_timestamp", timestamp.as_str())
                    .with("hostname", self.feed.hostname()),
            )
        });
        debug!("SOURCE | {} traffic segments", records.len());
        Ok(records)
    }

    fn dropped_count(&self) -> u64 {
        self.feed.malformed_count()
    }
}
