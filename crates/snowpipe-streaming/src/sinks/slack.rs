// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::errors::SinkError;
use crate::record::Record;
use crate::sinks::{Notification, Notifier};

#[derive(Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Posts notifications to a Slack channel through `chat.postMessage`.
pub struct SlackNotifier {
    client: reqwest::Client,
    api_url: String,
    token: String,
    channel: String,
}

impl SlackNotifier {
    pub fn new(client: reqwest::Client, api_url: &str, token: &str, channel: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            channel: channel.to_string(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn payload(&self, notification: &Notification) -> Value {
        match notification {
            Notification::Text(text) => json!({
                "channel": self.channel,
                "text": text,
            }),
            Notification::CameraAlert(record) => json!({
                "channel": self.channel,
                "text": format!("Camera update: {}", field(record, "name", "Unknown")),
                "blocks": camera_blocks(record),
            }),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), SinkError> {
        let response = self
            .client
            .post(format!("{}/chat.postMessage", self.api_url))
            .bearer_auth(&self.token)
            .json(&self.payload(notification))
            .send()
            .await?
            .error_for_status()?;
        let body: SlackResponse = response.json().await?;
        if !body.ok {
            let reason = body.error.unwrap_or_else(|| "unknown_error".to_string());
            error!("SLACK | Failed to post to {}: {reason}", self.channel);
            return Err(SinkError::Rejected(reason));
        }
        debug!("SLACK | Message sent to {}", self.channel);
        Ok(())
    }
}

fn field(record: &Record, name: &str, default: &str) -> String {
    match record.get(name) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Null) | None => default.to_string(),
        Some(Value::String(_)) => default.to_string(),
        Some(other) => other.to_string(),
    }
}

fn camera_blocks(record: &Record) -> Value {
    let name = field(record, "name", "Unknown Camera");
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {"type": "plain_text", "text": format!("📷 {name}"), "emoji": true}
        }),
        json!({
            "type": "section",
            "fields": [
                {"type": "mrkdwn", "text": format!("*Roadway:*\n{}", field(record, "roadway_name", "N/A"))},
                {"type": "mrkdwn", "text": format!("*Direction:*\n{}", field(record, "direction_of_travel", "N/A"))},
                {"type": "mrkdwn", "text": format!("*Latitude:*\n{}", field(record, "latitude", "N/A"))},
                {"type": "mrkdwn", "text": format!("*Longitude:*\n{}", field(record, "longitude", "N/A"))},
            ]
        }),
    ];
    if let Some(image_url) = record.get_str("image_url").filter(|url| !url.is_empty()) {
        blocks.push(json!({
            "type": "image",
            "image_url": image_url,
            "alt_text": name,
        }));
    }
    blocks.push(json!({
        "type": "context",
        "elements": [
            {"type": "mrkdwn", "text": format!("Camera ID: `{}`", field(record, "camera_id", "N/A"))}
        ]
    }));
    Value::Array(blocks)
}
