// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::constants::MIN_IMAGE_BYTES;
use crate::errors::SinkError;
use crate::record::{Batch, Record};
use crate::sinks::{Notification, Notifier, RecordSink};

/// Turns batches into notifications: a summary on the first batch and every
/// `status_every`-th one after it, plus a few camera alerts per batch.
///
/// With an image check configured, alerts only go out for cameras whose still image
/// downloads; at most `max_attempts` cameras are tried per batch.
pub struct NotificationSink {
    notifier: Arc<dyn Notifier>,
    status_every: u64,
    alerts_per_batch: usize,
    subject: String,
    image_check: Option<ImageCheck>,
}

struct ImageCheck {
    client: reqwest::Client,
    max_attempts: usize,
}

impl ImageCheck {
    async fn is_online(&self, url: &str) -> bool {
        let response = match self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(response) => response,
            Err(e) => {
                debug!("SLACK | Camera image unavailable at {url}: {e}");
                return false;
            }
        };
        match response.bytes().await {
            Ok(body) if body.len() >= MIN_IMAGE_BYTES => true,
            Ok(body) => {
                debug!(
                    "SLACK | Camera image at {url} is a {} byte placeholder",
                    body.len()
                );
                false
            }
            Err(e) => {
                debug!("SLACK | Failed to read camera image at {url}: {e}");
                false
            }
        }
    }
}

impl NotificationSink {
    pub fn new(notifier: Arc<dyn Notifier>, status_every: u64, alerts_per_batch: usize) -> Self {
        Self {
            notifier,
            status_every,
            alerts_per_batch,
            subject: "cameras".to_string(),
            image_check: None,
        }
    }

    /// Noun used for the records in batch summaries.
    #[must_use]
    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    #[must_use]
    pub fn with_image_check(mut self, client: reqwest::Client, max_attempts: usize) -> Self {
        self.image_check = Some(ImageCheck {
            client,
            max_attempts,
        });
        self
    }

    fn wants_summary(&self, sequence: u64) -> bool {
        sequence == 1 || (self.status_every > 0 && sequence % self.status_every == 0)
    }

    async fn send_alerts(&self, batch: &Batch) -> Result<usize, SinkError> {
        if self.alerts_per_batch == 0 {
            return Ok(0);
        }
        let with_images = batch
            .records()
            .iter()
            .filter(|record| image_url(record).is_some());

        let Some(check) = &self.image_check else {
            let mut sent = 0;
            for record in fastrand::choose_multiple(with_images, self.alerts_per_batch) {
                self.alert(record).await?;
                sent += 1;
            }
            return Ok(sent);
        };

        let mut candidates: Vec<&Record> = with_images.collect();
        fastrand::shuffle(&mut candidates);
        let mut sent = 0;
        let mut offline = 0;
        for record in candidates.into_iter().take(check.max_attempts) {
            if sent >= self.alerts_per_batch {
                break;
            }
            let Some(url) = image_url(record) else {
                continue;
            };
            if check.is_online(url).await {
                self.alert(record).await?;
                sent += 1;
            } else {
                offline += 1;
            }
        }
        if sent < self.alerts_per_batch {
            debug!(
                "SLACK | Only {sent}/{} online cameras found ({offline} offline skipped)",
                self.alerts_per_batch
            );
        }
        Ok(sent)
    }

    async fn alert(&self, record: &Record) -> Result<(), SinkError> {
        self.notifier
            .notify(&Notification::CameraAlert(record.clone()))
            .await
    }
}

#[async_trait]
impl RecordSink for NotificationSink {
    fn name(&self) -> &str {
        "slack"
    }

    /// Returns the number of messages posted.
    async fn write(&self, batch: &Batch) -> Result<usize, SinkError> {
        let mut sent = 0;
        if self.wants_summary(batch.sequence()) {
            self.notifier
                .notify(&Notification::Text(batch_summary(batch, &self.subject)))
                .await?;
            sent += 1;
        }
        sent += self.send_alerts(batch).await?;
        debug!(
            "SLACK | Sent {sent} notifications for batch {}",
            batch.sequence()
        );
        Ok(sent)
    }
}

fn image_url(record: &Record) -> Option<&str> {
    record.get_str("image_url").filter(|url| !url.is_empty())
}

fn batch_summary(batch: &Batch, subject: &str) -> String {
    let mut roadways: Vec<&str> = batch
        .records()
        .iter()
        .filter_map(|record: &Record| record.get_str("roadway_name"))
        .filter(|roadway| !roadway.is_empty())
        .collect();
    roadways.sort_unstable();
    roadways.dedup();
    format!(
        "📊 Batch #{}: {} {subject} from {} roadways ingested at {}",
        batch.sequence(),
        batch.len(),
        roadways.len(),
        batch.captured_at().format("%Y-%m-%d %H:%M:%S UTC")
    )
}
