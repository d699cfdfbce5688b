// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cached credentials are refreshed once less than this much lifetime remains.
pub const DEFAULT_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Attempts made by the token provider before giving up on a refresh.
pub const TOKEN_REFRESH_ATTEMPTS: u32 = 3;
pub const TOKEN_REFRESH_RETRY_DELAY: Duration = Duration::from_millis(500);

pub const DEFAULT_APPEND_ATTEMPTS: u32 = 3;
pub const DEFAULT_APPEND_BACKOFF_BASE_MS: u64 = 250;
pub const DEFAULT_APPEND_BACKOFF_MAX_MS: u64 = 10_000;

pub const CAMERA_CHANNEL_PREFIX: &str = "NYC_CAM";
pub const EVENTS_CHANNEL_PREFIX: &str = "NYC_EVENTS";
pub const SPEEDS_CHANNEL_PREFIX: &str = "NYC_TRAFFIC";
pub const CHANNEL_NAME_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub const DISCOVERY_PATH: &str = "/discovery";
pub const CHANNELS_PATH: &str = "/channels";
pub const OAUTH_TOKEN_PATH: &str = "/oauth/token";

pub const DEFAULT_CAMERA_API_URL: &str = "https://511ny.org/api/getcameras";
pub const DEFAULT_SLACK_API_URL: &str = "https://slack.com/api";
pub const DEFAULT_SLACK_CHANNEL: &str = "#traffic-cameras";
pub const DEFAULT_SLACK_STATUS_EVERY: u64 = 5;
pub const DEFAULT_SLACK_IMAGES_PER_BATCH: usize = 3;
pub const DEFAULT_POSTGRES_TABLE: &str = "nyc_camera_data";
pub const DEFAULT_EVENTS_API_URL: &str = "https://511ny.org/api/getevents";
pub const DEFAULT_SPEEDS_API_URL: &str = "https://511ny.org/api/gettraffic";

/// Cameras tried per batch while looking for online ones to alert on.
pub const IMAGE_CHECK_ATTEMPTS: usize = 10;
/// Smaller images are placeholder frames served by offline cameras.
pub const MIN_IMAGE_BYTES: usize = 5000;

pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Lifetime of the signed key-pair assertion, and of the exchanged token when the
/// service does not say.
pub const JWT_LIFETIME: Duration = Duration::from_secs(3600);
