// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::SinkError;
use crate::record::{Batch, Record};
use crate::sinks::RecordSink;

const MAX_CONNECTIONS: u32 = 4;

/// Relational copy of every batch.
pub struct PostgresSink {
    pool: PgPool,
    table: String,
}

impl PostgresSink {
    /// Creates the sink without connecting; the first write opens the pool.
    pub fn connect_lazy(
        database_url: &str,
        table: &str,
        acquire_timeout: Duration,
    ) -> Result<Self, SinkError> {
        let table = validate_table_name(table)?;
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)?;
        Ok(Self { pool, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Idempotent DDL for the table and its lookup indexes.
    pub async fn create_table(&self) -> Result<(), SinkError> {
        let mut tx = self.pool.begin().await?;
        for statement in create_table_statements(&self.table) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("POSTGRES | Table {} created/verified", self.table);
        Ok(())
    }
}

#[async_trait]
impl RecordSink for PostgresSink {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn write(&self, batch: &Batch) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let sql = insert_statement(&self.table);
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for record in batch.records() {
            let row = CameraRow::from(record);
            let result = sqlx::query(&sql)
                .bind(row.uuid)
                .bind(row.camera_id)
                .bind(row.name)
                .bind(row.latitude)
                .bind(row.longitude)
                .bind(row.direction_of_travel)
                .bind(row.roadway_name)
                .bind(row.video_url)
                .bind(row.image_url)
                .bind(row.disabled)
                .bind(row.blocked)
                .bind(row.image_timestamp)
                .bind(row.ingest_timestamp)
                .bind(row.hostname)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        debug!(
            "POSTGRES | Inserted {inserted} of {} records into {}",
            batch.len(),
            self.table
        );
        Ok(inserted)
    }
}

/// Column values for one record; absent fields become NULL.
#[derive(Debug, PartialEq)]
struct CameraRow<'a> {
    uuid: Option<&'a str>,
    camera_id: Option<&'a str>,
    name: Option<&'a str>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    direction_of_travel: Option<&'a str>,
    roadway_name: Option<&'a str>,
    video_url: Option<&'a str>,
    image_url: Option<&'a str>,
    disabled: Option<bool>,
    blocked: Option<bool>,
    image_timestamp: Option<&'a str>,
    ingest_timestamp: Option<&'a str>,
    hostname: Option<&'a str>,
}

impl<'a> From<&'a Record> for CameraRow<'a> {
    fn from(record: &'a Record) -> Self {
        Self {
            uuid: record.get_str("uuid"),
            camera_id: record.get_str("camera_id"),
            name: record.get_str("name"),
            latitude: record.get_f64("latitude"),
            longitude: record.get_f64("longitude"),
            direction_of_travel: record.get_str("direction_of_travel"),
            roadway_name: record.get_str("roadway_name"),
            video_url: record.get_str("video_url"),
            image_url: record.get_str("image_url"),
            disabled: record.get_bool("disabled"),
            blocked: record.get_bool("blocked"),
            image_timestamp: record.get_str("image_timestamp"),
            ingest_timestamp: record.get_str("ingest_timestamp"),
            hostname: record.get_str("hostname"),
        }
    }
}

// Table names are interpolated into SQL, so only plain identifiers are accepted.
fn validate_table_name(table: &str) -> Result<String, SinkError> {
    let valid = table
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(table.to_ascii_lowercase())
    } else {
        Err(SinkError::Rejected(format!("invalid table name {table:?}")))
    }
}

fn create_table_statements(table: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id SERIAL PRIMARY KEY,
                uuid VARCHAR(100) UNIQUE,
                camera_id VARCHAR(50),
                name VARCHAR(500),
                latitude DOUBLE PRECISION,
                longitude DOUBLE PRECISION,
                direction_of_travel VARCHAR(100),
                roadway_name VARCHAR(500),
                video_url VARCHAR(1000),
                image_url VARCHAR(1000),
                disabled BOOLEAN,
                blocked BOOLEAN,
                image_timestamp TIMESTAMPTZ,
                ingest_timestamp TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                hostname VARCHAR(100)
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_camera_id ON {table} (camera_id)"),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_image_timestamp ON {table} (image_timestamp)"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_roadway ON {table} (roadway_name)"),
    ]
}

fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} (
            uuid, camera_id, name, latitude, longitude,
            direction_of_travel, roadway_name, video_url, image_url,
            disabled, blocked, image_timestamp, ingest_timestamp, hostname
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
            CAST($12 AS TIMESTAMPTZ), COALESCE(CAST($13 AS TIMESTAMPTZ), CURRENT_TIMESTAMP), $14
        )
        ON CONFLICT (uuid) DO NOTHING"
    )
}
