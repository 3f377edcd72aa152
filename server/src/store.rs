//! Metadata store – one MongoDB collection of `{_id, videoUrl, timestamp}`
//! documents, written once per stored video.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A persisted video location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub video_url: String,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub timestamp: DateTime<Utc>,
}

/// Anything that can persist a [`VideoRecord`].
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn insert(&self, record: &VideoRecord) -> Result<()>;
}

/// Insert one record for `video_url` and return its id.
///
/// Both `/upload` and `/storeVideoUrl` go through here.
pub async fn record_video(
    store: &dyn VideoStore,
    video_url: String,
    timestamp: DateTime<Utc>,
) -> Result<ObjectId> {
    let record = VideoRecord {
        id: ObjectId::new(),
        video_url,
        timestamp,
    };
    store.insert(&record).await?;
    info!("Inserted video URL {} with id {}", record.video_url, record.id);
    Ok(record.id)
}

/// MongoDB-backed store. The driver's `Client` pools connections, so one
/// instance is created at startup and shared by every request.
pub struct MongoStore {
    client: mongodb::Client,
    collection: mongodb::Collection<VideoRecord>,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self> {
        debug!("setting up mongo client");

        let client = mongodb::Client::with_uri_str(uri)
            .await
            .with_context(|| format!("Cannot create MongoDB client for {uri}"))?;
        let collection = client.database(database).collection(collection);

        info!("Metadata store: {database}.{}", collection.name());
        Ok(Self { client, collection })
    }

    /// Close every pooled connection.
    pub async fn shutdown(&self) {
        self.client.clone().shutdown().await;
        debug!("mongo client shut down");
    }
}

#[async_trait]
impl VideoStore for MongoStore {
    async fn insert(&self, record: &VideoRecord) -> Result<()> {
        self.collection
            .insert_one(record)
            .await
            .context("Failed to insert video record")?;
        Ok(())
    }
}
