//! Delivery endpoints for matched listings.

use async_trait::async_trait;
use listwatch_core::Listing;
use listwatch_storage::{HttpClientConfig, HttpPoster, PostError, RetryDisposition};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

/// Discord caps embed descriptions at this many characters.
pub const MAX_DESCRIPTION_CHARS: usize = 2048;
/// Discord caps embed titles at this many characters.
pub const MAX_TITLE_CHARS: usize = 256;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("posting to channel: {0}")]
    Channel(#[from] PostError),
    /// The sink will never accept this listing.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Other(String),
}

impl DeliveryError {
    /// True when retrying the same listing cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            DeliveryError::Channel(err) => err.disposition() == RetryDisposition::NonRetryable,
            DeliveryError::Rejected(_) => true,
            DeliveryError::Other(_) => false,
        }
    }
}

/// Delivers one listing. Implementations own any retry they need.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn notify(&self, listing: &Listing) -> Result<(), DeliveryError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn notify(&self, listing: &Listing) -> Result<(), DeliveryError> {
        info!(
            listing_id = %listing.id,
            title = %listing.title,
            price = listing.price,
            url = %listing.url,
            updated_at = %listing.updated_at,
            distance_miles = ?listing.distance_miles,
            "notify listing"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelEmbed {
    pub title: String,
    pub url: String,
    pub description: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,
}

#[derive(Debug, Clone, Serialize)]
struct WebhookPayload {
    content: Option<String>,
    embeds: Vec<ChannelEmbed>,
}

fn location_part(listing: &Listing) -> String {
    match (
        listing.location.city.as_deref(),
        listing.location.state.as_deref(),
    ) {
        (None, None) => String::new(),
        (Some(city), None) => format!(" - {city}"),
        (None, Some(state)) => format!(" - {state}"),
        (Some(city), Some(state)) => format!(" - {city}, {state}"),
    }
}

/// Builds the rich message for one listing.
pub fn embed_for(listing: &Listing) -> ChannelEmbed {
    let distance_part = listing
        .distance_miles
        .map(|d| format!(" ({} mi. away)", d as i64))
        .unwrap_or_default();
    let description = format!(
        "**${}{}{}**\n\n{}",
        listing.price as i64,
        location_part(listing),
        distance_part,
        listing.body
    );
    let description = description.chars().take(MAX_DESCRIPTION_CHARS).collect();

    let image = if listing.image_urls.is_empty() {
        None
    } else {
        listing
            .thumbnail_url
            .clone()
            .or_else(|| listing.image_urls.first().cloned())
            .map(|url| EmbedImage { url })
    };

    ChannelEmbed {
        title: listing.title.chars().take(MAX_TITLE_CHARS).collect(),
        url: listing.url.clone(),
        description,
        timestamp: listing.updated_at.to_rfc3339(),
        image,
    }
}

/// Posts listings to a chat channel through its incoming webhook.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    webhook_url: String,
    poster: HttpPoster,
}

impl ChannelSink {
    pub fn new(webhook_url: impl Into<String>, http: HttpClientConfig) -> Result<Self, PostError> {
        Ok(Self {
            webhook_url: webhook_url.into(),
            poster: HttpPoster::new(http)?,
        })
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn notify(&self, listing: &Listing) -> Result<(), DeliveryError> {
        let payload = WebhookPayload {
            content: None,
            embeds: vec![embed_for(listing)],
        };
        self.poster.post_json(&self.webhook_url, &payload).await?;
        Ok(())
    }
}
