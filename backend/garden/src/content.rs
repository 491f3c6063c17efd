//! Static content client — impact stories, donation projects, milestones and
//! district boundaries served as JSON documents under `{base}/data/`.
//!
//! Content is decorative. Every fetch degrades to an empty result (and a
//! warning) instead of failing the caller.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;

// ─────────────────────────────────────────────────────────
// Content shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactStory {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub district_id: Option<i64>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub district_id: Option<i64>,
    #[serde(default)]
    pub goal: f64,
    #[serde(default)]
    pub raised: f64,
}

impl Project {
    /// Raised amount shown on this device: the published figure plus what
    /// this device donated since the content was last published.
    pub fn displayed_raised(&self, local_donations: f64) -> f64 {
        self.raised + local_donations.max(0.0)
    }
}

/// A project as shown to the user, with its raised amount adjusted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectView {
    #[serde(flatten)]
    pub project: Project,
    pub displayed_raised: f64,
}

impl ProjectView {
    pub fn new(project: Project, local_donations: f64) -> Self {
        Self {
            displayed_raised: project.displayed_raised(local_donations),
            project,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub target: f64,
    #[serde(default)]
    pub reward: Option<i64>,
}

/// Content ids show up both as JSON strings and as JSON numbers.
fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ContentClient {
    client: Client,
    base_url: String,
}

impl ContentClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn stories(&self) -> Vec<ImpactStory> {
        self.list("stories.json").await
    }

    pub async fn projects(&self) -> Vec<Project> {
        self.list("projects.json").await
    }

    pub async fn milestones(&self) -> Vec<Milestone> {
        self.list("milestones.json").await
    }

    /// District boundaries as raw GeoJSON.
    pub async fn districts(&self) -> Option<Value> {
        match self.fetch::<Value>("districts.geojson").await {
            Ok(geojson) => Some(geojson),
            Err(e) => {
                warn!("District boundaries unavailable: {e}");
                None
            }
        }
    }

    async fn list<T: DeserializeOwned>(&self, document: &str) -> Vec<T> {
        match self.fetch::<Vec<T>>(document).await {
            Ok(items) => {
                debug!("Fetched {} entries from {document}", items.len());
                items
            }
            Err(e) => {
                warn!("Content {document} unavailable, showing nothing: {e}");
                Vec::new()
            }
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, document: &str) -> Result<T> {
        let url = format!("{}/data/{document}", self.base_url);
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<T>()
            .await?;
        Ok(body)
    }
}
