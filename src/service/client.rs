use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Page size used when the layer metadata does not report a maxRecordCount.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

const USER_AGENT: &str = concat!("mapfetch/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("could not reach map service at {url}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("map service at {url} returned an error: {message}")]
    Service { url: String, message: String },
    #[error("unexpected response from map service at {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("layer '{name}' not found at {url}; available layers: {}", .available.join(", "))]
    LayerNotFound {
        name: String,
        url: String,
        available: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerEntry {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct ServiceMetadata {
    #[serde(default)]
    layers: Vec<LayerEntry>,
}

#[derive(Debug, Deserialize)]
struct LayerMetadata {
    #[serde(rename = "maxRecordCount", default)]
    max_record_count: Option<u32>,
    #[serde(default)]
    extent: Option<Extent>,
}

#[derive(Debug, Deserialize)]
struct Extent {
    #[serde(rename = "spatialReference", default)]
    spatial_reference: Option<SpatialReference>,
}

#[derive(Debug, Deserialize)]
struct SpatialReference {
    #[serde(default)]
    wkid: Option<u32>,
    #[serde(rename = "latestWkid", default)]
    latest_wkid: Option<u32>,
}

// ArcGIS-style services report failures inside a 200 response body.
#[derive(Debug, Deserialize)]
struct EsriErrorEnvelope {
    error: EsriErrorBody,
}

#[derive(Debug, Deserialize)]
struct EsriErrorBody {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

/// A resolved sub-layer of a map service. Only obtainable through
/// [`MapService::resolve`], so holding one means resolution succeeded.
#[derive(Debug, Clone)]
pub struct LayerHandle {
    pub name: String,
    pub id: u32,
    pub query_url: String,
    pub page_size: u32,
    pub native_epsg: Option<u32>,
}

/// Connection to one remote map service and its layer listing.
///
/// The blocking HTTP client inside is not meant to be shared across
/// concurrent call sites; use one service value per logical caller.
pub struct MapService {
    url: String,
    http: reqwest::blocking::Client,
    layers: Vec<LayerEntry>,
}

impl MapService {
    /// Connect to a map service and read its layer listing. A service that
    /// cannot be reached or parsed is a typed error, never a half-built value.
    pub fn connect(url: &str) -> Result<Self, ResolutionError> {
        let url = url.trim_end_matches('/').to_string();
        let http = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ResolutionError::Unreachable {
                url: url.clone(),
                source,
            })?;
        let text = get_json_text(&http, &url)?;
        let metadata: ServiceMetadata = parse_esri_json(&text, &url)?;
        log::info!(
            "Connected to map service {} with {} layers",
            url,
            metadata.layers.len()
        );
        Ok(Self {
            url,
            http,
            layers: metadata.layers,
        })
    }

    pub fn http(&self) -> &reqwest::blocking::Client {
        &self.http
    }

    /// Layer names in the order the service reports them.
    pub fn list_layers(&self) -> Vec<String> {
        self.layers.iter().map(|entry| entry.name.clone()).collect()
    }

    /// Resolve a layer name against the listing and fetch its metadata.
    pub fn resolve(&self, layer_name: &str) -> Result<LayerHandle, ResolutionError> {
        let entry = find_layer_entry(&self.layers, layer_name).ok_or_else(|| {
            ResolutionError::LayerNotFound {
                name: layer_name.to_string(),
                url: self.url.clone(),
                available: self.list_layers(),
            }
        })?;
        let layer_url = format!("{}/{}", self.url, entry.id);
        let text = get_json_text(&self.http, &layer_url)?;
        let metadata: LayerMetadata = parse_esri_json(&text, &layer_url)?;

        let native_epsg = metadata
            .extent
            .and_then(|extent| extent.spatial_reference)
            .and_then(|reference| reference.latest_wkid.or(reference.wkid));
        let page_size = metadata.max_record_count.unwrap_or(DEFAULT_PAGE_SIZE);
        log::debug!(
            "Resolved layer '{}' (id {}, page size {}, native EPSG {:?})",
            entry.name,
            entry.id,
            page_size,
            native_epsg
        );
        Ok(LayerHandle {
            name: entry.name.clone(),
            id: entry.id,
            query_url: format!("{}/query", layer_url),
            page_size,
            native_epsg,
        })
    }
}

fn find_layer_entry<'a>(layers: &'a [LayerEntry], name: &str) -> Option<&'a LayerEntry> {
    layers.iter().find(|entry| entry.name == name)
}

fn get_json_text(http: &reqwest::blocking::Client, url: &str) -> Result<String, ResolutionError> {
    let unreachable = |source: reqwest::Error| ResolutionError::Unreachable {
        url: url.to_string(),
        source,
    };
    http.get(url)
        .query(&[("f", "json")])
        .send()
        .map_err(unreachable)?
        .error_for_status()
        .map_err(unreachable)?
        .text()
        .map_err(unreachable)
}

/// The failure message, if the body is the protocol's 200-with-error envelope.
pub(crate) fn esri_error_message(text: &str) -> Option<String> {
    serde_json::from_str::<EsriErrorEnvelope>(text)
        .ok()
        .map(|envelope| format!("{} (code {})", envelope.error.message, envelope.error.code))
}

fn parse_esri_json<T: DeserializeOwned>(text: &str, url: &str) -> Result<T, ResolutionError> {
    if let Some(message) = esri_error_message(text) {
        return Err(ResolutionError::Service {
            url: url.to_string(),
            message,
        });
    }
    serde_json::from_str(text).map_err(|source| ResolutionError::Malformed {
        url: url.to_string(),
        reason: source.to_string(),
    })
}
