use std::collections::HashMap;

use proj::Transform;
use thiserror::Error;

use crate::geofile::feature::{geometry_kind, Feature, FeatureTable, WGS84_EPSG};

use super::client::{esri_error_message, LayerHandle};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("query to layer '{layer}' timed out")]
    Timeout {
        layer: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("query to layer '{layer}' failed")]
    Http {
        layer: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("map service rejected query to layer '{layer}': {message}")]
    Service { layer: String, message: String },
    #[error("could not parse feature collection for layer '{layer}': {reason}")]
    Parse { layer: String, reason: String },
    #[error("layer '{layer}' returned features in unsupported CRS '{crs}'")]
    UnsupportedCrs { layer: String, crs: String },
    #[error("could not reproject layer '{layer}' from EPSG:{from_epsg}: {reason}")]
    Reproject {
        layer: String,
        from_epsg: u32,
        reason: String,
    },
    #[error("invalid spatial filter: {reason}")]
    InvalidFilter { reason: String },
}

/// A polygon restricting a fetch to intersecting features.
#[derive(Debug, Clone)]
pub struct SpatialFilter {
    polygon: geo::Polygon,
}

impl SpatialFilter {
    pub fn new(polygon: geo::Polygon) -> Self {
        Self { polygon }
    }

    /// Parse a GeoJSON geometry (or single feature) holding a polygon,
    /// expressed in WGS84 lon/lat.
    pub fn from_geojson(text: &str) -> Result<Self, FetchError> {
        let invalid = |reason: String| FetchError::InvalidFilter { reason };
        let geojson: geojson::GeoJson = text
            .parse()
            .map_err(|err: geojson::Error| invalid(err.to_string()))?;
        let geometry = match geojson {
            geojson::GeoJson::Geometry(geometry) => geometry,
            geojson::GeoJson::Feature(feature) => feature
                .geometry
                .ok_or_else(|| invalid("feature has no geometry".to_string()))?,
            geojson::GeoJson::FeatureCollection(_) => {
                return Err(invalid(
                    "expected a single polygon geometry, not a collection".to_string(),
                ))
            }
        };
        match geo::Geometry::try_from(geometry) {
            Ok(geo::Geometry::Polygon(polygon)) => Ok(Self::new(polygon)),
            Ok(other) => Err(invalid(format!(
                "expected a Polygon, got {}",
                geometry_kind(&other)
            ))),
            Err(err) => Err(invalid(err.to_string())),
        }
    }

    pub fn polygon(&self) -> &geo::Polygon {
        &self.polygon
    }

    /// Esri JSON rings representation used as the `geometry` query parameter.
    pub fn to_esri_json(&self) -> String {
        let mut rings = vec![ring_coords(self.polygon.exterior())];
        for interior in self.polygon.interiors() {
            rings.push(ring_coords(interior));
        }
        serde_json::json!({
            "rings": rings,
            "spatialReference": {"wkid": WGS84_EPSG},
        })
        .to_string()
    }
}

fn ring_coords(ring: &geo::LineString) -> Vec<[f64; 2]> {
    ring.coords().map(|coord| [coord.x, coord.y]).collect()
}

/// One page of query results. `returned` counts the rows the server sent,
/// including any dropped for missing geometry; offsets advance by it, not by
/// the kept count, so a dropped row never shifts later pages.
#[derive(Debug)]
struct FeaturePage {
    features: Vec<Feature>,
    returned: usize,
    exceeded_limit: bool,
    declared_crs: Option<String>,
}

/// Fetch every feature of a layer, optionally restricted to a polygon.
///
/// Pages through the layer with `resultOffset` so server-side record caps
/// never truncate the result, then normalizes the table to EPSG:4326.
/// Zero matching features is an empty table, not an error.
pub fn fetch(
    http: &reqwest::blocking::Client,
    handle: &LayerHandle,
    filter: Option<&SpatialFilter>,
) -> Result<FeatureTable, FetchError> {
    let (features, declared_crs) = collect_pages(handle.page_size, |offset| {
        fetch_page(http, handle, filter, offset)
    })?;
    log::info!(
        "Fetched {} features from layer '{}'",
        features.len(),
        handle.name
    );
    finalize_table(features, declared_crs, handle)
}

fn fetch_page(
    http: &reqwest::blocking::Client,
    handle: &LayerHandle,
    filter: Option<&SpatialFilter>,
    offset: u64,
) -> Result<FeaturePage, FetchError> {
    let mut params: Vec<(&str, String)> = vec![
        ("where", "1=1".to_string()),
        ("outFields", "*".to_string()),
        ("returnGeometry", "true".to_string()),
        ("f", "geojson".to_string()),
        ("outSR", WGS84_EPSG.to_string()),
        ("resultOffset", offset.to_string()),
        ("resultRecordCount", handle.page_size.to_string()),
    ];
    if let Some(filter) = filter {
        params.push(("geometry", filter.to_esri_json()));
        params.push(("geometryType", "esriGeometryPolygon".to_string()));
        params.push(("spatialRel", "esriSpatialRelIntersects".to_string()));
        params.push(("inSR", WGS84_EPSG.to_string()));
    }

    let http_err = |source: reqwest::Error| {
        if source.is_timeout() {
            FetchError::Timeout {
                layer: handle.name.clone(),
                source,
            }
        } else {
            FetchError::Http {
                layer: handle.name.clone(),
                source,
            }
        }
    };
    log::debug!(
        "Querying layer '{}' at offset {} (page size {})",
        handle.name,
        offset,
        handle.page_size
    );
    let text = http
        .get(&handle.query_url)
        .query(&params)
        .send()
        .map_err(http_err)?
        .error_for_status()
        .map_err(http_err)?
        .text()
        .map_err(http_err)?;
    parse_feature_page(&text, &handle.name)
}

/// Drain a page source until a page comes back that is neither full nor
/// marked with the server's exceeded-limit flag.
fn collect_pages<F>(
    page_size: u32,
    mut next_page: F,
) -> Result<(Vec<Feature>, Option<String>), FetchError>
where
    F: FnMut(u64) -> Result<FeaturePage, FetchError>,
{
    let mut features = Vec::new();
    let mut declared_crs = None;
    let mut offset = 0u64;
    loop {
        let page = next_page(offset)?;
        if declared_crs.is_none() {
            declared_crs = page.declared_crs;
        }
        offset += page.returned as u64;
        features.extend(page.features);
        if page.returned == 0 || (page.returned < page_size as usize && !page.exceeded_limit) {
            break;
        }
    }
    Ok((features, declared_crs))
}

fn parse_feature_page(text: &str, layer: &str) -> Result<FeaturePage, FetchError> {
    if let Some(message) = esri_error_message(text) {
        return Err(FetchError::Service {
            layer: layer.to_string(),
            message,
        });
    }
    let parse_err = |reason: String| FetchError::Parse {
        layer: layer.to_string(),
        reason,
    };
    let geojson: geojson::GeoJson = text
        .parse()
        .map_err(|err: geojson::Error| parse_err(err.to_string()))?;
    let collection = match geojson {
        geojson::GeoJson::FeatureCollection(collection) => collection,
        _ => return Err(parse_err("response is not a feature collection".to_string())),
    };

    let foreign = collection.foreign_members.as_ref();
    let exceeded_limit = foreign
        .and_then(|members| members.get("exceededTransferLimit"))
        .and_then(|value| value.as_bool())
        .unwrap_or(false);
    let declared_crs = foreign
        .and_then(|members| members.get("crs"))
        .and_then(|crs| crs.get("properties"))
        .and_then(|properties| properties.get("name"))
        .and_then(|name| name.as_str())
        .map(str::to_string);

    let returned = collection.features.len();
    let mut features = Vec::new();
    for geojson_feature in collection.features {
        let geometry = match geojson_feature.geometry {
            Some(geometry) => geometry,
            None => {
                log::warn!("Skipping feature without geometry in layer '{}'", layer);
                continue;
            }
        };
        let geometry =
            geo::Geometry::try_from(geometry).map_err(|err| parse_err(err.to_string()))?;
        let attributes = geojson_feature
            .properties
            .map(|properties| properties.into_iter().collect::<HashMap<_, _>>());
        features.push(Feature {
            geometry,
            attributes,
        });
    }
    Ok(FeaturePage {
        features,
        returned,
        exceeded_limit,
        declared_crs,
    })
}

/// Tag the table EPSG:4326, reprojecting first when the response declared a
/// different CRS. An unrecognizable declaration fails instead of mislabeling.
fn finalize_table(
    features: Vec<Feature>,
    declared_crs: Option<String>,
    handle: &LayerHandle,
) -> Result<FeatureTable, FetchError> {
    let declared = match declared_crs {
        // No crs member means WGS84 by the format's convention, which is
        // also what outSR asked for.
        None => return Ok(FeatureTable::new(features, WGS84_EPSG)),
        Some(declared) => declared,
    };
    let epsg = declared_epsg(&declared).ok_or_else(|| FetchError::UnsupportedCrs {
        layer: handle.name.clone(),
        crs: declared.clone(),
    })?;
    if epsg == WGS84_EPSG {
        return Ok(FeatureTable::new(features, WGS84_EPSG));
    }
    log::info!(
        "Layer '{}' answered in EPSG:{}, reprojecting to EPSG:{}",
        handle.name,
        epsg,
        WGS84_EPSG
    );
    let features = reproject_features(features, epsg, &handle.name)?;
    Ok(FeatureTable::new(features, WGS84_EPSG))
}

/// EPSG code of a declared CRS name such as "EPSG:3857",
/// "urn:ogc:def:crs:EPSG::3857" or "urn:ogc:def:crs:OGC:1.3:CRS84".
fn declared_epsg(name: &str) -> Option<u32> {
    if name.ends_with("CRS84") {
        return Some(WGS84_EPSG);
    }
    name.rsplit(':').next().and_then(|tail| tail.parse().ok())
}

fn reproject_features(
    features: Vec<Feature>,
    from_epsg: u32,
    layer: &str,
) -> Result<Vec<Feature>, FetchError> {
    let reproject_err = |reason: String| FetchError::Reproject {
        layer: layer.to_string(),
        from_epsg,
        reason,
    };
    let projection = proj::Proj::new_known_crs(
        &format!("EPSG:{}", from_epsg),
        &format!("EPSG:{}", WGS84_EPSG),
        None,
    )
    .map_err(|err| reproject_err(err.to_string()))?;
    features
        .into_iter()
        .map(|mut feature| {
            feature.geometry = feature
                .geometry
                .transformed(&projection)
                .map_err(|err| reproject_err(err.to_string()))?;
            Ok(feature)
        })
        .collect()
}
