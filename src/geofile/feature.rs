use std::collections::HashMap;

pub const WGS84_EPSG: u32 = 4326;

/// One geospatial record: a geometry plus the attribute values the remote
/// layer reported for it. Attribute values keep their JSON types so the
/// writer can map them onto typed OGR fields.
#[derive(Debug, Clone)]
pub struct Feature {
    pub geometry: geo::Geometry,
    pub attributes: Option<HashMap<String, serde_json::Value>>,
}

impl From<geo::Geometry> for Feature {
    fn from(value: geo::Geometry) -> Self {
        Self {
            geometry: value,
            attributes: None,
        }
    }
}

/// An ordered feature collection tagged with the single EPSG code shared by
/// every row. Tables coming out of a fetch are always EPSG:4326.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub features: Vec<Feature>,
    pub epsg: u32,
}

impl FeatureTable {
    pub fn new(features: Vec<Feature>, epsg: u32) -> Self {
        Self { features, epsg }
    }

    pub fn empty_wgs84() -> Self {
        Self::new(Vec::new(), WGS84_EPSG)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// The union of attribute names across all rows, sorted for stable output.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .features
            .iter()
            .filter_map(|feature| feature.attributes.as_ref())
            .flat_map(|attributes| attributes.keys().cloned())
            .collect::<std::collections::HashSet<String>>()
            .into_iter()
            .collect();
        names.sort();
        names
    }
}

/// Short geometry-type name for diagnostics.
pub fn geometry_kind(geometry: &geo::Geometry) -> &'static str {
    match geometry {
        geo::Geometry::Point(_) => "Point",
        geo::Geometry::Line(_) => "Line",
        geo::Geometry::LineString(_) => "LineString",
        geo::Geometry::Polygon(_) => "Polygon",
        geo::Geometry::MultiPoint(_) => "MultiPoint",
        geo::Geometry::MultiLineString(_) => "MultiLineString",
        geo::Geometry::MultiPolygon(_) => "MultiPolygon",
        geo::Geometry::GeometryCollection(_) => "GeometryCollection",
        geo::Geometry::Rect(_) => "Rect",
        geo::Geometry::Triangle(_) => "Triangle",
    }
}
