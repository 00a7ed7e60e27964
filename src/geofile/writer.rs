use gdal::vector::LayerAccess;
use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use super::feature::{geometry_kind, Feature, FeatureTable};

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("unsupported output format '{0}', expected 'geopackage' or 'shapefile'")]
    UnsupportedFormat(String),
    #[error("refusing to write empty feature table for layer '{0}'")]
    EmptyTable(String),
    #[error("cannot write geometry type {0} to a geofile")]
    UnsupportedGeometry(&'static str),
    #[error("feature table mixes geometry types {0} and {1}")]
    MixedGeometry(&'static str, &'static str),
    #[error("could not create output folder {folder:?}")]
    Io {
        folder: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write {path:?}")]
    Gdal {
        path: PathBuf,
        #[source]
        source: gdal::errors::GdalError,
    },
    #[error("could not encode geometry as WKB")]
    Wkb,
}

/// On-disk vector formats the persister knows how to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum OutputFormat {
    GeoPackage,
    Shapefile,
}

impl OutputFormat {
    pub fn gdal_driver(&self) -> &'static str {
        match self {
            OutputFormat::GeoPackage => "GPKG",
            OutputFormat::Shapefile => "ESRI Shapefile",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::GeoPackage => "gpkg",
            OutputFormat::Shapefile => "shp",
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::GeoPackage
    }
}

impl FromStr for OutputFormat {
    type Err = SaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "geopackage" | "gpkg" => Ok(OutputFormat::GeoPackage),
            "shapefile" | "shp" => Ok(OutputFormat::Shapefile),
            other => Err(SaveError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl TryFrom<String> for OutputFormat {
    type Error = SaveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Where and how a table gets written. Constructed fresh per call, with
/// serde defaults filling in folder "." and GeoPackage output.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveConfig {
    #[serde(default = "default_folder")]
    pub folder: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub allow_empty: bool,
}

fn default_folder() -> PathBuf {
    PathBuf::from(".")
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            format: OutputFormat::default(),
            allow_empty: false,
        }
    }
}

/// Write a feature table to `{folder}/{layer_name}.{ext}`, creating the
/// folder if needed. Empty tables are refused unless the config opts in.
pub fn save_table(
    table: &FeatureTable,
    layer_name: &str,
    config: &SaveConfig,
) -> Result<PathBuf, SaveError> {
    if table.is_empty() && !config.allow_empty {
        return Err(SaveError::EmptyTable(layer_name.to_string()));
    }
    std::fs::create_dir_all(&config.folder).map_err(|source| SaveError::Io {
        folder: config.folder.clone(),
        source,
    })?;
    let output_filepath = config
        .folder
        .join(format!("{}.{}", layer_name, config.format.extension()));
    let gdal_err = |source: gdal::errors::GdalError| SaveError::Gdal {
        path: output_filepath.clone(),
        source,
    };

    let driver =
        gdal::DriverManager::get_driver_by_name(config.format.gdal_driver()).map_err(gdal_err)?;
    let layer_type = uniform_geometry_type(&table.features)?;
    let crs = gdal::spatial_ref::SpatialRef::from_epsg(table.epsg).map_err(gdal_err)?;
    log::debug!("Using EPSG:{} for writing geofile", table.epsg);

    let mut dataset = driver
        .create_vector_only(&output_filepath)
        .map_err(gdal_err)?;
    let layer_options = gdal::LayerOptions {
        name: layer_name,
        srs: Some(&crs),
        ty: layer_type,
        options: None,
    };
    let mut layer = dataset.create_layer(layer_options).map_err(gdal_err)?;

    let schema = field_schema(&table.features);
    let field_definitions: Vec<(&str, gdal::vector::OGRFieldType::Type)> = schema
        .iter()
        .map(|(name, field_type)| (name as &str, *field_type))
        .collect();
    layer.create_defn_fields(&field_definitions).map_err(gdal_err)?;

    log::info!(
        "Writing {} features to {:?}",
        table.len(),
        output_filepath
    );
    unsafe {
        // Committing all features at once is a massive speedup for drivers
        // with transaction support, e.g. GeoPackage.
        gdal_sys::OGR_L_StartTransaction(layer.c_layer());
    };
    match write_features_to_layer(&mut layer, table, &schema, &output_filepath) {
        Ok(()) => {
            unsafe {
                gdal_sys::OGR_L_CommitTransaction(layer.c_layer());
            };
            Ok(output_filepath)
        }
        Err(err) => {
            // A failed save must not leave a half-written dataset behind.
            unsafe {
                gdal_sys::OGR_L_RollbackTransaction(layer.c_layer());
            };
            drop(layer);
            drop(dataset);
            remove_partial_output(&output_filepath, config.format);
            Err(err)
        }
    }
}

fn write_features_to_layer(
    layer: &mut gdal::vector::Layer,
    table: &FeatureTable,
    schema: &[(String, gdal::vector::OGRFieldType::Type)],
    output_filepath: &Path,
) -> Result<(), SaveError> {
    let gdal_err = |source: gdal::errors::GdalError| SaveError::Gdal {
        path: output_filepath.to_path_buf(),
        source,
    };
    let bar = ProgressBar::new(table.len() as u64);
    for feature in &table.features {
        let wkb_bytes = wkb::geom_to_wkb(&feature.geometry).or(Err(SaveError::Wkb))?;
        let geometry = gdal::vector::Geometry::from_wkb(&wkb_bytes).map_err(gdal_err)?;

        match &feature.attributes {
            Some(attributes) => {
                let mut field_names = Vec::new();
                let mut values = Vec::new();
                for (name, field_type) in schema {
                    if let Some(value) = attributes
                        .get(name)
                        .and_then(|value| ogr_field_value(value, *field_type))
                    {
                        field_names.push(name as &str);
                        values.push(value);
                    }
                }
                layer
                    .create_feature_fields(geometry, &field_names, &values)
                    .map_err(gdal_err)?;
            }
            None => layer.create_feature(geometry).map_err(gdal_err)?,
        }
        bar.inc(1);
    }
    Ok(())
}

/// Best-effort cleanup of a dataset a failed save left behind; shapefiles
/// bring their sidecar files along.
fn remove_partial_output(output_filepath: &Path, format: OutputFormat) {
    let mut paths = vec![output_filepath.to_path_buf()];
    if format == OutputFormat::Shapefile {
        for extension in ["shx", "dbf", "prj", "cpg"] {
            paths.push(output_filepath.with_extension(extension));
        }
    }
    for path in paths {
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!("Could not remove partial output {:?}: {}", path, err);
            }
        }
    }
}

/// Read features back out of a geofile. Geometry comes through WKB, field
/// values keep their OGR types as JSON values.
pub fn read_table(filepath: &Path) -> Result<Vec<Feature>, SaveError> {
    gdal::DriverManager::register_all();
    let gdal_err = |source: gdal::errors::GdalError| SaveError::Gdal {
        path: filepath.to_path_buf(),
        source,
    };
    let mut open_options = gdal::DatasetOptions::default();
    open_options.open_flags = gdal::GdalOpenFlags::GDAL_OF_VECTOR;
    let dataset = gdal::Dataset::open_ex(filepath, open_options).map_err(gdal_err)?;
    let mut layer = dataset.layer(0).map_err(gdal_err)?;

    let mut features = Vec::new();
    for gdal_feature in layer.features() {
        let wkb_bytes = gdal_feature.geometry().wkb().map_err(gdal_err)?;
        let geometry = wkb::wkb_to_geom(&mut wkb_bytes.as_slice()).or(Err(SaveError::Wkb))?;

        let mut attributes = HashMap::new();
        for (name, value) in gdal_feature.fields() {
            use gdal::vector::FieldValue;
            let json_value = match value {
                Some(FieldValue::IntegerValue(v)) => serde_json::json!(v),
                Some(FieldValue::Integer64Value(v)) => serde_json::json!(v),
                Some(FieldValue::RealValue(v)) => serde_json::json!(v),
                Some(FieldValue::StringValue(v)) => serde_json::json!(v),
                Some(_) => {
                    log::warn!("Skipping field '{}' with unsupported OGR type", name);
                    continue;
                }
                None => continue,
            };
            attributes.insert(name, json_value);
        }
        features.push(Feature {
            geometry,
            attributes: if attributes.is_empty() {
                None
            } else {
                Some(attributes)
            },
        });
    }
    Ok(features)
}

/// All features must share one geometry type; the layer is created with it.
/// An empty table maps to an unknown-typed layer.
fn uniform_geometry_type(
    features: &[Feature],
) -> Result<gdal::vector::OGRwkbGeometryType::Type, SaveError> {
    use gdal::vector::OGRwkbGeometryType::*;
    let mut found: Option<(gdal::vector::OGRwkbGeometryType::Type, &'static str)> = None;
    for feature in features {
        let kind = geometry_kind(&feature.geometry);
        let layer_type = match &feature.geometry {
            geo::Geometry::Point(_) => wkbPoint,
            geo::Geometry::LineString(_) => wkbLineString,
            geo::Geometry::Polygon(_) => wkbPolygon,
            geo::Geometry::MultiPoint(_) => wkbMultiPoint,
            geo::Geometry::MultiLineString(_) => wkbMultiLineString,
            geo::Geometry::MultiPolygon(_) => wkbMultiPolygon,
            _ => return Err(SaveError::UnsupportedGeometry(kind)),
        };
        match found {
            None => found = Some((layer_type, kind)),
            Some((first_type, first_kind)) => {
                if first_type != layer_type {
                    return Err(SaveError::MixedGeometry(first_kind, kind));
                }
            }
        }
    }
    Ok(found.map(|(layer_type, _)| layer_type).unwrap_or(wkbUnknown))
}

/// Field names across all features, each typed from its first non-null value.
fn field_schema(features: &[Feature]) -> Vec<(String, gdal::vector::OGRFieldType::Type)> {
    let names: HashSet<String> = features
        .par_iter()
        .filter_map(|feature| {
            feature
                .attributes
                .as_ref()
                .map(|attributes| attributes.keys().cloned().collect::<Vec<String>>())
        })
        .flatten()
        .collect();
    let mut names: Vec<String> = names.into_iter().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let field_type = field_type_for(features, &name);
            (name, field_type)
        })
        .collect()
}

fn field_type_for(features: &[Feature], name: &str) -> gdal::vector::OGRFieldType::Type {
    use gdal::vector::OGRFieldType;
    for feature in features {
        let value = feature
            .attributes
            .as_ref()
            .and_then(|attributes| attributes.get(name));
        match value {
            None | Some(serde_json::Value::Null) => continue,
            Some(serde_json::Value::Bool(_)) => return OGRFieldType::OFTInteger,
            Some(serde_json::Value::Number(number)) => {
                if number.is_i64() || number.is_u64() {
                    return OGRFieldType::OFTInteger64;
                }
                return OGRFieldType::OFTReal;
            }
            Some(_) => return OGRFieldType::OFTString,
        }
    }
    OGRFieldType::OFTString
}

fn ogr_field_value(
    value: &serde_json::Value,
    field_type: gdal::vector::OGRFieldType::Type,
) -> Option<gdal::vector::FieldValue> {
    use gdal::vector::{FieldValue, OGRFieldType};
    if value.is_null() {
        return None;
    }
    let field_value = match field_type {
        OGRFieldType::OFTInteger => {
            FieldValue::IntegerValue(value.as_bool().map(i32::from).or_else(|| {
                value.as_i64().map(|v| v as i32)
            })?)
        }
        OGRFieldType::OFTInteger64 => FieldValue::Integer64Value(value.as_i64()?),
        OGRFieldType::OFTReal => FieldValue::RealValue(value.as_f64()?),
        _ => FieldValue::StringValue(match value {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        }),
    };
    Some(field_value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;
    use testdir::testdir;

    use crate::geofile::feature::{Feature, FeatureTable};

    use super::{
        read_table, remove_partial_output, save_table, OutputFormat, SaveConfig, SaveError,
    };

    fn point_feature(x: f64, y: f64, name: &str, rank: i64) -> Feature {
        Feature {
            geometry: geo::Geometry::Point(geo::Point::new(x, y)),
            attributes: Some(HashMap::from([
                ("name".to_string(), serde_json::json!(name)),
                ("rank".to_string(), serde_json::json!(rank)),
            ])),
        }
    }

    #[rstest]
    #[case("geopackage", OutputFormat::GeoPackage)]
    #[case("gpkg", OutputFormat::GeoPackage)]
    #[case("shapefile", OutputFormat::Shapefile)]
    #[case("shp", OutputFormat::Shapefile)]
    fn test_format_parsing(#[case] input: &str, #[case] expected: OutputFormat) {
        assert_eq!(input.parse::<OutputFormat>().unwrap(), expected);
    }

    #[rstest]
    fn test_unsupported_format_is_rejected() {
        let err = "csv".parse::<OutputFormat>().unwrap_err();
        assert!(matches!(err, SaveError::UnsupportedFormat(name) if name == "csv"));
    }

    #[rstest]
    fn test_geopackage_round_trip_preserves_rows_and_schema() {
        let table = FeatureTable::new(
            vec![
                point_feature(80.0, 45.0, "first", 1),
                point_feature(81.0, 46.0, "second", 2),
            ],
            4326,
        );
        let config = SaveConfig {
            folder: testdir!(),
            ..SaveConfig::default()
        };

        let written_path = save_table(&table, "points", &config).unwrap();
        assert_eq!(written_path, config.folder.join("points.gpkg"));

        let features = read_table(&written_path).unwrap();
        let read_back = FeatureTable::new(features, table.epsg);
        assert_eq!(read_back.len(), table.len());
        assert_eq!(read_back.field_names(), table.field_names());
    }

    #[rstest]
    fn test_shapefile_output_with_sidecars() {
        let table = FeatureTable::new(vec![point_feature(10.0, 10.0, "only", 1)], 4326);
        let config = SaveConfig {
            folder: testdir!(),
            format: OutputFormat::Shapefile,
            ..SaveConfig::default()
        };

        let written_path = save_table(&table, "points", &config).unwrap();
        assert!(written_path.exists());
        assert!(config.folder.join("points.dbf").exists());
        assert!(config.folder.join("points.shx").exists());
    }

    #[rstest]
    fn test_empty_table_is_refused_by_default() {
        let config = SaveConfig {
            folder: testdir!(),
            ..SaveConfig::default()
        };
        let err = save_table(&FeatureTable::empty_wgs84(), "nothing", &config).unwrap_err();
        assert!(matches!(err, SaveError::EmptyTable(_)));
        assert!(!config.folder.join("nothing.gpkg").exists());
    }

    #[rstest]
    fn test_empty_table_can_be_allowed_explicitly() {
        let config = SaveConfig {
            folder: testdir!(),
            allow_empty: true,
            ..SaveConfig::default()
        };
        let written_path =
            save_table(&FeatureTable::empty_wgs84(), "nothing", &config).unwrap();
        assert!(written_path.exists());
    }

    #[rstest]
    fn test_missing_output_folder_is_created() {
        let config = SaveConfig {
            folder: testdir!().join("nested").join("deeper"),
            ..SaveConfig::default()
        };
        let table = FeatureTable::new(vec![point_feature(0.0, 0.0, "a", 1)], 4326);
        let written_path = save_table(&table, "points", &config).unwrap();
        assert!(written_path.exists());
    }

    #[rstest]
    fn test_mixed_geometry_types_are_rejected() {
        let table = FeatureTable::new(
            vec![
                Feature::from(geo::Geometry::Point(geo::Point::new(0.0, 0.0))),
                Feature::from(geo::Geometry::LineString(geo::LineString::from(vec![
                    (0.0, 0.0),
                    (1.0, 1.0),
                ]))),
            ],
            4326,
        );
        let config = SaveConfig {
            folder: testdir!(),
            ..SaveConfig::default()
        };
        let err = save_table(&table, "mixed", &config).unwrap_err();
        assert!(matches!(err, SaveError::MixedGeometry("Point", "LineString")));
    }

    #[rstest]
    fn test_partial_output_cleanup_takes_shapefile_sidecars_along() {
        let folder = testdir!();
        for extension in ["shp", "shx", "dbf"] {
            std::fs::write(folder.join(format!("points.{extension}")), b"partial").unwrap();
        }
        let shapefile_path = folder.join("points.shp");

        remove_partial_output(&shapefile_path, OutputFormat::Shapefile);
        assert!(!shapefile_path.exists());
        assert!(!folder.join("points.shx").exists());
        assert!(!folder.join("points.dbf").exists());

        // Cleanup of a path that was never written must not fail.
        remove_partial_output(&folder.join("absent.gpkg"), OutputFormat::GeoPackage);
    }

    #[rstest]
    fn test_default_config_targets_current_folder_as_geopackage() {
        let config = SaveConfig::default();
        assert_eq!(config.folder, std::path::PathBuf::from("."));
        assert_eq!(config.format, OutputFormat::GeoPackage);
        assert!(!config.allow_empty);
    }
}
