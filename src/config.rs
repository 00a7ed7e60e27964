use serde::Deserialize;
use std::path::PathBuf;

use crate::geofile::writer::SaveConfig;

/// Top-level YAML configuration.
#[derive(Deserialize, Debug)]
pub struct Config {
    pub service_url: String,
    pub layer_name: String,
    #[serde(default)]
    pub output: SaveConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    #[serde(default)]
    pub inference: Option<InferenceConfig>,
}

/// Where `/mapview` streams its row: an inference-observability pipeline.
#[derive(Deserialize, Debug, Clone)]
pub struct InferenceConfig {
    #[serde(default = "default_inference_base_url")]
    pub base_url: String,
    pub pipeline_id: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_inference_base_url() -> String {
    "https://api.openlayer.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENLAYER_API_KEY".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            templates_dir: default_templates_dir(),
            inference: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::geofile::writer::OutputFormat;

    use super::Config;

    const MINIMAL_YAML: &str = r#"
service_url: https://example.com/arcgis/rest/services/Demo/MapServer
layer_name: Parcels
"#;

    const FULL_YAML: &str = r#"
service_url: https://example.com/arcgis/rest/services/Demo/MapServer
layer_name: Roads
output:
  folder: data
  format: shapefile
server:
  bind_addr: 0.0.0.0:9000
  inference:
    pipeline_id: 182bd5e5-6e1a-4fe4-a799-aa6d9a6ab26e
"#;

    const BAD_FORMAT_YAML: &str = r#"
service_url: https://example.com/MapServer
layer_name: Parcels
output:
  format: csv
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        assert_eq!(config.layer_name, "Parcels");
        assert_eq!(config.output.format, OutputFormat::GeoPackage);
        assert_eq!(config.output.folder, std::path::PathBuf::from("."));
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
        assert!(config.server.inference.is_none());
    }

    #[test]
    fn test_full_config_round_trip() {
        let config: Config = serde_yaml::from_str(FULL_YAML).unwrap();
        assert_eq!(config.output.format, OutputFormat::Shapefile);
        assert_eq!(config.output.folder, std::path::PathBuf::from("data"));
        let inference = config.server.inference.unwrap();
        assert_eq!(inference.api_key_env, "OPENLAYER_API_KEY");
        assert!(inference.base_url.contains("openlayer"));
    }

    #[test]
    fn test_unsupported_output_format_fails_to_parse() {
        let result: Result<Config, _> = serde_yaml::from_str::<Config>(BAD_FORMAT_YAML);
        assert!(result.is_err());
    }
}
