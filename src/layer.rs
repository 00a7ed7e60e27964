use std::path::PathBuf;

use crate::geofile::feature::FeatureTable;
use crate::geofile::writer::{save_table, SaveConfig, SaveError};
use crate::service::client::{LayerHandle, MapService, ResolutionError};
use crate::service::query::{fetch, FetchError, SpatialFilter};

/// One queryable remote layer, bound to a (service URL, layer name) pair.
///
/// Construction eagerly resolves the layer against the service, so every
/// `Layer` value is usable; resolution failure is a [`ResolutionError`] and
/// no value exists. Reuse one `Layer` across fetches, but keep it on a
/// single logical caller — the connection inside is not synchronized.
pub struct Layer {
    service: MapService,
    handle: LayerHandle,
}

impl Layer {
    pub fn connect(service_url: &str, layer_name: &str) -> Result<Self, ResolutionError> {
        let service = MapService::connect(service_url)?;
        let handle = service.resolve(layer_name)?;
        Ok(Self { service, handle })
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// All layer names the service offers, for discovery and debugging.
    pub fn list_layers(&self) -> Vec<String> {
        self.service.list_layers()
    }

    /// Every feature of the layer.
    pub fn get_all(&self) -> Result<FeatureTable, FetchError> {
        fetch(self.service.http(), &self.handle, None)
    }

    /// Every feature intersecting the filter polygon.
    pub fn get_by_polygon(&self, filter: &SpatialFilter) -> Result<FeatureTable, FetchError> {
        fetch(self.service.http(), &self.handle, Some(filter))
    }

    /// Write a table to `{config.folder}/{layer_name}.{ext}`.
    pub fn save(
        table: &FeatureTable,
        layer_name: &str,
        config: &SaveConfig,
    ) -> Result<PathBuf, SaveError> {
        save_table(table, layer_name, config)
    }
}
