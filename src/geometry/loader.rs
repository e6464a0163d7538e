use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use super::{ColladaLoader, GltfLoader, LoadedGeometry, StlLoader};

/// Decodes one geometry file format from memory.
pub trait GeometryLoader: Send + Sync {
    fn format_name(&self) -> &'static str;

    fn load(&self, bytes: &[u8]) -> Result<LoadedGeometry>;
}

/// Extension-keyed loader table with a fallback for anything unregistered.
pub struct LoaderRegistry {
    loaders: HashMap<String, Arc<dyn GeometryLoader>>,
    fallback: Arc<dyn GeometryLoader>,
}

impl LoaderRegistry {
    pub fn new(fallback: Arc<dyn GeometryLoader>) -> Self {
        Self { loaders: HashMap::new(), fallback }
    }

    /// STL, glTF and COLLADA; unknown extensions are treated as COLLADA.
    pub fn with_defaults() -> Self {
        let collada: Arc<dyn GeometryLoader> = Arc::new(ColladaLoader);
        let gltf: Arc<dyn GeometryLoader> = Arc::new(GltfLoader);
        let mut registry = Self::new(collada.clone());
        registry.register("stl", Arc::new(StlLoader));
        registry.register("dae", collada);
        registry.register("gltf", gltf.clone());
        registry.register("glb", gltf);
        registry
    }

    pub fn register(&mut self, extension: &str, loader: Arc<dyn GeometryLoader>) {
        self.loaders.insert(extension.trim_start_matches('.').to_ascii_lowercase(), loader);
    }

    pub fn loader_for(&self, path: &str) -> &dyn GeometryLoader {
        file_extension(path)
            .and_then(|ext| self.loaders.get(&ext))
            .map(|loader| loader.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Lowercased extension of the last path segment, query strings ignored.
pub fn file_extension(path: &str) -> Option<String> {
    let segment = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let segment = segment.split(['?', '#']).next().unwrap_or(segment);
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() && ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker;

    impl GeometryLoader for Marker {
        fn format_name(&self) -> &'static str {
            "marker"
        }

        fn load(&self, _bytes: &[u8]) -> Result<LoadedGeometry> {
            Ok(LoadedGeometry::default())
        }
    }

    #[test]
    fn dispatches_on_extension_case_insensitively() {
        let registry = LoaderRegistry::with_defaults();
        assert_eq!(registry.loader_for("meshes/Base.STL").format_name(), "stl");
        assert_eq!(registry.loader_for("package://arm/visual/link.dae").format_name(), "collada");
        assert_eq!(registry.loader_for("part.glb").format_name(), "gltf");
    }

    #[test]
    fn unknown_extension_falls_back_to_collada() {
        let registry = LoaderRegistry::with_defaults();
        assert_eq!(registry.loader_for("mesh.obj").format_name(), "collada");
        assert_eq!(registry.loader_for("no_extension").format_name(), "collada");
    }

    #[test]
    fn registered_loader_overrides_default() {
        let mut registry = LoaderRegistry::with_defaults();
        registry.register(".STL", Arc::new(Marker));
        assert_eq!(registry.loader_for("a.stl").format_name(), "marker");
    }

    #[test]
    fn extension_ignores_directories_and_queries() {
        assert_eq!(file_extension("a.b/c"), None);
        assert_eq!(file_extension("dir/file.Dae?raw=1"), Some("dae".to_string()));
    }
}
