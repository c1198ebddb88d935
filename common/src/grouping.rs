use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::job::{GroupingId, ProductType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Dimension {
    #[serde(rename = "1D")]
    OneD,
    #[serde(rename = "2D")]
    TwoD,
    #[serde(rename = "3D")]
    ThreeD,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::OneD => "1D",
            Dimension::TwoD => "2D",
            Dimension::ThreeD => "3D",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadatos de un dataset de salida: qué campos lo componen y cómo se nombra.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grouping {
    pub id: GroupingId,
    pub name: String,
    /// Variables en orden de salida
    pub fields: Vec<String>,
    pub dimension: Dimension,
    /// Prefijo del nombre del gránulo, ej: "SEA_SURFACE_HEIGHT"
    pub filename_template: String,
    /// variable derivada -> (eje -> variable componente)
    #[serde(default)]
    pub field_components: BTreeMap<String, BTreeMap<String, String>>,
    /// nombre en origen -> nombre en salida
    #[serde(default)]
    pub variable_rename: BTreeMap<String, String>,
}

impl Grouping {
    pub fn is_vector_field(&self, field: &str) -> bool {
        self.field_components.contains_key(field)
    }

    pub fn output_name<'a>(&'a self, field: &'a str) -> &'a str {
        self.variable_rename
            .get(field)
            .map(String::as_str)
            .unwrap_or(field)
    }
}

#[derive(Debug, Error)]
pub enum GroupingError {
    #[error("no existe la agrupación {id} para {product_type}")]
    NotFound { product_type: ProductType, id: GroupingId },
    #[error("error leyendo {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON inválido en {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Lookup de agrupaciones (sólo lectura).
pub trait GroupingStore: Send + Sync {
    fn lookup(&self, product_type: ProductType, id: GroupingId) -> Result<Grouping, GroupingError>;

    fn list(&self, product_type: ProductType) -> Vec<Grouping>;
}

/// Store en memoria; también es el resultado de cargar los JSON de disco.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGroupingStore {
    by_type: HashMap<ProductType, Vec<Grouping>>,
}

impl InMemoryGroupingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, product_type: ProductType, grouping: Grouping) -> Self {
        self.insert(product_type, grouping);
        self
    }

    pub fn insert(&mut self, product_type: ProductType, grouping: Grouping) {
        let list = self.by_type.entry(product_type).or_default();
        list.retain(|g| g.id != grouping.id);
        list.push(grouping);
        list.sort_by_key(|g| g.id);
    }
}

impl GroupingStore for InMemoryGroupingStore {
    fn lookup(&self, product_type: ProductType, id: GroupingId) -> Result<Grouping, GroupingError> {
        self.by_type
            .get(&product_type)
            .and_then(|list| list.iter().find(|g| g.id == id))
            .cloned()
            .ok_or(GroupingError::NotFound { product_type, id })
    }

    fn list(&self, product_type: ProductType) -> Vec<Grouping> {
        self.by_type.get(&product_type).cloned().unwrap_or_default()
    }
}

/// Nombre de archivo de metadatos para un product type.
pub fn groupings_file_name(product_type: ProductType) -> String {
    format!("groupings_for_{}_datasets.json", product_type.as_str())
}

/// Carga `groupings_for_<tipo>_datasets.json` desde `dir`. Los archivos
/// ausentes se toman como "sin agrupaciones" para ese tipo.
pub fn load_grouping_dir(dir: &Path) -> Result<InMemoryGroupingStore, GroupingError> {
    let mut store = InMemoryGroupingStore::new();

    for product_type in ProductType::ALL {
        let path = dir.join(groupings_file_name(product_type));
        if !path.is_file() {
            continue;
        }
        let text = fs::read_to_string(&path).map_err(|source| GroupingError::Io {
            path: path.clone(),
            source,
        })?;
        let groupings: Vec<Grouping> =
            serde_json::from_str(&text).map_err(|source| GroupingError::Json {
                path: path.clone(),
                source,
            })?;
        for g in groupings {
            store.insert(product_type, g);
        }
    }

    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("grouping_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn carga_json_y_resuelve_lookup() {
        let dir = temp_dir("carga");
        let json = r#"[
          {"id": 0, "name": "SSH", "fields": ["SSH", "SSHIBC"], "dimension": "2D",
           "filenameTemplate": "SEA_SURFACE_HEIGHT"},
          {"id": 1, "name": "OCEAN_VEL", "fields": ["EVEL", "NVEL"], "dimension": "3D",
           "filenameTemplate": "OCEAN_VELOCITY",
           "fieldComponents": {"EVEL": {"x": "UVEL", "y": "VVEL"}, "NVEL": {"x": "UVEL", "y": "VVEL"}},
           "variableRename": {"SSHIBC": "SSH_IBC"}}
        ]"#;
        fs::write(dir.join(groupings_file_name(ProductType::Latlon)), json).unwrap();

        let store = load_grouping_dir(&dir).unwrap();
        let vel = store.lookup(ProductType::Latlon, 1).unwrap();
        assert_eq!(vel.dimension, Dimension::ThreeD);
        assert!(vel.is_vector_field("EVEL"));
        assert_eq!(vel.field_components["EVEL"]["y"], "VVEL");
        assert_eq!(vel.output_name("SSHIBC"), "SSH_IBC");
        assert_eq!(vel.output_name("EVEL"), "EVEL");

        assert_eq!(store.list(ProductType::Latlon).len(), 2);
        assert!(store.list(ProductType::Native).is_empty());
    }

    #[test]
    fn lookup_inexistente_es_not_found() {
        let store = InMemoryGroupingStore::new();
        let err = store.lookup(ProductType::Native, 7).unwrap_err();
        assert!(matches!(err, GroupingError::NotFound { id: 7, .. }));
    }

    #[test]
    fn json_invalido_reporta_ruta() {
        let dir = temp_dir("invalido");
        fs::write(dir.join(groupings_file_name(ProductType::OneD)), "{no").unwrap();
        let err = load_grouping_dir(&dir).unwrap_err();
        assert!(matches!(err, GroupingError::Json { .. }));
    }
}
