use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use crate::grouping::Dimension;
use crate::job::{Frequency, JobTuple, ProductType, TimeStep};
use crate::timebounds::TimeBounds;

/// Archivos de una variable en un time step (normalmente el par .data/.meta).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFileRef {
    pub variable: String,
    pub time_step: TimeStep,
    /// Keys completas, ordenadas
    pub parts: Vec<String>,
}

impl SourceFileRef {
    pub fn data_part(&self) -> Option<&str> {
        self.parts
            .iter()
            .map(String::as_str)
            .find(|p| p.ends_with(".data"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicMetadata {
    pub name: String,
    pub dimension: Dimension,
    pub time_coverage_start: String,
    pub time_coverage_end: String,
    pub time_coverage_center: String,
    pub frequency_label: String,
}

/// Una unidad de trabajo: un gránulo de salida en un time step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub granule_uri: String,
    pub job: JobTuple,
    pub time_step: TimeStep,
    /// variable de salida -> archivos (uno por componente si es vectorial)
    pub variable_inputs: BTreeMap<String, Vec<SourceFileRef>>,
    pub dynamic_metadata: DynamicMetadata,
    pub source_root: String,
    pub destination_root: String,
}

/* --------- Nombres de gránulos --------- */

/// Plantilla `prefix_period_date_version_gridType[_gridLabel].ext`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GranuleNaming {
    pub version: String,
    pub latlon_label: String,
    pub native_label: String,
    pub extension: String,
}

impl Default for GranuleNaming {
    fn default() -> Self {
        Self {
            version: "ECCO_V4r4".to_string(),
            latlon_label: "0p50deg".to_string(),
            native_label: "llc0090".to_string(),
            extension: "nc".to_string(),
        }
    }
}

pub const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

impl GranuleNaming {
    fn grid(&self, product_type: ProductType) -> (&'static str, &str) {
        match product_type {
            ProductType::OneD => ("1D", ""),
            ProductType::Latlon => ("latlon", self.latlon_label.as_str()),
            ProductType::Native => ("native", self.native_label.as_str()),
        }
    }

    pub fn granule_name(
        &self,
        prefix: &str,
        product_type: ProductType,
        frequency: Frequency,
        bounds: &TimeBounds,
    ) -> String {
        // mensual: fecha truncada al mes
        let date = match frequency {
            Frequency::AvgDay => bounds.center.format("%Y-%m-%d").to_string(),
            Frequency::AvgMon => bounds.center.format("%Y-%m").to_string(),
            Frequency::Snap => bounds.center.format("%Y-%m-%dT%H%M%S").to_string(),
        };
        let (grid_type, grid_label) = self.grid(product_type);

        let mut name = format!(
            "{}_{}_{}_{}_{}",
            prefix,
            frequency.file_label(),
            date,
            self.version,
            grid_type
        );
        if !grid_label.is_empty() {
            name.push('_');
            name.push_str(grid_label);
        }
        name.push('.');
        name.push_str(&self.extension);
        name
    }
}

/* --------- Archivo de lista de tareas --------- */

/// Escribe la lista de tareas como un arreglo JSON.
pub fn write_task_list(path: &Path, tasks: &[Task]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, tasks)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

pub fn read_task_list(path: &Path) -> io::Result<Vec<Task>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
