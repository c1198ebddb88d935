use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::{collections::BTreeSet, fmt, str::FromStr};
use thiserror::Error;

use crate::grouping::GroupingStore;

/// Identificador numérico de una agrupación (grouping) de campos.
pub type GroupingId = u32;

/// Índice entero sobre el eje de tiempo del modelo.
pub type TimeStep = u64;

/* --------- Enumeraciones de un job --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProductType {
    #[serde(rename = "1D")]
    OneD,
    #[serde(rename = "latlon")]
    Latlon,
    #[serde(rename = "native")]
    Native,
}

impl ProductType {
    pub const ALL: [ProductType; 3] = [ProductType::OneD, ProductType::Latlon, ProductType::Native];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::OneD => "1D",
            ProductType::Latlon => "latlon",
            ProductType::Native => "native",
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductType {
    type Err = JobParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1d" => Ok(ProductType::OneD),
            "latlon" => Ok(ProductType::Latlon),
            "native" => Ok(ProductType::Native),
            other => Err(JobParseError::ProductType(other.to_string())),
        }
    }
}

/// Periodo de promediado de una salida.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    AvgDay,
    AvgMon,
    Snap,
}

impl Frequency {
    pub const ALL: [Frequency; 3] = [Frequency::AvgDay, Frequency::AvgMon, Frequency::Snap];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::AvgDay => "AVG_DAY",
            Frequency::AvgMon => "AVG_MON",
            Frequency::Snap => "SNAP",
        }
    }

    /// Etiqueta usada en los nombres de archivo crudos y en los gránulos.
    pub fn file_label(&self) -> &'static str {
        match self {
            Frequency::AvgDay => "day_mean",
            Frequency::AvgMon => "mon_mean",
            Frequency::Snap => "snap",
        }
    }

    /// Resolución temporal (ISO 8601) que va en los metadatos dinámicos.
    pub fn coverage_label(&self) -> &'static str {
        match self {
            Frequency::AvgDay => "P1D",
            Frequency::AvgMon => "P1M",
            Frequency::Snap => "PT0S",
        }
    }

    pub fn from_file_label(label: &str) -> Option<Frequency> {
        Frequency::ALL.into_iter().find(|f| f.file_label() == label)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = JobParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AVG_DAY" => Ok(Frequency::AvgDay),
            "AVG_MON" => Ok(Frequency::AvgMon),
            "SNAP" => Ok(Frequency::Snap),
            other => Err(JobParseError::Frequency(other.to_string())),
        }
    }
}

/* --------- Time steps: "all" o conjunto ordenado --------- */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeSteps {
    All,
    Steps(BTreeSet<TimeStep>),
}

impl TimeSteps {
    pub fn is_all(&self) -> bool {
        matches!(self, TimeSteps::All)
    }
}

impl Serialize for TimeSteps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TimeSteps::All => serializer.serialize_str("all"),
            TimeSteps::Steps(steps) => steps.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for TimeSteps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        time_steps_from_value(&raw).map_err(de::Error::custom)
    }
}

fn time_steps_from_value(raw: &Value) -> Result<TimeSteps, JobParseError> {
    match raw {
        Value::String(s) if s.eq_ignore_ascii_case("all") => Ok(TimeSteps::All),
        Value::Array(items) => {
            let mut steps = BTreeSet::new();
            for item in items {
                steps.insert(time_step_from_value(item)?);
            }
            Ok(TimeSteps::Steps(steps))
        }
        other => Err(JobParseError::TimeSteps(other.to_string())),
    }
}

/// Acepta tanto `12` como `"0000000012"`.
fn time_step_from_value(item: &Value) -> Result<TimeStep, JobParseError> {
    match item {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| JobParseError::TimeSteps(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<TimeStep>()
            .map_err(|_| JobParseError::TimeSteps(s.clone())),
        other => Err(JobParseError::TimeSteps(other.to_string())),
    }
}

/* --------- Job spec y tupla de job --------- */

/// Identidad de un job sin sus time steps: (grouping, product type, frequency).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTuple {
    pub grouping_id: GroupingId,
    pub product_type: ProductType,
    pub frequency: Frequency,
}

impl fmt::Display for JobTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.grouping_id, self.product_type, self.frequency)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub grouping_id: GroupingId,
    pub product_type: ProductType,
    pub frequency: Frequency,
    pub time_steps: TimeSteps,
}

impl JobSpec {
    pub fn tuple(&self) -> JobTuple {
        JobTuple {
            grouping_id: self.grouping_id,
            product_type: self.product_type,
            frequency: self.frequency,
        }
    }

    pub fn from_tuple(tuple: JobTuple, time_steps: TimeSteps) -> Self {
        Self {
            grouping_id: tuple.grouping_id,
            product_type: tuple.product_type,
            frequency: tuple.frequency,
            time_steps,
        }
    }
}

/* --------- Parser del archivo de jobs --------- */

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JobParseError {
    #[error("línea mal formada: {0}")]
    Syntax(String),
    #[error("se esperaban 4 elementos y hay {0}")]
    Arity(usize),
    #[error("grouping id inválido: {0}")]
    GroupingId(String),
    #[error("product type desconocido: {0}")]
    ProductType(String),
    #[error("frequency desconocida: {0}")]
    Frequency(String),
    #[error("time steps inválidos: {0}")]
    TimeSteps(String),
}

/// Una línea útil del archivo de jobs.
#[derive(Debug, Clone, PartialEq)]
pub enum JobLine {
    Spec(JobSpec),
    /// Sentinela `all`: todas las agrupaciones, todas las frecuencias.
    All,
}

/// Resultado de leer un archivo de jobs completo.
#[derive(Debug, Default)]
pub struct JobFile {
    pub lines: Vec<JobLine>,
    /// (número de línea empezando en 1, error)
    pub rejected: Vec<(usize, JobParseError)>,
}

/// Sintaxis de lista de Python: las cadenas entre comillas simples pasan a
/// comillas dobles. Lo que ya está entre comillas dobles no se toca.
fn single_quotes_to_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in text.chars() {
        let Some(q) = quote else {
            if c == '\'' {
                out.push('"');
            } else {
                out.push(c);
            }
            if c == '\'' || c == '"' {
                quote = Some(c);
            }
            continue;
        };

        if escaped {
            escaped = false;
            // \' no existe en JSON
            if !(q == '\'' && c == '\'') {
                out.push('\\');
            }
            out.push(c);
        } else if c == '\\' {
            escaped = true;
        } else if c == q {
            out.push('"');
            quote = None;
        } else if q == '\'' && c == '"' {
            out.push_str("\\\"");
        } else {
            out.push(c);
        }
    }
    if escaped {
        out.push('\\');
    }
    out
}

/// Parsea una línea. Devuelve `Ok(None)` para comentarios y líneas vacías.
pub fn parse_job_line(line: &str) -> Result<Option<JobLine>, JobParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    if trimmed.eq_ignore_ascii_case("all") {
        return Ok(Some(JobLine::All));
    }

    let normalized = single_quotes_to_json(trimmed);
    let value: Value =
        serde_json::from_str(&normalized).map_err(|e| JobParseError::Syntax(e.to_string()))?;

    let items = value
        .as_array()
        .ok_or_else(|| JobParseError::Syntax(trimmed.to_string()))?;
    if items.len() != 4 {
        return Err(JobParseError::Arity(items.len()));
    }

    let grouping_id = match &items[0] {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
    .ok_or_else(|| JobParseError::GroupingId(items[0].to_string()))?;

    let product_type = items[1]
        .as_str()
        .ok_or_else(|| JobParseError::ProductType(items[1].to_string()))?
        .parse::<ProductType>()?;

    let frequency = items[2]
        .as_str()
        .ok_or_else(|| JobParseError::Frequency(items[2].to_string()))?
        .parse::<Frequency>()?;

    let time_steps = time_steps_from_value(&items[3])?;

    Ok(Some(JobLine::Spec(JobSpec {
        grouping_id,
        product_type,
        frequency,
        time_steps,
    })))
}

/// Lee el archivo completo. Un error en una línea no aborta el resto;
/// la lectura termina en el primer `done`.
pub fn parse_job_file(text: &str) -> JobFile {
    let mut out = JobFile::default();

    for (idx, line) in text.lines().enumerate() {
        if line.trim().eq_ignore_ascii_case("done") {
            break;
        }
        match parse_job_line(line) {
            Ok(Some(job)) => out.lines.push(job),
            Ok(None) => {}
            Err(e) => out.rejected.push((idx + 1, e)),
        }
    }

    out
}

/// Expande el sentinela `all` contra el store de agrupaciones.
pub fn expand_all(groupings: &dyn GroupingStore) -> Vec<JobSpec> {
    let mut out = Vec::new();
    for product_type in ProductType::ALL {
        for grouping in groupings.list(product_type) {
            for frequency in Frequency::ALL {
                out.push(JobSpec {
                    grouping_id: grouping.id,
                    product_type,
                    frequency,
                    time_steps: TimeSteps::All,
                });
            }
        }
    }
    out
}

/// Convierte las líneas en job specs concretos, expandiendo `all`.
pub fn resolve_job_lines(lines: &[JobLine], groupings: &dyn GroupingStore) -> Vec<JobSpec> {
    let mut out = Vec::new();
    for line in lines {
        match line {
            JobLine::Spec(spec) => out.push(spec.clone()),
            JobLine::All => out.extend(expand_all(groupings)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::{Dimension, Grouping, InMemoryGroupingStore};

    fn spec(line: &str) -> JobSpec {
        match parse_job_line(line).unwrap() {
            Some(JobLine::Spec(s)) => s,
            other => panic!("se esperaba un spec, hay {:?}", other),
        }
    }

    #[test]
    fn parsea_lista_estilo_python() {
        let s = spec("[0, 'latlon', 'AVG_DAY', 'all']");
        assert_eq!(s.grouping_id, 0);
        assert_eq!(s.product_type, ProductType::Latlon);
        assert_eq!(s.frequency, Frequency::AvgDay);
        assert_eq!(s.time_steps, TimeSteps::All);
    }

    #[test]
    fn parsea_time_steps_como_texto_o_numero() {
        let s = spec(r#"[3,"native","avg_mon",["0000000012", 36, 24]]"#);
        assert_eq!(s.product_type, ProductType::Native);
        assert_eq!(s.frequency, Frequency::AvgMon);
        assert_eq!(
            s.time_steps,
            TimeSteps::Steps([12, 24, 36].into_iter().collect())
        );
    }

    #[test]
    fn ignora_comentarios_vacias_y_corta_en_done() {
        let text = "# comentario\n\n[0,'1D','SNAP','all']\nall\ndone\n[1,'latlon','AVG_DAY','all']\n";
        let file = parse_job_file(text);
        assert!(file.rejected.is_empty());
        assert_eq!(file.lines.len(), 2);
        assert_eq!(file.lines[1], JobLine::All);
    }

    #[test]
    fn comillas_internas_se_respetan() {
        assert_eq!(
            single_quotes_to_json(r#"[0, "it's", 'say "hi"', 'a\'b']"#),
            r#"[0, "it's", "say \"hi\"", "a'b"]"#
        );
        // el apóstrofo dentro de comillas dobles no rompe la línea
        assert_eq!(
            parse_job_line(r#"[0, "lat'lon", 'AVG_DAY', 'all']"#).unwrap_err(),
            JobParseError::ProductType("lat'lon".to_string())
        );
        let s = spec(r#"[0, "latlon", 'AVG_DAY', "all"]"#);
        assert_eq!(s.product_type, ProductType::Latlon);
        assert_eq!(s.time_steps, TimeSteps::All);
    }

    #[test]
    fn linea_mala_no_aborta_el_resto() {
        let text = "[0,'latlon','AVG_DAY']\n[x\n[0,'polar','AVG_DAY','all']\n[1,'latlon','AVG_DAY',[1]]\n";
        let file = parse_job_file(text);
        assert_eq!(file.lines.len(), 1);
        assert_eq!(file.rejected.len(), 3);
        assert_eq!(file.rejected[0], (1, JobParseError::Arity(3)));
        assert!(matches!(file.rejected[1].1, JobParseError::Syntax(_)));
        assert_eq!(
            file.rejected[2],
            (3, JobParseError::ProductType("polar".to_string()))
        );
    }

    #[test]
    fn time_steps_serializa_all_y_lista() {
        let all = serde_json::to_string(&TimeSteps::All).unwrap();
        assert_eq!(all, "\"all\"");
        let steps = TimeSteps::Steps([5, 1].into_iter().collect());
        assert_eq!(serde_json::to_string(&steps).unwrap(), "[1,5]");
        let back: TimeSteps = serde_json::from_str("[\"0000000005\",1]").unwrap();
        assert_eq!(back, steps);
    }

    #[test]
    fn expand_all_cubre_tipos_y_frecuencias() {
        let g = |id, dimension| Grouping {
            id,
            name: format!("G{}", id),
            fields: vec!["SSH".to_string()],
            dimension,
            filename_template: "SEA_SURFACE_HEIGHT".to_string(),
            field_components: Default::default(),
            variable_rename: Default::default(),
        };
        let store = InMemoryGroupingStore::new()
            .with(ProductType::Latlon, g(0, Dimension::TwoD))
            .with(ProductType::Latlon, g(1, Dimension::ThreeD))
            .with(ProductType::OneD, g(0, Dimension::OneD));

        let specs = resolve_job_lines(&[JobLine::All], &store);
        assert_eq!(specs.len(), 9);
        assert!(specs.iter().all(|s| s.time_steps.is_all()));
        assert!(specs
            .iter()
            .any(|s| s.product_type == ProductType::OneD && s.frequency == Frequency::Snap));
    }
}
