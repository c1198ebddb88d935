//! Construcción de la lista de tareas de un job a partir de los archivos de origen.

use ecco_common::task::ISO_FORMAT;
use ecco_common::{
    DynamicMetadata, EccoFilename, GranuleNaming, Grouping, GroupingError, GroupingStore,
    JobSpec, JobTuple, ObjectStore, SourceFileRef, StoreError, Task, TimeBoundsCalculator,
    TimeStep, TimeSteps,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Grouping(#[from] GroupingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resultado de expandir un job: tareas en orden ascendente de time step
/// y avisos no fatales (variables faltantes, archivos raros, sin datos).
#[derive(Debug, Clone)]
pub struct TaskList {
    pub job: JobTuple,
    pub grouping: Grouping,
    pub tasks: Vec<Task>,
    pub warnings: Vec<String>,
}

impl TaskList {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Archivos de una variable indexados por time step.
type FilesByTime = BTreeMap<TimeStep, SourceFileRef>;

pub struct TaskListBuilder {
    groupings: Arc<dyn GroupingStore>,
    store: Arc<dyn ObjectStore>,
    calendar: Arc<dyn TimeBoundsCalculator>,
    naming: GranuleNaming,
}

impl TaskListBuilder {
    pub fn new(
        groupings: Arc<dyn GroupingStore>,
        store: Arc<dyn ObjectStore>,
        calendar: Arc<dyn TimeBoundsCalculator>,
        naming: GranuleNaming,
    ) -> Self {
        Self {
            groupings,
            store,
            calendar,
            naming,
        }
    }

    pub fn groupings(&self) -> &dyn GroupingStore {
        self.groupings.as_ref()
    }

    pub fn build(
        &self,
        spec: &JobSpec,
        source_root: &str,
        destination_root: &str,
    ) -> Result<TaskList, BuildError> {
        let job = spec.tuple();
        let grouping = self.groupings.lookup(spec.product_type, spec.grouping_id)?;
        let mut warnings = Vec::new();

        // 1) cada variable de origen se lista una sola vez, aunque la usen varios campos
        let mut needed: BTreeSet<&str> = BTreeSet::new();
        for field in &grouping.fields {
            match grouping.field_components.get(field) {
                Some(components) => needed.extend(components.values().map(String::as_str)),
                None => {
                    needed.insert(field.as_str());
                }
            }
        }

        let mut found: HashMap<&str, FilesByTime> = HashMap::new();
        for var in needed {
            let files = self.enumerate(var, spec, source_root, &mut warnings)?;
            found.insert(var, files);
        }

        // 2) por campo de salida: directo o intersección de componentes
        let mut per_field: BTreeMap<String, BTreeMap<TimeStep, Vec<SourceFileRef>>> =
            BTreeMap::new();
        for field in &grouping.fields {
            let by_time = match grouping.field_components.get(field) {
                Some(components) => {
                    let maps: Vec<&FilesByTime> = components
                        .values()
                        .filter_map(|var| found.get(var.as_str()))
                        .collect();
                    if maps.is_empty() {
                        warnings.push(format!("{}: campo vectorial {} sin componentes", job, field));
                    }
                    intersect_components(&maps)
                }
                None => found
                    .get(field.as_str())
                    .map(|files| {
                        files
                            .iter()
                            .map(|(t, r)| (*t, vec![r.clone()]))
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            per_field.insert(grouping.output_name(field).to_string(), by_time);
        }

        // 3) unión de tiempos entre campos
        let times: BTreeSet<TimeStep> = per_field
            .values()
            .flat_map(|m| m.keys().copied())
            .collect();

        if let TimeSteps::Steps(requested) = &spec.time_steps {
            for t in requested.difference(&times) {
                warnings.push(format!("{}: time step {} pedido sin archivos", job, t));
            }
        }

        if times.is_empty() {
            warnings.push(format!("{}: no se encontraron archivos de origen", job));
            return Ok(TaskList {
                job,
                grouping,
                tasks: Vec::new(),
                warnings,
            });
        }

        let tasks = times
            .into_iter()
            .map(|t| {
                let mut variable_inputs = BTreeMap::new();
                for (name, by_time) in &per_field {
                    match by_time.get(&t) {
                        Some(refs) => {
                            variable_inputs.insert(name.clone(), refs.clone());
                        }
                        None => warnings.push(format!(
                            "{}: falta la variable {} en el time step {}",
                            job, name, t
                        )),
                    }
                }
                self.task_for(job, &grouping, t, variable_inputs, source_root, destination_root)
            })
            .collect();

        Ok(TaskList {
            job,
            grouping,
            tasks,
            warnings,
        })
    }

    fn task_for(
        &self,
        job: JobTuple,
        grouping: &Grouping,
        time_step: TimeStep,
        variable_inputs: BTreeMap<String, Vec<SourceFileRef>>,
        source_root: &str,
        destination_root: &str,
    ) -> Task {
        let bounds = self.calendar.bounds(time_step, job.frequency);
        let granule = self.naming.granule_name(
            &grouping.filename_template,
            job.product_type,
            job.frequency,
            &bounds,
        );

        Task {
            granule_uri: join_key(destination_root, &format!("{}/{}", grouping.name, granule)),
            job,
            time_step,
            variable_inputs,
            dynamic_metadata: DynamicMetadata {
                name: grouping.name.clone(),
                dimension: grouping.dimension,
                time_coverage_start: bounds.start.format(ISO_FORMAT).to_string(),
                time_coverage_end: bounds.end.format(ISO_FORMAT).to_string(),
                time_coverage_center: bounds.center.format(ISO_FORMAT).to_string(),
                frequency_label: job.frequency.coverage_label().to_string(),
            },
            source_root: source_root.to_string(),
            destination_root: destination_root.to_string(),
        }
    }

    /// Lista los archivos de una variable y agrupa las partes `.data`/`.meta` por tiempo.
    fn enumerate(
        &self,
        variable: &str,
        spec: &JobSpec,
        source_root: &str,
        warnings: &mut Vec<String>,
    ) -> Result<FilesByTime, BuildError> {
        let prefixes: Vec<String> = match &spec.time_steps {
            TimeSteps::All => vec![EccoFilename::listing_prefix(variable, spec.frequency, None)],
            TimeSteps::Steps(steps) => steps
                .iter()
                .map(|t| EccoFilename::listing_prefix(variable, spec.frequency, Some(*t)))
                .collect(),
        };

        let mut parts: BTreeMap<TimeStep, Vec<String>> = BTreeMap::new();
        for prefix in prefixes {
            for key in self.store.list(&join_key(source_root, &prefix))? {
                match EccoFilename::parse_key(&key) {
                    Ok(name) if name.prefix == variable && name.averaging_period == spec.frequency => {
                        parts.entry(name.time).or_default().push(key);
                    }
                    Ok(_) => {}
                    Err(e) => warnings.push(format!("archivo ignorado {}: {}", key, e)),
                }
            }
        }

        let mut out = FilesByTime::new();
        for (time_step, mut keys) in parts {
            keys.sort();
            keys.dedup();
            if !keys.iter().any(|k| k.ends_with(".data")) {
                continue;
            }
            if !keys.iter().any(|k| k.ends_with(".meta")) {
                warnings.push(format!(
                    "{} en {}: .data sin .meta",
                    variable, time_step
                ));
            }
            out.insert(
                time_step,
                SourceFileRef {
                    variable: variable.to_string(),
                    time_step,
                    parts: keys,
                },
            );
        }
        Ok(out)
    }
}

/// Tiempos presentes en todas las componentes, con una referencia por componente.
fn intersect_components(maps: &[&FilesByTime]) -> BTreeMap<TimeStep, Vec<SourceFileRef>> {
    let Some((first, rest)) = maps.split_first() else {
        return BTreeMap::new();
    };

    first
        .keys()
        .filter(|t| rest.iter().all(|m| m.contains_key(t)))
        .map(|t| {
            let refs = maps.iter().filter_map(|m| m.get(t).cloned()).collect();
            (*t, refs)
        })
        .collect()
}

fn join_key(root: &str, rel: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", root, rel)
    }
}

/// `<dir>/<run>/<groupingId>_<productType>_<frequency>.json`
pub fn task_list_path(dir: &Path, run_name: &str, job: JobTuple) -> PathBuf {
    dir.join(run_name).join(format!(
        "{}_{}_{}.json",
        job.grouping_id, job.product_type, job.frequency
    ))
}
