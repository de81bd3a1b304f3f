use std::collections::HashMap;
use std::sync::Arc;

use crate::color::ColorMap;
use crate::config::Settings;
use crate::data::filter::{describe_active, FilterState, GroupingChoice, SelectionEngine};
use crate::data::loader::{ExtractionAdapter, FileAdapter};
use crate::data::model::DatasetBundle;
use crate::data::projector::{project, PlotKind};
use crate::data::schema::{FilterField, SchemaDeriver};
use crate::error::{ScopeError, ScopeResult};
use crate::export::{FilterConfig, PlotArtifact};
use crate::paths::{self, FileEntry};
use crate::registry::{DatasetKey, DatasetRegistry, SelectionKey, SelectionRegistry};

/// What a successful load hands back to the caller.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub dataset_key: DatasetKey,
    pub schema: Arc<Vec<FilterField>>,
    pub status_message: String,
}

/// Per-dataset state that lives exactly as long as the bundle does.
#[derive(Debug)]
struct DatasetInfo {
    source: String,
    schema: Arc<Vec<FilterField>>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One viewer's state: the loaded datasets, their selections and the active
/// grouping fields.
///
/// Not shared between threads on its own; wrap it in a lock to serve several
/// requests.
pub struct Session<A: ExtractionAdapter = FileAdapter> {
    settings: Settings,
    adapter: A,
    deriver: SchemaDeriver,
    engine: SelectionEngine,
    datasets: DatasetRegistry,
    selections: SelectionRegistry,
    info: HashMap<DatasetKey, DatasetInfo>,
    grouping: GroupingChoice,
}

impl Session<FileAdapter> {
    pub fn new(settings: Settings) -> Self {
        let adapter = FileAdapter::new(settings.bundle_options());
        Session::with_adapter(settings, adapter)
    }
}

impl<A: ExtractionAdapter> Session<A> {
    pub fn with_adapter(settings: Settings, adapter: A) -> Self {
        Session {
            deriver: settings.schema_deriver(),
            engine: SelectionEngine::new(settings.empty_match),
            datasets: DatasetRegistry::new(settings.dataset_capacity()),
            selections: SelectionRegistry::new(settings.selection_capacity()),
            info: HashMap::new(),
            grouping: GroupingChoice::default(),
            settings,
            adapter,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Load a dataset below the data directory.
    ///
    /// The path is checked before the adapter runs. On any failure the
    /// previously loaded datasets and selections are left untouched.
    pub fn load_dataset(&mut self, relative_path: &str) -> ScopeResult<LoadOutcome> {
        let path = paths::resolve_within(&self.settings.base_dir, relative_path)?;
        let bundle = self
            .adapter
            .load(&path)
            .map_err(|e| ScopeError::UpstreamLoad(format!("{e:#}")))?;
        let schema = Arc::new(self.deriver.derive(bundle.metadata()));
        let status_message = format!(
            "Loaded: {relative_path} ({} cells, {} genes, {} filters)",
            bundle.len(),
            bundle.expression().genes().len(),
            schema.len()
        );

        let (dataset_key, evicted) = self.datasets.insert(bundle);
        for old in &evicted {
            self.info.remove(old);
            let purged = self.selections.purge_dataset(old);
            log::debug!("dropped {purged} selections of evicted dataset {old}");
        }
        self.info.insert(
            dataset_key.clone(),
            DatasetInfo {
                source: relative_path.to_string(),
                schema: Arc::clone(&schema),
            },
        );
        self.grouping = self.grouping.reconcile(&schema);

        log::info!("{status_message} as {dataset_key}");
        Ok(LoadOutcome {
            dataset_key,
            schema,
            status_message,
        })
    }

    pub fn schema(&self, dataset_key: &DatasetKey) -> ScopeResult<Arc<Vec<FilterField>>> {
        self.dataset_info(dataset_key).map(|info| Arc::clone(&info.schema))
    }

    pub fn dataset(&mut self, dataset_key: &DatasetKey) -> ScopeResult<Arc<DatasetBundle>> {
        self.datasets.get(dataset_key)
    }

    // -- grouping fields ----------------------------------------------------

    pub fn grouping(&self) -> &GroupingChoice {
        &self.grouping
    }

    /// Make `field` the colour field, replacing any previous choice.
    pub fn select_color(&mut self, field: Option<&str>) {
        self.grouping.select_color(field);
    }

    /// Make `field` the shape field, replacing any previous choice.
    pub fn select_shape(&mut self, field: Option<&str>) {
        self.grouping.select_shape(field);
    }

    // -- selections -----------------------------------------------------------

    /// Compute a selection for the given filter state and store it under a
    /// fresh key. Colour and shape fields replace the session's current
    /// choice; fields outside the schema degrade to unset. A rejected filter
    /// state leaves the current choice as it was.
    pub fn update_selection(
        &mut self,
        dataset_key: &DatasetKey,
        predicates: &FilterState,
        color_field: Option<&str>,
        shape_field: Option<&str>,
    ) -> ScopeResult<SelectionKey> {
        let bundle = self.datasets.get(dataset_key)?;
        let schema = self.schema(dataset_key)?;

        let mut grouping = self.grouping.clone();
        grouping.select_color(color_field);
        grouping.select_shape(shape_field);
        let grouping = grouping.reconcile(&schema);

        let selection = self
            .engine
            .compute(bundle.metadata(), &schema, predicates, &grouping)?;
        self.grouping = grouping;
        Ok(self.selections.put(dataset_key.clone(), selection))
    }

    /// One-line summary of `predicates` against the dataset's schema.
    pub fn describe_filters(
        &self,
        dataset_key: &DatasetKey,
        predicates: &FilterState,
    ) -> ScopeResult<String> {
        let schema = self.schema(dataset_key)?;
        Ok(describe_active(&schema, predicates))
    }

    // -- plots --------------------------------------------------------------

    /// Project the data one plot needs. A selection computed against another
    /// dataset, or against one that has since been evicted, is not found.
    pub fn request_plot(
        &mut self,
        dataset_key: &DatasetKey,
        selection_key: &SelectionKey,
        kind: PlotKind,
        features: &[String],
    ) -> ScopeResult<PlotArtifact> {
        let bundle = self.datasets.get(dataset_key)?;
        let entry = self.selections.get(selection_key)?;
        if &entry.dataset != dataset_key {
            return Err(ScopeError::selection_not_found(selection_key));
        }

        let table = project(
            &bundle,
            &entry.selection,
            kind,
            features,
            &self.settings.projection_limits(),
        )?;
        let legend = entry
            .selection
            .color_attr()
            .map(|attr| ColorMap::from_attr(attr).legend_entries());

        Ok(PlotArtifact {
            kind,
            dataset: dataset_key.clone(),
            selection: selection_key.clone(),
            table,
            legend,
        })
    }

    // -- files and export -----------------------------------------------------

    pub fn list_files(&self) -> ScopeResult<Vec<FileEntry>> {
        paths::list_files(&self.settings.base_dir, &self.settings.extensions())
    }

    pub fn export_filters(
        &self,
        dataset_key: &DatasetKey,
        genes: &[String],
        predicates: &FilterState,
    ) -> ScopeResult<FilterConfig> {
        let info = self.dataset_info(dataset_key)?;
        Ok(FilterConfig::new(
            Some(info.source.clone()),
            genes.to_vec(),
            predicates.clone(),
            &self.grouping,
        ))
    }

    /// Drop every dataset and selection.
    pub fn clear(&mut self) {
        self.datasets.clear();
        self.selections.clear();
        self.info.clear();
    }

    fn dataset_info(&self, dataset_key: &DatasetKey) -> ScopeResult<&DatasetInfo> {
        if !self.datasets.contains(dataset_key) {
            return Err(ScopeError::dataset_not_found(dataset_key));
        }
        self.info
            .get(dataset_key)
            .ok_or_else(|| ScopeError::dataset_not_found(dataset_key))
    }
}
