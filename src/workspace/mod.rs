//! Registry of data sources, tasks and targets.
//!
//! A [`Workspace`] is designed once through a [`WorkspaceBuilder`] and then
//! resolves target names into task invocations:
//!
//! 1. the target is looked up and its task located,
//! 2. configuration is layered as call overrides, target meta, task defaults
//!    and workspace meta, in that order of precedence,
//! 3. models of the task and of every upstream task are built and checked
//!    for unknown sources, cycles and mismatched item types before anything
//!    runs,
//! 4. tasks run dependencies first, results are served from the cache when
//!    caching is enabled for that invocation.

mod cache;

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::core::Payload;
use crate::data::{AnySet, DataSet};
use crate::engine::Dispatcher;
use crate::error::{ConfigError, ModelError, TaskError, WorkspaceError};
use crate::meta::{Laminate, Meta, MetaProvider};
use crate::name::{IntoName, Name};
use crate::task::{AnyTask, DataDependency, Task, TaskModel};

use cache::{CacheKey, ResultCache};

/// Meta key overriding the workspace cache toggle for one invocation.
pub const CACHE_ENABLED_KEY: &str = "cache.enabled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Reuse task results keyed by their resolved configuration.
    pub enabled: bool,
    /// Where results of persistent tasks are written.
    pub dir: Utf8PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: Utf8PathBuf::from(".cache/tasks"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Size of the pool goals run on. The global rayon pool when unset.
    pub threads: Option<usize>,
    pub cache: CacheConfig,
    /// Lowest configuration layer, shared by every task.
    pub meta: Meta,
}

impl WorkspaceConfig {
    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, WorkspaceError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&text).map_err(ConfigError::from)?;
        Ok(config)
    }
}

/// A named configuration preset. Without an explicit task the target name
/// doubles as the task name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    pub task: Option<String>,
    pub meta: Meta,
}

impl Target {
    pub fn new(meta: Meta) -> Self {
        Self { task: None, meta }
    }

    pub fn of(task: impl Into<String>, meta: Meta) -> Self {
        Self {
            task: Some(task.into()),
            meta,
        }
    }
}

#[derive(Deserialize)]
struct TargetFile {
    targets: BTreeMap<String, Target>,
}

pub struct WorkspaceBuilder {
    config: WorkspaceConfig,
    data: BTreeMap<Name, AnySet>,
    tasks: BTreeMap<String, Arc<dyn AnyTask>>,
    targets: BTreeMap<String, Target>,
    error: Option<WorkspaceError>,
}

impl WorkspaceBuilder {
    fn fail(&mut self, error: WorkspaceError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn config(&mut self, config: WorkspaceConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Registers a data source tasks can read with the `data` key.
    pub fn data<T: Payload>(&mut self, name: impl IntoName, set: DataSet<T>) -> &mut Self {
        match name.into_name() {
            Ok(name) => {
                self.data.insert(name, AnySet::new(set));
            }
            Err(e) => self.fail(ConfigError::from(e).into()),
        }
        self
    }

    pub fn task<In: Payload, Out: Payload>(&mut self, task: Task<In, Out>) -> &mut Self {
        let name = task.name().to_string();
        if self.tasks.insert(name.clone(), Arc::new(task)).is_some() {
            tracing::warn!(task = %name, "task registered twice, keeping the last one");
        }
        self
    }

    pub fn target(&mut self, name: impl Into<String>, target: Target) -> &mut Self {
        self.targets.insert(name.into(), target);
        self
    }

    /// Reads targets from a JSON document shaped as
    /// `{"targets": {"name": {"task": "...", "meta": {...}}}}`.
    pub fn targets_from_json(&mut self, path: impl AsRef<Utf8Path>) -> &mut Self {
        let parsed = std::fs::read_to_string(path.as_ref())
            .map_err(WorkspaceError::from)
            .and_then(|text| {
                serde_json::from_str::<TargetFile>(&text)
                    .map_err(|e| WorkspaceError::Config(e.into()))
            });

        match parsed {
            Ok(file) => self.targets.extend(file.targets),
            Err(e) => self.fail(e),
        }
        self
    }

    pub fn finish(self) -> Result<Workspace, WorkspaceError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let dispatcher = match self.config.threads {
            Some(threads) => Dispatcher::with_threads(threads)?,
            None => Dispatcher::global(),
        };

        Ok(Workspace {
            data: self.data,
            tasks: self.tasks,
            targets: self.targets,
            meta: self.config.meta,
            dispatcher,
            cache_enabled: AtomicBool::new(self.config.cache.enabled),
            cache_dir: self.config.cache.dir,
            cache: ResultCache::default(),
        })
    }
}

/// Task models reachable from one target, keyed by reference name.
struct Plan {
    models: HashMap<String, (Arc<dyn AnyTask>, TaskModel)>,
}

pub struct Workspace {
    data: BTreeMap<Name, AnySet>,
    tasks: BTreeMap<String, Arc<dyn AnyTask>>,
    targets: BTreeMap<String, Target>,
    meta: Meta,
    dispatcher: Dispatcher,
    cache_enabled: AtomicBool,
    cache_dir: Utf8PathBuf,
    cache: ResultCache,
}

impl Workspace {
    pub fn design() -> WorkspaceBuilder {
        WorkspaceBuilder {
            config: WorkspaceConfig::default(),
            data: BTreeMap::new(),
            tasks: BTreeMap::new(),
            targets: BTreeMap::new(),
            error: None,
        }
    }

    /// Runs the task behind `target` and returns its result.
    ///
    /// Items are not evaluated. Model errors are returned before any goal
    /// is built.
    pub fn run_task<T: Payload>(&self, target: &str) -> Result<DataSet<T>, WorkspaceError> {
        self.run_task_with(target, &Meta::empty())
    }

    /// Same as [`Workspace::run_task`], with `overrides` on top of every
    /// other layer of the target task.
    pub fn run_task_with<T: Payload>(
        &self,
        target: &str,
        overrides: &Meta,
    ) -> Result<DataSet<T>, WorkspaceError> {
        let plan = self.plan(target, overrides)?;

        let mut done = HashMap::new();
        let result = self.realize(target, &plan, &mut done)?;

        let (task, _) = plan
            .models
            .get(target)
            .ok_or_else(|| WorkspaceError::UnknownTarget(target.to_string()))?;

        result.downcast::<T>().ok_or_else(|| {
            WorkspaceError::Task(
                task.name().to_string(),
                TaskError::OutputType(
                    task.name().to_string(),
                    task.output_type(),
                    std::any::type_name::<T>(),
                ),
            )
        })
    }

    /// Model the target would run with.
    pub fn build_model(&self, target: &str) -> Result<TaskModel, WorkspaceError> {
        let target_def = self
            .targets
            .get(target)
            .ok_or_else(|| WorkspaceError::UnknownTarget(target.to_string()))?;

        let (_, model) = self.resolve(target, Some(target_def), &Meta::empty())?;
        Ok(model)
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::Relaxed)
    }

    /// Forgets results kept in memory. Persisted files stay on disk.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn targets(&self) -> impl Iterator<Item = (&str, &Target)> {
        self.targets.iter().map(|(name, target)| (name.as_str(), target))
    }

    pub fn data_names(&self) -> impl Iterator<Item = &Name> {
        self.data.keys()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Locates the task behind `reference` and builds its model. A reference
    /// without a target definition names a task directly.
    fn resolve(
        &self,
        reference: &str,
        target: Option<&Target>,
        overrides: &Meta,
    ) -> Result<(Arc<dyn AnyTask>, TaskModel), ModelError> {
        let (task_name, target_meta) = match target {
            Some(target) => (target.task.as_deref().unwrap_or(reference), target.meta.clone()),
            None => (reference, Meta::empty()),
        };

        let task = self
            .tasks
            .get(task_name)
            .ok_or_else(|| ModelError::UnknownTask(task_name.to_string()))?;

        let layers = Laminate::new([
            overrides.clone(),
            target_meta,
            task.defaults().clone(),
            self.meta.clone(),
        ]);

        let model = task.build_model(&layers)?;
        Ok((Arc::clone(task), model))
    }

    fn plan(&self, target: &str, overrides: &Meta) -> Result<Plan, WorkspaceError> {
        let target_def = self
            .targets
            .get(target)
            .ok_or_else(|| WorkspaceError::UnknownTarget(target.to_string()))?;

        let mut graph = DiGraph::new();
        let mut indices: HashMap<String, NodeIndex> = HashMap::new();
        let mut models = HashMap::new();

        let root = self.resolve(target, Some(target_def), overrides)?;
        let root_node = graph.add_node(target.to_string());
        indices.insert(target.to_string(), root_node);
        let mut pending = vec![(target.to_string(), root_node, root)];

        while let Some((reference, node, (task, model))) = pending.pop() {
            for dependency in &model.dependencies {
                match dependency {
                    DataDependency::Data(name) => {
                        if !self.data.contains_key(name) {
                            return Err(ModelError::UnknownData(name.clone()).into());
                        }
                    }
                    DataDependency::Task(upstream) => {
                        let upstream_node = match indices.get(upstream) {
                            Some(index) => *index,
                            None => {
                                let index = graph.add_node(upstream.clone());
                                indices.insert(upstream.clone(), index);
                                let resolved =
                                    self.resolve(upstream, self.targets.get(upstream), &Meta::empty())?;
                                pending.push((upstream.clone(), index, resolved));
                                index
                            }
                        };
                        graph.add_edge(upstream_node, node, ());
                    }
                }
            }

            models.insert(reference, (task, model));
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            let at = graph[cycle.node_id()].clone();
            return Err(ModelError::Cycle(at).into());
        }

        for (task, model) in models.values() {
            for dependency in &model.dependencies {
                let found = match dependency {
                    DataDependency::Data(name) => self.data.get(name).map(AnySet::item_type),
                    DataDependency::Task(upstream) => {
                        models.get(upstream).map(|(upstream, _)| upstream.output_type())
                    }
                };
                match found {
                    Some(found) if found != task.input_type() => {
                        return Err(ModelError::TypeMismatch(
                            dependency.to_string(),
                            found,
                            task.input_type(),
                        )
                        .into());
                    }
                    _ => {}
                }
            }
        }

        Ok(Plan { models })
    }

    fn realize(
        &self,
        reference: &str,
        plan: &Plan,
        done: &mut HashMap<String, AnySet>,
    ) -> Result<AnySet, WorkspaceError> {
        if let Some(set) = done.get(reference) {
            return Ok(set.clone());
        }

        let (task, model) = plan
            .models
            .get(reference)
            .ok_or_else(|| ModelError::UnknownTask(reference.to_string()))?;

        let compute = |done: &mut HashMap<String, AnySet>| -> Result<AnySet, WorkspaceError> {
            let mut inputs = Vec::with_capacity(model.dependencies.len());
            for dependency in &model.dependencies {
                let set = match dependency {
                    DataDependency::Data(name) => self
                        .data
                        .get(name)
                        .cloned()
                        .ok_or_else(|| ModelError::UnknownData(name.clone()))?,
                    DataDependency::Task(upstream) => self.realize(upstream, plan, done)?,
                };
                inputs.push((dependency.to_string(), set));
            }

            task.execute(model, inputs, &self.dispatcher)
                .map_err(|e| WorkspaceError::Task(task.name().to_string(), e))
        };

        let caching = model
            .meta
            .get_bool(CACHE_ENABLED_KEY)
            .unwrap_or_else(|| self.cache_enabled());

        let set = if caching {
            self.cached(task.as_ref(), model, || compute(done))?
        } else {
            compute(done)?
        };

        done.insert(reference.to_string(), set.clone());
        Ok(set)
    }

    fn cached(
        &self,
        task: &dyn AnyTask,
        model: &TaskModel,
        compute: impl FnOnce() -> Result<AnySet, WorkspaceError>,
    ) -> Result<AnySet, WorkspaceError> {
        let key = CacheKey::new(task.name(), model.digest());

        let (set, hit) = self.cache.get_or_try_insert(&key, || {
            if !task.is_persistent() {
                return compute();
            }

            let path = key.path_in(&self.cache_dir);
            match task.restore(&path) {
                Ok(Some(set)) => {
                    tracing::info!(task = %key.task, %path, "restored persisted result");
                    return Ok(set);
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(task = %key.task, %path, %error, "ignoring persisted result"),
            }

            let set = compute()?;
            task.store(&set, path);
            Ok(set)
        })?;

        if hit {
            tracing::info!(task = %key.task, digest = %key.digest, "cache hit");
        } else {
            tracing::info!(task = %key.task, digest = %key.digest, "cache miss");
        }

        Ok(set)
    }
}

impl Display for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let mut ids: HashMap<String, usize> = HashMap::new();
        let mut id_of = |key: String| {
            let next = ids.len();
            *ids.entry(key).or_insert(next)
        };

        for name in self.data.keys() {
            let id = id_of(format!("data:{name}"));
            writeln!(f, "    {id}[(\"{}\")]", name.to_string().replace('"', "\\\""))?;
        }

        for (name, target) in &self.targets {
            let id = id_of(format!("task:{name}"));
            let task = target.task.as_deref().unwrap_or(name);
            writeln!(f, "    {id}[\"{} ({})\"]", name.replace('"', "\\\""), task.replace('"', "\\\""))?;
        }

        for name in self.targets.keys() {
            let Ok(model) = self.build_model(name) else {
                continue;
            };
            let target_id = id_of(format!("task:{name}"));

            for dependency in &model.dependencies {
                let source = id_of(dependency.to_string());
                writeln!(f, "    {source}-->{target_id}")?;
            }
        }

        Ok(())
    }
}
