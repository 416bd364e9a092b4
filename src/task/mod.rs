//! Named pipelines of actions.
//!
//! A [`Task`] is built once from a chain of stages and can then be invoked
//! any number of times. Every invocation starts from a [`TaskModel`], runs
//! the stages in declared order over the input set and returns the wired,
//! not yet evaluated, result together with every intermediate set.

mod model;
mod persist;

use std::any::type_name;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::action::Action;
use crate::core::Payload;
use crate::data::{AnySet, DataSet};
use crate::engine::Dispatcher;
use crate::error::{ActionError, CacheError, ModelError, TaskError};
use crate::meta::{Laminate, Meta};
use crate::utils::{as_overhead, progress_style};

pub use model::{DATA_KEY, DataDependency, TASKS_KEY, TaskModel};

type Pipeline<In, Out> =
    Arc<dyn Fn(DataSet<In>, &mut Run<'_>) -> Result<DataSet<Out>, TaskError> + Send + Sync>;

type ModelHook = Arc<dyn Fn(&str, &Laminate) -> anyhow::Result<TaskModel> + Send + Sync>;

/// State shared by the stages of one invocation.
struct Run<'a> {
    meta: &'a Meta,
    span: &'a tracing::Span,
    stages: Vec<(String, AnySet)>,
}

/// Disk persistence for tasks with serializable output.
#[derive(Clone, Copy)]
struct Persistence {
    save: fn(&AnySet, Utf8PathBuf),
    load: fn(&Utf8Path) -> Result<Option<AnySet>, CacheError>,
}

fn save_erased<T>(set: &AnySet, path: Utf8PathBuf)
where
    T: Payload + Serialize,
{
    if let Some(set) = set.downcast::<T>() {
        persist::write_behind(&set, path);
    }
}

fn load_erased<T>(path: &Utf8Path) -> Result<Option<AnySet>, CacheError>
where
    T: Payload + DeserializeOwned,
{
    Ok(persist::load::<T>(path)?.map(AnySet::new))
}

/// A named pipeline turning a `DataSet<In>` into a `DataSet<Out>`.
pub struct Task<In, Out> {
    name: String,
    defaults: Meta,
    stages: Vec<String>,
    pipeline: Pipeline<In, Out>,
    model: Option<ModelHook>,
    persistence: Option<Persistence>,
}

impl<In: Payload> Task<In, In> {
    /// Starts a task with no stages. Its output type follows the stages
    /// added to the builder.
    pub fn builder(name: impl Into<String>) -> TaskBuilder<In, In> {
        TaskBuilder {
            name: name.into(),
            defaults: Meta::empty(),
            stages: vec![],
            pipeline: Arc::new(|input: DataSet<In>, _: &mut Run<'_>| Ok(input)),
            model: None,
            persistence: None,
        }
    }
}

impl<In: Payload, Out: Payload> Task<In, Out> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration used when neither the target nor the caller set a key.
    pub fn defaults(&self) -> &Meta {
        &self.defaults
    }

    /// Stage names in execution order.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    /// Resolves the model from fully assembled configuration layers.
    pub fn build_model(&self, layers: &Laminate) -> Result<TaskModel, ModelError> {
        let model = match &self.model {
            Some(hook) => hook(&self.name, layers)
                .map_err(|e| ModelError::Userland(self.name.clone(), e))?,
            None => TaskModel::from_layers(&self.name, layers)?,
        };

        model.validate()?;
        Ok(model)
    }

    /// Resolves the model for `meta` layered over the task defaults.
    pub fn model_for(&self, meta: &Meta) -> Result<TaskModel, ModelError> {
        self.build_model(&Laminate::new([meta.clone(), self.defaults.clone()]))
    }

    /// Runs every stage over `input`.
    ///
    /// Stages only wire goals, so this returns as soon as the graph is
    /// built. A stage which cannot build its output fails the whole run.
    pub fn run(&self, model: &TaskModel, input: DataSet<In>) -> Result<TaskOutput<Out>, TaskError> {
        let span = tracing::span!(Level::INFO, "task", name = %self.name);
        span.pb_set_style(progress_style());
        span.pb_set_length(self.stages.len() as u64);
        let _enter = span.enter();

        let start = Instant::now();
        tracing::debug!(items = input.len(), "running task {}", self.name);

        let mut run = Run {
            meta: &model.meta,
            span: &span,
            stages: Vec::with_capacity(self.stages.len()),
        };

        let result = (self.pipeline)(input, &mut run).inspect_err(|error| {
            tracing::debug!(%error, "task {} failed", self.name);
        })?;

        tracing::info!(
            items = result.len(),
            "task {} wired {}",
            self.name,
            as_overhead(start)
        );

        Ok(TaskOutput {
            result,
            stages: run.stages,
        })
    }
}

/// Typed staging area for a [`Task`]. `Cur` is the output type of the last
/// stage added so far.
pub struct TaskBuilder<In, Cur> {
    name: String,
    defaults: Meta,
    stages: Vec<String>,
    pipeline: Pipeline<In, Cur>,
    model: Option<ModelHook>,
    persistence: Option<Persistence>,
}

impl<In: Payload, Cur: Payload> TaskBuilder<In, Cur> {
    /// Appends a stage running `action` over the output of the previous one.
    ///
    /// The action receives the task configuration. When that configuration
    /// holds a node named after the stage, the node is layered on top.
    pub fn stage<Next, A>(self, name: impl Into<String>, action: A) -> TaskBuilder<In, Next>
    where
        Next: Payload,
        A: Action<Cur, Next> + 'static,
    {
        let name = name.into();
        let mut stages = self.stages;
        stages.push(name.clone());

        let previous = self.pipeline;
        let pipeline: Pipeline<In, Next> = Arc::new(move |input: DataSet<In>, run: &mut Run<'_>| {
            let current = previous(input, run)?;
            run_stage(&name, &action, &current, run)
        });

        TaskBuilder {
            name: self.name,
            defaults: self.defaults,
            stages,
            pipeline,
            model: self.model,
            // Persistence is tied to the output type.
            persistence: None,
        }
    }

    pub fn defaults(mut self, defaults: Meta) -> Self {
        self.defaults = defaults;
        self
    }

    /// Replaces the default model step, which reads the `data` and `tasks`
    /// keys.
    pub fn model<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &Laminate) -> anyhow::Result<TaskModel> + Send + Sync + 'static,
    {
        self.model = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Task<In, Cur> {
        Task {
            name: self.name,
            defaults: self.defaults,
            stages: self.stages,
            pipeline: self.pipeline,
            model: self.model,
            persistence: self.persistence,
        }
    }
}

impl<In, Cur> TaskBuilder<In, Cur>
where
    In: Payload,
    Cur: Payload + Serialize + DeserializeOwned,
{
    /// Keeps results on disk when the workspace caches this task.
    pub fn persist(mut self) -> Self {
        self.persistence = Some(Persistence {
            save: save_erased::<Cur>,
            load: load_erased::<Cur>,
        });
        self
    }
}

fn run_stage<I, O, A>(
    name: &str,
    action: &A,
    input: &DataSet<I>,
    run: &mut Run<'_>,
) -> Result<DataSet<O>, TaskError>
where
    I: Payload,
    O: Payload,
    A: Action<I, O>,
{
    let span = tracing::span!(Level::INFO, "stage", name, action = action.name());
    let _enter = span.enter();
    let start = Instant::now();

    let meta = match run.meta.node(name) {
        Some(node) => Laminate::new([node.clone(), run.meta.clone()]).merge(),
        None => run.meta.clone(),
    };

    let output = action
        .run(input, &meta)
        .map_err(|e: ActionError| TaskError::Stage(name.to_string(), e))?;

    tracing::debug!(items = output.len(), "stage {name} {}", as_overhead(start));
    run.span.pb_inc(1);
    run.stages.push((name.to_string(), AnySet::new(output.clone())));

    Ok(output)
}

/// The result of one task invocation.
pub struct TaskOutput<T> {
    result: DataSet<T>,
    stages: Vec<(String, AnySet)>,
}

impl<T: Payload> TaskOutput<T> {
    /// Output of the final stage.
    pub fn result(&self) -> &DataSet<T> {
        &self.result
    }

    pub fn into_result(self) -> DataSet<T> {
        self.result
    }

    /// Output of the stage called `name`, if it produced items of type `S`.
    pub fn stage<S: Payload>(&self, name: &str) -> Option<DataSet<S>> {
        self.stages
            .iter()
            .find(|(stage, _)| stage == name)
            .and_then(|(_, set)| set.downcast())
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|(name, _)| name.as_str())
    }
}

/// A task with its item types erased, as registered in a workspace.
pub(crate) trait AnyTask: Send + Sync {
    fn name(&self) -> &str;

    fn defaults(&self) -> &Meta;

    fn input_type(&self) -> &'static str;

    fn output_type(&self) -> &'static str;

    fn build_model(&self, layers: &Laminate) -> Result<TaskModel, ModelError>;

    /// Merges `inputs` (first wins), moves them onto `dispatcher` and runs
    /// the pipeline.
    fn execute(
        &self,
        model: &TaskModel,
        inputs: Vec<(String, AnySet)>,
        dispatcher: &Dispatcher,
    ) -> Result<AnySet, TaskError>;

    fn is_persistent(&self) -> bool;

    fn store(&self, result: &AnySet, path: Utf8PathBuf);

    fn restore(&self, path: &Utf8Path) -> Result<Option<AnySet>, CacheError>;
}

impl<In: Payload, Out: Payload> AnyTask for Task<In, Out> {
    fn name(&self) -> &str {
        &self.name
    }

    fn defaults(&self) -> &Meta {
        &self.defaults
    }

    fn input_type(&self) -> &'static str {
        type_name::<In>()
    }

    fn output_type(&self) -> &'static str {
        type_name::<Out>()
    }

    fn build_model(&self, layers: &Laminate) -> Result<TaskModel, ModelError> {
        Task::build_model(self, layers)
    }

    fn execute(
        &self,
        model: &TaskModel,
        inputs: Vec<(String, AnySet)>,
        dispatcher: &Dispatcher,
    ) -> Result<AnySet, TaskError> {
        let mut merged = DataSet::<In>::default();

        for (source, set) in inputs {
            let typed = set.downcast::<In>().ok_or_else(|| {
                ModelError::TypeMismatch(source, set.item_type(), type_name::<In>())
            })?;
            merged = merged.merge(&typed);
        }

        let output = self.run(model, merged.on_dispatcher(dispatcher))?;
        Ok(AnySet::new(output.into_result()))
    }

    fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    fn store(&self, result: &AnySet, path: Utf8PathBuf) {
        if let Some(persistence) = self.persistence {
            (persistence.save)(result, path);
        }
    }

    fn restore(&self, path: &Utf8Path) -> Result<Option<AnySet>, CacheError> {
        match self.persistence {
            Some(persistence) => (persistence.load)(path),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{GroupRule, MapAction, ReduceAction};
    use crate::meta::MetaProvider;
    use crate::name::Name;

    fn input() -> DataSet<String> {
        DataSet::from_values((1..=10).map(|i| (i.to_string(), format!("this is my data {i}"))))
            .unwrap()
    }

    fn rename() -> MapAction<String, String> {
        MapAction::new("rename", |value: String, meta| {
            Ok(format!("{value}: {}", meta.get_str("stage").unwrap_or("none")))
        })
        .describe(|item| {
            let index: i64 = item.name.to_string().parse()?;
            item.name = Name::of(format!("newName_{index}"))?;
            if index % 2 == 0 {
                item.meta.set("odd", true)?;
            }
            Ok(())
        })
    }

    fn two_stage() -> Task<String, usize> {
        Task::builder("measure")
            .stage("stage1", rename())
            .stage("lengths", MapAction::new("len", |value: String, _| Ok(value.len())))
            .defaults(Meta::builder().with("stage", "stage1").unwrap().build())
            .build()
    }

    #[test]
    fn test_rename_scenario() {
        let task = Task::builder("rename").stage("stage1", rename()).build();
        let model = task
            .model_for(&Meta::builder().with("stage", "stage1").unwrap().build())
            .unwrap();

        let output = task.run(&model, input()).unwrap();
        let item = output.result().get("newName_4").unwrap();

        assert_eq!(item.goal().get().unwrap(), "this is my data 4: stage1");
        assert_eq!(item.meta().get_bool("odd"), Some(true));
    }

    #[test]
    fn test_intermediate_stages() {
        let task = two_stage();
        let model = task.model_for(&Meta::empty()).unwrap();
        let output = task.run(&model, input()).unwrap();

        assert_eq!(output.stage_names().collect::<Vec<_>>(), vec!["stage1", "lengths"]);

        let first = output.stage::<String>("stage1").unwrap();
        assert_eq!(first.goal("newName_1").unwrap().get().unwrap(), "this is my data 1: stage1");
        assert!(output.stage::<usize>("stage1").is_none());
        assert!(output.stage::<String>("missing").is_none());

        let lengths = output.result();
        assert_eq!(lengths.goal("newName_1").unwrap().get().unwrap(), 25);
    }

    #[test]
    fn test_stage_node_meta() {
        let task = Task::builder("t").stage("stage1", rename()).build();
        let meta = Meta::from_json(&serde_json::json!({
            "stage": "outer",
            "stage1": { "stage": "inner" },
        }))
        .unwrap();

        let output = task.run(&task.model_for(&meta).unwrap(), input()).unwrap();
        assert_eq!(
            output.result().goal("newName_2").unwrap().get().unwrap(),
            "this is my data 2: inner"
        );
    }

    #[test]
    fn test_stage_failure() {
        let task = Task::builder("t")
            .stage(
                "sum",
                ReduceAction::new("sum", GroupRule::single("total").unwrap(), |values: Vec<(Name, String)>, _| {
                    Ok(values.len())
                }),
            )
            .stage(
                "rename",
                MapAction::new("bad", |v: usize, _| Ok(v))
                    .describe(|_| Err(anyhow::anyhow!("refused"))),
            )
            .build();

        let err = task
            .run(&task.model_for(&Meta::empty()).unwrap(), input())
            .err()
            .unwrap();
        assert!(matches!(err, TaskError::Stage(stage, ActionError::Item(..)) if stage == "rename"));
    }

    #[test]
    fn test_model_hook() {
        let task = Task::<i32, i32>::builder("hooked")
            .model(|name, layers| {
                let model = TaskModel::new(name, layers.merge());
                Ok(model.depends_on(DataDependency::Data(Name::of("fixed")?)))
            })
            .build();

        let model = task.model_for(&Meta::empty()).unwrap();
        assert_eq!(model.dependencies, vec![DataDependency::Data(Name::of("fixed").unwrap())]);

        let failing = Task::<i32, i32>::builder("broken")
            .model(|_, _| Err(anyhow::anyhow!("no model")))
            .build();
        assert!(matches!(
            failing.model_for(&Meta::empty()),
            Err(ModelError::Userland(task, _)) if task == "broken"
        ));
    }

    #[test]
    fn test_execute_type_mismatch() {
        let task = two_stage();
        let numbers = AnySet::new(DataSet::from_values([("a", 1)]).unwrap());
        let model = task.model_for(&Meta::empty()).unwrap();

        let err = AnyTask::execute(&task, &model, vec![("data:nums".into(), numbers)], &Dispatcher::global())
            .err()
            .unwrap();
        assert!(matches!(err, TaskError::Model(ModelError::TypeMismatch(source, ..)) if source == "data:nums"));
    }

    #[test]
    fn test_execute_merges_inputs() {
        let task = Task::builder("copy")
            .stage("id", MapAction::new("id", |v: i32, _| Ok(v)))
            .build();
        let first = AnySet::new(DataSet::from_values([("a", 1), ("b", 2)]).unwrap());
        let second = AnySet::new(DataSet::from_values([("b", 20), ("c", 30)]).unwrap());
        let model = task.model_for(&Meta::empty()).unwrap();

        let result = AnyTask::execute(
            &task,
            &model,
            vec![("first".into(), first), ("second".into(), second)],
            &Dispatcher::global(),
        )
        .unwrap()
        .downcast::<i32>()
        .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(result.goal("b").unwrap().get().unwrap(), 2);
        assert_eq!(result.goal("c").unwrap().get().unwrap(), 30);
    }

    #[test]
    fn test_persist_flag() {
        let plain = Task::builder("plain")
            .stage("id", MapAction::new("id", |v: i32, _| Ok(v)))
            .build();
        let stored = Task::builder("stored")
            .stage("id", MapAction::new("id", |v: i32, _| Ok(v)))
            .persist()
            .build();

        assert!(!plain.is_persistent());
        assert!(stored.is_persistent());
        assert_eq!(AnyTask::output_type(&stored), "i32");
    }
}
