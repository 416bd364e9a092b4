use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, NameError};
use crate::meta::{Laminate, Meta, MetaProvider};
use crate::name::Name;

/// Meta key listing the workspace data sets a task reads.
pub const DATA_KEY: &str = "data";
/// Meta key listing the tasks whose results a task reads.
pub const TASKS_KEY: &str = "tasks";

/// An upstream source of task input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataDependency {
    /// A data set registered in the workspace.
    Data(Name),
    /// The result of another task.
    Task(String),
}

impl Display for DataDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataDependency::Data(name) => write!(f, "data:{name}"),
            DataDependency::Task(name) => write!(f, "task:{name}"),
        }
    }
}

/// Everything needed to run one task invocation: the resolved
/// configuration and the sources to read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskModel {
    pub task: String,
    pub meta: Meta,
    pub dependencies: Vec<DataDependency>,
}

impl TaskModel {
    pub fn new(task: impl Into<String>, meta: Meta) -> Self {
        Self {
            task: task.into(),
            meta,
            dependencies: vec![],
        }
    }

    pub fn depends_on(mut self, dependency: DataDependency) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Reads dependencies from the `data` and `tasks` keys, each holding a
    /// string or a list of strings.
    pub fn from_layers(task: &str, layers: &Laminate) -> Result<Self, ModelError> {
        let mut model = TaskModel::new(task, layers.merge());

        for data in layers.get_strings(DATA_KEY) {
            let name = Name::parse(&data).map_err(|e: NameError| ModelError::Config(e.into()))?;
            model = model.depends_on(DataDependency::Data(name));
        }

        for upstream in layers.get_strings(TASKS_KEY) {
            model = model.depends_on(DataDependency::Task(upstream));
        }

        model.validate()?;
        Ok(model)
    }

    /// Rejects a task reading its own result.
    pub fn validate(&self) -> Result<(), ModelError> {
        let own = DataDependency::Task(self.task.clone());
        if self.dependencies.contains(&own) {
            return Err(ModelError::SelfReference(self.task.clone()));
        }
        Ok(())
    }

    /// Upstream task names, in declared order.
    pub fn upstream_tasks(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().filter_map(|dependency| match dependency {
            DataDependency::Task(name) => Some(name.as_str()),
            DataDependency::Data(_) => None,
        })
    }

    /// Key identifying this invocation for result caching.
    pub fn digest(&self) -> String {
        self.meta.digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers(json: serde_json::Value) -> Laminate {
        Laminate::new([Meta::from_json(&json).unwrap()])
    }

    #[test]
    fn test_default_model() {
        let model = TaskModel::from_layers(
            "render",
            &layers(serde_json::json!({
                "data": ["raw", "extra"],
                "tasks": "parse",
                "threshold": 3,
            })),
        )
        .unwrap();

        assert_eq!(
            model.dependencies,
            vec![
                DataDependency::Data(Name::of("raw").unwrap()),
                DataDependency::Data(Name::of("extra").unwrap()),
                DataDependency::Task("parse".into()),
            ]
        );
        assert_eq!(model.meta.get_i64("threshold"), Some(3));
        assert_eq!(model.upstream_tasks().collect::<Vec<_>>(), vec!["parse"]);
    }

    #[test]
    fn test_self_reference() {
        let err = TaskModel::from_layers("loop", &layers(serde_json::json!({ "tasks": ["loop"] })))
            .unwrap_err();
        assert!(matches!(err, ModelError::SelfReference(task) if task == "loop"));
    }

    #[test]
    fn test_digest_follows_meta() {
        let a = TaskModel::from_layers("t", &layers(serde_json::json!({ "x": 1 }))).unwrap();
        let b = TaskModel::from_layers("t", &layers(serde_json::json!({ "x": 1 }))).unwrap();
        let c = TaskModel::from_layers("t", &layers(serde_json::json!({ "x": 2 }))).unwrap();

        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_invalid_data_name() {
        let err = TaskModel::from_layers("t", &layers(serde_json::json!({ "data": "a..b" })))
            .unwrap_err();
        assert!(matches!(err, ModelError::Config(_)));
    }
}
