#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod action;
mod core;
mod data;
mod engine;
mod error;
pub mod io;
pub mod meta;
mod name;
pub mod task;
mod utils;
mod workspace;

pub use crate::core::Payload;
pub use crate::data::{Data, DataSet, DataSetBuilder};
pub use crate::engine::{
    AnyGoal, Chain, ChainStream, Dependencies, Dispatcher, Goal, GoalBinder, GoalContext,
    GoalState, join, join_map,
};
pub use crate::error::*;
pub use crate::meta::{Laminate, Meta, MetaBuilder, MetaProvider, Value};
pub use crate::name::{IntoName, Name, Token};
pub use crate::task::{DataDependency, Task, TaskBuilder, TaskModel, TaskOutput};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::workspace::{
    CACHE_ENABLED_KEY, CacheConfig, Target, Workspace, WorkspaceBuilder, WorkspaceConfig,
};
