use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{Dynamic, Payload};
use crate::engine::{Dispatcher, Goal, GoalContext, any_failed, join};
use crate::error::DataError;
use crate::io::sink::{Output, Sink};
use crate::meta::Meta;
use crate::name::{IntoName, Name};

const GLOB_OPTS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A lazily computed value together with its own configuration.
pub struct Data<T> {
    goal: Goal<T>,
    meta: Meta,
}

impl<T> Clone for Data<T> {
    fn clone(&self) -> Self {
        Self {
            goal: self.goal.clone(),
            meta: self.meta.clone(),
        }
    }
}

impl<T: Payload> Data<T> {
    pub fn new(goal: Goal<T>, meta: Meta) -> Self {
        Self { goal, meta }
    }

    pub fn value(value: T) -> Self {
        Self::new(Goal::value(value), Meta::empty())
    }

    pub fn lazy<F>(body: F) -> Self
    where
        F: FnOnce(&GoalContext) -> anyhow::Result<T> + Send + 'static,
    {
        Self::new(Goal::lazy(body), Meta::empty())
    }

    pub fn goal(&self) -> &Goal<T> {
        &self.goal
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn with_meta(self, meta: Meta) -> Self {
        Self { meta, ..self }
    }

    /// Transforms the value lazily, keeping the meta.
    pub fn map<R, F>(&self, f: F) -> Data<R>
    where
        R: Payload,
        F: FnOnce(T) -> R + Send + 'static,
    {
        Data::new(self.goal.map(f), self.meta.clone())
    }
}

impl<T: Payload> Debug for Data<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("state", &self.goal.state())
            .field("meta", &self.meta)
            .finish()
    }
}

/// An immutable collection of [`Data`] items keyed by [`Name`].
///
/// Items are kept in name order. Transformations return a new set, and
/// nothing is evaluated until a caller asks a goal for its value.
pub struct DataSet<T> {
    items: Arc<BTreeMap<Name, Data<T>>>,
    meta: Meta,
}

impl<T> Clone for DataSet<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            meta: self.meta.clone(),
        }
    }
}

impl<T> Default for DataSet<T> {
    fn default() -> Self {
        Self {
            items: Arc::default(),
            meta: Meta::empty(),
        }
    }
}

impl<T: Payload> DataSet<T> {
    pub fn builder() -> DataSetBuilder<T> {
        DataSetBuilder {
            items: BTreeMap::new(),
            meta: Meta::empty(),
        }
    }

    pub fn from_values<N>(values: impl IntoIterator<Item = (N, T)>) -> Result<Self, DataError>
    where
        N: IntoName,
    {
        let mut builder = Self::builder();
        for (name, value) in values {
            builder.add(name, Data::value(value))?;
        }
        Ok(builder.build())
    }

    pub fn get(&self, name: impl IntoName) -> Option<&Data<T>> {
        let name = name.into_name().ok()?;
        self.items.get(&name)
    }

    pub fn goal(&self, name: impl IntoName) -> Option<&Goal<T>> {
        self.get(name).map(Data::goal)
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.items.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &Name> {
        self.items.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &Data<T>)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Configuration attached to the set as a whole.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn with_meta(self, meta: Meta) -> Self {
        Self { meta, ..self }
    }

    /// Items whose name, in its string form, matches a glob `pattern`.
    pub fn glob(&self, pattern: &str) -> Result<DataSet<T>, DataError> {
        let pattern = glob::Pattern::new(pattern)?;
        Ok(self.filter(|name, _| pattern.matches_with(&name.to_string(), GLOB_OPTS)))
    }

    /// Items under `prefix`, renamed relative to it.
    pub fn branch(&self, prefix: impl IntoName) -> Result<DataSet<T>, DataError> {
        let prefix = prefix.into_name()?;
        let items = self
            .items
            .iter()
            .filter_map(|(name, data)| Some((name.strip_prefix(&prefix)?, data.clone())))
            .collect();

        Ok(Self {
            items: Arc::new(items),
            meta: self.meta.clone(),
        })
    }

    pub fn filter<F>(&self, predicate: F) -> DataSet<T>
    where
        F: Fn(&Name, &Data<T>) -> bool,
    {
        let items = self
            .items
            .iter()
            .filter(|(name, data)| predicate(name, data))
            .map(|(name, data)| (name.clone(), data.clone()))
            .collect();

        Self {
            items: Arc::new(items),
            meta: self.meta.clone(),
        }
    }

    /// Union of both sets. Items and set-level meta of `self` win.
    pub fn merge(&self, other: &DataSet<T>) -> DataSet<T> {
        let mut items = (*self.items).clone();
        for (name, data) in other.items.iter() {
            items.entry(name.clone()).or_insert_with(|| data.clone());
        }

        let meta = if self.meta.is_empty() {
            other.meta.clone()
        } else {
            self.meta.clone()
        };

        Self {
            items: Arc::new(items),
            meta,
        }
    }

    /// A single goal over every item, in name order.
    pub fn join_all(&self) -> Goal<Vec<(Name, T)>> {
        let names: Vec<Name> = self.items.keys().cloned().collect();
        join(self.items.values().map(|data| data.goal.clone()))
            .map(move |values| names.into_iter().zip(values).collect())
    }

    /// The same items, each relayed through a goal spawned on `dispatcher`,
    /// so everything derived from them runs on that pool.
    pub fn on_dispatcher(&self, dispatcher: &Dispatcher) -> DataSet<T> {
        let items = self
            .items
            .iter()
            .map(|(name, data)| {
                let goal = Goal::depends_on(data.goal.clone())
                    .label(name.to_string())
                    .dispatcher(dispatcher.clone())
                    .run(|_, value| Ok(value));
                (name.clone(), Data::new(goal, data.meta.clone()))
            })
            .collect();

        Self {
            items: Arc::new(items),
            meta: self.meta.clone(),
        }
    }

    /// Pushes every item to `sink` as soon as its goal completes. Items are
    /// not started, failures are logged and skipped.
    pub fn sink_into(&self, sink: Arc<dyn Sink>)
    where
        T: Debug,
    {
        for (name, data) in self.items.iter() {
            let sink = Arc::clone(&sink);
            let name = name.clone();
            let meta = data.meta.clone();

            data.goal.on_complete(move |result| match result {
                Ok(value) => {
                    let output = Output::new(&name, value, &meta);
                    if let Err(error) = sink.push(&output) {
                        tracing::warn!(item = %name, %error, "sink rejected item");
                    }
                }
                Err(error) => {
                    tracing::warn!(item = %name, %error, "item not pushed to sink");
                }
            });
        }
    }
}

impl<T: Payload> Debug for DataSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.items.iter().map(|(name, data)| (name.to_string(), data)))
            .finish()
    }
}

pub struct DataSetBuilder<T> {
    items: BTreeMap<Name, Data<T>>,
    meta: Meta,
}

impl<T: Payload> DataSetBuilder<T> {
    pub fn meta(&mut self, meta: Meta) -> &mut Self {
        self.meta = meta;
        self
    }

    pub fn add(&mut self, name: impl IntoName, data: Data<T>) -> Result<&mut Self, DataError> {
        let name = name.into_name()?;
        if self.items.contains_key(&name) {
            return Err(DataError::Duplicate(name));
        }
        self.items.insert(name, data);
        Ok(self)
    }

    pub fn value(&mut self, name: impl IntoName, value: T) -> Result<&mut Self, DataError> {
        self.add(name, Data::value(value))
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.items.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn build(self) -> DataSet<T> {
        DataSet {
            items: Arc::new(self.items),
            meta: self.meta,
        }
    }
}

/// A [`DataSet`] with its item type erased, as kept in registries and caches.
#[derive(Clone)]
pub(crate) struct AnySet {
    set: Dynamic,
    item_type: &'static str,
    spoiled: fn(&Dynamic) -> bool,
}

fn spoiled<T: Payload>(set: &Dynamic) -> bool {
    set.downcast_ref::<DataSet<T>>().is_some_and(|set| {
        any_failed(set.items.values().map(|data| data.goal.erase()))
    })
}

impl AnySet {
    pub(crate) fn new<T: Payload>(set: DataSet<T>) -> Self {
        Self {
            set: Arc::new(set),
            item_type: std::any::type_name::<T>(),
            spoiled: spoiled::<T>,
        }
    }

    /// Whether some item, or something an unsettled item waits on, already
    /// failed or was cancelled.
    pub(crate) fn is_spoiled(&self) -> bool {
        (self.spoiled)(&self.set)
    }

    pub(crate) fn item_type(&self) -> &'static str {
        self.item_type
    }

    pub(crate) fn downcast<T: Payload>(&self) -> Option<DataSet<T>> {
        self.set.downcast_ref::<DataSet<T>>().cloned()
    }
}

impl Debug for AnySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AnySet<{}>", self.item_type)
    }
}
