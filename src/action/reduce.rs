use std::collections::BTreeMap;
use std::sync::Arc;

use crate::action::Action;
use crate::core::Payload;
use crate::data::{Data, DataSet};
use crate::engine::Goal;
use crate::error::ActionError;
use crate::meta::{Laminate, Meta, MetaProvider, Value};
use crate::name::{IntoName, Name};

type Reduce<In, Out> =
    Arc<dyn Fn(Vec<(Name, In)>, &Laminate) -> anyhow::Result<Out> + Send + Sync>;

/// How a [`ReduceAction`] sorts items into groups.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupRule {
    /// Everything goes into one group.
    Single(Name),
    /// Groups by the item meta value at `key`, the group is named after its
    /// string form. Items without a value, or with one whose string form is
    /// empty, go to `fallback`, or are dropped if there is none.
    ByMeta { key: Name, fallback: Option<Name> },
}

impl GroupRule {
    pub fn single(name: impl IntoName) -> Result<Self, crate::error::NameError> {
        Ok(GroupRule::Single(name.into_name()?))
    }

    pub fn by_meta(key: impl IntoName) -> Result<Self, crate::error::NameError> {
        Ok(GroupRule::ByMeta {
            key: key.into_name()?,
            fallback: None,
        })
    }

    pub fn or_else(self, fallback: impl IntoName) -> Result<Self, crate::error::NameError> {
        match self {
            GroupRule::ByMeta { key, .. } => Ok(GroupRule::ByMeta {
                key,
                fallback: Some(fallback.into_name()?),
            }),
            single => Ok(single),
        }
    }

    /// The group of an item, with the grouping value it was sorted by.
    fn group_of(&self, meta: &Meta) -> Option<(Name, Option<Value>)> {
        match self {
            GroupRule::Single(name) => Some((name.clone(), None)),
            GroupRule::ByMeta { key, fallback } => {
                let grouped = meta.value(key).and_then(|value| {
                    let name = Name::of(value.to_string()).ok()?;
                    Some((name, Some(value.clone())))
                });
                grouped.or_else(|| fallback.clone().map(|name| (name, None)))
            }
        }
    }
}

/// Folds groups of items into one item each.
///
/// A group item depends on every member goal and carries the set-level
/// meta plus the grouping value. Its reducer receives the members in name
/// order.
pub struct ReduceAction<In, Out> {
    name: String,
    rule: GroupRule,
    reduce: Reduce<In, Out>,
}

impl<In: Payload, Out: Payload> ReduceAction<In, Out> {
    pub fn new<F>(name: impl Into<String>, rule: GroupRule, reduce: F) -> Self
    where
        F: Fn(Vec<(Name, In)>, &Laminate) -> anyhow::Result<Out> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            rule,
            reduce: Arc::new(reduce),
        }
    }
}

impl<In: Payload, Out: Payload> Action<In, Out> for ReduceAction<In, Out> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: &DataSet<In>, meta: &Meta) -> Result<DataSet<Out>, ActionError> {
        let mut groups: BTreeMap<Name, (Option<Value>, Vec<(Name, Goal<In>)>)> = BTreeMap::new();

        for (name, data) in input.iter() {
            match self.rule.group_of(data.meta()) {
                Some((group, value)) => groups
                    .entry(group)
                    .or_insert_with(|| (value, Vec::new()))
                    .1
                    .push((name.clone(), data.goal().clone())),
                None => tracing::debug!(action = %self.name, item = %name, "item left out of every group"),
            }
        }

        let mut output = DataSet::builder();
        output.meta(input.meta().clone());

        for (group, (value, members)) in groups {
            let mut group_meta = input.meta().edit();
            if let (GroupRule::ByMeta { key, .. }, Some(value)) = (&self.rule, value) {
                group_meta
                    .set(key, value)
                    .map_err(|e| ActionError::Item(self.name.clone(), e.into()))?;
            }
            let group_meta = group_meta.build();

            let (names, goals): (Vec<Name>, Vec<Goal<In>>) = members.into_iter().unzip();
            let reduce = Arc::clone(&self.reduce);
            let layers = Laminate::new([group_meta.clone(), meta.clone()]);

            let goal = Goal::depends_on(goals)
                .label(group.to_string())
                .run(move |_, values| reduce(names.into_iter().zip(values).collect(), &layers));

            output.add(group, Data::new(goal, group_meta))?;
        }

        Ok(output.build())
    }
}
