use std::sync::Arc;

use crate::action::Action;
use crate::core::Payload;
use crate::data::{Data, DataSet};
use crate::engine::Goal;
use crate::error::ActionError;
use crate::meta::{Laminate, Meta, MetaBuilder};
use crate::name::Name;

type Describe = Arc<dyn Fn(&mut MapItem<'_>) -> anyhow::Result<()> + Send + Sync>;
type Transform<In, Out> = Arc<dyn Fn(In, &Laminate) -> anyhow::Result<Out> + Send + Sync>;

/// Identity of one output item, editable before its goal is built.
pub struct MapItem<'a> {
    pub name: Name,
    pub meta: MetaBuilder,
    /// Configuration the action runs with.
    pub action: &'a Meta,
}

/// Transforms every item on its own.
///
/// The optional `describe` hook sees each item before anything is computed
/// and may rename it or edit its meta. The transform then receives the
/// value together with the item meta layered over the action meta.
pub struct MapAction<In, Out> {
    name: String,
    describe: Option<Describe>,
    transform: Transform<In, Out>,
}

impl<In: Payload, Out: Payload> MapAction<In, Out> {
    pub fn new<F>(name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(In, &Laminate) -> anyhow::Result<Out> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            describe: None,
            transform: Arc::new(transform),
        }
    }

    pub fn describe<F>(mut self, describe: F) -> Self
    where
        F: Fn(&mut MapItem<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.describe = Some(Arc::new(describe));
        self
    }
}

impl<In: Payload, Out: Payload> Action<In, Out> for MapAction<In, Out> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: &DataSet<In>, meta: &Meta) -> Result<DataSet<Out>, ActionError> {
        let mut output = DataSet::builder();
        output.meta(input.meta().clone());

        for (name, data) in input.iter() {
            let mut item = MapItem {
                name: name.clone(),
                meta: data.meta().edit(),
                action: meta,
            };

            if let Some(describe) = &self.describe {
                describe(&mut item).map_err(|e| ActionError::Item(self.name.clone(), e))?;
            }

            let MapItem { name, meta: item_meta, .. } = item;
            let item_meta = item_meta.build();

            if output.contains(&name) {
                return Err(ActionError::Duplicate(self.name.clone(), name));
            }

            let transform = Arc::clone(&self.transform);
            let layers = Laminate::new([item_meta.clone(), meta.clone()]);
            let goal = Goal::depends_on(data.goal().clone())
                .label(name.to_string())
                .run(move |_, value| transform(value, &layers));

            output.add(name, Data::new(goal, item_meta))?;
        }

        Ok(output.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn input() -> DataSet<String> {
        DataSet::from_values((1..=10).map(|i| (i.to_string(), format!("this is my data {i}"))))
            .unwrap()
    }

    fn rename() -> MapAction<String, String> {
        MapAction::new("stage1", |value: String, meta| {
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

    #[test]
    fn test_rename_and_tag() {
        let meta = Meta::builder().with("stage", "stage1").unwrap().build();
        let output = rename().run(&input(), &meta).unwrap();

        assert_eq!(output.len(), 10);
        let item = output.get("newName_4").unwrap();
        assert_eq!(item.goal().get().unwrap(), "this is my data 4: stage1");
        assert_eq!(item.meta().get_bool("odd"), Some(true));
        assert_eq!(output.get("newName_3").unwrap().meta().get_bool("odd"), None);
        assert!(output.get("4").is_none());
    }

    #[test]
    fn test_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let action = MapAction::new("count", move |value: i32, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value + 1)
        });

        let input = DataSet::from_values([("a", 1), ("b", 2)]).unwrap();
        let output = action.run(&input, &Meta::empty()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(output.goal("a").unwrap().get().unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_item_meta_over_action_meta() {
        let action = MapAction::new("suffix", |value: i32, meta| {
            Ok(format!("{value}{}", meta.get_str("suffix").unwrap_or_default()))
        })
        .describe(|item| {
            if item.name.to_string() == "b" {
                item.meta.set("suffix", "!")?;
            }
            Ok(())
        });

        let meta = Meta::builder().with("suffix", "?").unwrap().build();
        let input = DataSet::from_values([("a", 1), ("b", 2)]).unwrap();
        let output = action.run(&input, &meta).unwrap();

        assert_eq!(output.goal("a").unwrap().get().unwrap(), "1?");
        assert_eq!(output.goal("b").unwrap().get().unwrap(), "2!");
    }

    #[test]
    fn test_duplicate_name() {
        let action = MapAction::new("flatten", |value: i32, _| Ok(value)).describe(|item| {
            item.name = Name::of("same")?;
            Ok(())
        });

        let input = DataSet::from_values([("a", 1), ("b", 2)]).unwrap();
        let err = action.run(&input, &Meta::empty()).unwrap_err();
        assert!(matches!(err, ActionError::Duplicate(action, name) if action == "flatten" && name.to_string() == "same"));
    }

    #[test]
    fn test_describe_error() {
        let input = DataSet::from_values([("x", String::from("v"))]).unwrap();
        let err = rename().run(&input, &Meta::empty()).unwrap_err();
        assert!(matches!(err, ActionError::Item(action, _) if action == "stage1"));
    }

    #[test]
    fn test_upstream_failure() {
        let mut builder = DataSet::builder();
        builder
            .add("bad", Data::new(Goal::failed(anyhow::anyhow!("source")), Meta::empty()))
            .unwrap();

        let action = MapAction::new("inc", |value: i32, _| Ok(value + 1));
        let output = action.run(&builder.build(), &Meta::empty()).unwrap();

        let err = output.goal("bad").unwrap().get().unwrap_err();
        assert_eq!(err.root_cause().to_string(), "source");
    }
}
