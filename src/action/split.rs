use std::sync::Arc;

use crate::action::Action;
use crate::core::Payload;
use crate::data::{Data, DataSet};
use crate::engine::Goal;
use crate::error::{ActionError, NameError};
use crate::meta::{Laminate, Meta};
use crate::name::{IntoName, Name};

type Extract<In, Out> = Arc<dyn Fn(In, &Laminate) -> anyhow::Result<Out> + Send + Sync>;

/// One piece cut out of every input item.
pub struct Fragment<In, Out> {
    suffix: Name,
    meta: Meta,
    extract: Extract<In, Out>,
}

impl<In: Payload, Out: Payload> Fragment<In, Out> {
    pub fn new<F>(suffix: impl IntoName, extract: F) -> Result<Self, NameError>
    where
        F: Fn(In, &Laminate) -> anyhow::Result<Out> + Send + Sync + 'static,
    {
        Ok(Self {
            suffix: suffix.into_name()?,
            meta: Meta::empty(),
            extract: Arc::new(extract),
        })
    }

    /// Meta layered over the item meta for this fragment only.
    pub fn with_meta(self, meta: Meta) -> Self {
        Self { meta, ..self }
    }
}

/// Splits every item into fragments named `<item>.<suffix>`.
pub struct SplitAction<In, Out> {
    name: String,
    fragments: Vec<Fragment<In, Out>>,
}

impl<In: Payload, Out: Payload> SplitAction<In, Out> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fragments: vec![],
        }
    }

    pub fn fragment(mut self, fragment: Fragment<In, Out>) -> Self {
        self.fragments.push(fragment);
        self
    }
}

impl<In: Payload, Out: Payload> Action<In, Out> for SplitAction<In, Out> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: &DataSet<In>, meta: &Meta) -> Result<DataSet<Out>, ActionError> {
        let mut output = DataSet::builder();
        output.meta(input.meta().clone());

        for (name, data) in input.iter() {
            for fragment in &self.fragments {
                let target = name.join(&fragment.suffix);
                if output.contains(&target) {
                    return Err(ActionError::Duplicate(self.name.clone(), target));
                }

                let item_meta = Laminate::new([fragment.meta.clone(), data.meta().clone()]).merge();
                let layers = Laminate::new([item_meta.clone(), meta.clone()]);
                let extract = Arc::clone(&fragment.extract);

                let goal = Goal::depends_on(data.goal().clone())
                    .label(target.to_string())
                    .run(move |_, value| extract(value, &layers));

                output.add(target, Data::new(goal, item_meta))?;
            }
        }

        Ok(output.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaProvider;

    fn words() -> SplitAction<String, String> {
        SplitAction::new("words")
            .fragment(
                Fragment::new("head", |text: String, _| {
                    Ok(text.split_whitespace().next().unwrap_or_default().to_string())
                })
                .unwrap(),
            )
            .fragment(
                Fragment::new("tail", |text: String, _| {
                    Ok(text.split_whitespace().skip(1).collect::<Vec<_>>().join(" "))
                })
                .unwrap()
                .with_meta(Meta::builder().with("partial", true).unwrap().build()),
            )
    }

    #[test]
    fn test_split() {
        let input = DataSet::from_values([("doc", String::from("hello big world"))]).unwrap();
        let output = words().run(&input, &Meta::empty()).unwrap();

        assert_eq!(output.len(), 2);
        assert_eq!(output.goal("doc.head").unwrap().get().unwrap(), "hello");
        assert_eq!(output.goal("doc.tail").unwrap().get().unwrap(), "big world");
        assert_eq!(output.get("doc.tail").unwrap().meta().get_bool("partial"), Some(true));
        assert_eq!(output.get("doc.head").unwrap().meta().get_bool("partial"), None);
    }

    #[test]
    fn test_shared_input_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut builder = DataSet::builder();
        builder
            .add(
                "doc",
                Data::lazy(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(String::from("a b"))
                }),
            )
            .unwrap();

        let output = words().run(&builder.build(), &Meta::empty()).unwrap();
        output.join_all().get().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
