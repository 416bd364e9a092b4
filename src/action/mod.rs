//! Transformations from one [`DataSet`] into another.
//!
//! An action only wires goals together: nothing is computed while it runs,
//! the returned items evaluate once a caller asks for them. Given the same
//! input and configuration an action produces the same graph, which is what
//! makes caching whole task results sound.

mod map;
mod reduce;
mod split;

use std::marker::PhantomData;

use crate::core::Payload;
use crate::data::DataSet;
use crate::error::ActionError;
use crate::meta::Meta;

pub use map::{MapAction, MapItem};
pub use reduce::{GroupRule, ReduceAction};
pub use split::{Fragment, SplitAction};

pub trait Action<In: Payload, Out: Payload>: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, input: &DataSet<In>, meta: &Meta) -> Result<DataSet<Out>, ActionError>;

    /// Feeds the output of this action into `next`.
    fn then<Next, Final>(self, next: Next) -> Pipe<Self, Next, Out>
    where
        Self: Sized,
        Next: Action<Out, Final>,
        Final: Payload,
    {
        Pipe {
            name: format!("{} | {}", self.name(), next.name()),
            first: self,
            second: next,
            _mid: PhantomData,
        }
    }
}

/// Two actions run back to back with the same configuration.
pub struct Pipe<A, B, Mid> {
    name: String,
    first: A,
    second: B,
    _mid: PhantomData<fn() -> Mid>,
}

impl<In, Mid, Out, A, B> Action<In, Out> for Pipe<A, B, Mid>
where
    In: Payload,
    Mid: Payload,
    Out: Payload,
    A: Action<In, Mid>,
    B: Action<Mid, Out>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: &DataSet<In>, meta: &Meta) -> Result<DataSet<Out>, ActionError> {
        let mid = self.first.run(input, meta)?;
        self.second.run(&mid, meta)
    }
}

/// An action from a plain function.
pub struct FnAction<F> {
    name: String,
    func: F,
}

impl<F> FnAction<F> {
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<In, Out, F> Action<In, Out> for FnAction<F>
where
    In: Payload,
    Out: Payload,
    F: Fn(&DataSet<In>, &Meta) -> Result<DataSet<Out>, ActionError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: &DataSet<In>, meta: &Meta) -> Result<DataSet<Out>, ActionError> {
        (self.func)(input, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_action() {
        let drop_b = FnAction::new("drop-b", |input: &DataSet<i32>, _: &Meta| {
            Ok::<_, ActionError>(input.filter(|name, _| name.to_string() != "b"))
        });

        let input = DataSet::from_values([("a", 1), ("b", 2)]).unwrap();
        let output = drop_b.run(&input, &Meta::empty()).unwrap();
        assert_eq!(output.len(), 1);
        assert!(output.get("b").is_none());
        assert_eq!(drop_b.name(), "drop-b");
    }

    #[test]
    fn test_pipe() {
        let double = MapAction::new("double", |value: i32, _| Ok(value * 2));
        let show = MapAction::new("show", |value: i32, _| Ok(format!("<{value}>")));
        let pipe = double.then(show);

        let input = DataSet::from_values([("a", 1), ("b", 5)]).unwrap();
        let output = pipe.run(&input, &Meta::empty()).unwrap();

        assert_eq!(pipe.name(), "double | show");
        assert_eq!(output.goal("b").unwrap().get().unwrap(), "<10>");
    }
}
