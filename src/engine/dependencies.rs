use std::sync::Arc;

use crate::core::Payload;
use crate::engine::{AnyGoal, Goal};
use crate::error::GoalError;

/// Describes what a goal waits for and how the settled values are handed to
/// its body.
pub trait Dependencies: Send + 'static {
    /// Values passed to the body once every dependency completed.
    type Output: Send;

    fn upstream(&self) -> Vec<Arc<dyn AnyGoal>>;

    /// Reads the settled values. Only called after every upstream goal
    /// completed.
    fn resolve(&self) -> Result<Self::Output, GoalError>;
}

impl Dependencies for () {
    type Output = ();

    fn upstream(&self) -> Vec<Arc<dyn AnyGoal>> {
        vec![]
    }

    fn resolve(&self) -> Result<Self::Output, GoalError> {
        Ok(())
    }
}

impl<T: Payload> Dependencies for Goal<T> {
    type Output = T;

    fn upstream(&self) -> Vec<Arc<dyn AnyGoal>> {
        vec![self.erase()]
    }

    fn resolve(&self) -> Result<Self::Output, GoalError> {
        self.get()
    }
}

impl<T: Payload> Dependencies for Vec<Goal<T>> {
    type Output = Vec<T>;

    fn upstream(&self) -> Vec<Arc<dyn AnyGoal>> {
        self.iter().map(Goal::erase).collect()
    }

    fn resolve(&self) -> Result<Self::Output, GoalError> {
        self.iter().map(Goal::get).collect()
    }
}

macro_rules! impl_deps {
    ($($T:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($T: Payload),*> Dependencies for ($(Goal<$T>,)*) {
            type Output = ($($T,)*);

            fn upstream(&self) -> Vec<Arc<dyn AnyGoal>> {
                let ($($T,)*) = self;
                vec![$($T.erase()),*]
            }

            fn resolve(&self) -> Result<Self::Output, GoalError> {
                let ($($T,)*) = self;
                Ok(($($T.get()?,)*))
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);
impl_deps!(A, B, C, D, E, F, G);
impl_deps!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_order() {
        let a = Goal::value(1).map(|v| v);
        let b = Goal::value("b").map(|v| v);
        let deps = (a.clone(), b.clone());

        let upstream = deps.upstream();
        assert_eq!(upstream.len(), 2);
        assert!(Arc::ptr_eq(&upstream[0], &a.erase()));
        assert!(Arc::ptr_eq(&upstream[1], &b.erase()));
    }

    #[test]
    fn test_mixed_tuple() {
        let goal = Goal::depends_on((Goal::value(2), Goal::value(String::from("x")), Goal::value(true)))
            .run(|_, (n, s, flag)| Ok(format!("{}{}", s.repeat(n), flag)));

        assert_eq!(goal.get().unwrap(), "xxtrue");
    }

    #[test]
    fn test_vec() {
        let goals: Vec<_> = (1..=4).map(Goal::value).collect();
        let sum = Goal::depends_on(goals).run(|_, values| Ok(values.iter().sum::<i32>()));
        assert_eq!(sum.get().unwrap(), 10);
    }

    #[test]
    fn test_empty_vec() {
        let goals: Vec<Goal<i32>> = vec![];
        let all = Goal::depends_on(goals).run(|_, values| Ok(values.len()));
        assert_eq!(all.get().unwrap(), 0);
    }
}
