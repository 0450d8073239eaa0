use anyhow::{Context, Result};
use rand::RngCore;
use std::marker::PhantomData;

/// Defines the core `Transform` trait for composable, deterministic processing steps.
///
/// The `Transform<I, O>` trait represents a stateless operation for
/// converting an input of type `I` to an output of type `O` (e.g. decoding
/// a path into pixels). Steps chain with `.then(...)` into a single inlined
/// pipeline.
///
/// Note: `then()` works only when:
/// 1. **Types align**: `self: Transform<I, O>`, `next: Transform<O, M>`
/// 2. **Owned**: `Self::Sized` (no trait objects, must be concrete)
/// 3. **Thread-safe**: intermediate and output types must be `Send`
pub trait Transform<I, O>: Send + Sync {
    /// Applies the transformation to the input
    fn apply(&self, input: I) -> Result<O>;

    #[inline]
    fn then<T, M>(self, next: T) -> Chain<Self, T, O>
    where
        Self: Sized,
        T: Transform<O, M>,
        O: Send,
        M: Send,
    {
        Chain {
            first: self,
            second: next,
            _marker: PhantomData,
        }
    }
}

/// Boxed transforms let callers pick a pipeline at runtime (e.g. from CLI flags).
impl<I, O, T> Transform<I, O> for Box<T>
where
    T: Transform<I, O> + ?Sized,
{
    fn apply(&self, input: I) -> Result<O> {
        (**self).apply(input)
    }
}

/// A transform whose output depends on a random source owned by the caller.
///
/// Augmentations take the RNG explicitly instead of reaching for a global one,
/// so each producer thread drives them from its own seeded generator and runs
/// stay reproducible.
pub trait RandomTransform<I, O>: Send + Sync {
    fn apply(&self, input: I, rng: &mut dyn RngCore) -> Result<O>;
}

/// Identity augmentation, handy for disabling a stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOp;

impl<T: Send> RandomTransform<T, T> for NoOp {
    fn apply(&self, input: T, _rng: &mut dyn RngCore) -> Result<T> {
        Ok(input)
    }
}

/// A chain of two transforms (`A` -> `B`)
/// - `PhantomData<M>` enforces intermediate type alignment.
#[derive(Debug, Clone)]
pub struct Chain<A, B, M> {
    first: A,
    second: B,
    _marker: PhantomData<fn() -> M>,
}

impl<A, B, M> Chain<A, B, M> {
    /// Creates a new transform chain.
    /// Use [`Transform::then`] for better ergonomics.
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            _marker: PhantomData,
        }
    }
}

impl<I, M, O, A, B> Transform<I, O> for Chain<A, B, M>
where
    A: Transform<I, M>,
    B: Transform<M, O>,
    M: Send,
{
    fn apply(&self, input: I) -> Result<O> {
        self.first
            .apply(input)
            .and_then(|mid| self.second.apply(mid))
            .with_context(|| {
                format!(
                    "Transform chain failed: {} → {} → {}",
                    std::any::type_name::<A>(),
                    std::any::type_name::<B>(),
                    std::any::type_name::<O>()
                )
            })
    }
}
