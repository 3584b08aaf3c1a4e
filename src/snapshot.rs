use crate::Result;

/// Anything whose mutable state can be copied out and written back.
///
/// A training run saves the model and the optimizer after every accepted epoch and overwrites
/// them with the saved copy when an epoch is rejected.
pub trait Snapshot {
    /// A deep, independent copy of the state.
    type State: Clone;

    /// Copies the current state out. Later updates must not alter the returned value.
    fn snapshot(&self) -> Self::State;

    /// Overwrites every piece of mutable state with `state`.
    ///
    /// # Returns
    /// An error if `state` was taken from an instance of a different size.
    fn restore(&mut self, state: &Self::State) -> Result<()>;
}
