//! Machine trait.
//!
//! Machines are pure state machines that interpret events and decide on commands.
//! State lives inside the machine, and the `decide` method is synchronous (no IO).
//!
//! # Key Properties
//!
//! - **State is internal**: the machine owns its state via `&mut self`
//! - **Pure decisions**: no IO, no async, just state transitions and command emission
//! - **Events by value**: events may carry reply channels, which the machine
//!   takes ownership of
//! - **Few commands per event**: most events produce zero or one command; the
//!   small inline buffer avoids allocating for the common case

use smallvec::SmallVec;

/// Commands decided for one event.
pub type Decision<C> = SmallVec<[C; 2]>;

/// A state machine that interprets events and decides on commands.
///
/// # Example
///
/// ```ignore
/// use purchase_queue::machine::{Decision, Machine};
/// use smallvec::smallvec;
///
/// struct Counter { seen: usize }
///
/// impl Machine for Counter {
///     type Event = u32;
///     type Command = String;
///
///     fn decide(&mut self, event: u32) -> Decision<String> {
///         self.seen += 1;
///         if event % 2 == 0 {
///             smallvec![format!("even {}", event)]
///         } else {
///             Decision::new()
///         }
///     }
/// }
/// ```
pub trait Machine: Send + 'static {
    /// The event type this machine handles.
    type Event: Send + 'static;

    /// The command type this machine can emit.
    type Command: Send + 'static;

    /// Process an event and return the commands it requires.
    ///
    /// # Guarantees
    ///
    /// - Called synchronously (no async)
    /// - Called serially (no concurrent calls)
    fn decide(&mut self, event: Self::Event) -> Decision<Self::Command>;
}
