//! The app contract: cooperative, non-blocking entry points driven by the
//! framework's tick.

/// An app moves packets between its links and whatever it fronts. `push` and
/// `pull` do bounded work and never block; `stop` releases resources.
pub trait App {
    /// Drain input links.
    fn push(&mut self) {}

    /// Fill output links.
    fn pull(&mut self) {}

    fn stop(&mut self) {}
}
