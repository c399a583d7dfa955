/// A process-local event.
///
/// Events are **immutable** facts describing something that already happened.
/// Consumers receive clones, so they must be cheap enough to copy per
/// subscriber.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "contact_sync.completed").
    fn event_type(&self) -> &'static str;
}
