//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Every record the pipeline persists is an entity: two values with the same id
/// describe the same row, whatever their current status.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
