//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. In this domain
/// that covers phone numbers, times of day, delivery rules and the like:
/// two `PhoneNumber`s with the same digits are the same recipient.
///
/// To "modify" a value object, build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
