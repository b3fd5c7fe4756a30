use std::any::TypeId;

/// Anything that can travel through a [`Dispatcher`](crate::Dispatcher).
///
/// Events carry no dispatcher-defined fields. They are:
/// - **owned**: moved into a handling's queue and then into the worker;
/// - **cloned once per extra handling** when several handlings share a type;
/// - identified by their Rust type, never by a name or hash.
///
/// Implemented for every `Clone + Send + 'static` type.
pub trait Event: Clone + Send + 'static {}

impl<T> Event for T where T: Clone + Send + 'static {}

/// Registry key and log label of an event type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct EventType {
    pub(crate) id: TypeId,
    pub(crate) name: &'static str,
}

impl EventType {
    pub(crate) fn of<E: Event>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
        }
    }
}
