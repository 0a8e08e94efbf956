//! Conversions from SDK failures into [`PlatformError`].

use std::error::Error;

use aws_sdk_ecs::error::DisplayErrorContext;
use meshflip_deploy::platform::PlatformError;

/// Map any SDK or builder error for `operation`, keeping its source chain
/// in the message.
pub(crate) fn sdk_error<E: Error>(operation: &'static str) -> impl FnOnce(E) -> PlatformError {
    move |e| PlatformError::new(operation, DisplayErrorContext(e).to_string())
}

/// A response that succeeded but lacks a field meshflip needs.
pub(crate) fn missing(operation: &'static str, what: &str) -> PlatformError {
    PlatformError::new(operation, format!("response has no {what}"))
}

/// Counts and weights are unsigned here and `i32` on the wire.
pub(crate) fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// `None` for an empty list, so optional list members are left unset.
pub(crate) fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() { None } else { Some(items) }
}
