use thiserror::Error;

/// Raised by [`crate::message::Message::pop`] when the body holds fewer
/// bytes than `size_of::<V>()`.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("underflow: wanted {wanted} bytes, body has {have}")]
pub struct UnderflowError {
    pub wanted: usize,
    pub have: usize,
}
