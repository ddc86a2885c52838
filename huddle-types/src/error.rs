//! Error types for wire encoding and decoding.

/// Errors raised by the envelope codec and the call frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The input could not be decoded. Decoding is total: every
    /// malformed input maps here, never a panic.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The encoded frame would exceed the frame size limit.
    #[error("frame too large: {size} > {limit}")]
    FrameTooLarge {
        /// Size the frame would have had.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A method parameter or result value failed to (de)serialize.
    #[error("parameter encoding failed: {0}")]
    Params(String),
}
