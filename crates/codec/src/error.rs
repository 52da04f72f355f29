//! Codec error set. These never wrap or leak transport errors; the RPC layer
//! translates between the two at its boundary.

use crate::wire::WireType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("schema or enum '{0}' is not defined")]
    SchemaUndefined(String),

    #[error("name '{0}' is already defined")]
    SchemaDuplicate(String),

    #[error("duplicate tag {tag} in schema '{schema}'")]
    TagDuplicate { schema: String, tag: u32 },

    #[error("field '{field}' expects wire type {expected:?}, found {actual:?}")]
    WireTypeMismatch {
        field: String,
        expected: WireType,
        actual: WireType,
    },

    #[error("buffer underflow while reading {context}")]
    BufferUnderflow { context: &'static str },

    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("required field '{field}' of '{schema}' is missing")]
    RequiredFieldMissing { schema: String, field: String },

    #[error("wire type {0} is not supported")]
    InvalidWireType(u8),

    #[error("field '{field}' contains invalid UTF-8")]
    InvalidUtf8 { field: String },

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("value for field '{field}' does not match its declared type: {detail}")]
    ValueTypeMismatch { field: String, detail: String },
}
