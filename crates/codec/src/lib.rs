//! BinCodec: schema-driven binary serialization.
//!
//! Responsibilities:
//! - Wire primitives: little-endian base-128 varints, zig-zag, fixed-width
//!   scalars, `(tag << 3) | wire_type` field keys (`wire`).
//! - Schema and enum definitions with definition-time validation (`schema`,
//!   `registry`).
//! - A dynamic message value model (`value`) plus the encoder (`encode`) and
//!   decoder (`decode`) operating against compiled schemas.
//!
//! Forward compatibility:
//! - Unknown tags are skipped using their wire type; decoding a payload
//!   produced by a newer schema revision succeeds as long as known tags keep
//!   their types.
//!
//! Non-goals:
//! - Code generation. Messages are built and inspected dynamically; the RPC
//!   layer owns the mapping onto typed APIs.

pub mod decode;
pub mod encode;
pub mod error;
pub mod registry;
pub mod schema;
pub mod value;
pub mod wire;

pub use decode::decode;
pub use encode::encode;
pub use error::CodecError;
pub use registry::{global, Registry};
pub use schema::{BaseType, CompiledSchema, EnumDef, FieldDef, Label};
pub use value::{MessageValue, Value};
pub use wire::WireType;
