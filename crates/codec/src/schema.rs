//! Schema building blocks: base types, field definitions and their compiled
//! forms. Validation happens in `registry` at definition time; everything in
//! here is inert data plus derivation helpers.

use std::collections::HashMap;

use crate::value::Value;
use crate::wire::WireType;

/// Base types a field may carry. Wire representation is derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Float,
    Double,
    Bool,
    String,
    Bytes,
    Message,
    Enum,
}

impl BaseType {
    /// Wire type of a single (non-packed) value of this base type.
    pub fn wire_type(self) -> WireType {
        match self {
            BaseType::Int32
            | BaseType::Int64
            | BaseType::Uint32
            | BaseType::Uint64
            | BaseType::Sint32
            | BaseType::Sint64
            | BaseType::Bool
            | BaseType::Enum => WireType::Varint,
            BaseType::Fixed64 | BaseType::Sfixed64 | BaseType::Double => WireType::Fixed64,
            BaseType::Fixed32 | BaseType::Sfixed32 | BaseType::Float => WireType::Fixed32,
            BaseType::String | BaseType::Bytes | BaseType::Message => WireType::LengthDelim,
        }
    }

    /// Whether repeated values of this type may be packed into one
    /// length-delimited run.
    pub fn packable(self) -> bool {
        !matches!(self, BaseType::String | BaseType::Bytes | BaseType::Message)
    }

    /// Message and enum fields must name the type they reference.
    pub fn needs_type_ref(self) -> bool {
        matches!(self, BaseType::Message | BaseType::Enum)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Required,
    Optional,
    Repeated,
}

/// A single field of a schema.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub tag: u32,
    pub base: BaseType,
    pub label: Label,
    /// Packed encoding for repeated scalars. Defaults to on for packable
    /// types; must stay off for strings, bytes and messages.
    pub packed: bool,
    pub deprecated: bool,
    /// Declared default for optional fields. Enum defaults are given by
    /// variant name and resolved to their number at definition time.
    pub default: Option<Value>,
    /// Referenced schema or enum name for message/enum fields.
    pub type_ref: Option<String>,
    /// Alternate name used by JSON views of this message.
    pub json_name: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, tag: u32, base: BaseType, label: Label) -> Self {
        Self {
            name: name.into(),
            tag,
            base,
            label,
            packed: label == Label::Repeated && base.packable(),
            deprecated: false,
            default: None,
            type_ref: None,
            json_name: None,
        }
    }

    pub fn required(name: impl Into<String>, tag: u32, base: BaseType) -> Self {
        Self::new(name, tag, base, Label::Required)
    }

    pub fn optional(name: impl Into<String>, tag: u32, base: BaseType) -> Self {
        Self::new(name, tag, base, Label::Optional)
    }

    pub fn repeated(name: impl Into<String>, tag: u32, base: BaseType) -> Self {
        Self::new(name, tag, base, Label::Repeated)
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_type_ref(mut self, type_ref: impl Into<String>) -> Self {
        self.type_ref = Some(type_ref.into());
        self
    }

    pub fn with_json_name(mut self, json_name: impl Into<String>) -> Self {
        self.json_name = Some(json_name.into());
        self
    }

    pub fn unpacked(mut self) -> Self {
        self.packed = false;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    /// Wire type this field occupies in an encoded message.
    pub fn effective_wire_type(&self) -> WireType {
        if self.label == Label::Repeated && self.packed {
            WireType::LengthDelim
        } else {
            self.base.wire_type()
        }
    }
}

/// A validated schema: fields in ascending tag order plus lookup tables.
#[derive(Debug)]
pub struct CompiledSchema {
    pub name: String,
    fields: Vec<FieldDef>,
    by_tag: HashMap<u32, usize>,
    by_name: HashMap<String, usize>,
}

impl CompiledSchema {
    pub(crate) fn new(name: String, mut fields: Vec<FieldDef>) -> Self {
        fields.sort_by_key(|f| f.tag);
        let by_tag = fields.iter().enumerate().map(|(i, f)| (f.tag, i)).collect();
        let by_name = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self {
            name,
            fields,
            by_tag,
            by_name,
        }
    }

    /// Fields in ascending tag order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field_by_tag(&self, tag: u32) -> Option<&FieldDef> {
        self.by_tag.get(&tag).map(|i| &self.fields[*i])
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.by_name.get(name).map(|i| &self.fields[*i])
    }
}

/// A validated enum: bidirectional name/number lookup.
#[derive(Debug)]
pub struct EnumDef {
    pub name: String,
    by_name: HashMap<String, i32>,
    by_number: HashMap<i32, String>,
}

impl EnumDef {
    pub(crate) fn new(
        name: String,
        by_name: HashMap<String, i32>,
        by_number: HashMap<i32, String>,
    ) -> Self {
        Self {
            name,
            by_name,
            by_number,
        }
    }

    pub fn number(&self, variant: &str) -> Option<i32> {
        self.by_name.get(variant).copied()
    }

    pub fn variant(&self, number: i32) -> Option<&str> {
        self.by_number.get(&number).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_types_derive_deterministically() {
        assert_eq!(BaseType::Int32.wire_type(), WireType::Varint);
        assert_eq!(BaseType::Sint64.wire_type(), WireType::Varint);
        assert_eq!(BaseType::Fixed64.wire_type(), WireType::Fixed64);
        assert_eq!(BaseType::Sfixed32.wire_type(), WireType::Fixed32);
        assert_eq!(BaseType::Double.wire_type(), WireType::Fixed64);
        assert_eq!(BaseType::String.wire_type(), WireType::LengthDelim);
        assert_eq!(BaseType::Message.wire_type(), WireType::LengthDelim);
    }

    #[test]
    fn repeated_numeric_defaults_to_packed() {
        let field = FieldDef::repeated("values", 1, BaseType::Uint32);
        assert!(field.packed);
        assert_eq!(field.effective_wire_type(), WireType::LengthDelim);

        let strings = FieldDef::repeated("names", 2, BaseType::String);
        assert!(!strings.packed);
        assert_eq!(strings.effective_wire_type(), WireType::LengthDelim);
    }

    #[test]
    fn compiled_schema_sorts_by_tag() {
        let schema = CompiledSchema::new(
            "Sample".into(),
            vec![
                FieldDef::optional("b", 7, BaseType::Bool),
                FieldDef::optional("a", 2, BaseType::Int32),
            ],
        );
        let tags: Vec<u32> = schema.fields().iter().map(|f| f.tag).collect();
        assert_eq!(tags, vec![2, 7]);
        assert_eq!(schema.field_by_tag(7).unwrap().name, "b");
        assert_eq!(schema.field_by_name("a").unwrap().tag, 2);
    }
}
