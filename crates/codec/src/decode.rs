//! Message decoder.
//!
//! Unknown tags are skipped using their wire type, which is what keeps old
//! readers compatible with newer schema revisions. Known tags are held to
//! their derived wire type, with one exception: a packed-repeated field may
//! arrive as a single length-delimited run of primitives. After parsing,
//! declared defaults are applied to absent optional fields and required
//! presence is verified. Nested messages decode against their length-bounded
//! sub-slice, so schema cycles need no special handling.

use std::collections::HashMap;

use crate::error::CodecError;
use crate::registry::Registry;
use crate::schema::{BaseType, CompiledSchema, FieldDef, Label};
use crate::value::{MessageValue, Value};
use crate::wire::{
    read_delimited, read_fixed32, read_fixed64, read_key, read_varint, skip_value, zigzag_decode,
    WireType,
};

/// Decode `input` against the named schema.
pub fn decode(
    registry: &Registry,
    schema_name: &str,
    input: &[u8],
) -> Result<MessageValue, CodecError> {
    let schema = registry.schema(schema_name)?;
    decode_message(registry, schema, input)
}

fn decode_message(
    registry: &Registry,
    schema: &CompiledSchema,
    input: &[u8],
) -> Result<MessageValue, CodecError> {
    let mut msg = MessageValue::new();
    let mut repeated: HashMap<String, Vec<Value>> = HashMap::new();
    let mut pos = 0;

    while pos < input.len() {
        let (tag, wire_type) = read_key(input, &mut pos)?;
        let Some(field) = schema.field_by_tag(tag) else {
            skip_value(input, &mut pos, wire_type)?;
            continue;
        };

        match field.label {
            Label::Repeated if field.packed => {
                if wire_type != WireType::LengthDelim {
                    return Err(type_mismatch(field, wire_type));
                }
                let (start, end) = read_delimited(input, &mut pos)?;
                let run = &input[start..end];
                let items = repeated.entry(field.name.clone()).or_default();
                let mut run_pos = 0;
                while run_pos < run.len() {
                    items.push(read_scalar(registry, schema, field, run, &mut run_pos)?);
                }
            }
            Label::Repeated => {
                if wire_type != field.base.wire_type() {
                    return Err(type_mismatch(field, wire_type));
                }
                let item = read_scalar(registry, schema, field, input, &mut pos)?;
                repeated.entry(field.name.clone()).or_default().push(item);
            }
            Label::Required | Label::Optional => {
                if wire_type != field.base.wire_type() {
                    return Err(type_mismatch(field, wire_type));
                }
                // Last occurrence wins, matching the encoder's freedom to
                // re-emit a field.
                let value = read_scalar(registry, schema, field, input, &mut pos)?;
                msg.insert(field.name.clone(), value);
            }
        }
    }

    for (name, items) in repeated {
        msg.insert(name, Value::List(items));
    }

    for field in schema.fields() {
        if msg.contains(&field.name) {
            continue;
        }
        match field.label {
            Label::Required => {
                return Err(CodecError::RequiredFieldMissing {
                    schema: schema.name.clone(),
                    field: field.name.clone(),
                });
            }
            Label::Optional => {
                if let Some(default) = &field.default {
                    msg.insert(field.name.clone(), default.clone());
                }
            }
            Label::Repeated => {}
        }
    }

    Ok(msg)
}

fn read_scalar(
    registry: &Registry,
    schema: &CompiledSchema,
    field: &FieldDef,
    input: &[u8],
    pos: &mut usize,
) -> Result<Value, CodecError> {
    let value = match field.base {
        BaseType::Int32 => {
            let raw = read_varint(input, pos)?;
            Value::Int(i64::from((raw as i64) as i32))
        }
        BaseType::Int64 => Value::Int(read_varint(input, pos)? as i64),
        BaseType::Sint32 => {
            let raw = read_varint(input, pos)?;
            Value::Int(i64::from(zigzag_decode(raw) as i32))
        }
        BaseType::Sint64 => Value::Int(zigzag_decode(read_varint(input, pos)?)),
        BaseType::Uint32 => Value::UInt(u64::from(read_varint(input, pos)? as u32)),
        BaseType::Uint64 => Value::UInt(read_varint(input, pos)?),
        BaseType::Bool => Value::Bool(read_varint(input, pos)? != 0),
        BaseType::Enum => {
            let raw = read_varint(input, pos)?;
            Value::Int(i64::from((raw as i64) as i32))
        }
        BaseType::Fixed32 => Value::UInt(u64::from(read_fixed32(input, pos)?)),
        BaseType::Fixed64 => Value::UInt(read_fixed64(input, pos)?),
        BaseType::Sfixed32 => Value::Int(i64::from(read_fixed32(input, pos)? as i32)),
        BaseType::Sfixed64 => Value::Int(read_fixed64(input, pos)? as i64),
        BaseType::Float => Value::Float(f64::from(f32::from_bits(read_fixed32(input, pos)?))),
        BaseType::Double => Value::Float(f64::from_bits(read_fixed64(input, pos)?)),
        BaseType::String => {
            let (start, end) = read_delimited(input, pos)?;
            let text = std::str::from_utf8(&input[start..end]).map_err(|_| {
                CodecError::InvalidUtf8 {
                    field: field.name.clone(),
                }
            })?;
            Value::Str(text.to_string())
        }
        BaseType::Bytes => {
            let (start, end) = read_delimited(input, pos)?;
            Value::Bytes(input[start..end].to_vec())
        }
        BaseType::Message => {
            let (start, end) = read_delimited(input, pos)?;
            let target = field.type_ref.as_deref().unwrap_or(&schema.name);
            let sub_schema = registry.schema(target)?;
            Value::Message(decode_message(registry, sub_schema, &input[start..end])?)
        }
    };
    Ok(value)
}

fn type_mismatch(field: &FieldDef, actual: WireType) -> CodecError {
    CodecError::WireTypeMismatch {
        field: field.name.clone(),
        expected: field.effective_wire_type(),
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode;
    use crate::schema::FieldDef;

    fn point_registry() -> Registry {
        let mut reg = Registry::new();
        reg.define_enum("Color", &[("RED", 0), ("GREEN", 1), ("BLUE", 2)])
            .unwrap();
        reg.define_schema(
            "Point",
            vec![
                FieldDef::required("x", 1, BaseType::Int32),
                FieldDef::required("y", 2, BaseType::Sint32),
                FieldDef::optional("c", 3, BaseType::Enum)
                    .with_type_ref("Color")
                    .with_default(Value::Str("RED".into())),
            ],
        )
        .unwrap();
        reg
    }

    #[test]
    fn point_roundtrip_from_reference_bytes() {
        let reg = point_registry();
        let decoded = decode(&reg, "Point", &[0x08, 0x96, 0x01, 0x10, 0x01, 0x18, 0x01]).unwrap();
        assert_eq!(decoded.get("x").and_then(Value::as_i64), Some(150));
        assert_eq!(decoded.get("y").and_then(Value::as_i64), Some(-1));
        assert_eq!(decoded.get("c").and_then(Value::as_i64), Some(1));

        let reencoded = encode(&reg, "Point", &decoded).unwrap();
        assert_eq!(reencoded, [0x08, 0x96, 0x01, 0x10, 0x01, 0x18, 0x01]);
    }

    #[test]
    fn unknown_field_is_skipped_and_default_applied() {
        let reg = point_registry();
        // x=42, y=-1, plus an unknown tag-4 varint of 123.
        let decoded = decode(&reg, "Point", &[0x08, 0x2a, 0x10, 0x01, 0x20, 0x7b]).unwrap();
        assert_eq!(decoded.get("x").and_then(Value::as_i64), Some(42));
        assert_eq!(decoded.get("y").and_then(Value::as_i64), Some(-1));
        // c was absent: the declared RED default is applied.
        assert_eq!(decoded.get("c").and_then(Value::as_i64), Some(0));
    }

    #[test]
    fn unknown_insertion_does_not_change_known_fields() {
        let reg = point_registry();
        let base = decode(&reg, "Point", &[0x08, 0x2a, 0x10, 0x01]).unwrap();
        for unknown in [
            vec![0x20, 0x7b],                         // varint
            vec![0x25, 1, 2, 3, 4],                   // fixed32
            vec![0x21, 1, 2, 3, 4, 5, 6, 7, 8],       // fixed64
            vec![0x22, 0x03, 0xaa, 0xbb, 0xcc],       // length-delimited
        ] {
            let mut payload = vec![0x08, 0x2a, 0x10, 0x01];
            payload.extend_from_slice(&unknown);
            let decoded = decode(&reg, "Point", &payload).unwrap();
            assert_eq!(decoded, base, "unknown suffix {unknown:?}");
        }
    }

    #[test]
    fn wrong_wire_type_for_known_tag_fails() {
        let reg = point_registry();
        // Tag 1 declared varint, sent as fixed32.
        let err = decode(&reg, "Point", &[0x0d, 1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, CodecError::WireTypeMismatch { .. }));
    }

    #[test]
    fn missing_required_field_fails() {
        let reg = point_registry();
        let err = decode(&reg, "Point", &[0x08, 0x2a]).unwrap_err();
        assert_eq!(
            err,
            CodecError::RequiredFieldMissing {
                schema: "Point".into(),
                field: "y".into()
            }
        );
    }

    #[test]
    fn truncated_value_fails() {
        let reg = point_registry();
        assert_eq!(
            decode(&reg, "Point", &[0x08]),
            Err(CodecError::UnexpectedEnd)
        );
    }

    #[test]
    fn packed_run_roundtrips() {
        let mut reg = Registry::new();
        reg.define_schema("V", vec![FieldDef::repeated("vals", 4, BaseType::Int32)])
            .unwrap();
        let msg = MessageValue::new().set(
            "vals",
            vec![Value::Int(3), Value::Int(270), Value::Int(86942)],
        );
        let bytes = encode(&reg, "V", &msg).unwrap();
        assert_eq!(decode(&reg, "V", &bytes).unwrap(), msg);
    }

    #[test]
    fn packed_field_rejects_bare_varint_element() {
        let mut reg = Registry::new();
        reg.define_schema("V", vec![FieldDef::repeated("vals", 1, BaseType::Int32)])
            .unwrap();
        let err = decode(&reg, "V", &[0x08, 0x03]).unwrap_err();
        assert!(matches!(err, CodecError::WireTypeMismatch { .. }));
    }

    #[test]
    fn nested_message_roundtrips() {
        let mut reg = Registry::new();
        reg.define_schema(
            "Inner",
            vec![FieldDef::required("id", 1, BaseType::Uint64)],
        )
        .unwrap();
        reg.define_schema(
            "Outer",
            vec![
                FieldDef::optional("name", 1, BaseType::String),
                FieldDef::optional("inner", 2, BaseType::Message).with_type_ref("Inner"),
            ],
        )
        .unwrap();

        let msg = MessageValue::new()
            .set("name", "outer")
            .set("inner", MessageValue::new().set("id", 9u64));
        let bytes = encode(&reg, "Outer", &msg).unwrap();
        assert_eq!(decode(&reg, "Outer", &bytes).unwrap(), msg);
    }

    #[test]
    fn self_referential_schema_roundtrips() {
        let mut reg = Registry::new();
        reg.define_schema(
            "Node",
            vec![
                FieldDef::optional("value", 1, BaseType::Int64),
                FieldDef::repeated("children", 2, BaseType::Message)
                    .with_type_ref("Node")
                    .unpacked(),
            ],
        )
        .unwrap();

        let leaf = MessageValue::new().set("value", 3i64);
        let root = MessageValue::new()
            .set("value", 1i64)
            .set("children", vec![Value::Message(leaf)]);
        let bytes = encode(&reg, "Node", &root).unwrap();
        assert_eq!(decode(&reg, "Node", &bytes).unwrap(), root);
    }

    #[test]
    fn required_inside_nested_message_is_enforced() {
        let mut reg = Registry::new();
        reg.define_schema(
            "Inner",
            vec![FieldDef::required("id", 1, BaseType::Uint64)],
        )
        .unwrap();
        reg.define_schema(
            "Outer",
            vec![FieldDef::optional("inner", 1, BaseType::Message).with_type_ref("Inner")],
        )
        .unwrap();
        // Outer with an empty Inner payload.
        let err = decode(&reg, "Outer", &[0x0a, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::RequiredFieldMissing { .. }));
    }

    #[test]
    fn scalar_families_roundtrip() {
        let mut reg = Registry::new();
        reg.define_schema(
            "All",
            vec![
                FieldDef::optional("i32", 1, BaseType::Int32),
                FieldDef::optional("i64", 2, BaseType::Int64),
                FieldDef::optional("s64", 3, BaseType::Sint64),
                FieldDef::optional("u32", 4, BaseType::Uint32),
                FieldDef::optional("f32", 5, BaseType::Fixed32),
                FieldDef::optional("sf64", 6, BaseType::Sfixed64),
                FieldDef::optional("fl", 7, BaseType::Float),
                FieldDef::optional("db", 8, BaseType::Double),
                FieldDef::optional("ok", 9, BaseType::Bool),
                FieldDef::optional("s", 10, BaseType::String),
                FieldDef::optional("b", 11, BaseType::Bytes),
            ],
        )
        .unwrap();

        let msg = MessageValue::new()
            .set("i32", -40)
            .set("i64", i64::MIN)
            .set("s64", -123456789i64)
            .set("u32", 4_000_000_000u64)
            .set("f32", 7u64)
            .set("sf64", -7i64)
            .set("fl", 1.5f64)
            .set("db", -2.25f64)
            .set("ok", true)
            .set("s", "héllo")
            .set("b", vec![0u8, 255, 7]);
        let bytes = encode(&reg, "All", &msg).unwrap();
        assert_eq!(decode(&reg, "All", &bytes).unwrap(), msg);
    }

    #[test]
    fn invalid_utf8_in_string_field_fails() {
        let mut reg = Registry::new();
        reg.define_schema("S", vec![FieldDef::optional("s", 1, BaseType::String)])
            .unwrap();
        let err = decode(&reg, "S", &[0x0a, 0x02, 0xff, 0xfe]).unwrap_err();
        assert_eq!(err, CodecError::InvalidUtf8 { field: "s".into() });
    }
}
