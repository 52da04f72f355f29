//! Message encoder.
//!
//! Fields are emitted in ascending tag order. Optional fields whose value
//! equals their declared default are omitted; required fields must be
//! present. Integer values narrower than 64 bits truncate two's-complement
//! style, never erroring on overflow. Nested messages encode into a
//! temporary buffer so the length prefix is exact.

use crate::error::CodecError;
use crate::registry::Registry;
use crate::schema::{BaseType, CompiledSchema, FieldDef, Label};
use crate::value::{MessageValue, Value};
use crate::wire::{
    put_fixed32, put_fixed64, put_key, put_varint, zigzag_encode, WireType,
};

/// Encode `msg` against the named schema.
pub fn encode(
    registry: &Registry,
    schema_name: &str,
    msg: &MessageValue,
) -> Result<Vec<u8>, CodecError> {
    let schema = registry.schema(schema_name)?;
    let mut out = Vec::new();
    encode_message(registry, schema, msg, &mut out)?;
    Ok(out)
}

fn encode_message(
    registry: &Registry,
    schema: &CompiledSchema,
    msg: &MessageValue,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    for field in schema.fields() {
        let value = match msg.get(&field.name) {
            Some(value) => value,
            None => {
                if field.label == Label::Required {
                    return Err(CodecError::RequiredFieldMissing {
                        schema: schema.name.clone(),
                        field: field.name.clone(),
                    });
                }
                continue;
            }
        };

        match field.label {
            Label::Repeated => encode_repeated(registry, schema, field, value, out)?,
            Label::Required | Label::Optional => {
                if field.label == Label::Optional && field.default.as_ref() == Some(value) {
                    // Default-valued optional fields need not hit the wire.
                    continue;
                }
                put_key(out, field.tag, field.base.wire_type());
                put_scalar(registry, schema, field, value, out)?;
            }
        }
    }
    Ok(())
}

fn encode_repeated(
    registry: &Registry,
    schema: &CompiledSchema,
    field: &FieldDef,
    value: &Value,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    let items = value.as_list().ok_or_else(|| mismatch(field, value))?;
    if items.is_empty() {
        return Ok(());
    }

    if field.packed {
        let mut packed = Vec::new();
        for item in items {
            put_scalar(registry, schema, field, item, &mut packed)?;
        }
        put_key(out, field.tag, WireType::LengthDelim);
        put_varint(out, packed.len() as u64);
        out.extend_from_slice(&packed);
    } else {
        for item in items {
            put_key(out, field.tag, field.base.wire_type());
            put_scalar(registry, schema, field, item, out)?;
        }
    }
    Ok(())
}

fn put_scalar(
    registry: &Registry,
    schema: &CompiledSchema,
    field: &FieldDef,
    value: &Value,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    match field.base {
        BaseType::Int32 => {
            let v = int_of(field, value)?;
            // Sign-extended like a 64-bit value, so negatives stay decodable.
            put_varint(out, (v as i32) as i64 as u64);
        }
        BaseType::Int64 => put_varint(out, int_of(field, value)? as u64),
        BaseType::Uint32 => put_varint(out, u64::from(uint_of(field, value)? as u32)),
        BaseType::Uint64 => put_varint(out, uint_of(field, value)?),
        BaseType::Sint32 => {
            let v = int_of(field, value)? as i32;
            put_varint(out, zigzag_encode(i64::from(v)));
        }
        BaseType::Sint64 => put_varint(out, zigzag_encode(int_of(field, value)?)),
        BaseType::Fixed32 => put_fixed32(out, uint_of(field, value)? as u32),
        BaseType::Fixed64 => put_fixed64(out, uint_of(field, value)?),
        BaseType::Sfixed32 => put_fixed32(out, (int_of(field, value)? as i32) as u32),
        BaseType::Sfixed64 => put_fixed64(out, int_of(field, value)? as u64),
        BaseType::Float => {
            let v = value.as_f64().ok_or_else(|| mismatch(field, value))?;
            put_fixed32(out, (v as f32).to_bits());
        }
        BaseType::Double => {
            let v = value.as_f64().ok_or_else(|| mismatch(field, value))?;
            put_fixed64(out, v.to_bits());
        }
        BaseType::Bool => {
            let v = value.as_bool().ok_or_else(|| mismatch(field, value))?;
            put_varint(out, u64::from(v));
        }
        BaseType::Enum => {
            let v = int_of(field, value)? as i32;
            put_varint(out, v as i64 as u64);
        }
        BaseType::String => {
            let v = value.as_str().ok_or_else(|| mismatch(field, value))?;
            put_varint(out, v.len() as u64);
            out.extend_from_slice(v.as_bytes());
        }
        BaseType::Bytes => {
            let v = value.as_bytes().ok_or_else(|| mismatch(field, value))?;
            put_varint(out, v.len() as u64);
            out.extend_from_slice(v);
        }
        BaseType::Message => {
            let v = value.as_message().ok_or_else(|| mismatch(field, value))?;
            let target = field.type_ref.as_deref().unwrap_or(&schema.name);
            let sub_schema = registry.schema(target)?;
            let mut tmp = Vec::new();
            encode_message(registry, sub_schema, v, &mut tmp)?;
            put_varint(out, tmp.len() as u64);
            out.extend_from_slice(&tmp);
        }
    }
    Ok(())
}

fn int_of(field: &FieldDef, value: &Value) -> Result<i64, CodecError> {
    value.as_i64().ok_or_else(|| mismatch(field, value))
}

fn uint_of(field: &FieldDef, value: &Value) -> Result<u64, CodecError> {
    value.as_u64().ok_or_else(|| mismatch(field, value))
}

fn mismatch(field: &FieldDef, value: &Value) -> CodecError {
    CodecError::ValueTypeMismatch {
        field: field.name.clone(),
        detail: format!("{:?} field given a {} value", field.base, value.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn point_encodes_to_reference_bytes() {
        let reg = point_registry();
        let msg = MessageValue::new().set("x", 150).set("y", -1).set("c", 1);
        let bytes = encode(&reg, "Point", &msg).unwrap();
        assert_eq!(bytes, [0x08, 0x96, 0x01, 0x10, 0x01, 0x18, 0x01]);
    }

    #[test]
    fn default_valued_optional_is_omitted() {
        let reg = point_registry();
        let msg = MessageValue::new().set("x", 1).set("y", 2).set("c", 0);
        let bytes = encode(&reg, "Point", &msg).unwrap();
        // No tag-3 key: RED equals the declared default.
        assert_eq!(bytes, [0x08, 0x01, 0x10, 0x04]);
    }

    #[test]
    fn tags_are_emitted_in_ascending_order() {
        let mut reg = Registry::new();
        reg.define_schema(
            "Unordered",
            vec![
                FieldDef::optional("late", 9, BaseType::Uint64),
                FieldDef::optional("early", 2, BaseType::Uint64),
                FieldDef::optional("middle", 5, BaseType::Uint64),
            ],
        )
        .unwrap();
        let msg = MessageValue::new()
            .set("late", 1u64)
            .set("early", 1u64)
            .set("middle", 1u64);
        let bytes = encode(&reg, "Unordered", &msg).unwrap();
        let keys: Vec<u8> = bytes.iter().step_by(2).copied().collect();
        assert_eq!(keys, [0x10, 0x28, 0x48]);
    }

    #[test]
    fn missing_required_field_fails() {
        let reg = point_registry();
        let msg = MessageValue::new().set("x", 1);
        assert_eq!(
            encode(&reg, "Point", &msg),
            Err(CodecError::RequiredFieldMissing {
                schema: "Point".into(),
                field: "y".into()
            })
        );
    }

    #[test]
    fn negative_int32_sign_extends() {
        let mut reg = Registry::new();
        reg.define_schema("N", vec![FieldDef::required("v", 1, BaseType::Int32)])
            .unwrap();
        let bytes = encode(&reg, "N", &MessageValue::new().set("v", -1)).unwrap();
        assert_eq!(bytes.len(), 1 + 10);
        assert_eq!(bytes[1..], [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
    }

    #[test]
    fn int32_truncates_instead_of_erroring() {
        let mut reg = Registry::new();
        reg.define_schema("N", vec![FieldDef::required("v", 1, BaseType::Int32)])
            .unwrap();
        let wide = MessageValue::new().set("v", 0x1_0000_0001i64);
        let bytes = encode(&reg, "N", &wide).unwrap();
        assert_eq!(bytes, [0x08, 0x01]);
    }

    #[test]
    fn packed_repeated_emits_single_key() {
        let mut reg = Registry::new();
        reg.define_schema("V", vec![FieldDef::repeated("vals", 4, BaseType::Int32)])
            .unwrap();
        let msg = MessageValue::new().set(
            "vals",
            vec![Value::Int(3), Value::Int(270), Value::Int(86942)],
        );
        let bytes = encode(&reg, "V", &msg).unwrap();
        assert_eq!(
            bytes,
            [0x22, 0x06, 0x03, 0x8e, 0x02, 0x9e, 0xa7, 0x05]
        );
    }

    #[test]
    fn unpacked_repeated_emits_key_per_element() {
        let mut reg = Registry::new();
        reg.define_schema(
            "V",
            vec![FieldDef::repeated("vals", 1, BaseType::Int32).unpacked()],
        )
        .unwrap();
        let msg = MessageValue::new().set("vals", vec![Value::Int(1), Value::Int(2)]);
        let bytes = encode(&reg, "V", &msg).unwrap();
        assert_eq!(bytes, [0x08, 0x01, 0x08, 0x02]);
    }

    #[test]
    fn mistyped_value_is_rejected() {
        let reg = point_registry();
        let msg = MessageValue::new().set("x", "one").set("y", 2);
        assert!(matches!(
            encode(&reg, "Point", &msg),
            Err(CodecError::ValueTypeMismatch { .. })
        ));
    }
}
