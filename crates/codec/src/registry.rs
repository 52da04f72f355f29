//! Schema and enum registries.
//!
//! Both kinds of definition share one name namespace. Validation happens
//! here, at definition time: tags, variant numbers, cross-references and
//! declared defaults are all checked before a definition becomes visible, so
//! the decoder never has to re-validate. The process-global registry is built
//! during init and treated as immutable afterwards; concurrent definition is
//! serialized by the surrounding `RwLock`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::CodecError;
use crate::schema::{BaseType, CompiledSchema, EnumDef, FieldDef, Label};
use crate::value::Value;

#[derive(Debug, Default)]
pub struct Registry {
    schemas: HashMap<String, Arc<CompiledSchema>>,
    enums: HashMap<String, Arc<EnumDef>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define an enum. Names and numbers must both be unique within the enum
    /// and the enum name must be free in the shared namespace.
    pub fn define_enum(
        &mut self,
        name: &str,
        variants: &[(&str, i32)],
    ) -> Result<(), CodecError> {
        self.check_name_free(name)?;
        if variants.is_empty() {
            return Err(CodecError::InvalidDefinition(format!(
                "enum '{name}' has no variants"
            )));
        }

        let mut by_name = HashMap::with_capacity(variants.len());
        let mut by_number = HashMap::with_capacity(variants.len());
        for (variant, number) in variants {
            if by_name.insert((*variant).to_string(), *number).is_some() {
                return Err(CodecError::InvalidDefinition(format!(
                    "enum '{name}' repeats variant name '{variant}'"
                )));
            }
            if by_number.insert(*number, (*variant).to_string()).is_some() {
                return Err(CodecError::InvalidDefinition(format!(
                    "enum '{name}' repeats number {number}"
                )));
            }
        }

        self.enums.insert(
            name.to_string(),
            Arc::new(EnumDef::new(name.to_string(), by_name, by_number)),
        );
        Ok(())
    }

    /// Define a schema. Tags must be positive and unique, referenced types
    /// must exist (a schema may reference itself), and declared defaults must
    /// type-check. Enum defaults are given by variant name and are resolved
    /// to their number here.
    pub fn define_schema(
        &mut self,
        name: &str,
        fields: Vec<FieldDef>,
    ) -> Result<(), CodecError> {
        self.check_name_free(name)?;

        let mut seen_tags = HashMap::new();
        let mut seen_names = HashMap::new();
        let mut resolved = Vec::with_capacity(fields.len());

        for mut field in fields {
            if field.tag == 0 {
                return Err(CodecError::InvalidDefinition(format!(
                    "field '{}' of '{name}' uses tag 0; tags must be positive",
                    field.name
                )));
            }
            if seen_tags.insert(field.tag, field.name.clone()).is_some() {
                return Err(CodecError::TagDuplicate {
                    schema: name.to_string(),
                    tag: field.tag,
                });
            }
            if seen_names.insert(field.name.clone(), field.tag).is_some() {
                return Err(CodecError::InvalidDefinition(format!(
                    "schema '{name}' repeats field name '{}'",
                    field.name
                )));
            }
            if field.packed && !(field.label == Label::Repeated && field.base.packable()) {
                return Err(CodecError::InvalidDefinition(format!(
                    "field '{}' of '{name}' cannot be packed",
                    field.name
                )));
            }

            self.resolve_type_ref(name, &field)?;
            self.resolve_default(name, &mut field)?;
            resolved.push(field);
        }

        self.schemas.insert(
            name.to_string(),
            Arc::new(CompiledSchema::new(name.to_string(), resolved)),
        );
        Ok(())
    }

    pub fn schema(&self, name: &str) -> Result<&Arc<CompiledSchema>, CodecError> {
        self.schemas
            .get(name)
            .ok_or_else(|| CodecError::SchemaUndefined(name.to_string()))
    }

    pub fn enum_def(&self, name: &str) -> Result<&Arc<EnumDef>, CodecError> {
        self.enums
            .get(name)
            .ok_or_else(|| CodecError::SchemaUndefined(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name) || self.enums.contains_key(name)
    }

    pub fn contains_schema(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn contains_enum(&self, name: &str) -> bool {
        self.enums.contains_key(name)
    }

    fn check_name_free(&self, name: &str) -> Result<(), CodecError> {
        if name.is_empty() {
            return Err(CodecError::InvalidDefinition("empty type name".into()));
        }
        if self.contains(name) {
            return Err(CodecError::SchemaDuplicate(name.to_string()));
        }
        Ok(())
    }

    fn resolve_type_ref(&self, schema: &str, field: &FieldDef) -> Result<(), CodecError> {
        match field.base {
            BaseType::Message => {
                let target = field.type_ref.as_deref().ok_or_else(|| {
                    CodecError::InvalidDefinition(format!(
                        "message field '{}' of '{schema}' names no schema",
                        field.name
                    ))
                })?;
                // Self-reference is legal; the cycle terminates because nested
                // messages are length-prefixed and decoded against sub-slices.
                if target != schema && !self.contains_schema(target) {
                    return Err(CodecError::SchemaUndefined(target.to_string()));
                }
            }
            BaseType::Enum => {
                let target = field.type_ref.as_deref().ok_or_else(|| {
                    CodecError::InvalidDefinition(format!(
                        "enum field '{}' of '{schema}' names no enum",
                        field.name
                    ))
                })?;
                if !self.contains_enum(target) {
                    return Err(CodecError::SchemaUndefined(target.to_string()));
                }
            }
            _ => {
                if field.type_ref.is_some() {
                    return Err(CodecError::InvalidDefinition(format!(
                        "scalar field '{}' of '{schema}' must not reference a type",
                        field.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn resolve_default(&self, schema: &str, field: &mut FieldDef) -> Result<(), CodecError> {
        let Some(default) = field.default.clone() else {
            return Ok(());
        };
        if field.label == Label::Repeated {
            return Err(CodecError::InvalidDefinition(format!(
                "repeated field '{}' of '{schema}' cannot declare a default",
                field.name
            )));
        }

        let ok = match field.base {
            BaseType::Int32
            | BaseType::Int64
            | BaseType::Sint32
            | BaseType::Sint64
            | BaseType::Sfixed32
            | BaseType::Sfixed64 => matches!(default, Value::Int(_)),
            BaseType::Uint32 | BaseType::Uint64 | BaseType::Fixed32 | BaseType::Fixed64 => {
                matches!(default, Value::UInt(_))
            }
            BaseType::Float | BaseType::Double => matches!(default, Value::Float(_)),
            BaseType::Bool => matches!(default, Value::Bool(_)),
            BaseType::String => matches!(default, Value::Str(_)),
            BaseType::Bytes => matches!(default, Value::Bytes(_)),
            BaseType::Message => false,
            BaseType::Enum => {
                // Resolve the variant name now; decode applies the number.
                let Value::Str(ref variant) = default else {
                    return Err(CodecError::InvalidDefinition(format!(
                        "enum default of '{}' in '{schema}' must be a variant name",
                        field.name
                    )));
                };
                let target = field.type_ref.as_deref().expect("checked by type_ref pass");
                let number = self
                    .enum_def(target)?
                    .number(variant)
                    .ok_or_else(|| {
                        CodecError::InvalidDefinition(format!(
                            "enum '{target}' has no variant '{variant}'"
                        ))
                    })?;
                field.default = Some(Value::Int(number.into()));
                return Ok(());
            }
        };

        if !ok {
            return Err(CodecError::InvalidDefinition(format!(
                "default for field '{}' of '{schema}' has type {}",
                field.name,
                default.type_name()
            )));
        }
        Ok(())
    }
}

/// Process-wide registry, built during init. Writers are expected to be
/// serialized by startup code; readers take the lock shared.
pub fn global() -> &'static RwLock<Registry> {
    static GLOBAL: OnceLock<RwLock<Registry>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(Registry::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color(reg: &mut Registry) {
        reg.define_enum("Color", &[("RED", 0), ("GREEN", 1), ("BLUE", 2)])
            .unwrap();
    }

    #[test]
    fn enum_duplicate_name_and_number_rejected() {
        let mut reg = Registry::new();
        assert!(matches!(
            reg.define_enum("E", &[("A", 0), ("A", 1)]),
            Err(CodecError::InvalidDefinition(_))
        ));
        assert!(matches!(
            reg.define_enum("E", &[("A", 0), ("B", 0)]),
            Err(CodecError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn namespace_is_shared_between_schemas_and_enums() {
        let mut reg = Registry::new();
        color(&mut reg);
        assert_eq!(
            reg.define_schema("Color", vec![FieldDef::optional("x", 1, BaseType::Int32)]),
            Err(CodecError::SchemaDuplicate("Color".into()))
        );
    }

    #[test]
    fn duplicate_tag_rejected() {
        let mut reg = Registry::new();
        let err = reg
            .define_schema(
                "P",
                vec![
                    FieldDef::optional("a", 1, BaseType::Int32),
                    FieldDef::optional("b", 1, BaseType::Int32),
                ],
            )
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::TagDuplicate {
                schema: "P".into(),
                tag: 1
            }
        );
    }

    #[test]
    fn tag_zero_rejected() {
        let mut reg = Registry::new();
        assert!(matches!(
            reg.define_schema("P", vec![FieldDef::optional("a", 0, BaseType::Int32)]),
            Err(CodecError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn unresolved_reference_rejected() {
        let mut reg = Registry::new();
        assert_eq!(
            reg.define_schema(
                "P",
                vec![FieldDef::optional("m", 1, BaseType::Message).with_type_ref("Missing")]
            ),
            Err(CodecError::SchemaUndefined("Missing".into()))
        );
    }

    #[test]
    fn self_reference_is_allowed() {
        let mut reg = Registry::new();
        reg.define_schema(
            "Node",
            vec![
                FieldDef::optional("value", 1, BaseType::Int64),
                FieldDef::repeated("children", 2, BaseType::Message).with_type_ref("Node"),
            ],
        )
        .unwrap();
        assert!(reg.contains_schema("Node"));
    }

    #[test]
    fn enum_default_resolved_by_name() {
        let mut reg = Registry::new();
        color(&mut reg);
        reg.define_schema(
            "P",
            vec![FieldDef::optional("c", 1, BaseType::Enum)
                .with_type_ref("Color")
                .with_default(Value::Str("GREEN".into()))],
        )
        .unwrap();
        let schema = reg.schema("P").unwrap();
        assert_eq!(
            schema.field_by_name("c").unwrap().default,
            Some(Value::Int(1))
        );
    }

    #[test]
    fn mistyped_default_rejected() {
        let mut reg = Registry::new();
        assert!(matches!(
            reg.define_schema(
                "P",
                vec![FieldDef::optional("x", 1, BaseType::Int32).with_default(Value::Str("7".into()))]
            ),
            Err(CodecError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn failed_definition_leaves_registry_untouched() {
        let mut reg = Registry::new();
        color(&mut reg);
        let _ = reg.define_schema(
            "P",
            vec![
                FieldDef::optional("a", 1, BaseType::Int32),
                FieldDef::optional("b", 1, BaseType::Int32),
            ],
        );
        assert!(!reg.contains("P"));
        assert!(reg.contains_enum("Color"));
    }
}
