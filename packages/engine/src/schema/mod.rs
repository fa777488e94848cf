mod definition;
mod validate;

pub use definition::{
    parse_stored_schema_snapshot, validate_schema_definition, ForeignKeyDefinition, StoredSchema,
};
pub use validate::{apply_default_values, primary_key_entity_id, SchemaCache};

/// Identity of one stored schema revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaKey {
    pub schema_key: String,
    pub schema_version: String,
}

impl SchemaKey {
    pub fn new(schema_key: impl Into<String>, schema_version: impl Into<String>) -> Self {
        Self {
            schema_key: schema_key.into(),
            schema_version: schema_version.into(),
        }
    }
}
