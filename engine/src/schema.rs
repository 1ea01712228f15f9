//! Schema definition and validation.
//!
//! Payloads are opaque to the sync machinery, but they cross a typed
//! boundary: every payload entering the operation log, and every record
//! arriving from a pull, is checked against the [`TableSchema`] of its table.

use crate::{error::Result, Error, Fields, SchemaVersion, TableName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since epoch
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for a single table.
///
/// Undeclared fields are allowed and carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: TableName,
    pub fields: Vec<FieldDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<TableName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Validate a field map against this schema.
    pub fn validate_fields(&self, fields: &Fields) -> Result<()> {
        for field in &self.fields {
            field.validate(fields.get(&field.name))?;
        }
        Ok(())
    }

    /// Validate an arbitrary JSON value; it must be an object.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;
        self.validate_fields(obj)
    }
}

/// Schema for every table the engine syncs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version, sent with every pull
    pub version: SchemaVersion,
    pub tables: HashMap<TableName, TableSchema>,
}

impl Schema {
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            tables: HashMap::new(),
        }
    }

    /// Add a table to the schema.
    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    pub fn get_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Validate the fields of a record destined for `table`.
    pub fn validate(&self, table: &str, fields: &Fields) -> Result<()> {
        self.tables
            .get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?
            .validate_fields(fields)
    }

    /// The field notebook tables: plots, field activities and users.
    pub fn field_notebook() -> Self {
        use FieldType::*;

        let parcelas = TableSchema::new(
            "parcelas",
            vec![
                FieldDef::required("nombre", String),
                FieldDef::optional("descripcion", String),
                FieldDef::required("superficie", Float),
                FieldDef::optional("ubicacion", String),
                FieldDef::optional("geometria", Json),
                FieldDef::optional("latitud", Float),
                FieldDef::optional("longitud", Float),
                FieldDef::optional("cultivo", Json),
                FieldDef::optional("metadatos", Json),
                FieldDef::optional("user_id", String),
            ],
        );

        let actividades = TableSchema::new(
            "actividades",
            vec![
                FieldDef::required("parcela_id", String),
                FieldDef::required("nombre", String),
                FieldDef::required("tipo", String),
                FieldDef::optional("subtipo", String),
                FieldDef::optional("descripcion", String),
                FieldDef::required("fecha_inicio", Timestamp),
                FieldDef::optional("fecha_fin", Timestamp),
                FieldDef::optional("duracion_minutos", Int),
                FieldDef::optional("estado", String),
                FieldDef::optional("prioridad", String),
                FieldDef::optional("progreso", Int),
                FieldDef::optional("ubicacion", Json),
                FieldDef::optional("productos", Json),
                FieldDef::optional("maquinaria", Json),
                FieldDef::optional("costos", Json),
                FieldDef::optional("condiciones_meteorologicas", Json),
                FieldDef::optional("fotos", Json),
                FieldDef::optional("notas", String),
                FieldDef::optional("user_id", String),
            ],
        );

        let usuarios = TableSchema::new(
            "usuarios",
            vec![
                FieldDef::required("email", String),
                FieldDef::required("nombre", String),
                FieldDef::optional("apellidos", String),
                FieldDef::optional("telefono", String),
                FieldDef::optional("rol", String),
                FieldDef::optional("activo", Bool),
                FieldDef::optional("preferencias", Json),
            ],
        );

        Schema::new(1)
            .with_table(parcelas)
            .with_table(actividades)
            .with_table(usuarios)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn validate_valid_payload() {
        let schema = Schema::field_notebook();
        let parcelas = schema.get_table("parcelas").unwrap();

        let payload = json!({"nombre": "Finca Norte", "superficie": 12.5});
        assert!(parcelas.validate_payload(&payload).is_ok());

        let with_optional = json!({
            "nombre": "Finca Sur",
            "superficie": 3,
            "latitud": 40.4168,
            "cultivo": {"especie": "olivo"}
        });
        assert!(parcelas.validate_payload(&with_optional).is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = Schema::field_notebook();
        let result = schema.validate("parcelas", &fields(json!({"nombre": "Finca"})));

        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "superficie"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = Schema::field_notebook();
        let result = schema.validate(
            "actividades",
            &fields(json!({
                "parcela_id": "p1",
                "nombre": "Poda",
                "tipo": "poda",
                "fecha_inicio": "yesterday"
            })),
        );

        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "fecha_inicio"));
    }

    #[test]
    fn validate_null_required_field() {
        let schema = Schema::field_notebook();
        let result = schema.validate(
            "parcelas",
            &fields(json!({"nombre": null, "superficie": 1.0})),
        );

        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "nombre"));
    }

    #[test]
    fn validate_table_not_found() {
        let schema = Schema::field_notebook();
        let result = schema.validate("cosechas", &Fields::new());
        assert!(matches!(result, Err(Error::TableNotFound(t)) if t == "cosechas"));
    }

    #[test]
    fn non_object_payload_rejected() {
        let table = TableSchema::new("notes", vec![]);
        assert!(matches!(
            table.validate_payload(&json!([1, 2])),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn undeclared_fields_pass_through() {
        let table = TableSchema::new("notes", vec![FieldDef::required("text", FieldType::String)]);
        assert!(table
            .validate_payload(&json!({"text": "hola", "extra": [1, 2, 3]}))
            .is_ok());
    }

    #[test]
    fn schema_serialization() {
        let schema = Schema::field_notebook();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }

    #[test]
    fn json_field_accepts_any() {
        let table = TableSchema::new("events", vec![FieldDef::required("data", FieldType::Json)]);

        assert!(table.validate_payload(&json!({"data": "string"})).is_ok());
        assert!(table.validate_payload(&json!({"data": 123})).is_ok());
        assert!(table.validate_payload(&json!({"data": [1, 2, 3]})).is_ok());
        assert!(table
            .validate_payload(&json!({"data": {"nested": "object"}}))
            .is_ok());
    }
}
