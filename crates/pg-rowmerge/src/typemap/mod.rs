//! Column type classification for PostgreSQL.

use serde::Serialize;
use tokio_postgres::types::Type;

use crate::core::traits::TypeMapper;

/// Logical column type.
///
/// Drives literal rendering, change detection and how the cursor reads the
/// column. Anything not listed is carried as `Unmapped` with its declared
/// type string and handled as opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Integer,
    BigInteger,
    Float,
    Numeric,
    Date,
    DateTime,
    Text,
    LargeBinary,
    Json,
    Jsonb,
    Geometry,
    Unmapped(String),
}

impl ColumnType {
    /// Columns the cursor reads as `::text` because there is no native
    /// decoding for them.
    pub fn read_as_text(&self) -> bool {
        matches!(self, ColumnType::Geometry | ColumnType::Unmapped(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Numeric | ColumnType::Float)
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::BigInteger)
    }
}

/// PostgreSQL type mapper.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgTypeMapper;

impl TypeMapper for PgTypeMapper {
    fn column_type(&self, type_name: &str) -> ColumnType {
        map_type_name(type_name)
    }

    fn column_type_for_native(&self, ty: &Type) -> ColumnType {
        // pg_type names (bool, int4, float8, bpchar, ...) are in the name table
        map_type_name(ty.name())
    }

    fn type_string(&self, column_type: &ColumnType) -> String {
        canonical_type_string(column_type)
    }
}

/// Canonical PostgreSQL type string for a column type.
pub fn canonical_type_string(column_type: &ColumnType) -> String {
    match column_type {
        ColumnType::Boolean => "boolean".to_string(),
        ColumnType::Integer => "integer".to_string(),
        ColumnType::BigInteger => "bigint".to_string(),
        ColumnType::Float => "double precision".to_string(),
        ColumnType::Numeric => "numeric".to_string(),
        ColumnType::Date => "date".to_string(),
        ColumnType::DateTime => "timestamp".to_string(),
        ColumnType::Text => "text".to_string(),
        ColumnType::LargeBinary => "bytea".to_string(),
        ColumnType::Json => "json".to_string(),
        ColumnType::Jsonb => "jsonb".to_string(),
        ColumnType::Geometry => "geometry".to_string(),
        ColumnType::Unmapped(raw) => raw.clone(),
    }
}

/// Map a logical or declared type name.
///
/// Modifiers are ignored (`numeric(10,2)` is Numeric); array types stay
/// unmapped.
pub fn map_type_name(type_name: &str) -> ColumnType {
    let raw = type_name.trim();
    if raw.ends_with("[]") {
        return ColumnType::Unmapped(raw.to_string());
    }

    let lowered = raw.to_lowercase();
    let base = strip_modifiers(&lowered);
    // format_type() schema-qualifies extension types outside the search path
    let base = base.rsplit('.').next().unwrap_or(&base).to_string();

    match base.as_str() {
        // Boolean
        "bool" | "boolean" => ColumnType::Boolean,

        // Integer types
        "smallint" | "int2" | "int" | "integer" | "int4" | "serial" | "smallserial" => {
            ColumnType::Integer
        }
        "bigint" | "int8" | "bigserial" => ColumnType::BigInteger,

        // Floating point
        "real" | "float4" | "float" | "float8" | "double precision" => ColumnType::Float,

        // Exact numerics
        "numeric" | "decimal" | "double" | "number" => ColumnType::Numeric,

        // Date/time
        "date" => ColumnType::Date,
        "datetime" | "timestamp" | "timestamp without time zone" => ColumnType::DateTime,

        // Strings
        "text" | "unicode" | "string" | "varchar" | "character varying" | "char"
        | "character" | "bpchar" | "name" | "citext" => ColumnType::Text,

        // Binary
        "bytea" | "binary" => ColumnType::LargeBinary,

        // JSON
        "json" => ColumnType::Json,
        "jsonb" => ColumnType::Jsonb,

        // Spatial
        "geometry" | "geography" => ColumnType::Geometry,

        _ => ColumnType::Unmapped(raw.to_string()),
    }
}

/// Remove every parenthesised modifier and collapse whitespace:
/// `timestamp(3) without time zone` becomes `timestamp without time zone`.
fn strip_modifiers(type_name: &str) -> String {
    let mut out = String::with_capacity(type_name.len());
    let mut depth = 0usize;
    for c in type_name.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
