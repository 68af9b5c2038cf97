//! Identifier validation and quoting.
//!
//! Table, schema and column names cannot be bound as statement parameters,
//! so every name that reaches generated SQL passes through [`Ident`]: it is
//! validated once when constructed and always rendered double-quoted, with
//! embedded double quotes doubled. Raw strings are never spliced into SQL.
//!
//! Type names used in casts (`::numeric(10,2)`) come from the catalog but are
//! still checked against an allow-list by [`validate_type_name`].

use crate::error::{Result, RowMergeError};
use serde::{Serialize, Serializer};
use std::fmt;

/// PostgreSQL truncates identifiers longer than NAMEDATALEN - 1 bytes.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier.
///
/// Rejects empty names, names containing a NUL byte and names longer than
/// PostgreSQL keeps.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RowMergeError::Validation(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(RowMergeError::Validation(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(RowMergeError::Validation(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Shorten `name` to the bytes PostgreSQL keeps, cutting on a char boundary.
///
/// The server truncates over-long identifiers instead of rejecting them, so
/// derived names (prefix plus an existing table name) must be cut the same
/// way to refer to the relation the server actually creates.
pub fn truncate_identifier(name: &str) -> &str {
    if name.len() <= MAX_IDENTIFIER_LENGTH {
        return name;
    }
    let mut end = MAX_IDENTIFIER_LENGTH;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Quote a PostgreSQL identifier after validating it.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(quote_unchecked(name))
}

fn quote_unchecked(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validate a SQL type name before it is used in a cast.
///
/// Accepts what `format_type()` produces for ordinary columns: words made of
/// letters, digits, underscores and spaces, an optional parenthesised modifier
/// list (`numeric(10,2)`, `geometry(Point,4326)`) and optional `[]` suffixes.
pub fn validate_type_name(type_name: &str) -> Result<()> {
    let invalid = || {
        RowMergeError::Validation(format!("SECURITY: Invalid SQL type name: {:?}", type_name))
    };

    let trimmed = type_name.trim();
    if trimmed.is_empty() || trimmed.len() > 128 {
        return Err(invalid());
    }

    let mut rest = trimmed;
    while let Some(stripped) = rest.strip_suffix("[]") {
        rest = stripped.trim_end();
    }

    let (base, modifier) = match rest.find('(') {
        Some(open) => {
            let inner = rest[open + 1..].strip_suffix(')').ok_or_else(invalid)?;
            (&rest[..open], Some(inner))
        }
        None => (rest, None),
    };

    let base = base.trim_end();
    if base.is_empty()
        || !base.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        || !base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ' || c == '.')
    {
        return Err(invalid());
    }

    if let Some(inner) = modifier {
        if inner.is_empty()
            || !inner
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ',' || c == ' ')
        {
            return Err(invalid());
        }
    }

    Ok(())
}

/// A validated identifier, rendered quoted by `Display`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self(name))
    }

    /// The unquoted name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The double-quoted form.
    pub fn quoted(&self) -> String {
        quote_unchecked(&self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.quoted())
    }
}

impl Serialize for Ident {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Validate a list of column names into identifiers.
pub fn idents<I, S>(names: I) -> Result<Vec<Ident>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names.into_iter().map(|n| Ident::new(n.as_ref())).collect()
}

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Ident,
    pub name: Ident,
}

impl TableName {
    pub fn new(schema: &str, name: &str) -> Result<Self> {
        Ok(Self {
            schema: Ident::new(schema)?,
            name: Ident::new(name)?,
        })
    }

    /// Parse `table` or `schema.table`, using `default_schema` for the former.
    ///
    /// Names containing a dot must be given already split via [`TableName::new`].
    pub fn parse(raw: &str, default_schema: &str) -> Result<Self> {
        match raw.split_once('.') {
            Some((schema, name)) if !name.contains('.') => Self::new(schema, name),
            Some(_) => Err(RowMergeError::Validation(format!(
                "Table name {:?} has too many components",
                raw
            ))),
            None => Self::new(default_schema, raw),
        }
    }

    /// The same schema with a different table name.
    pub fn sibling(&self, name: &str) -> Result<Self> {
        Ok(Self {
            schema: self.schema.clone(),
            name: Ident::new(name)?,
        })
    }

    /// Quoted `"schema"."table"` form for SQL.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Unquoted `schema.table` form for logs and messages.
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.schema.as_str(), self.name.as_str())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema.as_str(), self.name.as_str())
    }
}

impl Serialize for TableName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.display_name())
    }
}
