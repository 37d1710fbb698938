//! Schema objects shared by the catalog reader and the model compiler.
//!
//! Both sides produce the same [`SchemaObject`] shape so the delta engine can
//! compare them field by field. Column types are parsed into [`ColumnType`],
//! which accepts the usual aliases (`int`, `int4`, `varchar(255)`) as well as
//! the spelling `format_type()` returns, and always displays in the latter.

use std::fmt;

use indexmap::IndexMap;
use schemashift_sql::{content_hash, normalize_sql};
use serde::Serialize;

/// Kind of a schema object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    View,
    Procedure,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Table => "table",
            ObjectKind::View => "view",
            ObjectKind::Procedure => "procedure",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Postgres column types, in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ColumnType {
    /// SMALLINT (2 bytes)
    SmallInt,
    /// INTEGER (4 bytes)
    Integer,
    /// BIGINT (8 bytes)
    BigInt,
    /// REAL (4 bytes floating point)
    Real,
    /// DOUBLE PRECISION (8 bytes floating point)
    DoublePrecision,
    /// NUMERIC with optional (precision, scale)
    Numeric(Option<(u32, u32)>),
    /// BOOLEAN
    Boolean,
    /// TEXT
    Text,
    /// CHARACTER VARYING with optional length
    Varchar(Option<u32>),
    /// CHARACTER with optional length
    Char(Option<u32>),
    /// BYTEA (binary)
    Bytea,
    /// DATE
    Date,
    /// TIME, optionally WITH TIME ZONE, with optional fractional precision
    Time { tz: bool, precision: Option<u32> },
    /// TIMESTAMP, optionally WITH TIME ZONE, with optional fractional precision
    Timestamp { tz: bool, precision: Option<u32> },
    /// UUID
    Uuid,
    /// JSON
    Json,
    /// JSONB
    Jsonb,
    /// One-dimensional array of another type
    Array(Box<ColumnType>),
    /// Anything else, kept as lowercased text
    Other(String),
}

impl ColumnType {
    /// Parse a type name as written in a model or returned by `format_type()`.
    pub fn parse(input: &str) -> ColumnType {
        let text = input.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();

        if let Some(inner) = text.strip_suffix("[]") {
            return ColumnType::Array(Box::new(ColumnType::parse(inner)));
        }

        let (base, modifiers) = split_modifiers(&text);
        let first = modifiers.first().copied();

        match base.as_str() {
            "smallint" | "int2" => ColumnType::SmallInt,
            "integer" | "int" | "int4" => ColumnType::Integer,
            "bigint" | "int8" => ColumnType::BigInt,
            "real" | "float4" => ColumnType::Real,
            "double precision" | "float8" | "float" => ColumnType::DoublePrecision,
            "numeric" | "decimal" => match modifiers.as_slice() {
                [] => ColumnType::Numeric(None),
                [precision] => ColumnType::Numeric(Some((*precision, 0))),
                [precision, scale, ..] => ColumnType::Numeric(Some((*precision, *scale))),
            },
            "boolean" | "bool" => ColumnType::Boolean,
            "text" => ColumnType::Text,
            "character varying" | "varchar" => ColumnType::Varchar(first),
            // A bare `character` means character(1); `bpchar` is the unbounded form.
            "character" | "char" => ColumnType::Char(Some(first.unwrap_or(1))),
            "bpchar" => ColumnType::Char(first),
            "bytea" => ColumnType::Bytea,
            "date" => ColumnType::Date,
            "time" | "time without time zone" => ColumnType::Time {
                tz: false,
                precision: first,
            },
            "timetz" | "time with time zone" => ColumnType::Time {
                tz: true,
                precision: first,
            },
            "timestamp" | "timestamp without time zone" => ColumnType::Timestamp {
                tz: false,
                precision: first,
            },
            "timestamptz" | "timestamp with time zone" => ColumnType::Timestamp {
                tz: true,
                precision: first,
            },
            "uuid" => ColumnType::Uuid,
            "json" => ColumnType::Json,
            "jsonb" => ColumnType::Jsonb,
            _ => ColumnType::Other(text),
        }
    }

    /// The type as `format_type(oid, NULL)` reports it. Procedure arguments
    /// carry no typmod in the catalog.
    pub fn without_modifiers(&self) -> ColumnType {
        match self {
            ColumnType::Numeric(_) => ColumnType::Numeric(None),
            ColumnType::Varchar(_) => ColumnType::Varchar(None),
            // Reported as a bare `character`.
            ColumnType::Char(_) => ColumnType::Char(Some(1)),
            ColumnType::Time { tz, .. } => ColumnType::Time {
                tz: *tz,
                precision: None,
            },
            ColumnType::Timestamp { tz, .. } => ColumnType::Timestamp {
                tz: *tz,
                precision: None,
            },
            ColumnType::Array(inner) => ColumnType::Array(Box::new(inner.without_modifiers())),
            other => other.clone(),
        }
    }

    /// Pseudo-types that only make sense in `CREATE TABLE` shorthand and never
    /// come back from the catalog.
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self,
            ColumnType::Other(name)
                if matches!(name.as_str(), "serial" | "bigserial" | "smallserial" | "serial4" | "serial8" | "serial2")
        )
    }
}

/// Split `timestamp(3) with time zone` into (`timestamp with time zone`, [3]).
fn split_modifiers(text: &str) -> (String, Vec<u32>) {
    let (Some(open), Some(close)) = (text.find('('), text.find(')')) else {
        return (text.to_string(), Vec::new());
    };
    if close < open {
        return (text.to_string(), Vec::new());
    }
    let modifiers = text[open + 1..close]
        .split(',')
        .filter_map(|m| m.trim().parse().ok())
        .collect();
    let base = format!("{} {}", text[..open].trim(), text[close + 1..].trim());
    (base.trim().to_string(), modifiers)
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::SmallInt => write!(f, "smallint"),
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::BigInt => write!(f, "bigint"),
            ColumnType::Real => write!(f, "real"),
            ColumnType::DoublePrecision => write!(f, "double precision"),
            ColumnType::Numeric(None) => write!(f, "numeric"),
            ColumnType::Numeric(Some((p, s))) => write!(f, "numeric({},{})", p, s),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Varchar(None) => write!(f, "character varying"),
            ColumnType::Varchar(Some(n)) => write!(f, "character varying({})", n),
            ColumnType::Char(None) => write!(f, "bpchar"),
            ColumnType::Char(Some(n)) => write!(f, "character({})", n),
            ColumnType::Bytea => write!(f, "bytea"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Time { tz, precision } => {
                write!(f, "time")?;
                if let Some(p) = precision {
                    write!(f, "({})", p)?;
                }
                write!(f, "{}", if *tz { " with time zone" } else { " without time zone" })
            }
            ColumnType::Timestamp { tz, precision } => {
                write!(f, "timestamp")?;
                if let Some(p) = precision {
                    write!(f, "({})", p)?;
                }
                write!(f, "{}", if *tz { " with time zone" } else { " without time zone" })
            }
            ColumnType::Uuid => write!(f, "uuid"),
            ColumnType::Json => write!(f, "json"),
            ColumnType::Jsonb => write!(f, "jsonb"),
            ColumnType::Array(inner) => write!(f, "{}[]", inner),
            ColumnType::Other(name) => write!(f, "{}", name),
        }
    }
}

/// A column of a table or view, or an argument of a procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }
}

/// A table, view or procedure, as declared by a model or found in a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaObject {
    pub name: String,
    pub kind: ObjectKind,
    /// Table and view columns in declared (or `attnum`) order; procedure arguments.
    pub columns: Vec<Column>,
    /// View query or procedure body.
    pub definition: Option<String>,
    /// Procedure language.
    pub language: Option<String>,
    /// Objects this one references, sorted.
    pub depends_on: Vec<String>,
    /// Hash of [`SchemaObject::canonical_text`] for compiled objects; the hash
    /// recovered from the object comment for catalog objects.
    pub fingerprint: Option<String>,
}

impl SchemaObject {
    pub fn table(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Table,
            columns,
            definition: None,
            language: None,
            depends_on: Vec::new(),
            fingerprint: None,
        }
    }

    pub fn view(name: impl Into<String>, query: impl Into<String>, depends_on: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::View,
            columns: Vec::new(),
            definition: Some(query.into()),
            language: None,
            depends_on,
            fingerprint: None,
        }
    }

    pub fn procedure(
        name: impl Into<String>,
        arguments: Vec<Column>,
        language: impl Into<String>,
        body: impl Into<String>,
        depends_on: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Procedure,
            columns: arguments,
            definition: Some(body.into()),
            language: Some(language.into()),
            depends_on,
            fingerprint: None,
        }
    }

    /// Attach the fingerprint of the canonical text.
    pub fn fingerprinted(mut self) -> Self {
        self.fingerprint = Some(content_hash(&[self.canonical_text()]));
        self
    }

    /// Find a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Argument types, comma separated, as used to identify a procedure.
    pub fn signature(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.column_type.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Definition text with whitespace normalized.
    pub fn normalized_definition(&self) -> String {
        self.definition.as_deref().map(normalize_sql).unwrap_or_default()
    }

    /// A stable textual rendering of everything that defines this object.
    ///
    /// Used for fingerprints and change unit ids, so any change to the shape
    /// of the object changes the text.
    pub fn canonical_text(&self) -> String {
        let columns = |with_nullability: bool| {
            self.columns
                .iter()
                .map(|c| {
                    let mut s = format!("{} {}", c.name, c.column_type);
                    if with_nullability && !c.nullable {
                        s.push_str(" NOT NULL");
                    }
                    s
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self.kind {
            ObjectKind::Table => format!("TABLE {} ({})", self.name, columns(true)),
            ObjectKind::View => format!(
                "VIEW {} ({}) AS {}",
                self.name,
                columns(false),
                self.normalized_definition()
            ),
            ObjectKind::Procedure => format!(
                "PROCEDURE {}({}) LANGUAGE {} AS {}",
                self.name,
                columns(false),
                self.language.as_deref().unwrap_or_default(),
                self.normalized_definition()
            ),
        }
    }
}

/// A set of schema objects keyed by name, in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schema {
    objects: IndexMap<String, SchemaObject>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from objects. Later objects replace earlier ones with
    /// the same name.
    pub fn from_objects(objects: impl IntoIterator<Item = SchemaObject>) -> Self {
        let mut schema = Self::new();
        for object in objects {
            schema.insert(object);
        }
        schema
    }

    /// Insert an object, keeping name order. Returns the replaced object, if any.
    pub fn insert(&mut self, object: SchemaObject) -> Option<SchemaObject> {
        let previous = self.objects.insert(object.name.clone(), object);
        self.objects.sort_keys();
        previous
    }

    pub fn get(&self, name: &str) -> Option<&SchemaObject> {
        self.objects.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaObject> {
        self.objects.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl<'a> IntoIterator for &'a Schema {
    type Item = &'a SchemaObject;
    type IntoIter = indexmap::map::Values<'a, String, SchemaObject>;

    fn into_iter(self) -> Self::IntoIter {
        self.objects.values()
    }
}
