//! Logical model compiler.
//!
//! A model is TOML text with `[[table]]`, `[[view]]` and `[[procedure]]`
//! entries. Compiling it validates names and references and yields a
//! [`Schema`] whose objects carry fingerprints of their canonical text.
//!
//! ```toml
//! [[table]]
//! name = "orders"
//! columns = [
//!   { name = "id", type = "int", nullable = false },
//!   { name = "total", type = "numeric" },
//! ]
//!
//! [[view]]
//! name = "large_orders"
//! references = ["orders"]
//! query = "SELECT id, total FROM orders WHERE total > 100"
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Deserialize;

use crate::error::{Error, ModelError};
use crate::schema::{Column, ColumnType, ObjectKind, Schema, SchemaObject};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelFile {
    #[serde(default, rename = "table")]
    tables: Vec<TableDecl>,
    #[serde(default, rename = "view")]
    views: Vec<ViewDecl>,
    #[serde(default, rename = "procedure")]
    procedures: Vec<ProcedureDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ColumnDecl {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    #[serde(default = "default_nullable")]
    nullable: bool,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableDecl {
    name: String,
    #[serde(default)]
    columns: Vec<ColumnDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ViewDecl {
    name: String,
    #[serde(default)]
    references: Vec<String>,
    #[serde(default)]
    columns: Vec<ArgumentDecl>,
    query: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArgumentDecl {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcedureDecl {
    name: String,
    #[serde(default)]
    references: Vec<String>,
    #[serde(default)]
    arguments: Vec<ArgumentDecl>,
    #[serde(default = "default_language")]
    language: String,
    body: String,
}

fn default_language() -> String {
    "plpgsql".to_string()
}

/// Compile model text into the target schema.
///
/// Deterministic: the same text always yields the same objects in the same
/// order with the same fingerprints.
pub fn compile(model: &str) -> Result<Schema, Error> {
    let file: ModelFile = toml::from_str(model).map_err(|e| ModelError::Parse(e.to_string()))?;

    let mut objects = Vec::new();
    for table in file.tables {
        objects.push(compile_table(table)?);
    }
    for view in file.views {
        objects.push(compile_view(view)?);
    }
    for procedure in file.procedures {
        objects.push(compile_procedure(procedure)?);
    }

    let mut seen = HashSet::new();
    for object in &objects {
        if !seen.insert(object.name.as_str()) {
            return Err(ModelError::DuplicateObject(object.name.clone()).into());
        }
    }

    check_references(&objects)?;
    check_acyclic(&objects)?;

    Ok(Schema::from_objects(
        objects.into_iter().map(SchemaObject::fingerprinted),
    ))
}

fn check_name(kind: &'static str, name: &str) -> Result<(), ModelError> {
    if name.trim().is_empty() {
        return Err(ModelError::EmptyName { kind });
    }
    Ok(())
}

fn parse_type(object: &str, column: &str, ty: &str) -> Result<ColumnType, ModelError> {
    let parsed = ColumnType::parse(ty);
    if ty.trim().is_empty() || parsed.is_pseudo() {
        return Err(ModelError::UnsupportedType {
            object: object.to_string(),
            column: column.to_string(),
            ty: ty.to_string(),
        });
    }
    Ok(parsed)
}

fn check_unique_fields<'a>(
    object: &str,
    fields: impl IntoIterator<Item = &'a str>,
) -> Result<(), ModelError> {
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field) {
            return Err(ModelError::DuplicateField {
                object: object.to_string(),
                field: field.to_string(),
            });
        }
    }
    Ok(())
}

fn compile_table(decl: TableDecl) -> Result<SchemaObject, ModelError> {
    check_name("table", &decl.name)?;
    check_unique_fields(&decl.name, decl.columns.iter().map(|c| c.name.as_str()))?;
    let mut columns = Vec::with_capacity(decl.columns.len());
    for column in decl.columns {
        check_name("column", &column.name)?;
        let column_type = parse_type(&decl.name, &column.name, &column.column_type)?;
        columns.push(Column::new(column.name, column_type, column.nullable));
    }
    Ok(SchemaObject::table(decl.name, columns))
}

fn compile_view(decl: ViewDecl) -> Result<SchemaObject, ModelError> {
    check_name("view", &decl.name)?;
    if decl.query.trim().is_empty() {
        return Err(ModelError::InvalidDefinition {
            object: decl.name,
            reason: "view query is empty".to_string(),
        });
    }
    check_unique_fields(&decl.name, decl.columns.iter().map(|c| c.name.as_str()))?;
    let mut columns = Vec::with_capacity(decl.columns.len());
    for column in decl.columns {
        check_name("column", &column.name)?;
        let column_type = parse_type(&decl.name, &column.name, &column.column_type)?;
        // View columns are always nullable in the catalog.
        columns.push(Column::new(column.name, column_type, true));
    }
    let query = crate::ddl::trim_statement(&decl.query).to_string();
    let mut view = SchemaObject::view(decl.name, query, sorted_references(decl.references));
    view.columns = columns;
    Ok(view)
}

fn compile_procedure(decl: ProcedureDecl) -> Result<SchemaObject, ModelError> {
    check_name("procedure", &decl.name)?;
    if decl.language.trim().is_empty() {
        return Err(ModelError::InvalidDefinition {
            object: decl.name,
            reason: "procedure language is empty".to_string(),
        });
    }
    check_unique_fields(
        &decl.name,
        decl.arguments
            .iter()
            .map(|a| a.name.as_str())
            .filter(|name| !name.is_empty()),
    )?;
    let mut arguments = Vec::with_capacity(decl.arguments.len());
    for argument in decl.arguments {
        let column_type = parse_type(&decl.name, &argument.name, &argument.column_type)?;
        arguments.push(Column::new(argument.name, column_type.without_modifiers(), true));
    }
    Ok(SchemaObject::procedure(
        decl.name,
        arguments,
        decl.language.trim().to_lowercase(),
        decl.body.trim().to_string(),
        sorted_references(decl.references),
    ))
}

fn sorted_references(references: Vec<String>) -> Vec<String> {
    references
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Every reference must name a declared table or view other than the object itself.
fn check_references(objects: &[SchemaObject]) -> Result<(), ModelError> {
    let kinds: BTreeMap<&str, ObjectKind> = objects
        .iter()
        .map(|o| (o.name.as_str(), o.kind))
        .collect();

    for object in objects {
        for reference in &object.depends_on {
            if *reference == object.name {
                return Err(ModelError::SelfReference(object.name.clone()));
            }
            match kinds.get(reference.as_str()) {
                None => {
                    return Err(ModelError::UnresolvedReference {
                        object: object.name.clone(),
                        reference: reference.clone(),
                    });
                }
                Some(ObjectKind::Procedure) => {
                    return Err(ModelError::ReferencesProcedure {
                        object: object.name.clone(),
                        reference: reference.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Reject reference cycles, reporting the objects on the first cycle found
/// in name order.
fn check_acyclic(objects: &[SchemaObject]) -> Result<(), Error> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let by_name: BTreeMap<&str, &SchemaObject> =
        objects.iter().map(|o| (o.name.as_str(), o)).collect();
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

    fn visit<'a>(
        name: &'a str,
        by_name: &BTreeMap<&'a str, &'a SchemaObject>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                return Err(stack[start..].iter().map(|n| n.to_string()).collect());
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        stack.push(name);
        if let Some(&object) = by_name.get(name) {
            for dependency in &object.depends_on {
                visit(dependency.as_str(), by_name, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    for name in by_name.keys() {
        let mut stack = Vec::new();
        if let Err(objects) = visit(*name, &by_name, &mut marks, &mut stack) {
            return Err(Error::DependencyCycle { objects });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: &str = r#"
[[table]]
name = "orders"
columns = [
  { name = "id", type = "int", nullable = false },
  { name = "total", type = "numeric" },
]

[[view]]
name = "large_orders"
references = ["orders"]
query = "SELECT id, total FROM orders WHERE total > 100;"

[[procedure]]
name = "purge_orders"
references = ["orders"]
arguments = [{ name = "min_total", type = "numeric" }]
language = "sql"
body = "DELETE FROM orders WHERE total < min_total"
"#;

    fn model_error(model: &str) -> ModelError {
        match compile(model) {
            Err(Error::Model(e)) => e,
            other => panic!("expected a model error, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_orders() {
        let schema = compile(ORDERS).unwrap();
        assert_eq!(
            schema.names().collect::<Vec<_>>(),
            ["large_orders", "orders", "purge_orders"]
        );

        let orders = schema.get("orders").unwrap();
        assert_eq!(orders.kind, ObjectKind::Table);
        assert_eq!(
            orders.columns,
            vec![
                Column::new("id", ColumnType::Integer, false),
                Column::new("total", ColumnType::Numeric(None), true),
            ]
        );

        let view = schema.get("large_orders").unwrap();
        assert_eq!(view.depends_on, ["orders"]);
        assert_eq!(
            view.definition.as_deref(),
            Some("SELECT id, total FROM orders WHERE total > 100")
        );

        let procedure = schema.get("purge_orders").unwrap();
        assert_eq!(procedure.language.as_deref(), Some("sql"));
        assert_eq!(procedure.signature(), "numeric");
        assert!(schema.iter().all(|o| o.fingerprint.is_some()));
    }

    #[test]
    fn test_procedure_arguments_drop_typmods() {
        let schema = compile(
            r#"
[[procedure]]
name = "bump"
arguments = [
  { name = "amount", type = "numeric(10,2)" },
  { name = "labels", type = "varchar(20)[]" },
]
language = "plpgsql"
body = "BEGIN END"
"#,
        )
        .unwrap();
        // Same spelling as format_type(oid, NULL) in the catalog.
        assert_eq!(
            schema.get("bump").unwrap().signature(),
            "numeric, character varying[]"
        );
    }

    #[test]
    fn test_compile_is_deterministic() {
        assert_eq!(compile(ORDERS).unwrap(), compile(ORDERS).unwrap());
    }

    #[test]
    fn test_default_language_is_plpgsql() {
        let schema = compile(
            r#"
[[procedure]]
name = "noop"
body = "BEGIN NULL; END"
"#,
        )
        .unwrap();
        assert_eq!(schema.get("noop").unwrap().language.as_deref(), Some("plpgsql"));
    }

    #[test]
    fn test_unresolved_reference() {
        let err = model_error(
            r#"
[[view]]
name = "v"
references = ["missing"]
query = "SELECT 1"
"#,
        );
        assert_eq!(
            err,
            ModelError::UnresolvedReference {
                object: "v".into(),
                reference: "missing".into()
            }
        );
    }

    #[test]
    fn test_duplicate_object_across_kinds() {
        let err = model_error(
            r#"
[[table]]
name = "x"

[[view]]
name = "x"
query = "SELECT 1"
"#,
        );
        assert_eq!(err, ModelError::DuplicateObject("x".into()));
    }

    #[test]
    fn test_duplicate_column() {
        let err = model_error(
            r#"
[[table]]
name = "t"
columns = [{ name = "a", type = "int" }, { name = "a", type = "text" }]
"#,
        );
        assert_eq!(
            err,
            ModelError::DuplicateField {
                object: "t".into(),
                field: "a".into()
            }
        );
    }

    #[test]
    fn test_self_and_procedure_references() {
        let err = model_error(
            r#"
[[view]]
name = "v"
references = ["v"]
query = "SELECT 1"
"#,
        );
        assert_eq!(err, ModelError::SelfReference("v".into()));

        let err = model_error(
            r#"
[[procedure]]
name = "p"
body = "BEGIN END"

[[view]]
name = "v"
references = ["p"]
query = "SELECT 1"
"#,
        );
        assert!(matches!(err, ModelError::ReferencesProcedure { .. }));
    }

    #[test]
    fn test_serial_is_rejected() {
        let err = model_error(
            r#"
[[table]]
name = "t"
columns = [{ name = "id", type = "serial" }]
"#,
        );
        assert!(matches!(err, ModelError::UnsupportedType { .. }));
    }

    #[test]
    fn test_unknown_field_is_a_parse_error() {
        let err = model_error(
            r#"
[[table]]
name = "t"
primary_key = ["id"]
"#,
        );
        assert!(matches!(err, ModelError::Parse(_)));
    }

    #[test]
    fn test_view_cycle() {
        let result = compile(
            r#"
[[view]]
name = "a"
references = ["b"]
query = "SELECT * FROM b"

[[view]]
name = "b"
references = ["a"]
query = "SELECT * FROM a"
"#,
        );
        match result {
            Err(Error::DependencyCycle { objects }) => assert_eq!(objects, ["a", "b"]),
            other => panic!("expected a cycle, got {:?}", other),
        }
    }
}
