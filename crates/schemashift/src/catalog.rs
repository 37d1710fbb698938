//! Catalog reader - introspects one namespace of a live database.
//!
//! All queries run in a single `REPEATABLE READ READ ONLY` transaction so
//! the snapshot is consistent. Rows are collected into a [`RawCatalog`] and
//! turned into a [`Schema`] by [`assemble`], which needs no server.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use schemashift_sql::parse_fingerprint_comment;

use crate::error::Error;
use crate::schema::{Column, ColumnType, ObjectKind, Schema, SchemaObject};
use crate::session::Session;

/// A relation row from `pg_class`.
#[derive(Debug, Clone)]
pub struct RawRelation {
    pub name: String,
    /// `r` (table), `p` (partitioned table) or `v` (view).
    pub relkind: String,
    pub comment: Option<String>,
}

/// A column row from `pg_attribute`.
#[derive(Debug, Clone)]
pub struct RawColumn {
    pub relation: String,
    pub name: String,
    /// `format_type()` output.
    pub type_name: String,
    pub not_null: bool,
    pub attnum: i16,
}

/// A view definition from `pg_views`.
#[derive(Debug, Clone)]
pub struct RawView {
    pub name: String,
    pub definition: String,
}

/// A view reading from another relation, from `pg_depend`.
#[derive(Debug, Clone)]
pub struct RawDependency {
    pub dependent: String,
    pub dependency: String,
}

/// A procedure row from `pg_proc`.
#[derive(Debug, Clone)]
pub struct RawProcedure {
    pub name: String,
    pub language: String,
    pub body: String,
    pub comment: Option<String>,
    pub argument_names: Vec<String>,
    /// `format_type()` output per input argument.
    pub argument_types: Vec<String>,
}

/// Everything read from the catalog, before assembly.
#[derive(Debug, Clone, Default)]
pub struct RawCatalog {
    pub relations: Vec<RawRelation>,
    pub columns: Vec<RawColumn>,
    pub views: Vec<RawView>,
    pub dependencies: Vec<RawDependency>,
    pub procedures: Vec<RawProcedure>,
}

const RELATIONS_SQL: &str = r#"
SELECT c.relname::text, c.relkind::text, obj_description(c.oid, 'pg_class')
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relkind IN ('r', 'p', 'v')
ORDER BY c.relname
"#;

const COLUMNS_SQL: &str = r#"
SELECT c.relname::text, a.attname::text, pg_catalog.format_type(a.atttypid, a.atttypmod),
       a.attnotnull, a.attnum
FROM pg_catalog.pg_attribute a
JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1
  AND c.relkind IN ('r', 'p', 'v')
  AND a.attnum > 0
  AND NOT a.attisdropped
ORDER BY c.relname, a.attnum
"#;

const VIEWS_SQL: &str = r#"
SELECT viewname::text, definition
FROM pg_catalog.pg_views
WHERE schemaname = $1
ORDER BY viewname
"#;

const DEPENDENCIES_SQL: &str = r#"
SELECT DISTINCT v.relname::text, t.relname::text
FROM pg_catalog.pg_depend d
JOIN pg_catalog.pg_rewrite r ON r.oid = d.objid
JOIN pg_catalog.pg_class v ON v.oid = r.ev_class
JOIN pg_catalog.pg_class t ON t.oid = d.refobjid
JOIN pg_catalog.pg_namespace n ON n.oid = v.relnamespace
WHERE n.nspname = $1
  AND d.classid = 'pg_catalog.pg_rewrite'::regclass
  AND d.refclassid = 'pg_catalog.pg_class'::regclass
  AND t.relnamespace = v.relnamespace
  AND t.oid <> v.oid
ORDER BY 1, 2
"#;

const PROCEDURES_SQL: &str = r#"
SELECT p.proname::text, l.lanname::text, p.prosrc, obj_description(p.oid, 'pg_proc'),
       COALESCE(p.proargnames, ARRAY[]::text[]),
       ARRAY(
           SELECT pg_catalog.format_type(t.oid, NULL)
           FROM unnest(p.proargtypes::oid[]) WITH ORDINALITY AS t(oid, ord)
           ORDER BY t.ord
       )
FROM pg_catalog.pg_proc p
JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
JOIN pg_catalog.pg_language l ON l.oid = p.prolang
WHERE n.nspname = $1 AND p.prokind = 'p'
ORDER BY p.proname, p.oid
"#;

/// Read all tables, views and procedures of `namespace`, skipping `ignored`.
pub async fn snapshot(session: &Session, namespace: &str, ignored: &[String]) -> Result<Schema, Error> {
    session
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await?;
    let raw = read_raw(session, namespace).await;
    match raw {
        Ok(raw) => {
            session.batch_execute("COMMIT").await?;
            let schema = assemble(raw, ignored);
            tracing::info!(namespace, objects = schema.len(), "catalog snapshot taken");
            Ok(schema)
        }
        Err(e) => {
            if let Err(rollback) = session.batch_execute("ROLLBACK").await {
                tracing::warn!(error = %rollback, "rollback of catalog snapshot failed");
            }
            Err(e)
        }
    }
}

async fn read_raw(session: &Session, namespace: &str) -> Result<RawCatalog, Error> {
    let relations = session
        .query(RELATIONS_SQL, &[&namespace])
        .await?
        .iter()
        .map(|row| RawRelation {
            name: row.get(0),
            relkind: row.get(1),
            comment: row.get(2),
        })
        .collect();

    let columns = session
        .query(COLUMNS_SQL, &[&namespace])
        .await?
        .iter()
        .map(|row| RawColumn {
            relation: row.get(0),
            name: row.get(1),
            type_name: row.get(2),
            not_null: row.get(3),
            attnum: row.get(4),
        })
        .collect();

    let views = session
        .query(VIEWS_SQL, &[&namespace])
        .await?
        .iter()
        .map(|row| RawView {
            name: row.get(0),
            definition: row.get::<_, Option<String>>(1).unwrap_or_default(),
        })
        .collect();

    let dependencies = session
        .query(DEPENDENCIES_SQL, &[&namespace])
        .await?
        .iter()
        .map(|row| RawDependency {
            dependent: row.get(0),
            dependency: row.get(1),
        })
        .collect();

    let procedures = session
        .query(PROCEDURES_SQL, &[&namespace])
        .await?
        .iter()
        .map(|row| RawProcedure {
            name: row.get(0),
            language: row.get(1),
            body: row.get(2),
            comment: row.get(3),
            argument_names: row.get(4),
            argument_types: row.get(5),
        })
        .collect();

    Ok(RawCatalog {
        relations,
        columns,
        views,
        dependencies,
        procedures,
    })
}

/// Build schema objects from raw catalog rows.
///
/// Columns are ordered by `attnum` regardless of row order. When a name is
/// overloaded by several procedures, the first one (by oid) is kept.
pub fn assemble(raw: RawCatalog, ignored: &[String]) -> Schema {
    let ignored: BTreeSet<&str> = ignored.iter().map(String::as_str).collect();

    let mut columns_by_relation: HashMap<String, Vec<RawColumn>> = HashMap::new();
    for column in raw.columns {
        columns_by_relation.entry(column.relation.clone()).or_default().push(column);
    }
    let mut definitions: HashMap<String, String> = raw
        .views
        .into_iter()
        .map(|v| (v.name, v.definition))
        .collect();
    let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for dep in raw.dependencies {
        dependencies.entry(dep.dependent).or_default().insert(dep.dependency);
    }

    let mut schema = Schema::new();

    for relation in raw.relations {
        if ignored.contains(relation.name.as_str()) {
            continue;
        }
        let mut rows = columns_by_relation.remove(&relation.name).unwrap_or_default();
        rows.sort_by_key(|c| c.attnum);
        let is_view = relation.relkind == "v";
        let columns: Vec<Column> = rows
            .into_iter()
            .map(|c| Column::new(c.name, ColumnType::parse(&c.type_name), !c.not_null))
            .collect();
        let fingerprint = relation
            .comment
            .as_deref()
            .and_then(parse_fingerprint_comment)
            .map(str::to_string);

        let object = if is_view {
            SchemaObject {
                name: relation.name.clone(),
                kind: ObjectKind::View,
                columns,
                definition: Some(definitions.remove(&relation.name).unwrap_or_default()),
                language: None,
                depends_on: dependencies
                    .remove(&relation.name)
                    .map(|deps| deps.into_iter().collect())
                    .unwrap_or_default(),
                fingerprint,
            }
        } else {
            SchemaObject {
                fingerprint,
                ..SchemaObject::table(relation.name, columns)
            }
        };
        schema.insert(object);
    }

    for procedure in raw.procedures {
        if ignored.contains(procedure.name.as_str()) {
            continue;
        }
        if schema.contains(&procedure.name) {
            tracing::warn!(procedure = %procedure.name, "ignoring overloaded procedure");
            continue;
        }
        let arguments = procedure
            .argument_types
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                let name = procedure.argument_names.get(i).cloned().unwrap_or_default();
                Column::new(name, ColumnType::parse(ty), true)
            })
            .collect();
        let mut object = SchemaObject::procedure(
            procedure.name,
            arguments,
            procedure.language,
            procedure.body,
            Vec::new(),
        );
        object.fingerprint = procedure
            .comment
            .as_deref()
            .and_then(parse_fingerprint_comment)
            .map(str::to_string);
        schema.insert(object);
    }

    schema
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(name: &str, relkind: &str, comment: Option<&str>) -> RawRelation {
        RawRelation {
            name: name.into(),
            relkind: relkind.into(),
            comment: comment.map(str::to_string),
        }
    }

    fn column(relation: &str, name: &str, ty: &str, not_null: bool, attnum: i16) -> RawColumn {
        RawColumn {
            relation: relation.into(),
            name: name.into(),
            type_name: ty.into(),
            not_null,
            attnum,
        }
    }

    #[test]
    fn test_columns_follow_attnum() {
        let raw = RawCatalog {
            relations: vec![relation("orders", "r", None)],
            columns: vec![
                column("orders", "total", "numeric(12,2)", false, 2),
                column("orders", "id", "integer", true, 1),
            ],
            ..Default::default()
        };
        let schema = assemble(raw, &[]);
        let orders = schema.get("orders").unwrap();
        assert_eq!(orders.kind, ObjectKind::Table);
        assert_eq!(
            orders.columns,
            vec![
                Column::new("id", ColumnType::Integer, false),
                Column::new("total", ColumnType::Numeric(Some((12, 2))), true),
            ]
        );
    }

    #[test]
    fn test_view_with_fingerprint_and_dependencies() {
        let raw = RawCatalog {
            relations: vec![
                relation("orders", "r", None),
                relation("large_orders", "v", Some("schemashift:00ff")),
            ],
            columns: vec![column("large_orders", "id", "integer", false, 1)],
            views: vec![RawView {
                name: "large_orders".into(),
                definition: " SELECT orders.id\n   FROM orders;".into(),
            }],
            dependencies: vec![RawDependency {
                dependent: "large_orders".into(),
                dependency: "orders".into(),
            }],
            ..Default::default()
        };
        let schema = assemble(raw, &[]);
        let view = schema.get("large_orders").unwrap();
        assert_eq!(view.kind, ObjectKind::View);
        assert_eq!(view.fingerprint.as_deref(), Some("00ff"));
        assert_eq!(view.depends_on, ["orders"]);
        assert_eq!(view.normalized_definition(), "SELECT orders.id FROM orders");
    }

    #[test]
    fn test_ignored_objects_are_skipped() {
        let raw = RawCatalog {
            relations: vec![
                relation("orders", "r", None),
                relation("schemashift_ledger", "r", None),
            ],
            ..Default::default()
        };
        let schema = assemble(raw, &["schemashift_ledger".to_string()]);
        assert_eq!(schema.names().collect::<Vec<_>>(), ["orders"]);
    }

    #[test]
    fn test_procedures() {
        let procedure = |language: &str| RawProcedure {
            name: "purge".into(),
            language: language.into(),
            body: "DELETE FROM orders".into(),
            comment: Some("not a fingerprint".into()),
            argument_names: vec!["min_total".into()],
            argument_types: vec!["numeric".into()],
        };
        let raw = RawCatalog {
            procedures: vec![procedure("sql"), procedure("plpgsql")],
            ..Default::default()
        };
        let schema = assemble(raw, &[]);
        let purge = schema.get("purge").unwrap();
        assert_eq!(purge.kind, ObjectKind::Procedure);
        assert_eq!(purge.language.as_deref(), Some("sql"));
        assert_eq!(purge.signature(), "numeric");
        assert_eq!(purge.columns[0].name, "min_total");
        assert_eq!(purge.fingerprint, None);
    }
}
