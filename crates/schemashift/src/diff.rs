//! Schema diffing - compare a compiled target schema against a catalog
//! snapshot.
//!
//! Objects are partitioned by name into create, drop and compare. Tables
//! that differ produce one `alter` unit with a statement per column change.
//! Views cannot change shape in place, so a changed view is dropped and
//! recreated, and so is every catalog view that depends on something being
//! recreated, altered or dropped:
//!
//! ```text
//! orders:          ~ alter   (total numeric -> numeric(12,2))
//! large_orders:    - dropView, + createView   (reads orders)
//! ```
//!
//! Column order is not compared; Postgres cannot reorder columns. Renames
//! are not detected and show up as a drop plus a create.

use std::collections::BTreeSet;

use crate::change::{ChangeUnit, Changeset, Operation};
use crate::ddl;
use crate::error::Error;
use crate::schema::{Column, ObjectKind, Schema, SchemaObject};
use crate::solver::{PlannedUnit, order_units};

/// A single column-level change inside an `alter` unit.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnChange {
    Add(Column),
    Drop(Column),
    Retype { from: Column, to: Column },
    Nullability { from: Column, to: Column },
}

impl ColumnChange {
    fn forward_sql(&self, table: &str) -> String {
        match self {
            ColumnChange::Add(column) => ddl::add_column(table, column),
            ColumnChange::Drop(column) => ddl::drop_column(table, &column.name),
            ColumnChange::Retype { to, .. } => {
                ddl::alter_column_type(table, &to.name, &to.column_type)
            }
            ColumnChange::Nullability { to, .. } => {
                ddl::alter_column_nullable(table, &to.name, to.nullable)
            }
        }
    }

    fn reverse_sql(&self, table: &str) -> String {
        match self {
            ColumnChange::Add(column) => ddl::drop_column(table, &column.name),
            ColumnChange::Drop(column) => ddl::add_column(table, column),
            ColumnChange::Retype { from, .. } => {
                ddl::alter_column_type(table, &from.name, &from.column_type)
            }
            ColumnChange::Nullability { from, .. } => {
                ddl::alter_column_nullable(table, &from.name, from.nullable)
            }
        }
    }
}

/// Column changes that turn `catalog` into `target`, ignoring column order.
///
/// Drops come first, then retypes and nullability changes in target order,
/// then adds in target order.
pub fn diff_columns(target: &SchemaObject, catalog: &SchemaObject) -> Vec<ColumnChange> {
    let mut changes = Vec::new();

    for column in &catalog.columns {
        if target.column(&column.name).is_none() {
            changes.push(ColumnChange::Drop(column.clone()));
        }
    }

    for column in &target.columns {
        let Some(existing) = catalog.column(&column.name) else {
            continue;
        };
        if existing.column_type != column.column_type {
            changes.push(ColumnChange::Retype {
                from: existing.clone(),
                to: column.clone(),
            });
        }
        if existing.nullable != column.nullable {
            changes.push(ColumnChange::Nullability {
                from: existing.clone(),
                to: column.clone(),
            });
        }
    }

    for column in &target.columns {
        if catalog.column(&column.name).is_none() {
            changes.push(ColumnChange::Add(column.clone()));
        }
    }

    changes
}

/// Whether a catalog view still matches its target definition.
///
/// A view created by this tool carries the fingerprint of its definition in
/// its comment, which is compared directly. Otherwise the normalized query
/// text is compared, which only matches when Postgres kept the text as written.
fn view_matches(target: &SchemaObject, catalog: &SchemaObject) -> bool {
    if !target.columns.is_empty() {
        let same_columns = target.columns.len() == catalog.columns.len()
            && target
                .columns
                .iter()
                .zip(&catalog.columns)
                .all(|(t, c)| t.name == c.name && t.column_type == c.column_type);
        if !same_columns {
            return false;
        }
    }
    match (&catalog.fingerprint, &target.fingerprint) {
        (Some(found), Some(wanted)) => found == wanted,
        _ => catalog.normalized_definition() == target.normalized_definition(),
    }
}

fn procedure_matches(target: &SchemaObject, catalog: &SchemaObject) -> bool {
    if let (Some(found), Some(wanted)) = (&catalog.fingerprint, &target.fingerprint) {
        return found == wanted;
    }
    target.signature() == catalog.signature()
        && target.language == catalog.language
        && target.normalized_definition() == catalog.normalized_definition()
}

fn create_unit(object: &SchemaObject) -> PlannedUnit {
    let definition = object.canonical_text();
    let (operation, forward, reverse) = match object.kind {
        ObjectKind::Table => (
            Operation::CreateTable,
            ddl::create_table(object),
            ddl::drop_table(&object.name),
        ),
        ObjectKind::View => (
            Operation::CreateView,
            ddl::create_view(object),
            ddl::drop_view(&object.name),
        ),
        ObjectKind::Procedure => (
            Operation::CreateProcedure,
            ddl::create_procedure(object, false),
            ddl::drop_procedure(object),
        ),
    };
    PlannedUnit {
        unit: ChangeUnit::new(operation, &object.name, &definition, forward, Some(reverse)),
        target_dependencies: object.depends_on.clone(),
        catalog_dependencies: Vec::new(),
    }
}

fn drop_unit(object: &SchemaObject) -> PlannedUnit {
    let definition = object.canonical_text();
    let (operation, forward, reverse) = match object.kind {
        ObjectKind::Table => (
            Operation::DropTable,
            ddl::drop_table(&object.name),
            ddl::create_table(object),
        ),
        ObjectKind::View => (
            Operation::DropView,
            ddl::drop_view(&object.name),
            ddl::create_view(object),
        ),
        ObjectKind::Procedure => (
            Operation::DropProcedure,
            ddl::drop_procedure(object),
            ddl::create_procedure(object, false),
        ),
    };
    PlannedUnit {
        unit: ChangeUnit::new(operation, &object.name, &definition, forward, Some(reverse)),
        target_dependencies: Vec::new(),
        catalog_dependencies: object.depends_on.clone(),
    }
}

fn transition_definition(target: &SchemaObject, catalog: &SchemaObject) -> String {
    format!("{}\n=>\n{}", catalog.canonical_text(), target.canonical_text())
}

fn alter_unit(
    target: &SchemaObject,
    catalog: &SchemaObject,
    changes: &[ColumnChange],
) -> PlannedUnit {
    let forward = changes
        .iter()
        .map(|c| c.forward_sql(&target.name))
        .collect::<Vec<_>>()
        .join("\n");
    let reverse = changes
        .iter()
        .rev()
        .map(|c| c.reverse_sql(&target.name))
        .collect::<Vec<_>>()
        .join("\n");
    PlannedUnit {
        unit: ChangeUnit::new(
            Operation::AlterTable,
            &target.name,
            &transition_definition(target, catalog),
            forward,
            Some(reverse),
        ),
        target_dependencies: target.depends_on.clone(),
        catalog_dependencies: Vec::new(),
    }
}

fn replace_procedure_unit(target: &SchemaObject, catalog: &SchemaObject) -> PlannedUnit {
    PlannedUnit {
        unit: ChangeUnit::new(
            Operation::CreateProcedure,
            &target.name,
            &transition_definition(target, catalog),
            ddl::create_procedure(target, true),
            Some(ddl::create_procedure(catalog, true)),
        ),
        target_dependencies: target.depends_on.clone(),
        catalog_dependencies: Vec::new(),
    }
}

/// Compute the ordered changeset that turns `catalog` into `target`.
pub fn diff(target: &Schema, catalog: &Schema) -> Result<Changeset, Error> {
    let mut planned = Vec::new();
    // Objects whose catalog version goes away or changes shape.
    let mut disturbed: BTreeSet<String> = BTreeSet::new();
    let mut recreate_views: BTreeSet<String> = BTreeSet::new();

    for wanted in target {
        let Some(found) = catalog.get(&wanted.name) else {
            planned.push(create_unit(wanted));
            continue;
        };

        if found.kind != wanted.kind {
            planned.push(drop_unit(found));
            planned.push(create_unit(wanted));
            disturbed.insert(wanted.name.clone());
            continue;
        }

        match wanted.kind {
            ObjectKind::Table => {
                let changes = diff_columns(wanted, found);
                if !changes.is_empty() {
                    planned.push(alter_unit(wanted, found, &changes));
                    disturbed.insert(wanted.name.clone());
                }
            }
            ObjectKind::View => {
                if !view_matches(wanted, found) {
                    recreate_views.insert(wanted.name.clone());
                    disturbed.insert(wanted.name.clone());
                }
            }
            ObjectKind::Procedure => {
                if !procedure_matches(wanted, found) {
                    if wanted.signature() == found.signature() {
                        planned.push(replace_procedure_unit(wanted, found));
                    } else {
                        planned.push(drop_unit(found));
                        planned.push(create_unit(wanted));
                    }
                }
            }
        }
    }

    for found in catalog {
        if !target.contains(&found.name) {
            planned.push(drop_unit(found));
            disturbed.insert(found.name.clone());
        }
    }

    // Views kept by name but reading from a disturbed object must be rebuilt.
    loop {
        let cascaded: Vec<String> = catalog
            .iter()
            .filter(|found| found.kind == ObjectKind::View)
            .filter(|found| !recreate_views.contains(&found.name))
            .filter(|found| {
                target
                    .get(&found.name)
                    .is_some_and(|wanted| wanted.kind == ObjectKind::View)
            })
            .filter(|found| found.depends_on.iter().any(|d| disturbed.contains(d)))
            .map(|found| found.name.clone())
            .collect();
        if cascaded.is_empty() {
            break;
        }
        for name in cascaded {
            tracing::debug!(view = %name, "recreating dependent view");
            disturbed.insert(name.clone());
            recreate_views.insert(name);
        }
    }

    for name in &recreate_views {
        if let (Some(wanted), Some(found)) = (target.get(name), catalog.get(name)) {
            planned.push(drop_unit(found));
            planned.push(create_unit(wanted));
        }
    }

    order_units(planned)
}
