//! DDL rendering for schema objects.
//!
//! Names are quoted but not schema-qualified; the session's `search_path`
//! selects the namespace.

use schemashift_sql::{Ident, Lit, dollar_quote, fingerprint_comment};

use crate::schema::{Column, ColumnType, SchemaObject};

pub(crate) fn column_def(column: &Column) -> String {
    let mut def = format!("{} {}", Ident(&column.name), column.column_type);
    if !column.nullable {
        def.push_str(" NOT NULL");
    }
    def
}

pub(crate) fn create_table(table: &SchemaObject) -> String {
    let mut sql = format!("CREATE TABLE {} (", Ident(&table.name));
    let defs: Vec<String> = table.columns.iter().map(column_def).collect();
    if defs.is_empty() {
        sql.push_str(");");
    } else {
        sql.push('\n');
        sql.push_str(
            &defs
                .iter()
                .map(|d| format!("    {}", d))
                .collect::<Vec<_>>()
                .join(",\n"),
        );
        sql.push_str("\n);");
    }
    sql
}

pub(crate) fn drop_table(name: &str) -> String {
    format!("DROP TABLE {};", Ident(name))
}

pub(crate) fn add_column(table: &str, column: &Column) -> String {
    format!("ALTER TABLE {} ADD COLUMN {};", Ident(table), column_def(column))
}

pub(crate) fn drop_column(table: &str, column: &str) -> String {
    format!("ALTER TABLE {} DROP COLUMN {};", Ident(table), Ident(column))
}

pub(crate) fn alter_column_type(table: &str, column: &str, to: &ColumnType) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{};",
        Ident(table),
        Ident(column),
        to,
        Ident(column),
        to
    )
}

pub(crate) fn alter_column_nullable(table: &str, column: &str, nullable: bool) -> String {
    let action = if nullable {
        "DROP NOT NULL"
    } else {
        "SET NOT NULL"
    };
    format!(
        "ALTER TABLE {} ALTER COLUMN {} {};",
        Ident(table),
        Ident(column),
        action
    )
}

fn view_comment(view: &SchemaObject) -> Option<String> {
    view.fingerprint.as_ref().map(|fp| {
        format!(
            "COMMENT ON VIEW {} IS {};",
            Ident(&view.name),
            Lit(fingerprint_comment(fp))
        )
    })
}

pub(crate) fn create_view(view: &SchemaObject) -> String {
    let mut sql = format!("CREATE VIEW {}", Ident(&view.name));
    if !view.columns.is_empty() {
        let names: Vec<String> = view
            .columns
            .iter()
            .map(|c| Ident(&c.name).to_string())
            .collect();
        sql.push_str(&format!(" ({})", names.join(", ")));
    }
    sql.push_str(" AS\n");
    sql.push_str(trim_statement(view.definition.as_deref().unwrap_or_default()));
    sql.push(';');
    if let Some(comment) = view_comment(view) {
        sql.push('\n');
        sql.push_str(&comment);
    }
    sql
}

pub(crate) fn drop_view(name: &str) -> String {
    format!("DROP VIEW {};", Ident(name))
}

fn procedure_ident(procedure: &SchemaObject) -> String {
    format!("{}({})", Ident(&procedure.name), procedure.signature())
}

pub(crate) fn create_procedure(procedure: &SchemaObject, or_replace: bool) -> String {
    let arguments: Vec<String> = procedure
        .columns
        .iter()
        .map(|a| {
            if a.name.is_empty() {
                a.column_type.to_string()
            } else {
                format!("{} {}", Ident(&a.name), a.column_type)
            }
        })
        .collect();
    let mut sql = format!(
        "CREATE {}PROCEDURE {}({})\nLANGUAGE {}\nAS {};",
        if or_replace { "OR REPLACE " } else { "" },
        Ident(&procedure.name),
        arguments.join(", "),
        procedure.language.as_deref().unwrap_or("plpgsql"),
        dollar_quote(procedure.definition.as_deref().unwrap_or_default())
    );
    if let Some(fp) = &procedure.fingerprint {
        sql.push_str(&format!(
            "\nCOMMENT ON PROCEDURE {} IS {};",
            procedure_ident(procedure),
            Lit(fingerprint_comment(fp))
        ));
    }
    sql
}

pub(crate) fn drop_procedure(procedure: &SchemaObject) -> String {
    format!("DROP PROCEDURE {};", procedure_ident(procedure))
}

/// Drop trailing semicolons and surrounding whitespace from a statement.
pub(crate) fn trim_statement(sql: &str) -> &str {
    sql.trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}
