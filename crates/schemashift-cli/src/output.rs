//! Terminal rendering for plans, summaries and ledger status.

use owo_colors::OwoColorize;
use schemashift::{ChangeRecord, Outcome, Plan, RunSummary, Schema, UnitOutcome};
use serde::Serialize;

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("{} {}", "error:".red().bold(), e),
    }
}

pub fn print_schema(schema: &Schema, json: bool) {
    if json {
        print_json(schema);
        return;
    }
    if schema.is_empty() {
        println!("The model declares no objects.");
        return;
    }

    println!("Model ({} objects):", schema.len());
    println!();
    for object in schema.iter() {
        println!("  {} {}", object.kind.dimmed(), object.name.bold());
        for col in &object.columns {
            let null = if col.nullable { "" } else { " NOT NULL" };
            println!("    {}: {}{}", col.name, col.column_type, null.dimmed());
        }
        if !object.depends_on.is_empty() {
            println!("    {} {}", "depends on".dimmed(), object.depends_on.join(", "));
        }
    }
}

pub fn print_plan(plan: &Plan) {
    if plan.pending.is_empty() {
        if plan.changeset.is_empty() {
            println!("{}", "Database matches the model.".green());
        } else {
            println!(
                "{} ({} change(s) already recorded in the ledger)",
                "Nothing pending.".green(),
                plan.already_applied()
            );
        }
        return;
    }

    println!("{} change(s) pending:", plan.pending.len());
    println!();
    for unit in &plan.pending {
        let symbol = unit.operation.symbol();
        let line = format!("{} {} {}", symbol, unit.operation, unit.object);
        match symbol {
            '+' => println!("  {}", line.green()),
            '-' => println!("  {}", line.red()),
            _ => println!("  {}", line.yellow()),
        }
        for sql in unit.forward_sql.lines() {
            println!("      {}", sql.dimmed());
        }
    }
    if plan.already_applied() > 0 {
        println!();
        println!(
            "{}",
            format!("{} change(s) already recorded in the ledger", plan.already_applied()).dimmed()
        );
    }
}

pub fn print_summary(summary: &RunSummary) {
    for outcome in &summary.outcomes {
        match outcome {
            UnitOutcome::Applied { unit } => println!("  {} {}", "applied".green(), unit),
            UnitOutcome::Failed { unit, error } => {
                println!("  {} {}", "failed ".red().bold(), unit);
                println!("      {}", error.red());
            }
            UnitOutcome::Skipped { unit } => println!("  {} {}", "skipped".dimmed(), unit),
        }
    }
    if !summary.outcomes.is_empty() {
        println!();
    }

    let counts = format!(
        "{} applied, {} failed, {} already applied, {} not attempted",
        summary.applied, summary.failed, summary.skipped, summary.not_attempted
    );
    if summary.is_success() {
        println!("{} {}", "ok:".green().bold(), counts);
    } else if summary.cancelled {
        println!("{} {}", "cancelled:".yellow().bold(), counts);
    } else {
        println!("{} {}", "incomplete:".red().bold(), counts);
        println!("Fix the failing change and run migrate again; applied changes are kept.");
    }
}

pub fn print_status(records: &[ChangeRecord], plan: &Plan) {
    if records.is_empty() {
        println!("The ledger is empty.");
    } else {
        println!("Ledger ({} records):", records.len());
        println!();
        for record in records {
            let when = record.applied_at.format("%Y-%m-%d %H:%M:%S");
            let short = &record.unit_id[..record.unit_id.len().min(12)];
            let line = format!("{} {} {} [{}]", when, record.operation, record.object, short);
            match record.outcome {
                Outcome::Applied => println!("  {}", line),
                Outcome::Failed => {
                    println!("  {} {}", line.red(), "(failed)".red());
                    if let Some(error) = &record.error {
                        println!("      {}", error.dimmed());
                    }
                }
            }
        }
    }
    println!();
    match plan.pending.len() {
        0 => println!("{}", "Up to date.".green()),
        n => println!("{}", format!("{n} change(s) pending").yellow()),
    }
}
