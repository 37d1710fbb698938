//! Change units and ordered changesets.

use std::fmt;

use schemashift_sql::content_hash;
use serde::Serialize;

use crate::schema::ObjectKind;

/// The structural operation a [`ChangeUnit`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Operation {
    #[serde(rename = "create")]
    CreateTable,
    #[serde(rename = "drop")]
    DropTable,
    #[serde(rename = "alter")]
    AlterTable,
    #[serde(rename = "createView")]
    CreateView,
    #[serde(rename = "dropView")]
    DropView,
    #[serde(rename = "createProcedure")]
    CreateProcedure,
    #[serde(rename = "dropProcedure")]
    DropProcedure,
}

/// Coarse ordering phase of an operation, used for tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Drop,
    Alter,
    Create,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::CreateTable => "create",
            Operation::DropTable => "drop",
            Operation::AlterTable => "alter",
            Operation::CreateView => "createView",
            Operation::DropView => "dropView",
            Operation::CreateProcedure => "createProcedure",
            Operation::DropProcedure => "dropProcedure",
        }
    }

    /// Parse the name stored in a ledger.
    pub fn from_name(name: &str) -> Option<Operation> {
        Some(match name {
            "create" => Operation::CreateTable,
            "drop" => Operation::DropTable,
            "alter" => Operation::AlterTable,
            "createView" => Operation::CreateView,
            "dropView" => Operation::DropView,
            "createProcedure" => Operation::CreateProcedure,
            "dropProcedure" => Operation::DropProcedure,
            _ => return None,
        })
    }

    pub fn phase(self) -> Phase {
        match self {
            Operation::DropTable | Operation::DropView | Operation::DropProcedure => Phase::Drop,
            Operation::AlterTable => Phase::Alter,
            Operation::CreateTable | Operation::CreateView | Operation::CreateProcedure => {
                Phase::Create
            }
        }
    }

    pub fn kind(self) -> ObjectKind {
        match self {
            Operation::CreateTable | Operation::DropTable | Operation::AlterTable => {
                ObjectKind::Table
            }
            Operation::CreateView | Operation::DropView => ObjectKind::View,
            Operation::CreateProcedure | Operation::DropProcedure => ObjectKind::Procedure,
        }
    }

    /// Symbol used in previews.
    pub fn symbol(self) -> char {
        match self.phase() {
            Phase::Drop => '-',
            Phase::Alter => '~',
            Phase::Create => '+',
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic structural change, applied in its own transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeUnit {
    /// Content hash of (object name, operation, definition).
    pub id: String,
    pub operation: Operation,
    pub object: String,
    pub forward_sql: String,
    /// `None` when the change cannot be undone by SQL alone.
    pub reverse_sql: Option<String>,
}

impl ChangeUnit {
    /// Build a unit whose id derives from `definition`.
    pub fn new(
        operation: Operation,
        object: impl Into<String>,
        definition: &str,
        forward_sql: String,
        reverse_sql: Option<String>,
    ) -> Self {
        let object = object.into();
        let id = content_hash(&[object.as_str(), operation.as_str(), definition]);
        Self {
            id,
            operation,
            object,
            forward_sql,
            reverse_sql,
        }
    }

    /// Checksum of the forward SQL, compared against ledger records.
    pub fn checksum(&self) -> String {
        content_hash(&[self.forward_sql.as_str()])
    }

    pub fn to_ref(&self) -> UnitRef {
        UnitRef {
            id: self.id.clone(),
            object: self.object.clone(),
            operation: self.operation,
        }
    }
}

/// Identifies a unit in outcomes and errors without carrying its SQL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitRef {
    pub id: String,
    pub object: String,
    pub operation: Operation,
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = &self.id[..self.id.len().min(12)];
        write!(f, "{} {} [{}]", self.operation, self.object, short)
    }
}

/// An ordered sequence of change units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Changeset {
    units: Vec<ChangeUnit>,
}

impl Changeset {
    /// Wrap units that are already in dependency order.
    pub fn from_ordered(units: Vec<ChangeUnit>) -> Self {
        Self { units }
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeUnit> {
        self.units.iter()
    }

    pub fn units(&self) -> &[ChangeUnit] {
        &self.units
    }

    /// Keep only the units matching `keep`, preserving order.
    pub fn retain(&self, mut keep: impl FnMut(&ChangeUnit) -> bool) -> Changeset {
        Changeset {
            units: self.units.iter().filter(|u| keep(u)).cloned().collect(),
        }
    }

    /// Forward SQL of every unit, in application order.
    pub fn preview_sql(&self) -> String {
        let mut sql = String::new();
        for unit in &self.units {
            sql.push_str(&format!("-- {}\n", unit.to_ref()));
            sql.push_str(&unit.forward_sql);
            sql.push_str("\n\n");
        }
        sql
    }

    /// Reverse SQL of every unit, last unit first.
    pub fn rollback_sql(&self) -> String {
        let mut sql = String::new();
        for unit in self.units.iter().rev() {
            sql.push_str(&format!("-- undo {}\n", unit.to_ref()));
            match &unit.reverse_sql {
                Some(reverse) => sql.push_str(reverse),
                None => sql.push_str("-- irreversible"),
            }
            sql.push_str("\n\n");
        }
        sql
    }
}

impl<'a> IntoIterator for &'a Changeset {
    type Item = &'a ChangeUnit;
    type IntoIter = std::slice::Iter<'a, ChangeUnit>;

    fn into_iter(self) -> Self::IntoIter {
        self.units.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(op: Operation, object: &str, forward: &str, reverse: Option<&str>) -> ChangeUnit {
        ChangeUnit::new(
            op,
            object,
            "def",
            forward.to_string(),
            reverse.map(str::to_string),
        )
    }

    #[test]
    fn test_id_depends_on_name_operation_definition() {
        let a = ChangeUnit::new(Operation::CreateTable, "t", "x", String::new(), None);
        let b = ChangeUnit::new(Operation::CreateTable, "t", "x", "other sql".into(), None);
        let c = ChangeUnit::new(Operation::DropTable, "t", "x", String::new(), None);
        let d = ChangeUnit::new(Operation::CreateTable, "u", "x", String::new(), None);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_ne!(a.id, d.id);
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_operation_names_roundtrip() {
        for op in [
            Operation::CreateTable,
            Operation::DropTable,
            Operation::AlterTable,
            Operation::CreateView,
            Operation::DropView,
            Operation::CreateProcedure,
            Operation::DropProcedure,
        ] {
            assert_eq!(Operation::from_name(op.as_str()), Some(op));
        }
        assert_eq!(Operation::from_name("rename"), None);
    }

    #[test]
    fn test_rollback_runs_backwards() {
        let changeset = Changeset::from_ordered(vec![
            unit(Operation::CreateTable, "t", "CREATE TABLE t ();", Some("DROP TABLE t;")),
            unit(Operation::DropView, "v", "DROP VIEW v;", None),
        ]);
        let rollback = changeset.rollback_sql();
        let undo_view = rollback.find("undo dropView v").unwrap();
        let undo_table = rollback.find("undo create t").unwrap();
        assert!(undo_view < undo_table);
        assert!(rollback.contains("-- irreversible"));

        let preview = changeset.preview_sql();
        assert!(preview.find("CREATE TABLE t").unwrap() < preview.find("DROP VIEW v").unwrap());
    }
}
