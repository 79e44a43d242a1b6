//! Types for the graph engine.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::CellState;

/// Unique identifier for a cell within a notebook.
///
/// Identifiers are handed out by whoever owns the notebook document, so a
/// cell keeps its id across edits. A deleted and recreated cell is a new cell
/// even if it reuses the number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CellId(pub(crate) usize);

impl CellId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell_{}", self.0)
    }
}

/// A global identifier read or written by a cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name(String);

impl Name {
    /// Create a name, rejecting empty or whitespace-only text.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the name carries the private marker.
    pub fn is_private(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.0.starts_with(prefix)
    }
}

impl TryFrom<String> for Name {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Name> for String {
    fn from(name: Name) -> Self {
        name.0
    }
}

impl Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The names a cell reads and writes, as reported by a
/// [`NameExtractor`](super::NameExtractor).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameSets {
    /// Global names the cell reads.
    pub refs: BTreeSet<Name>,
    /// Global names the cell assigns.
    pub defs: BTreeSet<Name>,
    /// Names local to the cell. Never create edges or conflicts.
    pub private_defs: BTreeSet<Name>,
}

impl NameSets {
    /// Build name sets from plain strings.
    pub fn parse<R, D, P>(refs: R, defs: D, private_defs: P) -> Result<Self>
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        fn collect<I>(items: I) -> Result<BTreeSet<Name>>
        where
            I: IntoIterator,
            I::Item: AsRef<str>,
        {
            items.into_iter().map(|s| Name::new(s.as_ref())).collect()
        }

        Ok(Self {
            refs: collect(refs)?,
            defs: collect(defs)?,
            private_defs: collect(private_defs)?,
        })
    }

    /// Shorthand for cells without private names.
    pub fn public<R, D>(refs: R, defs: D) -> Result<Self>
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self::parse(refs, defs, std::iter::empty::<&str>())
    }

    /// Move marked names out of the global sets and drop self-references.
    ///
    /// After this, `defs` and `refs` only hold names that can take part in
    /// edges, and a cell never references something it defines itself.
    pub fn normalize(&mut self, private_prefix: &str) {
        let (private, public): (BTreeSet<Name>, BTreeSet<Name>) = std::mem::take(&mut self.defs)
            .into_iter()
            .partition(|name| name.is_private(private_prefix));
        self.defs = public;
        self.private_defs.extend(private);

        let defs = &self.defs;
        let private_defs = &self.private_defs;
        self.refs.retain(|name| {
            !name.is_private(private_prefix)
                && !defs.contains(name)
                && !private_defs.contains(name)
        });
    }
}

/// Which structural rule a set of cells breaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    /// The cells form a dependency cycle.
    Cycle,
    /// The cells all define the same global name.
    MultipleDefinition { name: Name },
}

/// A structural violation and every cell taking part in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub members: BTreeSet<CellId>,
}

impl Violation {
    pub fn describe(&self) -> String {
        let members: Vec<String> = self.members.iter().map(|id| id.to_string()).collect();
        match &self.kind {
            ViolationKind::Cycle => format!("cyclic dependency: {}", members.join(" → ")),
            ViolationKind::MultipleDefinition { name } => {
                format!("'{}' is defined by multiple cells: {}", name, members.join(", "))
            }
        }
    }
}

/// Outcome of validating the graph after a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", content = "violations", rename_all = "snake_case")]
pub enum StructuralStatus {
    /// No cycles and no name defined twice.
    #[default]
    Ok,
    /// All violations currently present.
    Violations(Vec<Violation>),
}

impl StructuralStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Ok => &[],
            Self::Violations(v) => v,
        }
    }

    /// Every cell that is part of some violation.
    pub fn members(&self) -> BTreeSet<CellId> {
        self.violations()
            .iter()
            .flat_map(|v| v.members.iter().copied())
            .collect()
    }

    /// The first violation `cell` takes part in, if any.
    pub fn violation_for(&self, cell: CellId) -> Option<&Violation> {
        self.violations().iter().find(|v| v.members.contains(&cell))
    }
}

/// A cell as seen by visualization and debugging tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub id: CellId,
    pub refs: BTreeSet<Name>,
    pub defs: BTreeSet<Name>,
    pub private_defs: BTreeSet<Name>,
    /// Refs no registered cell defines.
    pub unresolved_refs: BTreeSet<Name>,
    /// Every name read by this cell or by one of its ancestors.
    pub transitive_refs: BTreeSet<Name>,
    /// Filled in by the scheduler; the graph itself does not track state.
    pub state: Option<CellState>,
}

/// A derived edge and the names that justify it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub from: CellId,
    pub to: CellId,
    pub names: Vec<Name>,
}

/// Read-only copy of the graph taken at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Cells in registration order.
    pub cells: Vec<CellSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
    pub status: StructuralStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_rejects_empty() {
        assert!(Name::new("").is_err());
        assert!(Name::new("   ").is_err());
        assert_eq!(Name::new("df").unwrap().as_str(), "df");
    }

    #[test]
    fn test_private_marker() {
        let name = Name::new("_tmp").unwrap();
        assert!(name.is_private("_"));
        assert!(!name.is_private(""));
        assert!(!Name::new("tmp").unwrap().is_private("_"));
    }

    #[test]
    fn test_normalize_moves_private_defs() {
        let mut names = NameSets::public(["a", "_x"], ["b", "_y"]).unwrap();
        names.normalize("_");

        assert_eq!(names.defs.len(), 1);
        assert!(names.defs.contains("b"));
        assert!(names.private_defs.contains("_y"));
        assert!(!names.refs.contains("_x"));
        assert!(names.refs.contains("a"));
    }

    #[test]
    fn test_normalize_drops_self_references() {
        let mut names = NameSets::public(["x", "y"], ["x"]).unwrap();
        names.normalize("_");
        assert!(!names.refs.contains("x"));
        assert!(names.refs.contains("y"));
    }

    #[test]
    fn test_status_members() {
        let status = StructuralStatus::Violations(vec![
            Violation {
                kind: ViolationKind::Cycle,
                members: [CellId::new(1), CellId::new(2)].into(),
            },
            Violation {
                kind: ViolationKind::MultipleDefinition {
                    name: Name::new("a").unwrap(),
                },
                members: [CellId::new(2), CellId::new(3)].into(),
            },
        ]);
        assert!(!status.is_ok());
        assert_eq!(status.members().len(), 3);
        assert_eq!(
            status.violation_for(CellId::new(3)).map(|v| &v.kind),
            Some(&ViolationKind::MultipleDefinition {
                name: Name::new("a").unwrap()
            })
        );
        assert!(status.violation_for(CellId::new(4)).is_none());
    }

    #[test]
    fn test_name_deserialize_rejects_empty() {
        assert!(serde_json::from_str::<Name>("\"\"").is_err());
        assert!(serde_json::from_str::<Name>("\"ok\"").is_ok());
    }
}
