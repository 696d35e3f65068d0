use serde::{Deserialize, Serialize};

// Concepts never hold pointers to one another. Every cross-reference in the
// schema or instance graph is a ConceptId resolved through the vertex arena
// of whichever transaction is doing the looking, so the schema's cyclic
// Type/Role/RelationType references cost nothing at the ownership level and
// ids stay stable across schema edits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ConceptId(pub u64);

impl std::fmt::Display for ConceptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
