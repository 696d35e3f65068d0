use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use trellis_base::ConceptId;
use trellis_lang::{Datatype, Pattern, Value};

// The four meta vertices seeded into every fresh keyspace. `thing` is the
// schema root; every subtype chain terminates there.
pub const META_THING: ConceptId = ConceptId(0);
pub const META_ENTITY: ConceptId = ConceptId(1);
pub const META_RELATION: ConceptId = ConceptId(2);
pub const META_ATTRIBUTE: ConceptId = ConceptId(3);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum MetaKind {
    Thing,
    Entity,
    Relation,
    Attribute,
}

impl MetaKind {
    pub fn label(&self) -> &'static str {
        match self {
            MetaKind::Thing => "thing",
            MetaKind::Entity => "entity",
            MetaKind::Relation => "relation",
            MetaKind::Attribute => "attribute",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TypeData {
    pub label: String,
    pub is_abstract: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RuleData {
    pub label: String,
    pub when: Pattern,
    pub then: Pattern,
    // Filled by commit validation; the stratifiability check reads them.
    pub positive_hypothesis: BTreeSet<ConceptId>,
    pub negative_hypothesis: BTreeSet<ConceptId>,
    pub conclusion: BTreeSet<ConceptId>,
}

// shard is None only while the thing exists as an unpersisted inference;
// anything that reaches the store has been attached to a shard.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ThingData {
    pub type_id: ConceptId,
    pub shard: Option<ConceptId>,
    pub inferred: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShardData {
    pub owner: ConceptId,
    pub seq: u64,
    pub members: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum VertexData {
    Meta(MetaKind),
    EntityType(TypeData),
    RelationType(TypeData),
    AttributeType { base: TypeData, datatype: Datatype },
    Role(TypeData),
    Rule(RuleData),
    Entity(ThingData),
    Relation(ThingData),
    Attribute { base: ThingData, value: Value },
    Shard(ShardData),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub id: ConceptId,
    pub data: VertexData,
}

impl Vertex {
    pub fn new(id: ConceptId, data: VertexData) -> Vertex {
        Vertex { id, data }
    }
}

impl VertexData {
    pub fn is_schema(&self) -> bool {
        !self.is_thing() && !self.is_shard()
    }
    // Types are the isa-targets: metas plus the three user type variants.
    // Roles and rules are schema concepts but not types.
    pub fn is_type(&self) -> bool {
        matches!(
            self,
            VertexData::Meta(_)
                | VertexData::EntityType(_)
                | VertexData::RelationType(_)
                | VertexData::AttributeType { .. }
        )
    }
    pub fn is_relation_type(&self) -> bool {
        matches!(self, VertexData::RelationType(_))
    }
    pub fn is_attribute_type(&self) -> bool {
        matches!(self, VertexData::AttributeType { .. })
    }
    pub fn is_role(&self) -> bool {
        matches!(self, VertexData::Role(_))
    }
    pub fn is_rule(&self) -> bool {
        matches!(self, VertexData::Rule(_))
    }
    pub fn is_thing(&self) -> bool {
        matches!(
            self,
            VertexData::Entity(_) | VertexData::Relation(_) | VertexData::Attribute { .. }
        )
    }
    pub fn is_relation(&self) -> bool {
        matches!(self, VertexData::Relation(_))
    }
    pub fn is_attribute(&self) -> bool {
        matches!(self, VertexData::Attribute { .. })
    }
    pub fn is_shard(&self) -> bool {
        matches!(self, VertexData::Shard(_))
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            VertexData::Meta(m) => Some(m.label()),
            VertexData::EntityType(t) | VertexData::RelationType(t) | VertexData::Role(t) => {
                Some(&t.label)
            }
            VertexData::AttributeType { base, .. } => Some(&base.label),
            VertexData::Rule(r) => Some(&r.label),
            _ => None,
        }
    }

    pub fn is_abstract(&self) -> bool {
        match self {
            VertexData::EntityType(t) | VertexData::RelationType(t) | VertexData::Role(t) => {
                t.is_abstract
            }
            VertexData::AttributeType { base, .. } => base.is_abstract,
            // The metas are never instantiated directly.
            VertexData::Meta(_) => true,
            _ => false,
        }
    }

    pub fn thing(&self) -> Option<&ThingData> {
        match self {
            VertexData::Entity(t) | VertexData::Relation(t) => Some(t),
            VertexData::Attribute { base, .. } => Some(base),
            _ => None,
        }
    }

    pub fn thing_mut(&mut self) -> Option<&mut ThingData> {
        match self {
            VertexData::Entity(t) | VertexData::Relation(t) => Some(t),
            VertexData::Attribute { base, .. } => Some(base),
            _ => None,
        }
    }

    pub fn rule(&self) -> Option<&RuleData> {
        match self {
            VertexData::Rule(r) => Some(r),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            VertexData::Attribute { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            VertexData::Meta(_) => "meta type",
            VertexData::EntityType(_) => "entity type",
            VertexData::RelationType(_) => "relation type",
            VertexData::AttributeType { .. } => "attribute type",
            VertexData::Role(_) => "role",
            VertexData::Rule(_) => "rule",
            VertexData::Entity(_) => "entity",
            VertexData::Relation(_) => "relation",
            VertexData::Attribute { .. } => "attribute",
            VertexData::Shard(_) => "shard",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum EdgeLabel {
    // type -> its direct supertype
    Sub,
    // thing -> its direct type
    Isa,
    // relation type -> role
    Relates,
    // type -> role it may play
    Plays { required: bool },
    // type -> attribute type keying it
    Key,
    // thing -> attribute it owns
    Has,
    // relation -> role player; one edge per casting
    RolePlayer { role: ConceptId },
    // type -> shard bucket, append-only
    Shard,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    Sub,
    Isa,
    Relates,
    Plays,
    Key,
    Has,
    RolePlayer,
    Shard,
}

impl EdgeLabel {
    pub fn kind(&self) -> EdgeKind {
        match self {
            EdgeLabel::Sub => EdgeKind::Sub,
            EdgeLabel::Isa => EdgeKind::Isa,
            EdgeLabel::Relates => EdgeKind::Relates,
            EdgeLabel::Plays { .. } => EdgeKind::Plays,
            EdgeLabel::Key => EdgeKind::Key,
            EdgeLabel::Has => EdgeKind::Has,
            EdgeLabel::RolePlayer { .. } => EdgeKind::RolePlayer,
            EdgeLabel::Shard => EdgeKind::Shard,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: ConceptId,
    pub label: EdgeLabel,
    pub to: ConceptId,
}

impl Edge {
    pub fn new(from: ConceptId, label: EdgeLabel, to: ConceptId) -> Edge {
        Edge { from, label, to }
    }
}

pub fn meta_vertices() -> Vec<Vertex> {
    vec![
        Vertex::new(META_THING, VertexData::Meta(MetaKind::Thing)),
        Vertex::new(META_ENTITY, VertexData::Meta(MetaKind::Entity)),
        Vertex::new(META_RELATION, VertexData::Meta(MetaKind::Relation)),
        Vertex::new(META_ATTRIBUTE, VertexData::Meta(MetaKind::Attribute)),
    ]
}

pub fn meta_edges() -> Vec<Edge> {
    vec![
        Edge::new(META_ENTITY, EdgeLabel::Sub, META_THING),
        Edge::new(META_RELATION, EdgeLabel::Sub, META_THING),
        Edge::new(META_ATTRIBUTE, EdgeLabel::Sub, META_THING),
    ]
}
