mod store;
mod vertex;
mod view;

#[cfg(test)]
mod test;

pub use store::{ChangeSet, Direction, MemStore, VertexStore};
pub use vertex::{
    meta_edges, meta_vertices, Edge, EdgeKind, EdgeLabel, MetaKind, RuleData, ShardData,
    ThingData, TypeData, Vertex, VertexData, META_ATTRIBUTE, META_ENTITY, META_RELATION,
    META_THING,
};
pub use view::GraphView;
