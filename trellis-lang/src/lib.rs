use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use trellis_base::{err, ConceptId, Result};

#[cfg(test)]
mod test;

// Attribute values carry a total order and a hash so they can key indexes;
// floats go through OrderedFloat for exactly that reason.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(OrderedFloat<f64>),
    Text(String),
    Bool(bool),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Datatype {
    Int,
    Float,
    Text,
    Bool,
}

impl Value {
    pub fn datatype(&self) -> Datatype {
        match self {
            Value::Int(_) => Datatype::Int,
            Value::Float(_) => Datatype::Float,
            Value::Text(_) => Datatype::Text,
            Value::Bool(_) => Datatype::Bool,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(OrderedFloat(v))
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_string())
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Var(pub String);

impl Var {
    pub fn new(name: impl Into<String>) -> Var {
        Var(name.into())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ValueRef {
    Var(Var),
    Const(Value),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Comparator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    // Int and Float compare numerically against each other; any other
    // cross-datatype comparison is simply false.
    pub fn test(&self, a: &Value, b: &Value) -> bool {
        use std::cmp::Ordering::*;
        let ord = match (a, b) {
            (Value::Int(x), Value::Int(y)) => x.cmp(y),
            (Value::Float(x), Value::Float(y)) => x.cmp(y),
            (Value::Int(x), Value::Float(y)) => OrderedFloat(*x as f64).cmp(y),
            (Value::Float(x), Value::Int(y)) => x.cmp(&OrderedFloat(*y as f64)),
            (Value::Text(x), Value::Text(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => return false,
        };
        match self {
            Comparator::Eq => ord == Equal,
            Comparator::Neq => ord != Equal,
            Comparator::Gt => ord == Greater,
            Comparator::Gte => ord != Less,
            Comparator::Lt => ord == Less,
            Comparator::Lte => ord != Greater,
        }
    }
}

// One atom of a match/insert body. Variables range over concepts; value
// tests read through the attribute the variable is bound to.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Statement {
    Isa {
        var: Var,
        label: String,
    },
    Has {
        owner: Var,
        attr: String,
        value: ValueRef,
    },
    Rel {
        var: Var,
        label: Option<String>,
        players: Vec<(Option<String>, Var)>,
    },
    Cmp {
        var: Var,
        op: Comparator,
        value: Value,
    },
    Id {
        var: Var,
        id: ConceptId,
    },
}

// Rule bodies allow conjunction, disjunction and negation; queries use
// plain conjunctions. Validation normalizes rule bodies to DNF.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Pattern {
    And(Vec<Pattern>),
    Or(Vec<Pattern>),
    Not(Box<Pattern>),
    Stmt(Statement),
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Conjunction {
    pub statements: Vec<Statement>,
    // Each entry is one negated conjunction of statements.
    pub negations: Vec<Vec<Statement>>,
}

impl Conjunction {
    fn merge(mut self, other: Conjunction) -> Conjunction {
        self.statements.extend(other.statements);
        self.negations.extend(other.negations);
        self
    }
}

impl Pattern {
    pub fn stmt(s: Statement) -> Pattern {
        Pattern::Stmt(s)
    }

    pub fn and(ps: Vec<Pattern>) -> Pattern {
        Pattern::And(ps)
    }

    // Disjunctive normal form. Negation is only accepted around a plain
    // conjunction of statements; nesting disjunction or negation inside a
    // negation has no stratification story and is rejected.
    pub fn dnf(&self) -> Result<Vec<Conjunction>> {
        match self {
            Pattern::Stmt(s) => Ok(vec![Conjunction {
                statements: vec![s.clone()],
                negations: Vec::new(),
            }]),
            Pattern::Or(ps) => {
                let mut out = Vec::new();
                for p in ps {
                    out.extend(p.dnf()?);
                }
                Ok(out)
            }
            Pattern::And(ps) => {
                let mut out = vec![Conjunction::default()];
                for p in ps {
                    let branches = p.dnf()?;
                    let mut next = Vec::new();
                    for acc in &out {
                        for b in &branches {
                            next.push(acc.clone().merge(b.clone()));
                        }
                    }
                    out = next;
                }
                Ok(out)
            }
            Pattern::Not(inner) => {
                let inner = inner.dnf()?;
                if inner.len() != 1 {
                    return Err(err("negation must wrap a conjunction, not a disjunction"));
                }
                let inner = &inner[0];
                if !inner.negations.is_empty() {
                    return Err(err("negation must not nest another negation"));
                }
                Ok(vec![Conjunction {
                    statements: Vec::new(),
                    negations: vec![inner.statements.clone()],
                }])
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PlaysDecl {
    pub required: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    Entity,
    Relation,
    Attribute(Datatype),
    Role,
}

// One `x sub y, plays p, relates r, key k` item of a define query,
// flattened. Role types are declared implicitly by `relates` but may also
// be declared explicitly to set a super-role or abstractness.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TypeDecl {
    pub label: String,
    pub kind: TypeKind,
    pub sup: Option<String>,
    pub is_abstract: bool,
    pub plays: Vec<(String, PlaysDecl)>,
    pub relates: Vec<String>,
    pub keys: Vec<String>,
    pub owns: Vec<String>,
}

impl TypeDecl {
    pub fn new(label: impl Into<String>, kind: TypeKind) -> TypeDecl {
        TypeDecl {
            label: label.into(),
            kind,
            sup: None,
            is_abstract: false,
            plays: Vec::new(),
            relates: Vec::new(),
            keys: Vec::new(),
            owns: Vec::new(),
        }
    }
    pub fn entity(label: impl Into<String>) -> TypeDecl {
        TypeDecl::new(label, TypeKind::Entity)
    }
    pub fn relation(label: impl Into<String>) -> TypeDecl {
        TypeDecl::new(label, TypeKind::Relation)
    }
    pub fn attribute(label: impl Into<String>, datatype: Datatype) -> TypeDecl {
        TypeDecl::new(label, TypeKind::Attribute(datatype))
    }
    pub fn role(label: impl Into<String>) -> TypeDecl {
        TypeDecl::new(label, TypeKind::Role)
    }
    pub fn sub(mut self, sup: impl Into<String>) -> TypeDecl {
        self.sup = Some(sup.into());
        self
    }
    pub fn abstract_type(mut self) -> TypeDecl {
        self.is_abstract = true;
        self
    }
    pub fn plays(mut self, role: impl Into<String>) -> TypeDecl {
        self.plays.push((role.into(), PlaysDecl { required: false }));
        self
    }
    pub fn plays_required(mut self, role: impl Into<String>) -> TypeDecl {
        self.plays.push((role.into(), PlaysDecl { required: true }));
        self
    }
    pub fn relates(mut self, role: impl Into<String>) -> TypeDecl {
        self.relates.push(role.into());
        self
    }
    pub fn key(mut self, attr: impl Into<String>) -> TypeDecl {
        self.keys.push(attr.into());
        self
    }
    pub fn owns(mut self, attr: impl Into<String>) -> TypeDecl {
        self.owns.push(attr.into());
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RuleDecl {
    pub label: String,
    pub when: Pattern,
    pub then: Pattern,
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum DefineItem {
    Type(TypeDecl),
    Rule(RuleDecl),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Aggregate {
    Count,
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Query {
    Define(Vec<DefineItem>),
    Insert(Vec<Statement>),
    Get {
        patterns: Vec<Statement>,
        // Empty means "all bound variables".
        vars: Vec<Var>,
    },
    Delete {
        patterns: Vec<Statement>,
        delete: Vec<Var>,
    },
    Aggregate {
        patterns: Vec<Statement>,
        aggregate: Aggregate,
    },
}

// The parser is a collaborator, not part of the core: something that turns
// query text into the AST above.
pub trait QueryParser: Send + Sync {
    fn parse(&self, source: &str) -> Result<Query>;
}
