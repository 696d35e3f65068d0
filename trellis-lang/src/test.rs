use test_log::test;

use crate::{Comparator, Pattern, Statement, Value, Var};

fn isa(var: &str, label: &str) -> Pattern {
    Pattern::Stmt(Statement::Isa {
        var: Var::new(var),
        label: label.to_string(),
    })
}

#[test]
fn test_dnf_distributes_and_over_or() {
    let p = Pattern::And(vec![
        isa("x", "person"),
        Pattern::Or(vec![isa("y", "cat"), isa("y", "dog")]),
    ]);
    let dnf = p.dnf().unwrap();
    assert_eq!(dnf.len(), 2);
    assert_eq!(dnf[0].statements.len(), 2);
    assert_eq!(dnf[1].statements.len(), 2);
}

#[test]
fn test_dnf_lifts_negation() {
    let p = Pattern::And(vec![
        isa("x", "person"),
        Pattern::Not(Box::new(Pattern::And(vec![isa("x", "robot")]))),
    ]);
    let dnf = p.dnf().unwrap();
    assert_eq!(dnf.len(), 1);
    assert_eq!(dnf[0].statements.len(), 1);
    assert_eq!(dnf[0].negations.len(), 1);
    assert_eq!(dnf[0].negations[0].len(), 1);
}

#[test]
fn test_dnf_rejects_disjunction_under_negation() {
    let p = Pattern::Not(Box::new(Pattern::Or(vec![
        isa("x", "cat"),
        isa("x", "dog"),
    ])));
    assert!(p.dnf().is_err());

    let p = Pattern::Not(Box::new(Pattern::Not(Box::new(isa("x", "cat")))));
    assert!(p.dnf().is_err());
}

#[test]
fn test_numeric_comparison_spans_datatypes() {
    assert!(Comparator::Gt.test(&Value::from(10.0), &Value::from(0i64)));
    assert!(Comparator::Lte.test(&Value::from(0i64), &Value::from(0.0)));
    assert!(!Comparator::Eq.test(&Value::from("10"), &Value::from(10i64)));
}

#[test]
fn test_float_values_are_ordered_and_hashable() {
    let a = Value::from(1.5);
    let b = Value::from(2.5);
    assert!(a < b);
    let mut set = std::collections::BTreeSet::new();
    set.insert(a.clone());
    set.insert(a);
    assert_eq!(set.len(), 1);
}
