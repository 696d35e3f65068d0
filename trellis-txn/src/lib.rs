mod executor;
mod rules;
mod transaction;
mod validator;

#[cfg(test)]
mod test;

pub use executor::Answer;
pub use transaction::{
    AttributeIndex, ConceptMap, Transaction, TxContext, TxHandle, TxMode,
};
