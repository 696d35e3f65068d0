mod config;
mod server;
mod session;

#[cfg(test)]
mod test;

pub use config::Config;
pub use server::Server;
pub use session::{Session, TransactionBuilder};
