pub mod memory;

pub use memory::{Accountant, CommitAccounting, OvercommitPolicy};

pub trait Context {
    fn accountant(&self) -> &dyn Accountant;
}
