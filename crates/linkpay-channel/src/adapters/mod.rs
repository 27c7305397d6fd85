pub mod memory;

pub use memory::{CounterpartyBehaviour, DepositBehaviour, InMemoryChannelEngine};
