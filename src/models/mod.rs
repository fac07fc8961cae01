pub mod account;
pub mod order;

pub use account::{Account, Position};
pub use order::{Execution, Order, OrderStatus};
