pub mod engine;
pub mod pool;
pub mod room;
pub mod sidebook;
pub mod types;

pub use engine::MatchEngine;
pub use pool::RoomPool;
pub use room::SymbolRoom;
pub use types::{MatchError, Side};
