mod bridge;
mod connection;
mod listen;
mod restart;

pub use bridge::*;
pub use connection::*;
pub use listen::*;
pub use restart::*;
