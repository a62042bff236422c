pub mod classify;
pub mod inspect;
pub mod master_dark;
pub mod stack;

pub use classify::classify_frames;
pub use inspect::inspect;
pub use master_dark::master_dark;
pub use stack::stack;
