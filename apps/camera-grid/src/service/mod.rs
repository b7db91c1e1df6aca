pub mod signals;

pub use signals::{wait_for_shutdown, SignalType};
