pub mod watchdog;

pub use watchdog::Watchdog;
