pub mod error;
pub mod rational;
pub mod si5351;

pub use error::ClockError;
pub use rational::{rational_approximation, Rational};
pub use si5351::{ClockProgram, Multisynth, RegisterBus, RegisterWrite};
