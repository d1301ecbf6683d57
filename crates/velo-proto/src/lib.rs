pub mod clock;
pub mod wire;
