pub mod aggregate;
pub mod panel;
pub mod state;
