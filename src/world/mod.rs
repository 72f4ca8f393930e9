pub mod grid;
pub mod position;
pub mod region;
