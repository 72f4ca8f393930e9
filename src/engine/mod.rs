pub mod budget;
pub mod context;
pub mod executor;
pub mod lease;
pub mod precompute;
pub mod scheduler;
pub mod template;
