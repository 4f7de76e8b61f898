pub mod decisions;
pub mod desired;
pub mod status;
pub mod wake;
