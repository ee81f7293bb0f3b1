pub mod dummy;
pub mod rocks;
