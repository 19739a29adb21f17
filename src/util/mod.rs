pub mod coding;
pub mod ring;
