pub mod json;
pub mod tags;
