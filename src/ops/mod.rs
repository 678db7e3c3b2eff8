pub mod filters;
pub mod transform;
