pub mod params;
pub mod script;
pub mod types;
