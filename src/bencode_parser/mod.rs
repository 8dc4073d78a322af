pub mod errors;
pub mod parser;
