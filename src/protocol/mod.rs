pub mod layout;
pub mod parser;
pub mod types;
