pub mod generate_key;
pub mod serve;
