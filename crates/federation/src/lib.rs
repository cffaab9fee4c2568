pub mod config;
pub mod logic;
pub mod router;
pub mod service;

#[cfg(test)]
pub mod test;
