pub mod discovery;
pub mod health;
pub mod proxy;
pub mod resolver;
pub mod status;
pub mod targets;
