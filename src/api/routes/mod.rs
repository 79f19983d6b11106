pub mod health;
pub mod vars;
