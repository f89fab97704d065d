pub mod health;
pub mod history;
pub mod machines;
pub mod tasks;
