pub mod adapter;
pub mod groups;
pub mod health;
pub mod tasks;
pub mod workflows;
