pub mod accounts;
pub mod health;
pub mod jobs;
pub mod rules;
