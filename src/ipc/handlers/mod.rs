pub mod academics;
pub mod accounts;
pub mod bundles;
pub mod core;
pub mod curriculum;
pub mod notifications;
pub mod presence;
pub mod requests;
pub mod students;
