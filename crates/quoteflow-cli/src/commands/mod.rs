pub mod add;
pub mod common;
pub mod delete;
pub mod doctor;
pub mod list;
pub mod status;
pub mod sync;
