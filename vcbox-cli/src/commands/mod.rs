pub mod create;
pub mod delete;
pub mod events;
pub mod lifecycle;
pub mod list;
pub mod ps;
pub mod state;
