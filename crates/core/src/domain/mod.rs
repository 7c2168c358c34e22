pub mod context;
pub mod conversation;
pub mod hitl;
pub mod io;
