pub mod debug;
pub mod list;
