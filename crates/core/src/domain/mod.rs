pub mod chunk;
pub mod collection;
pub mod session;
pub mod tool;
