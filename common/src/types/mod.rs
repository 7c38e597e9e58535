pub mod keyword;
pub mod page;
pub mod passage;
