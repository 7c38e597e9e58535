#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod pages;
pub mod structure;

pub use pages::{load_pages, parse_pages};
pub use structure::{load_structure, parse_structure};
