pub mod links;
pub mod meta;
pub mod product;
