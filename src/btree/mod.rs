pub mod bulk_load;
pub mod cursor;
pub mod page;
pub mod serializer;
pub mod tree;
