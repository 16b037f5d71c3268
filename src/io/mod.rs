mod file;
mod serialize;

pub use file::MaviFile;
pub use serialize::{MaviReader, MaviWriter};
