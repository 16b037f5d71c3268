use crate::error::MaviError;

pub type MaviResult<T> = Result<T, MaviError>;
