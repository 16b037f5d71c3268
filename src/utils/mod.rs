mod lock;
mod log;
mod number;

pub use self::log::init_log;
pub use lock::HandyRwLock;
pub use number::{ceil_div, floor_div};
