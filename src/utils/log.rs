use std::{io::Write, sync::Once};

static INIT: Once = Once::new();

/// Set up the logger. Safe to call from every test, only the first call
/// has an effect.
pub fn init_log() {
    INIT.call_once(|| {
        use env_logger::Builder;

        let mut builder = Builder::from_default_env();

        builder
            .format_timestamp_secs()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} - {}] [{}:{}] {}",
                    record.level(),
                    record.target(),
                    record.file().unwrap_or("?"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            })
            .init();
    });
}
