pub use log::*;

use once_cell::sync::OnceCell;

static LOGGER: Logger = Logger;
static TEST_LOGGER: OnceCell<()> = OnceCell::new();

pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    set_logger(&LOGGER).map(|()| set_max_level(level))
}

// Installs the logger once per test binary. The level comes from `MM_LOG`
// (e.g. `MM_LOG=trace`) and defaults to warnings only.
pub fn init_for_test() {
    TEST_LOGGER.get_or_init(|| {
        let level = std::env::var("MM_LOG")
            .ok()
            .and_then(|s| s.parse::<LevelFilter>().ok())
            .unwrap_or(LevelFilter::Warn);
        // another test harness may have installed its own logger already
        let _ = init(level);
    });
}

#[derive(Copy, Clone)]
struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{} {}] {}", record.level(), record.target(), record.args());
        }
    }
    fn flush(&self) {}
}
