use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `ANALOG_SERIAL_LOG`, then `RUST_LOG`, defaulting to info.
pub fn env_level() -> LevelFilter {
    std::env::var("ANALOG_SERIAL_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

pub fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize stderr logging for the binary. `override_level` wins over the
/// environment. Only the first call has an effect.
pub fn init_rust_logging(override_level: Option<LevelFilter>) {
    let level = override_level.unwrap_or_else(env_level);
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use python_bridge::{init_python_logging, set_python_log_level, set_python_log_level_str};

/// Forwards `log` records into Python's `logging` module.
#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once, PoisonError};

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        // target -> (effective level, logger)
        cache: Mutex<HashMap<String, (LevelFilter, Py<PyAny>)>>,
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            let logging = py.import("logging")?;
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: logging.into(),
                cache: Mutex::new(HashMap::new()),
            })
        }

        fn top(&self) -> LevelFilter {
            *self.top_filter.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn py_level(level: log::Level) -> usize {
            match level {
                log::Level::Error => 40,
                log::Level::Warn => 30,
                log::Level::Info => 20,
                log::Level::Debug => 10,
                log::Level::Trace => 5,
            }
        }

        fn effective_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            use log::Level::*;
            for l in [Trace, Debug, Info, Warn, Error] {
                if logger
                    .call_method1("isEnabledFor", (Self::py_level(l),))?
                    .is_truthy()?
                {
                    return Ok(l.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((level, logger)) = cache.get(target) {
                return Ok((*level, logger.clone_ref(py)));
            }
            let logger = self
                .logging_mod
                .bind(py)
                .getattr("getLogger")?
                .call1((target,))?;
            let level = Self::effective_level(&logger)?;
            let logger = logger.unbind();
            cache.insert(target.to_string(), (level, logger.clone_ref(py)));
            Ok((level, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (enabled, logger) = self.logger_for(py, &target)?;
            let level = record.level().to_level_filter();
            if level > enabled || level > self.top() {
                return Ok(());
            }
            let logger = logger.bind(py);
            let none = py.None();
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    Self::py_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.top()
        }

        fn log(&self, record: &Record) {
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Only the first call installs
    /// the bridge.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => e.restore(py),
        });
        Ok(())
    }

    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            *logger.top_filter.lock().unwrap_or_else(PoisonError::into_inner) = level;
            // effective levels may have changed on the Python side too
            logger
                .cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        log::set_max_level(level);
        Ok(())
    }

    /// Parse a level name (falling back to the environment) and apply it.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = parse_level(level).unwrap_or_else(env_level);
        set_python_log_level(py, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level(Some("debug")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some("WARN")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
    }

    #[test]
    fn level_names_round_trip() {
        for level in LevelFilter::iter() {
            assert_eq!(parse_level(Some(level_to_str(level))), Some(level));
        }
    }

    #[test]
    fn init_is_idempotent() {
        init_rust_logging(Some(LevelFilter::Warn));
        init_rust_logging(None);
    }
}
