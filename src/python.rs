//! Python bindings (feature `python`).

use std::time::Instant;

use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use serde::Serialize;

use crate::config::DriverConfig;
use crate::errors::DriverError;
use crate::logging;
use crate::session::Session;
use crate::sim::SimBackend;
use crate::transport::{Backend, SerialBackend};

fn to_py_err(e: DriverError) -> PyErr {
    match e {
        DriverError::Io(_) | DriverError::Serial(_) => PyIOError::new_err(e.to_string()),
        DriverError::NotConnected => PyConnectionError::new_err(e.to_string()),
        DriverError::Config(_) | DriverError::EmptyCommand => PyValueError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

/// Serialize through `json.loads` so Python gets plain dicts and lists.
fn to_py<'py, T: Serialize>(py: Python<'py>, value: &T) -> PyResult<Bound<'py, PyAny>> {
    let text = serde_json::to_string(value).map_err(|e| PyValueError::new_err(e.to_string()))?;
    py.import("json")?.call_method1("loads", (text,))
}

/// A driver session for one serial device.
///
/// Nothing happens in the background: call `tick()` regularly (every 10 ms
/// is plenty) to run link checks, sampling and calibration.
///
/// Example:
///     >>> s = Session(simulate=True)
///     >>> s.tick()
///     >>> s.start()
///     >>> s.tick(); s.active_segment(0)
#[pyclass(name = "Session", unsendable)]
struct PySession {
    inner: Session<Box<dyn Backend>>,
}

#[pymethods]
impl PySession {
    /// Create a session.
    ///
    /// Args:
    ///     port: Port to use instead of the first one discovered.
    ///     simulate: Use an in-memory simulated device instead of real ports.
    ///     config: Path to a JSON configuration file.
    ///
    /// Raises:
    ///     ValueError: If the configuration is invalid
    #[new]
    #[pyo3(signature = (port=None, simulate=false, config=None))]
    fn new(port: Option<&str>, simulate: bool, config: Option<&str>) -> PyResult<Self> {
        let config = match config {
            Some(path) => DriverConfig::from_json_file(path).map_err(to_py_err)?,
            None => DriverConfig::default(),
        };
        let backend: Box<dyn Backend> = if simulate {
            let sim = SimBackend::new();
            sim.plug("sim0", "Simulated device").animate();
            Box::new(sim)
        } else {
            Box::new(SerialBackend::from_config(&config))
        };
        let mut inner = Session::new(backend, config).map_err(to_py_err)?;
        if let Some(port) = port {
            inner
                .select_port(port, Instant::now())
                .map_err(to_py_err)?;
        }
        Ok(Self { inner })
    }

    /// Run whatever is due now.
    fn tick(&mut self) {
        self.inner.tick(Instant::now());
    }

    /// Seconds until the next tick has work to do, or None when idle.
    fn next_wakeup(&self) -> Option<f64> {
        self.inner
            .next_wakeup()
            .map(|w| w.saturating_duration_since(Instant::now()).as_secs_f64())
    }

    /// Start recording a new segment.
    ///
    /// Raises:
    ///     ConnectionError: If the link is not OK
    ///     RuntimeError: If already running
    fn start(&mut self) -> PyResult<()> {
        self.inner.start(Instant::now()).map_err(to_py_err)
    }

    fn stop(&mut self) -> PyResult<()> {
        self.inner.stop().map_err(to_py_err)
    }

    /// Drop all recorded data. Only allowed when stopped or halted.
    fn clear(&mut self) -> PyResult<()> {
        self.inner.clear().map_err(to_py_err)
    }

    fn select_port(&mut self, port: &str) -> PyResult<()> {
        self.inner
            .select_port(port, Instant::now())
            .map_err(to_py_err)
    }

    /// Include or exclude a channel. Not allowed while running.
    fn set_channel(&mut self, index: usize, on: bool) -> PyResult<()> {
        self.inner
            .set_channel_selected(index, on)
            .map_err(to_py_err)
    }

    /// Send a raw command line and wait for the reply.
    ///
    /// Returns:
    ///     (kind, lines) where kind is "ERROR", "WARN", "INFO" or "GENERIC".
    fn send_command(&mut self, text: &str) -> PyResult<(String, Vec<String>)> {
        let reply = self
            .inner
            .send_user_command(text, Instant::now())
            .map_err(to_py_err)?;
        Ok((reply.kind.label().to_string(), reply.reply.lines))
    }

    #[getter]
    fn serial_state(&self) -> String {
        self.inner.serial_state().to_string()
    }

    #[getter]
    fn acquisition_state(&self) -> String {
        self.inner.acquisition_state().to_string()
    }

    #[getter]
    fn port(&self) -> Option<String> {
        self.inner.selected_port().map(str::to_string)
    }

    /// Discovered ports as (name, description) tuples.
    #[getter]
    fn ports(&self) -> Vec<(String, String)> {
        self.inner
            .ports()
            .iter()
            .map(|p| (p.name.clone(), p.description.clone()))
            .collect()
    }

    #[getter]
    fn voltage_ceiling(&self) -> f64 {
        self.inner.voltage_ceiling()
    }

    #[getter]
    fn selection(&self) -> Vec<bool> {
        self.inner.selection().to_vec()
    }

    /// Samples of the current segment of one channel as (t, v) tuples.
    ///
    /// Raises:
    ///     ValueError: If the channel index is out of range
    fn active_segment(&self, index: usize) -> PyResult<Vec<(f64, f64)>> {
        self.inner
            .active_segment(index)
            .map(|segment| segment.iter().map(|s| (s.t, s.v)).collect())
            .ok_or_else(|| PyValueError::new_err(format!("no channel {index}")))
    }

    /// Sampling counters as a dict.
    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        to_py(py, &self.inner.stats())
    }

    /// Full state as nested dicts.
    fn snapshot<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        to_py(py, &self.inner.snapshot(Instant::now()))
    }

    /// Events since the last call, as dicts with an "event" key.
    fn drain_events<'py>(&mut self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        to_py(py, &self.inner.drain_events())
    }

    /// Stop recording and close the port.
    fn close(&mut self) {
        self.inner.shutdown();
    }

    fn __repr__(&self) -> String {
        format!(
            "Session(port={:?}, serial={}, acquisition={})",
            self.inner.selected_port(),
            self.inner.serial_state(),
            self.inner.acquisition_state()
        )
    }
}

/// Forward Rust logs to Python's `logging`, optionally at a fixed level.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::init_python_logging(py)?;
    if level.is_some() {
        logging::set_python_log_level_str(py, level)?;
    }
    Ok(())
}

#[pymodule]
fn analog_serial(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySession>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add("BAUD_RATE", crate::config::BAUD_RATE)?;
    Ok(())
}
