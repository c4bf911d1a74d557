use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::exit;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use analog_serial::logging::{init_rust_logging, parse_level};
use analog_serial::{
    runner, Backend, DriverConfig, SerialBackend, SerialState, Session, SessionEvent, SimBackend,
};

#[derive(Parser, Debug)]
#[command(
    name = "analog-serial",
    about = "Poll analog channels of a line-protocol device over serial"
)]
struct Args {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Baud rate (overrides the configuration)
    #[arg(long, global = true)]
    baud: Option<u32>,
    /// Talk to a simulated device instead of real ports
    #[arg(long, global = true)]
    simulate: bool,
    /// Log level: off, error, warn, info, debug, trace
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List serial ports
    Ports,
    /// Send one command line and print the reply
    Send {
        /// e.g. "defget(TRUE_VOLTAGE)"
        command: String,
        #[arg(long)]
        port: Option<String>,
    },
    /// Record channels and print samples as they arrive
    Monitor {
        #[arg(long)]
        port: Option<String>,
        /// Channels to record, e.g. 0,2
        #[arg(long, value_delimiter = ',')]
        channels: Option<Vec<usize>>,
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        duration: Option<f64>,
        /// Print one JSON snapshot per second instead of samples
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_rust_logging(parse_level(args.log_level.as_deref()));

    let mut config = match &args.config {
        Some(path) => DriverConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DriverConfig::default(),
    };
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    let backend = make_backend(args.simulate, &config);

    match args.command {
        Cmd::Ports => list_ports(backend.as_ref()),
        Cmd::Send { command, port } => send(backend, config, port.as_deref(), &command),
        Cmd::Monitor {
            port,
            channels,
            duration,
            json,
        } => {
            if let Some(channels) = &channels {
                config.select_only(channels)?;
            }
            let duration = duration
                .map(Duration::try_from_secs_f64)
                .transpose()
                .context("invalid --duration")?;
            monitor(backend, config, port.as_deref(), duration, json)
        }
    }
}

fn make_backend(simulate: bool, config: &DriverConfig) -> Box<dyn Backend> {
    if simulate {
        let sim = SimBackend::new();
        sim.plug("sim0", "Simulated device")
            .set_banner(&["INFO: simulated device ready"])
            .animate();
        Box::new(sim)
    } else {
        Box::new(SerialBackend::from_config(config))
    }
}

fn list_ports(backend: &dyn Backend) -> Result<()> {
    let ports = backend.available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

/// Open a session and connect it, to `port` or to the first port found.
fn connect(
    backend: Box<dyn Backend>,
    config: DriverConfig,
    port: Option<&str>,
) -> Result<Session<Box<dyn Backend>>> {
    let mut session = Session::new(backend, config)?;
    let now = Instant::now();
    match port {
        Some(port) => session.select_port(port, now)?,
        None => session.tick(now),
    }
    match session.serial_state() {
        SerialState::Ok => {
            println!("Connected to {}", session.selected_port().unwrap_or("?"));
            for line in &session.banner().lines {
                println!("< {line}");
            }
            Ok(session)
        }
        SerialState::None => bail!("no serial ports found"),
        state => bail!(
            "could not connect to {} (state {})",
            session.selected_port().unwrap_or("?"),
            state
        ),
    }
}

fn send(
    backend: Box<dyn Backend>,
    config: DriverConfig,
    port: Option<&str>,
    command: &str,
) -> Result<()> {
    let mut session = connect(backend, config, port)?;
    let reply = session.send_user_command(command, Instant::now())?;
    println!("[{}] {}", reply.kind.label(), reply.command);
    for line in &reply.reply.lines {
        println!("{line}");
    }
    if reply.true_voltage.is_some() {
        println!("Voltage ceiling: {:.3} V", session.voltage_ceiling());
    }
    session.shutdown();
    Ok(())
}

fn monitor(
    backend: Box<dyn Backend>,
    config: DriverConfig,
    port: Option<&str>,
    duration: Option<Duration>,
    json: bool,
) -> Result<()> {
    let mut session = connect(backend, config, port)?;
    session.start(Instant::now())?;
    let deadline = duration.map(|d| Instant::now() + d);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let mut printed = 0usize;
    let mut last_snapshot: Option<Instant> = None;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    runtime.block_on(runner::run_until(&mut session, shutdown, |s| {
        let now = Instant::now();
        for event in s.drain_events() {
            if json {
                if let Ok(text) = serde_json::to_string(&event) {
                    println!("{text}");
                }
            } else {
                eprintln!("* {}", describe(&event));
            }
        }
        if json {
            if last_snapshot.map_or(true, |t| now.duration_since(t) >= Duration::from_secs(1)) {
                if let Ok(text) = serde_json::to_string(&s.snapshot(now)) {
                    println!("{text}");
                }
                last_snapshot = Some(now);
            }
        } else {
            print_new_samples(s, &mut printed);
        }
        match deadline {
            Some(d) if now >= d => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }));

    session.shutdown();
    let stats = session.stats();
    eprintln!(
        "Samples: {}, empty: {}, malformed: {}, transport errors: {}, deferred: {}",
        stats.samples,
        stats.empty_replies,
        stats.malformed_replies,
        stats.transport_errors,
        stats.skipped_busy
    );
    Ok(())
}

/// Print rows of the active segment that were not printed yet.
fn print_new_samples<B: Backend>(session: &Session<B>, printed: &mut usize) {
    let refs: Vec<usize> = session
        .selection()
        .iter()
        .enumerate()
        .filter_map(|(i, &on)| on.then_some(i))
        .collect();
    let Some(&first) = refs.first() else {
        return;
    };
    let len = session.active_segment(first).map_or(0, <[_]>::len);
    if len < *printed {
        // a new segment was opened
        *printed = 0;
    }
    for row in *printed..len {
        let mut line = String::new();
        for &channel in &refs {
            let Some(sample) = session.active_segment(channel).and_then(|seg| seg.get(row)) else {
                continue;
            };
            if line.is_empty() {
                line.push_str(&format!("t={:8.3}", sample.t));
            }
            line.push_str(&format!("  ch{channel}={:.3}", sample.v));
        }
        println!("{line}");
    }
    *printed = len;
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::PortSelected { port } => format!("port selected: {port}"),
        SessionEvent::Connected { port, .. } => format!("connected: {port}"),
        SessionEvent::ConnectFailed { port } => format!("cannot open {port}"),
        SessionEvent::Disconnected { port } => format!("disconnected: {port}"),
        SessionEvent::AcquisitionHalted => "acquisition halted until the device is back".into(),
        SessionEvent::AcquisitionResumed => "acquisition resumed".into(),
        SessionEvent::CalibrationUpdated { ceiling, .. } => {
            format!("voltage ceiling: {ceiling:.3} V")
        }
        SessionEvent::TickFailed { tick, reason } => format!("{tick:?} tick failed: {reason}"),
    }
}
