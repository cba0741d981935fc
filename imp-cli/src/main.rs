//! impedance - run one measurement on a Sciospec ISX-3 or LCR-1
//!
//! Usage: `impedance [--simulate] [SETTINGS.json]`
//!        `impedance --init [SETTINGS.json]`

mod settings;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use imp_protocol::{Instrument, ValidationError};
use imp_session::{
    CsvSink, DeviceSession, LcrReading, LcrSession, ResultSink, SessionError, SessionState,
};
use imp_sim::{run_virtual_analyzer, run_virtual_lcr, VirtualAnalyzer, VirtualLcrMeter};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settings::Settings;

/// Header of the LCR-1 output file
const LCR_CSV_HEADER: &str = "Frequency,Run,Primary,Secondary";

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Settings(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("invalid parameter: {0}")]
    Validation(#[from] ValidationError),

    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed command line
#[derive(Debug, Default, PartialEq)]
struct Args {
    settings: Option<PathBuf>,
    simulate: bool,
    init: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, CliError> {
    let mut parsed = Args::default();
    for arg in args {
        match arg.as_str() {
            "--simulate" => parsed.simulate = true,
            "--init" => parsed.init = true,
            flag if flag.starts_with("--") => {
                return Err(CliError::Usage(format!("unknown option {}", flag)));
            }
            path if parsed.settings.is_none() => parsed.settings = Some(PathBuf::from(path)),
            extra => return Err(CliError::Usage(format!("unexpected argument {}", extra))),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "impedance=info,imp_protocol=info,imp_session=info,imp_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), CliError> {
    let args = parse_args(std::env::args().skip(1))?;

    if args.init {
        let path = match args.settings {
            Some(path) => path,
            None => Settings::default_path()
                .ok_or_else(|| CliError::Settings("Could not determine settings path".into()))?,
        };
        Settings::default().save(&path).map_err(CliError::Settings)?;
        info!("Wrote default settings to {}", path.display());
        return Ok(());
    }

    let settings = Settings::load(args.settings.as_deref()).map_err(CliError::Settings)?;
    let simulate = args.simulate || settings.simulated;
    info!(
        "Measuring with {}{}",
        settings.instrument.name(),
        if simulate { " (simulated)" } else { "" }
    );

    match (settings.instrument, simulate) {
        (Instrument::Isx3, false) => {
            let mut session = DeviceSession::new(settings.session.clone());
            session.connect(&settings.serial).await?;
            measure_isx3(&mut session, &settings).await
        }
        (Instrument::Isx3, true) => {
            let (host, device) = tokio::io::duplex(8192);
            let (_cmd_tx, cmd_rx) = mpsc::channel(1);
            tokio::spawn(run_virtual_analyzer(device, VirtualAnalyzer::default(), cmd_rx));

            let mut session = DeviceSession::new(settings.session.clone());
            session.connect_with(host).await?;
            measure_isx3(&mut session, &settings).await
        }
        (Instrument::Lcr1, false) => {
            let mut session =
                LcrSession::connect(&settings.serial, settings.session.command_timeout()).await?;
            measure_lcr(&mut session, &settings).await
        }
        (Instrument::Lcr1, true) => {
            let (host, device) = tokio::io::duplex(4096);
            let (_cmd_tx, cmd_rx) = mpsc::channel(1);
            tokio::spawn(run_virtual_lcr(device, VirtualLcrMeter::default(), cmd_rx));

            let mut session =
                LcrSession::connect_with(host, settings.session.command_timeout()).await?;
            measure_lcr(&mut session, &settings).await
        }
    }
}

fn create_output(path: &Path) -> Result<BufWriter<File>, CliError> {
    let file = File::create(path)?;
    Ok(BufWriter::new(file))
}

async fn measure_isx3<T>(session: &mut DeviceSession<T>, settings: &Settings) -> Result<(), CliError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let frontend = &settings.frontend;
    session
        .configure_frontend(
            frontend.points,
            &frontend.channel,
            &frontend.current_range,
            &frontend.voltage_range,
        )
        .await?;
    session.set_setup(settings.sweep.to_spec()?).await?;

    let mut sink = CsvSink::new(create_output(&settings.output)?);
    let stop = session.start_measurement(settings.spectra).await?;

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping measurement");
            stop.stop();
        }
    });
    let drained = session.measurements()?.drain_into(&mut sink).await;
    interrupt.abort();
    let summary = drained?;

    let mut late = 0;
    if session.state() == SessionState::Measuring {
        for point in session.stop_measurement().await? {
            sink.accept(&point)?;
            late += 1;
        }
    }
    sink.into_inner()?.flush()?;

    info!(
        "Wrote {} points to {} ({} dropped frames)",
        summary.points + late,
        settings.output.display(),
        summary.errors
    );

    if settings.reset_after {
        session.reset().await?;
    }
    session.disconnect()?;
    Ok(())
}

async fn measure_lcr<T>(session: &mut LcrSession<T>, settings: &Settings) -> Result<(), CliError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    session.reset().await?;
    session.configure(&settings.lcr).await?;

    let spec = settings.sweep.to_spec()?;
    let readings = session.sweep(&spec, settings.runs).await?;

    let mut out = create_output(&settings.output)?;
    write_lcr_csv(&mut out, &readings)?;
    out.flush()?;

    info!(
        "Wrote {} readings to {}",
        readings.len(),
        settings.output.display()
    );
    Ok(())
}

fn write_lcr_csv<W: Write>(out: &mut W, readings: &[LcrReading]) -> std::io::Result<()> {
    writeln!(out, "{}", LCR_CSV_HEADER)?;
    for reading in readings {
        writeln!(
            out,
            "{},{},{},{}",
            reading.frequency_hz, reading.run, reading.first, reading.second
        )?;
    }
    Ok(())
}
