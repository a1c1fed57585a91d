use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imu_link::domain::models::{
    CompositeFrame, FrameProfile, SensorChannel, SensorFrame, ServeModel,
};
use imu_link::domain::settings::{Settings, SettingsService};
use imu_link::infrastructure::logging::init_logger;
use imu_link::infrastructure::radio::simulated::SimulatedRadio;
use imu_link::infrastructure::sensor::{MotionSensor, SensorSource};
use imu_link::link::{
    AsyncCentral, AsyncPeripheral, BlockingCentral, BlockingPeripheral, CentralConfig,
    PeripheralConfig, StopHandle,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

/// Address the in-process peripheral advertises under.
const LOCAL_ADDRESS: &str = "B8:27:EB:00:00:01";

#[derive(Parser)]
#[command(name = "imu-link", version, about = "IMU telemetry over BLE GATT")]
struct Cli {
    /// Settings file; defaults to the per-user config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run the cooperative (tokio) sessions instead of the blocking ones
    #[arg(long = "async", global = true)]
    use_async: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Advertise the synthetic IMU and serve it until Ctrl-C
    Peripheral {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Connect to the IMU and poll it
    Central {
        #[arg(long, default_value_t = 10)]
        samples: u32,
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
        /// Do not start the in-process peer (exercises the retry path)
        #[arg(long)]
        no_peer: bool,
    },
    /// Serve with periodic notifications and print what a subscriber gets
    Loopback {
        #[arg(long, default_value_t = 10)]
        samples: u32,
    },
}

enum Sample {
    Channel(SensorChannel, SensorFrame),
    Composite(CompositeFrame),
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sample::Channel(channel, frame) => write!(f, "{:<5} {}", channel, frame),
            Sample::Composite(frame) => {
                for channel in SensorChannel::ALL {
                    let [x, y, z] = frame.channel(channel);
                    write!(f, "{}=({:.2}, {:.2}, {:.2}) ", channel, x, y, z)?;
                }
                Ok(())
            }
        }
    }
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    let service = match path {
        Some(path) => SettingsService::load_from(path),
        None => SettingsService::new()?,
    };
    Ok(service.get().clone())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config)?;
    let _log_guard = init_logger(&settings.log_settings)?;

    let runtime = Runtime::new().context("Failed to start tokio runtime")?;
    let stop = StopHandle::new();
    let on_signal = stop.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            on_signal.stop();
        }
    });

    let radio = Arc::new(SimulatedRadio::new(LOCAL_ADDRESS));
    info!(
        "Starting imu-link ({} sessions, {:?} profile)",
        if cli.use_async { "cooperative" } else { "blocking" },
        settings.link.profile
    );

    let result = match cli.command {
        Command::Peripheral { duration } => {
            if let Some(secs) = duration {
                let timer = stop.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    timer.stop();
                });
            }
            run_peripheral(&runtime, radio, &settings, cli.use_async, stop)
        }
        Command::Central {
            samples,
            interval_ms,
            no_peer,
        } => run_central(
            &runtime,
            radio,
            &settings,
            cli.use_async,
            &stop,
            Poll {
                samples,
                interval: Duration::from_millis(interval_ms),
                with_peer: !no_peer,
            },
        ),
        Command::Loopback { samples } => {
            run_loopback(&runtime, radio, &settings, cli.use_async, stop, samples)
        }
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn run_peripheral(
    runtime: &Runtime,
    radio: Arc<SimulatedRadio>,
    settings: &Settings,
    use_async: bool,
    stop: StopHandle,
) -> Result<()> {
    let sensor: Arc<dyn SensorSource> = Arc::new(MotionSensor::new());
    let config = PeripheralConfig::from_settings(settings);
    let descriptors = settings.link.descriptors();

    if use_async {
        runtime.block_on(async {
            let mut peripheral = AsyncPeripheral::cooperative(radio, config);
            peripheral.configure(sensor, descriptors).await?;
            peripheral
                .with_advertising(move |p| {
                    Box::pin(async move { p.serve_until(stop).await })
                })
                .await
        })?;
    } else {
        let mut peripheral = BlockingPeripheral::new(radio, config);
        peripheral.configure(sensor, descriptors)?;
        let mut advertising = peripheral.advertising()?;
        advertising.serve_until(stop)?;
    }
    Ok(())
}

struct Poll {
    samples: u32,
    interval: Duration,
    with_peer: bool,
}

fn run_central(
    runtime: &Runtime,
    radio: Arc<SimulatedRadio>,
    settings: &Settings,
    use_async: bool,
    stop: &StopHandle,
    poll: Poll,
) -> Result<()> {
    let mut peer = None;
    if poll.with_peer {
        let mut peripheral =
            BlockingPeripheral::new(radio.clone(), PeripheralConfig::from_settings(settings));
        peripheral.configure(Arc::new(MotionSensor::new()), settings.link.descriptors())?;
        peripheral.start()?;
        peer = Some(peripheral);
    }

    let config = CentralConfig::from_settings(settings);
    let profile = settings.link.profile;
    let result = if use_async {
        let stop = stop.clone();
        runtime.block_on(async {
            let mut central = AsyncCentral::cooperative(radio, config);
            central
                .with_connection(move |c| {
                    Box::pin(async move {
                        for sample in 0..poll.samples {
                            if stop.is_stopped() {
                                break;
                            }
                            match profile {
                                FrameProfile::PerChannelInt16 => {
                                    for channel in SensorChannel::ALL {
                                        let frame = c.read_sensor(channel).await?;
                                        let line = Sample::Channel(channel, frame);
                                        println!("#{:<4} {}", sample, line);
                                    }
                                }
                                FrameProfile::CompositeFloat32 => {
                                    let frame = c.read_composite().await?;
                                    println!("#{:<4} {}", sample, Sample::Composite(frame));
                                }
                            }
                            tokio::time::sleep(poll.interval).await;
                        }
                        Ok(())
                    })
                })
                .await?;
            anyhow::Ok(())
        })
    } else {
        let mut central = BlockingCentral::new(radio, config);
        poll_blocking(&mut central, profile, stop, &poll)
    };

    if let Some(mut peripheral) = peer {
        peripheral.stop();
    }
    result
}

fn poll_blocking(
    central: &mut BlockingCentral<SimulatedRadio>,
    profile: FrameProfile,
    stop: &StopHandle,
    poll: &Poll,
) -> Result<()> {
    let mut link = central.connection()?;
    for sample in 0..poll.samples {
        if stop.is_stopped() {
            break;
        }
        match profile {
            FrameProfile::PerChannelInt16 => {
                for channel in SensorChannel::ALL {
                    let frame = link.read_sensor(channel)?;
                    println!("#{:<4} {}", sample, Sample::Channel(channel, frame));
                }
            }
            FrameProfile::CompositeFloat32 => {
                let frame = link.read_composite()?;
                println!("#{:<4} {}", sample, Sample::Composite(frame));
            }
        }
        std::thread::sleep(poll.interval);
    }
    Ok(())
}

fn run_loopback(
    runtime: &Runtime,
    radio: Arc<SimulatedRadio>,
    settings: &Settings,
    use_async: bool,
    stop: StopHandle,
    samples: u32,
) -> Result<()> {
    let mut peripheral_config = PeripheralConfig::from_settings(settings);
    if peripheral_config.serve == ServeModel::OnDemand {
        warn!("Loopback needs notifications, switching to refresh mode");
        peripheral_config.serve = ServeModel::Refresh {
            interval: Duration::from_millis(settings.peripheral.update_interval_ms),
        };
    }
    let central_config = CentralConfig::from_settings(settings);
    let descriptors = settings.link.descriptors();
    let profile = settings.link.profile;
    let (tx, rx) = std::sync::mpsc::channel::<Sample>();

    if use_async {
        runtime.block_on(async {
            let mut peripheral = AsyncPeripheral::cooperative(radio.clone(), peripheral_config);
            peripheral
                .configure(Arc::new(MotionSensor::new()), descriptors)
                .await?;
            peripheral.start().await?;
            let serving = tokio::spawn({
                let stop = stop.clone();
                async move { peripheral.serve_until(stop).await }
            });

            let mut central = AsyncCentral::cooperative(radio, central_config);
            let reading = stop.clone();
            let received = central
                .with_connection(move |c| {
                    Box::pin(async move {
                        match profile {
                            FrameProfile::PerChannelInt16 => {
                                for channel in SensorChannel::ALL {
                                    let tx = tx.clone();
                                    c.subscribe_sensor(channel, move |frame| {
                                        let _ = tx.send(Sample::Channel(channel, frame));
                                    })
                                    .await?;
                                }
                            }
                            FrameProfile::CompositeFloat32 => {
                                c.subscribe_composite(move |frame| {
                                    let _ = tx.send(Sample::Composite(frame));
                                })
                                .await?;
                            }
                        }
                        Ok(tokio::task::block_in_place(|| {
                            print_samples(&rx, samples, &reading)
                        }))
                    })
                })
                .await;

            // The server stops whether or not the subscriber got anything.
            stop.stop();
            serving.await??;
            info!("Received {} notifications", received?);
            anyhow::Ok(())
        })?;
    } else {
        let mut peripheral = BlockingPeripheral::new(radio.clone(), peripheral_config);
        peripheral.configure(Arc::new(MotionSensor::new()), descriptors)?;
        peripheral.start()?;
        let serving = std::thread::spawn({
            let stop = stop.clone();
            move || peripheral.serve_until(stop)
        });

        let mut central = BlockingCentral::new(radio, central_config);
        match profile {
            FrameProfile::PerChannelInt16 => {
                for channel in SensorChannel::ALL {
                    let tx = tx.clone();
                    central.subscribe_sensor(channel, move |frame| {
                        let _ = tx.send(Sample::Channel(channel, frame));
                    })?;
                }
            }
            FrameProfile::CompositeFloat32 => {
                let tx = tx.clone();
                central.subscribe_composite(move |frame| {
                    let _ = tx.send(Sample::Composite(frame));
                })?;
            }
        }

        let printed = print_samples(&rx, samples, &stop);
        info!("Received {} notifications", printed);

        central.disconnect();
        stop.stop();
        serving
            .join()
            .map_err(|_| anyhow::anyhow!("Peripheral thread panicked"))??;
    }
    Ok(())
}

fn print_samples(rx: &std::sync::mpsc::Receiver<Sample>, samples: u32, stop: &StopHandle) -> u32 {
    let mut printed = 0;
    while printed < samples && !stop.is_stopped() {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(sample) => {
                println!("#{:<4} {}", printed, sample);
                printed += 1;
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                warn!("No notification within 500ms");
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    printed
}
