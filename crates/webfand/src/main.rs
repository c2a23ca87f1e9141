use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webfand::accessory::FanAccessory;
use webfand::api;
use webfand::characteristic::{CharacteristicValue, RotationDirection};
use webfand::config::{self, FanConfig};
use webfand::listener::Listener;

#[derive(Parser, Debug)]
#[command(name = "webfand", version, about = "HTTP fan accessory bridge")]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/webfan/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every configured fan and run its webhook listener
    Serve {
        /// Also serve the local host API on this localhost port
        #[arg(long)]
        api_port: Option<u16>,
    },
    /// Fetch /status once and print the resulting characteristics
    Status {
        /// Accessory name (required when several are configured)
        #[arg(long)]
        name: Option<String>,
    },
    /// Send characteristic values to the device
    Set {
        /// Accessory name (required when several are configured)
        #[arg(long)]
        name: Option<String>,
        /// 0 = off, 1 = on
        #[arg(long)]
        on: Option<u8>,
        /// Rotation speed percentage (0-100)
        #[arg(long)]
        speed: Option<u8>,
        /// 0 = clockwise, 1 = counter-clockwise
        #[arg(long)]
        direction: Option<u8>,
    },
    /// Log an identify request for an accessory
    Identify {
        /// Accessory name (required when several are configured)
        #[arg(long)]
        name: Option<String>,
    },
    /// Print accessory information for every configured fan
    Info,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let path = match cli.config {
        Some(path) => path,
        None => config::config_path()?,
    };
    let configs = config::load_accessories(&path)?;

    match cli.command {
        Command::Serve { api_port } => serve(configs, api_port)?,
        Command::Status { name } => {
            let accessory = FanAccessory::new(select(configs, name)?)?;
            accessory.refresh()?;
            println!("{}", serde_json::to_string_pretty(&accessory.state())?);
        }
        Command::Set {
            name,
            on,
            speed,
            direction,
        } => {
            let values = set_values(on, speed, direction)?;
            let accessory = FanAccessory::new(select(configs, name)?)?;
            for value in values {
                accessory.set(value)?;
            }
            println!("{}", serde_json::to_string_pretty(&accessory.state())?);
        }
        Command::Identify { name } => {
            FanAccessory::new(select(configs, name)?)?.identify();
        }
        Command::Info => {
            for config in configs {
                println!(
                    "{}: {}",
                    config.name,
                    serde_json::to_string_pretty(&config.information())?
                );
            }
        }
    }

    Ok(())
}

fn serve(configs: Vec<FanConfig>, api_port: Option<u16>) -> Result<(), Box<dyn Error>> {
    let accessories = configs
        .into_iter()
        .map(FanAccessory::new)
        .collect::<Result<Vec<_>, _>>()?;

    let mut listeners = Vec::new();
    let mut pollers = Vec::new();
    for accessory in &accessories {
        info!(
            accessory = %accessory.name(),
            apiroute = %accessory.config().apiroute,
            interval_secs = accessory.config().poll_interval().as_secs(),
            "starting accessory"
        );
        if accessory.config().listener {
            listeners.push(Listener::start(accessory.clone())?);
        }
        pollers.push(accessory.spawn_poller()?);
    }

    match api_port {
        Some(port) => {
            let result = api::run_api_server(&accessories, port);
            for poller in pollers {
                poller.stop();
            }
            for listener in listeners {
                listener.stop();
            }
            result
        }
        None => {
            for poller in pollers {
                poller.join();
            }
            for listener in listeners {
                listener.join();
            }
            Ok(())
        }
    }
}

fn select(configs: Vec<FanConfig>, name: Option<String>) -> Result<FanConfig, Box<dyn Error>> {
    match name {
        Some(name) => configs
            .into_iter()
            .find(|config| config.name == name)
            .ok_or_else(|| format!("No accessory named '{}'", name).into()),
        None if configs.len() == 1 => Ok(configs.into_iter().next().ok_or("No accessory")?),
        None => Err("Several accessories are configured; pass --name".into()),
    }
}

fn set_values(
    on: Option<u8>,
    speed: Option<u8>,
    direction: Option<u8>,
) -> Result<Vec<CharacteristicValue>, Box<dyn Error>> {
    if on.is_none() && speed.is_none() && direction.is_none() {
        return Err("set requires at least one of --on, --speed, --direction".into());
    }
    let mut values = Vec::new();
    if let Some(value) = on {
        if value > 1 {
            return Err("--on must be 0 or 1".into());
        }
        values.push(CharacteristicValue::On(value == 1));
    }
    if let Some(value) = speed {
        values.push(CharacteristicValue::RotationSpeed(value.min(100)));
    }
    if let Some(value) = direction {
        let direction =
            RotationDirection::from_u8(value).ok_or("--direction must be 0 or 1")?;
        values.push(CharacteristicValue::RotationDirection(direction));
    }
    Ok(values)
}
