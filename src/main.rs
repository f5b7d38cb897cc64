use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sysgpio::{Config, Direction, Edge, FsBackend, GpioError, GpioManager, Level};

const USAGE: &str = "usage: sysgpio [--config <path>] <command>

commands:
  read <pin>
  write <pin> <0|1>    (leaves the pin exported)
  watch <pin> <rising|falling|both> [seconds]
  wait <pin> <rising|falling|both> [timeout-ms]
  pwm <chip> <channel> <hz> <duty%> [seconds]";

fn parse<T: std::str::FromStr>(arg: Option<&String>, what: &str) -> Result<T, GpioError> {
    let raw = arg.ok_or_else(|| GpioError::InvalidArgument(format!("missing {what}")))?;
    raw.parse()
        .map_err(|_| GpioError::InvalidArgument(format!("invalid {what}: {raw}")))
}

fn parse_opt<T: std::str::FromStr>(
    arg: Option<&String>,
    what: &str,
) -> Result<Option<T>, GpioError> {
    match arg {
        Some(_) => parse(arg, what).map(Some),
        None => Ok(None),
    }
}

fn parse_edge(arg: Option<&String>) -> Result<Edge, GpioError> {
    let raw = arg.ok_or_else(|| GpioError::InvalidArgument("missing edge".into()))?;
    Edge::from_sysfs_str(raw)
        .ok_or_else(|| GpioError::InvalidArgument(format!("invalid edge: {raw}")))
}

fn run(manager: &GpioManager<FsBackend>, args: &[String]) -> Result<(), GpioError> {
    let command = args.first().map(String::as_str);
    match command {
        Some("read") => {
            let pin = parse(args.get(1), "pin")?;
            manager.setup(pin, Direction::In, None)?;
            let level = manager.read(pin)?;
            println!("{}", level.as_sysfs_str());
        }
        Some("write") => {
            let pin = parse(args.get(1), "pin")?;
            let high: u8 = parse(args.get(2), "level")?;
            manager.setup(pin, Direction::Out, Some(Level::from(high != 0)))?;
            manager.detach(pin)?;
        }
        Some("watch") => {
            let pin = parse(args.get(1), "pin")?;
            let edge = parse_edge(args.get(2))?;
            let seconds = parse_opt(args.get(3), "seconds")?.unwrap_or(10);
            manager.setup(pin, Direction::In, None)?;
            manager.add_event_detect_with_callback(pin, edge, |pin| {
                println!("edge on pin {pin}");
            })?;
            info!("watching pin {pin} for {seconds}s");
            thread::sleep(Duration::from_secs(seconds));
            manager.remove_event_detect(pin)?;
        }
        Some("wait") => {
            let pin = parse(args.get(1), "pin")?;
            let edge = parse_edge(args.get(2))?;
            let timeout = parse_opt(args.get(3), "timeout")?.map(Duration::from_millis);
            manager.setup(pin, Direction::In, None)?;
            match manager.wait_for_edge(pin, edge, timeout)? {
                Some(pin) => println!("edge on pin {pin}"),
                None => println!("timed out"),
            }
        }
        Some("pwm") => {
            let chip = parse(args.get(1), "chip")?;
            let channel = parse(args.get(2), "channel")?;
            let hz: f64 = parse(args.get(3), "frequency")?;
            let duty: f64 = parse(args.get(4), "duty cycle")?;
            let seconds = parse_opt(args.get(5), "seconds")?.unwrap_or(5);
            let mut pwm = manager.pwm(chip, channel, hz, duty, false)?;
            pwm.start()?;
            info!(
                "pwmchip{chip}/pwm{channel}: {} ns period, {} ns duty for {seconds}s",
                pwm.period_ns(),
                pwm.duty_cycle_ns()
            );
            thread::sleep(Duration::from_secs(seconds));
            pwm.stop()?;
            pwm.close()?;
        }
        _ => {
            eprintln!("{USAGE}");
            return Err(GpioError::InvalidArgument("unknown command".into()));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = if args.first().map(String::as_str) == Some("--config") {
        let path = args.get(1).cloned();
        args = args.split_off(args.len().min(2));
        path
    } else {
        std::env::var("SYSGPIO_CONFIG").ok()
    };

    let config = config_path
        .map(Config::load_from_file)
        .transpose()
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"))
        .unwrap_or_default();

    let manager = GpioManager::new(Arc::new(config), Arc::new(FsBackend::new()))
        .unwrap_or_else(|e| panic!("Failed to start edge engine: {e}"));

    let outcome = run(&manager, &args);
    if let Err(e) = manager.cleanup() {
        error!("cleanup failed: {e}");
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
