/*! iNet box emulator daemon.

Opens the UART, runs the protocol stack, and bridges it to stdin and
stdout for testing without a broker:

* stdin takes one `name=value` set-request per line, e.g.
  `target_temp_room=20` or `clock=now`.
* stdout gets one line per telemetry event.

```no_run
$ inetboxd --device /dev/ttyUSB0 -v 2
display_status/cur_temp_room 17.5
[…]
```

Ctrl-C shuts down after the next read timeout.
*/
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Result;
use clap::Parser;
use log::warn;

use inetbox::config::Config;
use inetbox::emulator::{Emulator, SetRequest, Telemetry};
use inetbox::serial::SerialPort;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Configuration file (JSON).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Serial device, overriding the configuration.
    #[arg(long, short)]
    device: Option<PathBuf>,

    #[arg(short = 'v', default_value = "0")]
    verbose: usize,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("inetbox")
        .quiet(false)
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let mut config = match &opt.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(device) = opt.device {
        config.device = device;
    }

    let port = SerialPort::open(&config.device)?;
    let (mut emu, handles) = Emulator::new(port, &config);

    let stop = handles.stop.clone();
    ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))?;

    let requests = handles.requests.clone();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((name, value)) => {
                    if requests
                        .send(SetRequest {
                            name: name.trim().to_string(),
                            value: value.trim().to_string(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                None => warn!("set-requests are name=value, got {line:?}"),
            }
        }
    });

    let telemetry = handles.telemetry;
    std::thread::spawn(move || {
        for t in telemetry {
            match t {
                Telemetry::DisplayStatus(m) => {
                    for (k, v) in &m {
                        println!("display_status/{k} {v}");
                    }
                }
                Telemetry::ControlStatus(m) => {
                    for (k, v) in &m {
                        println!("control_status/{k} {v}");
                    }
                }
                Telemetry::UpdateStatus(s) => println!("update_status {s}"),
                Telemetry::CpPlusStatus(s) => println!("cp_plus_status {s}"),
                Telemetry::Error { key, reason } => println!("error {key}: {reason}"),
            }
        }
    });

    emu.run()?;
    Ok(())
}
