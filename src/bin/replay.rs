/*! Replay a captured bus log through the protocol stack.

Takes the kind of text log a logic analyzer or `interceptty` writes,
one frame per line, and prints every status buffer found in it:

```no_run
$ inetbox-replay capture.log
display_status (via SID 0xBB):
  cur_temp_room = 17.5
  […]
```

Use `--first`/`--last` if the byte columns sit elsewhere in the line;
negative values count from the end, like Python slices.

Exits zero on a clean end of file, non-zero on read errors.
*/
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};

use inetbox::deframer::Deframer;
use inetbox::frame::ID_DIAG_REQUEST;
use inetbox::replay;
use inetbox::schema;
use inetbox::transport::Transport;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Log file to replay.
    file: PathBuf,

    /// First whitespace column holding a frame byte.
    #[arg(long, default_value = "1", allow_hyphen_values = true)]
    first: isize,

    /// Column one past the last frame byte.
    #[arg(long, default_value = "-2", allow_hyphen_values = true)]
    last: isize,

    /// Node address to reassemble diagnostic requests for.
    #[arg(long, default_value = "3")]
    nad: u8,

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

    let file = std::fs::File::open(&opt.file)
        .with_context(|| format!("opening {}", opt.file.display()))?;

    let mut deframer = Deframer::new();
    let mut transport = Transport::new();
    // Replay has no clock; a fixed instant keeps the reassembly
    // timeout out of the way.
    let now = Instant::now();

    let stats = replay::feed_log(
        BufReader::new(file),
        opt.first,
        opt.last,
        &mut deframer,
        |frame| {
            debug!("{frame:?}");
            if frame.pid.id() != ID_DIAG_REQUEST {
                return;
            }
            let Ok(data) = <&[u8; 8]>::try_from(frame.data.as_slice()) else {
                return;
            };
            let Some(pdu) = transport.handle_request(data, opt.nad, now) else {
                return;
            };
            if pdu.payload.len() < 12 {
                return;
            }
            let Some(s) = schema::schema_for(pdu.payload[10], pdu.payload[11]) else {
                return;
            };
            let Some(decoded) = s.decode(&pdu.payload) else {
                return;
            };
            println!("{} (via SID 0x{:02X}):", s.name, pdu.sid);
            for (k, v) in &decoded {
                println!("  {k} = {v}");
            }
        },
    )?;

    info!(
        "{} lines ({} unparsable), {} frames, {} frame errors, {} transport errors",
        stats.lines,
        stats.bad_lines,
        stats.frames,
        deframer.error_count(),
        transport.error_count()
    );
    Ok(())
}
