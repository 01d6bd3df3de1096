//! Host-side link driver: runs a squid engine over a real serial port.
//!
//! Wire two instances together (a null-modem cable, or a pty pair via
//! `socat -d -d pty,raw pty,raw`) and let them chat:
//!
//! ```text
//! terminal 1:  squid-link-tester /dev/pts/3 115200
//! terminal 2:  squid-link-tester /dev/pts/4 115200
//! ```

use std::io::{self, BufRead};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use log::{error, info};
use serial2::SerialPort;
use squid_common::tick::{Tick, TickClock};
use squid_common::wire::{WireRead, WireWrite, WireWriteError};
use squid_link::{LinkTimings, SquidLink};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    /// Line-oriented two-way chat on channel 1.
    Chat,
    /// Send a numbered sample message once a second.
    SendSample,
    /// Only print whatever the peer sends.
    RecvOnly,
}

#[derive(Parser, Debug)]
struct Args {
    /// Serial device, e.g. /dev/ttyUSB0
    port: String,
    baud_rate: u32,

    #[clap(long, value_enum, default_value = "chat")]
    mode: Mode,

    #[clap(long, default_value_t = LinkTimings::DEFAULT_TIMEOUT_TICKS)]
    timeout_ticks: u8,
    #[clap(long, default_value_t = LinkTimings::DEFAULT_ACK_DELAY_TICKS)]
    ack_delay_ticks: u8,
    /// Keepalive period in ticks (50 ticks/s); 0 disables.
    #[clap(long, default_value_t = 50)]
    ping_ticks: u8,
    #[clap(long, default_value_t = LinkTimings::DEFAULT_MAX_RETRIES)]
    max_retries: u8,
}

struct SerialWire {
    port: SerialPort,
}

impl WireWrite for SerialWire {
    fn write_byte(&mut self, byte: u8) -> Result<(), WireWriteError> {
        match self.port.write(&[byte]) {
            Ok(1) => Ok(()),
            _ => Err(WireWriteError::Rejected),
        }
    }
}

impl WireRead for SerialWire {
    fn poll_byte(&mut self) -> Option<u8> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Some(buf[0]),
            _ => None,
        }
    }
}

/// 50 ticks per second, wrapped to 8 bits.
struct HostClock {
    epoch: Instant,
}

impl TickClock for HostClock {
    fn now(&self) -> Tick {
        Tick::new((self.epoch.elapsed().as_millis() / 20) as u8)
    }
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.is_empty() {
                continue;
            }
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut port = SerialPort::open(&args.port, args.baud_rate)
        .unwrap_or_else(|err| panic!("cannot open {}: {err}", args.port));
    port.set_read_timeout(Duration::from_millis(1))
        .expect("cannot configure serial read timeout");

    let timings = LinkTimings {
        timeout_ticks: args.timeout_ticks,
        ack_delay_ticks: args.ack_delay_ticks,
        ping_ticks: args.ping_ticks,
        max_retries: args.max_retries,
    };
    let mut link: SquidLink<_, _, 16> = SquidLink::new(
        SerialWire { port },
        HostClock { epoch: Instant::now() },
        timings,
    );

    let lines = spawn_stdin_reader();
    info!("waiting for peer on {}...", args.port);

    let mut sock = None;
    let mut sample_no: u32 = 0;
    let mut last_sample = Instant::now();

    loop {
        link.burst();

        if link.link_is_up() && sock.is_none() {
            match link.open() {
                Ok(id) => {
                    info!("peer found, talking on channel {id}");
                    sock = Some(id);
                }
                Err(err) => error!("cannot open a channel: {err:?}"),
            }
        }

        if let Some(id) = sock {
            match args.mode {
                Mode::Chat => {
                    while let Ok(line) = lines.try_recv() {
                        if let Err(err) = link.send(id, line.as_bytes()) {
                            error!("send failed: {err:?}");
                        }
                    }
                }
                Mode::SendSample => {
                    if last_sample.elapsed() >= Duration::from_secs(1) {
                        last_sample = Instant::now();
                        sample_no += 1;
                        let msg = format!("sample #{sample_no}");
                        if let Err(err) = link.send(id, msg.as_bytes()) {
                            error!("send failed: {err:?}");
                        }
                    }
                }
                Mode::RecvOnly => {}
            }

            let mut buf = [0u8; 256];
            if let Ok(n) = link.recv(id, &mut buf) {
                if n > 0 {
                    println!("peer> {}", String::from_utf8_lossy(&buf[..n]));
                }
            }
        }

        thread::sleep(Duration::from_millis(5));
    }
}
