//! Serial handshake reading the serial number of a taximeter.
//!
//! The device prints its serial number in its boot banner, as a line of the
//! form `NUMERO_SERIAL:<value>`. To get the banner on demand, the device is
//! rebooted by pulsing the DTR/RTS control lines (which the USB-serial bridges
//! wire to the EN/IO0 pins of the chip):
//!
//! ```text
//!  DTR/RTS ‾‾‾‾|_____|‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾
//!              pulse  boot grace   read lines until keyword or timeout
//! ```
//!
//! The connection is opened for the duration of one call only and is closed
//! on every exit path. A banner without the keyword is not an error: the
//! caller gets `None` and decides whether to try again.

use std::{
    io::{self, Read},
    thread,
    time::{Duration, Instant},
};

use hexplay::HexViewBuilder;
use log::{debug, info, log_enabled, trace, Level::Debug};
use serialport::SerialPort;

use crate::{error::HandshakeError, job::DeviceIdentity, settings::Settings};

// =============================================================================
// Public Interface
// =============================================================================

/// A serial connection to the device: a byte stream plus the two modem
/// control lines used to reset it.
pub trait DeviceLink: Read {
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;
    fn set_rts(&mut self, level: bool) -> io::Result<()>;
}

impl DeviceLink for Box<dyn SerialPort> {
    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.write_data_terminal_ready(level).map_err(io::Error::from)
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.write_request_to_send(level).map_err(io::Error::from)
    }
}

/// Opens [`DeviceLink`]s. Dropping the returned link closes the connection.
pub trait LinkOpener {
    type Link: DeviceLink;

    /// Open `path` exclusively. Individual reads on the link give up after
    /// `read_timeout`.
    fn open(&self, path: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<Self::Link>;
}

/// Opens real serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;
impl LinkOpener for SerialOpener {
    type Link = Box<dyn SerialPort>;

    fn open(&self, path: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<Self::Link> {
        serialport::new(path, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(io::Error::from)
    }
}

/// Reset the device on `port` and look for the serial number line in its
/// boot banner.
///
/// Returns `Ok(None)` when the keyword line did not show up before
/// `settings.handshake_timeout` elapsed.
pub fn handshake<O: LinkOpener>(
    opener: &O,
    port: &str,
    settings: &Settings,
) -> Result<Option<String>, HandshakeError> {
    let read_timeout = std::cmp::min(READ_SLICE, settings.handshake_timeout);
    let mut link = opener
        .open(port, settings.baud_rate, read_timeout)
        .map_err(|source| HandshakeError::Open {
            port: port.into(),
            source,
        })?;
    info!("Connected to {} at {} baud", port, settings.baud_rate);

    let result = reset_and_read(&mut link, settings);
    drop(link);
    debug!("serial connection to {} closed", port);
    result
}

/// Same as [`handshake`], wrapping the value into a [`DeviceIdentity`].
pub fn read_identity<O: LinkOpener>(
    opener: &O,
    port: &str,
    settings: &Settings,
) -> Result<Option<DeviceIdentity>, HandshakeError> {
    Ok(handshake(opener, port, settings)?.map(DeviceIdentity::new))
}

// =============================================================================
// Private stuff
// =============================================================================

const READ_SLICE: Duration = Duration::from_millis(100);

fn reset_and_read<L: DeviceLink>(
    link: &mut L,
    settings: &Settings,
) -> Result<Option<String>, HandshakeError> {
    pulse_reset(link, settings.reset_pulse).map_err(HandshakeError::Reset)?;
    debug!("device reset, waiting {:?} for boot", settings.boot_grace);
    thread::sleep(settings.boot_grace);

    let deadline = Instant::now() + settings.handshake_timeout;
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];

    while Instant::now() < deadline {
        let n = match link.read(&mut chunk) {
            Ok(0) => {
                thread::sleep(Duration::from_millis(10));
                continue;
            }
            Ok(n) => n,
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(HandshakeError::Read(e)),
        };
        trace!("{} bytes read from device", n);
        if log_enabled!(Debug) {
            let view = HexViewBuilder::new(&chunk[..n])
                .address_offset(0)
                .row_width(16)
                .finish();
            debug!("\n{}", view);
        }

        pending.extend_from_slice(&chunk[..n]);
        while let Some(end) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(value) = match_keyword(&line, &settings.serial_keyword) {
                info!("found {} = {}", settings.serial_keyword, value);
                return Ok(Some(value.to_owned()));
            }
        }
    }

    info!(
        "{} not seen within {:?}",
        settings.serial_keyword, settings.handshake_timeout
    );
    Ok(None)
}

/// Drop both control lines, hold, then raise them again.
fn pulse_reset<L: DeviceLink>(link: &mut L, pulse: Duration) -> io::Result<()> {
    link.set_dtr(false)?;
    link.set_rts(false)?;
    thread::sleep(pulse);
    link.set_dtr(true)?;
    link.set_rts(true)
}

fn match_keyword<'l>(line: &'l str, keyword: &str) -> Option<&'l str> {
    let value = line.trim().strip_prefix(keyword)?.strip_prefix(':')?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
