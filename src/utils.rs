//! Interactive helpers for the command line: choosing the serial port of the
//! board and waiting for it to show up.

mod keyboard;
mod ports;

pub use keyboard::poll_escape;
pub use ports::{select_port, wait_for_port};
