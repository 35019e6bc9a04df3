//! Waiting for, and choosing, the serial port of the board.

use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};

use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use crate::{
    catalog::{is_port_connected, list_ports, SerialPortInfo, UsbId},
    utils::poll_escape,
};

//==============================================================================
// Public Interface
//==============================================================================

/// Wait until at least one recognized adapter is connected, then let the user
/// pick one of them.
///
/// Returns `None` when the user dismissed the selection, in which case the
/// caller may ask again to refresh the list of adapters.
pub fn select_port(allowed: &[UsbId]) -> Option<String> {
    let pb = spinner();
    let waiting_period: u64 = 1;
    let mut attempt: u64 = 1;

    // Avoid cursor flicker during the waiting
    let _ = Term::stdout().hide_cursor();
    let found_ports = loop {
        let found = list_ports(allowed);
        if !found.is_empty() {
            pb.finish_with_message("Select the port of the board:");
            break found;
        }
        pb.set_message(format!(
            "[{:03}s] ⌛ Waiting for a USB serial adapter to be connected...",
            style(attempt * waiting_period).dim(),
        ));
        attempt += 1;
        thread::sleep(Duration::from_secs(waiting_period));
    };
    let _ = Term::stdout().show_cursor();

    let selection = select_port_interactive(&found_ports);
    match &selection {
        Some(path) => {
            pb.finish_with_message(format!("👍 Serial port {} is ready", style(path).green()));
        }
        None => {
            pb.finish_with_message("❌ Selection canceled");
        }
    }
    selection
}

/// Check for a recognized adapter at `path`. If not immediately found, enter
/// into a waiting loop, checking every period of time whether it has been
/// connected. While waiting, the user can cancel by pressing the `ESC` key.
///
/// Returns `true` when the wait was cancelled.
pub fn wait_for_port(path: &str, allowed: &[UsbId]) -> bool {
    if is_port_connected(path, allowed) {
        return false;
    }

    let pb = spinner();
    let waiting_period: u64 = 2;
    let mut attempt: u64 = 1;

    // The main thread polls the catalog while a second one listens for `ESC`.
    // `cancel` goes from the key listener to the main thread, `done` the other
    // way around once the port showed up.
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let listener = thread::spawn(move || loop {
        if done_rx.try_recv().is_ok() {
            break;
        }
        match poll_escape() {
            Ok(true) => {
                let _ = cancel_tx.send(());
                break;
            }
            Ok(false) => {}
            Err(e) => {
                debug!("keyboard unavailable: {}", e);
                break;
            }
        }
    });

    let mut cancelled = false;
    loop {
        if is_port_connected(path, allowed) {
            let _ = done_tx.send(());
            pb.finish_with_message(format!("👍 Serial port {} is ready", style(path).green()));
            break;
        }

        let waited = attempt * waiting_period;
        pb.set_message(format!(
            "[{:03}s] ⏳ Waiting for {} to be connected (ESC to cancel)...",
            style(waited).dim(),
            style(path).cyan()
        ));

        match cancel_rx.recv_timeout(Duration::from_secs(waiting_period)) {
            Ok(()) => {
                pb.finish_with_message(format!(
                    "❌ Waiting on port {} canceled after {} seconds",
                    style(path).cyan(),
                    style(waited).dim()
                ));
                cancelled = true;
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            // Without a keyboard, keep waiting until the port shows up
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(Duration::from_secs(waiting_period));
            }
        }
        attempt += 1;
    }

    if listener.join().is_err() {
        warn!("the keyboard listener panicked");
    }
    cancelled
}

//==============================================================================
// Private stuff
//==============================================================================

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            // For more spinners check out the cli-spinners project:
            // https://github.com/sindresorhus/cli-spinners/blob/master/spinners.json
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
            .template("[TP] {spinner:.blue} {msg}"),
    );
    pb
}

fn select_port_interactive(ports: &[SerialPortInfo]) -> Option<String> {
    use dialoguer::{theme::ColorfulTheme, Select};

    let term = Term::buffered_stderr();
    let theme = ColorfulTheme::default();

    let mut select = Select::with_theme(&theme);
    for port in ports {
        select.item(format!(
            "{}: ({}) [{}]",
            port.device_path, port.description, port.hardware_id
        ));
    }

    match select.default(0).interact_on_opt(&term) {
        Ok(selection) => selection
            .and_then(|x| ports.get(x))
            .map(|port| port.device_path.clone()),
        Err(e) => {
            warn!("port selection failed: {}", e);
            None
        }
    }
}
