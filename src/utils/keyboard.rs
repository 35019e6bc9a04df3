use std::io::stdout;
use std::{process, time::Duration};

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    event::{poll, read, Event, KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode},
    Result,
};

/// Wait up to half a second for a key press and report whether it was `Esc`.
///
/// The terminal is switched to raw mode while waiting, so `Ctrl+C` arrives
/// here as a key event instead of a signal. It exits the process.
pub fn poll_escape() -> Result<bool> {
    enable_raw_mode()?;
    execute!(stdout(), Hide)?;
    let ready = poll(Duration::from_millis(500));
    execute!(stdout(), MoveToColumn(0), Show)?;
    disable_raw_mode()?;

    if !ready? {
        return Ok(false);
    }
    // `read` does not block after a successful `poll`
    let event = read()?;
    if event
        == Event::Key(KeyEvent {
            modifiers: KeyModifiers::CONTROL,
            code: KeyCode::Char('c'),
        })
    {
        process::exit(130);
    }
    Ok(event == Event::Key(KeyCode::Esc.into()))
}
