use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio::sync::mpsc;

use crate::control::{ControlEvent, InterruptCounter};

#[cfg(unix)]
fn enable_onlcr() -> anyhow::Result<()> {
    use std::os::fd::AsRawFd as _;

    let fd = std::io::stderr().as_raw_fd();
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        termios.c_oflag |= (libc::OPOST | libc::ONLCR) as libc::tcflag_t;
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn key_to_control(key: &KeyEvent, interrupts: &InterruptCounter) -> Option<ControlEvent> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(interrupts.interrupt())
        }
        KeyCode::Char('p') | KeyCode::Char('P') => Some(ControlEvent::TogglePause),
        _ => None,
    }
}

/// Raw-mode keyboard listener; restores the terminal on drop.
pub struct KeyListener {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl KeyListener {
    pub fn enter(
        interrupts: Arc<InterruptCounter>,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
    ) -> anyhow::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        // Raw mode turns off "\n" -> "\r\n"; the progress bar and printed lines rely on it.
        #[cfg(unix)]
        if let Err(err) = enable_onlcr() {
            let _ = crossterm::terminal::disable_raw_mode();
            return Err(err);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let thread = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Relaxed) {
                if !crossterm::event::poll(Duration::from_millis(200)).unwrap_or(false) {
                    continue;
                }
                let Ok(Event::Key(key)) = crossterm::event::read() else {
                    continue;
                };
                if let Some(ev) = key_to_control(&key, &interrupts) {
                    let _ = control_tx.send(ev);
                }
            }
        });

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for KeyListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = crossterm::terminal::disable_raw_mode();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_map_to_control_events() {
        let interrupts = InterruptCounter::new();
        let p = KeyEvent::new(KeyCode::Char('p'), KeyModifiers::NONE);
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        let plain_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::NONE);

        assert_eq!(key_to_control(&p, &interrupts), Some(ControlEvent::TogglePause));
        assert_eq!(key_to_control(&plain_c, &interrupts), None);
        assert_eq!(key_to_control(&ctrl_c, &interrupts), Some(ControlEvent::Graceful));
        assert_eq!(key_to_control(&ctrl_c, &interrupts), Some(ControlEvent::Immediate));
    }
}
