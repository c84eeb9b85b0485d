use std::io::{self, Stdout, Write};

use crossterm::{
    cursor::Show,
    event::{self, DisableMouseCapture, EnableMouseCapture, Event},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Frame, Terminal};
use tracing::warn;

use crate::viewer::{Screen, ViewerError};

/// The real terminal. Raw mode, the alternate screen and mouse capture are restored on drop.
pub struct TerminalScreen {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    alternate: bool,
    mouse: bool,
}

impl TerminalScreen {
    pub fn enter(no_alt: bool) -> Result<Self, ViewerError> {
        enable_raw_mode()?;
        let setup = (|| {
            let mut stdout = io::stdout();
            if !no_alt {
                execute!(stdout, EnterAlternateScreen)?;
            }
            let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
            terminal.clear()?;
            terminal.hide_cursor()?;
            Ok::<_, io::Error>(terminal)
        })();
        match setup {
            Ok(terminal) => Ok(Self { terminal, alternate: !no_alt, mouse: false }),
            Err(err) => {
                let _ = disable_raw_mode();
                if !no_alt {
                    let _ = execute!(io::stdout(), LeaveAlternateScreen);
                }
                Err(err.into())
            }
        }
    }

    fn leave(&mut self) -> io::Result<()> {
        self.terminal.show_cursor()?;
        disable_raw_mode()?;
        if self.mouse {
            execute!(self.terminal.backend_mut(), DisableMouseCapture)?;
        }
        if self.alternate {
            execute!(self.terminal.backend_mut(), LeaveAlternateScreen)?;
        }
        self.terminal.backend_mut().flush()
    }

    fn reenter(&mut self) -> io::Result<()> {
        enable_raw_mode()?;
        if self.alternate {
            execute!(self.terminal.backend_mut(), EnterAlternateScreen)?;
        }
        if self.mouse {
            execute!(self.terminal.backend_mut(), EnableMouseCapture)?;
        }
        self.terminal.clear()?;
        self.terminal.hide_cursor()
    }
}

/// Best-effort reset for when the screen's owner can no longer run its destructor.
pub fn restore_terminal() {
    let _ = disable_raw_mode();
    let _ = execute!(io::stdout(), DisableMouseCapture, LeaveAlternateScreen, Show);
}

impl Screen for TerminalScreen {
    fn draw(&mut self, render: &mut dyn FnMut(&mut Frame<'_>)) -> Result<(), ViewerError> {
        self.terminal.draw(|frame| render(frame))?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), ViewerError> {
        self.terminal.clear()?;
        Ok(())
    }

    fn set_mouse(&mut self, enabled: bool) -> Result<(), ViewerError> {
        if enabled {
            execute!(self.terminal.backend_mut(), EnableMouseCapture)?;
        } else {
            execute!(self.terminal.backend_mut(), DisableMouseCapture)?;
        }
        self.mouse = enabled;
        Ok(())
    }

    fn next_event(&mut self) -> Result<Event, ViewerError> {
        Ok(event::read()?)
    }

    fn suspend(&mut self) -> Result<(), ViewerError> {
        if let Err(err) = self.leave() {
            let _ = self.reenter();
            return Err(err.into());
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<(), ViewerError> {
        self.reenter()?;
        Ok(())
    }
}

impl Drop for TerminalScreen {
    fn drop(&mut self) {
        if let Err(err) = self.leave() {
            warn!(?err, "failed to restore terminal");
        }
    }
}
