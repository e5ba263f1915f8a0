/*
 * This file is part of Sensorreg.
 *
 * Copyright (C) 2025 Sensorreg contributors
 *
 * Sensorreg is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Sensorreg is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Sensorreg. If not, see <https://www.gnu.org/licenses/>.
 */

use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("terminal error: {0}")]
    Io(#[from] io::Error),
    #[error("input interrupted")]
    Interrupted,
}

/// Source of a line of user text.
///
/// `Ok(None)` means no answer: the wait ran out or input ended.
#[cfg_attr(test, mockall::automock)]
pub trait TextInput {
    fn prompt_line(&mut self, message: &str) -> Result<Option<String>, InputError>;
}

/// Interactive prompt on the controlling terminal with a bounded wait.
pub struct TerminalPrompt {
    timeout: Duration,
}

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

impl TerminalPrompt {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl TextInput for TerminalPrompt {
    fn prompt_line(&mut self, message: &str) -> Result<Option<String>, InputError> {
        let mut out = io::stdout();
        write!(out, "{}", message)?;
        out.flush()?;

        let _raw = RawModeGuard::enable()?;
        let deadline = Instant::now() + self.timeout;
        let mut line = String::new();

        let answer = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !event::poll(remaining)? {
                break None;
            }
            let Event::Key(key) = event::read()? else { continue };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Char('c') | KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    write!(out, "\r\n")?;
                    return Err(InputError::Interrupted);
                }
                KeyCode::Enter => break Some(line),
                KeyCode::Esc => break None,
                KeyCode::Backspace => {
                    if line.pop().is_some() {
                        write!(out, "\x08 \x08")?;
                    }
                }
                KeyCode::Char(c) => {
                    line.push(c);
                    write!(out, "{}", c)?;
                }
                _ => {}
            }
            out.flush()?;
        };

        write!(out, "\r\n")?;
        out.flush()?;
        Ok(answer)
    }
}

/// Line input from any buffered reader, for piped stdin.
///
/// No deadline applies; end of input counts as no answer.
pub struct ReaderInput<R: BufRead> {
    reader: R,
    echo_prompts: bool,
}

impl<R: BufRead> ReaderInput<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, echo_prompts: true }
    }

    pub fn quiet(reader: R) -> Self {
        Self { reader, echo_prompts: false }
    }
}

impl<R: BufRead> TextInput for ReaderInput<R> {
    fn prompt_line(&mut self, message: &str) -> Result<Option<String>, InputError> {
        if self.echo_prompts {
            let mut out = io::stdout();
            write!(out, "{}", message)?;
            out.flush()?;
        }
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        Ok(Some(trimmed.to_string()))
    }
}

/// Whether `answer` is an explicit yes.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
