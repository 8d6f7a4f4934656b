//! Terminal output thread. Owns stderr so that log lines and the progress
//! line do not garble each other.

use std::io::Write as _;
use std::sync::mpsc;
use std::time::{Duration, Instant};

const UPDATE_PERIOD: Duration = Duration::from_millis(50);

pub(crate) fn init(start: Instant, enable_progress: bool) -> Handle {
    let (sender, receiver) = mpsc::channel();

    let join_handle = std::thread::Builder::new()
        .name("term out".into())
        .spawn(move || {
            let mut out = TermOut {
                start,
                enable_progress,
                progress: None,
                last_update: start,
                dirty: false,
                stderr: std::io::stderr(),
            };
            out.run(&receiver);
        })
        .expect("failed to spawn thread");

    Handle {
        join_handle,
        sender,
    }
}

enum Command {
    Finish,
    PrintRawLine(Vec<u8>),
    SetProgress(String),
    FreezeProgress,
}

struct TermOut {
    start: Instant,
    enable_progress: bool,
    /// Progress line currently shown at the bottom.
    progress: Option<String>,
    last_update: Instant,
    /// `progress` changed since it was last drawn.
    dirty: bool,
    stderr: std::io::Stderr,
}

impl TermOut {
    fn run(&mut self, receiver: &mpsc::Receiver<Command>) {
        loop {
            let cmd = match self.next_timeout() {
                None => receiver.recv().map_err(mpsc::RecvTimeoutError::from),
                Some(timeout) if timeout.is_zero() => Err(mpsc::RecvTimeoutError::Timeout),
                Some(timeout) => receiver.recv_timeout(timeout),
            };

            match cmd {
                Ok(Command::Finish) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.freeze();
                    break;
                }
                Ok(Command::PrintRawLine(line)) => self.print_line(&line),
                Ok(Command::SetProgress(progress)) => {
                    if self.enable_progress {
                        self.progress = Some(progress);
                        self.dirty = true;
                        if self.last_update.elapsed() >= UPDATE_PERIOD {
                            self.redraw();
                        }
                    }
                }
                Ok(Command::FreezeProgress) => self.freeze(),
                // the elapsed time is part of the line
                Err(mpsc::RecvTimeoutError::Timeout) => self.redraw(),
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.progress.as_ref()?;
        if self.dirty {
            Some(UPDATE_PERIOD.saturating_sub(self.last_update.elapsed()))
        } else {
            Some(duration_to_next_second(self.start.elapsed()))
        }
    }

    fn render(&self, progress: &str) -> String {
        let elapsed = self.start.elapsed().as_secs();
        let secs = elapsed % 60;
        let mins = (elapsed / 60) % 60;
        let hours = elapsed / 3600;
        format!("[{hours:02}:{mins:02}:{secs:02}] {progress}")
    }

    fn redraw(&mut self) {
        if let Some(ref progress) = self.progress {
            let line = self.render(progress);
            handle_err(crossterm::queue!(
                self.stderr,
                crossterm::cursor::MoveToColumn(0),
                crossterm::style::Print(line),
                crossterm::terminal::Clear(crossterm::terminal::ClearType::UntilNewLine),
            ));
            handle_err(self.stderr.flush());
        }
        self.last_update = Instant::now();
        self.dirty = false;
    }

    fn print_line(&mut self, line: &[u8]) {
        match self.progress {
            Some(ref progress) => {
                let progress_line = self.render(progress);
                handle_err(crossterm::queue!(
                    self.stderr,
                    crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine),
                    crossterm::cursor::MoveToColumn(0),
                ));
                handle_err(self.stderr.write_all(line));
                handle_err(crossterm::queue!(
                    self.stderr,
                    crossterm::style::Print(progress_line),
                ));
            }
            None => handle_err(self.stderr.write_all(line)),
        }
        handle_err(self.stderr.flush());
    }

    /// Leaves the progress line as it is and moves below it.
    fn freeze(&mut self) {
        if self.progress.is_some() {
            if self.dirty {
                self.redraw();
            }
            handle_err(crossterm::queue!(
                self.stderr,
                crossterm::style::Print('\n'),
                crossterm::cursor::MoveToColumn(0),
            ));
            handle_err(self.stderr.flush());
        }
        self.progress = None;
    }
}

fn handle_err<T>(r: std::io::Result<T>) -> T {
    r.expect("stderr write failed")
}

fn duration_to_next_second(duration: Duration) -> Duration {
    let subsec_nanos = duration.subsec_nanos();
    if subsec_nanos == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos((1_000_000_000 - subsec_nanos).into())
    }
}

pub(crate) struct Handle {
    join_handle: std::thread::JoinHandle<()>,
    sender: mpsc::Sender<Command>,
}

impl Handle {
    pub(crate) fn finish(self) {
        self.sender
            .send(Command::Finish)
            .expect("term out endpoint closed");
        self.join_handle.join().expect("term out thread panicked");
    }

    pub(crate) fn get_progress_print(&self) -> ProgressPrint {
        ProgressPrint {
            sender: self.sender.clone(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct ProgressPrint {
    sender: mpsc::Sender<Command>,
}

impl ProgressPrint {
    pub(crate) fn set_progress(&self, progress: String) {
        self.send(Command::SetProgress(progress));
    }

    pub(crate) fn freeze_progress(&self) {
        self.send(Command::FreezeProgress);
    }

    pub(crate) fn print_raw_line(&self, line: Vec<u8>) {
        self.send(Command::PrintRawLine(line));
    }

    fn send(&self, cmd: Command) {
        // log lines may still arrive after the thread has finished
        let _ = self.sender.send(cmd);
    }
}
