// Terminal driver for the emulator: owns pacing, the menu keys and the
// screen. The machine itself only ever sees the host traits, so this file
// is the one place that knows about termion.

use anyhow::{Context, Result};
use clap::Parser;
use em16::disk::Disk;
use em16::host::{BinDir, ControlKey, Keyboard, SystemClock, CONTROL_KEYS};
use em16::{Bios, Emulator};
use std::collections::VecDeque;
use std::io::{self, Stdout, Write};
use std::path::Path;
use std::process;
use std::time::Duration;
use termion::event::Key;
use termion::input::{Keys, TermRead};
use termion::raw::{IntoRawMode, RawTerminal};
use termion::{clear, color, cursor, AsyncReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "em16", about = "A retro 16-bit virtual machine")]
struct Args {
    /// Program+data memory size in 16-bit words
    #[arg(default_value_t = 4096)]
    memory_size: usize,
    /// Stack size in 16-bit words
    #[arg(default_value_t = 1024)]
    stack_size: usize,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            process::exit(code);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    if let Err(err) = run(args) {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let disk = Disk::open(Path::new("disk.img")).context("opening disk.img")?;
    let store = BinDir::new("bin");
    let bios = Bios::new(disk, &store);
    let mut emulator = Emulator::new(args.memory_size, args.stack_size, bios);
    let mut keyboard = TermKeyboard::new();
    let mut clock = SystemClock;
    let mut screen = io::stdout()
        .into_raw_mode()
        .context("terminal raw mode (em16 needs a tty)")?;
    write!(screen, "{}", cursor::Hide)?;

    loop {
        keyboard.pump();
        if keyboard.take_quit() {
            break;
        }
        if keyboard.take_interrupt_key() {
            if emulator.bios.menu_active() {
                break;
            }
            emulator.bios.abort(&mut emulator.cpu);
        }
        if emulator.bios.menu_active() {
            if keyboard.pressed(ControlKey::Up) {
                emulator.bios.select_prev();
            }
            if keyboard.pressed(ControlKey::Down) {
                emulator.bios.select_next();
            }
            if keyboard.pressed(ControlKey::Enter) {
                emulator.bios.launch_selected(&mut emulator.cpu, &store);
            }
            keyboard.discard_pending();
        }
        // A handful of instructions per frame keeps guests responsive
        // without starving the terminal.
        for _ in 0..256 {
            if emulator.bios.menu_active() || !emulator.cpu.running() {
                break;
            }
            emulator.tick(&mut keyboard, &mut clock, &store);
        }
        if emulator.bios.menu_active() {
            emulator.tick(&mut keyboard, &mut clock, &store);
        }
        render(&mut screen, &emulator)?;
        std::thread::sleep(Duration::from_millis(16));
    }

    write!(screen, "{}{}{}", clear::All, cursor::Goto(1, 1), cursor::Show)?;
    screen.flush()?;
    Ok(())
}

fn render(screen: &mut RawTerminal<Stdout>, emulator: &Emulator) -> io::Result<()> {
    write!(screen, "{}", clear::All)?;
    if emulator.bios.menu_active() {
        render_menu(screen, emulator)?;
    } else {
        render_program(screen, emulator)?;
    }
    screen.flush()
}

fn render_menu(screen: &mut RawTerminal<Stdout>, emulator: &Emulator) -> io::Result<()> {
    write!(screen, "{}Select binary image", cursor::Goto(3, 2))?;
    write!(screen, "{}(enter: boot, ctrl-c: quit)", cursor::Goto(3, 3))?;
    let files = emulator.bios.file_list();
    if files.is_empty() {
        write!(screen, "{}No .bin images in bin/", cursor::Goto(3, 5))?;
        return Ok(());
    }
    for (index, name) in files.iter().enumerate() {
        let row = 5 + index as u16;
        if index == emulator.bios.selected() {
            write!(
                screen,
                "{}{}> {}{}",
                cursor::Goto(3, row),
                color::Fg(color::Green),
                name,
                color::Fg(color::Reset),
            )?;
        } else {
            write!(screen, "{}  {}", cursor::Goto(3, row), name)?;
        }
    }
    Ok(())
}

fn render_program(screen: &mut RawTerminal<Stdout>, emulator: &Emulator) -> io::Result<()> {
    let name = emulator.bios.program_name().unwrap_or("?");
    write!(screen, "{}{} (ctrl-c: stop)", cursor::Goto(1, 1), name)?;
    let mut row = 3;
    for line in emulator.bios.output().lines() {
        write!(screen, "{}{}", cursor::Goto(1, row), line)?;
        row += 1;
    }
    if emulator.bios.read_line_active() {
        write!(
            screen,
            "{}{}> {}_{}",
            cursor::Goto(1, row + 1),
            color::Fg(color::Green),
            emulator.bios.input_line(),
            color::Fg(color::Reset),
        )?;
    }
    if !emulator.cpu.running() {
        write!(screen, "{}[program stopped]", cursor::Goto(1, row + 3))?;
    }
    write!(screen, "{}{}", cursor::Goto(1, row + 5), emulator.cpu)?;
    Ok(())
}

/// Keyboard backend over termion's asynchronous key stream. Key-up events
/// do not exist on a tty, so `held` is served by the pressed edge.
struct TermKeyboard {
    keys: Keys<AsyncReader>,
    chars: VecDeque<char>,
    pressed: [bool; CONTROL_KEYS],
    interrupt_key: bool,
    quit: bool,
}

impl TermKeyboard {
    fn new() -> TermKeyboard {
        TermKeyboard {
            keys: termion::async_stdin().keys(),
            chars: VecDeque::new(),
            pressed: [false; CONTROL_KEYS],
            interrupt_key: false,
            quit: false,
        }
    }

    fn pump(&mut self) {
        while let Some(Ok(key)) = self.keys.next() {
            match key {
                Key::Ctrl('c') => self.interrupt_key = true,
                Key::Ctrl('q') => self.quit = true,
                Key::Char('\n') => self.pressed[ControlKey::Enter.index()] = true,
                Key::Char('\t') => self.pressed[ControlKey::Tab.index()] = true,
                Key::Char(ch) if (' '..='~').contains(&ch) => self.chars.push_back(ch),
                Key::Backspace => self.pressed[ControlKey::Backspace.index()] = true,
                Key::Esc => self.pressed[ControlKey::Escape.index()] = true,
                Key::Up => self.pressed[ControlKey::Up.index()] = true,
                Key::Down => self.pressed[ControlKey::Down.index()] = true,
                _ => {}
            }
        }
    }

    fn take_quit(&mut self) -> bool {
        std::mem::take(&mut self.quit)
    }

    fn take_interrupt_key(&mut self) -> bool {
        std::mem::take(&mut self.interrupt_key)
    }

    /// The menu eats anything a guest did not consume.
    fn discard_pending(&mut self) {
        self.chars.clear();
        self.pressed = [false; CONTROL_KEYS];
    }
}

impl Keyboard for TermKeyboard {
    fn next_char(&mut self) -> Option<char> {
        self.pump();
        self.chars.pop_front()
    }

    fn pressed(&mut self, key: ControlKey) -> bool {
        self.pump();
        std::mem::take(&mut self.pressed[key.index()])
    }

    fn held(&mut self, key: ControlKey) -> bool {
        self.pressed(key)
    }
}
