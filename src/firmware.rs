// The firmware sits between guest programs and the host: INT dispatch, the
// text output buffer, the line editor with history, program selection and
// the disk services. It owns no policy about pacing or rendering; the
// driver calls poll_input/handle_interrupt once per tick and reads the
// state back for display.

use crate::disk::Disk;
use crate::host::{Clock, ControlKey, Keyboard, ProgramStore};
use crate::isa::Register;
use crate::processor::Cpu;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const INPUT_CAPACITY: usize = 256;
pub const HISTORY_CAPACITY: usize = 50;
/// At most this many images are listed from the program store.
pub const MAX_PROGRAMS: usize = 100;
/// INT 2 reads at most this many bytes of guest string.
const PRINT_MAX: usize = 1023;
/// Fixed guest buffer address of the compatibility READ_LINE.
const COMPAT_LINE_ADDR: u16 = 100;

const AX: usize = Register::AX as usize;
const BX: usize = Register::BX as usize;
const CX: usize = Register::CX as usize;

pub struct Bios {
    file_list: Vec<String>,
    selected: usize,
    program_name: Option<String>,
    output: String,
    input: String,
    history: VecDeque<String>,
    history_cursor: Option<usize>,
    line_ready: bool,
    read_line_active: bool,
    menu: bool,
    pub disk: Disk,
}

impl Bios {
    pub fn new(disk: Disk, store: &dyn ProgramStore) -> Bios {
        let mut file_list = store.list();
        if file_list.len() > MAX_PROGRAMS {
            warn!(found = file_list.len(), "too many images, listing {MAX_PROGRAMS}");
            file_list.truncate(MAX_PROGRAMS);
        }
        Bios {
            file_list,
            selected: 0,
            program_name: None,
            output: String::new(),
            input: String::new(),
            history: VecDeque::new(),
            history_cursor: None,
            line_ready: false,
            read_line_active: false,
            menu: true,
            disk,
        }
    }

    pub fn file_list(&self) -> &[String] {
        &self.file_list
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn program_name(&self) -> Option<&str> {
        self.program_name.as_deref()
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn input_line(&self) -> &str {
        &self.input
    }

    pub fn menu_active(&self) -> bool {
        self.menu
    }

    /// True while a guest READ_LINE is waiting on the keyboard.
    pub fn read_line_active(&self) -> bool {
        self.read_line_active
    }

    pub fn select_prev(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    pub fn select_next(&mut self) {
        if self.selected + 1 < self.file_list.len() {
            self.selected += 1;
        }
    }

    /// Boots the image highlighted in the menu.
    pub fn launch_selected(&mut self, cpu: &mut Cpu, store: &dyn ProgramStore) -> bool {
        if self.load_by_index(self.selected, cpu, store) {
            self.menu = false;
            true
        } else {
            false
        }
    }

    fn load_by_index(&mut self, index: usize, cpu: &mut Cpu, store: &dyn ProgramStore) -> bool {
        let Some(name) = self.file_list.get(index) else {
            return false;
        };
        match store.load(name) {
            Ok(image) => {
                cpu.load_program(&image);
                self.program_name = Some(name.clone());
                info!(name = %name, bytes = image.len(), "program started");
                true
            }
            Err(err) => {
                warn!(%err, name = %name, "failed to load program");
                false
            }
        }
    }

    /// Driver-initiated termination: back to the menu, nothing of the guest
    /// survives except the disk.
    pub fn abort(&mut self, cpu: &mut Cpu) {
        cpu.halt();
        self.program_name = None;
        self.output.clear();
        self.input.clear();
        self.line_ready = false;
        self.read_line_active = false;
        self.history_cursor = None;
        self.menu = true;
    }

    /// Feeds keyboard state into the line editor. Only active while a guest
    /// READ_LINE is outstanding.
    pub fn poll_input(&mut self, keyboard: &mut dyn Keyboard) {
        if !self.read_line_active {
            return;
        }
        while let Some(ch) = keyboard.next_char() {
            if (' '..='~').contains(&ch) && self.input.len() < INPUT_CAPACITY - 1 {
                self.input.push(ch);
            }
        }
        if keyboard.pressed(ControlKey::Backspace) {
            self.input.pop();
        }
        if keyboard.pressed(ControlKey::Up) {
            self.recall_older();
        }
        if keyboard.pressed(ControlKey::Down) {
            self.recall_newer();
        }
        if keyboard.pressed(ControlKey::Enter) {
            self.commit_line();
        }
    }

    fn recall_older(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let cursor = match self.history_cursor {
            Some(0) => 0,
            Some(cursor) => cursor - 1,
            None => self.history.len() - 1,
        };
        self.history_cursor = Some(cursor);
        self.input = self.history[cursor].clone();
    }

    fn recall_newer(&mut self) {
        match self.history_cursor {
            Some(cursor) if cursor + 1 < self.history.len() => {
                self.history_cursor = Some(cursor + 1);
                self.input = self.history[cursor + 1].clone();
            }
            Some(_) => {
                // Past the newest entry: back to an empty live line.
                self.history_cursor = None;
                self.input.clear();
            }
            None => {}
        }
    }

    fn commit_line(&mut self) {
        if !self.input.is_empty() {
            if self.history.len() == HISTORY_CAPACITY {
                self.history.pop_front();
            }
            self.history.push_back(self.input.clone());
        }
        self.history_cursor = None;
        self.line_ready = true;
    }

    /// Services the interrupt latched by the last executed instruction, if
    /// any, and clears it.
    pub fn handle_interrupt(
        &mut self,
        cpu: &mut Cpu,
        keyboard: &mut dyn Keyboard,
        clock: &mut dyn Clock,
        store: &dyn ProgramStore,
    ) {
        let number = cpu.interrupt;
        if number == 0 {
            return;
        }
        cpu.interrupt = 0;
        match number {
            1 => self.int_keyboard(cpu, keyboard),
            2 => self.int_print(cpu),
            3 => self.int_output(cpu),
            4 => {
                let millis = cpu.registers[AX];
                clock.sleep(Duration::from_millis(millis as u64));
            }
            6 => {
                let index = cpu.registers[AX] as usize;
                if !self.load_by_index(index, cpu, store) {
                    cpu.zero_flag = true;
                }
            }
            9 => self.int_read_line_compat(cpu),
            10 => self.int_disk(cpu),
            other => debug!(number = other, "unhandled interrupt"),
        }
    }

    fn int_keyboard(&mut self, cpu: &mut Cpu, keyboard: &mut dyn Keyboard) {
        match cpu.registers[AX] & 0xFF {
            0x01 => {
                // GET_KEY
                let key = keyboard.next_char().map(|ch| ch as u16).or_else(|| {
                    [
                        (ControlKey::Backspace, 8),
                        (ControlKey::Enter, b'\n' as u16),
                        (ControlKey::Escape, 27),
                    ]
                    .into_iter()
                    .find(|(key, _)| keyboard.pressed(*key))
                    .map(|(_, code)| code)
                });
                match key {
                    Some(code) => {
                        cpu.registers[AX] = code;
                        cpu.zero_flag = false;
                    }
                    None => {
                        cpu.registers[AX] = 0;
                        cpu.zero_flag = true;
                    }
                }
            }
            0x02 => {
                // PEEK_KEY samples held state and knows a few more keys.
                let key = keyboard.next_char().map(|ch| ch as u16).or_else(|| {
                    [
                        (ControlKey::Backspace, 8),
                        (ControlKey::Enter, b'\n' as u16),
                        (ControlKey::Escape, 27),
                        (ControlKey::Tab, b'\t' as u16),
                        (ControlKey::Up, 0xE000),
                        (ControlKey::Down, 0xE001),
                    ]
                    .into_iter()
                    .find(|(key, _)| keyboard.held(*key))
                    .map(|(_, code)| code)
                });
                match key {
                    Some(code) => {
                        cpu.registers[AX] = code;
                        cpu.zero_flag = false;
                    }
                    None => {
                        cpu.registers[AX] = 0;
                        cpu.zero_flag = true;
                    }
                }
            }
            0x03 => {
                // READ_LINE into the guest buffer named by BX.
                let addr = cpu.registers[BX];
                self.copy_line_to_memory(cpu, addr);
                cpu.zero_flag = false;
            }
            _ => cpu.zero_flag = true,
        }
    }

    fn int_print(&mut self, cpu: &mut Cpu) {
        let text = read_guest_string(cpu, cpu.registers[AX], PRINT_MAX);
        debug!(len = text.len(), "guest output");
        self.output.push_str(&text);
    }

    fn int_output(&mut self, cpu: &mut Cpu) {
        match cpu.registers[AX] & 0xFF {
            0x01 => self.output.push('\n'),
            0x02 => self.output.clear(),
            _ => cpu.zero_flag = true,
        }
    }

    fn int_read_line_compat(&mut self, cpu: &mut Cpu) {
        // Cooperative: arm the line editor and come back empty-handed until
        // the user commits a line with enter.
        self.read_line_active = true;
        if self.line_ready {
            self.copy_line_to_memory(cpu, COMPAT_LINE_ADDR);
            cpu.registers[AX] = COMPAT_LINE_ADDR;
            cpu.zero_flag = false;
        } else {
            cpu.registers[AX] = 0;
            cpu.zero_flag = true;
        }
    }

    fn int_disk(&mut self, cpu: &mut Cpu) {
        match cpu.registers[AX] & 0xFF {
            0x01 => {
                let addr = cpu.registers[BX] as u32;
                let len = cpu.registers[CX] as usize;
                let mut buffer = vec![0u8; len];
                let status = self.disk.read(addr, &mut buffer);
                if status == 0 {
                    for (offset, byte) in buffer.iter().enumerate() {
                        cpu.memory.write_byte(offset as u16, *byte);
                    }
                }
                cpu.zero_flag = status != 0;
            }
            0x02 => {
                let addr = cpu.registers[BX] as u32;
                let len = cpu.registers[CX] as usize;
                let buffer: Vec<u8> =
                    (0..len).map(|offset| cpu.memory.read_byte(offset as u16)).collect();
                let status = self.disk.write(addr, &buffer);
                cpu.zero_flag = status != 0;
            }
            0x03 => {
                let status = self.disk.status();
                cpu.registers[AX] = status;
                cpu.zero_flag = status != 0;
            }
            0x04 => {
                let name = read_guest_string(cpu, cpu.registers[BX], 63);
                let status = self.disk.create_file(&name);
                cpu.zero_flag = status != 0;
            }
            0x05 => {
                let name = read_guest_string(cpu, cpu.registers[BX], 63);
                let status = self.disk.delete_file(&name);
                cpu.zero_flag = status != 0;
            }
            _ => cpu.zero_flag = true,
        }
    }

    /// Copies the edited line into guest memory NUL-terminated, truncating
    /// to what fits, then resets the editor.
    fn copy_line_to_memory(&mut self, cpu: &mut Cpu, addr: u16) {
        let max = cpu.memory.byte_limit();
        let mut count = self.input.len();
        if addr as usize + count + 1 > max {
            count = max.saturating_sub(addr as usize).saturating_sub(1);
        }
        for (offset, byte) in self.input.as_bytes()[..count].iter().enumerate() {
            cpu.memory.write_byte(addr + offset as u16, *byte);
        }
        cpu.memory.write_byte(addr + count as u16, 0);
        self.input.clear();
        self.line_ready = false;
        self.read_line_active = false;
        self.history_cursor = None;
    }
}

/// NUL-terminated guest string through the canonical byte accessors.
fn read_guest_string(cpu: &Cpu, addr: u16, max: usize) -> String {
    let mut text = String::new();
    let limit = cpu.memory.byte_limit();
    let mut at = addr as usize;
    while at < limit && text.len() < max {
        let byte = cpu.memory.read_byte(at as u16);
        if byte == 0 {
            break;
        }
        text.push(byte as char);
        at += 1;
    }
    text
}
