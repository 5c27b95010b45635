// End-to-end scenarios: source text through the assembler, the loader and
// the executor, with a scripted host standing in for the terminal.

use em16::assembler;
use em16::disk::Disk;
use em16::host::{Clock, ControlKey, Keyboard, ProgramStore, CONTROL_KEYS};
use em16::{Bios, Emulator, State};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tempfile::TempDir;

const AX: usize = 0;
const BX: usize = 1;
const CX: usize = 2;

#[derive(Default)]
struct ScriptedKeyboard {
    chars: VecDeque<char>,
    pressed: [bool; CONTROL_KEYS],
}

impl ScriptedKeyboard {
    fn type_line(&mut self, text: &str) {
        self.chars.extend(text.chars());
        self.pressed[ControlKey::Enter.index()] = true;
    }
}

impl Keyboard for ScriptedKeyboard {
    fn next_char(&mut self) -> Option<char> {
        self.chars.pop_front()
    }

    fn pressed(&mut self, key: ControlKey) -> bool {
        std::mem::take(&mut self.pressed[key.index()])
    }

    fn held(&mut self, key: ControlKey) -> bool {
        self.pressed(key)
    }
}

#[derive(Default)]
struct ManualClock {
    slept: Duration,
}

impl Clock for ManualClock {
    fn sleep(&mut self, duration: Duration) {
        self.slept += duration;
    }
}

struct FixedStore {
    programs: Vec<(String, Vec<u8>)>,
}

impl ProgramStore for FixedStore {
    fn list(&self) -> Vec<String> {
        self.programs.iter().map(|(name, _)| name.clone()).collect()
    }

    fn load(&self, name: &str) -> io::Result<Vec<u8>> {
        self.programs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }
}

struct Machine {
    emulator: Emulator,
    keyboard: ScriptedKeyboard,
    clock: ManualClock,
    store: FixedStore,
    dir: TempDir,
}

/// Assembles `source`, boots it as the only image in the store and returns
/// the whole machine ready to tick.
fn boot(source: &str) -> Machine {
    let image = assembler::assemble(source).expect("source must assemble");
    let dir = TempDir::new().unwrap();
    let disk = Disk::open(&dir.path().join("disk.img")).unwrap();
    let store = FixedStore {
        programs: vec![("test.bin".to_string(), image.to_bytes())],
    };
    let bios = Bios::new(disk, &store);
    let mut emulator = Emulator::new(4096, 1024, bios);
    assert!(emulator.bios.launch_selected(&mut emulator.cpu, &store));
    Machine {
        emulator,
        keyboard: ScriptedKeyboard::default(),
        clock: ManualClock::default(),
        store,
        dir,
    }
}

impl Machine {
    fn run_to_halt(&mut self) {
        for _ in 0..100_000 {
            if !self.emulator.cpu.running() {
                assert_eq!(self.emulator.cpu.state, State::Halted, "guest must halt cleanly");
                return;
            }
            self.emulator
                .tick(&mut self.keyboard, &mut self.clock, &self.store);
        }
        panic!("program did not halt");
    }
}

fn run_source(source: &str) -> Machine {
    let mut machine = boot(source);
    machine.run_to_halt();
    machine
}

#[test]
fn add_of_two_registers() {
    let m = run_source(
        ".org 0x1000
         mov ax, 5
         mov bx, 3
         add ax, bx
         hlt",
    );
    assert_eq!(m.emulator.cpu.registers[AX], 8);
    assert_eq!(m.emulator.cpu.registers[BX], 3);
    assert!(!m.emulator.cpu.zero_flag);
    assert!(!m.emulator.cpu.carry_flag);
}

#[test]
fn add_overflow_wraps_and_carries() {
    let m = run_source(
        ".org 0x1000
         mov ax, 0xFFFF
         add ax, 1
         hlt",
    );
    assert_eq!(m.emulator.cpu.registers[AX], 0);
    assert!(m.emulator.cpu.zero_flag);
    assert!(m.emulator.cpu.carry_flag);
}

#[test]
fn shift_into_the_sign_bit() {
    let m = run_source(
        ".org 0x1000
         mov ax, 1
         shl ax, 15
         hlt",
    );
    assert_eq!(m.emulator.cpu.registers[AX], 0x8000);
    assert!(m.emulator.cpu.sign_flag);
}

#[test]
fn countdown_loop_runs_three_times() {
    let m = run_source(
        ".org 0x1000
         mov cx, 3
loop:
         sub cx, 1
         jnz loop
         hlt",
    );
    assert_eq!(m.emulator.cpu.registers[CX], 0);
    assert!(m.emulator.cpu.zero_flag);
}

#[test]
fn push_pop_leaves_registers_and_stack_alone() {
    let m = run_source(
        ".org 0x1000
         mov ax, 0x1234
         mov bx, 0x5678
         push ax
         push bx
         pop bx
         pop ax
         hlt",
    );
    assert_eq!(m.emulator.cpu.registers[AX], 0x1234);
    assert_eq!(m.emulator.cpu.registers[BX], 0x5678);
    assert_eq!(m.emulator.cpu.sp, (4096 + 1024) as u16);
}

#[test]
fn pusha_popa_is_the_identity() {
    let m = run_source(
        ".org 0x1000
         mov ax, 1
         mov bx, 2
         mov cx, 3
         mov dx, 4
         pusha
         popa
         hlt",
    );
    assert_eq!(m.emulator.cpu.registers, [1, 2, 3, 4]);
    assert_eq!(m.emulator.cpu.sp, (4096 + 1024) as u16);
}

#[test]
fn compare_steers_signed_looking_branches() {
    let m = run_source(
        ".org 0x1000
         mov ax, 5
         cmp ax, 3
         jg above
         mov bx, 1
         hlt
above:
         mov bx, 2
         hlt",
    );
    assert_eq!(m.emulator.cpu.registers[BX], 2);

    let m = run_source(
        ".org 0x1000
         mov ax, 2
         cmp ax, 3
         jl below
         mov bx, 1
         hlt
below:
         mov bx, 2
         hlt",
    );
    assert_eq!(m.emulator.cpu.registers[BX], 2);
}

#[test]
fn calls_nest_and_return() {
    let m = run_source(
        ".org 0x1000
         mov ax, 1
         call bump
         call bump
         hlt
bump:
         add ax, 10
         ret",
    );
    assert_eq!(m.emulator.cpu.registers[AX], 21);
    assert_eq!(m.emulator.cpu.sp, (4096 + 1024) as u16);
}

#[test]
fn loaded_image_lands_at_reported_addresses() {
    let source = ".org 0x1000\ngreet: db \"ok\"\n mov ax, greet\n hlt";
    let image = assembler::assemble(source).unwrap();
    let m = run_source(source);
    // Code words appear at the origin, data at its recorded base.
    assert_eq!(m.emulator.cpu.memory.word(0x1000 / 2), image.code[0]);
    assert_eq!(m.emulator.cpu.memory.read_byte(0x0100), b'o');
    assert_eq!(m.emulator.cpu.memory.read_byte(0x0101), b'k');
    assert_eq!(m.emulator.cpu.registers[AX], 0x0100);
}

#[test]
fn print_interrupt_collects_output() {
    let m = run_source(
        ".org 0x1000
msg: db \"hello\",0
         mov ax, msg
         int 2
         mov ax, 0x01
         int 3
         hlt",
    );
    assert_eq!(m.emulator.bios.output(), "hello\n");
}

#[test]
fn memory_movs_round_trip_through_ram() {
    let m = run_source(
        ".org 0x1000
slot: dw 0
         mov ax, 0xBEEF
         mov [slot], ax
         mov bx, [slot]
         hlt",
    );
    assert_eq!(m.emulator.cpu.registers[BX], 0xBEEF);
}

#[test]
fn sleep_interrupt_waits_on_the_host_clock() {
    let m = run_source(
        ".org 0x1000
         mov ax, 40
         int 4
         hlt",
    );
    assert_eq!(m.clock.slept, Duration::from_millis(40));
}

#[test]
fn read_line_is_cooperative_until_enter() {
    let mut machine = boot(
        ".org 0x1000
wait:
         int 9
         cmp ax, 0
         jz wait
         mov ax, 100
         int 2
         hlt",
    );
    // Let the guest spin on the empty line buffer for a while first.
    for _ in 0..50 {
        machine
            .emulator
            .tick(&mut machine.keyboard, &mut machine.clock, &machine.store);
    }
    assert!(machine.emulator.cpu.running());
    assert!(machine.emulator.bios.read_line_active());
    machine.keyboard.type_line("hi there");
    machine.run_to_halt();
    assert_eq!(machine.emulator.bios.output(), "hi there");
}

#[test]
fn disk_files_survive_a_reopen() {
    let machine = run_source(
        ".org 0x1000
fname: db \"a\",0
         mov ax, 0x6261      ; 'ab'
         mov [0], ax
         mov ax, 0x6463      ; 'cd'
         mov [2], ax
         mov ax, 0x04        ; create
         mov bx, fname
         int 10
         mov ax, 0x02        ; write guest bytes 0..4
         mov bx, 10240
         mov cx, 4
         int 10
         mov ax, 0x03        ; status
         int 10
         hlt",
    );
    assert_eq!(machine.emulator.cpu.registers[AX], 0, "status must be ok");
    assert!(!machine.emulator.cpu.zero_flag);

    // Drop the machine (and with it the bios' disk handle) but keep the
    // directory alive so the image can be reopened cold.
    let Machine { emulator, dir, .. } = machine;
    drop(emulator);
    let path = dir.path().join("disk.img");
    let mut disk = Disk::open(&path).unwrap();
    let entry = disk.file_entry("a").expect("directory entry persisted");
    assert_eq!(entry.start_addr, 10240);
    let mut back = [0u8; 4];
    assert_eq!(disk.read(entry.start_addr, &mut back), 0);
    assert_eq!(&back, b"abcd");
}

#[test]
fn zero_header_word_is_an_end_of_program_sentinel() {
    let dir = TempDir::new().unwrap();
    let disk = Disk::open(&dir.path().join("disk.img")).unwrap();
    let store = FixedStore {
        programs: vec![("empty.bin".to_string(), vec![0u8; 0x1002])],
    };
    let bios = Bios::new(disk, &store);
    let mut emulator = Emulator::new(4096, 1024, bios);
    assert!(emulator.bios.launch_selected(&mut emulator.cpu, &store));
    emulator.cpu.step().unwrap();
    assert_eq!(emulator.cpu.state, State::Halted);
    assert_eq!(emulator.cpu.registers, [0, 0, 0, 0]);
}

#[test]
fn forbidden_origin_never_produces_an_image() {
    let errors = assembler::assemble(".org 0xFFFE\n hlt").unwrap_err();
    assert!(errors.iter().any(|e| e.message.contains("forbidden")));
}

#[test]
fn faulting_guest_stops_for_good() {
    let mut machine = boot(
        ".org 0x1000
         mov ax, 1
         mov bx, 0
         div ax, bx
         hlt",
    );
    for _ in 0..10 {
        machine
            .emulator
            .tick(&mut machine.keyboard, &mut machine.clock, &machine.store);
    }
    assert_eq!(machine.emulator.cpu.state, State::Faulted);
    assert!(!machine.emulator.cpu.running());
}
