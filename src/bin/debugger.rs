use std::fs;
use std::io::{BufRead, Write};

use anyhow::{Context, Result, bail};
use dotclock::logger;
use dotclock::nes::Nes;

const HELP: &str = "\
Commands:
  step, s [n]        - Step n instructions (default 1)
  frame, f [n]       - Run n frames, stopping at breakpoints
  line, l            - Run to the next scanline
  bp <addr>          - Set breakpoint at address
  bd <addr>          - Disable breakpoint at address
  bc <addr>          - Remove breakpoint at address
  bl                 - List breakpoints
  regs, r            - Show CPU registers
  ppu                - Show PPU state
  mapper             - Show mapper state
  mem <addr> [len]   - Peek memory without side effects
  poke <addr> <val>  - Write a byte without side effects
  trace on|off|dump  - Toggle or print the instruction trace
  events             - Show recent debug events
  save <file>        - Save state as JSON
  load <file>        - Load state from JSON
  reset              - Soft reset
  reboot             - Power cycle
  quit, q            - Exit debugger";

fn main() -> Result<()> {
    logger::init();
    println!("dotclock debugger");
    println!("=================");
    println!();

    let Some(rom_path) = std::env::args().nth(1) else {
        println!("Usage: dotclock_debug <rom.nes>");
        println!();
        println!("{HELP}");
        return Ok(());
    };

    println!("Loading ROM: {rom_path}");
    let rom = fs::read(&rom_path).with_context(|| format!("failed to read ROM: {rom_path}"))?;
    let mut nes = Nes::new(&rom, false, None)?;

    println!("Mapper: {}", nes.mapper_name());
    println!("SHA-1: {}", nes.rom_sha1());
    println!();
    print_regs(&nes);
    println!();
    println!("Type 'help' for commands");

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            continue;
        };

        if matches!(command, "quit" | "q") {
            println!("Goodbye!");
            break;
        }
        if let Err(err) = run_command(&mut nes, command, &parts[1..]) {
            println!("error: {err:#}");
        }
    }

    Ok(())
}

fn run_command(nes: &mut Nes, command: &str, args: &[&str]) -> Result<()> {
    match command {
        "help" | "h" => println!("{HELP}"),
        "step" | "s" => {
            let count = parse_count(args.first())?;
            for _ in 0..count {
                nes.step()?;
                if nes.trace_logging() {
                    print_trace(nes);
                }
            }
            print_regs(nes);
        }
        "frame" | "f" => {
            let count = parse_count(args.first())?;
            for _ in 0..count {
                if nes.step_frame(false)? {
                    println!("Breakpoint hit at ${:04X}", nes.pc());
                    break;
                }
            }
            print_regs(nes);
        }
        "line" | "l" => {
            if nes.step_frame(true)? {
                println!("Breakpoint hit at ${:04X}", nes.pc());
            }
            print_regs(nes);
        }
        "bp" => {
            let addr = parse_addr(args.first())?;
            nes.set_breakpoint(addr, true);
            println!("Breakpoint set at ${addr:04X}");
        }
        "bd" => {
            let addr = parse_addr(args.first())?;
            nes.set_breakpoint(addr, false);
            println!("Breakpoint disabled at ${addr:04X}");
        }
        "bc" => {
            let addr = parse_addr(args.first())?;
            nes.remove_breakpoint(addr);
            println!("Breakpoint removed at ${addr:04X}");
        }
        "bl" => {
            let breakpoints = nes.breakpoints();
            if breakpoints.is_empty() {
                println!("No breakpoints");
            }
            for (addr, enabled) in breakpoints {
                let state = if enabled { "on" } else { "off" };
                println!("  ${addr:04X} {state}");
            }
        }
        "regs" | "r" => print_regs(nes),
        "ppu" => {
            let (scanline, dot) = nes.ppu_position();
            let (ctrl, mask, status) = nes.debug_ppu_regs();
            println!("PPU State:");
            println!("  Frame: {}", nes.frame_count());
            println!("  Scanline: {scanline}, Dot: {dot}");
            println!("  $2000 (ctrl):   {ctrl:08b}");
            println!("  $2001 (mask):   {mask:08b}");
            println!("  $2002 (status): {status:08b}");
        }
        "mapper" => println!("{}: {}", nes.mapper_name(), nes.debug_mapper_state()),
        "mem" => {
            let addr = parse_addr(args.first())?;
            let len = match args.get(1) {
                Some(value) => parse_hex(value)?,
                None => 16,
            };
            dump_memory(nes, addr, len);
        }
        "poke" => {
            let addr = parse_addr(args.first())?;
            let Some(value) = args.get(1) else {
                bail!("usage: poke <addr> <value>");
            };
            let value = u8::try_from(parse_hex(value)?).context("value must fit in a byte")?;
            nes.poke_mem(addr, value);
            println!("${addr:04X} = {value:02X}");
        }
        "trace" => match args.first().copied() {
            Some("on") => {
                nes.set_trace_logging(true);
                println!("Tracing enabled");
            }
            Some("off") => {
                nes.set_trace_logging(false);
                println!("Tracing disabled");
            }
            Some("dump") => print_trace(nes),
            _ => bail!("usage: trace on|off|dump"),
        },
        "events" => {
            for event in nes.debug_recent_events(32) {
                println!("  {event}");
            }
        }
        "save" => {
            let Some(path) = args.first() else {
                bail!("usage: save <file>");
            };
            fs::write(path, nes.save_state_json()?)
                .with_context(|| format!("failed to write {path}"))?;
            println!("State saved to {path}");
        }
        "load" => {
            let Some(path) = args.first() else {
                bail!("usage: load <file>");
            };
            let json =
                fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
            nes.load_state_json(&json)?;
            println!("State loaded from {path}");
            print_regs(nes);
        }
        "reset" => {
            nes.reset();
            print_regs(nes);
        }
        "reboot" => {
            nes.reboot();
            print_regs(nes);
        }
        _ => println!("Unknown command: {command}. Type 'help' for available commands."),
    }
    Ok(())
}

fn print_regs(nes: &Nes) {
    let (a, x, y, p, sp, pc) = nes.debug_cpu_regs();
    println!("PC: ${pc:04X}  A: ${a:02X}  X: ${x:02X}  Y: ${y:02X}  SP: ${sp:02X}");
    println!("P: {p:08b} (NV-BDIZC)  CYC: {}", nes.cycles());
    if let Some(fault) = nes.fault() {
        println!("Halted: {fault}");
    }
}

fn print_trace(nes: &mut Nes) {
    for line in nes.take_trace() {
        println!("{line}");
    }
}

fn dump_memory(nes: &Nes, addr: u16, len: usize) {
    let bytes: Vec<u8> = (0..len)
        .map(|offset| nes.peek_mem(addr.wrapping_add(offset as u16)))
        .collect();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02X}")).collect();
        println!(
            "{:04X}: {}",
            addr.wrapping_add((row * 16) as u16),
            hex.join(" ")
        );
    }
}

fn parse_hex(value: &str) -> Result<usize> {
    let digits = value.trim_start_matches('$').trim_start_matches("0x");
    usize::from_str_radix(digits, 16).with_context(|| format!("invalid hex value: {value}"))
}

fn parse_addr(value: Option<&&str>) -> Result<u16> {
    let Some(value) = value else {
        bail!("missing address");
    };
    u16::try_from(parse_hex(value)?).context("address must fit in 16 bits")
}

fn parse_count(value: Option<&&str>) -> Result<usize> {
    match value {
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid count: {value}")),
        None => Ok(1),
    }
}
