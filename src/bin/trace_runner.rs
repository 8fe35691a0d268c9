use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use dotclock::logger;
use dotclock::nes::Nes;

#[derive(Debug, Clone)]
struct Config {
    rom: Option<PathBuf>,
    output: Option<PathBuf>,
    reference: Option<PathBuf>,
    instructions: usize,
    start_pc: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rom: None,
            output: None,
            reference: None,
            instructions: 10_000,
            start_pc: None,
        }
    }
}

fn flag_value<T: FromStr>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T> {
    let value = args
        .next()
        .with_context(|| format!("{flag} requires a value; see --help"))?;
    value
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("invalid {flag} value: {value}"))
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--out" | "-o" => cfg.output = Some(flag_value(&mut args, "--out")?),
            "--diff" => cfg.reference = Some(flag_value(&mut args, "--diff")?),
            "--count" | "-n" => cfg.instructions = flag_value(&mut args, "--count")?,
            "--start-pc" => {
                let value: String = flag_value(&mut args, "--start-pc")?;
                let digits = value.trim_start_matches('$').trim_start_matches("0x");
                cfg.start_pc = Some(
                    u16::from_str_radix(digits, 16)
                        .with_context(|| format!("invalid --start-pc value: {value}"))?,
                );
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other if other.starts_with('-') => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
            rom => cfg.rom = Some(PathBuf::from(rom)),
        }
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "Instruction trace writer for dotclock\n\n\
Usage:\n\
  cargo run --bin trace_runner -- [options] <rom.nes>\n\n\
Options:\n\
  --count, -n <n>        Instructions to trace (default 10000)\n\
  --start-pc <hex>       Start execution here (nestest automation uses C000)\n\
  --out, -o <path>       Write the trace to a file instead of stdout\n\
  --diff <path>          Compare against a reference log and report the first mismatch\n\
  -h, --help             Show this help\n"
    );
}

/// Registers and position columns of a trace line, ignoring disassembly
/// text that differs between reference emulators.
fn state_columns(line: &str) -> (&str, &str) {
    let pc = line.get(..4).unwrap_or(line);
    let regs = line.find("A:").map_or("", |at| &line[at..]);
    (pc, regs.trim_end())
}

fn first_mismatch(ours: &[String], reference: &str) -> Option<(usize, String, String)> {
    for (idx, (line, expected)) in ours.iter().zip(reference.lines()).enumerate() {
        if state_columns(line) != state_columns(expected) {
            return Some((idx + 1, line.clone(), expected.to_string()));
        }
    }
    None
}

fn main() -> Result<()> {
    logger::init();
    let cfg = parse_args()?;
    let Some(rom_path) = &cfg.rom else {
        print_help();
        anyhow::bail!("missing ROM path");
    };

    let rom = fs::read(rom_path)
        .with_context(|| format!("failed to read ROM: {}", rom_path.display()))?;
    let mut nes = Nes::new(&rom, true, None)?;
    if let Some(pc) = cfg.start_pc {
        nes.set_pc(pc);
    }

    let mut lines = Vec::with_capacity(cfg.instructions);
    while lines.len() < cfg.instructions {
        if let Err(err) = nes.step() {
            lines.extend(nes.take_trace());
            eprintln!("stopped after {} instruction(s): {err:#}", lines.len());
            break;
        }
        lines.extend(nes.take_trace());
    }
    lines.truncate(cfg.instructions);

    match &cfg.output {
        Some(path) => {
            let file = fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let mut out = BufWriter::new(file);
            for line in &lines {
                writeln!(out, "{line}")?;
            }
            out.flush()?;
        }
        None if cfg.reference.is_none() => {
            let mut out = BufWriter::new(std::io::stdout().lock());
            for line in &lines {
                writeln!(out, "{line}")?;
            }
            out.flush()?;
        }
        None => {}
    }

    if let Some(path) = &cfg.reference {
        let reference = fs::read_to_string(path)
            .with_context(|| format!("failed to read reference log: {}", path.display()))?;
        match first_mismatch(&lines, &reference) {
            Some((line_no, ours, expected)) => {
                println!("Mismatch at line {line_no}:");
                println!("  expected: {expected}");
                println!("  got:      {ours}");
                std::process::exit(1);
            }
            None => println!(
                "{} line(s) match {}",
                lines.len().min(reference.lines().count()),
                path.display()
            ),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_ignores_disassembly_text() {
        let ours = vec![
            "C000  4C F5 C5  JMP $C5F5                       A:00 X:00 Y:00 P:24 SP:FD PPU:  0, 21 CYC:7"
                .to_string(),
        ];
        let reference =
            "C000  4C F5 C5  JMP $C5F5   A:00 X:00 Y:00 P:24 SP:FD PPU:  0, 21 CYC:7\n";
        assert_eq!(first_mismatch(&ours, reference), None);
    }

    #[test]
    fn mismatch_reports_the_first_divergent_line() {
        let ours = vec![
            "C000  EA  NOP  A:00 X:00 Y:00 P:24 SP:FD PPU:  0, 21 CYC:7".to_string(),
            "C001  EA  NOP  A:01 X:00 Y:00 P:24 SP:FD PPU:  0, 27 CYC:9".to_string(),
        ];
        let reference = "C000  EA  NOP  A:00 X:00 Y:00 P:24 SP:FD PPU:  0, 21 CYC:7\n\
                         C001  EA  NOP  A:00 X:00 Y:00 P:24 SP:FD PPU:  0, 27 CYC:9\n";
        let (line_no, _, expected) = first_mismatch(&ours, reference).unwrap();
        assert_eq!(line_no, 2);
        assert!(expected.contains("A:00"));
    }
}
