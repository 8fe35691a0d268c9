use std::fs;
use std::path::Path;

use dotclock::nes::Nes;

const ROM: &str = "tests/roms/nestest.nes";
const LOG: &str = "tests/roms/nestest.log";
/// Lines before nestest starts exercising unofficial opcodes.
const OFFICIAL_LINES: usize = 5003;

fn state_columns(line: &str) -> (&str, &str) {
    let pc = line.get(..4).unwrap_or(line);
    let regs = line.find("A:").map_or("", |at| line[at..].trim_end());
    (pc, regs)
}

fn load() -> Option<(Nes, String)> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let rom = fs::read(root.join(ROM)).ok()?;
    let log = fs::read_to_string(root.join(LOG)).ok()?;
    let mut nes = Nes::new(&rom, true, None).unwrap();
    nes.set_pc(0xC000);
    Some((nes, log))
}

fn run_and_compare(limit: usize) {
    let Some((mut nes, log)) = load() else {
        eprintln!("skipping: {ROM} or {LOG} not present");
        return;
    };

    for (idx, expected) in log.lines().take(limit).enumerate() {
        nes.step().unwrap();
        let ours = nes.take_trace().pop().unwrap();
        assert_eq!(
            state_columns(&ours),
            state_columns(expected),
            "line {}\n  ours:     {ours}\n  expected: {expected}",
            idx + 1
        );
    }
}

#[test]
fn official_opcodes_match_reference_log() {
    run_and_compare(OFFICIAL_LINES);
}

#[test]
fn full_log_matches_including_unofficial_opcodes() {
    run_and_compare(usize::MAX);
}

#[test]
fn automation_mode_reports_no_errors() {
    let Some((mut nes, _)) = load() else {
        return;
    };
    nes.set_trace_logging(false);
    // The final official/unofficial result bytes land in $02 and $03.
    while nes.pc() != 0xC66E && nes.instructions() < 10_000 {
        nes.step().unwrap();
    }
    assert_eq!(nes.pc(), 0xC66E);
    assert_eq!(nes.peek_mem(0x0002), 0x00);
    assert_eq!(nes.peek_mem(0x0003), 0x00);
}
