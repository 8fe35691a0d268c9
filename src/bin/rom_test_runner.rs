use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use dotclock::logger;
use dotclock::nes::Nes;
use quick_xml::Reader;
use quick_xml::events::Event;
use sha1::{Digest, Sha1};

/// Result byte written at $6000 while a test is still running.
const STATUS_RUNNING: u8 = 0x80;
/// Result byte asking the host to press reset after a short delay.
const STATUS_NEEDS_RESET: u8 = 0x81;
const STATUS_SIGNATURE: [u8; 3] = [0xDE, 0xB0, 0x61];
const RESET_DELAY_FRAMES: u32 = 6;

#[derive(Debug, Clone)]
struct SuiteTest {
    filename: String,
    system: String,
    runframes: u32,
    tvsha1: String,
    recordedinput: String,
}

enum Job<'a> {
    Status(&'a PathBuf),
    Suite(&'a SuiteTest),
}

impl Job<'_> {
    fn name(&self) -> String {
        match self {
            Job::Status(path) => path.display().to_string(),
            Job::Suite(test) => test.filename.clone(),
        }
    }

    fn run(&self, cfg: &Config) -> Result<Outcome> {
        match self {
            Job::Status(path) => run_status_rom(path, cfg),
            Job::Suite(test) => run_suite_test(test, cfg),
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Pass(&'static str),
    Fail(String),
}

#[derive(Debug, Clone)]
struct Config {
    suite: Option<PathBuf>,
    rom_root: PathBuf,
    roms: Vec<PathBuf>,
    max_tests: usize,
    max_frames: u32,
    include_recorded_input: bool,
    include_pal: bool,
    contains: Vec<String>,
    extra_frames: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            suite: None,
            rom_root: PathBuf::from("external/nes-test-roms"),
            roms: Vec::new(),
            max_tests: 80,
            max_frames: 3_600,
            include_recorded_input: false,
            include_pal: false,
            contains: Vec::new(),
            extra_frames: 0,
        }
    }
}

/// Parses the value following `flag`.
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
            "--suite" => cfg.suite = Some(flag_value(&mut args, "--suite")?),
            "--rom-root" => cfg.rom_root = flag_value(&mut args, "--rom-root")?,
            "--max-tests" => cfg.max_tests = flag_value(&mut args, "--max-tests")?,
            "--max-frames" => cfg.max_frames = flag_value(&mut args, "--max-frames")?,
            "--extra-frames" => cfg.extra_frames = flag_value(&mut args, "--extra-frames")?,
            "--contains" => {
                let filter: String = flag_value(&mut args, "--contains")?;
                cfg.contains.push(filter.to_lowercase());
            }
            "--include-recorded-input" => cfg.include_recorded_input = true,
            "--include-pal" => cfg.include_pal = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other if other.starts_with("--") => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
            rom => cfg.roms.push(PathBuf::from(rom)),
        }
    }

    if cfg.suite.is_none() && cfg.roms.is_empty() {
        anyhow::bail!("nothing to run: pass ROM paths or --suite <xml>");
    }
    Ok(cfg)
}

fn print_help() {
    println!(
        "Test ROM runner for dotclock\n\n\
Usage:\n\
  cargo run --bin rom_test_runner -- [options] [rom.nes ...]\n\n\
ROMs given directly are judged by the status byte protocol at $6000.\n\n\
Options:\n\
  --suite <path>                 Path to test_roms.xml (framebuffer SHA-1 mode)\n\
  --rom-root <path>              Root path containing suite ROM files\n\
  --max-tests <n>                Maximum number of suite tests to run (default 80)\n\
  --max-frames <n>               Frame limit for status protocol ROMs (default 3600)\n\
  --include-recorded-input       Include suite tests that replay input\n\
  --include-pal                  Include PAL suite tests\n\
  --contains <substr>            Only run suite tests whose filename contains this text (repeatable)\n\
  --extra-frames <n>             Add n frames after the suite runframes (default 0)\n\
  -h, --help                     Show this help\n"
    );
}

fn parse_suite_xml(path: &Path) -> Result<Vec<SuiteTest>> {
    let xml = fs::read_to_string(path)
        .with_context(|| format!("failed to read suite XML: {}", path.display()))?;
    parse_suite(&xml)
}

fn parse_suite(xml: &str) -> Result<Vec<SuiteTest>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut tests = Vec::new();
    let mut current: Option<SuiteTest> = None;
    let mut reading_tvsha1 = false;
    let mut reading_recorded = false;

    loop {
        let text = match reader.read_event() {
            Ok(Event::Start(e)) => {
                match e.name().as_ref() {
                    b"test" => {
                        let mut test = SuiteTest {
                            filename: String::new(),
                            system: String::new(),
                            runframes: 0,
                            tvsha1: String::new(),
                            recordedinput: String::new(),
                        };
                        for attr in e.attributes().flatten() {
                            let value = attr
                                .decode_and_unescape_value(reader.decoder())
                                .map(|v| v.to_string())
                                .unwrap_or_default();
                            match attr.key.as_ref() {
                                b"filename" => test.filename = value,
                                b"system" => test.system = value,
                                b"runframes" => test.runframes = value.parse().unwrap_or(0),
                                _ => {}
                            }
                        }
                        current = Some(test);
                    }
                    b"tvsha1" => reading_tvsha1 = true,
                    b"recordedinput" => reading_recorded = true,
                    _ => {}
                }
                continue;
            }
            Ok(Event::Text(e)) => e.decode().map(|v| v.to_string()).unwrap_or_default(),
            Ok(Event::CData(e)) => e.decode().map(|v| v.to_string()).unwrap_or_default(),
            Ok(Event::End(e)) => {
                match e.name().as_ref() {
                    b"tvsha1" => reading_tvsha1 = false,
                    b"recordedinput" => reading_recorded = false,
                    b"test" => {
                        if let Some(mut test) = current.take() {
                            test.tvsha1 = test.tvsha1.trim().to_string();
                            test.recordedinput = test.recordedinput.trim().to_string();
                            tests.push(test);
                        }
                    }
                    _ => {}
                }
                continue;
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                anyhow::bail!("failed to parse suite XML: {err}");
            }
            _ => continue,
        };

        if let Some(test) = current.as_mut() {
            if reading_tvsha1 {
                test.tvsha1.push_str(&text);
            } else if reading_recorded {
                test.recordedinput.push_str(&text);
            }
        }
    }

    Ok(tests)
}

fn should_run(test: &SuiteTest, cfg: &Config) -> bool {
    if !cfg.include_pal && test.system.eq_ignore_ascii_case("pal") {
        return false;
    }

    if !cfg.include_recorded_input && !test.recordedinput.is_empty() {
        return false;
    }

    if !cfg.contains.is_empty() {
        let lower = test.filename.to_lowercase();
        if !cfg.contains.iter().any(|f| lower.contains(f)) {
            return false;
        }
    }

    true
}

/// Base64 SHA-1 of the frame in the given byte layout. `layout` maps an
/// ARGB pixel to the bytes hashed for it.
fn hash_frame(frame: &[u32], layout: fn([u8; 4]) -> Vec<u8>) -> String {
    let mut hasher = Sha1::new();
    for pixel in frame {
        hasher.update(layout(pixel.to_be_bytes()));
    }
    BASE64_STANDARD.encode(hasher.finalize())
}

fn rgba_bytes([a, r, g, b]: [u8; 4]) -> Vec<u8> {
    vec![r, g, b, a]
}

fn rgb_bytes([_, r, g, b]: [u8; 4]) -> Vec<u8> {
    vec![r, g, b]
}

fn argb_bytes(pixel: [u8; 4]) -> Vec<u8> {
    pixel.to_vec()
}

fn bgra_bytes([a, r, g, b]: [u8; 4]) -> Vec<u8> {
    vec![b, g, r, a]
}

const FRAME_LAYOUTS: [(&str, fn([u8; 4]) -> Vec<u8>); 4] = [
    ("rgba", rgba_bytes),
    ("rgb", rgb_bytes),
    ("argb", argb_bytes),
    ("bgra", bgra_bytes),
];

/// Recorded input is a base64 string with one controller byte per frame.
fn decode_recorded_input(recorded: &str) -> Result<Vec<u8>> {
    if recorded.is_empty() {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(recorded)
        .context("recorded input is not valid base64")
}

fn run_suite_test(test: &SuiteTest, cfg: &Config) -> Result<Outcome> {
    let rom_path = cfg.rom_root.join(&test.filename);
    let rom = fs::read(&rom_path)
        .with_context(|| format!("failed to read ROM {}", rom_path.display()))?;
    let mut nes = Nes::new(&rom, false, None)?;
    let input = decode_recorded_input(&test.recordedinput)?;

    let total_frames = test.runframes.saturating_add(cfg.extra_frames);
    for frame in 0..total_frames {
        let buttons = input.get(frame as usize).copied().unwrap_or(0);
        nes.set_input_controller(0xFF, false);
        nes.set_input_controller(buttons, true);
        nes.step_frame(false)?;
    }

    for (name, layout) in FRAME_LAYOUTS {
        if hash_frame(nes.frame_buffer(), layout) == test.tvsha1 {
            return Ok(Outcome::Pass(name));
        }
    }

    let (a, x, y, p, sp, pc) = nes.debug_cpu_regs();
    let (ctrl, mask, status) = nes.debug_ppu_regs();
    let (nmis, irqs) = nes.debug_interrupt_counts();
    Ok(Outcome::Fail(format!(
        "expected: {}\n  got rgba: {}\n  pc=${pc:04X} a=${a:02X} x=${x:02X} y=${y:02X} p=${p:02X} sp=${sp:02X} cycles={}\n  ppu ctrl=${ctrl:02X} mask=${mask:02X} status=${status:02X} nmi={nmis} irq={irqs}",
        test.tvsha1,
        hash_frame(nes.frame_buffer(), rgba_bytes),
        nes.cycles(),
    )))
}

fn status_message(nes: &Nes) -> String {
    let mut text = String::new();
    for addr in 0x6004u16..0x7000 {
        let byte = nes.peek_mem(addr);
        if byte == 0 {
            break;
        }
        text.push(byte as char);
    }
    text.trim().to_string()
}

fn has_status_signature(nes: &Nes) -> bool {
    (0..3).all(|i| nes.peek_mem(0x6001 + i) == STATUS_SIGNATURE[i as usize])
}

/// Runs a ROM that reports through $6000 until it posts a final result.
fn run_status_rom(path: &Path, cfg: &Config) -> Result<Outcome> {
    let rom =
        fs::read(path).with_context(|| format!("failed to read ROM {}", path.display()))?;
    let mut nes = Nes::new(&rom, false, None)?;
    let mut reset_countdown: Option<u32> = None;

    for _ in 0..cfg.max_frames {
        nes.step_frame(false)?;
        if !has_status_signature(&nes) {
            continue;
        }

        if let Some(remaining) = reset_countdown {
            if remaining == 0 {
                nes.reset();
                reset_countdown = None;
            } else {
                reset_countdown = Some(remaining - 1);
            }
            continue;
        }

        match nes.peek_mem(0x6000) {
            STATUS_RUNNING => {}
            STATUS_NEEDS_RESET => reset_countdown = Some(RESET_DELAY_FRAMES),
            0x00 => return Ok(Outcome::Pass("status")),
            code => {
                return Ok(Outcome::Fail(format!(
                    "status ${code:02X}: {}",
                    status_message(&nes)
                )));
            }
        }
    }

    Ok(Outcome::Fail(format!(
        "no result after {} frames (pc=${:04X})",
        cfg.max_frames,
        nes.pc()
    )))
}

fn main() -> Result<()> {
    logger::init();
    let cfg = parse_args()?;
    let start = Instant::now();

    let suite_tests: Vec<SuiteTest> = match &cfg.suite {
        Some(suite) => parse_suite_xml(suite)?
            .into_iter()
            .filter(|t| should_run(t, &cfg))
            .take(cfg.max_tests)
            .collect(),
        None => Vec::new(),
    };
    let jobs: Vec<Job> = cfg
        .roms
        .iter()
        .map(Job::Status)
        .chain(suite_tests.iter().map(Job::Suite))
        .collect();

    println!("Running {} test(s)", jobs.len());

    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;

    let total = jobs.len();
    for (idx, job) in jobs.iter().enumerate() {
        let label = format!("[{}/{}] {}", idx + 1, total, job.name());
        match job.run(&cfg) {
            Ok(Outcome::Pass(how)) => {
                passed += 1;
                println!("PASS {label} [{how}]");
            }
            Ok(Outcome::Fail(detail)) => {
                failed += 1;
                println!("FAIL {label}\n  {detail}");
            }
            Err(err) => {
                skipped += 1;
                println!("SKIP {label} -> {err:#}");
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f32();
    println!();
    println!("Summary:");
    println!("- Passed: {passed}");
    println!("- Failed: {failed}");
    println!("- Skipped: {skipped}");
    println!("- Runtime: {:.2}s", elapsed);

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_xml_collects_hashes_and_input() {
        let xml = r#"<testroms>
            <test filename="cpu/a.nes" system="NTSC" runframes="30">
                <tvsha1>abc=</tvsha1>
            </test>
            <test filename="ppu/b.nes" system="PAL" runframes="12">
                <tvsha1><![CDATA[def=]]></tvsha1>
                <recordedinput>AAE=</recordedinput>
            </test>
        </testroms>"#;
        let tests = parse_suite(xml).unwrap();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].filename, "cpu/a.nes");
        assert_eq!(tests[0].runframes, 30);
        assert_eq!(tests[0].tvsha1, "abc=");
        assert_eq!(tests[1].tvsha1, "def=");
        assert_eq!(decode_recorded_input(&tests[1].recordedinput).unwrap(), [0, 1]);

        let cfg = Config::default();
        assert!(should_run(&tests[0], &cfg));
        assert!(!should_run(&tests[1], &cfg));
    }

    #[test]
    fn frame_hash_layouts_differ() {
        let frame = [0xFF10_2030u32; 4];
        let rgba = hash_frame(&frame, rgba_bytes);
        let rgb = hash_frame(&frame, rgb_bytes);
        assert_ne!(rgba, rgb);
        assert_eq!(rgba.len(), 28);
    }
}
