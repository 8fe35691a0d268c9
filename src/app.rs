use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use eframe::egui::{self, ColorImage, Key, TextureHandle, TextureOptions};

use crate::audio::AudioOutput;
use crate::nes::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP, MachineConfig, Nes,
};

const NTSC_FRAME_RATE_HZ: f64 = 60.098_813_897_440_515;
const POLL_RATE_HZ: f64 = 240.0;
const MAX_FRAMES_PER_UPDATE: u32 = 2;
const AUDIO_MAX_BUFFER_MS: usize = 40;
const FALLBACK_SAMPLE_RATE: u32 = 48_000;

const KEY_BINDINGS: [(Key, u8); 12] = [
    (Key::W, BUTTON_UP),
    (Key::ArrowUp, BUTTON_UP),
    (Key::S, BUTTON_DOWN),
    (Key::ArrowDown, BUTTON_DOWN),
    (Key::A, BUTTON_LEFT),
    (Key::ArrowLeft, BUTTON_LEFT),
    (Key::D, BUTTON_RIGHT),
    (Key::ArrowRight, BUTTON_RIGHT),
    (Key::Space, BUTTON_A),
    (Key::Z, BUTTON_A),
    (Key::X, BUTTON_B),
    (Key::Enter, BUTTON_START),
];

pub struct NesApp {
    nes: Option<Nes>,
    frame_texture: Option<TextureHandle>,
    rgba: Vec<u8>,
    status_line: String,
    loaded_rom: Option<PathBuf>,
    audio: Option<AudioOutput>,
    frame_interval: Duration,
    poll_interval: Duration,
    next_frame_at: Option<Instant>,
    paused: bool,
}

impl NesApp {
    pub fn new(cc: &eframe::CreationContext<'_>, rom: Option<PathBuf>) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());

        let audio = match AudioOutput::new() {
            Ok(audio) => Some(audio),
            Err(err) => {
                log::warn!("audio disabled: {err:#}");
                None
            }
        };

        let mut app = Self {
            nes: None,
            frame_texture: None,
            rgba: vec![0; 256 * 240 * 4],
            status_line: "Drop a .nes file or click Open ROM".to_string(),
            loaded_rom: None,
            audio,
            frame_interval: Duration::from_secs_f64(1.0 / NTSC_FRAME_RATE_HZ),
            poll_interval: Duration::from_secs_f64(1.0 / POLL_RATE_HZ),
            next_frame_at: None,
            paused: false,
        };
        if let Some(path) = rom {
            app.load_rom(&path);
        }
        app
    }

    fn load_rom(&mut self, path: &Path) {
        match self.build_machine(path) {
            Ok(nes) => {
                self.status_line = format!(
                    "Loaded {} using {}",
                    path.file_name().and_then(|f| f.to_str()).unwrap_or("ROM"),
                    nes.mapper_name()
                );
                self.nes = Some(nes);
                self.loaded_rom = Some(path.to_path_buf());
                self.frame_texture = None;
                self.next_frame_at = None;
                self.paused = false;
            }
            Err(err) => {
                log::error!("failed to load {}: {err:#}", path.display());
                self.status_line = format!("Failed to load ROM: {err:#}");
            }
        }
    }

    fn build_machine(&self, path: &Path) -> Result<Nes> {
        let rom =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        let sample_rate = self
            .audio
            .as_ref()
            .map_or(FALLBACK_SAMPLE_RATE, AudioOutput::sample_rate);
        let mut nes = Nes::with_config(
            &rom,
            MachineConfig {
                sample_rate,
                ..MachineConfig::default()
            },
        )?;
        if let Some(audio) = &self.audio {
            nes.set_sample_callback(Some(audio.sample_callback()));
        }
        Ok(nes)
    }

    fn state_path(&self) -> Option<PathBuf> {
        self.loaded_rom
            .as_ref()
            .map(|rom| rom.with_extension("state.json"))
    }

    fn save_state(&mut self) {
        let (Some(nes), Some(path)) = (self.nes.as_ref(), self.state_path()) else {
            return;
        };
        let result = nes
            .save_state_json()
            .and_then(|json| fs::write(&path, json).context("failed to write state file"));
        self.status_line = match result {
            Ok(()) => format!("State saved to {}", path.display()),
            Err(err) => format!("Save failed: {err:#}"),
        };
    }

    fn load_state(&mut self) {
        let Some(path) = self.state_path() else {
            return;
        };
        let Some(nes) = self.nes.as_mut() else {
            return;
        };
        let result = fs::read_to_string(&path)
            .context("failed to read state file")
            .and_then(|json| nes.load_state_json(&json));
        self.status_line = match result {
            Ok(()) => {
                self.next_frame_at = None;
                format!("State loaded from {}", path.display())
            }
            Err(err) => format!("Load failed: {err:#}"),
        };
    }

    fn open_rom_dialog(&mut self) {
        if let Some(path) = rfd::FileDialog::new()
            .add_filter("NES ROM", &["nes"])
            .set_title("Open NES ROM")
            .pick_file()
        {
            self.load_rom(&path);
        }
    }

    fn handle_dropped_files(&mut self, ctx: &egui::Context) {
        let dropped = ctx.input(|input| input.raw.dropped_files.clone());
        for file in dropped {
            if let Some(path) = file.path {
                let is_nes = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("nes"));

                if is_nes {
                    self.load_rom(&path);
                } else {
                    self.status_line = format!("Unsupported file: {}", path.display());
                }
            }
        }
    }

    fn handle_shortcuts(&mut self, ctx: &egui::Context) {
        let open_shortcut = ctx.input(|i| i.modifiers.command && i.key_pressed(Key::O));
        if open_shortcut {
            self.open_rom_dialog();
        }

        let pressed = |key| ctx.input(|i| i.key_pressed(key));
        if pressed(Key::R) {
            self.reset();
        }
        if pressed(Key::P) {
            self.toggle_pause();
        }
        if pressed(Key::F5) {
            self.save_state();
        }
        if pressed(Key::F9) {
            self.load_state();
        }
    }

    fn toggle_pause(&mut self) {
        if self.nes.is_some() {
            self.paused = !self.paused;
        }
    }

    fn reset(&mut self) {
        if let Some(nes) = self.nes.as_mut() {
            nes.reset();
            self.next_frame_at = None;
            self.paused = false;
            self.status_line = "Reset complete".to_string();
        }
    }

    fn controller_state_from_input(ctx: &egui::Context) -> u8 {
        ctx.input(|input| {
            let held = KEY_BINDINGS
                .iter()
                .filter(|(key, _)| input.key_down(*key))
                .fold(0u8, |buttons, (_, button)| buttons | button);
            // Shift is a modifier, not a key event.
            if input.modifiers.shift {
                held | BUTTON_SELECT
            } else {
                held
            }
        })
    }

    fn update_texture(&mut self, ctx: &egui::Context) {
        let Some(nes) = self.nes.as_ref() else {
            return;
        };
        for (pixel, rgba) in nes.frame_buffer().iter().zip(self.rgba.chunks_exact_mut(4)) {
            let [_, r, g, b] = pixel.to_be_bytes();
            rgba.copy_from_slice(&[r, g, b, 0xFF]);
        }
        let image = ColorImage::from_rgba_unmultiplied([256, 240], &self.rgba);

        if let Some(texture) = self.frame_texture.as_mut() {
            texture.set(image, TextureOptions::NEAREST);
        } else {
            self.frame_texture =
                Some(ctx.load_texture("nes-frame", image, TextureOptions::NEAREST));
        }
    }

    /// Runs one frame; pauses on a breakpoint or a machine fault.
    fn run_frame(&mut self, controller_state: u8) {
        let Some(nes) = self.nes.as_mut() else {
            return;
        };
        nes.set_input_controller(0xFF, false);
        nes.set_input_controller(controller_state, true);
        match nes.step_frame(false) {
            Ok(false) => {}
            Ok(true) => {
                self.paused = true;
                self.status_line = format!("Stopped at ${:04X}", nes.pc());
            }
            Err(err) => {
                self.paused = true;
                self.status_line = format!("Machine halted: {err:#}");
            }
        }
    }

    fn queued_audio_samples(&self) -> usize {
        self.audio
            .as_ref()
            .map_or(0, |audio| audio.queued_samples())
    }

    /// Catches emulation up to wall-clock time. Frames are skipped rather
    /// than queued when the host falls behind or the audio queue is full.
    fn pump_frames(&mut self, ctx: &egui::Context) {
        if self.nes.is_none() || self.paused {
            return;
        }
        let now = Instant::now();
        let mut due = self.next_frame_at.unwrap_or(now);
        let audio_limit = self
            .audio
            .as_ref()
            .map(|audio| audio.sample_rate() as usize * AUDIO_MAX_BUFFER_MS / 1000);

        let mut frames = 0;
        while !self.paused
            && frames < MAX_FRAMES_PER_UPDATE
            && Instant::now() >= due
            && audio_limit.is_none_or(|limit| self.queued_audio_samples() < limit)
        {
            self.run_frame(Self::controller_state_from_input(ctx));
            frames += 1;
            due += self.frame_interval;
        }

        if frames == 0 && now > due + self.frame_interval {
            due = now;
        }
        self.next_frame_at = Some(due);
    }

    fn show_toolbar(&mut self, ui: &mut egui::Ui) {
        if ui.button("Open ROM").clicked() {
            self.open_rom_dialog();
        }

        let loaded = self.nes.is_some();
        let pause_label = if self.paused { "Resume (P)" } else { "Pause (P)" };
        let actions: [(&str, fn(&mut Self)); 4] = [
            ("Reset (R)", Self::reset),
            (pause_label, Self::toggle_pause),
            ("Save (F5)", Self::save_state),
            ("Load (F9)", Self::load_state),
        ];
        for (label, action) in actions {
            if ui.add_enabled(loaded, egui::Button::new(label)).clicked() {
                action(self);
            }
        }

        if let Some(path) = &self.loaded_rom {
            ui.separator();
            ui.label(path.display().to_string());
        }
    }

    fn show_status(&self, ui: &mut egui::Ui) {
        ui.horizontal_wrapped(|ui| {
            ui.label(&self.status_line);
            if let Some(nes) = &self.nes {
                ui.separator();
                ui.label(format!("Mapper: {}", nes.mapper_name()));
            }
            ui.separator();
            match &self.audio {
                Some(audio) => {
                    let rate = audio.sample_rate().max(1) as usize;
                    ui.label(format!(
                        "Audio: {rate} Hz, {} ms queued",
                        audio.queued_samples() * 1000 / rate
                    ));
                }
                None => {
                    ui.label("Audio: off");
                }
            }
            ui.separator();
            ui.label(
                "Keys: WASD/arrows, Z/Space=A, X=B, Enter=Start, Shift=Select, P pause, R reset, F5/F9 state",
            );
        });

        if let Some(nes) = &self.nes {
            ui.separator();
            ui.collapsing("Machine", |ui| Self::show_machine(ui, nes));
        }
    }

    fn show_machine(ui: &mut egui::Ui, nes: &Nes) {
        let (a, x, y, p, sp, pc) = nes.debug_cpu_regs();
        let (ctrl, mask, status) = nes.debug_ppu_regs();
        let (scanline, dot) = nes.ppu_position();
        let (nmis, irqs) = nes.debug_interrupt_counts();
        ui.monospace(format!(
            "CPU  PC:{pc:04X} A:{a:02X} X:{x:02X} Y:{y:02X} P:{p:02X} SP:{sp:02X}  CYC:{}  NMI:{nmis} IRQ:{irqs}",
            nes.cycles()
        ));
        ui.monospace(format!(
            "PPU  CTRL:{ctrl:02X} MASK:{mask:02X} STATUS:{status:02X}  {scanline},{dot}  frame {}",
            nes.frame_count()
        ));
        ui.monospace(format!("Cart {}", nes.debug_mapper_state()));

        let events = nes.debug_recent_events(8);
        if events.is_empty() {
            return;
        }
        ui.separator();
        for event in events {
            ui.monospace(event);
        }
    }

    fn show_screen(&self, ui: &mut egui::Ui) {
        let Some(texture) = &self.frame_texture else {
            return;
        };
        let room = ui.available_size();
        let scale = (room.x / 256.0).min(room.y / 240.0).floor().max(1.0);
        ui.add(egui::Image::new(texture).fit_to_exact_size(egui::vec2(256.0, 240.0) * scale));
    }
}

impl eframe::App for NesApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.handle_dropped_files(ctx);
        self.handle_shortcuts(ctx);
        self.pump_frames(ctx);
        self.update_texture(ctx);

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| self.show_toolbar(ui));
        });
        egui::TopBottomPanel::bottom("status").show(ctx, |ui| self.show_status(ui));
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| self.show_screen(ui));
        });

        let wait = self
            .next_frame_at
            .map_or(self.poll_interval, |due| {
                due.saturating_duration_since(Instant::now())
                    .min(self.poll_interval)
            });
        ctx.request_repaint_after(wait);
    }
}
