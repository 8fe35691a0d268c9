use serde::{Deserialize, Serialize};

pub const CPU_CLOCK_HZ: f64 = 1_789_773.0;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
const MIN_SAMPLE_RATE: u32 = 8_000;

// One-pole DC blocker; corner near 35 Hz at 44.1 kHz.
const DC_BLOCK_POLE: f32 = 0.995;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_PATTERNS: [u8; 4] = [0b0100_0000, 0b0110_0000, 0b0111_1000, 0b1001_1111];

const TRIANGLE_STEPS: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

const NOISE_PERIODS: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_PERIODS: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

// Frame sequencer step offsets in CPU cycles since the last restart.
const SEQ_QUARTER_1: u32 = 7_457;
const SEQ_HALF_1: u32 = 14_913;
const SEQ_QUARTER_3: u32 = 22_371;
const SEQ_FOUR_STEP_LAST: u32 = 29_829;
const SEQ_FOUR_STEP_WRAP: u32 = 29_830;
const SEQ_FIVE_STEP_LAST: u32 = 37_281;
const SEQ_FIVE_STEP_WRAP: u32 = 37_282;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameClock {
    None,
    Quarter,
    Half,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    dmc: DmcChannel,
    sequencer: FrameSequencer,

    cpu_cycle: u64,
    sample_rate: u32,
    cycles_per_sample: f64,
    sample_clock: f64,
    accumulator: OutputAccumulator,
    dc_prev_in: f32,
    dc_prev_out: f32,
    dmc_dma_request: Option<u16>,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl Apu {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(MIN_SAMPLE_RATE);
        Self {
            pulse1: PulseChannel::new(SweepNegate::OnesComplement),
            pulse2: PulseChannel::new(SweepNegate::TwosComplement),
            triangle: TriangleChannel::default(),
            noise: NoiseChannel::default(),
            dmc: DmcChannel::default(),
            sequencer: FrameSequencer::default(),
            cpu_cycle: 0,
            sample_rate,
            cycles_per_sample: CPU_CLOCK_HZ / sample_rate as f64,
            sample_clock: 0.0,
            accumulator: OutputAccumulator::default(),
            dc_prev_in: 0.0,
            dc_prev_out: 0.0,
            dmc_dma_request: None,
        }
    }

    /// Console reset: channels go silent and the frame sequencer restarts in
    /// its last mode. The output filter keeps its state.
    pub fn reset(&mut self) {
        self.write_status(0x00);
        self.dmc.irq_flag = false;
        self.dmc_dma_request = None;
        self.sequencer.irq_flag = false;
        let mode = self.sequencer.mode_bits();
        self.sequencer.write(mode, self.cpu_cycle);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(MIN_SAMPLE_RATE);
        self.cycles_per_sample = CPU_CLOCK_HZ / self.sample_rate as f64;
        self.sample_clock = 0.0;
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        let reg = addr & 0x03;
        match addr {
            0x4000..=0x4003 => self.pulse1.write(reg, value),
            0x4004..=0x4007 => self.pulse2.write(reg, value),
            0x4008..=0x400B => self.triangle.write(reg, value),
            0x400C..=0x400F => self.noise.write(reg, value),
            0x4010..=0x4013 => self.dmc.write(reg, value),
            0x4015 => self.write_status(value),
            0x4017 => self.sequencer.write(value, self.cpu_cycle),
            _ => {}
        }
    }

    /// $4015 read. Acknowledges the frame IRQ.
    pub fn read_status(&mut self) -> u8 {
        let status = self.peek_status();
        self.sequencer.irq_flag = false;
        status
    }

    pub fn peek_status(&self) -> u8 {
        let voices: [&dyn Voice; 4] = [&self.pulse1, &self.pulse2, &self.triangle, &self.noise];
        let mut status = voices
            .iter()
            .enumerate()
            .filter(|(_, voice)| voice.length().active())
            .fold(0u8, |bits, (i, _)| bits | (1 << i));
        if self.dmc.reader.remaining > 0 {
            status |= 0x10;
        }
        if self.sequencer.irq_flag {
            status |= 0x40;
        }
        if self.dmc.irq_flag {
            status |= 0x80;
        }
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.sequencer.irq_flag || self.dmc.irq_flag
    }

    pub fn dmc_enabled(&self) -> bool {
        self.dmc.enabled
    }

    /// Advances one CPU cycle. Returns an output sample each time the host
    /// sample clock crosses a boundary.
    pub fn tick(&mut self) -> Option<f32> {
        self.cpu_cycle = self.cpu_cycle.wrapping_add(1);
        if let Some(clock) = self.sequencer.apply_pending_write() {
            self.clock_voices(clock);
        }

        // Pulse and noise timers run at half the CPU rate.
        if self.cpu_cycle & 1 == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
            self.noise.clock_timer();
        }
        self.triangle.clock_timer();
        self.dmc.clock_timer();
        self.request_dmc_dma();

        let clock = self.sequencer.clock();
        self.clock_voices(clock);

        self.accumulator.add([
            self.pulse1.output(),
            self.pulse2.output(),
            self.triangle.output(),
            self.noise.output(),
            self.dmc.output_level,
        ]);

        self.sample_clock += 1.0;
        if self.sample_clock < self.cycles_per_sample {
            return None;
        }
        self.sample_clock -= self.cycles_per_sample;
        let mixed = mix(self.accumulator.drain());
        Some(self.dc_block(mixed))
    }

    pub fn take_dmc_dma_request(&mut self) -> Option<u16> {
        self.dmc_dma_request.take()
    }

    pub fn complete_dmc_dma(&mut self, value: u8) {
        self.dmc.load_sample_byte(value);
        self.request_dmc_dma();
    }

    fn request_dmc_dma(&mut self) {
        if self.dmc_dma_request.is_none() && self.dmc.fetch_due() {
            self.dmc.reader.fetch_pending = false;
            self.dmc_dma_request = Some(self.dmc.reader.address);
        }
    }

    fn write_status(&mut self, value: u8) {
        self.dmc.irq_flag = false;
        self.pulse1.set_enabled(value & 0x01 != 0);
        self.pulse2.set_enabled(value & 0x02 != 0);
        self.triangle.set_enabled(value & 0x04 != 0);
        self.noise.set_enabled(value & 0x08 != 0);

        self.dmc.enabled = value & 0x10 != 0;
        if !self.dmc.enabled {
            self.dmc.reader.stop();
            self.dmc_dma_request = None;
        } else if self.dmc.reader.remaining == 0 {
            self.dmc.restart();
        }
    }

    fn clock_voices(&mut self, clock: FrameClock) {
        if clock == FrameClock::None {
            return;
        }
        let half = clock == FrameClock::Half;
        let voices: [&mut dyn Voice; 4] = [
            &mut self.pulse1,
            &mut self.pulse2,
            &mut self.triangle,
            &mut self.noise,
        ];
        for voice in voices {
            voice.quarter_frame();
            if half {
                voice.half_frame();
            }
        }
    }

    fn dc_block(&mut self, sample: f32) -> f32 {
        let out = sample - self.dc_prev_in + DC_BLOCK_POLE * self.dc_prev_out;
        self.dc_prev_in = sample;
        self.dc_prev_out = out;
        out.clamp(-1.0, 1.0)
    }
}

/// Non-linear 2A03 mixer over averaged channel levels
/// `[pulse1, pulse2, triangle, noise, dmc]`.
fn mix(levels: [f32; 5]) -> f32 {
    let [pulse1, pulse2, triangle, noise, dmc] = levels;
    let pulse_sum = pulse1 + pulse2;
    let pulse_out = if pulse_sum > 0.0 {
        95.88 / (8128.0 / pulse_sum + 100.0)
    } else {
        0.0
    };

    let tnd_in = triangle / 8227.0 + noise / 12241.0 + dmc / 22638.0;
    let tnd_out = if tnd_in > 0.0 {
        159.79 / (1.0 / tnd_in + 100.0)
    } else {
        0.0
    };

    pulse_out + tnd_out
}

/// Raw channel outputs summed over the cycles of one host sample.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct OutputAccumulator {
    sums: [u32; 5],
    cycles: u32,
}

impl OutputAccumulator {
    fn add(&mut self, levels: [u8; 5]) {
        for (sum, level) in self.sums.iter_mut().zip(levels) {
            *sum += level as u32;
        }
        self.cycles += 1;
    }

    fn drain(&mut self) -> [f32; 5] {
        let cycles = self.cycles.max(1) as f32;
        let averages = self.sums.map(|sum| sum as f32 / cycles);
        *self = Self::default();
        averages
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct FrameSequencer {
    cycle: u32,
    five_step: bool,
    irq_inhibit: bool,
    irq_flag: bool,
    /// Value written to $4017 and the cycles left until it takes effect.
    pending_write: Option<(u8, u8)>,
}

impl FrameSequencer {
    fn mode_bits(&self) -> u8 {
        (if self.five_step { 0x80 } else { 0 }) | (if self.irq_inhibit { 0x40 } else { 0 })
    }

    fn write(&mut self, value: u8, cpu_cycle: u64) {
        if value & 0x40 != 0 {
            self.irq_flag = false;
        }
        let delay = if cpu_cycle & 1 == 0 { 3 } else { 4 };
        self.pending_write = Some((value, delay));
    }

    fn apply_pending_write(&mut self) -> Option<FrameClock> {
        let (value, delay) = self.pending_write?;
        if delay > 1 {
            self.pending_write = Some((value, delay - 1));
            return None;
        }
        self.pending_write = None;
        self.five_step = value & 0x80 != 0;
        self.irq_inhibit = value & 0x40 != 0;
        if self.irq_inhibit {
            self.irq_flag = false;
        }
        self.cycle = 0;
        // Entering 5-step mode clocks every unit immediately.
        Some(if self.five_step {
            FrameClock::Half
        } else {
            FrameClock::None
        })
    }

    fn clock(&mut self) -> FrameClock {
        self.cycle += 1;
        match (self.five_step, self.cycle) {
            (_, SEQ_QUARTER_1 | SEQ_QUARTER_3) => FrameClock::Quarter,
            (_, SEQ_HALF_1) | (true, SEQ_FIVE_STEP_LAST) => FrameClock::Half,
            (false, SEQ_FOUR_STEP_LAST) => {
                self.raise_irq();
                FrameClock::Half
            }
            (false, SEQ_FOUR_STEP_WRAP) => {
                self.raise_irq();
                self.cycle = 0;
                FrameClock::None
            }
            (true, SEQ_FIVE_STEP_WRAP) => {
                self.cycle = 0;
                FrameClock::None
            }
            _ => FrameClock::None,
        }
    }

    fn raise_irq(&mut self) {
        if !self.irq_inhibit {
            self.irq_flag = true;
        }
    }
}

/// A tone generator driven by the frame sequencer.
trait Voice {
    /// Register write; `reg` is the offset 0..=3 within the channel's block.
    fn write(&mut self, reg: u16, value: u8);
    fn clock_timer(&mut self);
    fn quarter_frame(&mut self);
    fn half_frame(&mut self);
    fn length(&self) -> &LengthCounter;
    fn length_mut(&mut self) -> &mut LengthCounter;
    fn output(&self) -> u8;

    fn set_enabled(&mut self, enabled: bool) {
        self.length_mut().set_enabled(enabled);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Timer {
    period: u16,
    counter: u16,
}

impl Timer {
    fn set_low(&mut self, value: u8) {
        self.period = (self.period & 0x0700) | value as u16;
    }

    fn set_high(&mut self, value: u8) {
        self.period = (self.period & 0x00FF) | (((value & 0x07) as u16) << 8);
    }

    /// Counts down once; true when the counter reloads.
    fn clock(&mut self) -> bool {
        if self.counter == 0 {
            self.counter = self.period;
            true
        } else {
            self.counter -= 1;
            false
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct LengthCounter {
    enabled: bool,
    halt: bool,
    value: u8,
}

impl LengthCounter {
    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.value = 0;
        }
    }

    /// Loads from the table index in bits 3-7; ignored while disabled.
    fn load(&mut self, value: u8) {
        if self.enabled {
            self.value = LENGTH_TABLE[(value >> 3) as usize];
        }
    }

    fn clock(&mut self) {
        if !self.halt && self.value > 0 {
            self.value -= 1;
        }
    }

    fn active(&self) -> bool {
        self.value > 0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Envelope {
    start: bool,
    looping: bool,
    constant: bool,
    period: u8,
    divider: u8,
    decay: u8,
}

impl Envelope {
    fn write(&mut self, value: u8) {
        self.looping = value & 0x20 != 0;
        self.constant = value & 0x10 != 0;
        self.period = value & 0x0F;
    }

    fn clock(&mut self) {
        if self.start {
            self.start = false;
            self.decay = 15;
            self.divider = self.period;
        } else if self.divider > 0 {
            self.divider -= 1;
        } else {
            self.divider = self.period;
            if self.decay > 0 {
                self.decay -= 1;
            } else if self.looping {
                self.decay = 15;
            }
        }
    }

    fn volume(&self) -> u8 {
        if self.constant { self.period } else { self.decay }
    }
}

/// Pulse 1 subtracts one extra when sweeping down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum SweepNegate {
    OnesComplement,
    TwosComplement,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Sweep {
    enabled: bool,
    negate: bool,
    shift: u8,
    period: u8,
    divider: u8,
    reload: bool,
    mode: SweepNegate,
}

impl Sweep {
    fn new(mode: SweepNegate) -> Self {
        Self {
            enabled: false,
            negate: false,
            shift: 0,
            period: 1,
            divider: 0,
            reload: false,
            mode,
        }
    }

    fn write(&mut self, value: u8) {
        self.enabled = value & 0x80 != 0;
        self.period = ((value >> 4) & 0x07) + 1;
        self.negate = value & 0x08 != 0;
        self.shift = value & 0x07;
        self.reload = true;
    }

    fn target(&self, period: u16) -> u16 {
        let change = period >> self.shift;
        if !self.negate {
            return period + change;
        }
        match self.mode {
            SweepNegate::OnesComplement => period.saturating_sub(change + 1),
            SweepNegate::TwosComplement => period.saturating_sub(change),
        }
    }

    /// The channel is silenced for too-low periods and for targets past
    /// $7FF, whether or not the sweep is enabled.
    fn mutes(&self, period: u16) -> bool {
        period < 8 || self.target(period) > 0x07FF
    }

    fn clock(&mut self, timer: &mut Timer) {
        if self.divider == 0 && self.enabled && self.shift > 0 && !self.mutes(timer.period) {
            timer.period = self.target(timer.period);
        }
        if self.divider == 0 || self.reload {
            self.divider = self.period;
            self.reload = false;
        } else {
            self.divider -= 1;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PulseChannel {
    duty: u8,
    step: u8,
    timer: Timer,
    length: LengthCounter,
    envelope: Envelope,
    sweep: Sweep,
}

impl PulseChannel {
    fn new(negate: SweepNegate) -> Self {
        Self {
            duty: 0,
            step: 0,
            timer: Timer::default(),
            length: LengthCounter::default(),
            envelope: Envelope::default(),
            sweep: Sweep::new(negate),
        }
    }
}

impl Voice for PulseChannel {
    fn write(&mut self, reg: u16, value: u8) {
        match reg {
            0 => {
                self.duty = value >> 6;
                self.length.halt = value & 0x20 != 0;
                self.envelope.write(value);
            }
            1 => self.sweep.write(value),
            2 => self.timer.set_low(value),
            _ => {
                self.timer.set_high(value);
                self.length.load(value);
                self.step = 0;
                self.envelope.start = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.timer.clock() {
            self.step = (self.step + 1) & 0x07;
        }
    }

    fn quarter_frame(&mut self) {
        self.envelope.clock();
    }

    fn half_frame(&mut self) {
        self.length.clock();
        self.sweep.clock(&mut self.timer);
    }

    fn length(&self) -> &LengthCounter {
        &self.length
    }

    fn length_mut(&mut self) -> &mut LengthCounter {
        &mut self.length
    }

    fn output(&self) -> u8 {
        let high = DUTY_PATTERNS[self.duty as usize] & (0x80 >> self.step) != 0;
        if !high || !self.length.active() || self.sweep.mutes(self.timer.period) {
            return 0;
        }
        self.envelope.volume()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct TriangleChannel {
    control: bool,
    linear_reload_value: u8,
    linear_counter: u8,
    linear_reload: bool,
    step: u8,
    timer: Timer,
    length: LengthCounter,
}

impl Voice for TriangleChannel {
    fn write(&mut self, reg: u16, value: u8) {
        match reg {
            0 => {
                self.control = value & 0x80 != 0;
                self.length.halt = self.control;
                self.linear_reload_value = value & 0x7F;
            }
            1 => {}
            2 => self.timer.set_low(value),
            _ => {
                self.timer.set_high(value);
                self.length.load(value);
                self.linear_reload = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        // Ultrasonic periods hold the sequencer instead of popping.
        if self.timer.clock()
            && self.length.active()
            && self.linear_counter > 0
            && self.timer.period > 1
        {
            self.step = (self.step + 1) & 0x1F;
        }
    }

    fn quarter_frame(&mut self) {
        if self.linear_reload {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }
        if !self.control {
            self.linear_reload = false;
        }
    }

    fn half_frame(&mut self) {
        self.length.clock();
    }

    fn length(&self) -> &LengthCounter {
        &self.length
    }

    fn length_mut(&mut self) -> &mut LengthCounter {
        &mut self.length
    }

    fn output(&self) -> u8 {
        TRIANGLE_STEPS[self.step as usize]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct NoiseChannel {
    short_mode: bool,
    lfsr: u16,
    timer: Timer,
    length: LengthCounter,
    envelope: Envelope,
}

impl Default for NoiseChannel {
    fn default() -> Self {
        Self {
            short_mode: false,
            lfsr: 1,
            timer: Timer {
                period: NOISE_PERIODS[0],
                counter: 0,
            },
            length: LengthCounter::default(),
            envelope: Envelope::default(),
        }
    }
}

impl Voice for NoiseChannel {
    fn write(&mut self, reg: u16, value: u8) {
        match reg {
            0 => {
                self.length.halt = value & 0x20 != 0;
                self.envelope.write(value);
            }
            1 => {}
            2 => {
                self.short_mode = value & 0x80 != 0;
                self.timer.period = NOISE_PERIODS[(value & 0x0F) as usize];
            }
            _ => {
                self.length.load(value);
                self.envelope.start = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.timer.clock() {
            let tap = if self.short_mode { 6 } else { 1 };
            let feedback = (self.lfsr ^ (self.lfsr >> tap)) & 1;
            self.lfsr = (self.lfsr >> 1) | (feedback << 14);
        }
    }

    fn quarter_frame(&mut self) {
        self.envelope.clock();
    }

    fn half_frame(&mut self) {
        self.length.clock();
    }

    fn length(&self) -> &LengthCounter {
        &self.length
    }

    fn length_mut(&mut self) -> &mut LengthCounter {
        &mut self.length
    }

    fn output(&self) -> u8 {
        if !self.length.active() || self.lfsr & 1 != 0 {
            return 0;
        }
        self.envelope.volume()
    }
}

/// Memory side of the DMC: where the next sample byte comes from and when
/// the fetch is due.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SampleReader {
    address: u16,
    remaining: u16,
    buffer: Option<u8>,
    fetch_pending: bool,
    fetch_delay: u8,
}

impl Default for SampleReader {
    fn default() -> Self {
        Self {
            address: 0xC000,
            remaining: 0,
            buffer: None,
            fetch_pending: false,
            fetch_delay: 0,
        }
    }
}

impl SampleReader {
    fn stop(&mut self) {
        self.remaining = 0;
        self.fetch_pending = false;
        self.fetch_delay = 0;
    }

    fn schedule(&mut self, delay: u8) {
        if self.buffer.is_none() && self.remaining > 0 {
            self.fetch_pending = true;
            self.fetch_delay = delay;
        }
    }

    /// Advances past a fetched byte; wraps from $FFFF to $8000.
    fn advance(&mut self) {
        self.address = match self.address {
            0xFFFF => 0x8000,
            addr => addr + 1,
        };
        self.remaining -= 1;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct DmcChannel {
    enabled: bool,
    irq_enabled: bool,
    irq_flag: bool,
    looping: bool,
    period: u16,
    counter: u16,
    output_level: u8,
    sample_start: u8,
    sample_len: u8,
    reader: SampleReader,
    shifter: u8,
    bits_left: u8,
    silent: bool,
}

impl Default for DmcChannel {
    fn default() -> Self {
        Self {
            enabled: false,
            irq_enabled: false,
            irq_flag: false,
            looping: false,
            period: DMC_PERIODS[0],
            counter: DMC_PERIODS[0],
            output_level: 0,
            sample_start: 0,
            sample_len: 0,
            reader: SampleReader::default(),
            shifter: 0,
            bits_left: 8,
            silent: true,
        }
    }
}

impl DmcChannel {
    fn write(&mut self, reg: u16, value: u8) {
        match reg {
            0 => {
                self.irq_enabled = value & 0x80 != 0;
                if !self.irq_enabled {
                    self.irq_flag = false;
                }
                self.looping = value & 0x40 != 0;
                self.period = DMC_PERIODS[(value & 0x0F) as usize];
            }
            1 => self.output_level = value & 0x7F,
            2 => self.sample_start = value,
            _ => self.sample_len = value,
        }
    }

    fn rewind(&mut self) {
        self.reader.address = 0xC000 | ((self.sample_start as u16) << 6);
        self.reader.remaining = ((self.sample_len as u16) << 4) | 1;
    }

    fn restart(&mut self) {
        self.rewind();
        // The first fetch after enabling lands a couple of cycles later.
        self.schedule_fetch(2);
    }

    fn schedule_fetch(&mut self, delay: u8) {
        if self.enabled {
            self.reader.schedule(delay);
        }
    }

    fn fetch_due(&self) -> bool {
        self.enabled && self.reader.fetch_pending && self.reader.fetch_delay == 0
    }

    fn load_sample_byte(&mut self, byte: u8) {
        self.reader.buffer = Some(byte);
        if self.reader.remaining == 0 {
            return;
        }
        self.reader.advance();
        if self.reader.remaining > 0 {
            return;
        }
        if self.looping {
            self.rewind();
        } else if self.irq_enabled {
            self.irq_flag = true;
        }
    }

    fn clock_timer(&mut self) {
        if self.reader.fetch_pending && self.reader.fetch_delay > 0 {
            self.reader.fetch_delay -= 1;
        }
        self.counter = self.counter.saturating_sub(1);
        if self.counter == 0 {
            self.counter = self.period;
            self.clock_output();
        }
    }

    fn clock_output(&mut self) {
        if !self.silent {
            if self.shifter & 1 != 0 {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
        }
        self.shifter >>= 1;

        self.bits_left = self.bits_left.saturating_sub(1);
        if self.bits_left > 0 {
            return;
        }
        self.bits_left = 8;
        match self.reader.buffer.take() {
            Some(byte) => {
                self.shifter = byte;
                self.silent = false;
                self.schedule_fetch(1);
            }
            None => self.silent = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(apu: &mut Apu, cycles: u32) -> Vec<f32> {
        (0..cycles).filter_map(|_| apu.tick()).collect()
    }

    #[test]
    fn length_counters_report_in_status() {
        let mut apu = Apu::default();
        apu.write_register(0x4015, 0x0F);
        apu.write_register(0x4003, 0x08);
        apu.write_register(0x400F, 0x08);
        assert_eq!(apu.peek_status() & 0x0F, 0x09);

        apu.write_register(0x4015, 0x00);
        assert_eq!(apu.peek_status() & 0x0F, 0x00);
    }

    #[test]
    fn length_counter_ignores_loads_while_disabled() {
        let mut apu = Apu::default();
        apu.write_register(0x4003, 0x08);
        assert_eq!(apu.peek_status() & 0x01, 0);
    }

    #[test]
    fn four_step_sequence_raises_frame_irq() {
        let mut apu = Apu::default();
        apu.write_register(0x4017, 0x00);
        run(&mut apu, 29_833);
        assert!(apu.irq_pending());
        assert_ne!(apu.read_status() & 0x40, 0);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn inhibit_and_five_step_mode_suppress_frame_irq() {
        let mut apu = Apu::default();
        apu.write_register(0x4017, 0x40);
        run(&mut apu, 40_000);
        assert!(!apu.irq_pending());

        let mut apu = Apu::default();
        apu.write_register(0x4017, 0x80);
        run(&mut apu, 40_000);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn mode_write_lands_three_or_four_cycles_later() {
        let mut seq = FrameSequencer::default();
        seq.write(0x80, 0);
        assert_eq!(seq.apply_pending_write(), None);
        assert_eq!(seq.apply_pending_write(), None);
        assert_eq!(seq.apply_pending_write(), Some(FrameClock::Half));
        assert!(seq.five_step);

        let mut seq = FrameSequencer::default();
        seq.write(0x00, 1);
        for _ in 0..3 {
            assert_eq!(seq.apply_pending_write(), None);
        }
        assert_eq!(seq.apply_pending_write(), Some(FrameClock::None));
    }

    #[test]
    fn half_frame_clocks_decrement_length() {
        let mut apu = Apu::default();
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0x00);
        // Table index 3 loads a count of 2.
        apu.write_register(0x4003, 0x18);
        apu.write_register(0x4017, 0x00);
        run(&mut apu, 29_840);
        assert_eq!(apu.peek_status() & 0x01, 0);
    }

    #[test]
    fn sweep_target_differs_between_pulses() {
        let mut ones = Sweep::new(SweepNegate::OnesComplement);
        let mut twos = Sweep::new(SweepNegate::TwosComplement);
        ones.write(0x89);
        twos.write(0x89);
        assert_eq!(ones.target(0x100), 0x7F);
        assert_eq!(twos.target(0x100), 0x80);
    }

    #[test]
    fn sweep_overflow_mutes_even_when_disabled() {
        let sweep = Sweep::new(SweepNegate::TwosComplement);
        assert!(sweep.mutes(0x7FF));
        assert!(sweep.mutes(0x007));
        assert!(!sweep.mutes(0x3FF));
    }

    #[test]
    fn sample_rate_sets_output_cadence() {
        let mut apu = Apu::new(48_000);
        let samples = run(&mut apu, CPU_CLOCK_HZ as u32);
        assert!((47_999..=48_001).contains(&samples.len()));
    }

    #[test]
    fn mixer_peaks_just_under_full_scale() {
        assert_eq!(mix([0.0; 5]), 0.0);
        let peak = mix([15.0, 15.0, 15.0, 15.0, 127.0]);
        assert!(peak > 0.95 && peak <= 1.0, "{peak}");
    }

    #[test]
    fn mixed_output_stays_within_unit_range() {
        let mut apu = Apu::default();
        apu.write_register(0x4015, 0x1F);
        for base in [0x4000u16, 0x4004] {
            apu.write_register(base, 0xBF);
            apu.write_register(base + 2, 0x40);
            apu.write_register(base + 3, 0x08);
        }
        apu.write_register(0x4008, 0xFF);
        apu.write_register(0x400A, 0x20);
        apu.write_register(0x400B, 0x08);
        apu.write_register(0x400C, 0x3F);
        apu.write_register(0x400E, 0x03);
        apu.write_register(0x400F, 0x08);
        apu.write_register(0x4011, 0x7F);

        let samples = run(&mut apu, 200_000);
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(samples.iter().any(|s| s.abs() > 0.01));
    }

    #[test]
    fn dmc_enable_requests_sample_fetch() {
        let mut apu = Apu::default();
        apu.write_register(0x4012, 0x10);
        apu.write_register(0x4013, 0x01);
        apu.write_register(0x4015, 0x10);
        assert_ne!(apu.peek_status() & 0x10, 0);

        run(&mut apu, 4);
        assert_eq!(apu.take_dmc_dma_request(), Some(0xC400));
        apu.complete_dmc_dma(0xAA);
        assert_eq!(apu.take_dmc_dma_request(), None);
    }

    #[test]
    fn dmc_irq_fires_at_end_of_sample() {
        let mut apu = Apu::default();
        apu.write_register(0x4010, 0x8F);
        apu.write_register(0x4013, 0x00);
        apu.write_register(0x4015, 0x10);
        for _ in 0..2_000 {
            apu.tick();
            if apu.take_dmc_dma_request().is_some() {
                apu.complete_dmc_dma(0x00);
            }
        }
        assert!(apu.irq_pending());
        assert_ne!(apu.peek_status() & 0x80, 0);
        apu.write_register(0x4015, 0x00);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn dmc_address_wraps_to_8000() {
        let mut reader = SampleReader {
            address: 0xFFFF,
            remaining: 2,
            ..SampleReader::default()
        };
        reader.advance();
        assert_eq!(reader.address, 0x8000);
        assert_eq!(reader.remaining, 1);
    }
}
