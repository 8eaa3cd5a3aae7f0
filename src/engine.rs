//! Measurement state machine
//!
//! Sequences one cycle as: baseline capture -> press character -> release ->
//! wait for the region to change (sample) -> press erase -> release -> wait for
//! the region to match the baseline again -> next press. Frames drive the
//! visual checks, the timer drives the key events. Anything observed out of
//! order is fatal: a sample taken after an anomaly can't be trusted.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::detector::region_changed;
use crate::error::FatalError;
use crate::event_loop::Timer;
use crate::frame::FrameDescriptor;
use crate::gpu::FrameImporter;
use crate::keyboard::{Key, KeyInjector, KeyState};
use crate::region::{PixelBuffer, RegionBuffers, WatchRegion};

/// Cycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// First frame becomes the reference image
    NeedsBaseline,
    /// Region must stay unchanged until the timer presses the character key
    WaitPressTimer,
    /// Character key held; the reaction may already show up
    WaitRelease { pressed_at: Instant },
    /// Character key held and the reaction was already sampled
    WaitReleaseReacted,
    /// Character key released, waiting for the reaction
    WaitReacted { pressed_at: Instant },
    /// Reaction seen, erase key not pressed yet; region must stay changed
    WaitEraseReleaseTimer,
    /// Erase key held; the region may already clear
    WaitEraseRelease2,
    /// Erase key held and the region already matches the reference again
    WaitEraseReleaseCleared,
    /// Erase key released, waiting for the region to match the reference
    WaitCleared,
    /// Fatal condition hit; nothing else happens
    Error,
}

/// Random delay between key events, so we never lock onto the refresh phase
#[derive(Debug)]
pub struct Jitter {
    min_ms: u64,
    max_ms: u64,
    rng: StdRng,
}

impl Jitter {
    /// Uniform delay in `[min_ms, max_ms]`
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self::with_rng(min_ms, max_ms, StdRng::from_entropy())
    }

    pub fn with_rng(min_ms: u64, max_ms: u64, rng: StdRng) -> Self {
        debug_assert!(min_ms <= max_ms);
        Self { min_ms, max_ms, rng }
    }

    pub fn next_delay(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(self.min_ms..=self.max_ms))
    }
}

/// Capture / inject / measure controller
pub struct Engine<K, W> {
    state: CycleState,
    region: WatchRegion,
    reference: PixelBuffer,
    current: PixelBuffer,
    timer: Timer,
    jitter: Jitter,
    injector: K,
    output: W,
    samples: u64,
}

impl<K: KeyInjector, W: Write> Engine<K, W> {
    /// `buffers` must be allocated for `region`
    pub fn new(
        region: WatchRegion,
        buffers: RegionBuffers,
        injector: K,
        output: W,
        jitter: Jitter,
    ) -> Self {
        let RegionBuffers { reference, current } = buffers;
        debug_assert_eq!((current.width(), current.height()), (region.width, region.height));

        Self {
            state: CycleState::NeedsBaseline,
            region,
            reference,
            current,
            timer: Timer::disabled(),
            jitter,
            injector,
            output,
            samples: 0,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn timer_mut(&mut self) -> &mut Timer {
        &mut self.timer
    }

    /// Latency samples emitted so far
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// A captured frame is ready: read the region back and advance
    ///
    /// Latency is measured up to the moment the readback finished.
    pub fn frame_ready(
        &mut self,
        frame: &FrameDescriptor,
        importer: &mut impl FrameImporter,
    ) -> Result<(), FatalError> {
        self.frame_ready_with(frame, importer, Instant::now)
    }

    /// Same as [`Engine::frame_ready`] with the readback completion time given
    pub fn frame_ready_at(
        &mut self,
        frame: &FrameDescriptor,
        importer: &mut impl FrameImporter,
        now: Instant,
    ) -> Result<(), FatalError> {
        self.frame_ready_with(frame, importer, || now)
    }

    fn frame_ready_with(
        &mut self,
        frame: &FrameDescriptor,
        importer: &mut impl FrameImporter,
        clock: impl FnOnce() -> Instant,
    ) -> Result<(), FatalError> {
        if self.state == CycleState::Error {
            return Ok(());
        }

        let result = match importer.read_region(frame, &self.region, &mut self.current) {
            Ok(()) => {
                let now = clock();
                self.on_readback(now)
            }
            Err(e) => Err(e),
        };
        self.fail_on_error(result)
    }

    /// The timer armed by a previous transition fired
    pub fn timer_fired(&mut self) -> Result<(), FatalError> {
        self.timer_fired_at(Instant::now())
    }

    pub fn timer_fired_at(&mut self, now: Instant) -> Result<(), FatalError> {
        let result = self.on_timer(now);
        self.fail_on_error(result)
    }

    fn on_readback(&mut self, now: Instant) -> Result<(), FatalError> {
        use CycleState::*;

        // Compared against the reference for every state but the baseline
        let changed = self.state != NeedsBaseline && region_changed(&self.reference, &self.current);

        match self.state {
            NeedsBaseline => {
                self.reference.copy_from(&self.current);
                info!(
                    "Baseline captured for {}x{} region at {},{}",
                    self.region.width, self.region.height, self.region.x, self.region.y
                );
                self.transition(WaitPressTimer);
                self.arm_jittered();
            }
            WaitPressTimer | WaitEraseReleaseCleared => {
                if changed {
                    return Err(FatalError::EarlyReaction);
                }
            }
            WaitRelease { pressed_at } => {
                if changed {
                    self.emit_sample(now.duration_since(pressed_at))?;
                    // The release is still scheduled on the timer
                    self.transition(WaitReleaseReacted);
                }
            }
            WaitReacted { pressed_at } => {
                if changed {
                    self.emit_sample(now.duration_since(pressed_at))?;
                    self.transition(WaitEraseReleaseTimer);
                    self.arm_jittered();
                }
            }
            WaitReleaseReacted | WaitEraseReleaseTimer => {
                if !changed {
                    return Err(FatalError::EarlyClear);
                }
            }
            WaitEraseRelease2 => {
                if !changed {
                    self.transition(WaitEraseReleaseCleared);
                }
            }
            WaitCleared => {
                if !changed {
                    self.transition(WaitPressTimer);
                    self.arm_jittered();
                }
            }
            Error => {}
        }

        Ok(())
    }

    fn on_timer(&mut self, now: Instant) -> Result<(), FatalError> {
        use CycleState::*;

        match self.state {
            WaitPressTimer => {
                self.injector.send(Key::Character, KeyState::Pressed)?;
                self.transition(WaitRelease { pressed_at: now });
                self.arm_jittered();
            }
            WaitRelease { pressed_at } => {
                self.injector.send(Key::Character, KeyState::Released)?;
                self.transition(WaitReacted { pressed_at });
            }
            WaitReleaseReacted => {
                self.injector.send(Key::Character, KeyState::Released)?;
                self.transition(WaitEraseReleaseTimer);
                self.arm_jittered();
            }
            WaitEraseReleaseTimer => {
                self.injector.send(Key::Erase, KeyState::Pressed)?;
                self.transition(WaitEraseRelease2);
                self.arm_jittered();
            }
            WaitEraseRelease2 => {
                self.injector.send(Key::Erase, KeyState::Released)?;
                self.transition(WaitCleared);
            }
            WaitEraseReleaseCleared => {
                self.injector.send(Key::Erase, KeyState::Released)?;
                self.transition(WaitPressTimer);
                self.arm_jittered();
            }
            NeedsBaseline | WaitReacted { .. } | WaitCleared | Error => {
                debug!("Timer fired in {:?}, nothing to do", self.state);
            }
        }

        Ok(())
    }

    fn emit_sample(&mut self, latency: Duration) -> Result<(), FatalError> {
        writeln!(self.output, "{}", latency.as_nanos())?;
        self.output.flush()?;
        self.samples += 1;
        debug!("Sample #{}: {:?}", self.samples, latency);
        Ok(())
    }

    fn transition(&mut self, next: CycleState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn arm_jittered(&mut self) {
        let delay = self.jitter.next_delay();
        self.timer.arm(delay);
    }

    fn fail_on_error(&mut self, result: Result<(), FatalError>) -> Result<(), FatalError> {
        if result.is_err() {
            self.state = CycleState::Error;
            self.timer.disarm();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Records every key event
    #[derive(Default)]
    struct RecordingInjector {
        events: Vec<(Key, KeyState)>,
        broken: bool,
    }

    impl KeyInjector for RecordingInjector {
        fn send(&mut self, key: Key, state: KeyState) -> Result<(), FatalError> {
            if self.broken {
                return Err(FatalError::InjectorGone);
            }
            self.events.push((key, state));
            Ok(())
        }
    }

    /// Hands out queued images instead of touching a GPU
    #[derive(Default)]
    struct ScriptedImporter {
        images: VecDeque<Vec<u32>>,
        fail: bool,
    }

    impl ScriptedImporter {
        fn push(&mut self, pixels: &[u32]) {
            self.images.push_back(pixels.to_vec());
        }
    }

    impl FrameImporter for ScriptedImporter {
        fn read_region(
            &mut self,
            _frame: &FrameDescriptor,
            region: &WatchRegion,
            out: &mut PixelBuffer,
        ) -> Result<(), FatalError> {
            if self.fail {
                return Err(FatalError::Gl { op: "glReadPixels", code: 0x0502 });
            }
            let pixels = self.images.pop_front().expect("no scripted image left");
            for (i, value) in pixels.into_iter().enumerate() {
                out.set_pixel(i as u32 % region.width, i as u32 / region.width, value);
            }
            Ok(())
        }
    }

    const CLEAN: [u32; 4] = [0, 0, 0, 0];
    const TYPED: [u32; 4] = [1, 0, 0, 0];

    type TestEngine = Engine<RecordingInjector, Vec<u8>>;

    fn engine() -> TestEngine {
        let region = WatchRegion::new(0, 0, 2, 2);
        Engine::new(
            region,
            RegionBuffers::allocate(&region).unwrap(),
            RecordingInjector::default(),
            Vec::new(),
            Jitter::with_rng(50, 99, StdRng::seed_from_u64(7)),
        )
    }

    fn frame() -> FrameDescriptor {
        FrameDescriptor::new(2, 2, 0x34325258, 0, 0).unwrap()
    }

    fn show(
        engine: &mut TestEngine,
        importer: &mut ScriptedImporter,
        pixels: &[u32],
        at: Instant,
    ) -> Result<(), FatalError> {
        importer.push(pixels);
        engine.frame_ready_at(&frame(), importer, at)
    }

    fn assert_jittered(engine: &mut TestEngine) {
        let remaining = engine.timer_mut().remaining().expect("timer armed");
        assert!(remaining >= Duration::from_millis(50) && remaining <= Duration::from_millis(99));
    }

    fn samples(engine: &TestEngine) -> Vec<u128> {
        String::from_utf8(engine.output.clone())
            .unwrap()
            .lines()
            .map(|line| line.parse().unwrap())
            .collect()
    }

    #[test]
    fn test_full_cycle_emits_one_sample() {
        let mut engine = engine();
        let mut importer = ScriptedImporter::default();
        let t0 = Instant::now();

        // Baseline
        show(&mut engine, &mut importer, &CLEAN, t0).unwrap();
        assert_eq!(engine.state(), CycleState::WaitPressTimer);
        assert_jittered(&mut engine);

        // Press
        let t_press = t0 + Duration::from_millis(60);
        engine.timer_fired_at(t_press).unwrap();
        assert_eq!(engine.state(), CycleState::WaitRelease { pressed_at: t_press });

        // Release before anything shows up
        engine.timer_fired_at(t_press + Duration::from_millis(70)).unwrap();
        assert_eq!(engine.state(), CycleState::WaitReacted { pressed_at: t_press });

        // Frame 2: unchanged, no sample
        show(&mut engine, &mut importer, &CLEAN, t_press + Duration::from_millis(80)).unwrap();
        assert_eq!(engine.samples(), 0);

        // Frame 3: one pixel differs
        let t3 = t_press + Duration::from_millis(90);
        show(&mut engine, &mut importer, &TYPED, t3).unwrap();
        assert_eq!(samples(&engine), vec![(t3 - t_press).as_nanos()]);
        assert_eq!(engine.state(), CycleState::WaitEraseReleaseTimer);
        assert_jittered(&mut engine);

        // Erase press / release
        engine.timer_fired_at(t3 + Duration::from_millis(60)).unwrap();
        assert_eq!(engine.state(), CycleState::WaitEraseRelease2);
        show(&mut engine, &mut importer, &TYPED, t3 + Duration::from_millis(65)).unwrap();
        engine.timer_fired_at(t3 + Duration::from_millis(130)).unwrap();
        assert_eq!(engine.state(), CycleState::WaitCleared);

        // Still typed, then back to the baseline
        show(&mut engine, &mut importer, &TYPED, t3 + Duration::from_millis(135)).unwrap();
        assert_eq!(engine.state(), CycleState::WaitCleared);
        show(&mut engine, &mut importer, &CLEAN, t3 + Duration::from_millis(140)).unwrap();
        assert_eq!(engine.state(), CycleState::WaitPressTimer);
        assert_jittered(&mut engine);

        assert_eq!(engine.samples(), 1);
        assert_eq!(
            engine.injector.events,
            vec![
                (Key::Character, KeyState::Pressed),
                (Key::Character, KeyState::Released),
                (Key::Erase, KeyState::Pressed),
                (Key::Erase, KeyState::Released),
            ]
        );
    }

    #[test]
    fn test_reaction_while_key_held() {
        let mut engine = engine();
        let mut importer = ScriptedImporter::default();
        let t0 = Instant::now();

        show(&mut engine, &mut importer, &CLEAN, t0).unwrap();
        engine.timer_fired_at(t0).unwrap();

        let t_react = t0 + Duration::from_millis(25);
        show(&mut engine, &mut importer, &TYPED, t_react).unwrap();
        assert_eq!(engine.state(), CycleState::WaitReleaseReacted);
        assert_eq!(samples(&engine), vec![Duration::from_millis(25).as_nanos()]);

        // The pending timer releases the key and moves on to erasing
        engine.timer_fired_at(t0 + Duration::from_millis(60)).unwrap();
        assert_eq!(engine.state(), CycleState::WaitEraseReleaseTimer);
        assert_jittered(&mut engine);

        // Cleared while erase is still held
        engine.timer_fired_at(t0 + Duration::from_millis(120)).unwrap();
        show(&mut engine, &mut importer, &CLEAN, t0 + Duration::from_millis(130)).unwrap();
        assert_eq!(engine.state(), CycleState::WaitEraseReleaseCleared);
        engine.timer_fired_at(t0 + Duration::from_millis(180)).unwrap();
        assert_eq!(engine.state(), CycleState::WaitPressTimer);
        assert_eq!(engine.samples(), 1);
    }

    #[test]
    fn test_consecutive_cycles_one_sample_each() {
        let mut engine = engine();
        let mut importer = ScriptedImporter::default();
        let mut t = Instant::now();

        show(&mut engine, &mut importer, &CLEAN, t).unwrap();
        for cycle in 1..=3 {
            engine.timer_fired_at(t).unwrap();
            engine.timer_fired_at(t).unwrap();
            t += Duration::from_millis(10);
            show(&mut engine, &mut importer, &TYPED, t).unwrap();
            engine.timer_fired_at(t).unwrap();
            engine.timer_fired_at(t).unwrap();
            show(&mut engine, &mut importer, &CLEAN, t).unwrap();
            assert_eq!(engine.state(), CycleState::WaitPressTimer);
            assert_eq!(engine.samples(), cycle);
        }
    }

    #[test]
    fn test_reaction_before_press_is_fatal() {
        let mut engine = engine();
        let mut importer = ScriptedImporter::default();
        let t0 = Instant::now();

        show(&mut engine, &mut importer, &CLEAN, t0).unwrap();
        let err = show(&mut engine, &mut importer, &TYPED, t0).unwrap_err();
        assert!(matches!(err, FatalError::EarlyReaction));
        assert_eq!(engine.state(), CycleState::Error);
        assert_eq!(engine.timer_mut().remaining(), None);
        assert!(engine.injector.events.is_empty());
    }

    #[test]
    fn test_clear_before_erase_is_fatal() {
        let mut engine = engine();
        let mut importer = ScriptedImporter::default();
        let t0 = Instant::now();

        show(&mut engine, &mut importer, &CLEAN, t0).unwrap();
        engine.timer_fired_at(t0).unwrap();
        engine.timer_fired_at(t0).unwrap();
        show(&mut engine, &mut importer, &TYPED, t0).unwrap();

        let err = show(&mut engine, &mut importer, &CLEAN, t0).unwrap_err();
        assert!(matches!(err, FatalError::EarlyClear));
        assert_eq!(engine.state(), CycleState::Error);
    }

    #[test]
    fn test_clear_while_key_held_is_fatal() {
        let mut engine = engine();
        let mut importer = ScriptedImporter::default();
        let t0 = Instant::now();

        show(&mut engine, &mut importer, &CLEAN, t0).unwrap();
        engine.timer_fired_at(t0).unwrap();
        show(&mut engine, &mut importer, &TYPED, t0 + Duration::from_millis(20)).unwrap();
        assert_eq!(engine.state(), CycleState::WaitReleaseReacted);

        // Back to the reference before the release timer fired
        let t_clear = t0 + Duration::from_millis(30);
        let err = show(&mut engine, &mut importer, &CLEAN, t_clear).unwrap_err();
        assert!(matches!(err, FatalError::EarlyClear));
        assert_eq!(engine.state(), CycleState::Error);
        assert_eq!(engine.samples(), 1);
        assert_eq!(engine.injector.events, vec![(Key::Character, KeyState::Pressed)]);
    }

    #[test]
    fn test_reaction_while_erase_held_after_clear_is_fatal() {
        let mut engine = engine();
        let mut importer = ScriptedImporter::default();
        let t0 = Instant::now();

        show(&mut engine, &mut importer, &CLEAN, t0).unwrap();
        engine.timer_fired_at(t0).unwrap();
        engine.timer_fired_at(t0).unwrap();
        show(&mut engine, &mut importer, &TYPED, t0).unwrap();
        engine.timer_fired_at(t0).unwrap();
        show(&mut engine, &mut importer, &CLEAN, t0).unwrap();
        assert_eq!(engine.state(), CycleState::WaitEraseReleaseCleared);

        // Region changes again while erase is still held
        let err = show(&mut engine, &mut importer, &TYPED, t0).unwrap_err();
        assert!(matches!(err, FatalError::EarlyReaction));
        assert_eq!(engine.state(), CycleState::Error);
        assert_eq!(engine.timer_mut().remaining(), None);
        assert_eq!(engine.injector.events.last(), Some(&(Key::Erase, KeyState::Pressed)));
    }

    #[test]
    fn test_readback_failure_is_fatal() {
        let mut engine = engine();
        let mut importer = ScriptedImporter { fail: true, ..Default::default() };

        let err = engine.frame_ready_at(&frame(), &mut importer, Instant::now()).unwrap_err();
        assert!(matches!(err, FatalError::Gl { op: "glReadPixels", .. }));
        assert_eq!(engine.state(), CycleState::Error);

        // Further frames are ignored once failed
        importer.fail = false;
        importer.push(&CLEAN);
        assert!(engine.frame_ready_at(&frame(), &mut importer, Instant::now()).is_ok());
        assert_eq!(engine.state(), CycleState::Error);
    }

    #[test]
    fn test_injector_failure_is_fatal() {
        let mut engine = engine();
        let mut importer = ScriptedImporter::default();
        show(&mut engine, &mut importer, &CLEAN, Instant::now()).unwrap();

        engine.injector.broken = true;
        let err = engine.timer_fired_at(Instant::now()).unwrap_err();
        assert!(matches!(err, FatalError::InjectorGone));
        assert_eq!(engine.state(), CycleState::Error);
    }

    #[test]
    fn test_timer_ignored_while_watching() {
        let mut engine = engine();
        engine.timer_fired_at(Instant::now()).unwrap();
        assert_eq!(engine.state(), CycleState::NeedsBaseline);
        assert!(engine.injector.events.is_empty());
    }

    #[test]
    fn test_jitter_range() {
        let mut jitter = Jitter::with_rng(50, 99, StdRng::seed_from_u64(1));
        for _ in 0..1000 {
            let delay = jitter.next_delay();
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(99));
        }
    }
}
