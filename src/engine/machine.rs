//! Instruction dispatcher and machine lifecycle.
//!
//! The machine executes a decoded [`BytecodeImage`] as a single logical
//! thread of control: one instruction fully completes, including any
//! triggered maintenance, before the next begins. Commands from the
//! front-end collaborator queue up on an mpsc channel and drain at the top
//! of each cycle, never mid-cycle; an external stop request is likewise
//! observed only there.

use crate::engine::epoch::{EpochScheduler, DEFAULT_PURGE_MODULUS};
use crate::engine::error_cache::{DeferredErrorCache, ErrorEntry};
use crate::engine::errors::{Fault, VmError};
use crate::engine::image::BytecodeImage;
use crate::engine::isa::Opcode;
use crate::engine::reclaimer::Reclaimer;
use crate::engine::store::{Store, REGISTER_COUNT};
use crate::{error, info};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

/// Glyph recorded for register indices outside the bank.
pub const GLYPH_REGISTER_RANGE: &str = "#EID:0R16";

/// Glyph recorded for argument lists too short for their opcode.
pub const GLYPH_MALFORMED_ARGS: &str = "#EID:ARG0";

/// Glyph recorded by `DEFER_ERR` when the instruction carries no glyph.
pub const GLYPH_DRIFT: &str = "#EID:22FC";

/// Glyph recorded for unparseable `NODE` command payloads.
pub const GLYPH_BAD_NODE: &str = "#EID:N0DE";

/// Default idle-cycle count before a proactive collect.
pub const DEFAULT_IDLE_THRESHOLD: u64 = 8;

/// Tunable engine constants, fixed at machine construction.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Epochs between automatic purges; 0 disables the automatic trigger.
    pub purge_modulus: u64,
    /// Consecutive non-mutating cycles before a proactive collect; 0
    /// disables the idle trigger.
    pub idle_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            purge_modulus: DEFAULT_PURGE_MODULUS,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

/// Dispatcher lifecycle states. `Halted` and `Faulted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Ready,
    Running,
    Halted,
    Faulted,
}

/// Read-only view of engine state for the front-end collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub registers: [u16; REGISTER_COUNT],
    pub stack_depth: usize,
    pub epoch: u64,
    pub pending_error_count: usize,
    pub pending_error_glyphs: Vec<String>,
}

/// Sink for engine observability events. All hooks default to no-ops.
pub trait Observer {
    /// A `TRACE_EMIT` instruction or `TRACE` command fired.
    fn snapshot(&mut self, _snapshot: &Snapshot) {}

    /// A `PRINT_STACK` instruction or `STACK` command fired.
    fn stack_dump(&mut self, _bytes: &[u8]) {}

    /// A `NODE` command inspected a register.
    fn node(&mut self, _index: u8, _value: u16) {}

    /// An error-cache purge removed these entries.
    fn purged(&mut self, _entries: &[ErrorEntry]) {}
}

/// Observer that discards every event.
pub struct NullObserver;

impl Observer for NullObserver {}

/// Front-end command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Run,
    Trace,
    Stack,
    Node,
    Epoch,
    Nullify,
}

impl CommandKind {
    /// Parses a command verb as submitted by the front-end.
    pub fn parse(verb: &str) -> Option<Self> {
        match verb.trim().to_ascii_uppercase().as_str() {
            "RUN" => Some(Self::Run),
            "TRACE" => Some(Self::Trace),
            "STACK" => Some(Self::Stack),
            "NODE" => Some(Self::Node),
            "EPOCH" => Some(Self::Epoch),
            "NULLIFY" => Some(Self::Nullify),
            _ => None,
        }
    }
}

/// One queued front-end command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub payload: String,
}

/// Cloneable handle for submitting commands to a running machine.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
}

impl CommandSender {
    /// Enqueues a command; returns false once the machine is gone.
    pub fn submit(&self, kind: CommandKind, payload: &str) -> bool {
        self.tx
            .send(Command {
                kind,
                payload: payload.to_string(),
            })
            .is_ok()
    }
}

/// Cloneable handle requesting a cooperative stop.
///
/// The machine observes the flag only at the top of the cycle loop and
/// halts without running pending maintenance.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

/// Handler outcome for one instruction.
enum Flow {
    Continue,
    Halt,
}

/// Register/stack bytecode machine.
///
/// Exclusively owns its register bank, operand stack, deferred error cache,
/// and epoch counter; the bytecode image is a read-only view owned by the
/// loader. Machines share no state, so tests can run them side by side.
pub struct Machine<'a> {
    image: &'a BytecodeImage,
    config: EngineConfig,
    state: MachineState,
    pc: usize,
    store: Store,
    cache: DeferredErrorCache,
    scheduler: EpochScheduler,
    reclaimer: Reclaimer,
    loaded_modules: BTreeSet<u8>,
    idle_cycles: u64,
    command_tx: Sender<Command>,
    command_rx: Receiver<Command>,
    stop: Arc<AtomicBool>,
}

impl<'a> Machine<'a> {
    pub fn new(image: &'a BytecodeImage) -> Self {
        Self::with_config(image, EngineConfig::default())
    }

    pub fn with_config(image: &'a BytecodeImage, config: EngineConfig) -> Self {
        let (command_tx, command_rx) = channel();
        Self {
            image,
            config,
            state: MachineState::Ready,
            pc: 0,
            store: Store::new(),
            cache: DeferredErrorCache::new(),
            scheduler: EpochScheduler::new(config.purge_modulus),
            reclaimer: Reclaimer::new(),
            loaded_modules: BTreeSet::new(),
            idle_cycles: 0,
            command_tx,
            command_rx,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Current epoch value.
    pub fn epoch(&self) -> u64 {
        self.scheduler.epoch()
    }

    /// Whether `LOAD_MODULE` has loaded the given segment id.
    pub fn module_loaded(&self, id: u8) -> bool {
        self.loaded_modules.contains(&id)
    }

    /// Pending deferred faults, in insertion order.
    pub fn peek_errors(&self) -> &[ErrorEntry] {
        self.cache.peek()
    }

    /// Handle for submitting front-end commands.
    pub fn command_sender(&self) -> CommandSender {
        CommandSender {
            tx: self.command_tx.clone(),
        }
    }

    /// Handle for requesting a cooperative stop.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
        }
    }

    /// Read-only state snapshot for the front-end.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            registers: self.store.registers(),
            stack_depth: self.store.depth(),
            epoch: self.scheduler.epoch(),
            pending_error_count: self.cache.len(),
            pending_error_glyphs: self.cache.glyphs(),
        }
    }

    /// Executes the image until `RETURN`, end-of-stream, a stop request,
    /// or a fatal fault.
    ///
    /// Deferred faults land in the error cache and execution continues; a
    /// fatal fault transitions to `Faulted` and propagates. Terminal states
    /// are final: calling `run` again is a no-op.
    pub fn run<O: Observer>(&mut self, observer: &mut O) -> Result<(), VmError> {
        if matches!(self.state, MachineState::Halted | MachineState::Faulted) {
            return Ok(());
        }
        self.state = MachineState::Running;
        let image = self.image;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                self.state = MachineState::Halted;
                return Ok(());
            }
            self.drain_commands(observer);

            let Some(instr) = image.instructions().get(self.pc) else {
                self.state = MachineState::Halted;
                return Ok(());
            };
            let index = self.pc;
            self.pc += 1;

            let opcode = match Opcode::try_from(instr.opcode) {
                Ok(opcode) => opcode,
                Err(_) => {
                    let err = VmError::UnknownOpcode {
                        opcode: instr.opcode,
                        index,
                    };
                    error!("fatal fault: {err}");
                    self.state = MachineState::Faulted;
                    return Err(err);
                }
            };

            match self.dispatch(opcode, &instr.args, observer) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => {
                    self.state = MachineState::Halted;
                    return Ok(());
                }
                Err(Fault::Deferred(entry)) => {
                    self.cache.defer(&entry.key, &entry.glyph, entry.epoch_raised);
                }
                Err(Fault::Fatal(err)) => {
                    error!("fatal fault at instruction {index}: {err}");
                    self.state = MachineState::Faulted;
                    return Err(err);
                }
            }

            if self.scheduler.tick() {
                self.run_maintenance(observer, false);
            }

            if opcode.mutates_store() {
                self.idle_cycles = 0;
            } else {
                self.idle_cycles += 1;
                if self.config.idle_threshold != 0 && self.idle_cycles >= self.config.idle_threshold
                {
                    let report = self.reclaimer.collect(&mut self.store, false);
                    info!(
                        "idle collect: freed {} bytes in {} regions",
                        report.bytes_freed, report.regions_freed
                    );
                    self.idle_cycles = 0;
                }
            }
        }
    }

    fn dispatch<O: Observer>(
        &mut self,
        opcode: Opcode,
        args: &[u8],
        observer: &mut O,
    ) -> Result<Flow, Fault> {
        match opcode {
            Opcode::Pulse => self.op_pulse(args),
            Opcode::StackInit => self.op_stack_init(),
            Opcode::BindWrap => self.op_bind_wrap(args),
            Opcode::DeferErr => self.op_defer_err(args),
            Opcode::PurgeEpoch => self.op_purge_epoch(observer),
            Opcode::LoadModule => self.op_load_module(args),
            Opcode::TraceEmit => self.op_trace_emit(observer),
            Opcode::SetReg => self.op_set_reg(args),
            Opcode::Push => self.op_push(args),
            Opcode::Pop => self.op_pop(args),
            Opcode::PrintStack => self.op_print_stack(observer),
            Opcode::Return => Ok(Flow::Halt),
        }
    }

    /// Builds a deferred fault stamped with the current epoch.
    fn deferred(&self, key: String, glyph: &str) -> Fault {
        Fault::Deferred(ErrorEntry {
            key,
            glyph: glyph.to_string(),
            epoch_raised: self.scheduler.epoch(),
        })
    }

    fn malformed_args(&self, opcode: Opcode) -> Fault {
        self.deferred(
            format!("malformed-args:{}", opcode.mnemonic()),
            GLYPH_MALFORMED_ARGS,
        )
    }

    /// Maps a register-range error to a deferred fault; anything else
    /// stays fatal.
    fn defer_register(&self, err: VmError) -> Fault {
        match err {
            VmError::RegisterOutOfRange { index } => {
                self.deferred(format!("reg-out-of-range:r{index}"), GLYPH_REGISTER_RANGE)
            }
            other => Fault::Fatal(other),
        }
    }

    fn run_maintenance<O: Observer>(&mut self, observer: &mut O, force: bool) {
        let report = self.reclaimer.collect(&mut self.store, force);
        let purged = self.cache.purge();
        if !purged.is_empty() {
            observer.purged(&purged);
        }
        info!(
            "epoch {}: freed {} bytes in {} regions, purged {} deferred errors",
            self.scheduler.epoch(),
            report.bytes_freed,
            report.regions_freed,
            purged.len()
        );
    }

    fn op_pulse(&mut self, args: &[u8]) -> Result<Flow, Fault> {
        let Some(&reg) = args.first() else {
            return Err(self.malformed_args(Opcode::Pulse));
        };
        self.store
            .touch_register(reg)
            .map_err(|err| self.defer_register(err))?;
        Ok(Flow::Continue)
    }

    fn op_stack_init(&mut self) -> Result<Flow, Fault> {
        self.store.clear();
        Ok(Flow::Continue)
    }

    fn op_bind_wrap(&mut self, args: &[u8]) -> Result<Flow, Fault> {
        let Some(&reg) = args.first() else {
            return Err(self.malformed_args(Opcode::BindWrap));
        };
        let value = self
            .store
            .read_register(reg)
            .map_err(|err| self.defer_register(err))?;
        self.store.push_protected(&value.to_be_bytes());
        Ok(Flow::Continue)
    }

    fn op_defer_err(&mut self, args: &[u8]) -> Result<Flow, Fault> {
        let (key, glyph) = match args.iter().position(|&b| b == 0) {
            Some(split) if split + 1 < args.len() => (
                String::from_utf8_lossy(&args[..split]).into_owned(),
                String::from_utf8_lossy(&args[split + 1..]).into_owned(),
            ),
            Some(split) => (
                String::from_utf8_lossy(&args[..split]).into_owned(),
                GLYPH_DRIFT.to_string(),
            ),
            None if !args.is_empty() => (
                String::from_utf8_lossy(args).into_owned(),
                GLYPH_DRIFT.to_string(),
            ),
            None => ("execution-drift".to_string(), GLYPH_DRIFT.to_string()),
        };
        let epoch = self.scheduler.epoch();
        self.cache.defer(&key, &glyph, epoch);
        Ok(Flow::Continue)
    }

    fn op_purge_epoch<O: Observer>(&mut self, observer: &mut O) -> Result<Flow, Fault> {
        self.run_maintenance(observer, false);
        Ok(Flow::Continue)
    }

    fn op_load_module(&mut self, args: &[u8]) -> Result<Flow, Fault> {
        let [id, reg] = *args else {
            return Err(self.malformed_args(Opcode::LoadModule));
        };
        let Some(body) = self.image.segment(id) else {
            return Err(Fault::Fatal(VmError::SegmentNotFound { id }));
        };
        let length = body.len() as u16;
        // A bad register here is structural, not a transient signal fault.
        self.store
            .write_register(reg, length)
            .map_err(Fault::Fatal)?;
        self.loaded_modules.insert(id);
        Ok(Flow::Continue)
    }

    fn op_trace_emit<O: Observer>(&mut self, observer: &mut O) -> Result<Flow, Fault> {
        let snapshot = self.snapshot();
        observer.snapshot(&snapshot);
        Ok(Flow::Continue)
    }

    fn op_set_reg(&mut self, args: &[u8]) -> Result<Flow, Fault> {
        let [reg, hi, lo] = *args else {
            return Err(self.malformed_args(Opcode::SetReg));
        };
        self.store
            .write_register(reg, u16::from_be_bytes([hi, lo]))
            .map_err(|err| self.defer_register(err))?;
        Ok(Flow::Continue)
    }

    fn op_push(&mut self, args: &[u8]) -> Result<Flow, Fault> {
        self.store.push(args);
        Ok(Flow::Continue)
    }

    fn op_pop(&mut self, args: &[u8]) -> Result<Flow, Fault> {
        let n = args.first().map_or(1, |&b| b as usize);
        self.store.pop(n).map_err(Fault::Fatal)?;
        Ok(Flow::Continue)
    }

    fn op_print_stack<O: Observer>(&mut self, observer: &mut O) -> Result<Flow, Fault> {
        observer.stack_dump(self.store.stack_bytes());
        Ok(Flow::Continue)
    }

    fn drain_commands<O: Observer>(&mut self, observer: &mut O) {
        while let Ok(command) = self.command_rx.try_recv() {
            self.handle_command(command, observer);
        }
    }

    fn handle_command<O: Observer>(&mut self, command: Command, observer: &mut O) {
        match command.kind {
            CommandKind::Run => info!("RUN command ignored: machine already running"),
            CommandKind::Trace => {
                let snapshot = self.snapshot();
                observer.snapshot(&snapshot);
            }
            CommandKind::Stack => observer.stack_dump(self.store.stack_bytes()),
            CommandKind::Node => self.inspect_node(&command.payload, observer),
            CommandKind::Epoch => self.run_maintenance(observer, false),
            CommandKind::Nullify => {
                let purged = self.cache.purge();
                if !purged.is_empty() {
                    observer.purged(&purged);
                }
            }
        }
    }

    fn inspect_node<O: Observer>(&mut self, payload: &str, observer: &mut O) {
        let index = payload
            .trim()
            .trim_start_matches(['r', 'R'])
            .parse::<u8>()
            .ok()
            .filter(|&idx| (idx as usize) < REGISTER_COUNT);
        match index {
            Some(idx) => observer.node(idx, self.store.registers()[idx as usize]),
            None => {
                let epoch = self.scheduler.epoch();
                self.cache
                    .defer(&format!("node-command:{payload}"), GLYPH_BAD_NODE, epoch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::errors::DecodeError;
    use crate::engine::image::tests::container;

    fn load(body: &[u8]) -> BytecodeImage {
        BytecodeImage::load(&container(body)).expect("image decode failed")
    }

    /// Observer recording every event for assertions.
    #[derive(Default)]
    struct Recorder {
        snapshots: Vec<Snapshot>,
        stack_dumps: Vec<Vec<u8>>,
        nodes: Vec<(u8, u16)>,
        purges: Vec<Vec<ErrorEntry>>,
    }

    impl Observer for Recorder {
        fn snapshot(&mut self, snapshot: &Snapshot) {
            self.snapshots.push(snapshot.clone());
        }

        fn stack_dump(&mut self, bytes: &[u8]) {
            self.stack_dumps.push(bytes.to_vec());
        }

        fn node(&mut self, index: u8, value: u16) {
            self.nodes.push((index, value));
        }

        fn purged(&mut self, entries: &[ErrorEntry]) {
            self.purges.push(entries.to_vec());
        }
    }

    // ==================== Scenarios ====================

    #[test]
    fn minimal_image_halts_at_end_of_stream() {
        // A1 56 01 00 | 02 00 00 | FF
        let image = load(&[0x02, 0x00, 0x00]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.state(), MachineState::Halted);
        assert_eq!(machine.snapshot().stack_depth, 0);
    }

    #[test]
    fn missing_segment_faults() {
        // LOAD_MODULE segment 9 -> r1, no data segments.
        let image = load(&[0x06, 0x00, 0x02, 0x09, 0x01]);
        let mut machine = Machine::new(&image);
        let err = machine.run(&mut NullObserver).unwrap_err();
        assert!(matches!(err, VmError::SegmentNotFound { id: 0x09 }));
        assert_eq!(machine.state(), MachineState::Faulted);
    }

    #[test]
    fn out_of_range_bind_defers_instead_of_faulting() {
        // BIND_WRAP r20: register index past the bank.
        let image = load(&[0x03, 0x00, 0x01, 0x14]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.state(), MachineState::Halted);
        let errors = machine.peek_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].key, "reg-out-of-range:r20");
        assert_eq!(errors[0].glyph, GLYPH_REGISTER_RANGE);
    }

    // ==================== Opcodes ====================

    #[test]
    fn return_halts() {
        let image = load(&[0xFF, 0x00, 0x00]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.state(), MachineState::Halted);
    }

    #[test]
    fn set_reg_writes_big_endian_immediate() {
        let image = load(&[0x10, 0x00, 0x03, 0x02, 0x01, 0x05]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.snapshot().registers[2], 0x0105);
    }

    #[test]
    fn bind_wrap_pushes_protected_register_value() {
        // SET_REG r2 = 0x0105, BIND_WRAP r2, PURGE_EPOCH.
        let image = load(&[
            0x10, 0x00, 0x03, 0x02, 0x01, 0x05, // SET_REG
            0x03, 0x00, 0x01, 0x02, // BIND_WRAP
            0x05, 0x00, 0x00, // PURGE_EPOCH
        ]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        // The protected region survives the forced maintenance pass.
        assert_eq!(machine.snapshot().stack_depth, 2);
    }

    #[test]
    fn push_then_pop() {
        // PUSH 3 bytes, POP 2.
        let image = load(&[0x11, 0x00, 0x03, 0x0A, 0x0B, 0x0C, 0x12, 0x00, 0x01, 0x02]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.snapshot().stack_depth, 1);
    }

    #[test]
    fn pop_underflow_is_fatal() {
        let image = load(&[0x12, 0x00, 0x01, 0x05]);
        let mut machine = Machine::new(&image);
        let err = machine.run(&mut NullObserver).unwrap_err();
        assert!(matches!(
            err,
            VmError::StackUnderflow {
                requested: 5,
                depth: 0
            }
        ));
        assert_eq!(machine.state(), MachineState::Faulted);
    }

    #[test]
    fn stack_init_clears_pushed_bytes() {
        let image = load(&[0x11, 0x00, 0x02, 0x01, 0x02, 0x02, 0x00, 0x00]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.snapshot().stack_depth, 0);
    }

    #[test]
    fn load_module_stores_segment_length() {
        // LOAD_MODULE segment 9 -> r3, RETURN, then segment 9 (2 bytes).
        let image = load(&[
            0x06, 0x00, 0x02, 0x09, 0x03, // LOAD_MODULE
            0xFF, 0x00, 0x00, // RETURN
            0x09, 0x02, 0xDE, 0xAD, // segment 9
        ]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.snapshot().registers[3], 2);
        assert!(machine.module_loaded(0x09));
        assert!(!machine.module_loaded(0x0A));
    }

    #[test]
    fn load_module_bad_register_is_fatal() {
        let image = load(&[
            0x06, 0x00, 0x02, 0x09, 0x20, // LOAD_MODULE segment 9 -> r32
            0xFF, 0x00, 0x00, // RETURN
            0x09, 0x01, 0x00, // segment 9
        ]);
        let mut machine = Machine::new(&image);
        let err = machine.run(&mut NullObserver).unwrap_err();
        assert!(matches!(err, VmError::RegisterOutOfRange { index: 0x20 }));
        assert_eq!(machine.state(), MachineState::Faulted);
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let image = load(&[0x99, 0x00, 0x00]);
        let mut machine = Machine::new(&image);
        let err = machine.run(&mut NullObserver).unwrap_err();
        assert!(matches!(
            err,
            VmError::UnknownOpcode {
                opcode: 0x99,
                index: 0
            }
        ));
        assert_eq!(machine.state(), MachineState::Faulted);
    }

    #[test]
    fn malformed_pulse_defers_and_skips() {
        // PULSE with no args, then SET_REG still executes.
        let image = load(&[0x01, 0x00, 0x00, 0x10, 0x00, 0x03, 0x01, 0x00, 0x07]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.state(), MachineState::Halted);
        assert_eq!(machine.snapshot().registers[1], 7);
        assert_eq!(machine.peek_errors()[0].key, "malformed-args:PULSE");
    }

    #[test]
    fn trace_emit_reports_current_state() {
        // SET_REG r1 = 7, TRACE_EMIT.
        let image = load(&[0x10, 0x00, 0x03, 0x01, 0x00, 0x07, 0x07, 0x00, 0x00]);
        let mut machine = Machine::new(&image);
        let mut recorder = Recorder::default();
        machine.run(&mut recorder).unwrap();
        assert_eq!(recorder.snapshots.len(), 1);
        let snapshot = &recorder.snapshots[0];
        assert_eq!(snapshot.registers[1], 7);
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.pending_error_count, 0);
    }

    #[test]
    fn print_stack_dumps_bytes_bottom_first() {
        let image = load(&[0x11, 0x00, 0x02, 0x0A, 0x0B, 0x13, 0x00, 0x00]);
        let mut machine = Machine::new(&image);
        let mut recorder = Recorder::default();
        machine.run(&mut recorder).unwrap();
        assert_eq!(recorder.stack_dumps, vec![vec![0x0A, 0x0B]]);
    }

    // ==================== Epoch cadence ====================

    #[test]
    fn purge_fires_on_the_third_cycle_not_before() {
        // DEFER_ERR "a", PULSE r0: two cycles, no boundary yet.
        let image = load(&[0x04, 0x00, 0x01, b'a', 0x01, 0x00, 0x01, 0x00]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.epoch(), 2);
        assert_eq!(machine.peek_errors().len(), 1);

        // Same program plus one more cycle: the tick landing on epoch 3
        // purges the cache.
        let image = load(&[
            0x04, 0x00, 0x01, b'a', // DEFER_ERR
            0x01, 0x00, 0x01, 0x00, // PULSE r0
            0x01, 0x00, 0x01, 0x00, // PULSE r0
        ]);
        let mut machine = Machine::new(&image);
        let mut recorder = Recorder::default();
        machine.run(&mut recorder).unwrap();
        assert_eq!(machine.epoch(), 3);
        assert!(machine.peek_errors().is_empty());
        assert_eq!(recorder.purges.len(), 1);
        assert_eq!(recorder.purges[0][0].key, "a");
    }

    #[test]
    fn defer_err_same_key_keeps_first_glyph() {
        // Two DEFER_ERR instructions with the same key, different glyphs.
        let image = load(&[
            0x04, 0x00, 0x03, b'k', 0x00, b'1', // DEFER_ERR k -> "1"
            0x04, 0x00, 0x03, b'k', 0x00, b'2', // DEFER_ERR k -> "2"
        ]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        let errors = machine.peek_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].glyph, "1");
        assert_eq!(errors[0].epoch_raised, 1);
    }

    #[test]
    fn purge_epoch_forces_maintenance_early() {
        // DEFER_ERR then PURGE_EPOCH on cycle two.
        let image = load(&[0x04, 0x00, 0x01, b'a', 0x05, 0x00, 0x00]);
        let mut machine = Machine::new(&image);
        let mut recorder = Recorder::default();
        machine.run(&mut recorder).unwrap();
        assert!(machine.peek_errors().is_empty());
        assert_eq!(recorder.purges.len(), 1);
    }

    #[test]
    fn idle_trigger_collects_unreferenced_regions() {
        let config = EngineConfig {
            purge_modulus: 0,
            idle_threshold: 2,
        };
        // PUSH one region, then two idle PULSE cycles.
        let image = load(&[
            0x11, 0x00, 0x01, 0x42, // PUSH
            0x01, 0x00, 0x01, 0x00, // PULSE r0
            0x01, 0x00, 0x01, 0x00, // PULSE r0
        ]);
        let mut machine = Machine::with_config(&image, config);
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.snapshot().stack_depth, 0);
    }

    // ==================== Commands and cancellation ====================

    #[test]
    fn command_kind_parse() {
        assert_eq!(CommandKind::parse("nullify"), Some(CommandKind::Nullify));
        assert_eq!(CommandKind::parse(" EPOCH "), Some(CommandKind::Epoch));
        assert_eq!(CommandKind::parse("bogus"), None);
    }

    #[test]
    fn queued_commands_drain_before_the_first_cycle() {
        let image = load(&[0x02, 0x00, 0x00]);
        let mut machine = Machine::new(&image);
        let sender = machine.command_sender();
        assert!(sender.submit(CommandKind::Trace, ""));
        assert!(sender.submit(CommandKind::Node, "r2"));
        let mut recorder = Recorder::default();
        machine.run(&mut recorder).unwrap();
        assert_eq!(recorder.snapshots.len(), 1);
        assert_eq!(recorder.snapshots[0].epoch, 0);
        assert_eq!(recorder.nodes, vec![(2, 0)]);
    }

    #[test]
    fn bad_node_payload_defers() {
        let image = load(&[0x02, 0x00, 0x00]);
        let mut machine = Machine::new(&image);
        machine.command_sender().submit(CommandKind::Node, "r99");
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.peek_errors()[0].key, "node-command:r99");
        assert_eq!(machine.peek_errors()[0].glyph, GLYPH_BAD_NODE);
    }

    #[test]
    fn stop_request_halts_without_maintenance() {
        let image = load(&[0x04, 0x00, 0x01, b'a', 0x01, 0x00, 0x01, 0x00]);
        let mut machine = Machine::new(&image);
        machine.stop_handle().stop();
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.state(), MachineState::Halted);
        // Nothing executed, nothing ticked, nothing purged.
        assert_eq!(machine.epoch(), 0);
        assert!(machine.peek_errors().is_empty());
    }

    #[test]
    fn run_after_halt_is_a_no_op() {
        let image = load(&[0x11, 0x00, 0x01, 0x01]);
        let mut machine = Machine::new(&image);
        machine.run(&mut NullObserver).unwrap();
        let depth = machine.snapshot().stack_depth;
        machine.run(&mut NullObserver).unwrap();
        assert_eq!(machine.snapshot().stack_depth, depth);
        assert_eq!(machine.state(), MachineState::Halted);
    }

    #[test]
    fn image_decode_errors_reach_the_caller_unchanged() {
        let err = BytecodeImage::load(b"nope").unwrap_err();
        assert!(matches!(VmError::from(err), VmError::Decode(DecodeError::BadHeader)));
    }
}
