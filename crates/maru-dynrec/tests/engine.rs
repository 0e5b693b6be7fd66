//! End-to-end equivalence tests: the same guest program run through the
//! translation engine and through the plain interpreter must land in the
//! same architectural state.

use maru_cpu_core::interp::{self, InstTable};
use maru_cpu_core::state::{CR0_PE, EAX, EBX, ECX, EDI, ESP};
use maru_cpu_core::{interrupts, CpuExit, CpuState, FlatTestBus};
use maru_dynrec::{CoreExit, DynrecConfig, DynrecCore};

const RAM: usize = 0x1_0000;
const ENTRY: u32 = 0x100;
const STACK: u32 = 0xE000;

fn fresh(code: &[u8]) -> (CpuState, FlatTestBus) {
    let mut bus = FlatTestBus::new(RAM);
    bus.load(ENTRY, code);
    // Point every IVT entry at a hlt so stray faults stop the run instead
    // of spinning.
    bus.load(0xF000, &[0xF4]);
    for v in 0..32u32 {
        bus.load(v * 4, &[0x00, 0xF0, 0x00, 0x00]);
    }
    let mut cpu = CpuState::reset();
    cpu.eip = ENTRY;
    cpu.gpr[ESP] = STACK;
    (cpu, bus)
}

/// Run to halt through the translation engine.
fn run_dynrec(code: &[u8], config: DynrecConfig, budget_per_slice: i64) -> (CpuState, FlatTestBus) {
    let (mut cpu, mut bus) = fresh(code);
    let table = InstTable::new();
    let mut core = DynrecCore::new(config, bus.tracker());
    for _ in 0..10_000 {
        if cpu.halted {
            break;
        }
        match core.run(&mut cpu, &mut bus, &table, budget_per_slice) {
            CoreExit::BudgetExhausted { .. } => {}
            CoreExit::Callback(_) => {}
            CoreExit::Cpu(x) => panic!("unexpected core exit: {x:?}"),
        }
    }
    assert!(cpu.halted, "program did not reach hlt");
    (cpu, bus)
}

/// Run to halt one instruction at a time through the interpreter.
fn run_interp(code: &[u8]) -> (CpuState, FlatTestBus) {
    let (mut cpu, mut bus) = fresh(code);
    let table = InstTable::new();
    let mut cycles = i64::MAX;
    for _ in 0..1_000_000 {
        if cpu.halted {
            break;
        }
        if let Err(e) = interp::step(&mut cpu, &mut bus, &table, &mut cycles) {
            interrupts::deliver_exception(&mut cpu, &mut bus, e).expect("real-mode delivery");
        }
    }
    assert!(cpu.halted, "program did not reach hlt");
    (cpu, bus)
}

fn assert_same_outcome(code: &[u8]) {
    let (dyn_cpu, dyn_bus) = run_dynrec(code, DynrecConfig::default(), 1000);
    let (int_cpu, int_bus) = run_interp(code);
    // tsc advances only under the budgeted run loop; everything else must
    // agree exactly.
    let mut dyn_cpu = dyn_cpu;
    dyn_cpu.tsc = int_cpu.tsc;
    assert_eq!(dyn_cpu, int_cpu);
    assert_eq!(dyn_bus.mem(), int_bus.mem());
}

#[test]
fn arithmetic_and_flags_match_the_interpreter() {
    // Mixed-width ALU traffic with flag-dependent branches.
    assert_same_outcome(&[
        0xB8, 0x34, 0x12, // mov ax, 0x1234
        0xBB, 0xFF, 0x00, // mov bx, 0x00FF
        0x01, 0xD8, // add ax, bx
        0x83, 0xE8, 0x05, // sub ax, 5
        0x66, 0x05, 0x01, 0x00, 0x01, 0x00, // add eax, 0x10001
        0x31, 0xDB, // xor bx, bx
        0x75, 0x01, // jnz +1 (not taken)
        0x43, // inc bx
        0xF4, // hlt
    ]);
}

#[test]
fn loops_and_memory_traffic_match_the_interpreter() {
    // Sum bytes 0..16 of a table into AX.
    assert_same_outcome(&[
        0xBE, 0x00, 0x02, // mov si, 0x200
        0xB9, 0x10, 0x00, // mov cx, 16
        0x31, 0xC0, // xor ax, ax
        0x02, 0x04, // add al, [si]       (loop body)
        0x46, // inc si
        0x49, // dec cx
        0x75, 0xFA, // jnz body
        0xF4, // hlt
    ]);
}

#[test]
fn calls_returns_and_stack_match_the_interpreter() {
    assert_same_outcome(&[
        0xB8, 0x05, 0x00, // mov ax, 5
        0xE8, 0x02, 0x00, // call sub
        0xF4, // hlt
        0x90, // (pad)
        0x40, // sub: inc ax
        0x40, // inc ax
        0xC3, // ret
    ]);
}

#[test]
fn string_rep_operations_match_the_interpreter() {
    assert_same_outcome(&[
        0xBF, 0x00, 0x30, // mov di, 0x3000
        0xB9, 0x80, 0x00, // mov cx, 128
        0xB0, 0xAB, // mov al, 0xAB
        0xF3, 0xAA, // rep stosb
        0xBE, 0x00, 0x30, // mov si, 0x3000
        0xBF, 0x00, 0x31, // mov di, 0x3100
        0xB9, 0x80, 0x00, // mov cx, 128
        0xF3, 0xA4, // rep movsb
        0xF4, // hlt
    ]);
}

#[test]
fn faulting_programs_match_the_interpreter() {
    // div by zero vectors through the IVT to the hlt stub.
    assert_same_outcome(&[
        0x31, 0xD2, // xor dx, dx
        0x31, 0xC9, // xor cx, cx
        0xB8, 0x40, 0x00, // mov ax, 64
        0xF7, 0xF1, // div cx -> #DE
        0x40, // never reached
        0xF4,
    ]);
}

#[test]
fn undefined_opcode_faults_identically_under_both_paths() {
    assert_same_outcome(&[
        0x40, // inc ax
        0xF1, // undefined
        0x40, // never reached
        0xF4,
    ]);
}

#[test]
fn privileged_fault_at_cpl3_surfaces_under_both_paths() {
    // In protected mode at CPL 3, lgdt raises #GP; with no IDT walk in the
    // core the exception surfaces to the embedder identically whether the
    // instruction was translated or interpreted.
    let code = [0x0F, 0x01, 0x16, 0x00, 0x02]; // lgdt [0x200]
    let table = InstTable::new();

    let (mut cpu, mut bus) = fresh(&code);
    cpu.cr0 |= CR0_PE;
    cpu.cpl = 3;
    let mut core = DynrecCore::new(DynrecConfig::default(), bus.tracker());
    let exit = core.run(&mut cpu, &mut bus, &table, 100);
    assert_eq!(
        exit,
        CoreExit::Cpu(CpuExit::UnhandledException { vector: 13 })
    );
    assert_eq!(cpu.eip, ENTRY, "fault rewound to the instruction start");

    let (mut cpu, mut bus) = fresh(&code);
    cpu.cr0 |= CR0_PE;
    cpu.cpl = 3;
    let mut cycles = 100i64;
    let e = interp::step(&mut cpu, &mut bus, &table, &mut cycles).unwrap_err();
    let surfaced = interrupts::deliver_exception(&mut cpu, &mut bus, e).unwrap_err();
    assert_eq!(surfaced, CpuExit::UnhandledException { vector: 13 });
    assert_eq!(cpu.eip, ENTRY);
}

#[test]
fn self_modifying_rep_store_over_its_own_page_is_coherent() {
    // rep stosb sweeps across its own code page, overwriting the bytes
    // just after the hlt. The engine must not keep executing a stale
    // translation of anything on that page afterwards.
    let code = [
        0xBF, 0x20, 0x01, // mov di, 0x120
        0xB9, 0x10, 0x00, // mov cx, 16
        0xB0, 0xF4, // mov al, 0xF4 (hlt bytes)
        0xF3, 0xAA, // rep stosb
        0xE9, 0x13, 0x00, // jmp 0x120 (freshly written hlt)
        0xF4,
    ];
    let (dyn_cpu, dyn_bus) = run_dynrec(&code, DynrecConfig::default(), 1000);
    let (int_cpu, int_bus) = run_interp(&code);
    let mut dyn_cpu = dyn_cpu;
    dyn_cpu.tsc = int_cpu.tsc;
    assert_eq!(dyn_cpu, int_cpu);
    assert_eq!(dyn_bus.mem(), int_bus.mem());
    assert_eq!(dyn_cpu.gpr[EDI] & 0xFFFF, 0x130);
}

#[test]
fn cycle_accounting_charges_one_per_instruction() {
    let code = [0x40, 0x40, 0x40, 0x40, 0xF4]; // 4 incs + hlt
    let (mut cpu, mut bus) = fresh(&code);
    let table = InstTable::new();
    let mut core = DynrecCore::new(DynrecConfig::default(), bus.tracker());
    let exit = core.run(&mut cpu, &mut bus, &table, 100);
    assert_eq!(exit, CoreExit::BudgetExhausted { remaining: 95 });
    assert_eq!(cpu.tsc, 5);
}

#[test]
fn disabling_block_links_changes_nothing_architectural() {
    let code = [
        0xB9, 0x20, 0x00, // mov cx, 32
        0x01, 0xC8, // add ax, cx     (body)
        0x49, // dec cx
        0x75, 0xFB, // jnz body
        0xF4,
    ];
    let linked = run_dynrec(&code, DynrecConfig::default(), 1000);
    let unlinked = run_dynrec(
        &code,
        DynrecConfig {
            link_blocks: false,
            ..DynrecConfig::default()
        },
        1000,
    );
    let mut a = linked.0;
    let b = unlinked.0;
    a.tsc = b.tsc;
    assert_eq!(a, b);
    assert_eq!(a.gpr[EAX] & 0xFFFF, (1..=32u32).sum::<u32>() & 0xFFFF);
    assert_eq!(a.gpr[EBX], b.gpr[EBX]);
    assert_eq!(a.gpr[ECX], 0);
}

#[test]
fn tiny_slices_still_complete_long_programs() {
    // Budget of 3 forces constant suspend/resume through every path:
    // mid-block, mid-rep, at links.
    let code = [
        0xBF, 0x00, 0x40, // mov di, 0x4000
        0xB9, 0x40, 0x00, // mov cx, 64
        0xB0, 0x55, // mov al, 0x55
        0xF3, 0xAA, // rep stosb
        0xB9, 0x08, 0x00, // mov cx, 8
        0x01, 0xC8, // add ax, cx
        0x49, // dec cx
        0x75, 0xFB, // jnz -5
        0xF4,
    ];
    let (tiny_cpu, tiny_bus) = run_dynrec(&code, DynrecConfig::default(), 3);
    let (big_cpu, big_bus) = run_dynrec(&code, DynrecConfig::default(), 100_000);
    let mut tiny_cpu = tiny_cpu;
    tiny_cpu.tsc = big_cpu.tsc;
    assert_eq!(tiny_cpu, big_cpu);
    assert_eq!(tiny_bus.mem(), big_bus.mem());
}
