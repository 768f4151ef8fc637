use std::sync::Arc;

use kiln_mem::{page, AddressSpace, PageFlags, Tlb, PAGE_SIZE};

use super::*;
use crate::gadget::{AluOp, ShiftOp, UnaryOp};

fn tlb_with_code(addr: u32, code: &[u8]) -> Tlb {
    let space = Arc::new(AddressSpace::new());
    space.map(page(addr), 2, PageFlags::RX).unwrap();
    space.write_bytes(addr, code).unwrap();
    Tlb::new(space)
}

fn translate(addr: u32, code: &[u8]) -> Block {
    let mut tlb = tlb_with_code(addr, code);
    translate_block(addr, &mut tlb)
}

#[test]
fn short_jump_uses_slot_zero() {
    // nop; nop; jmp short +0x10
    let block = translate(0x1000, &[0x90, 0x90, 0xeb, 0x10]);
    assert_eq!(block.start(), 0x1000);
    assert_eq!(block.end(), 0x1003);
    assert_eq!(block.jump_target(0), Some(0x1014));
    assert_eq!(block.jump_target(1), None);
    assert_eq!(block.gadgets().last(), Some(&Gadget::Jmp { slot: 0 }));
}

#[test]
fn word_sized_jump_truncates_target() {
    // jmp rel16 from 0x1004 to 0x2000.
    let block = translate(0x1000, &[0x66, 0xe9, 0xfc, 0x0f]);
    assert_eq!(block.end(), 0x1003);
    assert_eq!(block.jump_target(0), Some(0x2000));
}

#[test]
fn conditional_jump_fills_both_slots() {
    // cmp eax, 1; jne -6
    let block = translate(0x4000, &[0x83, 0xf8, 0x01, 0x75, 0xfa]);
    assert_eq!(block.jump_target(0), Some(0x4005 - 6));
    assert_eq!(block.jump_target(1), Some(0x4005));
    assert!(matches!(
        block.gadgets(),
        [
            Gadget::Insn { ip: 0x4000 },
            Gadget::Alu {
                op: AluOp::Cmp,
                dst: Loc::Reg(Reg::Eax),
                src: Operand::Imm(1),
                size: Size::Dword
            },
            Gadget::Insn { ip: 0x4003 },
            Gadget::Jcc { cond: Cond::Ne },
        ]
    ));
}

#[test]
fn call_records_return_address() {
    let block = translate(0x1000, &[0xe8, 0xfb, 0x0f, 0x00, 0x00]);
    assert_eq!(block.jump_target(0), Some(0x2000));
    assert_eq!(
        block.gadgets().last(),
        Some(&Gadget::Call {
            ret: 0x1005,
            size: Size::Dword
        })
    );
}

#[test]
fn memory_operand_emits_address_first() {
    // add dword [ebx+8], 5
    let block = translate(0x1000, &[0x83, 0x43, 0x08, 0x05, 0xc3]);
    assert!(matches!(
        block.gadgets(),
        [
            Gadget::Insn { .. },
            Gadget::Lea(EffAddr {
                base: Some(Reg::Ebx),
                disp: 8,
                ..
            }),
            Gadget::Alu {
                op: AluOp::Add,
                dst: Loc::Mem,
                src: Operand::Imm(5),
                ..
            },
            Gadget::Insn { .. },
            Gadget::Ret { pop: 0, .. },
        ]
    ));
}

#[test]
fn byte_registers_map_to_high_halves() {
    // mov ah, bl
    let block = translate(0x1000, &[0x88, 0xdc, 0xc3]);
    assert!(block.gadgets().contains(&Gadget::Mov {
        dst: Loc::RegHigh(Reg::Eax),
        src: Operand::Loc(Loc::Reg(Reg::Ebx)),
        size: Size::Byte,
    }));
}

#[test]
fn shifts_and_unary_ops() {
    // shl ecx, 3; neg edx; ret
    let block = translate(0x1000, &[0xc1, 0xe1, 0x03, 0xf7, 0xda, 0xc3]);
    assert!(block.gadgets().contains(&Gadget::Shift {
        op: ShiftOp::Shl,
        dst: Loc::Reg(Reg::Ecx),
        count: Operand::Imm(3),
        size: Size::Dword,
    }));
    assert!(block.gadgets().contains(&Gadget::Unary {
        op: UnaryOp::Neg,
        dst: Loc::Reg(Reg::Edx),
        size: Size::Dword,
    }));
}

#[test]
fn undefined_instruction_raises_at_its_start() {
    // nop; ud2
    let block = translate(0x1000, &[0x90, 0x0f, 0x0b]);
    assert_eq!(
        block.gadgets().last(),
        Some(&Gadget::Interrupt {
            int: Interrupt::Undefined,
            ip: 0x1001
        })
    );
    assert!(!block.has_jump_slots());
}

#[test]
fn int_resumes_after_instruction() {
    let block = translate(0x1000, &[0xcd, 0x80]);
    assert_eq!(
        block.gadgets().last(),
        Some(&Gadget::Interrupt {
            int: Interrupt::Syscall,
            ip: 0x1002
        })
    );
}

#[test]
fn hlt_is_privileged() {
    let block = translate(0x1000, &[0xf4]);
    assert_eq!(
        block.gadgets().last(),
        Some(&Gadget::Interrupt {
            int: Interrupt::Gpf,
            ip: 0x1000
        })
    );
}

#[test]
fn overlong_instruction_is_undefined() {
    let mut code = vec![0x66; 15];
    code.push(0x90);
    let block = translate(0x1000, &code);
    assert_eq!(
        block.gadgets(),
        &[
            Gadget::Insn { ip: 0x1000 },
            Gadget::Interrupt {
                int: Interrupt::Undefined,
                ip: 0x1000
            }
        ]
    );
}

#[test]
fn fetch_fault_reports_instruction_start() {
    let space = Arc::new(AddressSpace::new());
    space.map(0x1, 1, PageFlags::RX).unwrap();
    // nop; mov eax, imm32 whose immediate straddles into the unmapped page.
    space.write_bytes(0x1ffd, &[0x90, 0xb8, 0x11]).unwrap();
    let mut tlb = Tlb::new(space);
    let block = translate_block(0x1ffd, &mut tlb);
    assert_eq!(
        block.gadgets().last(),
        Some(&Gadget::Segfault {
            ip: 0x1ffe,
            addr: 0x2000
        })
    );
    // The unreadable byte is covered so the block is filed under the page that faulted.
    assert_eq!(block.end(), 0x2000);
    assert_eq!(block.pages(), (1, 2));
}

#[test]
fn block_may_wrap_into_page_zero() {
    let space = Arc::new(AddressSpace::new());
    space.map(0xfffff, 1, PageFlags::RX).unwrap();
    space.map(0x0, 1, PageFlags::RX).unwrap();
    let mut tlb = Tlb::new(space);
    // Zero bytes decode as `add [eax], al`, which never ends a block.
    let block = translate_block(0xffff_fff0, &mut tlb);
    assert_eq!(block.pages(), (0xfffff, 0));
    assert!(block.end() < PAGE_SIZE);
}

#[test]
fn fault_on_first_byte_has_zero_extent() {
    let space = Arc::new(AddressSpace::new());
    let mut tlb = Tlb::new(space);
    let block = translate_block(0x5000, &mut tlb);
    assert_eq!(block.start(), 0x5000);
    assert_eq!(block.end(), 0x5000);
    assert_eq!(block.pages(), (5, 5));
}

#[test]
fn straight_line_code_stops_at_size_limit() {
    let code = vec![0x90; 2 * PAGE_SIZE as usize];
    let block = translate(0x1000, &code);
    assert_eq!(block.end() - block.start() + 1, BLOCK_BYTE_LIMIT);
    assert_eq!(
        block.gadgets().last(),
        Some(&Gadget::Exit {
            ip: 0x1000 + BLOCK_BYTE_LIMIT
        })
    );
    assert_eq!(block.pages(), (1, 1));
}

#[test]
fn translate_one_stops_after_first_instruction() {
    let mut tlb = tlb_with_code(0x1000, &[0x40, 0x40, 0xc3]);
    let block = translate_one(0x1000, &mut tlb);
    assert_eq!(
        block.gadgets(),
        &[
            Gadget::Insn { ip: 0x1000 },
            Gadget::Unary {
                op: UnaryOp::Inc,
                dst: Loc::Reg(Reg::Eax),
                size: Size::Dword
            },
            Gadget::Exit { ip: 0x1001 },
        ]
    );
    assert_eq!(block.end(), 0x1000);
}

#[test]
fn translation_is_deterministic() {
    let code = [0x8b, 0x44, 0x24, 0x04, 0x03, 0x44, 0x24, 0x08, 0xc3];
    assert_eq!(translate(0x3000, &code), translate(0x3000, &code));
}
